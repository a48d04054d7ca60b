// src/io/traits.rs
//
// Byte-link abstraction used by the transport poll workers.
// Real connections are serialport handles; tests plug in scripted ports.

use std::io::{Read, Write};

use serialport::SerialPort as _;

/// Modem status lines sampled by the reader worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlLines {
    /// Clear To Send, wired to sensor 1
    pub cts: bool,
    /// Data Set Ready, wired to sensor 2
    pub dsr: bool,
}

/// A full-duplex byte link with readable modem status lines.
pub trait LinkPort: Read + Write + Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> std::io::Result<u32>;

    /// Current CTS/DSR levels.
    fn control_lines(&mut self) -> std::io::Result<ControlLines>;

    /// Discard anything buffered by the OS in either direction.
    fn clear_buffers(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl LinkPort for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> std::io::Result<u32> {
        Ok((**self).bytes_to_read()?)
    }

    fn control_lines(&mut self) -> std::io::Result<ControlLines> {
        let port = &mut **self;
        Ok(ControlLines {
            cts: port.read_clear_to_send()?,
            dsr: port.read_data_set_ready()?,
        })
    }

    fn clear_buffers(&mut self) -> std::io::Result<()> {
        Ok((**self).clear(serialport::ClearBuffer::All)?)
    }
}

/// In-memory link for exercising the transport without hardware.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct MockState {
        pub inbound: VecDeque<u8>,
        pub written: Vec<u8>,
        pub lines: ControlLines,
        pub fail_reads: bool,
    }

    /// Cloneable handle; every clone shares the same state.
    #[derive(Clone, Default)]
    pub struct MockPort {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_inbound(&self, bytes: &[u8]) {
            self.state.lock().unwrap().inbound.extend(bytes.iter().copied());
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn set_lines(&self, cts: bool, dsr: bool) {
            self.state.lock().unwrap().lines = ControlLines { cts, dsr };
        }

        pub fn fail_reads(&self) {
            self.state.lock().unwrap().fail_reads = true;
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device disconnected",
                ));
            }
            let n = buf.len().min(state.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.inbound.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.state.lock().unwrap().written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LinkPort for MockPort {
        fn bytes_to_read(&mut self) -> std::io::Result<u32> {
            let state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device disconnected",
                ));
            }
            Ok(state.inbound.len() as u32)
        }

        fn control_lines(&mut self) -> std::io::Result<ControlLines> {
            Ok(self.state.lock().unwrap().lines)
        }
    }
}
