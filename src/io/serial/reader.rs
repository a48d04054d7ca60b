// src/io/serial/reader.rs
//
// Serial transport for the reader and the optional sensor port.
// Each open connection gets one poll worker thread that forwards bytes and
// control-line edges to the receive pipeline over a bounded channel.
// Writes go straight to the shared port handle from the calling thread.

use chrono::Local;
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use super::utils::{line_label, open_serial_port, settle};
use crate::inventory::SensorId;
use crate::io::traits::LinkPort;
use crate::io::types::{LinkRole, TransportEvent};
use crate::settings::{AppSettings, SerialSettings};

// ============================================================================
// Types and Configuration
// ============================================================================

pub type SharedPort = Arc<Mutex<Box<dyn LinkPort>>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot open {0}. Is the device connected?")]
    PortNotFound(String),

    #[error("Permission denied for {0}. Check that your user can access serial devices.")]
    PermissionDenied(String),

    #[error("Failed to open {port}: {message}")]
    Open { port: String, message: String },

    #[error("Failed to configure {port}: {message}")]
    Configure { port: String, message: String },

    #[error("The {0} port is not connected")]
    NotConnected(LinkRole),

    #[error("I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// Classify a serialport open failure into a user-facing error.
    pub fn from_open_error(port: &str, err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                TransportError::PortNotFound(port.to_string())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(port.to_string())
            }
            _ => TransportError::Open {
                port: port.to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Transport configuration, fixed at construction.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub reader: SerialSettings,
    pub sensor: SerialSettings,
    pub poll_interval: Duration,
    pub settle: Duration,
}

impl From<&AppSettings> for TransportConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            reader: settings.reader.clone(),
            sensor: settings.sensor_serial(),
            poll_interval: settings.poll_interval(),
            settle: settings.settle(),
        }
    }
}

struct Connection {
    name: String,
    port: SharedPort,
    cancel_flag: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.cancel_flag.load(Ordering::Relaxed)
            && self
                .task_handle
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }
}

// ============================================================================
// Edge and Text Decoding
// ============================================================================

/// Reports false-to-true transitions of a sampled level.
/// Lines start out low, so a line already high at connect fires once.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    last: bool,
}

impl EdgeDetector {
    pub fn update(&mut self, level: bool) -> bool {
        let rising = !self.last && level;
        self.last = level;
        rising
    }
}

/// Decodes `#1` / `#2` activation tokens from the sensor port's text stream.
#[derive(Debug, Default)]
pub struct SensorTextDecoder {
    after_hash: bool,
}

impl SensorTextDecoder {
    pub fn feed(&mut self, data: &[u8]) -> Vec<SensorId> {
        let mut activations = Vec::new();
        for &byte in data {
            if self.after_hash {
                match byte {
                    b'1' => activations.push(SensorId::One),
                    b'2' => activations.push(SensorId::Two),
                    _ => {}
                }
            }
            self.after_hash = byte == b'#';
        }
        activations
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Owns at most one reader connection and one sensor connection.
pub struct Transport {
    config: TransportConfig,
    events: std_mpsc::SyncSender<TransportEvent>,
    reader: Mutex<Option<Connection>>,
    sensor: Mutex<Option<Connection>>,
}

impl Transport {
    pub fn new(config: TransportConfig, events: std_mpsc::SyncSender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            reader: Mutex::new(None),
            sensor: Mutex::new(None),
        }
    }

    fn slot(&self, role: LinkRole) -> &Mutex<Option<Connection>> {
        match role {
            LinkRole::Reader => &self.reader,
            LinkRole::Sensor => &self.sensor,
        }
    }

    fn serial_settings(&self, role: LinkRole) -> &SerialSettings {
        match role {
            LinkRole::Reader => &self.config.reader,
            LinkRole::Sensor => &self.config.sensor,
        }
    }

    /// Open a serial port for `role` and start polling it.
    /// An existing connection for the same role is closed first.
    pub fn connect(&self, role: LinkRole, port_name: &str) -> Result<(), TransportError> {
        self.disconnect(role);

        let settings = self.serial_settings(role);
        let mut handle = open_serial_port(port_name, settings)?;

        settle(self.config.settle);
        handle.clear_buffers().map_err(|source| TransportError::Io {
            port: port_name.to_string(),
            source,
        })?;

        tlog!(
            "[Transport:{}] Opened {} port at {} baud ({})",
            port_name,
            role,
            settings.baud_rate,
            line_label(settings)
        );

        self.attach(role, port_name, Box::new(handle));
        Ok(())
    }

    /// Start polling an already-open link.
    pub fn attach(&self, role: LinkRole, name: &str, port: Box<dyn LinkPort>) {
        self.disconnect(role);

        let port: SharedPort = Arc::new(Mutex::new(port));
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let task_handle = spawn_poll_worker(
            role,
            name.to_string(),
            port.clone(),
            cancel_flag.clone(),
            self.events.clone(),
            self.config.poll_interval,
        );

        let connection = Connection {
            name: name.to_string(),
            port,
            cancel_flag,
            task_handle,
        };

        match self.slot(role).lock() {
            Ok(mut slot) => *slot = Some(connection),
            Err(poisoned) => *poisoned.into_inner() = Some(connection),
        }
    }

    /// Stop the worker for `role` and release the port. Returns false if nothing was open.
    pub fn disconnect(&self, role: LinkRole) -> bool {
        let connection = match self.slot(role).lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(mut connection) = connection else {
            return false;
        };

        connection.cancel_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = connection.task_handle.take() {
            if handle.join().is_err() {
                tlog!("[Transport:{}] Poll worker panicked", connection.name);
            }
        }
        tlog!("[Transport:{}] Closed {} port", connection.name, role);
        true
    }

    pub fn disconnect_all(&self) {
        self.disconnect(LinkRole::Reader);
        self.disconnect(LinkRole::Sensor);
    }

    pub fn is_connected(&self, role: LinkRole) -> bool {
        match self.slot(role).lock() {
            Ok(slot) => slot.as_ref().map(Connection::is_alive).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn port_name(&self, role: LinkRole) -> Option<String> {
        self.slot(role)
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.name.clone()))
    }

    /// Write `data` to the reader. Returns whether the whole buffer was written.
    pub fn send(&self, data: &[u8]) -> bool {
        let (name, port) = match self.reader.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(c) if c.is_alive() => (c.name.clone(), c.port.clone()),
                _ => return false,
            },
            Err(_) => return false,
        };

        let result = match port.lock() {
            Ok(mut guard) => guard.write_all(data).and_then(|_| guard.flush()),
            Err(e) => {
                tlog!("[Transport:{}] Port mutex poisoned in send: {}", name, e);
                return false;
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tlog!("[Transport:{}] Serial write error: {}", name, e);
                false
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

// ============================================================================
// Poll Worker
// ============================================================================

fn spawn_poll_worker(
    role: LinkRole,
    name: String,
    port: SharedPort,
    cancel_flag: Arc<AtomicBool>,
    events: std_mpsc::SyncSender<TransportEvent>,
    poll_interval: Duration,
) -> Option<JoinHandle<()>> {
    let thread_name = format!("{}-poll", role);
    let log_name = name.clone();
    match std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_poll_worker(role, name, port, cancel_flag, events, poll_interval))
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            tlog!("[Transport:{}] Failed to spawn poll worker: {}", log_name, e);
            None
        }
    }
}

/// What one poll cycle observed.
struct PollResult {
    bytes: Vec<u8>,
    lines: Option<crate::io::traits::ControlLines>,
}

fn poll_once(port: &mut dyn LinkPort, role: LinkRole, buf: &mut [u8]) -> std::io::Result<PollResult> {
    let available = port.bytes_to_read()? as usize;
    let mut bytes = Vec::new();
    if available > 0 {
        let want = available.min(buf.len());
        let n = port.read(&mut buf[..want])?;
        bytes.extend_from_slice(&buf[..n]);
    }

    // Some adapters cannot report modem lines; treat that as "no edges"
    let lines = match role {
        LinkRole::Reader => port.control_lines().ok(),
        LinkRole::Sensor => None,
    };

    Ok(PollResult { bytes, lines })
}

fn run_poll_worker(
    role: LinkRole,
    name: String,
    port: SharedPort,
    cancel_flag: Arc<AtomicBool>,
    events: std_mpsc::SyncSender<TransportEvent>,
    poll_interval: Duration,
) {
    if events.send(TransportEvent::Connected(role, name.clone())).is_err() {
        return;
    }

    let mut buf = [0u8; 1024];
    let mut cts_edge = EdgeDetector::default();
    let mut dsr_edge = EdgeDetector::default();
    let mut text_decoder = SensorTextDecoder::default();
    let stream_reason;

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            stream_reason = "stopped".to_string();
            break;
        }

        let polled = match port.lock() {
            Ok(mut guard) => poll_once(&mut **guard, role, &mut buf),
            Err(e) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("port mutex poisoned: {}", e),
            )),
        };

        let mut outgoing = Vec::new();
        match polled {
            Ok(result) => {
                let now = Local::now();
                if let Some(lines) = result.lines {
                    if cts_edge.update(lines.cts) {
                        outgoing.push(TransportEvent::SensorEdge(SensorId::One, now));
                    }
                    if dsr_edge.update(lines.dsr) {
                        outgoing.push(TransportEvent::SensorEdge(SensorId::Two, now));
                    }
                }
                if !result.bytes.is_empty() {
                    match role {
                        LinkRole::Reader => outgoing.push(TransportEvent::Bytes(result.bytes)),
                        LinkRole::Sensor => {
                            for sensor in text_decoder.feed(&result.bytes) {
                                outgoing.push(TransportEvent::SensorText(sensor, now));
                            }
                        }
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is normal, nothing arrived this cycle
            }
            Err(e) => {
                tlog!("[Transport:{}] Read error: {}", name, e);
                stream_reason = format!("disconnected: {}", e);
                break;
            }
        }

        let mut receiver_gone = false;
        for event in outgoing {
            if events.send(event).is_err() {
                receiver_gone = true;
                break;
            }
        }
        if receiver_gone {
            stream_reason = "stopped".to_string();
            break;
        }

        std::thread::sleep(poll_interval);
    }

    tlog!("[Transport:{}] Poll worker ended ({})", name, stream_reason);
    let _ = events.send(TransportEvent::Ended(role, stream_reason));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::traits::mock::MockPort;
    use std::time::Instant;

    fn test_transport() -> (Transport, std_mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = std_mpsc::sync_channel(256);
        let config = TransportConfig {
            reader: SerialSettings::default(),
            sensor: SerialSettings::default(),
            poll_interval: Duration::from_millis(1),
            settle: Duration::ZERO,
        };
        (Transport::new(config, tx), rx)
    }

    /// Collect events until `done` returns true or two seconds pass.
    fn collect_until(
        rx: &std_mpsc::Receiver<TransportEvent>,
        mut done: impl FnMut(&[TransportEvent]) -> bool,
    ) -> Vec<TransportEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while Instant::now() < deadline && !done(&seen) {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(20)) {
                seen.push(event);
            }
        }
        seen
    }

    #[test]
    fn test_config_sensor_falls_back_to_reader() {
        let mut settings = AppSettings::default();
        settings.reader.baud_rate = 57600;
        let config = TransportConfig::from(&settings);
        assert_eq!(config.reader.baud_rate, 57600);
        assert_eq!(config.sensor.baud_rate, 57600);
    }

    #[test]
    fn test_edge_detector() {
        let mut edge = EdgeDetector::default();
        assert!(edge.update(true));
        assert!(!edge.update(true));
        assert!(!edge.update(false));
        assert!(edge.update(true));
        assert!(!edge.update(true));
        assert!(!edge.update(false));
        assert!(edge.update(true));
    }

    #[test]
    fn test_sensor_text_decoder() {
        let mut decoder = SensorTextDecoder::default();
        assert_eq!(decoder.feed(b"#1\r\n"), vec![SensorId::One]);
        assert_eq!(decoder.feed(b"noise #"), Vec::<SensorId>::new());
        assert_eq!(decoder.feed(b"2"), vec![SensorId::Two]);
        assert_eq!(decoder.feed(b"#3 #2#1"), vec![SensorId::Two, SensorId::One]);
    }

    #[test]
    fn test_bytes_are_forwarded() {
        let (transport, rx) = test_transport();
        let mock = MockPort::new();
        transport.attach(LinkRole::Reader, "mock0", Box::new(mock.clone()));
        mock.push_inbound(&[0xA0, 0x04, 0xFF, 0x76, 0x10]);

        let events = collect_until(&rx, |seen| {
            seen.iter()
                .filter_map(|e| match e {
                    TransportEvent::Bytes(b) => Some(b.len()),
                    _ => None,
                })
                .sum::<usize>()
                >= 5
        });

        assert_eq!(
            events[0],
            TransportEvent::Connected(LinkRole::Reader, "mock0".to_string())
        );
        let bytes: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Bytes(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(bytes, vec![0xA0, 0x04, 0xFF, 0x76, 0x10]);
        assert!(transport.is_connected(LinkRole::Reader));
    }

    #[test]
    fn test_control_line_rising_edges() {
        let (transport, rx) = test_transport();
        let mock = MockPort::new();
        transport.attach(LinkRole::Reader, "mock0", Box::new(mock.clone()));
        std::thread::sleep(Duration::from_millis(20));

        mock.set_lines(true, false);
        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::SensorEdge(SensorId::One, _)))
        });
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::SensorEdge(SensorId::One, _))));

        // Holding CTS high must not fire again; raising DSR fires sensor 2
        std::thread::sleep(Duration::from_millis(20));
        mock.set_lines(true, true);
        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::SensorEdge(SensorId::Two, _)))
        });
        let sensor_one = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::SensorEdge(SensorId::One, _)))
            .count();
        assert_eq!(sensor_one, 0);
    }

    #[test]
    fn test_line_high_at_connect_fires_once() {
        let (transport, rx) = test_transport();
        let mock = MockPort::new();
        mock.set_lines(true, false);
        transport.attach(LinkRole::Reader, "mock0", Box::new(mock.clone()));

        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::SensorEdge(SensorId::One, _)))
        });
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::SensorEdge(SensorId::One, _))));

        // Staying high afterwards does not fire again
        std::thread::sleep(Duration::from_millis(50));
        let repeats = rx
            .try_iter()
            .filter(|e| matches!(e, TransportEvent::SensorEdge(..)))
            .count();
        assert_eq!(repeats, 0);
    }

    #[test]
    fn test_sensor_port_text() {
        let (transport, rx) = test_transport();
        let mock = MockPort::new();
        transport.attach(LinkRole::Sensor, "sensor0", Box::new(mock.clone()));
        mock.push_inbound(b"#2\n");

        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::SensorText(..)))
        });
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::SensorText(SensorId::Two, _))));
        assert!(!events.iter().any(|e| matches!(e, TransportEvent::Bytes(_))));
    }

    #[test]
    fn test_send_writes_to_reader() {
        let (transport, _rx) = test_transport();
        assert!(!transport.send(&[0x01]));

        let mock = MockPort::new();
        transport.attach(LinkRole::Reader, "mock0", Box::new(mock.clone()));
        assert!(transport.send(&[0xA0, 0x03, 0xFF, 0x72, 0xEC]));
        assert_eq!(mock.written(), vec![0xA0, 0x03, 0xFF, 0x72, 0xEC]);
    }

    #[test]
    fn test_disconnect_reports_stopped() {
        let (transport, rx) = test_transport();
        transport.attach(LinkRole::Reader, "mock0", Box::new(MockPort::new()));
        assert!(transport.disconnect(LinkRole::Reader));
        assert!(!transport.disconnect(LinkRole::Reader));
        assert!(!transport.is_connected(LinkRole::Reader));
        assert!(!transport.send(&[0x01]));

        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::Ended(..)))
        });
        assert!(events.contains(&TransportEvent::Ended(LinkRole::Reader, "stopped".to_string())));
    }

    #[test]
    fn test_io_error_ends_worker() {
        let (transport, rx) = test_transport();
        let mock = MockPort::new();
        transport.attach(LinkRole::Reader, "mock0", Box::new(mock.clone()));
        mock.fail_reads();

        let events = collect_until(&rx, |seen| {
            seen.iter().any(|e| matches!(e, TransportEvent::Ended(..)))
        });
        let reason = events.iter().find_map(|e| match e {
            TransportEvent::Ended(LinkRole::Reader, reason) => Some(reason.clone()),
            _ => None,
        });
        assert!(reason.unwrap().starts_with("disconnected"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!transport.is_connected(LinkRole::Reader));
        assert!(!transport.send(&[0x01]));
    }
}
