// src/io/serial/mod.rs
//
// Serial transport for the RFID reader and the sensor port.
//
// Features:
// - One poll worker per open port, forwarding bytes over a bounded channel
// - CTS/DSR rising-edge detection on the reader port (sensor 1 / sensor 2)
// - Frame reassembly for the reader's 0xA0 length-prefixed protocol
// - Port enumeration with reader auto-detection

pub mod framer;
pub mod reader;
pub mod utils;

pub use framer::FrameReassembler;
pub use reader::{Transport, TransportConfig, TransportError};
pub use utils::{list_serial_ports, suggest_reader_port, Parity, SerialPortInfo};
