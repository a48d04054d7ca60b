// src/io/serial/utils.rs
//
// Shared utilities for serial connections.
// Conversion into serialport types, opening ports with the reader's line
// discipline, and port enumeration with reader auto-detection.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, SerialPort, StopBits};
use std::time::Duration;

use super::reader::TransportError;
use crate::settings::SerialSettings;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: &Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Short line-discipline label, e.g. "8N1".
pub fn line_label(settings: &SerialSettings) -> String {
    format!(
        "{}{}{}",
        settings.data_bits,
        match settings.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        },
        settings.stop_bits
    )
}

// ============================================================================
// Opening
// ============================================================================

/// Open `port` with the configured line discipline, then raise DTR/RTS.
pub fn open_serial_port(
    port: &str,
    settings: &SerialSettings,
) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut handle = serialport::new(port, settings.baud_rate)
        .data_bits(to_serialport_data_bits(settings.data_bits))
        .stop_bits(to_serialport_stop_bits(settings.stop_bits))
        .parity(to_serialport_parity(&settings.parity))
        .timeout(settings.timeout())
        .open()
        .map_err(|e| TransportError::from_open_error(port, e))?;

    let configure_error = |e: serialport::Error| TransportError::Configure {
        port: port.to_string(),
        message: e.to_string(),
    };
    if settings.assert_dtr {
        handle.write_data_terminal_ready(true).map_err(configure_error)?;
    }
    if settings.assert_rts {
        handle.write_request_to_send(true).map_err(configure_error)?;
    }
    Ok(handle)
}

/// Wait for the device to settle after opening.
pub fn settle(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}

// ============================================================================
// Enumeration
// ============================================================================

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// On Linux only USB, ACM and on-board UARTs are listed.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    Ok(ports
        .into_iter()
        .filter(|p| is_candidate_port(&p.port_name))
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

fn is_candidate_port(name: &str) -> bool {
    #[cfg(target_os = "macos")]
    {
        !name.starts_with("/dev/tty.")
    }
    #[cfg(target_os = "linux")]
    {
        ["/dev/ttyUSB", "/dev/ttyACM", "/dev/ttyS", "/dev/ttyAMA"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = name;
        true
    }
}

const READER_CHIP_HINTS: [&str; 6] = ["cp210", "ch340", "ftdi", "pl2303", "rfid", "reader"];
const READER_VENDOR_HINTS: [&str; 4] = ["silicon labs", "ftdi", "wch", "prolific"];

/// Likelihood that a port hosts an RFID reader. Zero means no evidence.
pub fn reader_port_score(port: &SerialPortInfo) -> u32 {
    let mut score = 0;
    if port.port_name.contains("ttyUSB") {
        score += 10;
    } else if port.port_name.contains("ttyACM") {
        score += 5;
    }

    let product = port.product.as_deref().unwrap_or("").to_lowercase();
    if READER_CHIP_HINTS.iter().any(|hint| product.contains(hint)) {
        score += 15;
    }

    let manufacturer = port.manufacturer.as_deref().unwrap_or("").to_lowercase();
    if READER_VENDOR_HINTS.iter().any(|hint| manufacturer.contains(hint)) {
        score += 10;
    }
    score
}

/// Pick the most reader-like port. Ties go to the lexicographically first name.
pub fn suggest_reader_port(ports: &[SerialPortInfo]) -> Option<&SerialPortInfo> {
    ports
        .iter()
        .filter(|p| reader_port_score(p) > 0)
        .max_by(|a, b| {
            reader_port_score(a)
                .cmp(&reader_port_score(b))
                .then_with(|| b.port_name.cmp(&a.port_name))
        })
}

// ============================================================================
// Tests
// ============================================================================
