// src/io/types.rs
//
// Messages flowing from the transport poll workers to the receive pipeline.

use chrono::{DateTime, Local};
use std::fmt;

use crate::inventory::SensorId;

// ============================================================================
// Link Roles
// ============================================================================

/// Which of the two connections a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRole {
    Reader,
    Sensor,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Reader => write!(f, "reader"),
            LinkRole::Sensor => write!(f, "sensor"),
        }
    }
}

// ============================================================================
// Transport Messages
// ============================================================================

/// Internal message from poll workers to the receive pipeline
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A worker started polling (role, port name)
    Connected(LinkRole, String),
    /// Raw bytes read from the reader connection
    Bytes(Vec<u8>),
    /// Rising edge on a reader control line
    SensorEdge(SensorId, DateTime<Local>),
    /// Activation decoded from sensor-port text
    SensorText(SensorId, DateTime<Local>),
    /// Worker ended (role, reason: "stopped" | "disconnected: <cause>")
    Ended(LinkRole, String),
}
