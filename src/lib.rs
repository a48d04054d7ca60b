// src/lib.rs
//
// UHF RFID gate controller.
//
// Talks the reader's 0xA0 serial protocol, runs fast-switch inventory scans,
// pairs the two gate sensors into a direction, and scores which tags actually
// passed through the gate.

#[macro_use]
pub mod logging;

pub mod checksums;
pub mod inventory;
pub mod io;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod settings;

#[cfg(feature = "cli")]
mod cli;

pub use inventory::{AnalysisConfig, AnalysisResult, Direction, InventoryStore, SensorCorrelator};
pub use io::serial::{list_serial_ports, suggest_reader_port, Transport, TransportError};
pub use protocol::{
    decode_frame, encode_frame, AntennaConfig, BeeperMode, CommandError, FrameError, ReaderCommand,
    ReaderEvent, Region, TagRead,
};
pub use session::{ReaderInfo, ReaderSession, SessionError, SessionEvent};
pub use settings::{load_settings, save_settings, AppSettings};

/// Run the command-line interface.
#[cfg(feature = "cli")]
pub fn run() {
    cli::run()
}
