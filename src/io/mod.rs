// src/io/mod.rs
//
// Byte-level I/O: link abstraction, transport messages and the serial driver.

pub mod serial;
pub mod traits;
pub mod types;

pub use traits::{ControlLines, LinkPort};
pub use types::{LinkRole, TransportEvent};
