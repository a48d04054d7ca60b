// src/inventory/mod.rs
//
// Tag inventory, gate sensor correlation and read analysis.

pub mod analysis;
pub mod sensor;
pub mod store;

pub use analysis::{analyze, canonical_epc, AnalysisConfig, AnalysisResult};
pub use sensor::{CorrelatorState, Direction, Resolution, SensorCorrelator, SensorId};
pub use store::{is_sentinel_epc, HistoryRow, InventoryStore, RecordOutcome};
