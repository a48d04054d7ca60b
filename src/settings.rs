use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inventory::analysis::AnalysisConfig;
use crate::io::serial::Parity;
use crate::protocol::BROADCAST_READER_ID;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SerialSettings {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64, // read/write timeout
    #[serde(default = "default_true")]
    pub assert_dtr: bool,
    #[serde(default = "default_true")]
    pub assert_rts: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            timeout_ms: default_timeout_ms(),
            assert_dtr: true,
            assert_rts: true,
        }
    }
}

impl SerialSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    #[serde(default)]
    pub reader: SerialSettings,
    /// Falls back to the reader's line settings when absent
    #[serde(default)]
    pub sensor: Option<SerialSettings>,
    #[serde(default = "default_reader_id")]
    pub reader_id: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64, // pause after open before clearing buffers
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_ui_batch_interval_ms")]
    pub ui_batch_interval_ms: u64,
    #[serde(default = "default_max_tags_per_batch")]
    pub max_tags_per_batch: usize,
    #[serde(default = "default_tag_queue_capacity")]
    pub tag_queue_capacity: usize,
    #[serde(default = "default_history_ceiling")]
    pub history_ceiling: usize,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_true")]
    pub stop_on_direction: bool,
    #[serde(default = "default_sensor_mark_tolerance_ms")]
    pub sensor_mark_tolerance_ms: i64,
    #[serde(default = "default_antennas")]
    pub antennas: [bool; 4],
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_reader_id() -> u8 {
    BROADCAST_READER_ID
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_settle_ms() -> u64 {
    100
}
fn default_scan_interval_ms() -> u64 {
    50
}
fn default_ui_batch_interval_ms() -> u64 {
    100
}
fn default_max_tags_per_batch() -> usize {
    50
}
fn default_tag_queue_capacity() -> usize {
    1000
}
fn default_history_ceiling() -> usize {
    10_000
}
fn default_stop_timeout_ms() -> u64 {
    2000
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_sensor_mark_tolerance_ms() -> i64 {
    100
}
fn default_antennas() -> [bool; 4] {
    [true, true, false, false]
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            reader: SerialSettings::default(),
            sensor: None,
            reader_id: default_reader_id(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            ui_batch_interval_ms: default_ui_batch_interval_ms(),
            max_tags_per_batch: default_max_tags_per_batch(),
            tag_queue_capacity: default_tag_queue_capacity(),
            history_ceiling: default_history_ceiling(),
            stop_timeout_ms: default_stop_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            stop_on_direction: true,
            sensor_mark_tolerance_ms: default_sensor_mark_tolerance_ms(),
            antennas: default_antennas(),
            log_dir: None,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl AppSettings {
    /// Tuning for single-board computers: slower inventory cadence and UI batches.
    pub fn embedded() -> Self {
        Self {
            scan_interval_ms: 80,
            ui_batch_interval_ms: 150,
            ..Self::default()
        }
    }

    /// Line settings for the sensor port. Without its own block it inherits
    /// the reader's baud, framing, timeout and DTR/RTS, minus the port name.
    pub fn sensor_serial(&self) -> SerialSettings {
        match &self.sensor {
            Some(sensor) => sensor.clone(),
            None => SerialSettings {
                port: None,
                ..self.reader.clone()
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn ui_batch_interval(&self) -> Duration {
        Duration::from_millis(self.ui_batch_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// `<config dir>/uhf-gate/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let config_dir =
        dirs::config_dir().ok_or_else(|| "Failed to get config dir".to_string())?;
    Ok(config_dir.join("uhf-gate").join("settings.json"))
}

/// Load settings, falling back to defaults when the file does not exist yet.
pub fn load_settings(path: &Path) -> Result<AppSettings, String> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }

    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read settings: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }

    let content = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;

    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))?;

    Ok(())
}
