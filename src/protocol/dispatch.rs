// src/protocol/dispatch.rs
//
// Maps a decoded frame to a semantic reader event.
// Pure: no I/O and no shared state. Frames that fail to decode never reach here.

use chrono::{DateTime, Local};
use serde::Serialize;

use super::codec::DecodedFrame;
use super::commands::*;

// ============================================================================
// Types
// ============================================================================

/// One tag observation from a fast-switch inventory response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagRead {
    pub epc: String,
    pub pc: String,
    pub rssi: i32,
    /// Antenna 1-4
    pub antenna: u8,
    /// Frequency channel code from the upper six bits of the antenna byte
    pub channel: u8,
    pub frequency_mhz: f64,
    /// Host capture time
    pub read_time: DateTime<Local>,
}

impl TagRead {
    /// Frequency formatted to two decimals, e.g. "865.50".
    pub fn frequency_text(&self) -> String {
        format!("{:.2}", self.frequency_mhz)
    }
}

/// A set-command failure reported by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    pub command: u8,
    pub code: u8,
    pub message: String,
}

impl CommandFailure {
    pub fn new(command: u8, code: u8) -> Self {
        Self {
            command,
            code,
            message: status_message(code).to_string(),
        }
    }
}

/// Everything the reader can tell us.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderEvent {
    TagRead(TagRead),
    /// "major.minor"
    FirmwareInfo { version: String },
    /// Uppercase hex of the reader's identifier bytes
    ReaderIdInfo { id: String },
    /// Signed temperature with unit, e.g. "-5°C"
    TemperatureInfo { text: String },
    PowerSetAck { result: Result<(), CommandFailure> },
    /// dBm per antenna, antenna 1 first
    PowerLevels { levels: Vec<u8> },
    RfProfileInfo { profile: u8 },
    FrequencyRegionInfo { region: Region },
    GpioState { pins: [bool; 4] },
    S11Result { value: u8 },
    SetCommandAck { command: u8, result: Result<(), CommandFailure> },
    /// A known response too short to parse
    Truncated { command: u8, payload: Vec<u8> },
    Unrecognized { command: u8, payload: Vec<u8> },
}

// ============================================================================
// Frequency
// ============================================================================

/// Channel codes at or above this value belong to the 902 MHz plan.
const HIGH_BAND_FIRST_CHANNEL: u8 = 7;

/// Carrier frequency for a channel code, in MHz.
pub fn channel_frequency_mhz(channel: u8) -> f64 {
    if channel >= HIGH_BAND_FIRST_CHANNEL {
        902.0 + (channel - HIGH_BAND_FIRST_CHANNEL) as f64 * 0.5
    } else {
        865.0 + channel as f64 * 0.5
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Parse the data section of a fast-switch inventory tag response.
///
/// Layout: antenna/frequency byte, two PC bytes, EPC bytes, RSSI byte.
pub fn parse_tag_read(payload: &[u8], read_time: DateTime<Local>) -> Option<TagRead> {
    if payload.len() < 4 {
        return None;
    }

    let freq_ant = payload[0];
    let channel = freq_ant >> 2;
    let last = payload.len() - 1;

    Some(TagRead {
        epc: hex::encode_upper(&payload[3..last]),
        pc: hex::encode_upper(&payload[1..3]),
        rssi: payload[last] as i32,
        antenna: (freq_ant & 0x03) + 1,
        channel,
        frequency_mhz: channel_frequency_mhz(channel),
        read_time,
    })
}

fn ack_result(command: u8, payload: &[u8]) -> Result<(), CommandFailure> {
    match payload.first() {
        Some(&STATUS_SUCCESS) => Ok(()),
        Some(&code) => Err(CommandFailure::new(command, code)),
        None => Err(CommandFailure::new(command, 0x58)),
    }
}

/// Turn a decoded frame into a reader event.
///
/// `captured_at` becomes the read time of tag observations.
pub fn dispatch(frame: &DecodedFrame, captured_at: DateTime<Local>) -> ReaderEvent {
    let command = frame.command;
    let data = frame.payload.as_slice();
    let truncated = || ReaderEvent::Truncated {
        command,
        payload: data.to_vec(),
    };

    match command {
        CMD_FAST_SWITCH_INVENTORY => match parse_tag_read(data, captured_at) {
            Some(read) => ReaderEvent::TagRead(read),
            None => truncated(),
        },
        CMD_GET_FIRMWARE => match data {
            [major, minor, ..] => ReaderEvent::FirmwareInfo {
                version: format!("{}.{}", major, minor),
            },
            _ => truncated(),
        },
        CMD_GET_READER_ID => {
            if data.is_empty() {
                truncated()
            } else {
                ReaderEvent::ReaderIdInfo {
                    id: hex::encode_upper(data),
                }
            }
        }
        CMD_GET_TEMPERATURE => match data {
            [sign, value, ..] => {
                // A zero sign byte marks a reading below zero
                let sign = if *sign == 0 { "-" } else { "" };
                ReaderEvent::TemperatureInfo {
                    text: format!("{}{}°C", sign, value),
                }
            }
            _ => truncated(),
        },
        CMD_SET_POWER => {
            if data.is_empty() {
                truncated()
            } else {
                ReaderEvent::PowerSetAck {
                    result: ack_result(command, data),
                }
            }
        }
        CMD_GET_POWER | CMD_GET_POWER_EIGHT => match data.len() {
            0 => truncated(),
            1 => ReaderEvent::PowerLevels {
                levels: vec![data[0]; ANTENNA_COUNT],
            },
            n => ReaderEvent::PowerLevels {
                levels: data[..n.min(ANTENNA_COUNT)].to_vec(),
            },
        },
        CMD_GET_RF_PROFILE => match data.first() {
            Some(&profile) => ReaderEvent::RfProfileInfo { profile },
            None => truncated(),
        },
        CMD_GET_FREQUENCY_REGION => match data {
            [code, start, end, ..] => ReaderEvent::FrequencyRegionInfo {
                region: Region::from_params(*code, *start, *end),
            },
            _ => truncated(),
        },
        CMD_READ_GPIO => {
            if data.len() < 2 {
                truncated()
            } else {
                let mut pins = [false; 4];
                for (pin, byte) in pins.iter_mut().zip(data.iter()) {
                    *pin = *byte != 0;
                }
                ReaderEvent::GpioState { pins }
            }
        }
        CMD_MEASURE_S11 => match data.first() {
            Some(&value) => ReaderEvent::S11Result { value },
            None => truncated(),
        },
        CMD_WRITE_GPIO | CMD_SET_RF_PROFILE | CMD_RESET | CMD_SET_FREQUENCY_REGION
        | CMD_SET_BEEPER | CMD_SET_BEEPER_MODE => {
            if data.is_empty() {
                truncated()
            } else {
                ReaderEvent::SetCommandAck {
                    command,
                    result: ack_result(command, data),
                }
            }
        }
        _ => ReaderEvent::Unrecognized {
            command,
            payload: data.to_vec(),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
