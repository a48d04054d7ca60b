// src/protocol/commands.rs
//
// Reader command set: opcodes, typed parameters and validation.
// Every builder validates its arguments before any frame bytes are produced,
// so an invalid request is never partially sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::codec::{encode_frame, FrameError};

// ============================================================================
// Command Codes
// ============================================================================

pub const CMD_READ_GPIO: u8 = 0x60;
pub const CMD_WRITE_GPIO: u8 = 0x61;
pub const CMD_GET_READER_ID: u8 = 0x68;
pub const CMD_SET_RF_PROFILE: u8 = 0x69;
pub const CMD_GET_RF_PROFILE: u8 = 0x6A;
pub const CMD_RESET: u8 = 0x70;
pub const CMD_GET_FIRMWARE: u8 = 0x72;
pub const CMD_SET_POWER: u8 = 0x76;
pub const CMD_GET_POWER: u8 = 0x77;
pub const CMD_SET_FREQUENCY_REGION: u8 = 0x78;
pub const CMD_GET_FREQUENCY_REGION: u8 = 0x79;
pub const CMD_SET_BEEPER: u8 = 0x7A;
pub const CMD_SET_BEEPER_MODE: u8 = 0x7C;
pub const CMD_GET_TEMPERATURE: u8 = 0x7B;
pub const CMD_MEASURE_S11: u8 = 0x7E;
pub const CMD_FAST_SWITCH_INVENTORY: u8 = 0x8A;
pub const CMD_GET_POWER_EIGHT: u8 = 0x97;

/// Status byte reported by the reader for a successful set-command.
pub const STATUS_SUCCESS: u8 = 0x10;

/// Highest output power the reader accepts, in dBm.
pub const MAX_POWER_DBM: u8 = 33;

pub const ANTENNA_COUNT: usize = 4;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("power {value} dBm is out of range (0-33){}", antenna_suffix(.antenna))]
    PowerOutOfRange { antenna: Option<u8>, value: u8 },

    #[error("invalid RF profile 0x{0:02X} (expected 0xD0-0xD3)")]
    InvalidRfProfile(u8),

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("invalid GPIO pin {0} (expected 1-4)")]
    InvalidGpioPin(u8),

    #[error("at least one antenna must be enabled")]
    InvalidAntennaMask,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

fn antenna_suffix(antenna: &Option<u8>) -> String {
    match antenna {
        Some(n) => format!(" for antenna {}", n),
        None => String::new(),
    }
}

/// Best-effort description of a reader status byte.
pub fn status_message(code: u8) -> &'static str {
    match code {
        STATUS_SUCCESS => "Success",
        0x00 => "Command failed",
        0x01 => "Invalid parameter",
        0x02 => "Reader busy",
        0x58 => "Invalid response data",
        _ => "Unknown error",
    }
}

/// Human-readable name of an opcode, used in log lines.
pub fn command_name(command: u8) -> &'static str {
    match command {
        CMD_READ_GPIO => "read GPIO",
        CMD_WRITE_GPIO => "write GPIO",
        CMD_GET_READER_ID => "get reader ID",
        CMD_SET_RF_PROFILE => "set RF profile",
        CMD_GET_RF_PROFILE => "get RF profile",
        CMD_RESET => "reset",
        CMD_GET_FIRMWARE => "get firmware",
        CMD_SET_POWER => "set power",
        CMD_GET_POWER | CMD_GET_POWER_EIGHT => "get power",
        CMD_SET_FREQUENCY_REGION => "set frequency region",
        CMD_GET_FREQUENCY_REGION => "get frequency region",
        CMD_SET_BEEPER | CMD_SET_BEEPER_MODE => "set beeper",
        CMD_GET_TEMPERATURE => "get temperature",
        CMD_MEASURE_S11 => "measure S11",
        CMD_FAST_SWITCH_INVENTORY => "fast switch inventory",
        _ => "unknown",
    }
}

// ============================================================================
// Parameter Types
// ============================================================================

/// Frequency region with its (region code, start channel, end channel) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Us,
    China,
    Vietnam,
    Europe,
    Custom { code: u8, start: u8, end: u8 },
}

impl Region {
    pub fn params(&self) -> (u8, u8, u8) {
        match *self {
            Region::Us => (0x01, 0x07, 0x3B),
            Region::China => (0x01, 0x2B, 0x35),
            Region::Vietnam => (0x01, 0x27, 0x31),
            Region::Europe => (0x02, 0x00, 0x06),
            Region::Custom { code, start, end } => (code, start, end),
        }
    }

    pub fn validate(&self) -> Result<(u8, u8, u8), CommandError> {
        let (code, start, end) = self.params();
        if !(0x01..=0x04).contains(&code) {
            return Err(CommandError::InvalidRegion(format!(
                "region code 0x{:02X} (expected 0x01-0x04)",
                code
            )));
        }
        if start > end {
            return Err(CommandError::InvalidRegion(format!(
                "start channel {} is above end channel {}",
                start, end
            )));
        }
        Ok((code, start, end))
    }

    /// Parse a region name ("us", "china", "vietnam", "europe").
    pub fn from_name(name: &str) -> Result<Self, CommandError> {
        match name.trim().to_lowercase().as_str() {
            "us" | "usa" | "fcc" => Ok(Region::Us),
            "china" | "cn" => Ok(Region::China),
            "vietnam" | "vn" => Ok(Region::Vietnam),
            "europe" | "eu" | "etsi" => Ok(Region::Europe),
            other => Err(CommandError::InvalidRegion(format!("unknown region '{}'", other))),
        }
    }

    /// Match a reported triple back to a named region.
    pub fn from_params(code: u8, start: u8, end: u8) -> Self {
        [Region::Us, Region::China, Region::Vietnam, Region::Europe]
            .into_iter()
            .find(|r| r.params() == (code, start, end))
            .unwrap_or(Region::Custom { code, start, end })
    }
}

/// Reader RF link profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfProfile {
    D0,
    D1,
    D2,
    D3,
}

impl RfProfile {
    pub fn code(&self) -> u8 {
        match self {
            RfProfile::D0 => 0xD0,
            RfProfile::D1 => 0xD1,
            RfProfile::D2 => 0xD2,
            RfProfile::D3 => 0xD3,
        }
    }
}

impl TryFrom<u8> for RfProfile {
    type Error = CommandError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0xD0 => Ok(RfProfile::D0),
            0xD1 => Ok(RfProfile::D1),
            0xD2 => Ok(RfProfile::D2),
            0xD3 => Ok(RfProfile::D3),
            other => Err(CommandError::InvalidRfProfile(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeeperMode {
    Quiet,
    PerTag,
}

impl BeeperMode {
    pub fn code(&self) -> u8 {
        match self {
            BeeperMode::Quiet => 0x00,
            BeeperMode::PerTag => 0x02,
        }
    }
}

/// Fast-switch inventory antenna sequence.
///
/// Four (stay, enabled) pairs followed by two reserved bytes. Sent verbatim with
/// every inventory poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaConfig {
    bytes: [u8; 10],
}

impl AntennaConfig {
    pub fn from_enabled(enabled: [bool; ANTENNA_COUNT]) -> Self {
        let mut bytes = [0u8; 10];
        for (i, on) in enabled.iter().enumerate() {
            bytes[i * 2] = i as u8;
            bytes[i * 2 + 1] = if *on { 0x01 } else { 0x00 };
        }
        Self { bytes }
    }

    /// Like `from_enabled`, but rejects a mask with no antenna switched on.
    pub fn try_from_enabled(enabled: [bool; ANTENNA_COUNT]) -> Result<Self, CommandError> {
        if enabled.iter().any(|on| *on) {
            Ok(Self::from_enabled(enabled))
        } else {
            Err(CommandError::InvalidAntennaMask)
        }
    }

    pub fn enabled(&self) -> [bool; ANTENNA_COUNT] {
        let mut flags = [false; ANTENNA_COUNT];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = self.bytes[i * 2 + 1] == 0x01;
        }
        flags
    }

    pub fn as_bytes(&self) -> &[u8; 10] {
        &self.bytes
    }
}

impl Default for AntennaConfig {
    fn default() -> Self {
        Self::from_enabled([true, true, false, false])
    }
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderCommand {
    ReadGpio,
    WriteGpio { pin: u8, level: bool },
    GetReaderId,
    SetRfProfile(u8),
    GetRfProfile,
    Reset,
    GetFirmware,
    SetPower(u8),
    SetPowerPerAntenna([u8; ANTENNA_COUNT]),
    GetPower,
    GetPowerEight,
    SetFrequencyRegion(Region),
    GetFrequencyRegion,
    SetBeeper(BeeperMode),
    GetTemperature,
    MeasureS11 { freq_index: u8 },
    FastSwitchInventory(AntennaConfig),
}

impl ReaderCommand {
    pub fn code(&self) -> u8 {
        match self {
            ReaderCommand::ReadGpio => CMD_READ_GPIO,
            ReaderCommand::WriteGpio { .. } => CMD_WRITE_GPIO,
            ReaderCommand::GetReaderId => CMD_GET_READER_ID,
            ReaderCommand::SetRfProfile(_) => CMD_SET_RF_PROFILE,
            ReaderCommand::GetRfProfile => CMD_GET_RF_PROFILE,
            ReaderCommand::Reset => CMD_RESET,
            ReaderCommand::GetFirmware => CMD_GET_FIRMWARE,
            ReaderCommand::SetPower(_) | ReaderCommand::SetPowerPerAntenna(_) => CMD_SET_POWER,
            ReaderCommand::GetPower => CMD_GET_POWER,
            ReaderCommand::GetPowerEight => CMD_GET_POWER_EIGHT,
            ReaderCommand::SetFrequencyRegion(_) => CMD_SET_FREQUENCY_REGION,
            ReaderCommand::GetFrequencyRegion => CMD_GET_FREQUENCY_REGION,
            ReaderCommand::SetBeeper(_) => CMD_SET_BEEPER_MODE,
            ReaderCommand::GetTemperature => CMD_GET_TEMPERATURE,
            ReaderCommand::MeasureS11 { .. } => CMD_MEASURE_S11,
            ReaderCommand::FastSwitchInventory(_) => CMD_FAST_SWITCH_INVENTORY,
        }
    }

    /// Validated data section for this command.
    pub fn data(&self) -> Result<Vec<u8>, CommandError> {
        let data = match self {
            ReaderCommand::WriteGpio { pin, level } => {
                if !(1..=4).contains(pin) {
                    return Err(CommandError::InvalidGpioPin(*pin));
                }
                vec![*pin, u8::from(*level)]
            }
            ReaderCommand::SetRfProfile(code) => vec![RfProfile::try_from(*code)?.code()],
            ReaderCommand::SetPower(dbm) => {
                check_power(None, *dbm)?;
                vec![*dbm]
            }
            ReaderCommand::SetPowerPerAntenna(levels) => {
                for (i, dbm) in levels.iter().enumerate() {
                    check_power(Some(i as u8 + 1), *dbm)?;
                }
                levels.to_vec()
            }
            ReaderCommand::SetFrequencyRegion(region) => {
                let (code, start, end) = region.validate()?;
                vec![code, start, end]
            }
            ReaderCommand::SetBeeper(mode) => vec![mode.code()],
            ReaderCommand::MeasureS11 { freq_index } => vec![*freq_index],
            ReaderCommand::FastSwitchInventory(config) => config.as_bytes().to_vec(),
            ReaderCommand::ReadGpio
            | ReaderCommand::GetReaderId
            | ReaderCommand::GetRfProfile
            | ReaderCommand::Reset
            | ReaderCommand::GetFirmware
            | ReaderCommand::GetPower
            | ReaderCommand::GetPowerEight
            | ReaderCommand::GetFrequencyRegion
            | ReaderCommand::GetTemperature => Vec::new(),
        };
        Ok(data)
    }

    /// Validate and encode into a complete wire frame.
    pub fn encode(&self, reader_id: u8) -> Result<Vec<u8>, CommandError> {
        let data = self.data()?;
        Ok(encode_frame(reader_id, self.code(), &data)?)
    }
}

fn check_power(antenna: Option<u8>, value: u8) -> Result<(), CommandError> {
    if value > MAX_POWER_DBM {
        return Err(CommandError::PowerOutOfRange { antenna, value });
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_power_encoding() {
        let frame = ReaderCommand::SetPower(25).encode(0xFF).unwrap();
        assert_eq!(frame, vec![0xA0, 0x04, 0xFF, 0x76, 0x19, 0xCE]);
    }

    #[test]
    fn test_set_power_bounds() {
        assert!(ReaderCommand::SetPower(0).encode(0xFF).is_ok());
        assert!(ReaderCommand::SetPower(33).encode(0xFF).is_ok());
        assert_eq!(
            ReaderCommand::SetPower(34).encode(0xFF),
            Err(CommandError::PowerOutOfRange {
                antenna: None,
                value: 34
            })
        );
    }

    #[test]
    fn test_set_power_per_antenna_reports_antenna() {
        let err = ReaderCommand::SetPowerPerAntenna([30, 30, 40, 30])
            .encode(0xFF)
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::PowerOutOfRange {
                antenna: Some(3),
                value: 40
            }
        );
        assert_eq!(err.to_string(), "power 40 dBm is out of range (0-33) for antenna 3");
    }

    #[test]
    fn test_default_antenna_config() {
        assert_eq!(
            AntennaConfig::default().as_bytes(),
            &[0x00, 0x01, 0x01, 0x01, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_antenna_config_roundtrip_flags() {
        let flags = [false, true, false, true];
        let config = AntennaConfig::from_enabled(flags);
        assert_eq!(config.enabled(), flags);
        assert_eq!(
            config.as_bytes(),
            &[0x00, 0x00, 0x01, 0x01, 0x02, 0x00, 0x03, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn test_antenna_config_rejects_empty_mask() {
        assert_eq!(
            AntennaConfig::try_from_enabled([false; 4]),
            Err(CommandError::InvalidAntennaMask)
        );
    }

    #[test]
    fn test_inventory_frame_carries_config() {
        let frame = ReaderCommand::FastSwitchInventory(AntennaConfig::default())
            .encode(0xFF)
            .unwrap();
        assert_eq!(frame.len(), 15);
        assert_eq!(frame[1], 13);
        assert_eq!(frame[3], CMD_FAST_SWITCH_INVENTORY);
        assert_eq!(&frame[4..14], AntennaConfig::default().as_bytes());
    }

    #[test]
    fn test_region_params() {
        assert_eq!(Region::Us.params(), (0x01, 0x07, 0x3B));
        assert_eq!(Region::China.params(), (0x01, 0x2B, 0x35));
        assert_eq!(Region::Vietnam.params(), (0x01, 0x27, 0x31));
        assert_eq!(Region::Europe.params(), (0x02, 0x00, 0x06));
    }

    #[test]
    fn test_region_validation() {
        let bad_code = Region::Custom { code: 0x09, start: 0, end: 5 };
        assert!(matches!(bad_code.validate(), Err(CommandError::InvalidRegion(_))));

        let reversed = Region::Custom { code: 0x01, start: 10, end: 5 };
        assert!(matches!(
            ReaderCommand::SetFrequencyRegion(reversed).encode(0xFF),
            Err(CommandError::InvalidRegion(_))
        ));

        let frame = ReaderCommand::SetFrequencyRegion(Region::Europe).encode(0xFF).unwrap();
        assert_eq!(&frame[4..7], &[0x02, 0x00, 0x06]);
    }

    #[test]
    fn test_region_names() {
        assert_eq!(Region::from_name("US").unwrap(), Region::Us);
        assert_eq!(Region::from_name(" europe ").unwrap(), Region::Europe);
        assert!(Region::from_name("mars").is_err());
        assert_eq!(Region::from_params(0x01, 0x27, 0x31), Region::Vietnam);
        assert_eq!(
            Region::from_params(0x03, 0x01, 0x02),
            Region::Custom { code: 0x03, start: 0x01, end: 0x02 }
        );
    }

    #[test]
    fn test_rf_profile_validation() {
        assert!(ReaderCommand::SetRfProfile(0xD0).encode(0xFF).is_ok());
        assert!(ReaderCommand::SetRfProfile(0xD3).encode(0xFF).is_ok());
        assert_eq!(
            ReaderCommand::SetRfProfile(0xD4).encode(0xFF),
            Err(CommandError::InvalidRfProfile(0xD4))
        );
        assert_eq!(
            ReaderCommand::SetRfProfile(0xCF).encode(0xFF),
            Err(CommandError::InvalidRfProfile(0xCF))
        );
    }

    #[test]
    fn test_gpio_write() {
        let frame = ReaderCommand::WriteGpio { pin: 3, level: true }.encode(0x01).unwrap();
        assert_eq!(&frame[2..6], &[0x01, CMD_WRITE_GPIO, 0x03, 0x01]);
        assert_eq!(
            ReaderCommand::WriteGpio { pin: 0, level: true }.encode(0x01),
            Err(CommandError::InvalidGpioPin(0))
        );
    }

    #[test]
    fn test_beeper_and_s11() {
        let beeper = ReaderCommand::SetBeeper(BeeperMode::PerTag).encode(0xFF).unwrap();
        assert_eq!(&beeper[3..5], &[CMD_SET_BEEPER_MODE, 0x02]);

        let s11 = ReaderCommand::MeasureS11 { freq_index: 7 }.encode(0xFF).unwrap();
        assert_eq!(&s11[3..5], &[CMD_MEASURE_S11, 0x07]);
    }

    #[test]
    fn test_status_message() {
        assert_eq!(status_message(0x10), "Success");
        assert_eq!(status_message(0x02), "Reader busy");
        assert_eq!(status_message(0x58), "Invalid response data");
        assert_eq!(status_message(0x99), "Unknown error");
    }
}
