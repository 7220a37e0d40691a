//! Opcode, status-code and parameter vocabulary of the reader protocol

use std::fmt;

/// Highest accepted per-antenna output power (dBm)
pub const MAX_OUTPUT_POWER: u8 = 0x21;

/// Highest frequency point code (865.0 MHz + 0.5 MHz steps)
pub const MAX_FREQUENCY_CODE: u8 = 0x3B;

/// Frequency range applied when a requested one is unusable
pub const DEFAULT_FREQUENCY_RANGE: (u8, u8) = (0x00, 0x06);

/// Protocol command identifiers used by the device.
///
/// `AllTagsReceived` never goes on the wire: it names the moment the tags
/// streamed by a buffer read reach the count the reader announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommandId {
    Reset = 0x70,
    SetUartBaudrate = 0x71,
    GetFirmwareVersion = 0x72,
    SetWorkAntenna = 0x74,
    GetWorkAntenna = 0x75,
    SetOutputPower = 0x76,
    GetOutputPower = 0x77,
    SetFrequencyRegion = 0x78,
    GetFrequencyRegion = 0x79,
    Inventory = 0x80,
    Read = 0x81,
    GetInventoryBuffer = 0x90,
    GetAndResetInventoryBuffer = 0x91,
    GetInventoryBufferTagCount = 0x92,
    ResetInventoryBuffer = 0x93,
    AllTagsReceived = 0x94,
}

impl CommandId {
    pub fn name(self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::SetUartBaudrate => "set_uart_baudrate",
            Self::GetFirmwareVersion => "get_firmware_version",
            Self::SetWorkAntenna => "set_work_antenna",
            Self::GetWorkAntenna => "get_work_antenna",
            Self::SetOutputPower => "set_output_power",
            Self::GetOutputPower => "get_output_power",
            Self::SetFrequencyRegion => "set_frequency_region",
            Self::GetFrequencyRegion => "get_frequency_region",
            Self::Inventory => "inventory",
            Self::Read => "read",
            Self::GetInventoryBuffer => "get_inventory_buffer",
            Self::GetAndResetInventoryBuffer => "get_and_reset_inventory_buffer",
            Self::GetInventoryBufferTagCount => "get_inventory_buffer_tag_count",
            Self::ResetInventoryBuffer => "reset_inventory_buffer",
            Self::AllTagsReceived => "all_tags_received",
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for CommandId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x70 => Ok(Self::Reset),
            0x71 => Ok(Self::SetUartBaudrate),
            0x72 => Ok(Self::GetFirmwareVersion),
            0x74 => Ok(Self::SetWorkAntenna),
            0x75 => Ok(Self::GetWorkAntenna),
            0x76 => Ok(Self::SetOutputPower),
            0x77 => Ok(Self::GetOutputPower),
            0x78 => Ok(Self::SetFrequencyRegion),
            0x79 => Ok(Self::GetFrequencyRegion),
            0x80 => Ok(Self::Inventory),
            0x81 => Ok(Self::Read),
            0x90 => Ok(Self::GetInventoryBuffer),
            0x91 => Ok(Self::GetAndResetInventoryBuffer),
            0x92 => Ok(Self::GetInventoryBufferTagCount),
            0x93 => Ok(Self::ResetInventoryBuffer),
            0x94 => Ok(Self::AllTagsReceived),
            other => Err(other),
        }
    }
}

/// Status codes reported by the reader firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u8)]
pub enum ErrorCode {
    #[error("Command succeeded.")]
    CommandSuccess = 0x10,
    #[error("Command failed.")]
    CommandFail = 0x11,
    #[error("CPU reset error.")]
    McuResetError = 0x20,
    #[error("Turn on CW error.")]
    CwOnError = 0x21,
    #[error("Antenna is missing.")]
    AntennaMissing = 0x22,
    #[error("Write flash error.")]
    WriteFlashError = 0x23,
    #[error("Read flash error.")]
    ReadFlashError = 0x24,
    #[error("Set output power error.")]
    SetOutputPowerError = 0x25,
    #[error("Error occurred when inventory.")]
    TagInventoryError = 0x31,
    #[error("Error occurred when read.")]
    TagReadError = 0x32,
    #[error("Error occurred when write.")]
    TagWriteError = 0x33,
    #[error("Error occurred when lock.")]
    TagLockError = 0x34,
    #[error("Error occurred when kill.")]
    TagKillError = 0x35,
    #[error("There is no tag to be operated.")]
    NoTag = 0x36,
    #[error("Tag Inventoried but access failed.")]
    InventoryOkButAccessFail = 0x37,
    #[error("Buffer is empty.")]
    BufferIsEmpty = 0x38,
    #[error("Access failed or wrong password.")]
    AccessOrPasswordError = 0x40,
    #[error("Invalid parameter.")]
    ParameterInvalid = 0x41,
    #[error("WordCnt is too long.")]
    WordCountTooLong = 0x42,
    #[error("MemBank out of range.")]
    MemBankOutOfRange = 0x43,
    #[error("Lock region out of range.")]
    LockRegionOutOfRange = 0x44,
    #[error("LockType out of range.")]
    LockActionOutOfRange = 0x45,
    #[error("Invalid reader address.")]
    ReaderAddressInvalid = 0x46,
    #[error("AntennaID out of range.")]
    AntennaIdOutOfRange = 0x47,
    #[error("Output power out of range.")]
    OutputPowerOutOfRange = 0x48,
    #[error("Frequency region out of range.")]
    FrequencyRegionOutOfRange = 0x49,
    #[error("Baud rate out of range.")]
    BaudrateOutOfRange = 0x4A,
    #[error("Buzzer behavior out of range.")]
    BeeperModeOutOfRange = 0x4B,
    #[error("EPC match is too long.")]
    EpcMatchTooLong = 0x4C,
    #[error("EPC match length wrong.")]
    EpcMatchLengthError = 0x4D,
    #[error("Invalid EPC match mode.")]
    InvalidEpcMatchMode = 0x4E,
    #[error("Invalid frequency range.")]
    InvalidFrequencyRange = 0x4F,
    #[error("Failed to receive RN16 from tag.")]
    NoRn16FromTag = 0x50,
    #[error("Invalid DRM mode.")]
    InvalidDrmMode = 0x51,
    #[error("PLL can not lock.")]
    PllLockFail = 0x52,
    #[error("No response from RF chip.")]
    RfChipNoResponse = 0x53,
    #[error("Can't achieve desired output power level.")]
    OutputPowerNotAchieved = 0x54,
    #[error("Can't authenticate firmware copyright.")]
    CopyrightAuthenticationFail = 0x55,
    #[error("Spectrum regulation wrong.")]
    SpectrumRegulationError = 0x56,
    #[error("Output power is too low.")]
    OutputPowerTooLow = 0x57,
}

impl ErrorCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 40] = [
            CommandSuccess, CommandFail, McuResetError, CwOnError, AntennaMissing,
            WriteFlashError, ReadFlashError, SetOutputPowerError, TagInventoryError,
            TagReadError, TagWriteError, TagLockError, TagKillError, NoTag,
            InventoryOkButAccessFail, BufferIsEmpty, AccessOrPasswordError, ParameterInvalid,
            WordCountTooLong, MemBankOutOfRange, LockRegionOutOfRange, LockActionOutOfRange,
            ReaderAddressInvalid, AntennaIdOutOfRange, OutputPowerOutOfRange,
            FrequencyRegionOutOfRange, BaudrateOutOfRange, BeeperModeOutOfRange,
            EpcMatchTooLong, EpcMatchLengthError, InvalidEpcMatchMode, InvalidFrequencyRange,
            NoRn16FromTag, InvalidDrmMode, PllLockFail, RfChipNoResponse,
            OutputPowerNotAchieved, CopyrightAuthenticationFail, SpectrumRegulationError,
            OutputPowerTooLow,
        ];
        ALL.into_iter().find(|c| *c as u8 == code)
    }
}

/// A non-success status byte returned by the reader.
///
/// Wraps the raw byte so codes missing from [`ErrorCode`] still print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError(pub u8);

impl DeviceError {
    pub const COMMAND_FAIL: Self = Self(ErrorCode::CommandFail as u8);

    pub fn code(self) -> Option<ErrorCode> {
        ErrorCode::from_u8(self.0)
    }
}

impl From<ErrorCode> for DeviceError {
    fn from(code: ErrorCode) -> Self {
        Self(code as u8)
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{}", code),
            None => write!(f, "undeclared error code: {:02x}", self.0),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Serial speeds the reader can switch to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Baudrate {
    Bps38400 = 0x03,
    Bps115200 = 0x04,
}

impl TryFrom<u8> for Baudrate {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::Bps38400),
            0x04 => Ok(Self::Bps115200),
            other => Err(other),
        }
    }
}

/// Antenna ports of the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkAntenna {
    Ant1 = 0x00,
    Ant2 = 0x01,
    Ant3 = 0x02,
    Ant4 = 0x03,
}

impl WorkAntenna {
    pub const COUNT: usize = 4;
}

impl TryFrom<u8> for WorkAntenna {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Ant1),
            0x01 => Ok(Self::Ant2),
            0x02 => Ok(Self::Ant3),
            0x03 => Ok(Self::Ant4),
            other => Err(other),
        }
    }
}

/// Regulatory frequency regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum SpectrumRegion {
    Fcc = 0x01,
    Etsi = 0x02,
    Chn = 0x03,
}

impl SpectrumRegion {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Fcc),
            0x02 => Some(Self::Etsi),
            0x03 => Some(Self::Chn),
            _ => None,
        }
    }
}

impl fmt::Display for SpectrumRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fcc => f.write_str("FCC"),
            Self::Etsi => f.write_str("ETSI"),
            Self::Chn => f.write_str("CHN"),
        }
    }
}

/// Tag memory banks addressable by the read command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemBank {
    Reserved = 0x00,
    Epc = 0x01,
    Tid = 0x02,
    User = 0x03,
}

impl TryFrom<u8> for MemBank {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Reserved),
            0x01 => Ok(Self::Epc),
            0x02 => Ok(Self::Tid),
            0x03 => Ok(Self::User),
            other => Err(other),
        }
    }
}

/// Frequency point code rendered in MHz
pub fn frequency_mhz(code: u8) -> f32 {
    if code <= MAX_FREQUENCY_CODE {
        865.0 + code as f32 * 0.5
    } else {
        865.0
    }
}
