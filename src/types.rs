//! Types for RFID operations

use crate::command::{DeviceError, SpectrumRegion, WorkAntenna};
use std::fmt;

/// One tag observation decoded from a buffer or read response
#[derive(Debug, Clone, Default)]
pub struct TagRead {
    /// Number of records the reader announced for the response this came in
    pub tag_count: u16,
    pub pc: u16,
    pub epc: Vec<u8>,
    pub crc: u16,
    /// Memory contents for direct reads, empty for buffer reads
    pub data: Vec<u8>,
    pub rssi: u8,
    pub antenna: u8,
    pub frequency: u8,
    pub inventory_count: u8,
    pub read_count: u8,
    /// Times seen during the current operation
    pub seen: u32,
}

impl TagRead {
    /// Key used by every tag view
    pub fn epc_hex(&self) -> String {
        bytes_to_hex(&self.epc)
    }
}

impl PartialEq for TagRead {
    fn eq(&self, other: &Self) -> bool {
        self.epc == other.epc
    }
}

impl Eq for TagRead {}

/// Radio configuration last reported by the reader.
///
/// `Display` renders the JSON fragment the command layer splices into its
/// status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AntennaSettings {
    pub region: u8,
    pub start_frequency: u8,
    pub end_frequency: u8,
    pub powers: [u8; WorkAntenna::COUNT],
}

impl Default for AntennaSettings {
    fn default() -> Self {
        Self {
            region: SpectrumRegion::Etsi as u8,
            start_frequency: 0,
            end_frequency: 0,
            powers: [0; WorkAntenna::COUNT],
        }
    }
}

impl fmt::Display for AntennaSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"frequencyRegion\":{{\"startFrequency\":{},\"endFrequency\":{},\"region\":{}}},\"powers\":[{},{},{},{}]",
            self.start_frequency,
            self.end_frequency,
            self.region,
            self.powers[0],
            self.powers[1],
            self.powers[2],
            self.powers[3]
        )
    }
}

/// Acknowledgement of an inventory command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InventorySummary {
    pub antenna: u8,
    pub tag_count: u16,
    pub read_rate: u16,
    pub total_read: u32,
}

/// Errors that can occur during RFID operations
#[derive(Debug, thiserror::Error)]
pub enum RfidError {
    /// Transport layer error (serial, mock, ...)
    #[error("transport error: {0}")]
    Transport(String),
    /// Invalid parameter passed to a function
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The reader answered with an error status
    #[error("reader error: {0}")]
    Device(#[from] DeviceError),
    #[error("reader is not initialized")]
    NotInitialized,
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Convert bytes to uppercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
