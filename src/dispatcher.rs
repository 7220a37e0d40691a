//! Byte-stream reassembly.
//!
//! The reader sends length-prefixed frames with no delimiter, so the
//! dispatcher keeps a small buffer, realigns on the header byte after noise,
//! and decodes a frame as soon as its declared length has arrived.

use log::{debug, error, warn};

use crate::command::{CommandId, DeviceError, WorkAntenna, frequency_mhz};
use crate::frame::{Frame, HEADER, MIN_FRAME_LEN};
use crate::protocol::{self, ResponseHandler};
use crate::types::{AntennaSettings, InventorySummary, TagRead, bytes_to_hex};

/// Session state derived from decoded responses
#[derive(Debug, Default)]
pub struct Session {
    antenna_settings: AntennaSettings,
    tag_count: u16,
    is_error: bool,
    last_error: Option<(CommandId, DeviceError)>,
    firmware: Option<(u8, u8)>,
    work_antenna: Option<WorkAntenna>,
    last_inventory: Option<InventorySummary>,
    tag_reads: Vec<(CommandId, TagRead)>,
}

impl Session {
    pub fn antenna_settings(&self) -> AntennaSettings {
        self.antenna_settings
    }

    /// Tag count announced by the last buffer-count response
    pub fn tag_count(&self) -> u16 {
        self.tag_count
    }

    pub fn set_tag_count(&mut self, count: u16) {
        self.tag_count = count;
    }

    /// Whether the last decoded response was an error
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn take_last_error(&mut self) -> Option<(CommandId, DeviceError)> {
        self.last_error.take()
    }

    pub fn firmware(&self) -> Option<(u8, u8)> {
        self.firmware
    }

    pub fn work_antenna(&self) -> Option<WorkAntenna> {
        self.work_antenna
    }

    pub fn last_inventory(&self) -> Option<InventorySummary> {
        self.last_inventory
    }

    /// Tag records decoded since the last call
    pub fn take_tag_reads(&mut self) -> Vec<(CommandId, TagRead)> {
        std::mem::take(&mut self.tag_reads)
    }
}

impl ResponseHandler for Session {
    fn on_error(&mut self, cmd: CommandId, err: DeviceError) {
        self.is_error = true;
        self.last_error = Some((cmd, err));
    }

    fn on_reset(&mut self) {
        self.is_error = false;
    }

    fn on_set_uart_baudrate(&mut self) {
        self.is_error = false;
    }

    fn on_firmware_version(&mut self, major: u8, minor: u8) {
        self.is_error = false;
        debug!("firmware version {}.{}", major, minor);
        self.firmware = Some((major, minor));
    }

    fn on_set_work_antenna(&mut self) {
        self.is_error = false;
    }

    fn on_work_antenna(&mut self, antenna: WorkAntenna) {
        self.is_error = false;
        self.work_antenna = Some(antenna);
    }

    fn on_set_output_power(&mut self) {
        self.is_error = false;
    }

    fn on_output_power(&mut self, powers: [u8; WorkAntenna::COUNT]) {
        self.is_error = false;
        self.antenna_settings.powers = powers;
    }

    fn on_set_frequency_region(&mut self) {
        self.is_error = false;
    }

    fn on_frequency_region(&mut self, region: u8, start: u8, end: u8) {
        self.is_error = false;
        debug!(
            "frequency region {} [{} MHz .. {} MHz]",
            region,
            frequency_mhz(start),
            frequency_mhz(end)
        );
        self.antenna_settings.region = region;
        self.antenna_settings.start_frequency = start;
        self.antenna_settings.end_frequency = end;
    }

    fn on_inventory(&mut self, summary: InventorySummary) {
        self.is_error = false;
        self.last_inventory = Some(summary);
    }

    fn on_read(&mut self, tag: TagRead) {
        self.is_error = false;
        self.tag_reads.push((CommandId::Read, tag));
    }

    fn on_buffered_tag(&mut self, cmd: CommandId, tag: TagRead) {
        self.is_error = false;
        self.tag_reads.push((cmd, tag));
    }

    fn on_inventory_buffer_tag_count(&mut self, count: u16) {
        self.is_error = false;
        self.tag_count = count;
    }

    fn on_reset_inventory_buffer(&mut self) {
        self.is_error = false;
    }
}

/// Turns a raw byte stream into dispatched responses
#[derive(Debug, Default)]
pub struct StreamDispatcher {
    buffer: Vec<u8>,
    session: Session,
}

impl StreamDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Bytes received but not yet part of a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Accept one byte; returns the command answered by the frame it
    /// completed, if any
    pub fn push(&mut self, byte: u8) -> Option<CommandId> {
        self.buffer.push(byte);
        loop {
            if self.buffer.len() < MIN_FRAME_LEN {
                return None;
            }

            if self.buffer[0] != HEADER {
                let skip = self
                    .buffer
                    .iter()
                    .position(|&b| b == HEADER)
                    .unwrap_or(self.buffer.len());
                warn!("Discarding noise: {}", bytes_to_hex(&self.buffer[..skip]));
                self.buffer.drain(..skip);
                continue;
            }

            let size = self.buffer[1] as usize + 2;
            if size < MIN_FRAME_LEN {
                // A stray header byte; resync on the next one
                error!("Bad frame length: {}", bytes_to_hex(&self.buffer[..2]));
                self.buffer.remove(0);
                continue;
            }
            if self.buffer.len() < size {
                return None;
            }

            let raw: Vec<u8> = self.buffer.drain(..size).collect();
            match Frame::decode(&raw) {
                Some(frame) => return protocol::dispatch(&frame, &mut self.session),
                None => error!("Corrupt frame: {}", bytes_to_hex(&raw)),
            }
        }
    }

    /// Push a chunk of bytes, collecting every dispatched command
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CommandId> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BROADCAST_ADDRESS;

    fn frame(cmd: CommandId, payload: &[u8]) -> Vec<u8> {
        Frame::new(BROADCAST_ADDRESS, cmd as u8, payload).as_bytes().to_vec()
    }

    #[test]
    fn test_trailing_bytes_kept_for_next_frame() {
        let mut d = StreamDispatcher::new();
        let mut bytes = frame(CommandId::GetInventoryBufferTagCount, &[0x00, 0x03]);
        bytes.extend(frame(CommandId::ResetInventoryBuffer, &[0x10]));
        assert_eq!(
            d.feed(&bytes),
            vec![CommandId::GetInventoryBufferTagCount, CommandId::ResetInventoryBuffer]
        );
        assert_eq!(d.session().tag_count(), 3);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_stray_header_does_not_swallow_next_frame() {
        let mut d = StreamDispatcher::new();
        let mut bytes = vec![HEADER, 0x00];
        bytes.extend(frame(CommandId::GetOutputPower, &[0x1E]));
        assert_eq!(d.feed(&bytes), vec![CommandId::GetOutputPower]);
        assert_eq!(d.session().antenna_settings().powers, [0x1E; 4]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_frame_after_corrupt_frame_is_decoded() {
        let mut d = StreamDispatcher::new();
        let mut bytes = frame(CommandId::GetOutputPower, &[0x1E]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        bytes.extend(frame(CommandId::GetInventoryBufferTagCount, &[0x00, 0x02]));
        assert_eq!(d.feed(&bytes), vec![CommandId::GetInventoryBufferTagCount]);
        assert_eq!(d.session().tag_count(), 2);
    }

    #[test]
    fn test_corrupt_frame_dropped() {
        let mut d = StreamDispatcher::new();
        let mut bytes = frame(CommandId::GetOutputPower, &[0x1E]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(d.feed(&bytes).is_empty());
        assert_eq!(d.buffered(), 0);

        assert_eq!(d.feed(&frame(CommandId::GetOutputPower, &[0x1E])), vec![CommandId::GetOutputPower]);
        assert_eq!(d.session().antenna_settings().powers, [0x1E; 4]);
    }

    #[test]
    fn test_error_flag_follows_last_response() {
        let mut d = StreamDispatcher::new();
        d.feed(&frame(CommandId::SetWorkAntenna, &[0x47]));
        assert!(d.session().is_error());
        assert_eq!(
            d.session_mut().take_last_error(),
            Some((CommandId::SetWorkAntenna, DeviceError(0x47)))
        );
        d.feed(&frame(CommandId::SetWorkAntenna, &[0x10]));
        assert!(!d.session().is_error());
    }

    #[test]
    fn test_frequency_region_updates_settings() {
        let mut d = StreamDispatcher::new();
        d.feed(&frame(CommandId::GetFrequencyRegion, &[0x01, 0x07, 0x3B]));
        let settings = d.session().antenna_settings();
        assert_eq!(settings.region, 0x01);
        assert_eq!(settings.start_frequency, 0x07);
        assert_eq!(settings.end_frequency, 0x3B);
    }
}
