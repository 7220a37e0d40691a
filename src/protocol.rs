//! Request encoders and response decoders for the reader command set.
//!
//! Encoders never reject their input: out-of-range power and frequency values
//! are replaced by values the firmware accepts (see [`clamp_output_power`] and
//! [`normalize_frequency_region`]). Decoders check the response size for each
//! command and hand the result to a [`ResponseHandler`]; anything unexpected is
//! reported through [`ResponseHandler::on_error`] instead of being partially
//! decoded.

use log::{debug, error, trace, warn};

use crate::command::{
    Baudrate, CommandId, DEFAULT_FREQUENCY_RANGE, DeviceError, ErrorCode, MAX_FREQUENCY_CODE,
    MAX_OUTPUT_POWER, MemBank, SpectrumRegion, WorkAntenna,
};
use crate::frame::Frame;
use crate::types::{InventorySummary, TagRead, bytes_to_hex};

/// Data length of a response that carries only a status byte
const STATUS_ONLY_LEN: u8 = 4;

/// Replace a power level the reader would refuse with 0
pub fn clamp_output_power(power: u8) -> u8 {
    if power <= MAX_OUTPUT_POWER { power } else { 0x00 }
}

/// Normalize a frequency region request.
///
/// An unknown region becomes ETSI. A range with a code above
/// [`MAX_FREQUENCY_CODE`] or with `end < start` becomes
/// [`DEFAULT_FREQUENCY_RANGE`].
pub fn normalize_frequency_region(region: u8, start: u8, end: u8) -> (SpectrumRegion, u8, u8) {
    let region = SpectrumRegion::from_u8(region).unwrap_or(SpectrumRegion::Etsi);
    if end < start || start > MAX_FREQUENCY_CODE || end > MAX_FREQUENCY_CODE {
        let (start, end) = DEFAULT_FREQUENCY_RANGE;
        return (region, start, end);
    }
    (region, start, end)
}

/// Builds request frames addressed to one reader
#[derive(Debug, Clone, Copy)]
pub struct ReaderCommands {
    address: u8,
}

impl ReaderCommands {
    pub fn new(address: u8) -> Self {
        Self { address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn frame(&self, cmd: CommandId, payload: &[u8]) -> Frame {
        let frame = Frame::new(self.address, cmd as u8, payload);
        debug!("{} -> {}", cmd, frame.to_hex());
        frame
    }

    pub fn reset(&self) -> Frame {
        self.frame(CommandId::Reset, &[])
    }

    pub fn set_uart_baudrate(&self, baudrate: Baudrate) -> Frame {
        self.frame(CommandId::SetUartBaudrate, &[baudrate as u8])
    }

    pub fn get_firmware_version(&self) -> Frame {
        self.frame(CommandId::GetFirmwareVersion, &[])
    }

    pub fn set_work_antenna(&self, antenna: WorkAntenna) -> Frame {
        self.frame(CommandId::SetWorkAntenna, &[antenna as u8])
    }

    pub fn get_work_antenna(&self) -> Frame {
        self.frame(CommandId::GetWorkAntenna, &[])
    }

    /// Per-antenna output power, each value clamped to the accepted range
    pub fn set_output_power(&self, powers: [u8; WorkAntenna::COUNT]) -> Frame {
        self.frame(CommandId::SetOutputPower, &powers.map(clamp_output_power))
    }

    pub fn get_output_power(&self) -> Frame {
        self.frame(CommandId::GetOutputPower, &[])
    }

    pub fn set_frequency_region(&self, region: u8, start: u8, end: u8) -> Frame {
        let (region, start, end) = normalize_frequency_region(region, start, end);
        self.frame(CommandId::SetFrequencyRegion, &[region as u8, start, end])
    }

    pub fn get_frequency_region(&self) -> Frame {
        self.frame(CommandId::GetFrequencyRegion, &[])
    }

    /// Start an inventory round on the work antenna; `repeat` is the number of
    /// anti-collision rounds (0xFF lets the reader pick)
    pub fn inventory(&self, repeat: u8) -> Frame {
        self.frame(CommandId::Inventory, &[repeat])
    }

    pub fn read(&self, bank: MemBank, word_address: u8, word_count: u8) -> Frame {
        self.frame(CommandId::Read, &[bank as u8, word_address, word_count])
    }

    pub fn get_inventory_buffer(&self) -> Frame {
        self.frame(CommandId::GetInventoryBuffer, &[])
    }

    pub fn get_and_reset_inventory_buffer(&self) -> Frame {
        self.frame(CommandId::GetAndResetInventoryBuffer, &[])
    }

    pub fn get_inventory_buffer_tag_count(&self) -> Frame {
        self.frame(CommandId::GetInventoryBufferTagCount, &[])
    }

    pub fn reset_inventory_buffer(&self) -> Frame {
        self.frame(CommandId::ResetInventoryBuffer, &[])
    }
}

impl Default for ReaderCommands {
    fn default() -> Self {
        Self::new(crate::frame::BROADCAST_ADDRESS)
    }
}

/// Receives decoded responses.
///
/// Every method has an empty default so implementors only pick the responses
/// they care about.
#[allow(unused_variables)]
pub trait ResponseHandler {
    /// The reader answered `cmd` with a non-success status, or with a payload
    /// that does not fit the response layout
    fn on_error(&mut self, cmd: CommandId, err: DeviceError) {}

    fn on_reset(&mut self) {}

    fn on_set_uart_baudrate(&mut self) {}

    fn on_firmware_version(&mut self, major: u8, minor: u8) {}

    fn on_set_work_antenna(&mut self) {}

    fn on_work_antenna(&mut self, antenna: WorkAntenna) {}

    fn on_set_output_power(&mut self) {}

    fn on_output_power(&mut self, powers: [u8; WorkAntenna::COUNT]) {}

    fn on_set_frequency_region(&mut self) {}

    fn on_frequency_region(&mut self, region: u8, start: u8, end: u8) {}

    fn on_inventory(&mut self, summary: InventorySummary) {}

    fn on_read(&mut self, tag: TagRead) {}

    /// One record streamed by `GetInventoryBuffer` or
    /// `GetAndResetInventoryBuffer`
    fn on_buffered_tag(&mut self, cmd: CommandId, tag: TagRead) {}

    fn on_inventory_buffer_tag_count(&mut self, count: u16) {}

    fn on_reset_inventory_buffer(&mut self) {}
}

/// Decode `frame` and call the matching handler method.
///
/// Returns the command the frame answered, or `None` for opcodes outside the
/// supported set.
pub fn dispatch<H: ResponseHandler + ?Sized>(frame: &Frame, handler: &mut H) -> Option<CommandId> {
    let cmd = match CommandId::try_from(frame.command()) {
        Ok(cmd) => cmd,
        Err(code) => {
            warn!("Undeclared recv command: {:#04x}", code);
            return None;
        }
    };
    trace!("{} <- {}", cmd, frame.to_hex());

    match cmd {
        CommandId::Reset => on_status(frame, cmd, handler, |h| h.on_reset()),
        CommandId::SetUartBaudrate => on_status(frame, cmd, handler, |h| h.on_set_uart_baudrate()),
        CommandId::SetWorkAntenna => on_status(frame, cmd, handler, |h| h.on_set_work_antenna()),
        CommandId::SetOutputPower => on_status(frame, cmd, handler, |h| h.on_set_output_power()),
        CommandId::SetFrequencyRegion => {
            on_status(frame, cmd, handler, |h| h.on_set_frequency_region())
        }
        CommandId::ResetInventoryBuffer => {
            on_status(frame, cmd, handler, |h| h.on_reset_inventory_buffer())
        }
        CommandId::GetFirmwareVersion => match frame.payload() {
            [major, minor] => handler.on_firmware_version(*major, *minor),
            _ => wrong_size(frame, cmd, handler),
        },
        CommandId::GetWorkAntenna => match frame.payload() {
            [id] => match WorkAntenna::try_from(*id) {
                Ok(antenna) => handler.on_work_antenna(antenna),
                Err(code) => fail(cmd, DeviceError(code), handler),
            },
            _ => wrong_size(frame, cmd, handler),
        },
        CommandId::GetOutputPower => match frame.payload() {
            [all] => handler.on_output_power([*all; WorkAntenna::COUNT]),
            [p1, p2, p3, p4] => handler.on_output_power([*p1, *p2, *p3, *p4]),
            _ => wrong_size(frame, cmd, handler),
        },
        CommandId::GetFrequencyRegion => match frame.payload() {
            [region, start, end] => handler.on_frequency_region(*region, *start, *end),
            _ => wrong_size(frame, cmd, handler),
        },
        CommandId::GetInventoryBufferTagCount => match frame.payload() {
            [hi, lo] => handler.on_inventory_buffer_tag_count(u16::from_be_bytes([*hi, *lo])),
            _ => wrong_size(frame, cmd, handler),
        },
        CommandId::Inventory => {
            if frame.data_len() == STATUS_ONLY_LEN {
                status_error(frame, cmd, handler);
            } else {
                match parse_inventory_summary(frame.payload()) {
                    Some(summary) => handler.on_inventory(summary),
                    None => fail(cmd, DeviceError::COMMAND_FAIL, handler),
                }
            }
        }
        CommandId::Read => {
            if frame.data_len() == STATUS_ONLY_LEN {
                status_error(frame, cmd, handler);
            } else {
                match parse_read_record(frame.payload()) {
                    Some(tag) => handler.on_read(tag),
                    None => fail(cmd, DeviceError::COMMAND_FAIL, handler),
                }
            }
        }
        CommandId::GetInventoryBuffer | CommandId::GetAndResetInventoryBuffer => {
            if frame.data_len() == STATUS_ONLY_LEN {
                status_error(frame, cmd, handler);
            } else {
                match parse_buffer_record(frame.payload()) {
                    Some(tag) => handler.on_buffered_tag(cmd, tag),
                    None => fail(cmd, DeviceError::COMMAND_FAIL, handler),
                }
            }
        }
        CommandId::AllTagsReceived => {
            warn!("{} is never sent by the reader", cmd);
            return None;
        }
    }

    Some(cmd)
}

fn fail<H: ResponseHandler + ?Sized>(cmd: CommandId, err: DeviceError, handler: &mut H) {
    error!("{}: {}", cmd, err);
    handler.on_error(cmd, err);
}

fn status_error<H: ResponseHandler + ?Sized>(frame: &Frame, cmd: CommandId, handler: &mut H) {
    let err = frame.status().map(DeviceError).unwrap_or(DeviceError::COMMAND_FAIL);
    fail(cmd, err, handler);
}

/// A get-type response of the wrong size: a lone byte is the reader's status,
/// anything else is reported as a generic failure
fn wrong_size<H: ResponseHandler + ?Sized>(frame: &Frame, cmd: CommandId, handler: &mut H) {
    let err = match frame.payload() {
        [code] => DeviceError(*code),
        _ => DeviceError::COMMAND_FAIL,
    };
    fail(cmd, err, handler);
}

fn on_status<H, F>(frame: &Frame, cmd: CommandId, handler: &mut H, ok: F)
where
    H: ResponseHandler + ?Sized,
    F: FnOnce(&mut H),
{
    match frame.status() {
        Some(code) if code == ErrorCode::CommandSuccess as u8 => ok(handler),
        _ => status_error(frame, cmd, handler),
    }
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

fn be32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// `ant, tag_count(2), read_rate(2), total_read(4)`
pub(crate) fn parse_inventory_summary(payload: &[u8]) -> Option<InventorySummary> {
    Some(InventorySummary {
        antenna: *payload.first()?,
        tag_count: be16(payload, 1)?,
        read_rate: be16(payload, 3)?,
        total_read: be32(payload, 5)?,
    })
}

/// `count(2), data_len, pc(2), epc(data_len - 4), crc(2), rssi, freq_ant, inv_count`
pub(crate) fn parse_buffer_record(payload: &[u8]) -> Option<TagRead> {
    let tag_count = be16(payload, 0)?;
    let epc_len = (*payload.get(2)? as usize).checked_sub(4)?;
    let pc = be16(payload, 3)?;
    let epc = payload.get(5..5 + epc_len)?.to_vec();
    let crc = be16(payload, 5 + epc_len)?;
    let rssi = *payload.get(epc_len + 7)?;
    let freq_ant = *payload.get(epc_len + 8)?;
    let inventory_count = *payload.get(epc_len + 9)?;

    let tag = TagRead {
        tag_count,
        pc,
        epc,
        crc,
        rssi,
        antenna: freq_ant & 0x03,
        frequency: freq_ant & 0xFC,
        inventory_count,
        ..TagRead::default()
    };
    trace!(
        "tag {} count={} rssi={} ant={} inv={}",
        tag.epc_hex(),
        tag.tag_count,
        tag.rssi,
        tag.antenna,
        tag.inventory_count
    );
    Some(tag)
}

/// `count(2), data_len, pc(2), epc, crc(2), data(read_len), read_len, freq_ant, read_count`
///
/// `data_len` covers PC, EPC, CRC and the read data, so the EPC length is
/// `data_len - read_len - 4`.
pub(crate) fn parse_read_record(payload: &[u8]) -> Option<TagRead> {
    let len = payload.len();
    let tag_count = be16(payload, 0)?;
    let data_len = *payload.get(2)? as usize;
    let read_len = *payload.get(len.checked_sub(3)?)? as usize;
    let freq_ant = payload[len - 2];
    let read_count = payload[len - 1];
    let epc_len = data_len.checked_sub(read_len + 4)?;

    let pc = be16(payload, 3)?;
    let epc = payload.get(5..5 + epc_len)?.to_vec();
    let crc = be16(payload, 5 + epc_len)?;
    let data = payload.get(epc_len + 7..epc_len + 7 + read_len)?.to_vec();

    trace!("read {} data={}", bytes_to_hex(&epc), bytes_to_hex(&data));
    Some(TagRead {
        tag_count,
        pc,
        epc,
        crc,
        data,
        antenna: freq_ant & 0x03,
        frequency: freq_ant & 0xFC,
        read_count,
        ..TagRead::default()
    })
}
