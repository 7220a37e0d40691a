//! UHF RFID reader protocol and inventory engine for a cooling unit.
//!
//! The reader speaks a length-prefixed binary protocol (`0xA0` header,
//! two's-complement checksum) over a serial link. This crate encodes the
//! requests, reassembles and decodes the responses, and runs inventory cycles
//! on background threads to work out which tagged products are inside.
//!
//! # Features
//!
//! - `serial` - Serial port transport for desktop using serialport crate
//! - `serde` - Serialize/Deserialize for [`EngineConfig`] and [`AntennaSettings`]
//! - `cli` - the `rfid-reader` bench tool
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use robocooler_rfid::{EngineConfig, InventoryEngine, LogObserver};
//!
//! let engine = InventoryEngine::open("/dev/ttyUSB0", Arc::new(LogObserver), EngineConfig::default());
//! engine.start_continuous(true)?;
//! // door closes
//! engine.stop_inventory();
//! ```

mod command;
mod config;
mod dispatcher;
mod engine;
mod frame;
mod notify;
mod pending;
mod protocol;
mod tags;
mod transport;
mod types;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use command::{
    Baudrate, CommandId, DeviceError, ErrorCode, MAX_FREQUENCY_CODE, MAX_OUTPUT_POWER, MemBank,
    SpectrumRegion, WorkAntenna, frequency_mhz,
};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use dispatcher::{Session, StreamDispatcher};
pub use engine::{ControlEvent, InventoryEngine};
pub use frame::{BROADCAST_ADDRESS, Frame, HEADER, checksum};
pub use notify::{InventoryObserver, LogObserver};
pub use pending::{PendingCommands, WaitOutcome, Waiter};
pub use protocol::{
    ReaderCommands, ResponseHandler, clamp_output_power, dispatch, normalize_frequency_region,
};
pub use tags::{TagDiff, TagStore};
pub use transport::RfidTransport;
pub use types::{AntennaSettings, InventorySummary, RfidError, TagRead};

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
