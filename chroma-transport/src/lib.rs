//! USB-HID report transport for Razer Chroma peripherals.
//!
//! This crate owns the wire layer shared by every device model:
//!
//! - raw HID endpoint access ([`hid`])
//! - the 90-byte request/response framing, CRC, pacing, and the
//!   retry/timeout state machine ([`report`])
//! - the quirk-driven protocol selector ([`protocol`])
//! - the static command catalog ([`commands`])
//!
//! Device semantics (hardware database, LED/FX managers, the animation
//! pipeline) live in the `chroma_driver` crate on top of this one.

pub mod commands;
pub mod error;
pub mod hid;
pub mod protocol;
pub mod report;
pub mod types;

pub use commands::CommandDef;
pub use error::TransportError;
pub use hid::{enumerate, DeviceInfo, FeatureEndpoint, HidAdapter};
pub use protocol::{protocol_config_from, transaction_id, uses_extended_fx, ProtocolConfig, ProtocolVersion};
pub use report::{crc, run_report, ByteArgs, Pacing, RazerReport, Status, CMD_DELAY};
pub use types::{LedType, Quirk, NOSTORE, VARSTORE};
