//! vcu-link - CAN adapter link for vehicle control units
//!
//! This crate talks to a vehicle control unit through a serial CAN adapter:
//! it detects the adapter dialect, polls parameters with UDS
//! read-by-identifier requests and pushes firmware through the target's
//! block-transfer bootloader.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Session                             │
//! │                                                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │  │PollingEngine │   │FirmwareTrans.│   │ParameterReg.   │   │
//! │  │ (correlator) │   │ (bootloader) │   │ (parsers)      │   │
//! │  └──────┬───────┘   └──────┬───────┘   └────────────────┘   │
//! │         │   FrameSink      │                                │
//! │         └────────┬─────────┘                                │
//! │            ┌─────┴──────┐       reader task                 │
//! │            │ FrameCodec │ <── LineReassembler               │
//! │            │ (AT/slcan) │                                   │
//! │            └─────┬──────┘                                   │
//! │            ┌─────┴──────┐                                   │
//! │            │  Channel   │                                   │
//! │            │ (TCP/mock) │                                   │
//! │            └────────────┘                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod firmware;
pub mod framing;
pub mod polling;
pub mod registry;
pub mod session;
pub mod transport;
pub mod uds;

pub use adapter::{AdapterType, CanFrame, CanId, DecodeOutcome, FrameCodec};
pub use config::LinkConfig;
pub use error::LinkError;
pub use firmware::{DeviceToken, FirmwareReport, FlashError, FlashState, ProgressSink};
pub use polling::{PollingEngine, PollingError, UpdateSink};
pub use registry::{ParameterRegistry, ParameterSpec, ParseError, RequestDescriptor};
pub use session::{FrameSink, Session};
pub use transport::{create_channel, Channel, TransportError};
pub use uds::CorrelationKey;
