//! Serial CAN adapter dialects
//!
//! Two adapter families are supported:
//! - **CommandStyle**: AT-command adapters (ELM327 and clones). Requests are
//!   a header-select command followed by the payload; replies are hex text.
//! - **FrameStyle**: slcan/Lawicel adapters. Every frame is one ASCII line
//!   `t<id><len><data>`.
//!
//! The dialect is detected once per connection ([`detect`]) and resolved to a
//! [`FrameCodec`] that handles both directions for the connection lifetime.

pub mod codec;
pub mod detect;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::{codec_for, CommandStyleCodec, DecodeOutcome, FrameCodec, FrameStyleCodec};
pub use detect::detect;

use crate::transport::TransportError;

/// Adapter dialect spoken on a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterType {
    CommandStyle,
    FrameStyle,
    #[default]
    Unknown,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CommandStyle => "command-style (AT)",
            Self::FrameStyle => "frame-style (slcan)",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Frame construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid CAN id '{0}': expected 3 hex digits up to 7FF")]
    InvalidCanId(String),

    #[error("Invalid hex data '{0}'")]
    InvalidHex(String),

    #[error("Frame data too long: {0} bytes (max 8)")]
    TooLong(usize),
}

impl From<FrameError> for TransportError {
    fn from(err: FrameError) -> Self {
        TransportError::InvalidFrame(err.to_string())
    }
}

/// 11-bit CAN identifier, written as 3 hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanId(u16);

impl CanId {
    pub const MAX: u16 = 0x7FF;

    pub fn new(raw: u16) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

impl FromStr for CanId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FrameError::InvalidCanId(s.to_string()));
        }
        u16::from_str_radix(trimmed, 16)
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| FrameError::InvalidCanId(s.to_string()))
    }
}

impl TryFrom<String> for CanId {
    type Error = FrameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CanId> for String {
    fn from(id: CanId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}", self.0)
    }
}

/// Classic CAN frame: identifier plus up to 8 data bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanFrame {
    pub id: CanId,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub const MAX_DATA: usize = 8;

    pub fn new(id: CanId, data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() > Self::MAX_DATA {
            return Err(FrameError::TooLong(data.len()));
        }
        Ok(Self { id, data })
    }

    /// Build a frame from a hex payload (case-insensitive, even length)
    pub fn from_hex(id: CanId, data_hex: &str) -> Result<Self, FrameError> {
        Self::new(id, decode_hex(data_hex)?)
    }

    /// Payload as uppercase hex
    pub fn data_hex(&self) -> String {
        hex::encode_upper(&self.data)
    }

    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.id, self.dlc(), self.data_hex())
    }
}

/// Decode a hex string that must have an even number of digits
pub(crate) fn decode_hex(data_hex: &str) -> Result<Vec<u8>, FrameError> {
    hex::decode(data_hex.trim()).map_err(|_| FrameError::InvalidHex(data_hex.to_string()))
}
