//! Link errors

use thiserror::Error;

use crate::firmware::FlashError;
use crate::polling::PollingError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Top-level error for link operations
#[derive(Debug, Error)]
pub enum LinkError {
    /// Channel I/O failed or the channel is gone
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Detection finished without a supported dialect
    #[error("No supported adapter detected")]
    UnsupportedAdapter,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Polling error: {0}")]
    Polling(#[from] PollingError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    /// A firmware transfer owns the channel
    #[error("Firmware transfer in progress")]
    TransferInProgress,
}
