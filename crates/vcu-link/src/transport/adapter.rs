//! Byte channel trait

use async_trait::async_trait;
use bytes::Bytes;

use super::TransportError;

/// Duplex byte stream to a serial CAN adapter
///
/// This trait abstracts the physical link (USB serial, WiFi socket, radio
/// characteristic, ...). The core needs nothing beyond raw writes and reads:
/// no flow control, no framing.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write raw bytes to the adapter
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read the next chunk of bytes from the adapter
    ///
    /// Returns `Ok(None)` at end of stream. Implementations must be
    /// cancel-safe: dropping the future before it completes must not lose
    /// bytes, because callers race reads against timeouts.
    async fn read(&self) -> Result<Option<Bytes>, TransportError>;

    /// Close the channel, releasing the underlying handle
    async fn close(&self) -> Result<(), TransportError>;

    /// Human-readable description of the link, for logs
    fn describe(&self) -> String;
}
