//! TCP channel for WiFi CAN adapters
//!
//! WiFi adapters expose the same byte stream as their USB siblings on a TCP
//! port (35000 is the usual default for AT-style dongles).

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Channel, TransportError};
use crate::config::TcpConfig;

const READ_CHUNK: usize = 512;

pub struct TcpChannel {
    peer: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpChannel {
    pub async fn connect(config: &TcpConfig) -> Result<Self, TransportError> {
        let peer = format!("{}:{}", config.host, config.port);
        let connect = TcpStream::connect(&peer);

        let stream = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .map_err(|_| TransportError::Timeout(format!("connecting to {}", peer)))?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", peer, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set nodelay: {}", e)))?;

        info!(%peer, "TCP channel connected");

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            peer,
            reader: Mutex::new(Some(read_half)),
            writer: Mutex::new(Some(write_half)),
        })
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn read(&self) -> Result<Option<Bytes>, TransportError> {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };

        let mut buf = BytesMut::zeroed(READ_CHUNK);
        // `read` on a TcpStream half is cancel-safe
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

        if n == 0 {
            debug!(peer = %self.peer, "TCP channel reached end of stream");
            return Ok(None);
        }

        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // The read half may be held by an in-flight read; it drops with the channel.
        info!(peer = %self.peer, "TCP channel closed");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
