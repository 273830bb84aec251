//! Transport layer for adapter communication
//!
//! This module provides byte channels to serial CAN adapters:
//! - TCP channel for WiFi adapters
//! - Mock channel for testing
//!
//! Serial-port and radio bindings live outside this crate; they only need to
//! implement [`Channel`].
//!
//! # Example
//!
//! ```ignore
//! use vcu_link::transport::{create_channel, Channel};
//! use vcu_link::config::TransportConfig;
//!
//! let config = TransportConfig::Mock(Default::default());
//! let channel = create_channel(&config).await?;
//! channel.write(b"ATI\r").await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod tcp;

pub use adapter::Channel;
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a channel based on configuration
pub async fn create_channel(config: &TransportConfig) -> Result<Arc<dyn Channel>, TransportError> {
    match config {
        TransportConfig::Tcp(cfg) => {
            let channel = tcp::TcpChannel::connect(cfg).await?;
            Ok(Arc::new(channel))
        }
        TransportConfig::Mock(cfg) => {
            let channel = mock::MockChannel::new(cfg);
            Ok(Arc::new(channel))
        }
    }
}
