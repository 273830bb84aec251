//! Link configuration
//!
//! This module contains configuration types for the adapter link,
//! including transport, detection, adapter pacing, polling and firmware
//! transfer settings. Every section has defaults, so an empty TOML document
//! is a valid (mock transport) configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Configuration for an adapter link
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
    /// Adapter detection handshake
    #[serde(default)]
    pub detect: DetectConfig,
    /// Adapter pacing and CAN settings
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Periodic polling
    #[serde(default)]
    pub polling: PollingConfig,
    /// Bootloader block transfer
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

impl LinkConfig {
    /// Parse a configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, LinkError> {
        toml::from_str(content).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// WiFi adapter reachable over TCP
    Tcp(TcpConfig),
    /// Mock transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

impl TransportConfig {
    /// Line framing discipline of the configured channel
    pub fn reassembly(&self) -> ReassemblyMode {
        match self {
            Self::Tcp(cfg) => cfg.reassembly,
            Self::Mock(cfg) => cfg.reassembly,
        }
    }
}

/// How inbound bytes are cut into response lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyMode {
    /// Split on CR, LF or CRLF
    #[default]
    Lines,
    /// Buffer until the `>` end-of-reply marker (radio-style links)
    Prompt,
}

/// TCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Adapter IP address or hostname
    pub host: String,
    /// Adapter TCP port
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub reassembly: ReassemblyMode,
}

fn default_tcp_port() -> u16 {
    35000
}

fn default_connect_timeout() -> u64 {
    5000
}

/// Which adapter the mock channel pretends to be
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockDialect {
    #[default]
    CommandStyle,
    FrameStyle,
    /// Never answers anything
    Silent,
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub dialect: MockDialect,
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub reassembly: ReassemblyMode,
}

// =============================================================================
// Protocol Configuration
// =============================================================================

/// Adapter detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Upper bound for each handshake step, in milliseconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    /// Silence after a CR-terminated reply that ends a step, in milliseconds
    #[serde(default = "default_quiet")]
    pub quiet_ms: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout(),
            quiet_ms: default_quiet(),
        }
    }
}

impl DetectConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }
}

fn default_step_timeout() -> u64 {
    1500
}

fn default_quiet() -> u64 {
    150
}

/// Adapter pacing and CAN bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Delay between the header-select and payload writes of the AT dialect
    #[serde(default = "default_inter_write_delay")]
    pub inter_write_delay_ms: u64,
    /// CAN bus bitrate used when opening a slcan adapter
    #[serde(default = "default_bitrate")]
    pub can_bitrate: u32,
    /// Reassembly buffer limit in bytes
    #[serde(default = "default_max_line_buffer")]
    pub max_line_buffer: usize,
    /// Capacity of the decoded-frame broadcast channel
    #[serde(default = "default_frame_channel_capacity")]
    pub frame_channel_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            inter_write_delay_ms: default_inter_write_delay(),
            can_bitrate: default_bitrate(),
            max_line_buffer: default_max_line_buffer(),
            frame_channel_capacity: default_frame_channel_capacity(),
        }
    }
}

impl AdapterConfig {
    pub fn inter_write_delay(&self) -> Duration {
        Duration::from_millis(self.inter_write_delay_ms)
    }
}

fn default_inter_write_delay() -> u64 {
    10
}

fn default_bitrate() -> u32 {
    500000
}

fn default_max_line_buffer() -> usize {
    4096
}

fn default_frame_channel_capacity() -> usize {
    256
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// One-time offset between the first sends of consecutive groups
    #[serde(default = "default_stagger")]
    pub stagger_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            stagger_ms: default_stagger(),
        }
    }
}

fn default_stagger() -> u64 {
    50
}

/// Bootloader block transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// CAN id the bootloader listens on (3 hex digits)
    #[serde(default = "default_firmware_can_id")]
    pub request_can_id: String,
    /// Wait after the wake sequence for the target to reboot
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Pacing between blocks
    #[serde(default = "default_block_delay")]
    pub block_delay_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            request_can_id: default_firmware_can_id(),
            settle_ms: default_settle(),
            block_delay_ms: default_block_delay(),
        }
    }
}

impl FirmwareConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn block_delay(&self) -> Duration {
        Duration::from_millis(self.block_delay_ms)
    }
}

fn default_firmware_can_id() -> String {
    "7E0".to_string()
}

fn default_settle() -> u64 {
    5000
}

fn default_block_delay() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = LinkConfig::from_toml("").unwrap();

        assert!(matches!(config.transport, TransportConfig::Mock(_)));
        assert_eq!(config.detect.step_timeout_ms, 1500);
        assert_eq!(config.adapter.inter_write_delay_ms, 10);
        assert_eq!(config.polling.stagger_ms, 50);
        assert_eq!(config.firmware.settle_ms, 5000);
        assert_eq!(config.firmware.block_delay_ms, 20);
    }

    #[test]
    fn test_tcp_transport() {
        let config = LinkConfig::from_toml(
            r#"
            [transport]
            type = "tcp"
            host = "192.168.0.10"
            reassembly = "prompt"

            [firmware]
            request_can_id = "79B"
            "#,
        )
        .unwrap();

        match &config.transport {
            TransportConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "192.168.0.10");
                assert_eq!(tcp.port, 35000);
            }
            other => panic!("Expected TCP transport, got {:?}", other),
        }
        assert_eq!(config.transport.reassembly(), ReassemblyMode::Prompt);
        assert_eq!(config.firmware.request_can_id, "79B");
    }

    #[test]
    fn test_invalid_document_is_config_error() {
        let err = LinkConfig::from_toml("[transport]\ntype = \"serial\"").unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
