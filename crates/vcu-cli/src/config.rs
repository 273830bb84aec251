//! Configuration file handling for vcuctl

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vcu_link::config::{TcpConfig, TransportConfig};
use vcu_link::LinkConfig;

const DEFAULT_TCP_PORT: u16 = 35000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Adapter link settings
    #[serde(default)]
    pub link: LinkConfig,
    /// Parameter registry TOML file
    pub registry: Option<PathBuf>,
    /// Disable colored output
    pub no_color: Option<bool>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("vcuctl");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    ///
    /// A `--host` switches the transport to TCP; a lone `--port` only
    /// applies when the configured transport already is TCP.
    pub fn merge_with_args(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        registry: Option<&Path>,
        no_color: bool,
    ) -> MergedConfig {
        let mut link = self.link.clone();
        match (&mut link.transport, host) {
            (TransportConfig::Tcp(tcp), host) => {
                if let Some(host) = host {
                    tcp.host = host.to_string();
                }
                if let Some(port) = port {
                    tcp.port = port;
                }
            }
            (transport, Some(host)) => {
                *transport = TransportConfig::Tcp(TcpConfig {
                    host: host.to_string(),
                    port: port.unwrap_or(DEFAULT_TCP_PORT),
                    connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
                    reassembly: transport.reassembly(),
                });
            }
            (_, None) => {}
        }

        MergedConfig {
            link,
            registry: registry
                .map(Path::to_path_buf)
                .or_else(|| self.registry.clone()),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub link: LinkConfig,
    pub registry: Option<PathBuf>,
    pub no_color: bool,
}

impl MergedConfig {
    pub fn registry_path(&self) -> Result<&Path> {
        self.registry
            .as_deref()
            .context("No parameter registry configured; pass --registry or set `registry` in the config file")
    }
}
