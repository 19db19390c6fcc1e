//! CLI configuration file.
//!
//! ```toml
//! [relay]
//! url = "ws://127.0.0.1:4000"
//! port = 4000
//!
//! [transfer]
//! chunk_size = 65536
//! download_dir = "."
//!
//! [network]
//! listen_addr = "0.0.0.0:0"
//! ```

use anyhow::Context;
use flux_core::{ConnectionConfig, TransferConfig};
use flux_files::DEFAULT_CHUNK_SIZE;
use flux_signaling::relay::server::{DEFAULT_PORT, resolve_port};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted chunk size (16 MiB).
const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Relay server and client settings
    pub relay: RelayConfig,
    /// Transfer engine settings
    pub transfer: TransferSettings,
    /// Direct connection settings
    pub network: NetworkConfig,
}

/// `[relay]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay URL used by `send` and `receive`
    pub url: String,
    /// Port the `relay` command listens on; `PORT` overrides it
    pub port: u16,
    /// Seconds of heartbeat silence before a peer is dropped
    pub heartbeat_timeout_secs: u64,
    /// Seconds between heartbeat sweeps
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            port: DEFAULT_PORT,
            heartbeat_timeout_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

/// `[transfer]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSettings {
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Resume buffering once this many chunks are outstanding
    pub low_watermark_chunks: usize,
    /// Pause sending at this many outstanding chunks
    pub high_watermark_chunks: usize,
    /// Where received files go
    pub download_dir: String,
    /// Checkpoint directory; defaults to the platform data directory
    pub checkpoint_dir: Option<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_watermark_chunks: 8,
            high_watermark_chunks: 32,
            download_dir: ".".to_string(),
            checkpoint_dir: None,
        }
    }
}

/// `[network]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address direct connections are accepted on
    pub listen_addr: String,
    /// Delay before reconnecting a failed peer connection (milliseconds)
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts per failure streak
    pub max_reconnect_attempts: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            reconnect_delay_ms: 2000,
            max_reconnect_attempts: 3,
        }
    }
}

impl Config {
    /// `~/.config/flux/config.toml` (platform equivalent).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flux")
            .join("config.toml")
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load from the default path, or defaults if the file does not exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.relay.url.starts_with("ws://") && !self.relay.url.starts_with("wss://") {
            anyhow::bail!("relay.url must be a ws:// or wss:// URL, got {:?}", self.relay.url);
        }
        if self.relay.heartbeat_timeout_secs == 0 || self.relay.sweep_interval_secs == 0 {
            anyhow::bail!("relay heartbeat timeout and sweep interval must be positive");
        }
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.transfer.chunk_size
            );
        }
        if self.transfer.low_watermark_chunks == 0
            || self.transfer.low_watermark_chunks >= self.transfer.high_watermark_chunks
        {
            anyhow::bail!(
                "transfer watermarks need 0 < low ({}) < high ({})",
                self.transfer.low_watermark_chunks,
                self.transfer.high_watermark_chunks
            );
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Parsed `network.listen_addr`.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid network.listen_addr {:?}", self.network.listen_addr))
    }

    /// Relay port with the `PORT` override applied.
    pub fn relay_port(&self, env_port: Option<&str>) -> u16 {
        match env_port {
            Some(raw) => resolve_port(Some(raw)),
            None => self.relay.port,
        }
    }

    /// Relay server settings for the `relay` command.
    pub fn relay_server(&self, port: u16) -> flux_signaling::RelayConfig {
        flux_signaling::RelayConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            heartbeat_timeout: Duration::from_secs(self.relay.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(self.relay.sweep_interval_secs),
        }
    }

    /// Engine settings.
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            low_watermark_chunks: self.transfer.low_watermark_chunks,
            high_watermark_chunks: self.transfer.high_watermark_chunks,
            ..TransferConfig::default()
        }
    }

    /// Reconnect policy.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(self.network.reconnect_delay_ms),
            max_reconnect_attempts: self.network.max_reconnect_attempts,
            ..ConnectionConfig::default()
        }
    }

    /// Checkpoint directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        match &self.transfer.checkpoint_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("flux")
                .join("checkpoints"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.relay.port, 4000);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.transfer_config().high_watermark(1024), 32 * 1024);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            chunk_size = 1024

            [network]
            max_reconnect_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.high_watermark_chunks, 32);
        assert_eq!(config.network.max_reconnect_attempts, 5);
        assert_eq!(config.network.listen_addr, "0.0.0.0:0");
        assert_eq!(config.relay, RelayConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.low_watermark_chunks = 32;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.url = "http://relay".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.listen_addr = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_override() {
        let config = Config::default();
        assert_eq!(config.relay_port(None), 4000);
        assert_eq!(config.relay_port(Some("9100")), 9100);
        assert_eq!(config.relay_port(Some("0")), 4000);
        assert_eq!(config.relay_server(9100).bind_addr.port(), 9100);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.transfer.checkpoint_dir = Some("/tmp/flux-cp".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.checkpoint_dir(), PathBuf::from("/tmp/flux-cp"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("absent.toml")).is_err());
    }
}
