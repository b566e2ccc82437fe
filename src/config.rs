//! Daemon configuration with file and environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("Invalid config: {0}")]
  Json(#[from] serde_json::Error),
}

/// MPD connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
  /// MPD host name or address.
  #[serde(default = "default_host")]
  pub host: String,

  /// MPD port.
  #[serde(default = "default_port")]
  pub port: u16,

  /// Position drift (ms) tolerated before reporting a position change.
  #[serde(default = "default_position_tolerance")]
  pub position_tolerance_ms: u64,

  /// Delays between reconnect attempts; the last one repeats.
  #[serde(default = "default_reconnect_delays")]
  pub reconnect_delays_secs: Vec<u64>,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_port() -> u16 {
  6600
}

fn default_position_tolerance() -> u64 {
  100
}

fn default_reconnect_delays() -> Vec<u64> {
  vec![1, 2, 5, 10, 30, 60]
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      position_tolerance_ms: default_position_tolerance(),
      reconnect_delays_secs: default_reconnect_delays(),
    }
  }
}

impl SyncConfig {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.host.trim().is_empty() {
      return Err("Host cannot be empty".to_string());
    }
    if self.port == 0 {
      return Err("Port must be between 1 and 65535".to_string());
    }
    if self.position_tolerance_ms > 10_000 {
      return Err("Position tolerance must be at most 10000 ms".to_string());
    }
    if self.reconnect_delays_secs.is_empty() {
      return Err("At least one reconnect delay is required".to_string());
    }
    Ok(())
  }

  /// Default location: `<config dir>/mpdsync/config.json`.
  pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mpdsync").join("config.json"))
  }

  /// Load from the default location, falling back to defaults when there is no file.
  pub fn load() -> Result<Self, ConfigError> {
    match Self::config_path() {
      Some(path) if path.exists() => Self::from_file(&path),
      _ => {
        log::debug!("No config file, using defaults");
        Ok(Self::default())
      }
    }
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config = serde_json::from_str(&contents)?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
  }

  /// Apply `MPD_HOST` and `MPD_PORT` from the environment.
  pub fn with_env(self) -> Self {
    let host = std::env::var("MPD_HOST").ok();
    let port = std::env::var("MPD_PORT").ok();
    self.with_overrides(host.as_deref(), port.as_deref())
  }

  /// Override host and port. Empty hosts and non-numeric ports are ignored.
  pub fn with_overrides(mut self, host: Option<&str>, port: Option<&str>) -> Self {
    if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
      self.host = host.to_string();
    }
    if let Some(port) = port {
      match port.trim().parse() {
        Ok(port) => self.port = port,
        Err(_) => log::warn!("Ignoring invalid MPD port: {:?}", port),
      }
    }
    self
  }

  pub fn address(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }

  /// Delay before reconnect attempt `attempt` (0-based).
  pub fn reconnect_delay(&self, attempt: usize) -> Duration {
    let secs = match self.reconnect_delays_secs.get(attempt) {
      Some(secs) => *secs,
      None => self.reconnect_delays_secs.last().copied().unwrap_or(1),
    };
    Duration::from_secs(secs)
  }
}
