//! Configuration system for Pulse.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PULSE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pulse/config.toml
//!   3. ~/.config/pulse/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host to bind. Empty = wildcard.
    pub bind_host: String,
    /// TCP port for connection-oriented heartbeats. 0 = OS-assigned.
    pub tcp_port: u16,
    /// UDP port for datagram heartbeats. 0 = OS-assigned.
    pub udp_port: u16,
    pub tcp_enabled: bool,
    pub udp_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Admission ceiling shared by all in-flight units of one dispatcher.
    pub max_concurrent: usize,
    /// Receive idle timeout applied to every admitted connection.
    pub idle_timeout_secs: u64,
    /// Receive buffer size for one datagram.
    pub max_datagram: usize,
    /// TCP listen backlog.
    pub backlog: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds per tick.
    pub resolution_secs: u64,
    /// Ticks per time-to-live.
    pub interval_ticks: u32,
    /// Initial hash index capacity.
    pub buckets: usize,
    /// Run expiry callbacks after releasing the registry lock.
    pub deferred_expiry: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Fork into the background on startup.
    pub detach: bool,
    /// Where stdout/stderr go once detached. None = discarded.
    pub log_file: Option<PathBuf>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: String::new(),
            tcp_port: 7070,
            udp_port: 7070,
            tcp_enabled: true,
            udp_enabled: true,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            idle_timeout_secs: 30,
            max_datagram: 512,
            backlog: 10,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resolution_secs: 1,
            interval_ticks: 30,
            buckets: 64,
            deferred_expiry: false,
        }
    }
}

impl DispatchConfig {
    /// Longest accepted receive idle timeout.
    pub const MAX_IDLE_TIMEOUT_SECS: u64 = 24 * 60 * 60;

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl RegistryConfig {
    pub fn resolution(&self) -> Duration {
        Duration::from_secs(self.resolution_secs)
    }

    /// Wall-clock lifetime of an unrefreshed entry.
    pub fn ttl(&self) -> Duration {
        self.resolution() * self.interval_ticks
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pulse")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PulseConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is missing.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PulseConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PULSE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PulseConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the registry or dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.resolution_secs == 0 {
            return Err(ConfigError::Invalid("registry.resolution_secs must be > 0"));
        }
        if self.registry.interval_ticks == 0 {
            return Err(ConfigError::Invalid("registry.interval_ticks must be > 0"));
        }
        if self.dispatch.max_concurrent == 0 {
            return Err(ConfigError::Invalid("dispatch.max_concurrent must be > 0"));
        }
        if self.dispatch.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("dispatch.idle_timeout_secs must be > 0"));
        }
        if self.dispatch.idle_timeout_secs > DispatchConfig::MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid("dispatch.idle_timeout_secs must be at most 86400"));
        }
        if self.dispatch.max_datagram == 0 {
            return Err(ConfigError::Invalid("dispatch.max_datagram must be > 0"));
        }
        if !self.network.tcp_enabled && !self.network.udp_enabled {
            return Err(ConfigError::Invalid("at least one of tcp/udp must be enabled"));
        }
        Ok(())
    }

    /// Apply PULSE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PULSE_NETWORK__BIND_HOST") {
            self.network.bind_host = v;
        }
        if let Some(p) = var("PULSE_NETWORK__TCP_PORT").and_then(|v| v.parse().ok()) {
            self.network.tcp_port = p;
        }
        if let Some(p) = var("PULSE_NETWORK__UDP_PORT").and_then(|v| v.parse().ok()) {
            self.network.udp_port = p;
        }
        if let Some(n) = var("PULSE_DISPATCH__MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.dispatch.max_concurrent = n;
        }
        if let Some(n) = var("PULSE_DISPATCH__IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.dispatch.idle_timeout_secs = n;
        }
        if let Some(n) = var("PULSE_REGISTRY__RESOLUTION_SECS").and_then(|v| v.parse().ok()) {
            self.registry.resolution_secs = n;
        }
        if let Some(n) = var("PULSE_REGISTRY__INTERVAL_TICKS").and_then(|v| v.parse().ok()) {
            self.registry.interval_ticks = n;
        }
        if let Some(v) = var("PULSE_DAEMON__DETACH") {
            self.daemon.detach = v == "true" || v == "1";
        }
        if let Some(v) = var("PULSE_DAEMON__LOG_FILE") {
            self.daemon.log_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
    }
}
