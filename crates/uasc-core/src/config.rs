//! Configuration for secure conversation endpoints.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UASC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/uasc/config.toml
//!   3. ~/.config/uasc/config.toml

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::policy::{MessageSecurityMode, PolicyError, SecurityPolicy, POLICY_URI_NONE};
use crate::wire::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Default bound on partially received messages per channel.
pub const DEFAULT_MAX_PENDING_MESSAGES: u32 = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UascConfig {
    pub network: NetworkConfig,
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the daemon listens on.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest chunk we send, in bytes.
    pub send_buffer_size: u32,
    /// Largest chunk we accept, in bytes.
    pub receive_buffer_size: u32,
    /// Largest reassembled message body. 0 = unlimited.
    pub max_message_size: u32,
    /// Most chunks per message. 0 = unlimited.
    pub max_chunk_count: u32,
    /// Most messages in progress at once on one channel. 0 = unlimited.
    pub max_pending_messages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub policy_uri: String,
    /// `None`, `Sign` or `SignAndEncrypt`.
    pub mode: String,
    /// Token lifetime to request, in milliseconds.
    pub requested_lifetime_ms: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4840".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_CHUNK_SIZE as u32,
            receive_buffer_size: DEFAULT_CHUNK_SIZE as u32,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 4096,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy_uri: POLICY_URI_NONE.to_string(),
            mode: MessageSecurityMode::None.to_string(),
            requested_lifetime_ms: 3_600_000,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("uasc")
}

fn home_dir() -> PathBuf {
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
    #[error("{field} = {value} is below the minimum of {min}")]
    BufferTooSmall {
        field: &'static str,
        value: u32,
        min: usize,
    },
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl UascConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load a config file without env overrides. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("UASC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&UascConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply UASC_* overrides, looking each variable up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| {
            let value = lookup(key);
            if value.is_some() {
                tracing::debug!(key, "config override from environment");
            }
            value
        };
        if let Some(v) = lookup("UASC_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("UASC_LIMITS__SEND_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.send_buffer_size = v;
        }
        if let Some(v) = lookup("UASC_LIMITS__RECEIVE_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.receive_buffer_size = v;
        }
        if let Some(v) = lookup("UASC_LIMITS__MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.limits.max_message_size = v;
        }
        if let Some(v) = lookup("UASC_LIMITS__MAX_CHUNK_COUNT").and_then(|v| v.parse().ok()) {
            self.limits.max_chunk_count = v;
        }
        if let Some(v) = lookup("UASC_LIMITS__MAX_PENDING_MESSAGES").and_then(|v| v.parse().ok()) {
            self.limits.max_pending_messages = v;
        }
        if let Some(v) = lookup("UASC_SECURITY__POLICY_URI") {
            self.security.policy_uri = v;
        }
        if let Some(v) = lookup("UASC_SECURITY__MODE") {
            self.security.mode = v;
        }
        if let Some(v) = lookup("UASC_SECURITY__REQUESTED_LIFETIME_MS").and_then(|v| v.parse().ok()) {
            self.security.requested_lifetime_ms = v;
        }
    }

    /// Check buffer minimums and that the policy and mode go together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("limits.send_buffer_size", self.limits.send_buffer_size),
            ("limits.receive_buffer_size", self.limits.receive_buffer_size),
        ] {
            if (value as usize) < MIN_CHUNK_SIZE {
                return Err(ConfigError::BufferTooSmall {
                    field,
                    value,
                    min: MIN_CHUNK_SIZE,
                });
            }
        }
        self.security_policy()?.check_mode(self.security_mode()?)?;
        Ok(())
    }

    pub fn security_policy(&self) -> Result<SecurityPolicy, PolicyError> {
        SecurityPolicy::from_uri(&self.security.policy_uri)
    }

    pub fn security_mode(&self) -> Result<MessageSecurityMode, PolicyError> {
        self.security.mode.parse()
    }
}
