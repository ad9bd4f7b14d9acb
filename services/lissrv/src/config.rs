//! Service configuration
//!
//! Instrument connection records plus engine-wide limits and the client
//! reconnect policy. Loaded from a YAML file with `LISSRV_`-prefixed
//! environment overrides layered on top. Configuration is read once at
//! link creation and is immutable for the lifetime of a link; changing an
//! instrument record requires recreating its link.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{LisSrvError, Result};
use crate::utils::decode::TextEncoding;

/// Whether the link dials out to the instrument or accepts connections
/// from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Default for Role {
    fn default() -> Self {
        Role::Client
    }
}

/// Protocol selection for an instrument. `Auto` resolves the protocol
/// once per session from the lead byte of its first input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolChoice {
    Astm,
    Hl7,
    Auto,
}

impl Default for ProtocolChoice {
    fn default() -> Self {
        ProtocolChoice::Auto
    }
}

/// One configured analyzer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Opaque instrument identity, unique across the configuration
    pub id: String,
    /// Human-readable name; falls back to `id` when empty
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub protocol: ProtocolChoice,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Preferred text encoding for this instrument's messages; the decode
    /// fallback chain is used when absent or when decoding fails
    #[serde(default)]
    pub encoding: Option<TextEncoding>,
}

impl InstrumentConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Safety limits applied to every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Hard cap on the bytes of one logical message; a session that would
    /// cross it is aborted before the bytes are accumulated
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// A message attempt older than this is abandoned
    #[serde(default = "default_message_timeout_secs")]
    pub message_timeout_secs: u64,
    /// Bounded read wait, so the timeout guard is re-evaluated even when
    /// no bytes arrive
    #[serde(default = "default_read_poll_secs")]
    pub read_poll_secs: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            message_timeout_secs: default_message_timeout_secs(),
            read_poll_secs: default_read_poll_secs(),
        }
    }
}

impl EngineLimits {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_secs(self.read_poll_secs)
    }
}

/// Client-mode reconnection policy: bounded attempts with exponential
/// backoff, reset after any successful connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay before the given 1-based attempt, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub limits: EngineLimits,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl AppConfig {
    /// Load configuration from a YAML file with `LISSRV_` environment
    /// overrides (nested keys split on `__`).
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("LISSRV_").split("__"))
            .extract()
            .map_err(|e| {
                LisSrvError::config(format!("failed to load {}: {}", path.display(), e))
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_message_bytes == 0 {
            return Err(LisSrvError::config("max_message_bytes must be positive"));
        }
        if self.limits.message_timeout_secs == 0 {
            return Err(LisSrvError::config("message_timeout_secs must be positive"));
        }
        if self.limits.read_poll_secs == 0 {
            return Err(LisSrvError::config("read_poll_secs must be positive"));
        }

        let mut seen = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.is_empty() {
                return Err(LisSrvError::config("instrument id must not be empty"));
            }
            if !seen.insert(instrument.id.as_str()) {
                return Err(LisSrvError::config(format!(
                    "duplicate instrument id: {}",
                    instrument.id
                )));
            }
            if instrument.host.is_empty() {
                return Err(LisSrvError::config(format!(
                    "instrument {}: host must not be empty",
                    instrument.id
                )));
            }
            if instrument.port == 0 {
                return Err(LisSrvError::config(format!(
                    "instrument {}: port must not be zero",
                    instrument.id
                )));
            }
        }
        Ok(())
    }

    pub fn active_instruments(&self) -> impl Iterator<Item = &InstrumentConfig> {
        self.instruments.iter().filter(|i| i.active)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_message_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_message_timeout_secs() -> u64 {
    180
}

fn default_read_poll_secs() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}
