//! `InboxConfig`: the ambient TOML-loaded configuration the teacher's own
//! crates don't carry (VectorPrivacy-Vector reads Tauri app settings
//! instead); shaped after the knobs spec.md names explicitly in §5 and §6.

use crate::error::ConfigError;
use crate::model::is_valid_relay_uri;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// LMDB environment capacity. Defaults match the floors in spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_map_size_bytes: usize,
    pub max_readers: u32,
    pub max_named_databases: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_map_size_bytes: 500 * 1024 * 1024 * 1024,
            max_readers: 120,
            max_named_databases: 8,
        }
    }
}

/// Reconnect back-off bounds (§5): 0.5s, doubling, capped at 60s, ±25% jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 60_000,
            jitter_fraction: 0.25,
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Relays connected to when no `RelayListMetadata` is stored yet.
    pub default_relays: Vec<String>,
    pub connect_timeout_secs: u64,
    pub cold_start_deadline_secs: u64,
    pub backoff: BackoffConfig,
    /// Cap on outbox relays fanned out to per followed identity (§4.6).
    pub outbox_fanout_cap: usize,
    pub store: StoreConfig,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            default_relays: Vec::new(),
            connect_timeout_secs: 10,
            cold_start_deadline_secs: 10,
            backoff: BackoffConfig::default(),
            outbox_fanout_cap: 3,
            store: StoreConfig::default(),
        }
    }
}

impl InboxConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: InboxConfig =
            toml::from_str(s).map_err(|e| ConfigError::InvalidRelayUri(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_relays.is_empty() {
            return Err(ConfigError::EmptyDefaultRelays);
        }
        for uri in &self.default_relays {
            if !is_valid_relay_uri(uri) {
                return Err(ConfigError::InvalidRelayUri(uri.clone()));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cold_start_deadline(&self) -> Duration {
        Duration::from_secs(self.cold_start_deadline_secs)
    }
}
