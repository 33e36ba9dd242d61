//! TOML configuration file loading
//!
//! Supports `~/.config/sonicline/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::context::PreferenceRetention;
use crate::intent::TierPolicy;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SonicLineConfigFile {
    #[serde(default)]
    pub transport: TransportFileConfig,

    #[serde(default)]
    pub context: ContextFileConfig,

    #[serde(default)]
    pub arbitration: ArbitrationFileConfig,

    #[serde(default)]
    pub hub: HubFileConfig,

    #[serde(default)]
    pub backend: BackendFileConfig,

    #[serde(default)]
    pub polling: PollingFileConfig,
}

/// Device transport
#[derive(Debug, Default, Deserialize)]
pub struct TransportFileConfig {
    /// Hub WebSocket URL (e.g. "ws://localhost:8765")
    pub url: Option<String>,
    /// Delay before the first reconnect attempt
    pub base_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
}

/// Context window limits
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    pub max_messages: Option<usize>,
    pub max_facts: Option<usize>,
    /// "retain" or "reset"
    pub preferences: Option<PreferenceRetention>,
    pub action_feed: Option<usize>,
}

/// Candidate arbitration
#[derive(Debug, Default, Deserialize)]
pub struct ArbitrationFileConfig {
    pub capacity: Option<usize>,
    pub threshold: Option<f64>,
    pub sweep_interval_ms: Option<u64>,
    /// "last-match" or "highest"
    pub tier_policy: Option<TierPolicy>,
}

/// Relay hub
#[derive(Debug, Default, Deserialize)]
pub struct HubFileConfig {
    pub port: Option<u16>,
    pub history_cap: Option<usize>,
    pub idle_ttl_secs: Option<u64>,
}

/// Agent and action backend
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    pub url: Option<String>,
}

/// History polling
#[derive(Debug, Default, Deserialize)]
pub struct PollingFileConfig {
    pub enabled: Option<bool>,
    pub interval_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SonicLineConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SonicLineConfigFile {
    config_file_path().map_or_else(SonicLineConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> SonicLineConfigFile {
    if !path.exists() {
        return SonicLineConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SonicLineConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SonicLineConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/sonicline/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("sonicline").join("config.toml"))
}
