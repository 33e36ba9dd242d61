//! Configuration management for SonicLine
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `SONICLINE_*`
//! environment variables, then command-line flags (applied by the binary).

pub mod file;

use std::time::Duration;

use crate::arbitration::{DEFAULT_CAPACITY, DEFAULT_THRESHOLD};
use crate::context::{ContextLimits, DEFAULT_MAX_FACTS, DEFAULT_MAX_MESSAGES, PreferenceRetention};
use crate::hub::{DEFAULT_CLEANUP_INTERVAL, DEFAULT_HISTORY_CAP, DEFAULT_IDLE_TTL, HubSettings};
use crate::intent::TierPolicy;
use crate::reconcile::DEFAULT_KEY_CAPACITY;
use crate::session::{DEFAULT_FEED_CAPACITY, DEFAULT_SWEEP_INTERVAL, SessionOptions};
use crate::transport::ReconnectPolicy;
use crate::{Error, Result};

use file::SonicLineConfigFile;

/// Default hub URL devices connect to
pub const DEFAULT_HUB_URL: &str = "ws://localhost:8765";

/// Default hub port
pub const DEFAULT_HUB_PORT: u16 = 8765;

/// Default agent/action backend
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// SonicLine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub transport: TransportConfig,
    pub context: ContextConfig,
    pub arbitration: ArbitrationConfig,
    pub hub: HubConfig,
    pub backend: BackendConfig,
    pub polling: PollingConfig,
}

/// Device transport configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Hub WebSocket URL
    pub url: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub connect_timeout: Duration,
}

/// Context window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    pub max_messages: usize,
    pub max_facts: usize,
    pub preferences: PreferenceRetention,
    /// Size of the recent action feed
    pub action_feed: usize,
}

/// Promise arbitration configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArbitrationConfig {
    pub capacity: usize,
    pub threshold: f64,
    pub sweep_interval: Duration,
    pub tier_policy: TierPolicy,
}

/// Relay hub configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub port: u16,
    pub history_cap: usize,
    pub idle_ttl: Duration,
}

/// Agent backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub url: String,
}

/// History polling configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            transport: TransportConfig {
                url: DEFAULT_HUB_URL.to_string(),
                base_delay: policy.base_delay,
                max_attempts: policy.max_attempts,
                connect_timeout: Duration::from_secs(10),
            },
            context: ContextConfig {
                max_messages: DEFAULT_MAX_MESSAGES,
                max_facts: DEFAULT_MAX_FACTS,
                preferences: PreferenceRetention::default(),
                action_feed: DEFAULT_FEED_CAPACITY,
            },
            arbitration: ArbitrationConfig {
                capacity: DEFAULT_CAPACITY,
                threshold: DEFAULT_THRESHOLD,
                sweep_interval: DEFAULT_SWEEP_INTERVAL,
                tier_policy: TierPolicy::default(),
            },
            hub: HubConfig {
                port: DEFAULT_HUB_PORT,
                history_cap: DEFAULT_HISTORY_CAP,
                idle_ttl: DEFAULT_IDLE_TTL,
            },
            backend: BackendConfig {
                url: DEFAULT_BACKEND_URL.to_string(),
            },
            polling: PollingConfig {
                enabled: true,
                interval: Duration::from_secs(5),
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

fn parse_enum_env<T: serde::de::DeserializeOwned>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

impl Config {
    /// Load configuration from the standard file path and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or a value is out of range
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Assemble configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or a value is out of range
    pub fn from_sources(
        fc: SonicLineConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let transport = TransportConfig {
            url: env("SONICLINE_HUB_URL")
                .or(fc.transport.url)
                .unwrap_or(defaults.transport.url),
            base_delay: parse_env::<u64>(&env, "SONICLINE_RECONNECT_BASE_MS")?
                .or(fc.transport.base_delay_ms)
                .map_or(defaults.transport.base_delay, Duration::from_millis),
            max_attempts: parse_env(&env, "SONICLINE_RECONNECT_MAX_ATTEMPTS")?
                .or(fc.transport.max_attempts)
                .unwrap_or(defaults.transport.max_attempts),
            connect_timeout: fc
                .transport
                .connect_timeout_ms
                .map_or(defaults.transport.connect_timeout, Duration::from_millis),
        };

        let context = ContextConfig {
            max_messages: fc.context.max_messages.unwrap_or(defaults.context.max_messages),
            max_facts: fc.context.max_facts.unwrap_or(defaults.context.max_facts),
            preferences: parse_enum_env(&env, "SONICLINE_PREFERENCES")?
                .or(fc.context.preferences)
                .unwrap_or(defaults.context.preferences),
            action_feed: fc.context.action_feed.unwrap_or(defaults.context.action_feed),
        };

        let arbitration = ArbitrationConfig {
            capacity: fc.arbitration.capacity.unwrap_or(defaults.arbitration.capacity),
            threshold: parse_env(&env, "SONICLINE_THRESHOLD")?
                .or(fc.arbitration.threshold)
                .unwrap_or(defaults.arbitration.threshold),
            sweep_interval: parse_env::<u64>(&env, "SONICLINE_SWEEP_INTERVAL_MS")?
                .or(fc.arbitration.sweep_interval_ms)
                .map_or(defaults.arbitration.sweep_interval, Duration::from_millis),
            tier_policy: parse_enum_env(&env, "SONICLINE_TIER_POLICY")?
                .or(fc.arbitration.tier_policy)
                .unwrap_or(defaults.arbitration.tier_policy),
        };

        let hub = HubConfig {
            port: parse_env(&env, "SONICLINE_HUB_PORT")?
                .or(fc.hub.port)
                .unwrap_or(defaults.hub.port),
            history_cap: fc.hub.history_cap.unwrap_or(defaults.hub.history_cap),
            idle_ttl: fc
                .hub
                .idle_ttl_secs
                .map_or(defaults.hub.idle_ttl, Duration::from_secs),
        };

        let backend = BackendConfig {
            url: env("SONICLINE_BACKEND_URL")
                .or(fc.backend.url)
                .unwrap_or(defaults.backend.url),
        };

        let polling = PollingConfig {
            enabled: parse_env(&env, "SONICLINE_POLLING")?
                .or(fc.polling.enabled)
                .unwrap_or(defaults.polling.enabled),
            interval: parse_env::<u64>(&env, "SONICLINE_POLL_INTERVAL_MS")?
                .or(fc.polling.interval_ms)
                .map_or(defaults.polling.interval, Duration::from_millis),
        };

        let config = Self {
            transport,
            context,
            arbitration,
            hub,
            backend,
            polling,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending setting
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.arbitration.threshold) {
            return Err(Error::Config(format!(
                "arbitration threshold must be within [0, 1], got {}",
                self.arbitration.threshold
            )));
        }
        if self.arbitration.capacity == 0 {
            return Err(Error::Config("arbitration capacity must be positive".to_string()));
        }
        if self.context.max_messages == 0 {
            return Err(Error::Config("context max_messages must be positive".to_string()));
        }
        if self.arbitration.sweep_interval.is_zero() || self.polling.interval.is_zero() {
            return Err(Error::Config("intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.transport.base_delay,
            max_attempts: self.transport.max_attempts,
            ..ReconnectPolicy::default()
        }
    }

    #[must_use]
    pub const fn context_limits(&self) -> ContextLimits {
        ContextLimits {
            max_messages: self.context.max_messages,
            max_facts: self.context.max_facts,
            preferences: self.context.preferences,
        }
    }

    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            context: self.context_limits(),
            candidate_capacity: self.arbitration.capacity,
            threshold: self.arbitration.threshold,
            tier_policy: self.arbitration.tier_policy,
            feed_capacity: self.context.action_feed,
            dedup_capacity: DEFAULT_KEY_CAPACITY,
        }
    }

    #[must_use]
    pub const fn hub_settings(&self) -> HubSettings {
        HubSettings {
            history_cap: self.hub.history_cap,
            idle_ttl: self.hub.idle_ttl,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}
