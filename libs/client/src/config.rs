//! Environment Configuration
//!
//! Loaded from a TOML file layered with prefixed environment variables, or
//! built in code from [`EnvironmentConfig::default`].
//!
//! ```toml
//! addresses = ["node-1:5552", "node-2:5552"]
//! max_producers_by_connection = 128
//!
//! [recovery_backoff]
//! type = "fixed"
//! delay_ms = 5000
//!
//! [default_commit]
//! auto_commit = true
//! message_count_before_commit = 10000
//! flush_interval_ms = 5000
//! ```

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use network::recovery::{
    BackoffPolicy, DelaySequence, ExponentialBackoff, FixedDelay, FixedWithInitialDelay,
};
use network::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connection-local ids are one byte wide
pub const MAX_ENTITIES_BY_CONNECTION: usize = 256;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "STREAM";

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Broker nodes tried in order for the locator connection
    pub addresses: Vec<String>,
    pub max_producers_by_connection: usize,
    pub max_consumers_by_connection: usize,
    /// Pace of producer, consumer and locator reconnection
    pub recovery_backoff: BackoffConfig,
    /// Pace of re-resolving stream placement after a leader change
    pub topology_update_backoff: BackoffConfig,
    pub default_commit: CommitConfiguration,
    /// Prefix of the names connections report to the broker
    pub client_name: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            addresses: vec![Address::default().to_string()],
            max_producers_by_connection: MAX_ENTITIES_BY_CONNECTION,
            max_consumers_by_connection: MAX_ENTITIES_BY_CONNECTION,
            recovery_backoff: BackoffConfig::Fixed { delay_ms: 5_000 },
            topology_update_backoff: BackoffConfig::FixedWithInitial {
                initial_ms: 5_000,
                delay_ms: 1_000,
            },
            default_commit: CommitConfiguration::default(),
            client_name: "rabbitmq-stream".to_string(),
        }
    }
}

impl EnvironmentConfig {
    /// Load from a TOML file with `{prefix}_`-prefixed environment overrides
    ///
    /// Nested keys use a double underscore, e.g.
    /// `STREAM_DEFAULT_COMMIT__MESSAGE_COUNT_BEFORE_COMMIT=500`.
    pub fn load(path: Option<&Path>, env_prefix: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("Loading stream client config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix.unwrap_or(ENV_PREFIX))
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("addresses")
                .try_parsing(true),
        );

        let config: EnvironmentConfig = builder
            .build()
            .context("Failed to build stream client configuration")?
            .try_deserialize()
            .context("Failed to deserialize stream client configuration")?;

        config.validated()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EnvironmentConfig =
            toml::from_str(text).context("Failed to parse stream client configuration")?;
        config.validated()
    }

    /// Check invariants and clamp per-connection capacities
    pub fn validated(mut self) -> Result<Self> {
        if self.addresses.is_empty() {
            bail!("at least one broker address is required");
        }
        self.parsed_addresses()?;

        self.max_producers_by_connection = clamp_capacity(self.max_producers_by_connection);
        self.max_consumers_by_connection = clamp_capacity(self.max_consumers_by_connection);

        self.recovery_backoff
            .validate()
            .context("invalid recovery_backoff")?;
        self.topology_update_backoff
            .validate()
            .context("invalid topology_update_backoff")?;
        self.default_commit
            .validate()
            .context("invalid default_commit")?;
        Ok(self)
    }

    pub fn parsed_addresses(&self) -> Result<Vec<Address>> {
        self.addresses
            .iter()
            .map(|address| {
                address
                    .parse::<Address>()
                    .with_context(|| format!("invalid broker address '{}'", address))
            })
            .collect()
    }
}

fn clamp_capacity(value: usize) -> usize {
    value.clamp(1, MAX_ENTITIES_BY_CONNECTION)
}

/// Serializable description of a backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    Fixed {
        delay_ms: u64,
    },
    FixedWithInitial {
        initial_ms: u64,
        delay_ms: u64,
    },
    Sequence {
        delays_ms: Vec<u64>,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
        #[serde(default)]
        max_retries: Option<u32>,
    },
}

impl BackoffConfig {
    fn validate(&self) -> Result<()> {
        match self {
            BackoffConfig::Sequence { delays_ms } if delays_ms.is_empty() => {
                bail!("sequence backoff needs at least one delay")
            }
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                ..
            } => {
                if max_ms < initial_ms {
                    bail!("max_ms {} is below initial_ms {}", max_ms, initial_ms);
                }
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    bail!("multiplier must be a finite value >= 1.0");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn to_policy(&self) -> Arc<dyn BackoffPolicy> {
        match self {
            BackoffConfig::Fixed { delay_ms } => {
                Arc::new(FixedDelay::new(Duration::from_millis(*delay_ms)))
            }
            BackoffConfig::FixedWithInitial {
                initial_ms,
                delay_ms,
            } => Arc::new(FixedWithInitialDelay::new(
                Duration::from_millis(*initial_ms),
                Duration::from_millis(*delay_ms),
            )),
            BackoffConfig::Sequence { delays_ms } => Arc::new(DelaySequence::from_millis(delays_ms)),
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                max_retries,
            } => {
                let policy = ExponentialBackoff::new(
                    Duration::from_millis(*initial_ms),
                    Duration::from_millis(*max_ms),
                    *multiplier,
                );
                match max_retries {
                    Some(limit) => Arc::new(policy.with_max_retries(*limit)),
                    None => Arc::new(policy),
                }
            }
        }
    }
}

/// Automatic offset committing for consumers with a tracking reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfiguration {
    pub auto_commit: bool,
    /// Commit after this many processed messages
    pub message_count_before_commit: u64,
    /// Commit whatever accumulated at least this often
    #[serde(rename = "flush_interval_ms", with = "millis")]
    pub flush_interval: Duration,
}

impl Default for CommitConfiguration {
    fn default() -> Self {
        Self {
            auto_commit: true,
            message_count_before_commit: 10_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl CommitConfiguration {
    pub fn disabled() -> Self {
        Self {
            auto_commit: false,
            ..Self::default()
        }
    }

    pub fn with_message_count(mut self, count: u64) -> Self {
        self.message_count_before_commit = count;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.message_count_before_commit == 0 {
            bail!("message_count_before_commit must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("flush_interval_ms must be positive");
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
