//! Configuration for minilock nodes

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix, e.g. `MINILOCK__LOCKER__NODE_ID`
pub const ENV_PREFIX: &str = "MINILOCK";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Lock manager settings
    #[serde(default)]
    pub locker: LockerConfig,

    /// Shared store URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            locker: LockerConfig::default(),
            redis_url: default_redis_url(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `MINILOCK__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(::config::File::from(path)),
            None => builder.add_source(::config::File::with_name("minilock").required(false)),
        };
        let config: Config = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.locker.validate()?;
        Ok(config)
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Preferred node ID. Empty means auto-assigned from the shared counter.
    pub node_id: String,

    /// Prefix for every key and channel this node touches in the store
    pub namespace: String,

    /// Directory holding the persisted node identity file
    pub runtime_dir: PathBuf,

    /// Period of the lease renewal watcher
    pub renew_interval_ms: u64,

    /// Leases expiring within this window are extended on each tick
    pub renew_horizon_ms: u64,

    /// Expiry given to locks left behind by a crashed predecessor
    pub recovery_grace_ms: u64,

    /// Pause before resubscribing to the notification channel
    pub resubscribe_backoff_ms: u64,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            namespace: "dlock".to_string(),
            runtime_dir: PathBuf::from("./runtime"),
            renew_interval_ms: 60_000,
            renew_horizon_ms: 600_000,
            recovery_grace_ms: 10_000,
            resubscribe_backoff_ms: 1_000,
        }
    }
}

impl LockerConfig {
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn renew_horizon(&self) -> Duration {
        Duration::from_millis(self.renew_horizon_ms)
    }

    pub fn recovery_grace(&self) -> Duration {
        Duration::from_millis(self.recovery_grace_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::InvalidConfig("namespace cannot be empty".into()));
        }
        if self.renew_interval_ms == 0 {
            return Err(Error::InvalidConfig("renew_interval_ms must be positive".into()));
        }
        // A horizon shorter than the tick would let leases lapse between ticks.
        if self.renew_horizon_ms <= self.renew_interval_ms {
            return Err(Error::InvalidConfig(format!(
                "renew_horizon_ms ({}) must exceed renew_interval_ms ({})",
                self.renew_horizon_ms, self.renew_interval_ms
            )));
        }
        if self.resubscribe_backoff_ms == 0 {
            return Err(Error::InvalidConfig("resubscribe_backoff_ms must be positive".into()));
        }
        Ok(())
    }
}
