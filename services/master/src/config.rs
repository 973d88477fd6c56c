//! Configuration for the master.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use corral_resources::Resources;

/// Master configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,

    /// Advertised in `MasterInfo`; there is no listener in this crate.
    pub port: u16,

    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is unset.
    pub log_level: String,

    pub allocation_interval: Duration,

    /// Outstanding offers are rescinded after this long; `None` disables it.
    pub offer_timeout: Option<Duration>,

    pub slave_ping_timeout: Duration,

    /// Host whitelist file. `None` makes every host eligible.
    pub whitelist: Option<PathBuf>,

    pub whitelist_refresh: Duration,

    /// SQLite database for framework metadata. `None` keeps it in memory.
    pub frameworks_db: Option<PathBuf>,

    /// Number of in-process slaves to start.
    pub local_slaves: usize,

    pub local_slave_resources: Resources,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let host = lookup("CORRAL_MASTER_HOST").unwrap_or(defaults.host);
        let port = parse_var(&lookup, "CORRAL_MASTER_PORT")?.unwrap_or(defaults.port);
        let log_level = lookup("CORRAL_LOG_LEVEL").unwrap_or(defaults.log_level);

        let allocation_interval = parse_var(&lookup, "CORRAL_ALLOCATION_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.allocation_interval);
        if allocation_interval.is_zero() {
            return Err(anyhow!("CORRAL_ALLOCATION_INTERVAL_MS must be positive"));
        }

        let offer_timeout = parse_var(&lookup, "CORRAL_OFFER_TIMEOUT_SECS")?.map(Duration::from_secs);

        let slave_ping_timeout = parse_var(&lookup, "CORRAL_SLAVE_PING_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.slave_ping_timeout);
        if slave_ping_timeout.is_zero() {
            return Err(anyhow!("CORRAL_SLAVE_PING_TIMEOUT_SECS must be positive"));
        }

        let whitelist = lookup("CORRAL_WHITELIST")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let whitelist_refresh = parse_var(&lookup, "CORRAL_WHITELIST_REFRESH_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.whitelist_refresh);

        let frameworks_db = lookup("CORRAL_FRAMEWORKS_DB")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let local_slaves = parse_var(&lookup, "CORRAL_LOCAL_SLAVES")?.unwrap_or(defaults.local_slaves);
        let local_slave_resources = parse_var(&lookup, "CORRAL_LOCAL_SLAVE_RESOURCES")?
            .unwrap_or(defaults.local_slave_resources);

        Ok(Self {
            host,
            port,
            log_level,
            allocation_interval,
            offer_timeout,
            slave_ping_timeout,
            whitelist,
            whitelist_refresh,
            frameworks_db,
            local_slaves,
            local_slave_resources,
        })
    }

    /// How often slaves are checked; a fifth of the ping timeout.
    pub fn health_check_interval(&self) -> Duration {
        (self.slave_ping_timeout / 5).max(Duration::from_millis(100))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
            log_level: "info".to_string(),
            allocation_interval: Duration::from_secs(1),
            offer_timeout: None,
            slave_ping_timeout: Duration::from_secs(75),
            whitelist: None,
            whitelist_refresh: Duration::from_secs(5),
            frameworks_db: None,
            local_slaves: 0,
            local_slave_resources: Resources::parse("cpus:2;mem:1024;disk:1024;ports:[31000-32000]")
                .unwrap_or_default(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))
        })
        .transpose()
}
