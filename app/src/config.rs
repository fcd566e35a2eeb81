//! Environment-based service configuration.
//!
//! Every knob has a sensible default so `flashsale` starts with no
//! environment at all; production deployments override through
//! `FLASHSALE_*` variables.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error with the offending variable named.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for {var}: {value}")]
    InvalidValue {
        /// The environment variable name.
        var: String,
        /// The unparseable value.
        value: String,
    },
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address (`FLASHSALE_BIND_ADDR`, default `0.0.0.0:8080`).
    pub bind_addr: SocketAddr,
    /// Consumer group on the order stream (`FLASHSALE_GROUP`, default `g1`).
    pub group: String,
    /// Consumer name within the group (`FLASHSALE_CONSUMER`, default `c1`).
    pub consumer: String,
    /// Blocking-read timeout of the worker loop
    /// (`FLASHSALE_READ_BLOCK_MS`, default 2000).
    pub read_block: Duration,
    /// Sleep between failed pending-drain attempts
    /// (`FLASHSALE_DRAIN_SLEEP_MS`, default 20).
    pub drain_sleep: Duration,
    /// TTL on the per-user materialization lock
    /// (`FLASHSALE_LOCK_TTL_SECS`, default 10).
    pub lock_ttl: Duration,
    /// TTL on cached voucher entries (`FLASHSALE_CACHE_TTL_SECS`,
    /// default 1800).
    pub voucher_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            group: "g1".to_string(),
            consumer: "c1".to_string(),
            read_block: Duration::from_millis(2000),
            drain_sleep: Duration::from_millis(20),
            lock_ttl: Duration::from_secs(10),
            voucher_cache_ttl: Duration::from_secs(1800),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] if a variable is set to something
    /// unparseable. An unset variable is never an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parsed("FLASHSALE_BIND_ADDR", defaults.bind_addr)?,
            group: string("FLASHSALE_GROUP", defaults.group),
            consumer: string("FLASHSALE_CONSUMER", defaults.consumer),
            read_block: millis("FLASHSALE_READ_BLOCK_MS", defaults.read_block)?,
            drain_sleep: millis("FLASHSALE_DRAIN_SLEEP_MS", defaults.drain_sleep)?,
            lock_ttl: seconds("FLASHSALE_LOCK_TTL_SECS", defaults.lock_ttl)?,
            voucher_cache_ttl: seconds(
                "FLASHSALE_CACHE_TTL_SECS",
                defaults.voucher_cache_ttl,
            )?,
        })
    }
}

fn string(var: &str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn parsed<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn millis(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parsed(
        var,
        u64::try_from(default.as_millis()).unwrap_or(u64::MAX),
    )?))
}

fn seconds(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parsed(var, default.as_secs())?))
}
