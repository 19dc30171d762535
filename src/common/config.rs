//! Environment-based Configuration for nutzapd
//!
//! Values are read from the process environment after loading an optional
//! `.env` file. Every setting has a default matching the reference cadence
//! of the discovery engine, so an empty environment yields a usable config.
//!
//! # Environment Variables
//!
//! ## Network
//! - `NUTZAP_RELAYS` - Comma-separated default relay URLs (used when a
//!   recipient announces none)
//! - `NUTZAP_LIVE_MODE` - "subscribe" (push) or "poll" (fixed-interval re-query)
//! - `NUTZAP_POLL_INTERVAL_SECS` - Poll cadence in poll mode (default: 5)
//! - `NUTZAP_RECONNECT_BACKOFF_SECS` - Wait before re-entering live (default: 10)
//! - `NUTZAP_WATCHDOG_SECS` - Silence allowed on a subscription (default: 120)
//!
//! ## Timeouts and Retries
//! - `NUTZAP_QUERY_TIMEOUT_MS` - One-shot query/publish bound (default: 5000)
//! - `NUTZAP_RESOLVE_TIMEOUT_MS` - Acceptance-info lookup bound (default: 3000)
//! - `NUTZAP_RETRY_ATTEMPTS` - Transient failure retries (default: 4)
//! - `NUTZAP_RETRY_BASE_MS` - First retry delay, doubled each attempt (default: 500)
//! - `NUTZAP_DEDUP_CAPACITY` - Message ids remembered per feed run (default: 4096)
//!
//! ## Identity and Storage
//! - `NUTZAP_SECRET_KEY` - Hex-encoded secp256k1 secret of the local identity
//! - `NUTZAP_DB_PATH` - SQLite database path (default: "data/nutzapd.db")
//!
//! ## Logging
//! - `NUTZAP_LOG_LEVEL` - trace, debug, info, warn, error (default: info)
//! - `NUTZAP_LOG_JSON` - Set to "1" for JSON log lines

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::feed::FeedConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the feed waits for new messages once catch-up is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMode {
    /// Persistent subscription, guarded by a watchdog
    Subscribe,
    /// Repeated one-shot query on a fixed interval
    Poll { interval: Duration },
}

impl LiveMode {
    pub fn is_polling(&self) -> bool {
        matches!(self, LiveMode::Poll { .. })
    }
}

impl FromStr for LiveMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subscribe" | "sub" | "push" => Ok(LiveMode::Subscribe),
            "poll" | "polling" => Ok(LiveMode::Poll {
                interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            }),
            _ => Err(ConfigError::InvalidValue(
                "NUTZAP_LIVE_MODE".to_string(),
                format!("unknown live mode: {}", s),
            )),
        }
    }
}

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_WATCHDOG_SECS: u64 = 120;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_DEDUP_CAPACITY: usize = 4_096;

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fallback relays for lookups and for recipients announcing none
    pub relays: Vec<String>,

    /// Live-phase suspension mechanism
    pub live_mode: LiveMode,

    /// Wait before re-entering live after a subscription error
    pub reconnect_backoff: Duration,

    /// Subscription silence that triggers a reconnect
    pub watchdog: Duration,

    /// Bound for one-shot queries and publishes
    pub query_timeout: Duration,

    /// Bound for acceptance-info lookups
    pub resolve_timeout: Duration,

    /// Retries for transient failures before giving up
    pub retry_attempts: u32,

    /// First retry delay
    pub retry_base: Duration,

    /// Dedup set size per feed run
    pub dedup_capacity: usize,

    /// Hex-encoded secret key of the local identity
    pub secret_key: Option<String>,

    /// SQLite database path
    pub db_path: String,

    /// Log level
    pub log_level: String,

    /// Emit JSON log lines
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            live_mode: LiveMode::Subscribe,
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            watchdog: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            resolve_timeout: Duration::from_millis(DEFAULT_RESOLVE_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            secret_key: None,
            db_path: "data/nutzapd.db".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let relays = lookup("NUTZAP_RELAYS")
            .map(|v| {
                v.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let poll_interval =
            Duration::from_secs(parse_or(&lookup, "NUTZAP_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?);
        let live_mode = match lookup("NUTZAP_LIVE_MODE") {
            Some(v) => match v.parse()? {
                LiveMode::Poll { .. } => LiveMode::Poll {
                    interval: poll_interval,
                },
                mode => mode,
            },
            None => defaults.live_mode,
        };

        let config = Self {
            relays,
            live_mode,
            reconnect_backoff: Duration::from_secs(parse_or(
                &lookup,
                "NUTZAP_RECONNECT_BACKOFF_SECS",
                DEFAULT_RECONNECT_BACKOFF_SECS,
            )?),
            watchdog: Duration::from_secs(parse_or(&lookup, "NUTZAP_WATCHDOG_SECS", DEFAULT_WATCHDOG_SECS)?),
            query_timeout: Duration::from_millis(parse_or(
                &lookup,
                "NUTZAP_QUERY_TIMEOUT_MS",
                DEFAULT_QUERY_TIMEOUT_MS,
            )?),
            resolve_timeout: Duration::from_millis(parse_or(
                &lookup,
                "NUTZAP_RESOLVE_TIMEOUT_MS",
                DEFAULT_RESOLVE_TIMEOUT_MS,
            )?),
            retry_attempts: parse_or(&lookup, "NUTZAP_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?,
            retry_base: Duration::from_millis(parse_or(&lookup, "NUTZAP_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?),
            dedup_capacity: parse_or(&lookup, "NUTZAP_DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY)?,
            secret_key: lookup("NUTZAP_SECRET_KEY").filter(|k| !k.is_empty()),
            db_path: lookup("NUTZAP_DB_PATH").unwrap_or(defaults.db_path),
            log_level: lookup("NUTZAP_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_json: lookup("NUTZAP_LOG_JSON").map(|v| v == "1").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the feed
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let LiveMode::Poll { interval } = self.live_mode {
            if interval.is_zero() {
                return Err(invalid("NUTZAP_POLL_INTERVAL_SECS", "must be greater than zero"));
            }
        }
        if self.watchdog.is_zero() {
            return Err(invalid("NUTZAP_WATCHDOG_SECS", "must be greater than zero"));
        }
        if self.query_timeout.is_zero() {
            return Err(invalid("NUTZAP_QUERY_TIMEOUT_MS", "must be greater than zero"));
        }
        if self.resolve_timeout.is_zero() {
            return Err(invalid("NUTZAP_RESOLVE_TIMEOUT_MS", "must be greater than zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(invalid("NUTZAP_DEDUP_CAPACITY", "must be greater than zero"));
        }
        Ok(())
    }

    /// Require the local identity key
    pub fn require_secret_key(&self) -> Result<&str, ConfigError> {
        self.secret_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("NUTZAP_SECRET_KEY".to_string()))
    }

    /// Feed settings derived from this config
    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            relays: self.relays.clone(),
            live_mode: self.live_mode,
            reconnect_backoff: self.reconnect_backoff,
            watchdog: self.watchdog,
            query_timeout: self.query_timeout,
            retry_attempts: self.retry_attempts,
            retry_base: self.retry_base,
            dedup_capacity: self.dedup_capacity,
        }
    }

    /// Print configuration summary (hiding the secret key)
    pub fn print_summary(&self) {
        println!("=== nutzapd Configuration ===");
        println!(
            "Relays: {}",
            if self.relays.is_empty() {
                "(client default)".to_string()
            } else {
                self.relays.join(", ")
            }
        );
        match self.live_mode {
            LiveMode::Subscribe => println!("Live Mode: subscribe (watchdog {}s)", self.watchdog.as_secs()),
            LiveMode::Poll { interval } => println!("Live Mode: poll every {}s", interval.as_secs()),
        }
        println!("Reconnect Backoff: {}s", self.reconnect_backoff.as_secs());
        println!("Query Timeout: {}ms", self.query_timeout.as_millis());
        println!("Retries: {} (base {}ms)", self.retry_attempts, self.retry_base.as_millis());
        println!("Identity Key: {}", if self.secret_key.is_some() { "set" } else { "not set" });
        println!("Database: {}", self.db_path);
        println!("Log Level: {}", self.log_level);
        println!("=============================");
    }
}

fn invalid(var: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue(var.to_string(), reason.to_string())
}

fn parse_or<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), format!("cannot parse '{}'", raw))),
        None => Ok(default),
    }
}
