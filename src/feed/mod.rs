//! Nutzap Discovery Feed
//!
//! Turns the network into an ordered, deduplicated stream of validated
//! incoming tokens for one recipient:
//!
//! ```text
//! Resolving ──► CatchUp ──► Live ◄──► Reconnecting
//!     │            │          │
//!     ▼            ▼          ▼
//! Unavailable    Failed    Cancelled
//! ```
//!
//! - **service**: the feed task and its handle
//! - **dedup**: bounded id set shared by catch-up and live
//! - **backoff**: retry delays for transient failures

pub mod backoff;
pub mod dedup;
pub mod service;

use async_trait::async_trait;
use std::time::Duration;

use crate::common::config::{
    LiveMode, DEFAULT_DEDUP_CAPACITY, DEFAULT_QUERY_TIMEOUT_MS, DEFAULT_RECONNECT_BACKOFF_SECS,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_MS, DEFAULT_WATCHDOG_SECS,
};
use crate::types::IncomingToken;

// Re-exports
pub use backoff::Backoff;
pub use dedup::DedupSet;
pub use service::{FeedHandle, NutzapDiscoveryFeed};

/// Feed lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedState {
    Resolving,
    CatchUp,
    Live,
    Reconnecting,
    Cancelled,
    /// Recipient has no usable acceptance info
    Unavailable,
    /// Transient failures outlasted the retry budget
    Failed(String),
}

impl FeedState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Unavailable | Self::Failed(_))
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolving => write!(f, "resolving"),
            Self::CatchUp => write!(f, "catch_up"),
            Self::Live => write!(f, "live"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Phase a token was discovered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    CatchUp,
    Live,
}

/// Receiver of feed output
///
/// Calls are awaited one at a time in delivery order.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn on_token(&self, token: IncomingToken, origin: Origin);

    /// Catch-up batch fully delivered; `max_created_at` covers every
    /// message observed, delivered or not
    async fn on_catch_up_complete(&self, _max_created_at: Option<u64>) {}

    async fn on_state(&self, _state: &FeedState) {}
}

/// Feed settings
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Used when the recipient announces no relays
    pub relays: Vec<String>,
    pub live_mode: LiveMode,
    pub reconnect_backoff: Duration,
    pub watchdog: Duration,
    pub query_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub dedup_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            live_mode: LiveMode::Subscribe,
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_BACKOFF_SECS),
            watchdog: Duration::from_secs(DEFAULT_WATCHDOG_SECS),
            query_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}
