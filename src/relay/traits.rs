//! Network Client Interface
//!
//! The engine never talks to relays directly; it goes through
//! [`RelayClient`]. Implementations decide how relay URLs map to
//! connections. An empty relay list means "use the client's defaults".

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use super::event::Event;
use super::filter::Filter;

/// Network client errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("request timed out")]
    Timeout,

    #[error("subscription closed")]
    Closed,
}

impl RelayError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, RelayError::Rejected(_))
    }
}

/// Item yielded by a live subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    Event(Event),
    /// Stored history has been fully replayed
    EndOfStoredEvents,
    /// Liveness signal with no payload (keeps the watchdog fed)
    Alive,
}

/// Live subscription; dropping it closes the subscription
pub type EventStream = BoxStream<'static, Result<SubscriptionItem, RelayError>>;

/// Pub/sub network client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// One-shot query returning every stored event matching the filter
    async fn query(&self, filter: &Filter, relays: &[String]) -> Result<Vec<Event>, RelayError>;

    /// Open a live subscription
    async fn subscribe(&self, filter: &Filter, relays: &[String]) -> Result<EventStream, RelayError>;

    /// Publish a signed event
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<(), RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::Timeout.is_transient());
        assert!(RelayError::Closed.is_transient());
        assert!(RelayError::Connection("reset".into()).is_transient());
        assert!(!RelayError::Rejected("blocked".into()).is_transient());
    }
}
