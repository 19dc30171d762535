//! Acceptance Info Resolver
//!
//! Looks up a recipient's newest acceptance announcement and caches the
//! parsed result for the life of the process. Unusable announcements are
//! reported as [`ResolveError::NotFound`] and never cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::relay::{kind, unix_now, Event, Filter, RelayClient, RelayError};
use crate::types::AcceptanceInfo;

/// Resolution errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The owner has no usable announcement
    #[error("no acceptance info for {0}")]
    NotFound(String),

    #[error("acceptance info lookup timed out")]
    Timeout,

    #[error("acceptance info lookup failed: {0}")]
    Transient(RelayError),
}

impl ResolveError {
    /// Worth retrying later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Timeout => true,
            Self::Transient(e) => e.is_transient(),
        }
    }
}

/// Cached acceptance info lookups
pub struct AcceptanceInfoResolver {
    relay: Arc<dyn RelayClient>,
    relays: Vec<String>,
    timeout: Duration,
    cache: RwLock<HashMap<String, Arc<AcceptanceInfo>>>,
}

impl AcceptanceInfoResolver {
    pub fn new(relay: Arc<dyn RelayClient>, relays: Vec<String>, timeout: Duration) -> Self {
        Self {
            relay,
            relays,
            timeout,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an owner's acceptance info, from cache when possible
    pub async fn resolve(&self, owner_key: &str) -> Result<Arc<AcceptanceInfo>, ResolveError> {
        if let Some(info) = self.cached(owner_key).await {
            return Ok(info);
        }

        let filter = Filter::new().kind(kind::NUTZAP_INFO).author(owner_key);
        let events = tokio::time::timeout(self.timeout, self.relay.query(&filter, &self.relays))
            .await
            .map_err(|_| ResolveError::Timeout)?
            .map_err(ResolveError::Transient)?;

        let Some(newest) = newest_verified(&events, owner_key) else {
            debug!(target: "nutzapd::resolver", owner = %owner_key, "No announcement found");
            return Err(ResolveError::NotFound(owner_key.to_string()));
        };

        let parsed = AcceptanceInfo::from_event(newest, unix_now()).map_err(|e| {
            warn!(
                target: "nutzapd::resolver",
                owner = %owner_key,
                event_id = %newest.id,
                error = %e,
                "Newest announcement is unusable"
            );
            ResolveError::NotFound(owner_key.to_string())
        })?;

        let info = Arc::new(parsed);
        info!(
            target: "nutzapd::resolver",
            owner = %owner_key,
            mints = info.trusted_mints.len(),
            relays = info.relays.len(),
            "Resolved acceptance info"
        );

        self.cache
            .write()
            .await
            .insert(owner_key.to_string(), info.clone());
        Ok(info)
    }

    /// Drop the cached entry and resolve again
    pub async fn refresh(&self, owner_key: &str) -> Result<Arc<AcceptanceInfo>, ResolveError> {
        self.invalidate(owner_key).await;
        self.resolve(owner_key).await
    }

    pub async fn invalidate(&self, owner_key: &str) {
        self.cache.write().await.remove(owner_key);
    }

    pub async fn cached(&self, owner_key: &str) -> Option<Arc<AcceptanceInfo>> {
        self.cache.read().await.get(owner_key).cloned()
    }
}

/// Newest verified announcement by `owner`; ties go to the lowest id
fn newest_verified<'a>(events: &'a [Event], owner: &str) -> Option<&'a Event> {
    events
        .iter()
        .filter(|e| e.kind == kind::NUTZAP_INFO && e.pubkey == owner)
        .filter(|e| match e.verify() {
            Ok(()) => true,
            Err(err) => {
                debug!(target: "nutzapd::resolver", event_id = %e.id, error = %err, "Ignoring unverifiable announcement");
                false
            }
        })
        .min_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)))
}
