//! In-Memory Relay
//!
//! A single in-process relay for tests and the `simulate` command.
//! Data is lost when the process exits.
//!
//! Behaves like a real relay where it matters to the engine:
//! - duplicate ids are stored once
//! - replaceable kinds keep only the newest event per author
//! - subscriptions replay stored matches, then send EOSE, then live events
//!
//! Fault injection makes the next N queries/subscribes/publishes fail, and
//! [`MemoryRelay::drop_subscriptions`] breaks every open subscription.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, RwLock};

use super::event::Event;
use super::filter::Filter;
use super::traits::{EventStream, RelayClient, RelayError, SubscriptionItem};

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum LiveSignal {
    Event(Event),
    Drop,
}

#[derive(Debug, Default)]
struct Faults {
    queries: usize,
    subscribes: usize,
    publishes: usize,
}

/// In-process relay
pub struct MemoryRelay {
    events: RwLock<Vec<Event>>,
    live: broadcast::Sender<LiveSignal>,
    faults: Mutex<Faults>,
    queries: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            events: RwLock::new(Vec::new()),
            live,
            faults: Mutex::new(Faults::default()),
            queries: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Accept an event from another client (store and fan out)
    pub async fn inject(&self, event: Event) -> bool {
        let stored = self.store(event.clone()).await;
        if stored {
            // No receivers is fine
            let _ = self.live.send(LiveSignal::Event(event));
        }
        stored
    }

    /// Replay an event to live subscribers without storing it again
    pub fn replay_live(&self, event: Event) {
        let _ = self.live.send(LiveSignal::Event(event));
    }

    /// Break every open subscription
    pub fn drop_subscriptions(&self) {
        let _ = self.live.send(LiveSignal::Drop);
    }

    pub fn fail_next_queries(&self, n: usize) {
        self.with_faults(|f| f.queries = n);
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.with_faults(|f| f.subscribes = n);
    }

    pub fn fail_next_publishes(&self, n: usize) {
        self.with_faults(|f| f.publishes = n);
    }

    /// Number of queries served (including failed ones)
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of subscriptions opened
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Stored events of one kind
    pub async fn events_of_kind(&self, kind: u16) -> Vec<Event> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    async fn store(&self, event: Event) -> bool {
        let mut events = self.events.write().await;

        if events.iter().any(|e| e.id == event.id) {
            return false;
        }

        if event.is_replaceable() {
            let newer_exists = events.iter().any(|e| {
                e.kind == event.kind && e.pubkey == event.pubkey && e.created_at > event.created_at
            });
            if newer_exists {
                return false;
            }
            events.retain(|e| !(e.kind == event.kind && e.pubkey == event.pubkey));
        }

        events.push(event);
        true
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> T {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut faults)
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        self.with_faults(|f| {
            let remaining = pick(f);
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        })
    }

    async fn matching(&self, filter: &Filter) -> Vec<Event> {
        let mut found: Vec<Event> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        // Newest first, like real relays
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        found
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn query(&self, filter: &Filter, _relays: &[String]) -> Result<Vec<Event>, RelayError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.take_fault(|f| &mut f.queries) {
            return Err(RelayError::Connection("injected query failure".to_string()));
        }
        Ok(self.matching(filter).await)
    }

    async fn subscribe(&self, filter: &Filter, _relays: &[String]) -> Result<EventStream, RelayError> {
        if self.take_fault(|f| &mut f.subscribes) {
            return Err(RelayError::Connection("injected subscribe failure".to_string()));
        }
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        // Subscribe before reading history so nothing slips between the two
        let receiver = self.live.subscribe();
        let mut stored = self.matching(filter).await;
        stored.reverse();

        let replay = stream::iter(
            stored
                .into_iter()
                .map(|e| Ok(SubscriptionItem::Event(e)))
                .chain(std::iter::once(Ok(SubscriptionItem::EndOfStoredEvents))),
        );

        let filter = filter.clone();
        let live = stream::unfold(Some(receiver), move |state| {
            let filter = filter.clone();
            async move {
                let mut receiver = state?;
                loop {
                    match receiver.recv().await {
                        Ok(LiveSignal::Event(event)) if filter.matches(&event) => {
                            return Some((Ok(SubscriptionItem::Event(event)), Some(receiver)));
                        }
                        Ok(LiveSignal::Event(_)) => continue,
                        Ok(LiveSignal::Drop) => return Some((Err(RelayError::Closed), None)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(replay.chain(live).boxed())
    }

    async fn publish(&self, event: &Event, _relays: &[String]) -> Result<(), RelayError> {
        if self.take_fault(|f| &mut f.publishes) {
            return Err(RelayError::Connection("injected publish failure".to_string()));
        }
        event
            .verify()
            .map_err(|e| RelayError::Rejected(e.to_string()))?;

        self.inject(event.clone()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::event::{kind, Tag, UnsignedEvent};
    use crate::relay::{KeySigner, Signer};

    async fn signed(signer: &KeySigner, kind: u16, created_at: u64, tags: Vec<Tag>) -> Event {
        signer
            .sign(UnsignedEvent::new("", kind, tags, "").with_created_at(created_at))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_ids_stored_once() {
        let relay = MemoryRelay::new();
        let signer = KeySigner::generate();
        let event = signed(&signer, kind::NUTZAP, 10, vec![]).await;

        assert!(relay.inject(event.clone()).await);
        assert!(!relay.inject(event).await);
        assert_eq!(relay.events_of_kind(kind::NUTZAP).await.len(), 1);
    }

    #[tokio::test]
    async fn test_replaceable_keeps_newest() {
        let relay = MemoryRelay::new();
        let signer = KeySigner::generate();

        let old = signed(&signer, kind::NUTZAP_INFO, 10, vec![]).await;
        let new = signed(&signer, kind::NUTZAP_INFO, 20, vec![]).await;

        relay.inject(new.clone()).await;
        assert!(!relay.inject(old).await);

        let stored = relay.events_of_kind(kind::NUTZAP_INFO).await;
        assert_eq!(stored, vec![new]);
    }

    #[tokio::test]
    async fn test_injected_query_failure() {
        let relay = MemoryRelay::new();
        relay.fail_next_queries(1);

        assert!(relay.query(&Filter::new(), &[]).await.is_err());
        assert!(relay.query(&Filter::new(), &[]).await.is_ok());
        assert_eq!(relay.query_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_unverifiable() {
        let relay = MemoryRelay::new();
        let signer = KeySigner::generate();
        let mut event = signed(&signer, kind::NUTZAP, 10, vec![]).await;
        event.content = "tampered".to_string();

        assert!(matches!(
            relay.publish(&event, &[]).await,
            Err(RelayError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_replays_then_streams() {
        let relay = MemoryRelay::new();
        let signer = KeySigner::generate();
        let filter = Filter::new().kind(kind::NUTZAP);

        let first = signed(&signer, kind::NUTZAP, 10, vec![]).await;
        relay.inject(first.clone()).await;

        let mut sub = relay.subscribe(&filter, &[]).await.unwrap();
        assert_eq!(
            sub.next().await,
            Some(Ok(SubscriptionItem::Event(first)))
        );
        assert_eq!(
            sub.next().await,
            Some(Ok(SubscriptionItem::EndOfStoredEvents))
        );

        let ignored = signed(&signer, kind::NUTZAP_INFO, 11, vec![]).await;
        let second = signed(&signer, kind::NUTZAP, 12, vec![]).await;
        relay.inject(ignored).await;
        relay.inject(second.clone()).await;
        assert_eq!(
            sub.next().await,
            Some(Ok(SubscriptionItem::Event(second)))
        );

        relay.drop_subscriptions();
        assert_eq!(sub.next().await, Some(Err(RelayError::Closed)));
        assert_eq!(sub.next().await, None);
    }
}
