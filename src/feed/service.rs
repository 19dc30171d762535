//! Feed Service
//!
//! One tokio task per recipient. Every network wait is raced against the
//! cancel signal; a sink call that has started is always allowed to finish.

use futures_util::StreamExt;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Backoff, DedupSet, FeedConfig, FeedState, Origin, TokenSink};
use crate::common::config::LiveMode;
use crate::relay::{kind, unix_now, Event, Filter, RelayClient, SubscriptionItem};
use crate::resolver::{AcceptanceInfoResolver, ResolveError};
use crate::types::{AcceptanceInfo, IncomingToken};
use crate::validator::{TokenProofValidator, Verdict};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Discovery feed factory
pub struct NutzapDiscoveryFeed {
    relay: Arc<dyn RelayClient>,
    resolver: Arc<AcceptanceInfoResolver>,
    validator: TokenProofValidator,
    config: FeedConfig,
}

impl NutzapDiscoveryFeed {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        resolver: Arc<AcceptanceInfoResolver>,
        config: FeedConfig,
    ) -> Self {
        Self {
            relay,
            resolver,
            validator: TokenProofValidator::new(),
            config,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Start discovering tokens addressed to `owner_key`
    ///
    /// Catch-up starts at `watermark` (inclusive) or at the beginning of
    /// time. Dropping the returned handle cancels the feed.
    pub fn run(
        &self,
        owner_key: &str,
        watermark: Option<u64>,
        sink: Arc<dyn TokenSink>,
    ) -> FeedHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(FeedState::Resolving);

        let worker = FeedWorker {
            relay: self.relay.clone(),
            resolver: self.resolver.clone(),
            validator: self.validator,
            config: self.config.clone(),
            owner: owner_key.to_string(),
            sink,
            cancel: cancel_rx,
            state: state_tx,
            dedup: DedupSet::new(self.config.dedup_capacity),
        };

        FeedHandle {
            cancel: cancel_tx,
            state: state_rx,
            task: tokio::spawn(worker.run(watermark)),
        }
    }
}

/// Control handle for a running feed
pub struct FeedHandle {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<FeedState>,
    task: JoinHandle<FeedState>,
}

impl FeedHandle {
    /// Request cancellation; returns immediately
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the feed to stop on its own
    pub async fn join(self) -> FeedState {
        let FeedHandle { cancel, task, .. } = self;
        let result = task.await;
        drop(cancel);
        result.unwrap_or_else(|e| FeedState::Failed(format!("feed task aborted: {}", e)))
    }

    /// Cancel and wait for the task to finish
    pub async fn shutdown(self) -> FeedState {
        self.cancel();
        self.join().await
    }
}

enum Attempt<T> {
    Ready(T),
    Retry(String),
    Fatal(FeedState),
}

struct FeedWorker {
    relay: Arc<dyn RelayClient>,
    resolver: Arc<AcceptanceInfoResolver>,
    validator: TokenProofValidator,
    config: FeedConfig,
    owner: String,
    sink: Arc<dyn TokenSink>,
    cancel: watch::Receiver<bool>,
    state: watch::Sender<FeedState>,
    dedup: DedupSet,
}

impl FeedWorker {
    async fn run(mut self, watermark: Option<u64>) -> FeedState {
        let terminal = match self.drive(watermark).await {
            Ok(never) => match never {},
            Err(state) => state,
        };

        info!(target: "nutzapd::feed", owner = %self.owner, state = %terminal, "Feed stopped");
        self.set_state(terminal.clone()).await;
        terminal
    }

    /// Runs until a terminal state is reached
    async fn drive(&mut self, watermark: Option<u64>) -> Result<Infallible, FeedState> {
        self.set_state(FeedState::Resolving).await;
        let info = self.resolve().await?;
        let relays = if info.relays.is_empty() {
            self.config.relays.clone()
        } else {
            info.relays.clone()
        };

        self.set_state(FeedState::CatchUp).await;
        let live_start = unix_now();
        let max_seen = self.catch_up(&info, &relays, watermark).await?;
        self.check_cancelled()?;
        self.sink.on_catch_up_complete(max_seen).await;

        // Rolling lower bound for live queries; inclusive, so the newest
        // observed message is seen again and dropped by dedup
        let mut since = live_start;
        loop {
            self.set_state(FeedState::Live).await;
            let reason = match self.config.live_mode {
                LiveMode::Subscribe => self.live_subscription(&info, &relays, &mut since).await?,
                LiveMode::Poll { interval } => {
                    self.live_poll(&info, &relays, &mut since, interval).await?
                }
            };

            warn!(
                target: "nutzapd::feed",
                owner = %self.owner,
                reason = %reason,
                since,
                "Live phase interrupted"
            );
            self.set_state(FeedState::Reconnecting).await;
            self.sleep(self.config.reconnect_backoff).await?;
        }
    }

    async fn resolve(&self) -> Result<Arc<AcceptanceInfo>, FeedState> {
        let resolver = &self.resolver;
        let owner = self.owner.as_str();

        self.with_retry("resolve", move || async move {
            match resolver.resolve(owner).await {
                Ok(info) => Attempt::Ready(info),
                Err(ResolveError::NotFound(_)) => Attempt::Fatal(FeedState::Unavailable),
                Err(e) if e.is_transient() => Attempt::Retry(e.to_string()),
                Err(e) => Attempt::Fatal(FeedState::Failed(e.to_string())),
            }
        })
        .await
    }

    async fn catch_up(
        &mut self,
        info: &AcceptanceInfo,
        relays: &[String],
        watermark: Option<u64>,
    ) -> Result<Option<u64>, FeedState> {
        let mut filter = self.nutzap_filter(info);
        if let Some(since) = watermark {
            filter = filter.since(since);
        }

        let this = &*self;
        let filter = &filter;
        let mut events = self
            .with_retry("catch-up query", move || this.query(filter, relays))
            .await?;
        sort_ascending(&mut events);

        let total = events.len();
        let mut max_seen = None;
        for event in events {
            self.check_cancelled()?;
            if let Some(created_at) = self.process(event, info, Origin::CatchUp).await? {
                max_seen = max_seen.max(Some(created_at));
            }
        }

        info!(
            target: "nutzapd::feed",
            owner = %self.owner,
            messages = total,
            since = ?watermark,
            "Catch-up complete"
        );
        Ok(max_seen)
    }

    /// Returns why the subscription has to be reopened
    async fn live_subscription(
        &mut self,
        info: &AcceptanceInfo,
        relays: &[String],
        since: &mut u64,
    ) -> Result<String, FeedState> {
        let filter = self.nutzap_filter(info).since(*since);
        let opened = until_cancelled(
            &self.cancel,
            tokio::time::timeout(self.config.query_timeout, self.relay.subscribe(&filter, relays)),
        )
        .await
        .ok_or(FeedState::Cancelled)?;

        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Ok(format!("subscribe failed: {}", e)),
            Err(_) => return Ok("subscribe timed out".to_string()),
        };
        debug!(target: "nutzapd::feed", owner = %self.owner, since = *since, "Subscription open");

        loop {
            let next = until_cancelled(
                &self.cancel,
                tokio::time::timeout(self.config.watchdog, stream.next()),
            )
            .await
            .ok_or(FeedState::Cancelled)?;

            match next {
                Err(_) => return Ok("watchdog expired".to_string()),
                Ok(None) => return Ok("subscription ended".to_string()),
                Ok(Some(Err(e))) => return Ok(format!("subscription error: {}", e)),
                Ok(Some(Ok(SubscriptionItem::Event(event)))) => {
                    if let Some(created_at) = self.process(event, info, Origin::Live).await? {
                        *since = (*since).max(created_at);
                    }
                }
                Ok(Some(Ok(SubscriptionItem::EndOfStoredEvents))) => {
                    trace!(target: "nutzapd::feed", owner = %self.owner, "End of stored events");
                }
                Ok(Some(Ok(SubscriptionItem::Alive))) => {}
            }
        }
    }

    /// Returns why polling has to back off
    async fn live_poll(
        &mut self,
        info: &AcceptanceInfo,
        relays: &[String],
        since: &mut u64,
        interval: Duration,
    ) -> Result<String, FeedState> {
        loop {
            self.sleep(interval).await?;

            let filter = self.nutzap_filter(info).since(*since);
            let attempt = until_cancelled(&self.cancel, self.query(&filter, relays))
                .await
                .ok_or(FeedState::Cancelled)?;
            let mut events = match attempt {
                Attempt::Ready(events) => events,
                Attempt::Retry(reason) => return Ok(reason),
                Attempt::Fatal(FeedState::Failed(reason)) => return Ok(reason),
                Attempt::Fatal(state) => return Err(state),
            };
            sort_ascending(&mut events);

            for event in events {
                self.check_cancelled()?;
                if let Some(created_at) = self.process(event, info, Origin::Live).await? {
                    *since = (*since).max(created_at);
                }
            }
        }
    }

    /// Verify, dedup, parse, validate and deliver one message
    ///
    /// Returns the message timestamp when it is an authentic nutzap for the
    /// owner, whether or not it was delivered.
    async fn process(
        &mut self,
        event: Event,
        info: &AcceptanceInfo,
        origin: Origin,
    ) -> Result<Option<u64>, FeedState> {
        if let Err(e) = event.verify() {
            debug!(target: "nutzapd::feed", event_id = %event.id, error = %e, "Dropping unverifiable message");
            return Ok(None);
        }
        if event.kind != kind::NUTZAP || !event.has_tag_value("p", &self.owner) {
            debug!(target: "nutzapd::feed", event_id = %event.id, "Dropping message not addressed to owner");
            return Ok(None);
        }

        // Future timestamps must not push the watermark past real messages
        let observed = Some(event.created_at.min(unix_now()));

        if !self.dedup.insert(&event.id) {
            trace!(target: "nutzapd::feed", event_id = %event.id, "Duplicate message");
            return Ok(observed);
        }

        let token = match IncomingToken::from_event(&event) {
            Ok(token) => token,
            Err(e) => {
                debug!(target: "nutzapd::feed", event_id = %event.id, error = %e, "Unparseable nutzap");
                return Ok(observed);
            }
        };

        match self.validator.validate(&token, info) {
            Verdict::Rejected(reason) => {
                debug!(
                    target: "nutzapd::feed",
                    event_id = %token.id,
                    mint = %token.mint_url,
                    reason = %reason,
                    "Nutzap rejected"
                );
            }
            Verdict::Accepted { proofs, rejected } => {
                self.check_cancelled()?;
                let token = token.with_proofs(proofs);
                debug!(
                    target: "nutzapd::feed",
                    event_id = %token.id,
                    amount = token.total_amount(),
                    rejected_proofs = rejected,
                    origin = ?origin,
                    "Delivering nutzap"
                );
                self.sink.on_token(token, origin).await;
            }
        }
        Ok(observed)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, FeedState>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut backoff = Backoff::new(self.config.retry_base, MAX_RETRY_DELAY);
        loop {
            let attempt = until_cancelled(&self.cancel, op())
                .await
                .ok_or(FeedState::Cancelled)?;

            match attempt {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Fatal(state) => return Err(state),
                Attempt::Retry(reason) => {
                    if backoff.attempts() >= self.config.retry_attempts {
                        return Err(FeedState::Failed(format!("{} failed: {}", operation, reason)));
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        target: "nutzapd::feed",
                        owner = %self.owner,
                        operation,
                        error = %reason,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    async fn query(&self, filter: &Filter, relays: &[String]) -> Attempt<Vec<Event>> {
        match tokio::time::timeout(self.config.query_timeout, self.relay.query(filter, relays)).await {
            Ok(Ok(events)) => Attempt::Ready(events),
            Ok(Err(e)) if e.is_transient() => Attempt::Retry(e.to_string()),
            Ok(Err(e)) => Attempt::Fatal(FeedState::Failed(e.to_string())),
            Err(_) => Attempt::Retry("query timed out".to_string()),
        }
    }

    fn nutzap_filter(&self, info: &AcceptanceInfo) -> Filter {
        // Senders are not consistent about trailing slashes
        let mints = info
            .mint_urls()
            .into_iter()
            .flat_map(|url| [format!("{}/", url), url]);

        Filter::new()
            .kind(kind::NUTZAP)
            .pubkey(self.owner.as_str())
            .custom_tag('u', mints)
    }

    async fn set_state(&self, state: FeedState) {
        debug!(target: "nutzapd::feed", owner = %self.owner, state = %state, "Feed state");
        self.state.send_replace(state.clone());
        self.sink.on_state(&state).await;
    }

    async fn sleep(&self, duration: Duration) -> Result<(), FeedState> {
        until_cancelled(&self.cancel, tokio::time::sleep(duration))
            .await
            .ok_or(FeedState::Cancelled)
    }

    fn check_cancelled(&self) -> Result<(), FeedState> {
        if *self.cancel.borrow() || self.cancel.has_changed().is_err() {
            Err(FeedState::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn sort_ascending(events: &mut [Event]) {
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Run `fut` unless cancellation arrives first
async fn until_cancelled<F: Future>(cancel: &watch::Receiver<bool>, fut: F) -> Option<F::Output> {
    let mut cancel = cancel.clone();
    tokio::select! {
        biased;
        // A dropped handle counts as cancellation
        _ = cancel.wait_for(|cancelled| *cancelled) => None,
        output = fut => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, ChannelSink, SinkEvent};
    use crate::relay::{KeySigner, MemoryRelay, Signer};
    use tokio::sync::mpsc::UnboundedReceiver;

    const MINT: &str = "https://mint.a";
    const WAIT: Duration = Duration::from_secs(2);

    struct Setup {
        relay: Arc<MemoryRelay>,
        owner: KeySigner,
        lock: String,
        sender: KeySigner,
    }

    async fn setup() -> Setup {
        let relay = Arc::new(MemoryRelay::new());
        let owner = KeySigner::generate();
        let lock = KeySigner::generate().public_key();
        relay
            .inject(fixtures::announcement(&owner, &[], &[MINT], Some(&lock)).await.unwrap())
            .await;
        Setup {
            relay,
            owner,
            lock,
            sender: KeySigner::generate(),
        }
    }

    fn fast_config() -> FeedConfig {
        FeedConfig {
            reconnect_backoff: Duration::from_millis(20),
            retry_base: Duration::from_millis(1),
            retry_attempts: 2,
            ..FeedConfig::default()
        }
    }

    fn feed(relay: Arc<MemoryRelay>, config: FeedConfig) -> NutzapDiscoveryFeed {
        let resolver = Arc::new(AcceptanceInfoResolver::new(
            relay.clone(),
            vec![],
            Duration::from_secs(1),
        ));
        NutzapDiscoveryFeed::new(relay, resolver, config)
    }

    async fn zap(s: &Setup, amount: u64, created_at: Option<u64>) -> Event {
        let proofs = vec![fixtures::locked_proof(amount, &s.lock)];
        fixtures::nutzap(&s.sender, &s.owner.public_key(), MINT, &proofs, "zap", created_at)
            .await
            .unwrap()
    }

    async fn no_token(rx: &mut UnboundedReceiver<SinkEvent>) -> bool {
        fixtures::next_token(rx, Duration::from_millis(150)).await.is_none()
    }

    #[tokio::test]
    async fn test_catch_up_in_order_then_live() {
        let s = setup().await;
        let newer = zap(&s, 2, Some(2_000)).await;
        let older = zap(&s, 1, Some(1_000)).await;
        s.relay.inject(newer.clone()).await;
        s.relay.inject(older.clone()).await;

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        let (first, origin) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(first.id, older.id);
        assert_eq!(origin, Origin::CatchUp);
        let (second, _) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(second.id, newer.id);

        assert_eq!(
            fixtures::next_catch_up(&mut rx, WAIT).await,
            Some(Some(2_000))
        );
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);

        let live = zap(&s, 3, None).await;
        s.relay.inject(live.clone()).await;
        let (token, origin) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, live.id);
        assert_eq!(origin, Origin::Live);

        assert_eq!(handle.shutdown().await, FeedState::Cancelled);
    }

    #[tokio::test]
    async fn test_watermark_bounds_catch_up() {
        let s = setup().await;
        s.relay.inject(zap(&s, 1, Some(1_000)).await).await;
        let kept = zap(&s, 2, Some(2_000)).await;
        s.relay.inject(kept.clone()).await;

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), Some(2_000), sink);

        let (token, _) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, kept.id);
        assert!(no_token(&mut rx).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_future_timestamp_reported_as_now() {
        let s = setup().await;
        let far = unix_now() + 365 * 24 * 3600;
        let future = zap(&s, 1, Some(far)).await;
        s.relay.inject(future.clone()).await;

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        let (token, _) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, future.id);
        let max = fixtures::next_catch_up(&mut rx, WAIT).await.unwrap().unwrap();
        assert!(max < far);
        assert!(max <= unix_now());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_announcement_is_unavailable() {
        let relay = Arc::new(MemoryRelay::new());
        let owner = KeySigner::generate();
        relay
            .inject(fixtures::announcement(&owner, &[], &[MINT], None).await.unwrap())
            .await;

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(relay, fast_config()).run(&owner.public_key(), None, sink);

        assert_eq!(handle.join().await, FeedState::Unavailable);
        assert!(no_token(&mut rx).await);
    }

    #[tokio::test]
    async fn test_persistent_resolve_failure() {
        let s = setup().await;
        s.relay.fail_next_queries(10);

        let (sink, _rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        assert!(matches!(handle.join().await, FeedState::Failed(_)));
        // One attempt plus two retries
        assert_eq!(s.relay.query_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_catch_up_failure_recovers() {
        let s = setup().await;
        let event = zap(&s, 5, Some(1_000)).await;
        s.relay.inject(event.clone()).await;

        let feed = feed(s.relay.clone(), fast_config());
        // Warm the resolver cache so only the catch-up query hits the fault
        feed.resolver.resolve(&s.owner.public_key()).await.unwrap();
        s.relay.fail_next_queries(1);

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed.run(&s.owner.public_key(), None, sink);

        let (token, _) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, event.id);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_untrusted_and_foreign_messages_dropped() {
        let s = setup().await;
        let untrusted = fixtures::nutzap(
            &s.sender,
            &s.owner.public_key(),
            "https://mint.b",
            &[fixtures::locked_proof(1, &s.lock)],
            "",
            Some(1_000),
        )
        .await
        .unwrap();
        let wrong_lock = fixtures::nutzap(
            &s.sender,
            &s.owner.public_key(),
            MINT,
            &[fixtures::foreign_proof(1)],
            "",
            Some(1_001),
        )
        .await
        .unwrap();
        let mut forged = zap(&s, 9, Some(1_002)).await;
        forged.sig = "00".repeat(64);

        for event in [untrusted, wrong_lock, forged] {
            s.relay.inject(event).await;
        }

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        // Untrusted mint is filtered at the relay; the rest at validation
        assert_eq!(fixtures::next_catch_up(&mut rx, WAIT).await, Some(Some(1_001)));
        assert!(no_token(&mut rx).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_dedup_across_catch_up_and_live() {
        let s = setup().await;
        let event = zap(&s, 4, None).await;
        s.relay.inject(event.clone()).await;

        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        let (token, _) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, event.id);
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);

        s.relay.replay_live(event.clone());
        assert!(no_token(&mut rx).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_subscription_drop() {
        let s = setup().await;
        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);

        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);
        while s.relay.subscription_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        s.relay.drop_subscriptions();
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Reconnecting, WAIT).await);
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);

        let event = zap(&s, 7, None).await;
        s.relay.inject(event.clone()).await;
        let (token, origin) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, event.id);
        assert_eq!(origin, Origin::Live);
        assert!(s.relay.subscription_count() >= 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_watchdog_forces_reconnect() {
        let s = setup().await;
        let config = FeedConfig {
            watchdog: Duration::from_millis(50),
            ..fast_config()
        };
        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), config).run(&s.owner.public_key(), None, sink);

        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Reconnecting, WAIT).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_polling_live_mode() {
        let s = setup().await;
        let config = FeedConfig {
            live_mode: LiveMode::Poll {
                interval: Duration::from_millis(20),
            },
            ..fast_config()
        };
        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), config).run(&s.owner.public_key(), None, sink);
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);

        let event = zap(&s, 8, None).await;
        s.relay.inject(event.clone()).await;
        let (token, origin) = fixtures::next_token(&mut rx, WAIT).await.unwrap();
        assert_eq!(token.id, event.id);
        assert_eq!(origin, Origin::Live);

        // Re-polling the same window does not redeliver
        assert!(no_token(&mut rx).await);
        assert_eq!(s.relay.subscription_count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_delivery_after_cancel() {
        let s = setup().await;
        let (sink, mut rx) = ChannelSink::new();
        let handle = feed(s.relay.clone(), fast_config()).run(&s.owner.public_key(), None, sink);
        assert!(fixtures::wait_for_state(&mut rx, &FeedState::Live, WAIT).await);

        handle.cancel();
        s.relay.inject(zap(&s, 1, None).await).await;

        assert_eq!(handle.join().await, FeedState::Cancelled);
        assert!(no_token(&mut rx).await);
    }
}
