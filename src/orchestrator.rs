//! Redemption Orchestrator
//!
//! Couples a discovery feed to the redemption ledger for one recipient.
//!
//! - Every discovered token is redeemed; outcomes become [`Notification`]s
//! - Failed tokens are persisted with a manual-redemption token string
//! - The discovery watermark advances only past settled tokens: it is the
//!   newest `created_at` observed, capped at the oldest token that failed in
//!   this run. Catch-up is persisted once the batch completes, live outcomes
//!   one by one.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::config::EngineConfig;
use crate::common::error::{EngineError, Result};
use crate::common::logging::{generate_correlation_id, log_discovery_event};
use crate::feed::{FeedHandle, FeedState, NutzapDiscoveryFeed, Origin, TokenSink};
use crate::ledger::{RedemptionLedger, RedemptionOutcome};
use crate::relay::{unix_now, RelayClient, Signer};
use crate::resolver::AcceptanceInfoResolver;
use crate::storage::EngineStore;
use crate::types::IncomingToken;
use crate::wallet::WalletLedger;

/// User-facing event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Received {
        token_id: String,
        amount: u64,
        unit: String,
        comment: String,
        sender: String,
    },
    RedemptionFailed {
        token_id: String,
        amount: u64,
        reason: String,
        /// `cashuA…` string redeemable in any wallet
        manual_token: String,
    },
    /// The recipient publishes no usable acceptance info
    DiscoveryUnavailable { owner: String },
    DiscoveryFailed { owner: String, reason: String },
}

/// Notification delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::Received {
                token_id,
                amount,
                unit,
                comment,
                sender,
            } => info!(
                target: "nutzapd::notify",
                token_id = %token_id,
                amount,
                unit = %unit,
                sender = %sender,
                comment = %comment,
                "Received nutzap"
            ),
            Notification::RedemptionFailed {
                token_id,
                amount,
                reason,
                manual_token,
            } => warn!(
                target: "nutzapd::notify",
                token_id = %token_id,
                amount,
                reason = %reason,
                manual_token = %manual_token,
                "Nutzap could not be redeemed"
            ),
            Notification::DiscoveryUnavailable { owner } => info!(
                target: "nutzapd::notify",
                owner = %owner,
                "No acceptance info published; nutzaps cannot be discovered"
            ),
            Notification::DiscoveryFailed { owner, reason } => warn!(
                target: "nutzapd::notify",
                owner = %owner,
                reason = %reason,
                "Nutzap discovery failed"
            ),
        }
    }
}

/// Orchestrator statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub tokens_seen: u64,
    pub redeemed: u64,
    pub already_redeemed: u64,
    pub failed: u64,
    /// Tokens re-attempted through `retry_failed`
    pub retried: u64,
    pub total_amount_redeemed: u64,
    /// Last persisted watermark
    pub watermark: Option<u64>,
}

/// Feed-to-ledger orchestration for one recipient at a time
pub struct RedemptionOrchestrator {
    feed: NutzapDiscoveryFeed,
    core: Arc<Core>,
    running: Mutex<Option<Run>>,
}

struct Run {
    owner: String,
    sink: Arc<RedemptionSink>,
    handle: FeedHandle,
}

/// Shared redemption path of the feed sink and `retry_failed`
struct Core {
    ledger: Arc<RedemptionLedger>,
    store: Arc<dyn EngineStore>,
    notifier: Arc<dyn Notifier>,
    stats: RwLock<OrchestratorStats>,
}

impl RedemptionOrchestrator {
    pub fn new(
        feed: NutzapDiscoveryFeed,
        ledger: Arc<RedemptionLedger>,
        store: Arc<dyn EngineStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            feed,
            core: Arc::new(Core {
                ledger,
                store,
                notifier,
                stats: RwLock::new(OrchestratorStats::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Wire resolver, feed and ledger from configuration
    pub fn from_config(
        config: &EngineConfig,
        relay: Arc<dyn RelayClient>,
        signer: Arc<dyn Signer>,
        wallet: Arc<dyn WalletLedger>,
        store: Arc<dyn EngineStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let resolver = Arc::new(AcceptanceInfoResolver::new(
            relay.clone(),
            config.relays.clone(),
            config.resolve_timeout,
        ));
        let feed = NutzapDiscoveryFeed::new(relay.clone(), resolver, config.feed_config());
        let ledger = Arc::new(RedemptionLedger::new(
            relay,
            signer,
            wallet,
            config.relays.clone(),
            config.query_timeout,
        ));
        Self::new(feed, ledger, store, notifier)
    }

    /// Start discovering and redeeming tokens for `owner_key`
    ///
    /// Resumes from the persisted watermark. Fails if a feed is still
    /// running; a feed that already stopped on its own is replaced.
    /// `owner_key` must be the ledger's signing identity.
    pub async fn start(&self, owner_key: &str) -> Result<()> {
        let local = self.core.ledger.owner_key();
        if owner_key != local {
            return Err(EngineError::OwnerMismatch {
                requested: owner_key.to_string(),
                local,
            });
        }

        let mut running = self.running.lock().await;
        if let Some(run) = running.as_ref() {
            if !run.handle.is_finished() {
                return Err(EngineError::AlreadyRunning(run.owner.clone()));
            }
        }

        let watermark = self.core.store.watermark(owner_key).await?;
        match self.core.ledger.load_history().await {
            Ok(records) => debug!(
                target: "nutzapd::orchestrator",
                entries = records.len(),
                "Loaded redemption history"
            ),
            Err(e) => warn!(
                target: "nutzapd::orchestrator",
                error = %e,
                "Could not preload redemption history"
            ),
        }

        let correlation_id = generate_correlation_id();
        let sink = Arc::new(RedemptionSink {
            owner: owner_key.to_string(),
            correlation_id: correlation_id.clone(),
            core: self.core.clone(),
            watermark: Mutex::new(Watermark::new(watermark)),
        });
        let handle = self.feed.run(owner_key, watermark, sink.clone());

        info!(
            target: "nutzapd::orchestrator",
            owner = %owner_key,
            correlation_id = %correlation_id,
            watermark = ?watermark,
            "Orchestrator started"
        );

        *running = Some(Run {
            owner: owner_key.to_string(),
            sink,
            handle,
        });
        Ok(())
    }

    /// Cancel the feed and wait for it
    ///
    /// An in-flight redemption completes before this returns.
    pub async fn stop(&self) -> Result<FeedState> {
        let run = self
            .running
            .lock()
            .await
            .take()
            .ok_or(EngineError::NotRunning)?;

        let state = run.handle.shutdown().await;
        run.sink.persist_watermark().await;

        info!(
            target: "nutzapd::orchestrator",
            owner = %run.owner,
            state = %state,
            "Orchestrator stopped"
        );
        Ok(state)
    }

    /// Feed state of the current run
    pub async fn state(&self) -> Option<FeedState> {
        self.running.lock().await.as_ref().map(|run| run.handle.state())
    }

    pub async fn stats(&self) -> OrchestratorStats {
        self.core.stats.read().await.clone()
    }

    /// Re-attempt every persisted unredeemed token of the local identity
    ///
    /// Failures are re-persisted without another notification.
    pub async fn retry_failed(&self) -> Result<Vec<(String, RedemptionOutcome)>> {
        let owner = self.core.ledger.owner_key();
        let pending = self.core.store.list_unredeemed(&owner).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let sink = self
            .running
            .lock()
            .await
            .as_ref()
            .filter(|run| run.owner == owner)
            .map(|run| run.sink.clone());

        let mut results = Vec::with_capacity(pending.len());
        for record in pending {
            self.core.stats.write().await.retried += 1;
            let token_id = record.token.id.clone();
            let outcome = self.core.redeem(&record.owner_key, record.token, false).await;

            if let Some(sink) = &sink {
                if !matches!(outcome, RedemptionOutcome::Failed(_)) {
                    sink.watermark.lock().await.settle(&token_id);
                }
            }
            results.push((token_id, outcome));
        }

        if let Some(sink) = sink {
            sink.persist_watermark().await;
        }
        Ok(results)
    }
}

impl Core {
    async fn redeem(
        &self,
        owner: &str,
        mut token: IncomingToken,
        notify_failure: bool,
    ) -> RedemptionOutcome {
        let outcome = self.ledger.redeem(&mut token).await;

        match &outcome {
            RedemptionOutcome::Redeemed { amount, .. } => {
                {
                    let mut stats = self.stats.write().await;
                    stats.redeemed += 1;
                    stats.total_amount_redeemed += amount;
                }
                self.forget(&token.id).await;
                self.notifier
                    .notify(Notification::Received {
                        token_id: token.id.clone(),
                        amount: *amount,
                        unit: token.unit.clone(),
                        comment: token.comment.clone(),
                        sender: token.sender_key.clone(),
                    })
                    .await;
            }
            RedemptionOutcome::AlreadyRedeemed => {
                self.stats.write().await.already_redeemed += 1;
                self.forget(&token.id).await;
            }
            RedemptionOutcome::Failed(reason) => {
                self.stats.write().await.failed += 1;
                let reason = reason.to_string();
                if let Err(e) = self.store.save_unredeemed(owner, &token, &reason).await {
                    warn!(
                        target: "nutzapd::orchestrator",
                        token_id = %token.id,
                        error = %e,
                        "Could not persist unredeemed token"
                    );
                }
                if notify_failure {
                    self.notifier
                        .notify(Notification::RedemptionFailed {
                            token_id: token.id.clone(),
                            amount: token.total_amount(),
                            reason,
                            manual_token: token.to_cashu_token(),
                        })
                        .await;
                }
            }
        }
        outcome
    }

    async fn forget(&self, token_id: &str) {
        if let Err(e) = self.store.remove_unredeemed(token_id).await {
            warn!(target: "nutzapd::orchestrator", token_id = %token_id, error = %e, "Could not clear unredeemed token");
        }
    }
}

/// Watermark bookkeeping for one run
struct Watermark {
    max_observed: Option<u64>,
    /// Tokens that failed in this run, by id
    failed: HashMap<String, u64>,
    persisted: Option<u64>,
}

impl Watermark {
    fn new(persisted: Option<u64>) -> Self {
        Self {
            max_observed: None,
            failed: HashMap::new(),
            persisted,
        }
    }

    /// Timestamps ahead of the local clock count as now
    fn observe(&mut self, created_at: u64) {
        let created_at = created_at.min(unix_now());
        self.max_observed = Some(self.max_observed.map_or(created_at, |m| m.max(created_at)));
    }

    fn fail(&mut self, token_id: &str, created_at: u64) {
        self.failed.insert(token_id.to_string(), created_at.min(unix_now()));
    }

    fn settle(&mut self, token_id: &str) {
        self.failed.remove(token_id);
    }

    fn candidate(&self) -> Option<u64> {
        let max = self.max_observed?;
        Some(match self.failed.values().min() {
            Some(&oldest_failed) => max.min(oldest_failed),
            None => max,
        })
    }

    /// Candidate not yet persisted
    fn pending(&self) -> Option<u64> {
        self.candidate().filter(|c| Some(*c) != self.persisted)
    }
}

struct RedemptionSink {
    owner: String,
    correlation_id: String,
    core: Arc<Core>,
    watermark: Mutex<Watermark>,
}

impl RedemptionSink {
    async fn persist_watermark(&self) {
        let mut watermark = self.watermark.lock().await;
        let Some(value) = watermark.pending() else {
            return;
        };

        match self.core.store.set_watermark(&self.owner, value).await {
            Ok(()) => {
                watermark.persisted = Some(value);
                self.core.stats.write().await.watermark = Some(value);
                debug!(target: "nutzapd::orchestrator", owner = %self.owner, watermark = value, "Watermark persisted");
            }
            Err(e) => warn!(
                target: "nutzapd::orchestrator",
                owner = %self.owner,
                error = %e,
                "Could not persist watermark"
            ),
        }
    }
}

#[async_trait]
impl TokenSink for RedemptionSink {
    async fn on_token(&self, token: IncomingToken, origin: Origin) {
        self.core.stats.write().await.tokens_seen += 1;
        self.watermark.lock().await.observe(token.created_at);

        let token_id = token.id.clone();
        let created_at = token.created_at;
        debug!(
            target: "nutzapd::orchestrator",
            correlation_id = %self.correlation_id,
            token_id = %token_id,
            ?origin,
            "Redeeming discovered token"
        );
        let outcome = self.core.redeem(&self.owner, token, true).await;

        {
            let mut watermark = self.watermark.lock().await;
            match outcome {
                RedemptionOutcome::Failed(_) => watermark.fail(&token_id, created_at),
                _ => watermark.settle(&token_id),
            }
        }

        if origin == Origin::Live {
            self.persist_watermark().await;
        }
    }

    async fn on_catch_up_complete(&self, max_created_at: Option<u64>) {
        if let Some(max) = max_created_at {
            self.watermark.lock().await.observe(max);
        }
        self.persist_watermark().await;
    }

    async fn on_state(&self, state: &FeedState) {
        let notification = match state {
            FeedState::Unavailable => {
                log_discovery_event("unavailable", &self.owner, None, false);
                Notification::DiscoveryUnavailable {
                    owner: self.owner.clone(),
                }
            }
            FeedState::Failed(reason) => {
                log_discovery_event("failed", &self.owner, Some(reason.as_str()), false);
                Notification::DiscoveryFailed {
                    owner: self.owner.clone(),
                    reason: reason.clone(),
                }
            }
            _ => return,
        };
        self.core.notifier.notify(notification).await;
    }
}
