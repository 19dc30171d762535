//! Redemption Ledger
//!
//! Exactly-once redemption of incoming tokens:
//!
//! 1. **Gate**: skip ids already known locally or recorded in a history
//!    event authored by the owner. If the lookup fails nothing is applied.
//! 2. **Apply**: add the proofs to the wallet.
//! 3. **Record**: publish an encrypted history event tagging the token id.
//!
//! A failure after apply leaves the id unrecorded; the next attempt
//! re-applies, which the wallet tolerates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::common::logging::log_redemption_event;
use crate::feed::DedupSet;
use crate::relay::{kind, Event, Filter, RelayClient, RelayError, Signer, SignerError};
use crate::types::{
    history_event, redeemed_ids, Direction, HistoryContent, IncomingToken, RedemptionRecord,
};
use crate::wallet::{WalletError, WalletLedger};

/// Ledger lookup/publish errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("relay request timed out")]
    Timeout,

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),
}

/// Why a redemption did not happen
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RedemptionFailure {
    #[error("token has no proofs")]
    NoProofs,

    #[error("could not check redemption history: {0}")]
    Lookup(String),

    #[error("wallet rejected proofs: {0}")]
    Apply(WalletError),

    #[error("could not record redemption: {0}")]
    Record(String),
}

/// Result of one `redeem` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    Redeemed { amount: u64, ledger_entry_id: String },
    AlreadyRedeemed,
    Failed(RedemptionFailure),
}

/// Ids kept in the local known-redeemed cache
pub const DEFAULT_KNOWN_CAPACITY: usize = 10_000;

/// Idempotent redemption into the wallet
pub struct RedemptionLedger {
    relay: Arc<dyn RelayClient>,
    signer: Arc<dyn Signer>,
    wallet: Arc<dyn WalletLedger>,
    relays: Vec<String>,
    timeout: Duration,
    /// Bounded cache in front of the history lookup; evicted ids are
    /// found again on the relays
    known: RwLock<DedupSet>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RedemptionLedger {
    pub fn new(
        relay: Arc<dyn RelayClient>,
        signer: Arc<dyn Signer>,
        wallet: Arc<dyn WalletLedger>,
        relays: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            relay,
            signer,
            wallet,
            relays,
            timeout,
            known: RwLock::new(DedupSet::new(DEFAULT_KNOWN_CAPACITY)),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_known_capacity(mut self, capacity: usize) -> Self {
        self.known = RwLock::new(DedupSet::new(capacity));
        self
    }

    pub fn owner_key(&self) -> String {
        self.signer.public_key()
    }

    /// Redeem a token at most once
    ///
    /// Concurrent calls for the same id are serialized; `token.redeemed` is
    /// set when the token is (or already was) redeemed.
    pub async fn redeem(&self, token: &mut IncomingToken) -> RedemptionOutcome {
        if token.proofs.is_empty() {
            return RedemptionOutcome::Failed(RedemptionFailure::NoProofs);
        }

        let lock = self.lock_for(&token.id);
        let outcome = {
            let _guard = lock.lock().await;
            self.redeem_locked(token).await
        };
        self.release_lock(&token.id, lock);

        match &outcome {
            RedemptionOutcome::Redeemed { amount, .. } => {
                log_redemption_event("redeemed", &token.id, &token.mint_url, *amount, true, None)
            }
            RedemptionOutcome::AlreadyRedeemed => {
                debug!(target: "nutzapd::ledger", token_id = %token.id, "Already redeemed");
            }
            RedemptionOutcome::Failed(reason) => log_redemption_event(
                "redeem_failed",
                &token.id,
                &token.mint_url,
                token.total_amount(),
                false,
                Some(&reason.to_string()),
            ),
        }
        outcome
    }

    async fn redeem_locked(&self, token: &mut IncomingToken) -> RedemptionOutcome {
        match self.is_redeemed(&token.id).await {
            Ok(true) => {
                token.redeemed = true;
                return RedemptionOutcome::AlreadyRedeemed;
            }
            Ok(false) => {}
            Err(e) => return RedemptionOutcome::Failed(RedemptionFailure::Lookup(e.to_string())),
        }

        let amount = token.total_amount();
        let ledger_entry_id = match self.wallet.add_proofs(&token.mint_url, &token.proofs).await {
            Ok(id) => id,
            Err(e) => return RedemptionOutcome::Failed(RedemptionFailure::Apply(e)),
        };

        if let Err(e) = self.record(token, amount, &ledger_entry_id).await {
            warn!(
                target: "nutzapd::ledger",
                token_id = %token.id,
                entry = %ledger_entry_id,
                error = %e,
                "Proofs applied but history not recorded"
            );
            return RedemptionOutcome::Failed(RedemptionFailure::Record(e.to_string()));
        }

        self.known.write().await.insert(&token.id);
        token.redeemed = true;
        info!(
            target: "nutzapd::ledger",
            token_id = %token.id,
            amount,
            entry = %ledger_entry_id,
            "Token redeemed"
        );

        RedemptionOutcome::Redeemed {
            amount,
            ledger_entry_id,
        }
    }

    /// Whether a history event already records this token id
    pub async fn is_redeemed(&self, token_id: &str) -> Result<bool, LedgerError> {
        if self.known.read().await.contains(token_id) {
            return Ok(true);
        }

        let owner = self.owner_key();
        let filter = Filter::new()
            .kind(kind::SPENDING_HISTORY)
            .author(owner.as_str())
            .event(token_id);
        let events = self.query(&filter).await?;

        let found = events
            .iter()
            .filter(|e| is_own_history(e, &owner))
            .any(|e| redeemed_ids(e).iter().any(|id| id == token_id));

        if found {
            self.known.write().await.insert(token_id);
        }
        Ok(found)
    }

    /// Decrypt every history event of the owner
    ///
    /// Also seeds the known-redeemed set. Entries that fail to decrypt or
    /// parse are skipped.
    pub async fn load_history(&self) -> Result<Vec<RedemptionRecord>, LedgerError> {
        let owner = self.owner_key();
        let filter = Filter::new().kind(kind::SPENDING_HISTORY).author(owner.as_str());
        let events = self.query(&filter).await?;

        let mut records = Vec::new();
        for event in events.iter().filter(|e| is_own_history(e, &owner)) {
            let plaintext = match self.signer.decrypt(&owner, &event.content).await {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(target: "nutzapd::ledger", event_id = %event.id, error = %e, "Undecryptable history entry");
                    continue;
                }
            };
            match RedemptionRecord::from_event(event, &plaintext) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(target: "nutzapd::ledger", event_id = %event.id, error = %e, "Malformed history entry");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.event_id.cmp(&b.event_id)));

        let mut known = self.known.write().await;
        for record in records.iter().filter(|r| r.direction == Direction::In) {
            for id in &record.source_event_ids {
                known.insert(id);
            }
        }
        Ok(records)
    }

    async fn record(
        &self,
        token: &IncomingToken,
        amount: u64,
        ledger_entry_id: &str,
    ) -> Result<Event, LedgerError> {
        let owner = self.owner_key();
        let content = HistoryContent {
            direction: Direction::In,
            amount,
            created: vec![ledger_entry_id.to_string()],
        };
        let sealed = self.signer.encrypt(&owner, &content.encode()).await?;
        let event = self
            .signer
            .sign(history_event(sealed, &[token.id.clone()], &token.sender_key))
            .await?;

        tokio::time::timeout(self.timeout, self.relay.publish(&event, &self.relays))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(event)
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<Event>, LedgerError> {
        let events = tokio::time::timeout(self.timeout, self.relay.query(filter, &self.relays))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(events)
    }

    fn lock_for(&self, token_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(token_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, token_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        // Only the map's own reference left: nobody is waiting
        if locks.get(token_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(token_id);
        }
    }
}

fn is_own_history(event: &Event, owner: &str) -> bool {
    event.kind == kind::SPENDING_HISTORY && event.pubkey == owner && event.verify().is_ok()
}
