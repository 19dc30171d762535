//! In-Memory Wallet
//!
//! Proofs are keyed by secret, so re-adding a proof is a no-op that returns
//! the entry that first stored it. Data is lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{WalletError, WalletLedger};
use crate::relay::unix_now;
use crate::types::{normalize_mint_url, Proof};

/// One `add_proofs` call that stored something
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: String,
    pub mint_url: String,
    pub amount: u64,
    pub proof_count: usize,
    pub created_at: u64,
}

#[derive(Default)]
struct WalletState {
    /// secret -> (entry id, mint, proof)
    proofs: HashMap<String, (String, String, Proof)>,
    entries: Vec<LedgerEntry>,
}

/// In-memory wallet with fault injection
#[derive(Clone, Default)]
pub struct MemoryWallet {
    state: Arc<RwLock<WalletState>>,
    fail_adds: Arc<AtomicUsize>,
    add_calls: Arc<AtomicUsize>,
}

impl MemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` adds fail as if the mint were down
    pub fn fail_next_adds(&self, n: usize) {
        self.fail_adds.store(n, Ordering::SeqCst);
    }

    /// Number of `add_proofs` calls, including failed ones
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.read().await.entries.clone()
    }

    pub async fn balance_for_mint(&self, mint_url: &str) -> u64 {
        let mint_url = normalize_mint_url(mint_url);
        self.state
            .read()
            .await
            .proofs
            .values()
            .filter(|(_, mint, _)| *mint == mint_url)
            .map(|(_, _, p)| p.amount)
            .sum()
    }

    fn take_fault(&self) -> bool {
        self.fail_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WalletLedger for MemoryWallet {
    async fn add_proofs(&self, mint_url: &str, proofs: &[Proof]) -> Result<String, WalletError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_fault() {
            return Err(WalletError::MintUnavailable("injected add failure".to_string()));
        }
        if proofs.is_empty() {
            return Err(WalletError::Rejected("no proofs".to_string()));
        }

        let mint_url = normalize_mint_url(mint_url);
        let mut state = self.state.write().await;

        let fresh: Vec<&Proof> = proofs
            .iter()
            .filter(|p| !state.proofs.contains_key(&p.secret))
            .collect();

        if fresh.is_empty() {
            // Everything already held: report the original entry
            return state
                .proofs
                .get(&proofs[0].secret)
                .map(|(entry_id, _, _)| entry_id.clone())
                .ok_or_else(|| WalletError::Storage("proof index out of sync".to_string()));
        }

        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            mint_url: mint_url.clone(),
            amount: fresh.iter().map(|p| p.amount).sum(),
            proof_count: fresh.len(),
            created_at: unix_now(),
        };
        for proof in fresh {
            state.proofs.insert(
                proof.secret.clone(),
                (entry.id.clone(), mint_url.clone(), proof.clone()),
            );
        }

        let id = entry.id.clone();
        state.entries.push(entry);
        Ok(id)
    }

    async fn balance(&self) -> Result<u64, WalletError> {
        Ok(self
            .state
            .read()
            .await
            .proofs
            .values()
            .map(|(_, _, p)| p.amount)
            .sum())
    }
}
