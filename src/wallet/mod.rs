//! Wallet Ledger Module
//!
//! The local unspent-proof balance tokens are redeemed into. Mint-side
//! swapping is the implementation's business; the engine only relies on
//! [`WalletLedger::add_proofs`] tolerating the same proofs twice.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Proof;

pub use memory::{LedgerEntry, MemoryWallet};

/// Wallet errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("mint unavailable: {0}")]
    MintUnavailable(String),

    #[error("proofs rejected: {0}")]
    Rejected(String),

    #[error("wallet storage error: {0}")]
    Storage(String),
}

impl WalletError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WalletError::Rejected(_))
    }
}

/// Local unspent-proof ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Add proofs from a mint, returning the ledger entry id
    ///
    /// Adding proofs that are already held must succeed without double
    /// counting them.
    async fn add_proofs(&self, mint_url: &str, proofs: &[Proof]) -> Result<String, WalletError>;

    /// Total unspent amount
    async fn balance(&self) -> Result<u64, WalletError>;
}
