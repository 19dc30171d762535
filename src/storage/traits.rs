//! Storage Trait Definitions
//!
//! Durable engine state: the per-recipient discovery watermark and tokens
//! whose redemption failed and await a retry or manual redemption.
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::IncomingToken;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A token whose redemption failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnredeemedToken {
    pub owner_key: String,
    pub token: IncomingToken,
    /// Last failure reason
    pub reason: String,
    pub attempts: u32,
    pub first_failed_at: u64,
    pub updated_at: u64,
}

impl UnredeemedToken {
    /// Token string the user can paste into any wallet
    pub fn manual_token(&self) -> String {
        self.token.to_cashu_token()
    }
}

/// Engine state storage
///
/// Implementations:
/// - `SqliteEngineStore` - Production storage with SQLite
/// - `MemoryEngineStore` - In-memory storage for testing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Last persisted watermark for a recipient
    async fn watermark(&self, owner_key: &str) -> StorageResult<Option<u64>>;

    async fn set_watermark(&self, owner_key: &str, created_at: u64) -> StorageResult<()>;

    /// Insert a failed token, or bump its attempt count if already stored
    async fn save_unredeemed(
        &self,
        owner_key: &str,
        token: &IncomingToken,
        reason: &str,
    ) -> StorageResult<UnredeemedToken>;

    /// Returns whether a record was removed
    async fn remove_unredeemed(&self, token_id: &str) -> StorageResult<bool>;

    /// Unredeemed tokens of one recipient, oldest first
    async fn list_unredeemed(&self, owner_key: &str) -> StorageResult<Vec<UnredeemedToken>>;

    /// Unredeemed tokens of every recipient, oldest first
    async fn list_all_unredeemed(&self) -> StorageResult<Vec<UnredeemedToken>>;
}
