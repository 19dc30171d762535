//! In-Memory Storage Implementation
//!
//! Provides in-memory engine state for testing and simulation.
//! Data is lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{EngineStore, StorageResult, UnredeemedToken};
use crate::relay::unix_now;
use crate::types::IncomingToken;

/// In-memory engine store
///
/// Uses Arc<RwLock<>> for concurrent access; clones share state.
#[derive(Clone, Default)]
pub struct MemoryEngineStore {
    /// Watermarks indexed by owner key
    watermarks: Arc<RwLock<HashMap<String, u64>>>,
    /// Unredeemed tokens indexed by token id
    unredeemed: Arc<RwLock<HashMap<String, UnredeemedToken>>>,
}

impl MemoryEngineStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut records: Vec<UnredeemedToken>) -> Vec<UnredeemedToken> {
    records.sort_by(|a, b| {
        a.first_failed_at
            .cmp(&b.first_failed_at)
            .then_with(|| a.token.id.cmp(&b.token.id))
    });
    records
}

#[async_trait]
impl EngineStore for MemoryEngineStore {
    async fn watermark(&self, owner_key: &str) -> StorageResult<Option<u64>> {
        Ok(self.watermarks.read().await.get(owner_key).copied())
    }

    async fn set_watermark(&self, owner_key: &str, created_at: u64) -> StorageResult<()> {
        self.watermarks
            .write()
            .await
            .insert(owner_key.to_string(), created_at);
        Ok(())
    }

    async fn save_unredeemed(
        &self,
        owner_key: &str,
        token: &IncomingToken,
        reason: &str,
    ) -> StorageResult<UnredeemedToken> {
        let now = unix_now();
        let mut unredeemed = self.unredeemed.write().await;

        let record = unredeemed
            .entry(token.id.clone())
            .and_modify(|existing| {
                existing.token = token.clone();
                existing.reason = reason.to_string();
                existing.attempts += 1;
                existing.updated_at = now;
            })
            .or_insert_with(|| UnredeemedToken {
                owner_key: owner_key.to_string(),
                token: token.clone(),
                reason: reason.to_string(),
                attempts: 1,
                first_failed_at: now,
                updated_at: now,
            });

        Ok(record.clone())
    }

    async fn remove_unredeemed(&self, token_id: &str) -> StorageResult<bool> {
        Ok(self.unredeemed.write().await.remove(token_id).is_some())
    }

    async fn list_unredeemed(&self, owner_key: &str) -> StorageResult<Vec<UnredeemedToken>> {
        let unredeemed = self.unredeemed.read().await;
        Ok(sorted(
            unredeemed
                .values()
                .filter(|r| r.owner_key == owner_key)
                .cloned()
                .collect(),
        ))
    }

    async fn list_all_unredeemed(&self) -> StorageResult<Vec<UnredeemedToken>> {
        Ok(sorted(self.unredeemed.read().await.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(id: &str) -> IncomingToken {
        IncomingToken {
            id: id.to_string(),
            sender_key: "sender".to_string(),
            recipient_key: "owner".to_string(),
            created_at: 1,
            comment: String::new(),
            proofs: vec![],
            malformed_proofs: 0,
            mint_url: "https://mint.a".to_string(),
            unit: "sat".to_string(),
            referenced_event_id: None,
            redeemed: false,
        }
    }

    #[tokio::test]
    async fn test_watermark() {
        let store = MemoryEngineStore::new();
        assert_eq!(store.watermark("owner").await.unwrap(), None);
        store.set_watermark("owner", 9).await.unwrap();
        assert_eq!(store.watermark("owner").await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_unredeemed_lifecycle() {
        let store = MemoryEngineStore::new();
        store.save_unredeemed("owner", &token("a"), "down").await.unwrap();
        let again = store.save_unredeemed("owner", &token("a"), "down").await.unwrap();
        assert_eq!(again.attempts, 2);

        store.save_unredeemed("other", &token("b"), "down").await.unwrap();
        assert_eq!(store.list_unredeemed("owner").await.unwrap().len(), 1);
        assert_eq!(store.list_all_unredeemed().await.unwrap().len(), 2);

        assert!(store.remove_unredeemed("a").await.unwrap());
        assert!(store.list_unredeemed("owner").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryEngineStore::new();
        let clone = store.clone();
        clone.set_watermark("owner", 5).await.unwrap();
        assert_eq!(store.watermark("owner").await.unwrap(), Some(5));
    }
}
