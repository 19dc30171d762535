//! SQLite Persistent Storage for Engine State
//!
//! Provides durable storage for watermarks and unredeemed tokens that
//! survives restarts. Uses connection pooling via r2d2 for concurrent access.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::traits::{EngineStore, StorageError, StorageResult, UnredeemedToken};
use crate::relay::unix_now;
use crate::types::IncomingToken;

/// Raw `unredeemed_tokens` row before the token JSON is decoded
struct StoredRow {
    token_id: String,
    owner_key: String,
    token_json: String,
    reason: String,
    attempts: u32,
    first_failed_at: u64,
    updated_at: u64,
}

impl StoredRow {
    fn decode(self) -> Result<UnredeemedToken, StorageError> {
        let token = serde_json::from_str(&self.token_json)
            .map_err(|e| StorageError::InvalidData(format!("token {}: {}", self.token_id, e)))?;

        Ok(UnredeemedToken {
            owner_key: self.owner_key,
            token,
            reason: self.reason,
            attempts: self.attempts,
            first_failed_at: self.first_failed_at,
            updated_at: self.updated_at,
        })
    }
}

/// SQLite-backed engine store with connection pooling
pub struct SqliteEngineStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteEngineStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS watermarks (
                owner_key TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS unredeemed_tokens (
                token_id TEXT PRIMARY KEY,
                owner_key TEXT NOT NULL,
                token_json TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                first_failed_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_unredeemed_owner ON unredeemed_tokens(owner_key);
            CREATE INDEX IF NOT EXISTS idx_unredeemed_first_failed ON unredeemed_tokens(first_failed_at);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    /// Convert a database row to UnredeemedToken
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StoredRow> {
        Ok(StoredRow {
            token_id: row.get("token_id")?,
            owner_key: row.get("owner_key")?,
            token_json: row.get("token_json")?,
            reason: row.get("reason")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            first_failed_at: row.get::<_, i64>("first_failed_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    // Synchronous helper methods for the trait implementations

    fn watermark_sync(&self, owner_key: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.conn()?;

        conn.query_row(
            "SELECT created_at FROM watermarks WHERE owner_key = ?1",
            params![owner_key],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|v| v.map(|v| v as u64))
        .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn set_watermark_sync(&self, owner_key: &str, created_at: u64) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO watermarks (owner_key, created_at, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(owner_key) DO UPDATE SET
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![owner_key, created_at as i64, unix_now() as i64],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    fn save_unredeemed_sync(
        &self,
        owner_key: &str,
        token: &IncomingToken,
        reason: &str,
    ) -> Result<UnredeemedToken, StorageError> {
        let token_json =
            serde_json::to_string(token).map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let now = unix_now() as i64;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO unredeemed_tokens (
                token_id, owner_key, token_json, reason, attempts, first_failed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
            ON CONFLICT(token_id) DO UPDATE SET
                token_json = excluded.token_json,
                reason = excluded.reason,
                attempts = unredeemed_tokens.attempts + 1,
                updated_at = excluded.updated_at
            "#,
            params![token.id, owner_key, token_json, reason, now],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        let raw = conn
            .query_row(
                "SELECT * FROM unredeemed_tokens WHERE token_id = ?1",
                params![token.id],
                Self::row_to_record,
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        raw.decode()
    }

    fn remove_unredeemed_sync(&self, token_id: &str) -> Result<bool, StorageError> {
        let conn = self.conn()?;

        let rows_affected = conn
            .execute(
                "DELETE FROM unredeemed_tokens WHERE token_id = ?1",
                params![token_id],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows_affected > 0)
    }

    fn list_unredeemed_sync(&self, owner_key: Option<&str>) -> Result<Vec<UnredeemedToken>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM unredeemed_tokens
                WHERE ?1 IS NULL OR owner_key = ?1
                ORDER BY first_failed_at ASC, token_id ASC
                "#,
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![owner_key], Self::row_to_record)
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.into_iter().map(StoredRow::decode).collect()
    }
}

#[async_trait]
impl EngineStore for SqliteEngineStore {
    async fn watermark(&self, owner_key: &str) -> StorageResult<Option<u64>> {
        self.watermark_sync(owner_key)
    }

    async fn set_watermark(&self, owner_key: &str, created_at: u64) -> StorageResult<()> {
        self.set_watermark_sync(owner_key, created_at)
    }

    async fn save_unredeemed(
        &self,
        owner_key: &str,
        token: &IncomingToken,
        reason: &str,
    ) -> StorageResult<UnredeemedToken> {
        self.save_unredeemed_sync(owner_key, token, reason)
    }

    async fn remove_unredeemed(&self, token_id: &str) -> StorageResult<bool> {
        self.remove_unredeemed_sync(token_id)
    }

    async fn list_unredeemed(&self, owner_key: &str) -> StorageResult<Vec<UnredeemedToken>> {
        self.list_unredeemed_sync(Some(owner_key))
    }

    async fn list_all_unredeemed(&self) -> StorageResult<Vec<UnredeemedToken>> {
        self.list_unredeemed_sync(None)
    }
}
