//! Storage Layer Module
//!
//! Persists the discovery watermark and unredeemed tokens.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryEngineStore;
pub use sqlite::SqliteEngineStore;
pub use traits::{EngineStore, StorageError, StorageResult, UnredeemedToken};

#[cfg(test)]
pub use traits::MockEngineStore;
