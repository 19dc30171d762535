//! Common Error Types for nutzapd
//!
//! Provides unified error handling across all modules.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::relay::{RelayError, SignerError};
use crate::resolver::ResolveError;
use crate::storage::StorageError;
use crate::wallet::WalletError;

/// Root error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("discovery error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("already running for {0}")]
    AlreadyRunning(String),

    #[error("not running")]
    NotRunning,

    /// Requested recipient differs from the signing identity
    #[error("owner {requested} does not match local identity {local}")]
    OwnerMismatch { requested: String, local: String },

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Relay(e) => e.is_transient(),
            EngineError::Resolve(e) => e.is_transient(),
            EngineError::Wallet(e) => e.is_retryable(),
            EngineError::Ledger(LedgerError::Relay(e)) => e.is_transient(),
            EngineError::Ledger(LedgerError::Timeout) => true,
            EngineError::Storage(_) | EngineError::Io(_) => true,
            _ => false,
        }
    }

    /// Get a stable error code for reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "CONFIG_ERROR",
            EngineError::Logging(_) => "LOGGING_ERROR",
            EngineError::Relay(_) => "RELAY_ERROR",
            EngineError::Signer(_) => "SIGNER_ERROR",
            EngineError::Resolve(ResolveError::NotFound(_)) => "NOT_FOUND",
            EngineError::Resolve(_) => "DISCOVERY_ERROR",
            EngineError::Wallet(_) => "WALLET_ERROR",
            EngineError::Ledger(_) => "LEDGER_ERROR",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::AlreadyRunning(_) => "ALREADY_RUNNING",
            EngineError::NotRunning => "NOT_RUNNING",
            EngineError::OwnerMismatch { .. } => "OWNER_MISMATCH",
            EngineError::Internal(_) => "INTERNAL_ERROR",
            EngineError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
