//! Shared Types Module
//!
//! Data model shared by the resolver, feed, ledger and orchestrator.

pub mod acceptance;
pub mod history;
pub mod token;

// Re-exports for convenience
pub use acceptance::{
    normalize_lock_key, normalize_mint_url, AcceptanceError, AcceptanceInfo, TrustedMint,
};
pub use history::{
    history_event, redeemed_ids, redeemed_tag, Direction, HistoryContent, HistoryError,
    RedemptionRecord,
};
pub use token::{nutzap_event, IncomingToken, Proof, TokenParseError, DEFAULT_UNIT};
