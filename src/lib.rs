//! nutzapd - Nutzap Discovery & Redemption Engine
//!
//! Finds ecash tokens sent to a recipient as signed relay events, checks
//! that they are spendable by the recipient, and moves them into the local
//! wallet exactly once.
//!
//! ## Pipeline
//!
//! 1. **Resolver** - Fetches the recipient's acceptance info (trusted mints,
//!    lock key, relays)
//! 2. **Feed** - Catches up from a watermark, then follows live events
//! 3. **Validator** - Keeps proofs from trusted mints locked to the lock key
//! 4. **Ledger** - Idempotent redemption, recorded as a history event
//! 5. **Orchestrator** - Notifications, watermark persistence, retries
//!
//! Relay transport, signing and the wallet are collaborators behind traits;
//! in-memory implementations ship for tests and the `simulate` command.

pub mod common;
pub mod feed;
pub mod fixtures;
pub mod ledger;
pub mod orchestrator;
pub mod relay;
pub mod resolver;
pub mod storage;
pub mod types;
pub mod validator;
pub mod wallet;

// Re-exports: infrastructure
pub use common::{EngineConfig, EngineError, LiveMode, Result};

// Re-exports: collaborators
pub use relay::{Event, Filter, KeySigner, MemoryRelay, RelayClient, RelayError, Signer};
pub use storage::{EngineStore, MemoryEngineStore, SqliteEngineStore, UnredeemedToken};
pub use wallet::{MemoryWallet, WalletError, WalletLedger};

// Re-exports: data model
pub use types::{AcceptanceInfo, IncomingToken, Proof, RedemptionRecord, TrustedMint};

// Re-exports: engine components
pub use feed::{FeedConfig, FeedHandle, FeedState, NutzapDiscoveryFeed, Origin, TokenSink};
pub use ledger::{RedemptionFailure, RedemptionLedger, RedemptionOutcome};
pub use orchestrator::{
    LogNotifier, Notification, Notifier, OrchestratorStats, RedemptionOrchestrator,
};
pub use resolver::{AcceptanceInfoResolver, ResolveError};
pub use validator::{RejectReason, TokenProofValidator, Verdict};
