//! Pub/Sub Network Layer
//!
//! Everything the engine needs from the network and the local identity:
//!
//! - **event**: signed message model, ids, verification, kind constants
//! - **filter**: query/subscription filters
//! - **traits**: `RelayClient` interface and its error type
//! - **signer**: `Signer` interface and the in-memory `KeySigner`
//! - **memory**: in-process `MemoryRelay` for tests and simulation

pub mod event;
pub mod filter;
pub mod memory;
pub mod signer;
pub mod traits;

// Re-exports
pub use event::{compute_event_id, kind, unix_now, Event, EventError, Tag, UnsignedEvent};
pub use filter::Filter;
pub use memory::MemoryRelay;
pub use signer::{KeySigner, Signer, SignerError};
pub use traits::{EventStream, RelayClient, RelayError, SubscriptionItem};

#[cfg(test)]
pub use signer::MockSigner;
#[cfg(test)]
pub use traits::MockRelayClient;
