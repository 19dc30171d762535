//! Signed Pub/Sub Messages
//!
//! Events follow the NIP-01 layout: the id is the SHA-256 of the canonical
//! `[0, pubkey, created_at, kind, tags, content]` serialization and the
//! signature is a BIP-340 schnorr signature over that id by the x-only
//! `pubkey`.

use secp256k1::{schnorr, Message, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

/// Message kinds consumed and produced by the engine
pub mod kind {
    /// Recipient's acceptance announcement (replaceable)
    pub const NUTZAP_INFO: u16 = 10019;
    /// Incoming token-bearing message
    pub const NUTZAP: u16 = 9321;
    /// Encrypted spending history entry
    pub const SPENDING_HISTORY: u16 = 7376;
}

/// Event verification errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event id does not match content")]
    IdMismatch,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// One event tag: a name followed by positional values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn name(&self) -> Option<&str> {
        self.get(0)
    }

    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Compute the NIP-01 event id
pub fn compute_event_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Event awaiting a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Create an event stamped with the current time
    pub fn new(pubkey: impl Into<String>, kind: u16, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> [u8; 32] {
        compute_event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

/// Signed event as stored and relayed by the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Check that the id matches the content and the signature is valid
    pub fn verify(&self) -> Result<(), EventError> {
        let digest = compute_event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(digest) != self.id {
            return Err(EventError::IdMismatch);
        }

        let pubkey = XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;
        let sig = schnorr::Signature::from_str(&self.sig)
            .map_err(|e| EventError::InvalidSignature(e.to_string()))?;

        SECP256K1
            .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
            .map_err(|e| EventError::InvalidSignature(e.to_string()))
    }

    /// All tags with the given name
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// Value of the first tag with the given name
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == Some(name))
            .find_map(Tag::value)
    }

    /// Whether the event carries `[name, value, ...]`
    pub fn has_tag_value(&self, name: &str, value: &str) -> bool {
        self.tags_named(name).any(|t| t.value() == Some(value))
    }

    /// Replaceable kinds keep only the newest event per author
    pub fn is_replaceable(&self) -> bool {
        (10_000..20_000).contains(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{KeySigner, Signer};

    #[test]
    fn test_tag_accessors() {
        let tag = Tag::new(["mint", "https://mint.a", "sat"]);
        assert_eq!(tag.name(), Some("mint"));
        assert_eq!(tag.value(), Some("https://mint.a"));
        assert_eq!(tag.get(2), Some("sat"));
        assert_eq!(tag.get(3), None);
    }

    #[test]
    fn test_tag_serializes_as_array() {
        let tag = Tag::new(["p", "abc"]);
        assert_eq!(serde_json::to_string(&tag).unwrap(), r#"["p","abc"]"#);
    }

    #[tokio::test]
    async fn test_signed_event_verifies() {
        let signer = KeySigner::generate();
        let unsigned = UnsignedEvent::new(
            signer.public_key(),
            kind::NUTZAP,
            vec![Tag::new(["p", "deadbeef"])],
            "thanks!",
        );
        let event = signer.sign(unsigned).await.unwrap();

        assert!(event.verify().is_ok());
        assert_eq!(event.first_tag_value("p"), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_tag_value_outlives_lookup_name() {
        let signer = KeySigner::generate();
        let unsigned = UnsignedEvent::new(
            signer.public_key(),
            kind::NUTZAP,
            vec![Tag::new(["u", "https://mint.a"]), Tag::new(["p", "deadbeef"])],
            "",
        );
        let event = signer.sign(unsigned).await.unwrap();

        let value = {
            let name = String::from("u");
            event.first_tag_value(&name)
        };
        assert_eq!(value, Some("https://mint.a"));
        assert!(event.has_tag_value("p", &String::from("deadbeef")));
    }

    #[tokio::test]
    async fn test_tampered_event_rejected() {
        let signer = KeySigner::generate();
        let unsigned = UnsignedEvent::new(signer.public_key(), kind::NUTZAP, vec![], "100 sats");
        let mut event = signer.sign(unsigned).await.unwrap();

        event.content = "1000 sats".to_string();
        assert_eq!(event.verify(), Err(EventError::IdMismatch));
    }

    #[tokio::test]
    async fn test_foreign_signature_rejected() {
        let alice = KeySigner::generate();
        let mallory = KeySigner::generate();

        let unsigned = UnsignedEvent::new(alice.public_key(), kind::NUTZAP, vec![], "");
        let forged = mallory.sign(unsigned).await.unwrap();

        // Signed under mallory's key, so pubkey/id no longer line up with alice
        assert!(forged.verify().is_ok());
        assert_eq!(forged.pubkey, mallory.public_key());

        let mut spoofed = forged.clone();
        spoofed.pubkey = alice.public_key();
        assert!(spoofed.verify().is_err());
    }
}
