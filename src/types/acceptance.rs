//! Acceptance Info
//!
//! A recipient announces how it accepts nutzaps in a replaceable event:
//!
//! ```text
//! kind 10019
//! ["relay", "wss://relay.example"]          zero or more
//! ["mint", "https://mint.a", "sat", ...]    one or more, units optional
//! ["pubkey", "02aa..."]                     exactly one
//! ```

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::relay::event::{kind, Event, Tag, UnsignedEvent};

/// Reasons an announcement cannot be used
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcceptanceError {
    #[error("unexpected event kind {0}")]
    WrongKind(u16),

    #[error("announcement has no lock key")]
    MissingLockKey,

    #[error("announcement has more than one lock key")]
    MultipleLockKeys,

    #[error("invalid lock key: {0}")]
    InvalidLockKey(String),

    #[error("announcement lists no mints")]
    NoMints,
}

/// Mint a recipient accepts tokens from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedMint {
    pub url: String,
    /// Accepted units; empty means any
    pub units: Vec<String>,
}

impl TrustedMint {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_mint_url(url),
            units: Vec::new(),
        }
    }

    pub fn with_units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.units = units.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts_unit(&self, unit: &str) -> bool {
        self.units.is_empty() || self.units.iter().any(|u| u.eq_ignore_ascii_case(unit))
    }
}

/// A recipient's published acceptance policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceInfo {
    pub owner_key: String,
    /// Relays to listen on; empty means the client's defaults
    pub relays: Vec<String>,
    pub trusted_mints: Vec<TrustedMint>,
    /// Compressed key incoming proofs must be locked to
    pub lock_key: String,
    pub source_event_id: String,
    pub fetched_at: u64,
}

impl AcceptanceInfo {
    /// Parse an announcement event
    pub fn from_event(event: &Event, fetched_at: u64) -> Result<Self, AcceptanceError> {
        if event.kind != kind::NUTZAP_INFO {
            return Err(AcceptanceError::WrongKind(event.kind));
        }

        let relays: Vec<String> = event
            .tags_named("relay")
            .filter_map(Tag::value)
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();

        let mut trusted_mints: Vec<TrustedMint> = Vec::new();
        for tag in event.tags_named("mint") {
            let Some(url) = tag.value().map(normalize_mint_url).filter(|u| !u.is_empty()) else {
                continue;
            };
            let units: Vec<String> = tag.as_slice()[2..]
                .iter()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();

            match trusted_mints.iter_mut().find(|m| m.url == url) {
                Some(existing) => {
                    // Repeated mint tags widen the unit list; an unqualified tag accepts any
                    if existing.units.is_empty() || units.is_empty() {
                        existing.units.clear();
                    } else {
                        for unit in units {
                            if !existing.units.contains(&unit) {
                                existing.units.push(unit);
                            }
                        }
                    }
                }
                None => trusted_mints.push(TrustedMint { url, units }),
            }
        }

        let lock_keys: Vec<&str> = event.tags_named("pubkey").filter_map(Tag::value).collect();
        let lock_key = match lock_keys.as_slice() {
            [] => return Err(AcceptanceError::MissingLockKey),
            [key] => normalize_lock_key(key)?,
            _ => return Err(AcceptanceError::MultipleLockKeys),
        };

        if trusted_mints.is_empty() {
            return Err(AcceptanceError::NoMints);
        }

        Ok(Self {
            owner_key: event.pubkey.clone(),
            relays,
            trusted_mints,
            lock_key,
            source_event_id: event.id.clone(),
            fetched_at,
        })
    }

    /// Trusted mint entry for a URL
    pub fn mint(&self, url: &str) -> Option<&TrustedMint> {
        let url = normalize_mint_url(url);
        self.trusted_mints.iter().find(|m| m.url == url)
    }

    pub fn trusts_mint(&self, url: &str) -> bool {
        self.mint(url).is_some()
    }

    pub fn mint_urls(&self) -> Vec<String> {
        self.trusted_mints.iter().map(|m| m.url.clone()).collect()
    }

    /// Build the announcement event for publishing
    pub fn announcement(relays: &[String], mints: &[TrustedMint], lock_key: &str) -> UnsignedEvent {
        let mut tags: Vec<Tag> = relays.iter().map(|r| Tag::new(["relay", r.as_str()])).collect();
        for mint in mints {
            let mut parts = vec!["mint".to_string(), mint.url.clone()];
            parts.extend(mint.units.iter().cloned());
            tags.push(Tag(parts));
        }
        tags.push(Tag::new(["pubkey", lock_key]));

        UnsignedEvent::new("", kind::NUTZAP_INFO, tags, "")
    }
}

/// Canonical mint URL: trimmed, no trailing slash
pub fn normalize_mint_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Canonical lock key: lowercase compressed hex
///
/// 64-char x-only keys get the even-parity `02` prefix.
pub fn normalize_lock_key(key: &str) -> Result<String, AcceptanceError> {
    let key = key.trim().to_lowercase();
    let key = if key.len() == 64 { format!("02{}", key) } else { key };

    PublicKey::from_str(&key).map_err(|e| AcceptanceError::InvalidLockKey(e.to_string()))?;
    Ok(key)
}
