//! Token Proof Validator
//!
//! Pure trust and lock checks for a discovered nutzap. A token is usable
//! when its mint (and unit) is trusted and at least one proof is P2PK-locked
//! to the recipient's announced key:
//!
//! ```text
//! ["P2PK", {"nonce": "..", "data": "<lock key>", "tags": [["sigflag", ".."], ...]}]
//! ```
//!
//! Only the passing subset of proofs is ever redeemed.

use serde::Deserialize;
use tracing::debug;

use crate::types::{normalize_lock_key, normalize_mint_url, AcceptanceInfo, IncomingToken, Proof};

const P2PK_KIND: &str = "P2PK";

/// Why a whole token was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UntrustedMint,
    UnsupportedUnit,
    NoProofs,
    NoLockedProofs,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntrustedMint => write!(f, "mint is not trusted"),
            Self::UnsupportedUnit => write!(f, "unit is not accepted by this mint"),
            Self::NoProofs => write!(f, "token carries no proofs"),
            Self::NoLockedProofs => write!(f, "no proof is locked to the recipient"),
        }
    }
}

/// Validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Redeem `proofs`; `rejected` failed their lock check or did not parse
    Accepted { proofs: Vec<Proof>, rejected: usize },
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

#[derive(Debug, Deserialize)]
struct SecretData {
    #[allow(dead_code)]
    nonce: String,
    data: String,
    #[serde(default)]
    tags: Vec<Vec<String>>,
}

/// Stateless validator
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenProofValidator;

impl TokenProofValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check a token against the recipient's acceptance info
    pub fn validate(&self, token: &IncomingToken, info: &AcceptanceInfo) -> Verdict {
        let Some(mint) = info.mint(&normalize_mint_url(&token.mint_url)) else {
            return Verdict::Rejected(RejectReason::UntrustedMint);
        };
        if !mint.accepts_unit(&token.unit) {
            return Verdict::Rejected(RejectReason::UnsupportedUnit);
        }
        if token.proofs.is_empty() {
            return Verdict::Rejected(RejectReason::NoProofs);
        }

        let (proofs, failed): (Vec<&Proof>, Vec<&Proof>) = token
            .proofs
            .iter()
            .partition(|p| is_locked_to(&p.secret, &info.lock_key));

        if proofs.is_empty() {
            return Verdict::Rejected(RejectReason::NoLockedProofs);
        }
        if !failed.is_empty() {
            debug!(
                target: "nutzapd::validator",
                token_id = %token.id,
                failed = failed.len(),
                "Dropping proofs not locked to recipient"
            );
        }

        Verdict::Accepted {
            proofs: proofs.into_iter().cloned().collect(),
            rejected: failed.len() + token.malformed_proofs,
        }
    }
}

/// Whether a proof secret is a single-key P2PK lock to `lock_key`
pub fn is_locked_to(secret: &str, lock_key: &str) -> bool {
    let Ok((secret_kind, data)) = serde_json::from_str::<(String, SecretData)>(secret) else {
        return false;
    };
    if secret_kind != P2PK_KIND {
        return false;
    }
    match normalize_lock_key(&data.data) {
        Ok(key) if key == lock_key => {}
        _ => return false,
    }

    for tag in &data.tags {
        match tag.first().map(String::as_str) {
            // Any additional signer turns this into a multisig lock
            Some("pubkeys") if tag.len() > 1 => return false,
            Some("n_sigs") => match tag.get(1).map(|n| n.parse::<u64>()) {
                Some(Ok(1)) | None => {}
                _ => return false,
            },
            _ => {}
        }
    }
    true
}
