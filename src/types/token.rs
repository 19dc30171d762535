//! Incoming Tokens
//!
//! A nutzap event carries proofs locked to the recipient:
//!
//! ```text
//! kind 9321, content = comment
//! ["p", recipient]           required
//! ["u", mint_url]            required
//! ["proof", "{...}"]         one per proof
//! ["unit", "sat"]            optional, defaults to sat
//! ["e", event_id]            optional, what is being zapped
//! ```

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::acceptance::normalize_mint_url;
use crate::relay::event::{kind, Event, Tag, UnsignedEvent};

pub const DEFAULT_UNIT: &str = "sat";
const CASHU_TOKEN_PREFIX: &str = "cashuA";

/// Reasons an event is not a usable nutzap at all
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenParseError {
    #[error("unexpected event kind {0}")]
    WrongKind(u16),

    #[error("nutzap has no recipient tag")]
    MissingRecipient,

    #[error("nutzap has no mint tag")]
    MissingMint,
}

/// Opaque ecash proof
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    pub amount: u64,
    /// Keyset id
    pub id: String,
    pub secret: String,
    #[serde(rename = "C", alias = "c")]
    pub c: String,
}

/// One discovered nutzap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingToken {
    /// Source event id; the idempotency key
    pub id: String,
    pub sender_key: String,
    pub recipient_key: String,
    pub created_at: u64,
    pub comment: String,
    pub proofs: Vec<Proof>,
    /// Proof tags that did not parse
    pub malformed_proofs: usize,
    pub mint_url: String,
    pub unit: String,
    pub referenced_event_id: Option<String>,
    pub redeemed: bool,
}

#[derive(Serialize)]
struct CashuToken<'a> {
    token: [CashuTokenEntry<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    memo: Option<&'a str>,
    unit: &'a str,
}

#[derive(Serialize)]
struct CashuTokenEntry<'a> {
    mint: &'a str,
    proofs: &'a [Proof],
}

impl IncomingToken {
    /// Parse a nutzap event
    ///
    /// Proof entries that fail to parse or carry a zero amount are counted
    /// in `malformed_proofs` instead of failing the whole event.
    pub fn from_event(event: &Event) -> Result<Self, TokenParseError> {
        if event.kind != kind::NUTZAP {
            return Err(TokenParseError::WrongKind(event.kind));
        }

        let recipient_key = event
            .first_tag_value("p")
            .ok_or(TokenParseError::MissingRecipient)?
            .to_string();
        let mint_url = event
            .first_tag_value("u")
            .map(normalize_mint_url)
            .filter(|u| !u.is_empty())
            .ok_or(TokenParseError::MissingMint)?;

        let mut proofs = Vec::new();
        let mut malformed_proofs = 0;
        for raw in event.tags_named("proof").filter_map(Tag::value) {
            match serde_json::from_str::<Proof>(raw) {
                Ok(proof) if proof.amount > 0 && !proof.secret.is_empty() => proofs.push(proof),
                _ => malformed_proofs += 1,
            }
        }

        let unit = event
            .first_tag_value("unit")
            .map(|u| u.trim().to_lowercase())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_UNIT.to_string());

        Ok(Self {
            id: event.id.clone(),
            sender_key: event.pubkey.clone(),
            recipient_key,
            created_at: event.created_at,
            comment: event.content.clone(),
            proofs,
            malformed_proofs,
            mint_url,
            unit,
            referenced_event_id: event.first_tag_value("e").map(str::to_string),
            redeemed: false,
        })
    }

    pub fn total_amount(&self) -> u64 {
        self.proofs.iter().fold(0u64, |acc, p| acc.saturating_add(p.amount))
    }

    /// Same token restricted to a subset of its proofs
    pub fn with_proofs(mut self, proofs: Vec<Proof>) -> Self {
        self.proofs = proofs;
        self
    }

    /// Serialized token the user can redeem by hand in any wallet
    pub fn to_cashu_token(&self) -> String {
        let token = CashuToken {
            token: [CashuTokenEntry {
                mint: &self.mint_url,
                proofs: &self.proofs,
            }],
            memo: Some(self.comment.as_str()).filter(|c| !c.is_empty()),
            unit: &self.unit,
        };
        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_string(&token).unwrap_or_default();
        format!("{}{}", CASHU_TOKEN_PREFIX, URL_SAFE.encode(json))
    }
}

/// Build a nutzap event (sender side)
pub fn nutzap_event(
    recipient: &str,
    mint_url: &str,
    unit: &str,
    proofs: &[Proof],
    comment: &str,
    referenced_event_id: Option<&str>,
) -> UnsignedEvent {
    let mut tags = vec![
        Tag::new(["p", recipient]),
        Tag::new(["u", normalize_mint_url(mint_url).as_str()]),
        Tag::new(["unit", unit]),
    ];
    for proof in proofs {
        let json = serde_json::to_string(proof).unwrap_or_default();
        tags.push(Tag::new(["proof".to_string(), json]));
    }
    if let Some(id) = referenced_event_id {
        tags.push(Tag::new(["e", id]));
    }

    UnsignedEvent::new("", kind::NUTZAP, tags, comment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{KeySigner, Signer};

    fn proof(amount: u64, secret: &str) -> Proof {
        Proof {
            amount,
            id: "009a1f293253e41e".to_string(),
            secret: secret.to_string(),
            c: "02c0ffee".to_string(),
        }
    }

    async fn sign(unsigned: UnsignedEvent) -> Event {
        KeySigner::generate().sign(unsigned).await.unwrap()
    }

    #[test]
    fn test_proof_accepts_lowercase_commitment() {
        let parsed: Proof =
            serde_json::from_str(r#"{"amount":4,"id":"00ab","secret":"s","c":"02ff"}"#).unwrap();
        assert_eq!(parsed.c, "02ff");

        let json = serde_json::to_string(&parsed).unwrap();
        assert!(json.contains(r#""C":"02ff""#));
    }

    #[tokio::test]
    async fn test_parse_nutzap() {
        let unsigned = nutzap_event(
            "recipient",
            "https://mint.a/",
            "sat",
            &[proof(64, "a"), proof(36, "b")],
            "great post",
            Some("note1"),
        );
        let event = sign(unsigned).await;
        let token = IncomingToken::from_event(&event).unwrap();

        assert_eq!(token.id, event.id);
        assert_eq!(token.sender_key, event.pubkey);
        assert_eq!(token.recipient_key, "recipient");
        assert_eq!(token.mint_url, "https://mint.a");
        assert_eq!(token.unit, "sat");
        assert_eq!(token.comment, "great post");
        assert_eq!(token.referenced_event_id.as_deref(), Some("note1"));
        assert_eq!(token.total_amount(), 100);
        assert_eq!(token.malformed_proofs, 0);
        assert!(!token.redeemed);
    }

    #[tokio::test]
    async fn test_garbage_proofs_counted() {
        let mut unsigned = nutzap_event("recipient", "https://mint.a", "sat", &[proof(1, "a")], "", None);
        unsigned.tags.push(Tag::new(["proof", "not json"]));
        unsigned.tags.push(Tag::new([
            "proof",
            r#"{"amount":0,"id":"00","secret":"z","C":"02"}"#,
        ]));
        let token = IncomingToken::from_event(&sign(unsigned).await).unwrap();

        assert_eq!(token.proofs.len(), 1);
        assert_eq!(token.malformed_proofs, 2);
    }

    #[tokio::test]
    async fn test_missing_tags() {
        let no_mint = UnsignedEvent::new("", kind::NUTZAP, vec![Tag::new(["p", "r"])], "");
        assert_eq!(
            IncomingToken::from_event(&sign(no_mint).await),
            Err(TokenParseError::MissingMint)
        );

        let no_recipient = UnsignedEvent::new("", kind::NUTZAP, vec![Tag::new(["u", "https://m"])], "");
        assert_eq!(
            IncomingToken::from_event(&sign(no_recipient).await),
            Err(TokenParseError::MissingRecipient)
        );
    }

    #[tokio::test]
    async fn test_unit_defaults_to_sat() {
        let unsigned = UnsignedEvent::new(
            "",
            kind::NUTZAP,
            vec![Tag::new(["p", "r"]), Tag::new(["u", "https://m"])],
            "",
        );
        let token = IncomingToken::from_event(&sign(unsigned).await).unwrap();
        assert_eq!(token.unit, DEFAULT_UNIT);
    }

    #[tokio::test]
    async fn test_cashu_token_export() {
        let unsigned = nutzap_event("r", "https://mint.a", "sat", &[proof(8, "abc")], "hi", None);
        let token = IncomingToken::from_event(&sign(unsigned).await).unwrap();

        let exported = token.to_cashu_token();
        let body = exported.strip_prefix("cashuA").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&URL_SAFE.decode(body).unwrap()).unwrap();

        assert_eq!(json["token"][0]["mint"], "https://mint.a");
        assert_eq!(json["token"][0]["proofs"][0]["amount"], 8);
        assert_eq!(json["token"][0]["proofs"][0]["C"], "02c0ffee");
        assert_eq!(json["memo"], "hi");
        assert_eq!(json["unit"], "sat");
    }
}
