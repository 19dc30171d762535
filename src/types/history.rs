//! Redemption History
//!
//! Every successful redemption is recorded as a kind 7376 event authored by
//! the owner. The content is encrypted to self:
//!
//! ```text
//! [["direction","in"],["amount","100"],["e","<ledger entry>","","created"]]
//! ```
//!
//! The consumed nutzap ids stay in the clear as
//! `["e", nutzap_id, "", "redeemed"]` so the idempotency check can find
//! them without decrypting anything.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::relay::event::{kind, Event, Tag, UnsignedEvent};

pub const REDEEMED_MARKER: &str = "redeemed";
pub const CREATED_MARKER: &str = "created";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("unexpected event kind {0}")]
    WrongKind(u16),

    #[error("malformed history content: {0}")]
    Malformed(String),

    #[error("history content has no {0} entry")]
    MissingField(&'static str),
}

/// Direction of value movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "in"),
            Self::Out => write!(f, "out"),
        }
    }
}

impl FromStr for Direction {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            other => Err(HistoryError::Malformed(format!("direction {:?}", other))),
        }
    }
}

/// Decrypted history payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryContent {
    pub direction: Direction,
    pub amount: u64,
    /// Ledger entries created by the movement
    pub created: Vec<String>,
}

impl HistoryContent {
    pub fn encode(&self) -> String {
        let mut rows = vec![
            vec!["direction".to_string(), self.direction.to_string()],
            vec!["amount".to_string(), self.amount.to_string()],
        ];
        for entry in &self.created {
            rows.push(vec![
                "e".to_string(),
                entry.clone(),
                String::new(),
                CREATED_MARKER.to_string(),
            ]);
        }
        serde_json::Value::from(rows).to_string()
    }

    pub fn decode(plaintext: &str) -> Result<Self, HistoryError> {
        let rows: Vec<Vec<String>> =
            serde_json::from_str(plaintext).map_err(|e| HistoryError::Malformed(e.to_string()))?;

        let mut direction = None;
        let mut amount = None;
        let mut created = Vec::new();
        for row in &rows {
            match row.first().map(String::as_str) {
                Some("direction") => {
                    let value = row.get(1).ok_or(HistoryError::MissingField("direction"))?;
                    direction = Some(value.parse()?);
                }
                Some("amount") => {
                    let value = row.get(1).ok_or(HistoryError::MissingField("amount"))?;
                    amount = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| HistoryError::Malformed(format!("amount: {}", e)))?,
                    );
                }
                Some("e") if row.get(3).map(String::as_str) == Some(CREATED_MARKER) => {
                    if let Some(id) = row.get(1) {
                        created.push(id.clone());
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            direction: direction.ok_or(HistoryError::MissingField("direction"))?,
            amount: amount.ok_or(HistoryError::MissingField("amount"))?,
            created,
        })
    }
}

/// Durable record of one redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub source_event_ids: Vec<String>,
    pub direction: Direction,
    pub amount: u64,
    pub resulting_ledger_entry_id: Option<String>,
    pub created_at: u64,
    /// Id of the history event
    pub event_id: String,
}

impl RedemptionRecord {
    /// Rebuild a record from a history event and its decrypted content
    pub fn from_event(event: &Event, plaintext: &str) -> Result<Self, HistoryError> {
        if event.kind != kind::SPENDING_HISTORY {
            return Err(HistoryError::WrongKind(event.kind));
        }
        let content = HistoryContent::decode(plaintext)?;

        Ok(Self {
            source_event_ids: redeemed_ids(event),
            direction: content.direction,
            amount: content.amount,
            resulting_ledger_entry_id: content.created.into_iter().next(),
            created_at: event.created_at,
            event_id: event.id.clone(),
        })
    }
}

/// `["e", id, "", "redeemed"]`
pub fn redeemed_tag(token_id: &str) -> Tag {
    Tag::new(["e", token_id, "", REDEEMED_MARKER])
}

/// Nutzap ids a history event marks as consumed
pub fn redeemed_ids(event: &Event) -> Vec<String> {
    event
        .tags_named("e")
        .filter(|t| t.get(3) == Some(REDEEMED_MARKER))
        .filter_map(Tag::value)
        .map(str::to_string)
        .collect()
}

/// Build an unsigned history event; `encrypted` is the sealed content
pub fn history_event(encrypted: String, token_ids: &[String], sender_key: &str) -> UnsignedEvent {
    let mut tags: Vec<Tag> = token_ids.iter().map(|id| redeemed_tag(id)).collect();
    if !sender_key.is_empty() {
        tags.push(Tag::new(["p", sender_key]));
    }
    UnsignedEvent::new("", kind::SPENDING_HISTORY, tags, encrypted)
}
