//! Test and simulation helpers
//!
//! Builds signed announcements and nutzaps with P2PK-locked proofs, and a
//! channel-backed [`TokenSink`] and [`Notifier`] for observing a running
//! feed or orchestrator.

use async_trait::async_trait;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::feed::{FeedState, Origin, TokenSink};
use crate::orchestrator::{Notification, Notifier};
use crate::relay::{Event, KeySigner, Signer, SignerError};
use crate::types::{
    normalize_lock_key, nutzap_event, AcceptanceInfo, IncomingToken, Proof, TrustedMint,
    DEFAULT_UNIT,
};

const KEYSET_ID: &str = "00ad268c4d1f5826";

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Single-key P2PK secret locked to `lock_key`
pub fn p2pk_secret(lock_key: &str) -> String {
    let data = normalize_lock_key(lock_key).unwrap_or_else(|_| lock_key.to_string());
    json!([
        "P2PK",
        {
            "nonce": random_hex(16),
            "data": data,
            "tags": [["sigflag", "SIG_INPUTS"]]
        }
    ])
    .to_string()
}

/// Proof locked to `lock_key` (x-only or compressed hex)
pub fn locked_proof(amount: u64, lock_key: &str) -> Proof {
    Proof {
        amount,
        id: KEYSET_ID.to_string(),
        secret: p2pk_secret(lock_key),
        c: format!("02{}", random_hex(32)),
    }
}

/// Proof locked to a freshly generated key
pub fn foreign_proof(amount: u64) -> Proof {
    locked_proof(amount, &KeySigner::generate().public_key())
}

/// Signed acceptance announcement. Without a lock key the event carries no
/// `pubkey` tag.
pub async fn announcement(
    owner: &dyn Signer,
    relays: &[&str],
    mints: &[&str],
    lock_key: Option<&str>,
) -> Result<Event, SignerError> {
    let relays: Vec<String> = relays.iter().map(|r| r.to_string()).collect();
    let mints: Vec<TrustedMint> = mints.iter().map(|m| TrustedMint::new(*m)).collect();

    let mut unsigned = AcceptanceInfo::announcement(&relays, &mints, lock_key.unwrap_or_default());
    if lock_key.is_none() {
        unsigned.tags.retain(|tag| tag.name() != Some("pubkey"));
    }
    owner.sign(unsigned).await
}

/// Signed nutzap from `sender` to `recipient`
pub async fn nutzap(
    sender: &dyn Signer,
    recipient: &str,
    mint: &str,
    proofs: &[Proof],
    comment: &str,
    created_at: Option<u64>,
) -> Result<Event, SignerError> {
    let mut unsigned = nutzap_event(recipient, mint, DEFAULT_UNIT, proofs, comment, None);
    if let Some(ts) = created_at {
        unsigned = unsigned.with_created_at(ts);
    }
    sender.sign(unsigned).await
}

/// Everything a [`ChannelSink`] observes
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Token(IncomingToken, Origin),
    CatchUpComplete(Option<u64>),
    State(FeedState),
}

/// Forwards sink callbacks into an unbounded channel
pub struct ChannelSink {
    tx: UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl TokenSink for ChannelSink {
    async fn on_token(&self, token: IncomingToken, origin: Origin) {
        let _ = self.tx.send(SinkEvent::Token(token, origin));
    }

    async fn on_catch_up_complete(&self, max_created_at: Option<u64>) {
        let _ = self.tx.send(SinkEvent::CatchUpComplete(max_created_at));
    }

    async fn on_state(&self, state: &FeedState) {
        let _ = self.tx.send(SinkEvent::State(state.clone()));
    }
}

async fn next_matching<T>(
    rx: &mut UnboundedReceiver<SinkEvent>,
    within: Duration,
    mut pick: impl FnMut(SinkEvent) -> Option<T>,
) -> Option<T> {
    tokio::time::timeout(within, async {
        while let Some(event) = rx.recv().await {
            if let Some(found) = pick(event) {
                return Some(found);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Next delivered token, skipping other sink events
pub async fn next_token(
    rx: &mut UnboundedReceiver<SinkEvent>,
    within: Duration,
) -> Option<(IncomingToken, Origin)> {
    next_matching(rx, within, |event| match event {
        SinkEvent::Token(token, origin) => Some((token, origin)),
        _ => None,
    })
    .await
}

/// Next catch-up completion, skipping other sink events
pub async fn next_catch_up(
    rx: &mut UnboundedReceiver<SinkEvent>,
    within: Duration,
) -> Option<Option<u64>> {
    next_matching(rx, within, |event| match event {
        SinkEvent::CatchUpComplete(max) => Some(max),
        _ => None,
    })
    .await
}

/// Wait until the feed reports `state`
pub async fn wait_for_state(
    rx: &mut UnboundedReceiver<SinkEvent>,
    state: &FeedState,
    within: Duration,
) -> bool {
    next_matching(rx, within, |event| match event {
        SinkEvent::State(s) if &s == state => Some(()),
        _ => None,
    })
    .await
    .is_some()
}

/// Forwards notifications into an unbounded channel
pub struct ChannelNotifier {
    tx: UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

/// Next notification, if one arrives in time
pub async fn next_notification(
    rx: &mut UnboundedReceiver<Notification>,
    within: Duration,
) -> Option<Notification> {
    tokio::time::timeout(within, rx.recv()).await.ok().flatten()
}
