//! End-to-end redemption scenarios
//!
//! Runs resolver, validator, feed, ledger and orchestrator together against
//! the in-memory relay and wallet.

use nutzapd::feed::FeedConfig;
use nutzapd::fixtures::{self, ChannelSink, SinkEvent};
use nutzapd::relay::{kind, Signer, Tag};
use nutzapd::types::nutzap_event;
use nutzapd::{
    AcceptanceInfoResolver, EngineStore, FeedState, IncomingToken, KeySigner, LogNotifier,
    MemoryRelay, MemoryWallet, NutzapDiscoveryFeed, RedemptionFailure, RedemptionLedger,
    RedemptionOrchestrator, RedemptionOutcome, RejectReason, ResolveError, SqliteEngineStore,
    TokenProofValidator, Verdict, WalletLedger,
};
use std::sync::Arc;
use std::time::Duration;

const MINT_A: &str = "https://mint.a";
const MINT_B: &str = "https://mint.b";
const WAIT: Duration = Duration::from_secs(2);

/// Recipient with a published announcement trusting `mint.a`
struct World {
    relay: Arc<MemoryRelay>,
    owner: Arc<KeySigner>,
    lock: String,
    sender: KeySigner,
    wallet: Arc<MemoryWallet>,
}

impl World {
    async fn new() -> Self {
        let relay = Arc::new(MemoryRelay::new());
        let owner = Arc::new(KeySigner::generate());
        let lock = KeySigner::generate().public_key();
        let announcement = fixtures::announcement(owner.as_ref(), &[], &[MINT_A], Some(&lock))
            .await
            .unwrap();
        relay.inject(announcement).await;

        Self {
            relay,
            owner,
            lock,
            sender: KeySigner::generate(),
            wallet: Arc::new(MemoryWallet::new()),
        }
    }

    fn resolver(&self) -> Arc<AcceptanceInfoResolver> {
        Arc::new(AcceptanceInfoResolver::new(
            self.relay.clone(),
            vec![],
            Duration::from_secs(1),
        ))
    }

    fn ledger(&self) -> RedemptionLedger {
        RedemptionLedger::new(
            self.relay.clone(),
            self.owner.clone(),
            self.wallet.clone(),
            vec![],
            Duration::from_secs(1),
        )
    }

    fn feed_config() -> FeedConfig {
        FeedConfig {
            reconnect_backoff: Duration::from_millis(20),
            retry_base: Duration::from_millis(1),
            retry_attempts: 2,
            ..FeedConfig::default()
        }
    }

    fn orchestrator(&self, store: Arc<dyn EngineStore>) -> RedemptionOrchestrator {
        let feed = NutzapDiscoveryFeed::new(self.relay.clone(), self.resolver(), Self::feed_config());
        RedemptionOrchestrator::new(feed, Arc::new(self.ledger()), store, Arc::new(LogNotifier))
    }

    async fn token(&self, mint: &str, amount: u64, created_at: Option<u64>) -> IncomingToken {
        let event = self.zap(mint, amount, created_at).await;
        IncomingToken::from_event(&event).unwrap()
    }

    async fn zap(&self, mint: &str, amount: u64, created_at: Option<u64>) -> nutzapd::Event {
        fixtures::nutzap(
            &self.sender,
            &self.owner.public_key(),
            mint,
            &[fixtures::locked_proof(amount, &self.lock)],
            "",
            created_at,
        )
        .await
        .unwrap()
    }

    async fn history_count(&self) -> usize {
        self.relay.events_of_kind(kind::SPENDING_HISTORY).await.len()
    }
}

async fn wait_for_watermark(store: &dyn EngineStore, owner: &str, expected: u64) -> bool {
    tokio::time::timeout(WAIT, async {
        while store.watermark(owner).await.unwrap() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_trusted_locked_token_is_redeemed_once() {
    let world = World::new().await;
    let info = world.resolver().resolve(&world.owner.public_key()).await.unwrap();
    let mut token = world.token(MINT_A, 100, None).await;

    let verdict = TokenProofValidator::new().validate(&token, &info);
    let Verdict::Accepted { proofs, rejected } = verdict else {
        panic!("token should be accepted");
    };
    assert_eq!(rejected, 0);
    token = token.with_proofs(proofs);

    let ledger = world.ledger();
    match ledger.redeem(&mut token).await {
        RedemptionOutcome::Redeemed { amount, .. } => assert_eq!(amount, 100),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let records = ledger.load_history().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount, 100);
    assert_eq!(records[0].source_event_ids, vec![token.id.clone()]);
}

#[tokio::test]
async fn test_untrusted_mint_never_reaches_ledger() {
    let world = World::new().await;
    let info = world.resolver().resolve(&world.owner.public_key()).await.unwrap();
    let token = world.token(MINT_B, 100, None).await;

    assert_eq!(
        TokenProofValidator::new().validate(&token, &info),
        Verdict::Rejected(RejectReason::UntrustedMint)
    );
    assert_eq!(world.history_count().await, 0);
    assert_eq!(world.wallet.add_calls(), 0);
}

#[tokio::test]
async fn test_replayed_token_is_already_redeemed() {
    let world = World::new().await;
    let mut token = world.token(MINT_A, 42, None).await;
    token.id = "evt1".to_string();

    let ledger = world.ledger();
    assert!(matches!(
        ledger.redeem(&mut token.clone()).await,
        RedemptionOutcome::Redeemed { amount: 42, .. }
    ));
    let balance = world.wallet.balance().await.unwrap();

    assert_eq!(ledger.redeem(&mut token).await, RedemptionOutcome::AlreadyRedeemed);
    assert!(token.redeemed);
    assert_eq!(world.wallet.balance().await.unwrap(), balance);

    // A second process with no local state consults the relay
    let fresh = world.ledger();
    assert_eq!(
        fresh.redeem(&mut token.clone()).await,
        RedemptionOutcome::AlreadyRedeemed
    );
    assert_eq!(world.history_count().await, 1);
}

#[tokio::test]
async fn test_failed_apply_then_retry_records_once() {
    let world = World::new().await;
    let mut token = world.token(MINT_A, 64, None).await;
    let ledger = world.ledger();

    world.wallet.fail_next_adds(1);
    assert!(matches!(
        ledger.redeem(&mut token).await,
        RedemptionOutcome::Failed(RedemptionFailure::Apply(_))
    ));
    assert!(!token.redeemed);
    assert_eq!(world.history_count().await, 0);

    assert!(matches!(
        ledger.redeem(&mut token).await,
        RedemptionOutcome::Redeemed { amount: 64, .. }
    ));
    assert_eq!(world.history_count().await, 1);
    assert_eq!(ledger.load_history().await.unwrap().len(), 1);
    assert_eq!(world.wallet.balance().await.unwrap(), 64);
}

#[tokio::test]
async fn test_missing_lock_key_ends_feed_before_catch_up() {
    let relay = Arc::new(MemoryRelay::new());
    let owner = KeySigner::generate();
    relay
        .inject(fixtures::announcement(&owner, &[], &[MINT_A], None).await.unwrap())
        .await;
    let resolver = Arc::new(AcceptanceInfoResolver::new(relay.clone(), vec![], Duration::from_secs(1)));

    assert!(matches!(
        resolver.resolve(&owner.public_key()).await,
        Err(ResolveError::NotFound(_))
    ));

    let feed = NutzapDiscoveryFeed::new(relay.clone(), resolver, World::feed_config());
    let (sink, mut rx) = ChannelSink::new();
    let handle = feed.run(&owner.public_key(), None, sink);
    assert_eq!(handle.join().await, FeedState::Unavailable);

    while let Ok(event) = rx.try_recv() {
        assert_ne!(event, SinkEvent::State(FeedState::CatchUp));
        assert!(!matches!(event, SinkEvent::Token(..)));
    }
}

#[tokio::test]
async fn test_concurrent_redeem_applies_once() {
    let world = World::new().await;
    let token = world.token(MINT_A, 10, None).await;
    let ledger = Arc::new(world.ledger());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            let mut token = token.clone();
            tokio::spawn(async move { ledger.redeem(&mut token).await })
        })
        .collect();

    let mut redeemed = 0;
    for task in tasks {
        match task.await.unwrap() {
            RedemptionOutcome::Redeemed { .. } => redeemed += 1,
            RedemptionOutcome::AlreadyRedeemed => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    assert_eq!(redeemed, 1);
    assert_eq!(world.wallet.add_calls(), 1);
    assert_eq!(world.history_count().await, 1);
}

#[tokio::test]
async fn test_partially_valid_token_redeems_valid_subset() {
    let world = World::new().await;
    let proofs = [
        fixtures::locked_proof(8, &world.lock),
        fixtures::foreign_proof(16),
    ];
    let mut unsigned = nutzap_event(&world.owner.public_key(), MINT_A, "sat", &proofs, "", None);
    unsigned.tags.push(Tag::new(["proof", "not a proof"]));
    let event = world.sender.sign(unsigned).await.unwrap();

    let token = IncomingToken::from_event(&event).unwrap();
    let info = world.resolver().resolve(&world.owner.public_key()).await.unwrap();
    let Verdict::Accepted { proofs, rejected } = TokenProofValidator::new().validate(&token, &info)
    else {
        panic!("token with one valid proof should be accepted");
    };
    assert_eq!(proofs.len(), 1);
    assert_eq!(rejected, 2);

    let mut token = token.with_proofs(proofs);
    assert!(matches!(
        world.ledger().redeem(&mut token).await,
        RedemptionOutcome::Redeemed { amount: 8, .. }
    ));
}

#[tokio::test]
async fn test_watermark_never_skips_failed_token() {
    let world = World::new().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.db");
    let owner_key = world.owner.public_key();

    let failing = world.zap(MINT_A, 3, Some(1_000)).await;
    let later = world.zap(MINT_A, 4, Some(2_000)).await;
    world.relay.inject(failing.clone()).await;
    world.relay.inject(later).await;
    world.wallet.fail_next_adds(1);

    {
        let store: Arc<dyn EngineStore> = Arc::new(SqliteEngineStore::new(&db_path).unwrap());
        let orchestrator = world.orchestrator(store.clone());
        orchestrator.start(&owner_key).await.unwrap();
        assert!(wait_for_watermark(store.as_ref(), &owner_key, 1_000).await);
        orchestrator.stop().await.unwrap();
        let pending = store.list_unredeemed(&owner_key).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].token.id, failing.id);
    }

    // Restart from the durable watermark; the failed token is seen again
    let store: Arc<dyn EngineStore> = Arc::new(SqliteEngineStore::new(&db_path).unwrap());
    let orchestrator = world.orchestrator(store.clone());
    orchestrator.start(&owner_key).await.unwrap();
    assert!(wait_for_watermark(store.as_ref(), &owner_key, 2_000).await);
    orchestrator.stop().await.unwrap();

    let stats = orchestrator.stats().await;
    assert_eq!(stats.redeemed, 1);
    assert_eq!(stats.already_redeemed, 1);
    assert!(store.list_unredeemed(&owner_key).await.unwrap().is_empty());
    assert_eq!(world.wallet.balance().await.unwrap(), 7);
}

#[tokio::test]
async fn test_live_replay_of_caught_up_token_is_ignored() {
    let world = World::new().await;
    let event = world.zap(MINT_A, 5, None).await;
    world.relay.inject(event.clone()).await;

    let store: Arc<dyn EngineStore> = Arc::new(nutzapd::MemoryEngineStore::new());
    let orchestrator = world.orchestrator(store);
    orchestrator.start(&world.owner.public_key()).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while orchestrator.state().await != Some(FeedState::Live)
            || orchestrator.stats().await.redeemed == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    world.relay.replay_live(event);
    tokio::time::sleep(Duration::from_millis(200)).await;

    orchestrator.stop().await.unwrap();
    let stats = orchestrator.stats().await;
    assert_eq!(stats.tokens_seen, 1);
    assert_eq!(world.wallet.add_calls(), 1);
}
