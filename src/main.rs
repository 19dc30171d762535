//! nutzapd CLI
//!
//! Run modes:
//!   nutzapd simulate [--amounts 100,21] [--fail-first]  - In-process end-to-end run
//!   nutzapd keygen                                      - Generate an identity key
//!   nutzapd pending                                     - List unredeemed tokens

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use nutzapd::common::{init_from_config, EngineConfig};
use nutzapd::fixtures;
use nutzapd::relay::Signer;
use nutzapd::{
    EngineStore, KeySigner, LogNotifier, MemoryEngineStore, MemoryRelay, MemoryWallet,
    RedemptionOrchestrator, SqliteEngineStore, WalletLedger,
};

const SIM_MINT: &str = "https://mint.example.com";
const SIM_UNTRUSTED_MINT: &str = "https://untrusted.example.com";

#[derive(Parser)]
#[command(name = "nutzapd")]
#[command(about = "Nutzap discovery and redemption engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery and redemption against an in-process relay and wallet
    Simulate {
        /// Comma-separated nutzap amounts
        #[arg(short, long, value_delimiter = ',', default_values_t = [100u64, 21])]
        amounts: Vec<u64>,

        /// Make the first wallet apply fail, then retry it
        #[arg(long)]
        fail_first: bool,

        /// Keep engine state in memory instead of the sqlite database
        #[arg(long)]
        in_memory: bool,
    },

    /// Generate a fresh identity key
    Keygen,

    /// List tokens whose redemption failed
    Pending {
        /// SQLite database path (defaults to NUTZAP_DB_PATH)
        #[arg(long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    init_from_config(&config)?;

    match cli.command {
        Commands::Simulate {
            amounts,
            fail_first,
            in_memory,
        } => simulate(&config, &amounts, fail_first, in_memory).await?,
        Commands::Keygen => keygen(),
        Commands::Pending { db } => pending(db.as_deref().unwrap_or(&config.db_path)).await?,
    }
    Ok(())
}

fn keygen() {
    let signer = KeySigner::generate();
    println!("=== New Identity ===");
    println!("Secret key: {}", signer.secret_hex());
    println!("Public key: {}", signer.public_key());
    println!();
    println!("Set NUTZAP_SECRET_KEY to the secret key to use this identity.");
}

async fn pending(db_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteEngineStore::new(db_path)?;
    let tokens = store.list_all_unredeemed().await?;

    if tokens.is_empty() {
        println!("No unredeemed tokens.");
        return Ok(());
    }

    println!("=== Unredeemed Tokens ({}) ===", tokens.len());
    for record in tokens {
        println!();
        println!("Token:    {}", record.token.id);
        println!("Owner:    {}", record.owner_key);
        println!("Mint:     {}", record.token.mint_url);
        println!("Amount:   {} {}", record.token.total_amount(), record.token.unit);
        println!("Attempts: {}", record.attempts);
        println!("Reason:   {}", record.reason);
        println!("Redeem manually with:");
        println!("  {}", record.manual_token());
    }
    Ok(())
}

async fn simulate(
    config: &EngineConfig,
    amounts: &[u64],
    fail_first: bool,
    in_memory: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.print_summary();

    let relay = Arc::new(MemoryRelay::new());
    let owner = Arc::new(match config.secret_key.as_deref() {
        Some(secret) => KeySigner::from_hex(secret)?,
        None => KeySigner::generate(),
    });
    let lock_key = KeySigner::generate().public_key();
    let sender = KeySigner::generate();
    let wallet = Arc::new(MemoryWallet::new());
    let store: Arc<dyn EngineStore> = if in_memory {
        Arc::new(MemoryEngineStore::new())
    } else {
        Arc::new(SqliteEngineStore::new(&config.db_path)?)
    };

    relay
        .inject(fixtures::announcement(owner.as_ref(), &[], &[SIM_MINT], Some(&lock_key)).await?)
        .await;

    // Historical nutzaps picked up by catch-up
    let base = nutzapd::relay::unix_now().saturating_sub(60);
    for (i, amount) in amounts.iter().enumerate() {
        let proofs = [fixtures::locked_proof(*amount, &lock_key)];
        let event = fixtures::nutzap(
            &sender,
            &owner.public_key(),
            SIM_MINT,
            &proofs,
            &format!("zap #{}", i + 1),
            Some(base + i as u64),
        )
        .await?;
        relay.inject(event).await;
    }
    // Dropped by the trust gate
    let untrusted = fixtures::nutzap(
        &sender,
        &owner.public_key(),
        SIM_UNTRUSTED_MINT,
        &[fixtures::locked_proof(1_000, &lock_key)],
        "untrusted",
        Some(base),
    )
    .await?;
    relay.inject(untrusted).await;

    if fail_first {
        wallet.fail_next_adds(1);
    }

    let orchestrator = RedemptionOrchestrator::from_config(
        config,
        relay.clone(),
        owner.clone(),
        wallet.clone(),
        store.clone(),
        Arc::new(LogNotifier),
    );

    println!();
    println!("Recipient: {}", owner.public_key());
    orchestrator.start(&owner.public_key()).await?;

    // One more nutzap while live
    let live_amount = 7;
    wait_for_outcomes(&orchestrator, amounts.len() as u64).await;
    let live = fixtures::nutzap(
        &sender,
        &owner.public_key(),
        SIM_MINT,
        &[fixtures::locked_proof(live_amount, &lock_key)],
        "live zap",
        None,
    )
    .await?;
    relay.inject(live).await;
    wait_for_outcomes(&orchestrator, amounts.len() as u64 + 1).await;

    if fail_first {
        println!("Retrying failed redemptions...");
        for (token_id, outcome) in orchestrator.retry_failed().await? {
            println!("  {} -> {:?}", token_id, outcome);
        }
    }

    let state = orchestrator.stop().await?;
    let stats = orchestrator.stats().await;

    println!();
    println!("=== Simulation Summary ===");
    println!("Final feed state:  {}", state);
    println!("Tokens seen:       {}", stats.tokens_seen);
    println!("Redeemed:          {}", stats.redeemed);
    println!("Failed:            {}", stats.failed);
    println!("Amount redeemed:   {}", stats.total_amount_redeemed);
    println!("Wallet balance:    {}", wallet.balance().await?);
    println!("Watermark:         {:?}", stats.watermark);
    println!(
        "Still unredeemed:  {}",
        store.list_unredeemed(&owner.public_key()).await?.len()
    );
    Ok(())
}

async fn wait_for_outcomes(orchestrator: &RedemptionOrchestrator, expected: u64) {
    let wait = async {
        loop {
            let stats = orchestrator.stats().await;
            if stats.redeemed + stats.already_redeemed + stats.failed >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
        eprintln!("Warning: timed out waiting for {} redemption outcomes", expected);
    }
}
