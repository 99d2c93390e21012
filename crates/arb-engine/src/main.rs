//! arb-engine: two-leg arbitrage engine for binary prediction markets.
//!
//! Usage:
//!   arb-engine [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config/engine.toml)
//!   --dry-run <BOOL>      Override execution mode
//!   --feed-url <URL>      Override market-data endpoint
//!   --log-level <LEVEL>   Override log level

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use arb_engine::edge::FixedOracle;
use arb_engine::exec::chain::{
    ChainClient, ChainError, GasEstimate, Order, SignedOrder, TxReceipt,
};
use arb_engine::{Engine, EngineConfig};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "arb-engine")]
#[command(about = "Two-leg arbitrage engine for binary prediction markets")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, default_value = "config/engine.toml")]
    config: PathBuf,

    /// Override dry-run mode.
    #[arg(long)]
    dry_run: Option<bool>,

    /// Override the market-data endpoint.
    #[arg(long)]
    feed_url: Option<String>,

    /// Override log level.
    #[arg(long)]
    log_level: Option<String>,
}

/// Placeholder chain capability for dry-run deployments.
///
/// Every call fails with an authorization error; the engine's dry-run
/// fallbacks (zero gas, assumed balance) keep the simulated pipeline
/// running. Live mode refuses to start on this client.
struct UnconfiguredChain;

#[async_trait]
impl ChainClient for UnconfiguredChain {
    async fn sign_order(&self, _order: &Order) -> Result<SignedOrder, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }

    async fn submit_order(&self, _signed: &SignedOrder, _nonce: u64) -> Result<B256, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }

    async fn get_balance(&self, _wallet: Address) -> Result<Decimal, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }

    async fn get_pending_nonce(&self, _wallet: Address) -> Result<u64, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }

    async fn get_gas_estimate(&self) -> Result<GasEstimate, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }

    async fn wait_for_receipt(
        &self,
        _tx_hash: B256,
        _timeout: Duration,
    ) -> Result<TxReceipt, ChainError> {
        Err(ChainError::Unauthorized("no chain client configured".into()))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        EngineConfig::default()
    };

    config.apply_env_overrides();
    if let Some(dry_run) = args.dry_run {
        config.dry_run = dry_run;
    }
    if let Some(url) = args.feed_url {
        config.feed.url = url;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    config.validate().context("configuration validation failed")?;

    info!("starting arb-engine");
    info!("mode: {}", if config.dry_run { "dry-run" } else { "live" });
    info!("markets: {}", config.markets.len());
    info!("feed: {}", config.feed.url);

    if config.markets.is_empty() {
        warn!("no markets configured; the engine will idle");
    }

    // The signing + submission capability is injected. This binary only
    // ships the dry-run placeholder; a live deployment links a real
    // client and constructs the engine with it.
    if !config.dry_run {
        bail!(
            "live mode requires a chain client; this binary only ships the \
             dry-run placeholder"
        );
    }
    let chain = Arc::new(UnconfiguredChain);
    let oracle = Arc::new(FixedOracle::new(Decimal::ONE));

    let engine = Arc::new(Engine::new(config, chain, oracle)?);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(4);
    let engine_task = tokio::spawn(Arc::clone(&engine).run(shutdown_tx.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(());

    match engine_task.await {
        Ok(result) => result,
        Err(e) => bail!("engine task panicked: {e}"),
    }
}
