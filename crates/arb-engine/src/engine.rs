//! Root task wiring.
//!
//! Owns every component of the pipeline and runs the four task classes:
//! the feed ingest task (sole book writer), per-update detection, a
//! bounded pool of execution workers, and housekeeping (idempotency
//! sweeps, breaker ticks, snapshot persistence). All tasks are rooted
//! to one shutdown broadcast; none are detached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use arb_common::{MarketPair, TokenId};
use arb_market::{BookSnapshot, BookStore, BookUpdate, FeedEvent, FeedIngestor};

use crate::config::EngineConfig;
use crate::detector::{DetectSkip, OpportunityDetector};
use crate::edge::{EdgeCalculator, PriceOracle};
use crate::exec::breaker::CircuitBreaker;
use crate::exec::chain::{ChainClient, GasEstimate};
use crate::exec::idempotency::IdempotencyRegistry;
use crate::exec::live::LiveExecutor;
use crate::exec::nonce::NonceManager;
use crate::exec::retry::RetryPolicy;
use crate::exec::router::ExecutionRouter;
use crate::exec::simulated::SimulatedExecutor;
use crate::exec::ExecutionOutcome;
use crate::queue::{OpportunityQueue, Pushed};
use crate::risk::anomaly::AnomalyGuard;
use crate::risk::manager::{RiskContext, RiskManager};
use crate::risk::pnl::PnlTracker;
use crate::snapshot::RecoverySnapshot;
use crate::telemetry::latency::LatencyTracker;
use crate::telemetry::recorder::{run_recorder, EventRecorder};
use crate::telemetry::{EventType, TelemetryBus, TelemetryEvent};
use crate::types::{ArbitrageOpportunity, TxStatus};

/// Rolling counts of rejected signals by reason code.
#[derive(Debug, Default)]
pub struct RejectCounters {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl RejectCounters {
    fn bump(&self, code: &'static str) {
        *self.counts.lock().entry(code).or_default() += 1;
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        self.counts.lock().clone()
    }
}

/// The assembled engine.
pub struct Engine {
    config: EngineConfig,
    pairs: Vec<MarketPair>,
    pairs_by_token: HashMap<TokenId, Vec<usize>>,
    wallet: Address,

    store: Arc<BookStore>,
    detector: OpportunityDetector,
    edge: EdgeCalculator<Arc<dyn PriceOracle>>,
    anomaly: Arc<AnomalyGuard>,
    risk: Arc<RiskManager>,
    router: Arc<ExecutionRouter>,
    queue: Arc<OpportunityQueue>,

    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    breaker: Arc<CircuitBreaker>,
    idempotency: Arc<IdempotencyRegistry>,
    pnl: Arc<PnlTracker>,

    telemetry: TelemetryBus,
    telemetry_rx: Mutex<Option<mpsc::Receiver<TelemetryEvent>>>,
    latency: Arc<LatencyTracker>,
    rejects: Arc<RejectCounters>,
    /// Open notional across live and simulated fills.
    position: Mutex<Decimal>,
}

impl Engine {
    /// Assemble the full pipeline from configuration and the injected
    /// chain capability + price oracle.
    pub fn new(
        config: EngineConfig,
        chain: Arc<dyn ChainClient>,
        oracle: Arc<dyn PriceOracle>,
    ) -> Result<Self> {
        config.validate()?;
        let pairs = config.market_pairs()?;

        let mut pairs_by_token: HashMap<TokenId, Vec<usize>> = HashMap::new();
        for (i, pair) in pairs.iter().enumerate() {
            pairs_by_token
                .entry(pair.yes_token_id.clone())
                .or_default()
                .push(i);
            pairs_by_token
                .entry(pair.no_token_id.clone())
                .or_default()
                .push(i);
        }

        let wallet: Address = if config.wallet_address.is_empty() {
            Address::ZERO
        } else {
            config
                .wallet_address
                .parse()
                .context("invalid wallet_address")?
        };

        let store = Arc::new(BookStore::new(config.feed.orderbook_depth_cap, 1024));
        let (telemetry, telemetry_rx) = TelemetryBus::new(config.telemetry.channel_capacity);

        let breaker = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let anomaly = Arc::new(AnomalyGuard::new(
            config.anomaly_config(),
            Some(Arc::clone(&breaker)),
        ));
        let risk = Arc::new(RiskManager::new(
            config.risk_config(),
            Some(Arc::clone(&anomaly)),
        ));
        let nonces = Arc::new(NonceManager::new());
        let idempotency = Arc::new(IdempotencyRegistry::new(config.idempotency_ttl()));
        let pnl = Arc::new(PnlTracker::new());

        let simulated = Arc::new(SimulatedExecutor::new(
            Arc::clone(&store),
            config.trading.fee_rate,
            config.trading.max_slippage_bps,
            telemetry.clone(),
        ));
        let live = Arc::new(LiveExecutor::new(
            Arc::clone(&chain),
            Arc::clone(&nonces),
            Arc::clone(&breaker),
            Arc::clone(&idempotency),
            RetryPolicy::new(config.retry_config()),
            Arc::clone(&oracle),
            wallet,
            config.trading.fee_rate,
            config.receipt_timeout(),
            telemetry.clone(),
        ));
        let router = Arc::new(ExecutionRouter::new(
            config.dry_run,
            simulated,
            live,
            Arc::clone(&pnl),
            Arc::clone(&risk),
            telemetry.clone(),
        ));

        let detector = OpportunityDetector::new(config.detector_config(), Arc::clone(&store));
        let edge = EdgeCalculator::new(config.edge_config(), oracle);

        Ok(Self {
            pairs,
            pairs_by_token,
            wallet,
            store,
            detector,
            edge,
            anomaly,
            risk,
            router,
            queue: Arc::new(OpportunityQueue::new()),
            chain,
            nonces,
            breaker,
            idempotency,
            pnl,
            telemetry,
            telemetry_rx: Mutex::new(Some(telemetry_rx)),
            latency: Arc::new(LatencyTracker::new()),
            rejects: Arc::new(RejectCounters::default()),
            position: Mutex::new(Decimal::ZERO),
            config,
        })
    }

    pub fn store(&self) -> Arc<BookStore> {
        Arc::clone(&self.store)
    }

    pub fn risk_manager(&self) -> Arc<RiskManager> {
        Arc::clone(&self.risk)
    }

    pub fn pnl(&self) -> Arc<PnlTracker> {
        Arc::clone(&self.pnl)
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn queue(&self) -> Arc<OpportunityQueue> {
        Arc::clone(&self.queue)
    }

    pub fn reject_counts(&self) -> HashMap<&'static str, u64> {
        self.rejects.snapshot()
    }

    /// Restore crash-recovery state, then reconcile the nonce with the
    /// chain (chain wins).
    pub async fn restore_state(&self) -> Result<()> {
        let Some(path) = &self.config.snapshot_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let snap = RecoverySnapshot::load(path)?;
        let chain_nonce = if self.config.dry_run {
            None
        } else {
            Some(
                self.chain
                    .get_pending_nonce(self.wallet)
                    .await
                    .context("failed to reconcile nonce with chain")?,
            )
        };
        snap.restore(&self.nonces, &self.idempotency, &self.pnl, chain_nonce);
        info!("recovery snapshot restored from {}", path.display());
        Ok(())
    }

    /// Detection pass for one book change. Returns the opportunity it
    /// queued, if any.
    pub fn on_book_update(&self, update: &BookUpdate) -> Option<ArbitrageOpportunity> {
        let indices = self.pairs_by_token.get(&update.token_id)?;
        let mut queued = None;

        for &i in indices {
            let pair = &self.pairs[i];
            self.observe_pair(pair);

            let multiplier = self.anomaly.size_multiplier(&pair.market_id);
            match self.detector.detect(pair, multiplier) {
                Ok(opportunity) => {
                    let trace = opportunity.trace_id;
                    self.latency
                        .mark_book(trace, update.received_at, update.applied_at);
                    self.latency.mark_signal(trace, Instant::now());
                    self.telemetry.emit(
                        EventType::OpportunityDetected,
                        trace,
                        json!({
                            "market_id": pair.market_id,
                            "yes_vwap": opportunity.yes_vwap.to_string(),
                            "no_vwap": opportunity.no_vwap.to_string(),
                            "qty": opportunity.qty.to_string(),
                            "expected_profit": opportunity.expected_profit_total.to_string(),
                        }),
                    );
                    if self.queue.push(opportunity.clone()) == Pushed::Coalesced {
                        self.telemetry.emit(
                            EventType::OpportunityCoalesced,
                            trace,
                            json!({ "market_id": pair.market_id }),
                        );
                    }
                    queued = Some(opportunity);
                }
                Err(DetectSkip::NoQuotes | DetectSkip::NoEdge) => {}
                Err(skip) => debug!("detection skipped on {}: {skip:?}", pair.market_id),
            }
        }
        queued
    }

    /// Feed the anomaly guard with the pair's current quote state.
    fn observe_pair(&self, pair: &MarketPair) {
        let yes = self.store.snapshot(&pair.yes_token_id);
        let no = self.store.snapshot(&pair.no_token_id);
        let (Some(yes), Some(no)) = (yes, no) else {
            return;
        };
        let (Some(yes_mid), Some(no_mid)) = (mid_price(&yes), mid_price(&no)) else {
            return;
        };
        let depth = yes.ask_depth() + no.ask_depth();
        self.anomaly
            .observe(&pair.market_id, yes_mid, no_mid, depth);
    }

    /// Run one opportunity through edge, risk, and execution.
    pub async fn process_opportunity(
        &self,
        opportunity: ArbitrageOpportunity,
    ) -> Option<ExecutionOutcome> {
        let trace = opportunity.trace_id;

        let gas = self.fetch_gas().await?;
        if Decimal::from(gas.max_fee_per_gas_wei())
            > Decimal::from(self.config.risk.max_gas_price_gwei) * Decimal::from(1_000_000_000u64)
        {
            self.rejects.bump("GAS_PRICE_CEILING");
            debug!("gas price above ceiling, skipping {trace}");
            return None;
        }

        let risk_tags = self
            .anomaly
            .active_flag(&opportunity.pair.market_id)
            .map(|f| vec![format!("{:?}", f.kind)])
            .unwrap_or_default();
        let edge = self.edge.evaluate(&opportunity, &gas, risk_tags);

        let balance = self.fetch_balance().await;
        let ctx = RiskContext {
            balance,
            position: *self.position.lock(),
            daily_pnl: self.pnl.daily_realized(Utc::now().date_naive()),
        };

        let market_id = opportunity.pair.market_id.clone();
        let signal = match self.risk.validate(opportunity, edge, &ctx) {
            Ok(signal) => signal,
            Err(rejection) => {
                self.rejects.bump(rejection.code());
                self.telemetry.emit(
                    EventType::RiskRejected,
                    trace,
                    json!({
                        "market_id": market_id,
                        "rejection": rejection,
                    }),
                );
                return None;
            }
        };

        self.latency.mark_risk_passed(trace, Instant::now());
        self.telemetry.emit(
            EventType::RiskPassed,
            trace,
            json!({
                "market_id": signal.market_id(),
                "net_edge": signal.edge.net_edge.to_string(),
                "idempotency_key": signal.idempotency_key.as_str(),
            }),
        );

        self.latency.mark_order_sent(trace, Instant::now());
        let outcome = self.router.execute(signal).await;
        self.latency.mark_terminal(trace, Instant::now());

        let added: Decimal = outcome
            .fills()
            .iter()
            .map(|f| f.notional() + f.fees_paid)
            .sum();
        *self.position.lock() += added;

        if outcome.tx.status != TxStatus::Success {
            debug!(
                "execution terminal status {} ({:?}) for {trace}",
                outcome.tx.status, outcome.tx.error_kind
            );
        }
        Some(outcome)
    }

    async fn fetch_gas(&self) -> Option<GasEstimate> {
        match self.chain.get_gas_estimate().await {
            Ok(gas) => Some(gas),
            Err(e) if self.config.dry_run => {
                debug!("gas estimate unavailable in dry-run ({e}); assuming zero");
                Some(GasEstimate {
                    base_fee_wei: 0,
                    priority_fee_wei: 0,
                    gas_limit: 0,
                })
            }
            Err(e) => {
                warn!("gas estimate failed, cannot execute: {e}");
                None
            }
        }
    }

    async fn fetch_balance(&self) -> Decimal {
        match self.chain.get_balance(self.wallet).await {
            Ok(balance) => balance,
            Err(e) if self.config.dry_run => {
                debug!("balance unavailable in dry-run ({e}); assuming funded");
                Decimal::new(1_000_000, 0)
            }
            Err(e) => {
                warn!("balance fetch failed ({e}); treating as zero");
                Decimal::ZERO
            }
        }
    }

    /// Spawn all task classes and run until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> Result<()> {
        info!(
            "engine starting: {} pairs, mode={}",
            self.pairs.len(),
            if self.config.dry_run { "dry-run" } else { "live" }
        );

        if !self.config.dry_run {
            self.nonces
                .initialize(self.chain.as_ref(), self.wallet)
                .await
                .context("nonce initialization failed")?;
        }
        self.restore_state().await?;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Telemetry drain -> event log.
        if let Some(rx) = self.telemetry_rx.lock().take() {
            let recorder = EventRecorder::new(
                self.config.event_log_dir.clone(),
                self.config.telemetry.recorder_buffer,
            );
            tasks.push(tokio::spawn(run_recorder(recorder, rx)));
        }

        // Feed ingest task: sole writer to the store.
        let (feed_events_tx, feed_events_rx) = mpsc::channel(1024);
        let tokens: Vec<TokenId> = self.pairs_by_token.keys().cloned().collect();
        let ingestor = FeedIngestor::new(
            self.config.feed_config(),
            Arc::clone(&self.store),
            tokens,
            Some(feed_events_tx),
        );
        {
            let shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ingestor.run(shutdown_rx).await {
                    warn!("feed ingestor exited with error: {e}");
                }
            }));
        }

        // Feed events -> telemetry.
        {
            let engine = Arc::clone(&self);
            let mut shutdown_rx = shutdown.subscribe();
            let mut rx = feed_events_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => engine.record_feed_event(event),
                            None => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Detection task: notified per applied book update.
        {
            let engine = Arc::clone(&self);
            let mut updates = self.store.subscribe();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = updates.recv() => match update {
                            Ok(update) => {
                                engine.on_book_update(&update);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("detection lagged {n} updates; resync from snapshots");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Execution workers: bounded pool, one signal owned per worker.
        for worker in 0..self.config.execution.max_concurrent_signals.max(1) {
            let engine = Arc::clone(&self);
            let queue = Arc::clone(&self.queue);
            tasks.push(tokio::spawn(async move {
                while let Some(opportunity) = queue.pop().await {
                    engine.process_opportunity(opportunity).await;
                }
                debug!("execution worker {worker} drained");
            }));
        }

        // Housekeeping: sweeps, breaker tick, snapshot persistence.
        {
            let engine = Arc::clone(&self);
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = tick.tick() => engine.housekeeping(),
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Wait for shutdown, then drain.
        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("engine shutting down");
        self.queue.close();
        self.persist_snapshot();

        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    fn record_feed_event(&self, event: FeedEvent) {
        use crate::types::TraceId;
        match event {
            FeedEvent::Received { token_id, seq, .. } => {
                self.telemetry.emit(
                    EventType::EventReceived,
                    TraceId::generate(),
                    json!({ "token_id": token_id.as_str(), "seq": seq }),
                );
            }
            FeedEvent::SequenceGap {
                token_id,
                expected,
                got,
            } => {
                self.telemetry.emit(
                    EventType::SequenceGap,
                    TraceId::generate(),
                    json!({
                        "token_id": token_id.as_str(),
                        "expected": expected,
                        "got": got,
                    }),
                );
            }
            FeedEvent::Disconnected => {
                self.telemetry.emit(
                    EventType::FeedDisconnected,
                    TraceId::generate(),
                    json!({}),
                );
            }
            FeedEvent::Dropped { .. }
            | FeedEvent::SnapshotRequested { .. }
            | FeedEvent::Connected => {}
        }
    }

    fn housekeeping(&self) {
        let swept = self.idempotency.sweep();
        if swept > 0 {
            debug!("idempotency sweep removed {swept} entries");
        }
        // State read applies the OPEN -> HALF_OPEN timeout transition.
        let _ = self.breaker.state();
        self.persist_snapshot();
    }

    fn persist_snapshot(&self) {
        let Some(path) = &self.config.snapshot_path else {
            return;
        };
        let snap = RecoverySnapshot::capture(
            &self.nonces,
            &self.idempotency,
            self.breaker.state(),
            &self.pnl,
        );
        if let Err(e) = snap.save(path) {
            warn!("snapshot persistence failed: {e}");
        }
    }
}

fn mid_price(snapshot: &BookSnapshot) -> Option<Decimal> {
    match (snapshot.best_bid(), snapshot.best_ask()) {
        (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
        (None, Some(ask)) => Some(ask.price),
        _ => None,
    }
}
