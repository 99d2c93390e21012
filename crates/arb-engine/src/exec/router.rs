//! Execution router: dry-run vs live dispatch plus the PnL path.
//!
//! The mode flag is read once per signal (never per leg), so a config
//! flip mid-signal cannot split a pair across executors. Fills from
//! either executor flow into the PnL tracker; a PARTIAL result reports
//! the pair to the risk manager for suppression.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::risk::manager::RiskManager;
use crate::risk::pnl::PnlTracker;
use crate::telemetry::{EventType, TelemetryBus};
use crate::types::{Signal, TxStatus};

use super::{ArbExecutor, ExecutionOutcome};

/// Routes validated signals to the configured executor.
pub struct ExecutionRouter {
    dry_run: AtomicBool,
    simulated: Arc<dyn ArbExecutor>,
    live: Arc<dyn ArbExecutor>,
    pnl: Arc<PnlTracker>,
    risk: Arc<RiskManager>,
    telemetry: TelemetryBus,
}

impl ExecutionRouter {
    pub fn new(
        dry_run: bool,
        simulated: Arc<dyn ArbExecutor>,
        live: Arc<dyn ArbExecutor>,
        pnl: Arc<PnlTracker>,
        risk: Arc<RiskManager>,
        telemetry: TelemetryBus,
    ) -> Self {
        info!(
            "execution router initialized (mode={})",
            if dry_run { "dry-run" } else { "live" }
        );
        Self {
            dry_run: AtomicBool::new(dry_run),
            simulated,
            live,
            pnl,
            risk,
            telemetry,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Acquire)
    }

    /// Switch mode for subsequent signals; in-flight signals keep the
    /// mode they started with.
    pub fn set_dry_run(&self, dry_run: bool) {
        self.dry_run.store(dry_run, Ordering::Release);
        info!(
            "execution router mode switched to {}",
            if dry_run { "dry-run" } else { "live" }
        );
    }

    /// Execute one signal to its terminal result and run the PnL path.
    pub async fn execute(&self, signal: Signal) -> ExecutionOutcome {
        // Single mode read for the whole signal.
        let dry_run = self.is_dry_run();
        let executor: &Arc<dyn ArbExecutor> = if dry_run { &self.simulated } else { &self.live };

        self.pnl
            .record_expected_edge(signal.opportunity.expected_profit_total);

        let outcome = executor.execute_arbitrage(signal).await;

        for fill in outcome.fills() {
            if let Some(pair) = self.pnl.record_fill(fill.clone()) {
                let summary = self.pnl.summary();
                self.telemetry.emit(
                    EventType::PnlUpdate,
                    pair.trace_id,
                    json!({
                        "qty": pair.qty.to_string(),
                        "cost": pair.cost.to_string(),
                        "pnl": pair.pnl.to_string(),
                        "is_simulated": pair.is_simulated,
                        "cumulative_simulated_pnl":
                            summary.cumulative_simulated_pnl.to_string(),
                        "cumulative_realized_pnl":
                            summary.cumulative_realized_pnl.to_string(),
                    }),
                );
            }
        }

        if outcome.tx.status == TxStatus::Partial {
            self.risk.suppress_pair(outcome.tx.signal.market_id());
        }

        outcome
    }
}
