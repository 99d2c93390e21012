//! Simulated executor for dry-run mode.
//!
//! Synthesizes fills against the current live book: each leg re-walks
//! the ask ladder for its half of the trade size, fills at the walk
//! VWAP with configured slippage applied on top, and charges the taker
//! fee on notional. Emitted telemetry matches the live executor's shape
//! so downstream consumers cannot tell the difference structurally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info};

use arb_common::Side;
use arb_market::BookStore;

use crate::telemetry::{EventType, TelemetryBus};
use crate::types::{ErrorKind, Fill, Signal, TxResult, TxStatus};

use super::{ArbExecutor, ExecutionOutcome};

/// Simulated-execution statistics.
#[derive(Debug, Default)]
pub struct SimulatedStats {
    pub total: AtomicU64,
    pub filled: AtomicU64,
    pub failed: AtomicU64,
}

/// Dry-run executor: fills synthesized from the observed book.
pub struct SimulatedExecutor {
    store: Arc<BookStore>,
    fee_rate: Decimal,
    slippage_bps: u32,
    telemetry: TelemetryBus,
    stats: Arc<SimulatedStats>,
}

impl SimulatedExecutor {
    pub fn new(
        store: Arc<BookStore>,
        fee_rate: Decimal,
        slippage_bps: u32,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            store,
            fee_rate,
            slippage_bps,
            telemetry,
            stats: Arc::new(SimulatedStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SimulatedStats> {
        Arc::clone(&self.stats)
    }

    /// Walk one leg and synthesize its fill.
    fn fill_leg(&self, signal: &Signal, yes_leg: bool) -> Option<Fill> {
        let opp = &signal.opportunity;
        let token = if yes_leg {
            &opp.pair.yes_token_id
        } else {
            &opp.pair.no_token_id
        };
        let budget = opp.leg_budget();

        let walk = match self.store.walk_asks(token, budget) {
            Ok(walk) => walk,
            Err(e) => {
                debug!("simulated leg fill failed for {token}: {e}");
                return None;
            }
        };

        let slip =
            Decimal::ONE + Decimal::from(self.slippage_bps) / Decimal::from(10_000u32);
        let price = walk.vwap * slip;
        let fees = walk.spent * self.fee_rate;

        Some(Fill {
            token_id: token.clone(),
            side: Side::Buy,
            quantity: walk.qty,
            price_vwap: price,
            fees_paid: fees,
            slippage_bps: self.slippage_bps,
            tx_hash: None,
            is_simulated: true,
            timestamp: Utc::now(),
            trace_id: signal.trace_id,
        })
    }

    fn emit_fill(&self, signal: &Signal, fill: &Fill) {
        self.telemetry.emit(
            EventType::FillObserved,
            signal.trace_id,
            json!({
                "token_id": fill.token_id.as_str(),
                "side": fill.side.to_string(),
                "price": fill.price_vwap.to_string(),
                "quantity": fill.quantity.to_string(),
                "fees": fill.fees_paid.to_string(),
                "slippage_bps": fill.slippage_bps,
                "is_simulated": true,
            }),
        );
    }
}

#[async_trait]
impl ArbExecutor for SimulatedExecutor {
    async fn execute_arbitrage(&self, signal: Signal) -> ExecutionOutcome {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        self.telemetry.emit(
            EventType::OrderSubmitted,
            signal.trace_id,
            json!({
                "market_id": signal.market_id(),
                "mode": "simulated",
                "trade_size": signal.opportunity.trade_size_usdc.to_string(),
            }),
        );

        let yes_fill = self.fill_leg(&signal, true);
        let no_fill = self.fill_leg(&signal, false);

        let (status, error_kind) = match (&yes_fill, &no_fill) {
            (Some(_), Some(_)) => (TxStatus::Success, None),
            // A simulated one-legged outcome is still surfaced as
            // partial so the risk path exercises identically to live.
            (Some(_), None) => (TxStatus::Partial, Some(ErrorKind::InsufficientLiquidity)),
            _ => (TxStatus::Failed, Some(ErrorKind::InsufficientLiquidity)),
        };

        match status {
            TxStatus::Success => {
                self.stats.filled.fetch_add(1, Ordering::Relaxed);
                info!(
                    "simulated arbitrage filled: market={} qty_yes={} qty_no={}",
                    signal.market_id(),
                    yes_fill.as_ref().map(|f| f.quantity).unwrap_or_default(),
                    no_fill.as_ref().map(|f| f.quantity).unwrap_or_default(),
                );
            }
            _ => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        for fill in yes_fill.iter().chain(no_fill.iter()) {
            self.emit_fill(&signal, fill);
        }

        ExecutionOutcome {
            yes_fill: yes_fill.clone(),
            no_fill: no_fill.clone(),
            tx: TxResult {
                signal,
                status,
                yes_leg: None,
                no_leg: None,
                error_kind,
            },
        }
    }
}
