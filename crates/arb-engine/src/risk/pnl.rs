//! PnL tracking over fills.
//!
//! Fills are grouped by trace id into atomic YES+NO pairs. For a paired
//! quantity q:
//!
//! `cost = yes.price*q + no.price*q + fees_total + slippage_total`
//!
//! and since 1 YES + 1 NO resolves to exactly 1 USDC,
//! `realized_pnl = q - cost`. That identity is a pre-resolution proxy;
//! the final counter is reconciled by [`PnlTracker::settle_pair`] at the
//! settlement event.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use arb_common::Outcome;

use crate::types::{Fill, TraceId};

/// A completed YES+NO pair with its PnL attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairPnl {
    pub trace_id: TraceId,
    pub qty: Decimal,
    pub cost: Decimal,
    pub fees: Decimal,
    pub slippage: Decimal,
    /// Proxy realization: qty - cost.
    pub pnl: Decimal,
    pub is_simulated: bool,
    pub completed_at: DateTime<Utc>,
}

/// Rolling PnL summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSummary {
    pub cumulative_expected_edge: Decimal,
    pub cumulative_simulated_pnl: Decimal,
    pub cumulative_realized_pnl: Decimal,
    /// Settlement-reconciled realization (only moves at resolution).
    pub cumulative_settled_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub pairs_completed: u64,
    pub legs_unpaired: u64,
}

#[derive(Debug, Default)]
struct PnlInner {
    /// First leg of each trace awaiting its counterpart.
    open_legs: HashMap<TraceId, Fill>,
    pairs: Vec<PairPnl>,
    cumulative_expected_edge: Decimal,
    cumulative_simulated_pnl: Decimal,
    cumulative_realized_pnl: Decimal,
    cumulative_settled_pnl: Decimal,
    /// Running peak of the realized stream for drawdown.
    realized_peak: Decimal,
    max_drawdown: Decimal,
    /// Realized PnL per UTC day (live fills only), for the daily loss
    /// limit.
    daily: HashMap<NaiveDate, Decimal>,
}

/// Fill-driven PnL tracker. Fills are append-only.
#[derive(Debug, Default)]
pub struct PnlTracker {
    inner: Mutex<PnlInner>,
}

impl PnlTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the expected edge of an accepted signal at signal time.
    pub fn record_expected_edge(&self, edge: Decimal) {
        self.inner.lock().cumulative_expected_edge += edge;
    }

    /// Append one fill. Returns the pair PnL when this fill completed
    /// an atomic pair.
    pub fn record_fill(&self, fill: Fill) -> Option<PairPnl> {
        let mut inner = self.inner.lock();
        let Some(first) = inner.open_legs.remove(&fill.trace_id) else {
            inner.open_legs.insert(fill.trace_id, fill);
            return None;
        };

        let qty = first.quantity.min(fill.quantity);
        let fees = first.fees_paid + fill.fees_paid;
        let slippage = first.slippage_cost() + fill.slippage_cost();
        let cost = first.price_vwap * qty + fill.price_vwap * qty + fees + slippage;
        let pnl = qty - cost;
        let is_simulated = first.is_simulated || fill.is_simulated;

        let pair = PairPnl {
            trace_id: fill.trace_id,
            qty,
            cost,
            fees,
            slippage,
            pnl,
            is_simulated,
            completed_at: fill.timestamp,
        };

        if is_simulated {
            inner.cumulative_simulated_pnl += pnl;
        } else {
            inner.cumulative_realized_pnl += pnl;
            let day = fill.timestamp.date_naive();
            *inner.daily.entry(day).or_default() += pnl;
            let realized = inner.cumulative_realized_pnl;
            inner.realized_peak = inner.realized_peak.max(realized);
            let drawdown = inner.realized_peak - realized;
            inner.max_drawdown = inner.max_drawdown.max(drawdown);
        }

        debug!(
            "pair completed: trace={} qty={} pnl={} simulated={}",
            pair.trace_id, pair.qty, pair.pnl, pair.is_simulated
        );
        inner.pairs.push(pair.clone());
        Some(pair)
    }

    /// Reconcile a pair at market resolution. The winning side pays 1
    /// USDC per share, the other 0; a fully paired position settles at
    /// exactly `qty` regardless of outcome.
    pub fn settle_pair(&self, trace_id: TraceId, _winning: Outcome) {
        let mut inner = self.inner.lock();
        if let Some(pair) = inner.pairs.iter().find(|p| p.trace_id == trace_id) {
            let settled = pair.qty - pair.cost;
            inner.cumulative_settled_pnl += settled;
        }
    }

    /// Realized PnL (live fills) for the given UTC day.
    pub fn daily_realized(&self, day: NaiveDate) -> Decimal {
        self.inner
            .lock()
            .daily
            .get(&day)
            .copied()
            .unwrap_or_default()
    }

    pub fn summary(&self) -> PnlSummary {
        let inner = self.inner.lock();
        PnlSummary {
            cumulative_expected_edge: inner.cumulative_expected_edge,
            cumulative_simulated_pnl: inner.cumulative_simulated_pnl,
            cumulative_realized_pnl: inner.cumulative_realized_pnl,
            cumulative_settled_pnl: inner.cumulative_settled_pnl,
            max_drawdown: inner.max_drawdown,
            pairs_completed: inner.pairs.len() as u64,
            legs_unpaired: inner.open_legs.len() as u64,
        }
    }

    /// Restore cumulative counters from a recovery snapshot.
    pub fn restore_cumulative(
        &self,
        expected: Decimal,
        simulated: Decimal,
        realized: Decimal,
        settled: Decimal,
    ) {
        let mut inner = self.inner.lock();
        inner.cumulative_expected_edge = expected;
        inner.cumulative_simulated_pnl = simulated;
        inner.cumulative_realized_pnl = realized;
        inner.cumulative_settled_pnl = settled;
        inner.realized_peak = realized.max(Decimal::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arb_common::{Side, TokenId};
    use rust_decimal_macros::dec;

    fn fill(
        trace: TraceId,
        token: &str,
        qty: Decimal,
        price: Decimal,
        fees: Decimal,
        simulated: bool,
    ) -> Fill {
        Fill {
            token_id: TokenId::new(token),
            side: Side::Buy,
            quantity: qty,
            price_vwap: price,
            fees_paid: fees,
            slippage_bps: 0,
            tx_hash: None,
            is_simulated: simulated,
            timestamp: Utc::now(),
            trace_id: trace,
        }
    }

    #[test]
    fn test_pnl_identity() {
        // realized = q - (notionals + fees + slippage).
        let tracker = PnlTracker::new();
        let trace = TraceId::generate();

        assert!(tracker
            .record_fill(fill(trace, "yes", dec!(10), dec!(0.45), dec!(0.02), false))
            .is_none());
        let pair = tracker
            .record_fill(fill(trace, "no", dec!(10), dec!(0.50), dec!(0.02), false))
            .unwrap();

        // cost = 4.5 + 5.0 + 0.04 = 9.54; pnl = 10 - 9.54 = 0.46.
        assert_eq!(pair.qty, dec!(10));
        assert_eq!(pair.cost, dec!(9.54));
        assert_eq!(pair.pnl, dec!(0.46));
        assert_eq!(pair.pnl, pair.qty - pair.cost);

        let summary = tracker.summary();
        assert_eq!(summary.cumulative_realized_pnl, dec!(0.46));
        assert_eq!(summary.cumulative_simulated_pnl, Decimal::ZERO);
        assert_eq!(summary.pairs_completed, 1);
        assert_eq!(summary.legs_unpaired, 0);
    }

    #[test]
    fn test_pair_uses_min_quantity() {
        let tracker = PnlTracker::new();
        let trace = TraceId::generate();
        tracker.record_fill(fill(trace, "yes", dec!(11.11), dec!(0.45), dec!(0), false));
        let pair = tracker
            .record_fill(fill(trace, "no", dec!(10), dec!(0.50), dec!(0), false))
            .unwrap();
        assert_eq!(pair.qty, dec!(10));
        // cost = 0.95 * 10 = 9.5; pnl = 0.5
        assert_eq!(pair.pnl, dec!(0.5));
    }

    #[test]
    fn test_simulated_and_realized_streams_separate() {
        let tracker = PnlTracker::new();

        let sim_trace = TraceId::generate();
        tracker.record_fill(fill(sim_trace, "yes", dec!(10), dec!(0.45), dec!(0), true));
        tracker.record_fill(fill(sim_trace, "no", dec!(10), dec!(0.50), dec!(0), true));

        let live_trace = TraceId::generate();
        tracker.record_fill(fill(live_trace, "yes", dec!(4), dec!(0.40), dec!(0), false));
        tracker.record_fill(fill(live_trace, "no", dec!(4), dec!(0.50), dec!(0), false));

        let summary = tracker.summary();
        assert_eq!(summary.cumulative_simulated_pnl, dec!(0.5));
        assert_eq!(summary.cumulative_realized_pnl, dec!(0.4));
    }

    #[test]
    fn test_slippage_included_in_cost() {
        let tracker = PnlTracker::new();
        let trace = TraceId::generate();
        let mut yes = fill(trace, "yes", dec!(10), dec!(0.45), dec!(0), false);
        yes.slippage_bps = 100; // 1% of 4.5 = 0.045
        tracker.record_fill(yes);
        let pair = tracker
            .record_fill(fill(trace, "no", dec!(10), dec!(0.50), dec!(0), false))
            .unwrap();
        assert_eq!(pair.slippage, dec!(0.045));
        assert_eq!(pair.pnl, dec!(10) - dec!(9.5) - dec!(0.045));
    }

    #[test]
    fn test_max_drawdown_tracks_realized_trough() {
        let tracker = PnlTracker::new();

        // Win +0.46.
        let t1 = TraceId::generate();
        tracker.record_fill(fill(t1, "yes", dec!(10), dec!(0.45), dec!(0.02), false));
        tracker.record_fill(fill(t1, "no", dec!(10), dec!(0.50), dec!(0.02), false));

        // Loss: pay above 1.0 combined (stress case), pnl = 10 - 10.2 = -0.2.
        let t2 = TraceId::generate();
        tracker.record_fill(fill(t2, "yes", dec!(10), dec!(0.52), dec!(0), false));
        tracker.record_fill(fill(t2, "no", dec!(10), dec!(0.50), dec!(0), false));

        let summary = tracker.summary();
        assert_eq!(summary.cumulative_realized_pnl, dec!(0.26));
        assert_eq!(summary.max_drawdown, dec!(0.2));
    }

    #[test]
    fn test_daily_realized_window() {
        let tracker = PnlTracker::new();
        let trace = TraceId::generate();
        tracker.record_fill(fill(trace, "yes", dec!(10), dec!(0.45), dec!(0), false));
        tracker.record_fill(fill(trace, "no", dec!(10), dec!(0.50), dec!(0), false));

        let today = Utc::now().date_naive();
        assert_eq!(tracker.daily_realized(today), dec!(0.5));
        assert_eq!(
            tracker.daily_realized(today.pred_opt().unwrap()),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_settlement_reconciliation() {
        let tracker = PnlTracker::new();
        let trace = TraceId::generate();
        tracker.record_fill(fill(trace, "yes", dec!(10), dec!(0.45), dec!(0), false));
        tracker.record_fill(fill(trace, "no", dec!(10), dec!(0.50), dec!(0), false));

        assert_eq!(tracker.summary().cumulative_settled_pnl, Decimal::ZERO);
        tracker.settle_pair(trace, Outcome::Yes);
        assert_eq!(tracker.summary().cumulative_settled_pnl, dec!(0.5));
    }

    #[test]
    fn test_expected_edge_accumulates() {
        let tracker = PnlTracker::new();
        tracker.record_expected_edge(dec!(0.5));
        tracker.record_expected_edge(dec!(0.25));
        assert_eq!(tracker.summary().cumulative_expected_edge, dec!(0.75));
    }
}
