//! Cross-side arbitrage detection.
//!
//! Runs on every top-of-book change affecting a known market pair:
//! snapshots both legs' ask ladders, VWAP-walks each for half of the
//! configured trade size, and emits an [`ArbitrageOpportunity`] when
//! 1 - (yes_vwap + no_vwap) clears the pre-filter floor.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, trace};

use arb_common::MarketPair;
use arb_market::BookStore;

use crate::types::{ArbitrageOpportunity, TraceId};

/// Why no opportunity was emitted for a book change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectSkip {
    /// Either leg's book is missing, stale, or empty.
    NoQuotes,
    /// Combined VWAP cost is at or above 1.0.
    NoEdge,
    /// Positive edge but below the pre-filter floor.
    BelowFloor,
    /// Walks succeeded but the pairable quantity rounded to zero.
    ZeroQuantity,
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Total USDC committed per opportunity (split across legs).
    pub trade_size: Decimal,
    /// Minimum total expected profit to emit at all (small epsilon
    /// above zero; full thresholding happens in the edge calculator).
    pub prefilter_floor: Decimal,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trade_size: Decimal::new(10, 0),
            prefilter_floor: Decimal::new(1, 4), // $0.0001
        }
    }
}

/// VWAP-pair opportunity detector.
pub struct OpportunityDetector {
    config: DetectorConfig,
    store: Arc<BookStore>,
}

impl OpportunityDetector {
    pub fn new(config: DetectorConfig, store: Arc<BookStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate one pair against the current books.
    ///
    /// `size_multiplier` scales the committed trade size (anomaly
    /// degradation); pass 1 for normal operation.
    pub fn detect(
        &self,
        pair: &MarketPair,
        size_multiplier: Decimal,
    ) -> Result<ArbitrageOpportunity, DetectSkip> {
        let trade_size = self.config.trade_size * size_multiplier;
        let leg_budget = trade_size / Decimal::TWO;

        // Frozen views of both ladders; stale books yield no quotes.
        let yes_walk = self
            .store
            .walk_asks(&pair.yes_token_id, leg_budget)
            .map_err(|_| DetectSkip::NoQuotes)?;
        let no_walk = self
            .store
            .walk_asks(&pair.no_token_id, leg_budget)
            .map_err(|_| DetectSkip::NoQuotes)?;

        let gross_per_unit = Decimal::ONE - (yes_walk.vwap + no_walk.vwap);
        if gross_per_unit <= Decimal::ZERO {
            trace!(
                "no edge on {}: yes={} no={}",
                pair.market_id,
                yes_walk.vwap,
                no_walk.vwap
            );
            return Err(DetectSkip::NoEdge);
        }

        // Partial fill on either side: pair only what both legs filled.
        // Share counts round down to 6 decimal places.
        let qty = yes_walk
            .qty
            .min(no_walk.qty)
            .round_dp_with_strategy(6, RoundingStrategy::ToZero);
        if qty <= Decimal::ZERO {
            return Err(DetectSkip::ZeroQuantity);
        }

        let expected_profit_total = gross_per_unit * qty;
        if expected_profit_total < self.config.prefilter_floor {
            return Err(DetectSkip::BelowFloor);
        }

        let opportunity = ArbitrageOpportunity {
            pair: pair.clone(),
            yes_vwap: yes_walk.vwap,
            no_vwap: no_walk.vwap,
            qty,
            trade_size_usdc: trade_size,
            expected_profit_per_unit: gross_per_unit,
            expected_profit_total,
            partial_depth: yes_walk.partial || no_walk.partial,
            detected_at: Utc::now(),
            trace_id: TraceId::generate(),
        };
        debug!(
            "opportunity on {}: gross/unit={} qty={} total={}",
            pair.market_id, gross_per_unit, qty, expected_profit_total
        );
        Ok(opportunity)
    }
}
