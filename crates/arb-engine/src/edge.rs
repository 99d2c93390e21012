//! Edge accounting: gross edge to net edge with cost attribution.
//!
//! Transforms a raw opportunity into an [`EdgeBreakdown`] whose algebra
//! is exact in decimal arithmetic:
//!
//! `net_edge = gross_edge - (fees + slippage + gas + latency_buffer)`
//!
//! and accepts only when `net_edge >= min_threshold` with no blocking
//! reject reason.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exec::chain::GasEstimate;
use crate::types::ArbitrageOpportunity;

/// Converts a native-token amount (gas) into USDC.
///
/// Injected seam: production wires a chain price oracle, tests and
/// dry-run use [`FixedOracle`]. Deliberately synchronous so edge math
/// never suspends.
pub trait PriceOracle: Send + Sync {
    fn native_to_usdc(&self, native: Decimal) -> Decimal;
}

/// Fixed-rate oracle (e.g. 1 MATIC = rate USDC).
#[derive(Debug, Clone)]
pub struct FixedOracle {
    pub rate: Decimal,
}

impl FixedOracle {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }
}

impl PriceOracle for FixedOracle {
    fn native_to_usdc(&self, native: Decimal) -> Decimal {
        native * self.rate
    }
}

impl PriceOracle for std::sync::Arc<dyn PriceOracle> {
    fn native_to_usdc(&self, native: Decimal) -> Decimal {
        (**self).native_to_usdc(native)
    }
}

/// Edge decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeDecision {
    Accept,
    Reject,
}

/// Reject reasons. Exhaustive: every rejected breakdown carries exactly
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeReject {
    ProfitTooLow,
    GasTooHigh,
    SlippageTooHigh,
    LatencyBufferDominates,
    NegativeNetEdge,
}

impl EdgeReject {
    pub fn code(&self) -> &'static str {
        match self {
            EdgeReject::ProfitTooLow => "PROFIT_TOO_LOW",
            EdgeReject::GasTooHigh => "GAS_TOO_HIGH",
            EdgeReject::SlippageTooHigh => "SLIPPAGE_TOO_HIGH",
            EdgeReject::LatencyBufferDominates => "LATENCY_BUFFER_DOMINATES",
            EdgeReject::NegativeNetEdge => "NEGATIVE_NET_EDGE",
        }
    }
}

impl std::fmt::Display for EdgeReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Cost-attributed edge breakdown for one opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeBreakdown {
    pub gross_edge: Decimal,
    pub fees_est: Decimal,
    pub slippage_est: Decimal,
    pub gas_est: Decimal,
    pub latency_buffer: Decimal,
    pub net_edge: Decimal,
    pub min_threshold: Decimal,
    pub decision: EdgeDecision,
    pub reject_reason: Option<EdgeReject>,
    pub risk_tags: Vec<String>,
}

impl EdgeBreakdown {
    pub fn accepted(&self) -> bool {
        self.decision == EdgeDecision::Accept
    }
}

/// Edge calculator configuration.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Taker fee rate (e.g. 0.0035 = 0.35%).
    pub fee_rate: Decimal,
    /// Expected slippage in basis points.
    pub slippage_bps: u32,
    /// Latency risk buffer in basis points of notional.
    pub latency_buffer_bps: u32,
    /// Cap on the latency buffer in USDC.
    pub latency_buffer_cap: Decimal,
    /// Absolute profit floor in USDC.
    pub min_profit_abs: Decimal,
    /// Minimum profit as a fraction of quantity.
    pub min_profit_pct: Decimal,
    /// Hard ceiling on acceptable gas cost in USDC.
    pub max_gas_cost_usdc: Decimal,
    /// Per-transaction gas units estimate fallback when the chain
    /// estimate carries no limit.
    pub default_gas_limit: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(35, 4),        // 0.35%
            slippage_bps: 5,
            latency_buffer_bps: 2,
            latency_buffer_cap: Decimal::new(5, 2), // $0.05
            min_profit_abs: Decimal::new(1, 2),     // $0.01
            min_profit_pct: Decimal::new(1, 2),     // 1% of qty
            max_gas_cost_usdc: Decimal::ONE,
            default_gas_limit: 150_000,
        }
    }
}

/// Edge calculator.
pub struct EdgeCalculator<O: PriceOracle> {
    config: EdgeConfig,
    oracle: O,
}

impl<O: PriceOracle> EdgeCalculator<O> {
    pub fn new(config: EdgeConfig, oracle: O) -> Self {
        Self { config, oracle }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// Gas cost in USDC for a two-leg execution at the given estimate.
    pub fn gas_cost_usdc(&self, gas: &GasEstimate) -> Decimal {
        let limit = if gas.gas_limit > 0 {
            gas.gas_limit
        } else {
            self.config.default_gas_limit
        };
        let wei =
            Decimal::from(gas.max_fee_per_gas_wei()) * Decimal::from(limit) * Decimal::TWO;
        let native = wei / Decimal::from(1_000_000_000_000_000_000u64);
        self.oracle.native_to_usdc(native)
    }

    /// Compute the full breakdown for an opportunity.
    pub fn evaluate(
        &self,
        opp: &ArbitrageOpportunity,
        gas: &GasEstimate,
        risk_tags: Vec<String>,
    ) -> EdgeBreakdown {
        let qty = opp.qty;
        let combined = opp.yes_vwap + opp.no_vwap;
        let notional = combined * qty;

        let gross_edge = opp.expected_profit_per_unit * qty;
        let fees_est = notional * self.config.fee_rate;
        let slippage_est =
            notional * Decimal::from(self.config.slippage_bps) / Decimal::from(10_000u32);
        let gas_est = self.gas_cost_usdc(gas);
        let latency_buffer = (qty * Decimal::from(self.config.latency_buffer_bps)
            / Decimal::from(10_000u32))
        .min(self.config.latency_buffer_cap);

        let net_edge = gross_edge - (fees_est + slippage_est + gas_est + latency_buffer);
        let min_threshold = self
            .config
            .min_profit_abs
            .max(qty * self.config.min_profit_pct);

        let reject_reason = self.classify(
            fees_est,
            slippage_est,
            gas_est,
            latency_buffer,
            net_edge,
            min_threshold,
        );

        EdgeBreakdown {
            gross_edge,
            fees_est,
            slippage_est,
            gas_est,
            latency_buffer,
            net_edge,
            min_threshold,
            decision: if reject_reason.is_none() {
                EdgeDecision::Accept
            } else {
                EdgeDecision::Reject
            },
            reject_reason,
            risk_tags,
        }
    }

    fn classify(
        &self,
        fees_est: Decimal,
        slippage_est: Decimal,
        gas_est: Decimal,
        latency_buffer: Decimal,
        net_edge: Decimal,
        min_threshold: Decimal,
    ) -> Option<EdgeReject> {
        if gas_est > self.config.max_gas_cost_usdc {
            return Some(EdgeReject::GasTooHigh);
        }
        if net_edge < Decimal::ZERO {
            // Attribute the loss to the single largest cost component.
            let mut reason = EdgeReject::NegativeNetEdge;
            let mut largest = fees_est;
            if slippage_est > largest {
                largest = slippage_est;
                reason = EdgeReject::SlippageTooHigh;
            }
            if gas_est > largest {
                largest = gas_est;
                reason = EdgeReject::GasTooHigh;
            }
            if latency_buffer > largest {
                reason = EdgeReject::LatencyBufferDominates;
            }
            return Some(reason);
        }
        if net_edge < min_threshold {
            return Some(EdgeReject::ProfitTooLow);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraceId;
    use arb_common::MarketPair;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn opportunity(yes: Decimal, no: Decimal, qty: Decimal) -> ArbitrageOpportunity {
        let gross = Decimal::ONE - (yes + no);
        ArbitrageOpportunity {
            pair: MarketPair::new("m1", "yes", "no", "q", None).unwrap(),
            yes_vwap: yes,
            no_vwap: no,
            qty,
            trade_size_usdc: dec!(10),
            expected_profit_per_unit: gross,
            expected_profit_total: gross * qty,
            partial_depth: false,
            detected_at: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }

    fn no_gas() -> GasEstimate {
        GasEstimate {
            base_fee_wei: 0,
            priority_fee_wei: 0,
            gas_limit: 0,
        }
    }

    fn calc(config: EdgeConfig) -> EdgeCalculator<FixedOracle> {
        EdgeCalculator::new(config, FixedOracle::new(Decimal::ONE))
    }

    #[test]
    fn test_net_edge_identity() {
        // net = gross - (fees + slippage + gas + latency), exactly.
        let calculator = calc(EdgeConfig::default());
        let opp = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());

        assert_eq!(
            edge.net_edge,
            edge.gross_edge
                - (edge.fees_est + edge.slippage_est + edge.gas_est + edge.latency_buffer)
        );
        assert_eq!(edge.gross_edge, dec!(0.5));
        // fees = 9.5 * 0.0035
        assert_eq!(edge.fees_est, dec!(0.033250));
        // slippage = 9.5 * 5e-4
        assert_eq!(edge.slippage_est, dec!(0.00475));
    }

    #[test]
    fn test_accept_clear_arbitrage() {
        // Scenario 1 economics: 0.45/0.50 books, default costs.
        let mut config = EdgeConfig::default();
        config.latency_buffer_bps = 0;
        let calculator = calc(config);
        let opp = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());

        assert_eq!(edge.decision, EdgeDecision::Accept);
        assert!(edge.reject_reason.is_none());
        assert!(edge.net_edge >= edge.min_threshold);
        // Accepted implies positive gross edge.
        assert!(edge.gross_edge > Decimal::ZERO);
    }

    #[test]
    fn test_reject_profit_too_low_on_fee_domination() {
        // Scenario 2: fee_rate 3% eats most of the margin and the
        // percentage threshold rejects what is left.
        let config = EdgeConfig {
            fee_rate: dec!(0.03),
            min_profit_pct: dec!(0.03),
            ..EdgeConfig::default()
        };
        let calculator = calc(config);
        let opp = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());

        assert_eq!(edge.decision, EdgeDecision::Reject);
        assert_eq!(edge.reject_reason, Some(EdgeReject::ProfitTooLow));
        assert!(edge.net_edge > Decimal::ZERO);
        assert!(edge.net_edge < edge.min_threshold);
    }

    #[test]
    fn test_reject_gas_too_high() {
        let calculator = calc(EdgeConfig::default());
        let opp = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        // 500 gwei * 2M gas * 2 legs = 2 native = 2 USDC at rate 1.
        let gas = GasEstimate {
            base_fee_wei: 400_000_000_000,
            priority_fee_wei: 100_000_000_000,
            gas_limit: 2_000_000,
        };
        let edge = calculator.evaluate(&opp, &gas, Vec::new());
        assert_eq!(edge.reject_reason, Some(EdgeReject::GasTooHigh));
    }

    #[test]
    fn test_reject_negative_net_edge_attribution() {
        // Tiny gross edge with huge slippage config: negative net,
        // attributed to slippage.
        let config = EdgeConfig {
            slippage_bps: 1_000, // 10%
            ..EdgeConfig::default()
        };
        let calculator = calc(config);
        let opp = opportunity(dec!(0.495), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());

        assert!(edge.net_edge < Decimal::ZERO);
        assert_eq!(edge.reject_reason, Some(EdgeReject::SlippageTooHigh));
    }

    #[test]
    fn test_reject_latency_buffer_dominates() {
        let config = EdgeConfig {
            fee_rate: Decimal::ZERO,
            slippage_bps: 0,
            latency_buffer_bps: 10_000, // 100% of qty, absurd on purpose
            latency_buffer_cap: dec!(100),
            ..EdgeConfig::default()
        };
        let calculator = calc(config);
        let opp = opportunity(dec!(0.495), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());

        assert!(edge.net_edge < Decimal::ZERO);
        assert_eq!(edge.reject_reason, Some(EdgeReject::LatencyBufferDominates));
    }

    #[test]
    fn test_latency_buffer_capped() {
        let config = EdgeConfig {
            latency_buffer_bps: 10_000,
            latency_buffer_cap: dec!(0.02),
            ..EdgeConfig::default()
        };
        let calculator = calc(config);
        let opp = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&opp, &no_gas(), Vec::new());
        assert_eq!(edge.latency_buffer, dec!(0.02));
    }

    #[test]
    fn test_threshold_is_max_of_abs_and_pct() {
        let config = EdgeConfig {
            min_profit_abs: dec!(0.25),
            min_profit_pct: dec!(0.01),
            ..EdgeConfig::default()
        };
        let calculator = calc(config);

        let small = opportunity(dec!(0.45), dec!(0.50), dec!(10));
        let edge = calculator.evaluate(&small, &no_gas(), Vec::new());
        // qty*pct = 0.1 < abs floor 0.25
        assert_eq!(edge.min_threshold, dec!(0.25));

        let large = opportunity(dec!(0.45), dec!(0.50), dec!(100));
        let edge = calculator.evaluate(&large, &no_gas(), Vec::new());
        assert_eq!(edge.min_threshold, dec!(1.00));
    }

    #[test]
    fn test_gas_cost_conversion() {
        // 30 gwei fee, 150k gas, 2 legs = 0.009 native; oracle 0.8 -> 0.0072.
        let calculator =
            EdgeCalculator::new(EdgeConfig::default(), FixedOracle::new(dec!(0.8)));
        let gas = GasEstimate {
            base_fee_wei: 25_000_000_000,
            priority_fee_wei: 5_000_000_000,
            gas_limit: 150_000,
        };
        assert_eq!(calculator.gas_cost_usdc(&gas), dec!(0.0072));
    }
}
