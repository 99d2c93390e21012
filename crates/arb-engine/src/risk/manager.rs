//! Risk manager: the last gate before execution.
//!
//! Receives an opportunity with its edge breakdown plus current balance
//! and position, runs the check pipeline in order (short-circuiting on
//! the first failure), and either mints a [`Signal`] or returns a
//! [`RiskRejection`].
//!
//! Check order:
//! 1. pair not suppressed by an unresolved partial fill
//! 2. balance funds both legs plus gas
//! 3. position limit
//! 4. gas ceiling
//! 5. edge decision (re-checked after the balance haircut)
//! 6. daily loss limit
//! 7. anomaly guard window

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{info, warn};

use crate::edge::{EdgeBreakdown, EdgeReject};
use crate::risk::anomaly::{AnomalyGuard, AnomalyKind};
use crate::types::{ArbitrageOpportunity, IdempotencyKey, Signal};

/// Why a signal was refused. Rejections are values, not errors: they
/// are logged and attributed, never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskRejection {
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },
    PositionLimit {
        current: Decimal,
        adding: Decimal,
        max: Decimal,
    },
    GasTooHigh {
        gas_est: Decimal,
        max: Decimal,
    },
    ProfitTooLow {
        net_edge: Decimal,
        threshold: Decimal,
    },
    DailyLossLimit {
        daily_pnl: Decimal,
        worst_case: Decimal,
        max_loss: Decimal,
    },
    ResolutionUncertain,
    ManipulationRisk,
    AbnormalVolatility,
    /// Unresolved one-legged exposure on this pair.
    PairSuppressed,
}

impl RiskRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RiskRejection::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            RiskRejection::PositionLimit { .. } => "POSITION_LIMIT",
            RiskRejection::GasTooHigh { .. } => "GAS_TOO_HIGH",
            RiskRejection::ProfitTooLow { .. } => "PROFIT_TOO_LOW",
            RiskRejection::DailyLossLimit { .. } => "DAILY_LOSS_LIMIT",
            RiskRejection::ResolutionUncertain => "RESOLUTION_UNCERTAIN",
            RiskRejection::ManipulationRisk => "MANIPULATION_RISK",
            RiskRejection::AbnormalVolatility => "ABNORMAL_VOLATILITY",
            RiskRejection::PairSuppressed => "PAIR_SUPPRESSED",
        }
    }
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Risk limits.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Maximum open position (USDC notional).
    pub max_position_size: Decimal,
    /// Maximum realized daily loss (positive number, USDC).
    pub max_daily_loss: Decimal,
    /// Hard gas ceiling (USDC).
    pub max_gas_cost_usdc: Decimal,
    /// Idempotency bucket width in milliseconds.
    pub idempotency_window_ms: u64,
    pub strategy_tag: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::new(1000, 0),
            max_daily_loss: Decimal::new(500, 0),
            max_gas_cost_usdc: Decimal::ONE,
            idempotency_window_ms: 10_000,
            strategy_tag: "atomic".to_string(),
        }
    }
}

/// Inputs to one validation, gathered by the caller.
#[derive(Debug, Clone)]
pub struct RiskContext {
    /// Wallet USDC balance.
    pub balance: Decimal,
    /// Current open position (USDC notional).
    pub position: Decimal,
    /// Realized daily PnL so far (negative = loss).
    pub daily_pnl: Decimal,
}

/// Risk manager. Also owns the suppressed-pair set fed by partial
/// fills: a pair with unresolved one-legged exposure admits no new
/// signals until an operator clears it.
pub struct RiskManager {
    config: RiskConfig,
    anomaly: Option<Arc<AnomalyGuard>>,
    suppressed: Mutex<HashSet<String>>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, anomaly: Option<Arc<AnomalyGuard>>) -> Self {
        Self {
            config,
            anomaly,
            suppressed: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Suppress all new signals for a pair (partial-fill fallout).
    pub fn suppress_pair(&self, market_id: &str) {
        warn!("pair suppressed pending reconciliation: {market_id}");
        self.suppressed.lock().insert(market_id.to_string());
    }

    /// Operator intervention: position reconciled, pair tradable again.
    pub fn clear_suppression(&self, market_id: &str) {
        info!("pair suppression cleared: {market_id}");
        self.suppressed.lock().remove(market_id);
    }

    pub fn is_suppressed(&self, market_id: &str) -> bool {
        self.suppressed.lock().contains(market_id)
    }

    pub fn suppressed_pairs(&self) -> Vec<String> {
        self.suppressed.lock().iter().cloned().collect()
    }

    /// Run the check pipeline. On success mints the signal with its
    /// idempotency key.
    pub fn validate(
        &self,
        opportunity: ArbitrageOpportunity,
        edge: EdgeBreakdown,
        ctx: &RiskContext,
    ) -> Result<Signal, RiskRejection> {
        let qty = opportunity.qty;
        let market_id = &opportunity.pair.market_id;

        // 1. Partial-fill suppression.
        if self.is_suppressed(market_id) {
            return Err(RiskRejection::PairSuppressed);
        }

        // 2. Both legs fundable: worst leg price on both sides + gas.
        let worst_leg = opportunity.yes_vwap.max(opportunity.no_vwap);
        let required = Decimal::TWO * qty * worst_leg + edge.gas_est;
        if ctx.balance < required {
            return Err(RiskRejection::InsufficientBalance {
                required,
                available: ctx.balance,
            });
        }

        // 3. Position limit on notional.
        let adding = qty * opportunity.combined_cost();
        if ctx.position + adding > self.config.max_position_size {
            return Err(RiskRejection::PositionLimit {
                current: ctx.position,
                adding,
                max: self.config.max_position_size,
            });
        }

        // 4. Gas ceiling.
        if edge.gas_est > self.config.max_gas_cost_usdc {
            return Err(RiskRejection::GasTooHigh {
                gas_est: edge.gas_est,
                max: self.config.max_gas_cost_usdc,
            });
        }

        // 5. Edge verdict, re-checked here so a stale ACCEPT cannot
        // sneak past the funding checks above.
        if !edge.accepted() {
            return Err(match edge.reject_reason {
                Some(EdgeReject::GasTooHigh) => RiskRejection::GasTooHigh {
                    gas_est: edge.gas_est,
                    max: self.config.max_gas_cost_usdc,
                },
                _ => RiskRejection::ProfitTooLow {
                    net_edge: edge.net_edge,
                    threshold: edge.min_threshold,
                },
            });
        }

        // 6. Daily loss limit against the projected worst case: both
        // legs worthless plus costs (protocol risk bound).
        let worst_case = adding + edge.fees_est + edge.gas_est;
        if ctx.daily_pnl - worst_case < -self.config.max_daily_loss {
            return Err(RiskRejection::DailyLossLimit {
                daily_pnl: ctx.daily_pnl,
                worst_case,
                max_loss: self.config.max_daily_loss,
            });
        }

        // 7. Anomaly window.
        if let Some(guard) = &self.anomaly {
            if let Some(flag) = guard.active_flag(market_id) {
                return Err(match flag.kind {
                    AnomalyKind::PricePulse => RiskRejection::AbnormalVolatility,
                    AnomalyKind::DepthDrop => RiskRejection::ManipulationRisk,
                    AnomalyKind::PairDivergence => RiskRejection::ResolutionUncertain,
                });
            }
        }

        let trace_id = opportunity.trace_id;
        let idempotency_key = self.idempotency_key(market_id, qty);
        info!(
            "signal minted: market={market_id} qty={qty} net_edge={} key={idempotency_key}",
            edge.net_edge
        );

        Ok(Signal {
            opportunity,
            edge,
            idempotency_key,
            trace_id,
            strategy_tag: self.config.strategy_tag.clone(),
        })
    }

    /// keccak(pair_id | round(qty, 4) | floor(now / window)).
    fn idempotency_key(&self, market_id: &str, qty: Decimal) -> IdempotencyKey {
        let bucket = Utc::now().timestamp_millis() as u64 / self.config.idempotency_window_ms;
        Self::key_for(market_id, qty, bucket)
    }

    fn key_for(market_id: &str, qty: Decimal, bucket: u64) -> IdempotencyKey {
        let rounded = qty.round_dp(4);
        let mut hasher = Keccak256::new();
        hasher.update(market_id.as_bytes());
        hasher.update(rounded.to_string().as_bytes());
        hasher.update(bucket.to_le_bytes());
        let digest = hasher.finalize();
        IdempotencyKey::from_hex(hex_encode(&digest))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeDecision;
    use crate::risk::anomaly::AnomalyConfig;
    use crate::types::TraceId;
    use arb_common::MarketPair;
    use rust_decimal_macros::dec;

    fn opportunity() -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            pair: MarketPair::new("m1", "yes", "no", "q", None).unwrap(),
            yes_vwap: dec!(0.45),
            no_vwap: dec!(0.50),
            qty: dec!(10),
            trade_size_usdc: dec!(10),
            expected_profit_per_unit: dec!(0.05),
            expected_profit_total: dec!(0.5),
            partial_depth: false,
            detected_at: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }

    fn accepted_edge() -> EdgeBreakdown {
        EdgeBreakdown {
            gross_edge: dec!(0.5),
            fees_est: dec!(0.03325),
            slippage_est: dec!(0.00475),
            gas_est: dec!(0.01),
            latency_buffer: dec!(0.002),
            net_edge: dec!(0.45),
            min_threshold: dec!(0.1),
            decision: EdgeDecision::Accept,
            reject_reason: None,
            risk_tags: Vec::new(),
        }
    }

    fn healthy_ctx() -> RiskContext {
        RiskContext {
            balance: dec!(100),
            position: dec!(0),
            daily_pnl: dec!(0),
        }
    }

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default(), None)
    }

    #[test]
    fn test_valid_signal_minted() {
        let m = manager();
        let signal = m
            .validate(opportunity(), accepted_edge(), &healthy_ctx())
            .unwrap();
        assert_eq!(signal.market_id(), "m1");
        assert_eq!(signal.strategy_tag, "atomic");
        assert!(!signal.idempotency_key.as_str().is_empty());
    }

    #[test]
    fn test_insufficient_balance() {
        let m = manager();
        let ctx = RiskContext {
            balance: dec!(5),
            ..healthy_ctx()
        };
        // required = 2 * 10 * 0.50 + 0.01 = 10.01 > 5.
        let err = m.validate(opportunity(), accepted_edge(), &ctx).unwrap_err();
        assert!(matches!(err, RiskRejection::InsufficientBalance { .. }));
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    }

    #[test]
    fn test_position_limit() {
        let m = manager();
        let ctx = RiskContext {
            position: dec!(995),
            ..healthy_ctx()
        };
        // adding = 10 * 0.95 = 9.5; 995 + 9.5 > 1000.
        let err = m.validate(opportunity(), accepted_edge(), &ctx).unwrap_err();
        assert!(matches!(err, RiskRejection::PositionLimit { .. }));
    }

    #[test]
    fn test_gas_ceiling() {
        let m = manager();
        let mut edge = accepted_edge();
        edge.gas_est = dec!(2);
        let err = m.validate(opportunity(), edge, &healthy_ctx()).unwrap_err();
        assert!(matches!(err, RiskRejection::GasTooHigh { .. }));
    }

    #[test]
    fn test_edge_reject_propagates_as_profit_too_low() {
        let m = manager();
        let mut edge = accepted_edge();
        edge.decision = EdgeDecision::Reject;
        edge.reject_reason = Some(crate::edge::EdgeReject::ProfitTooLow);
        let err = m.validate(opportunity(), edge, &healthy_ctx()).unwrap_err();
        assert!(matches!(err, RiskRejection::ProfitTooLow { .. }));
    }

    #[test]
    fn test_daily_loss_limit() {
        let m = manager();
        let ctx = RiskContext {
            daily_pnl: dec!(-495),
            ..healthy_ctx()
        };
        // worst_case ~= 9.5 + 0.033 + 0.01; -495 - 9.54 < -500.
        let err = m.validate(opportunity(), accepted_edge(), &ctx).unwrap_err();
        assert!(matches!(err, RiskRejection::DailyLossLimit { .. }));
    }

    #[test]
    fn test_check_order_short_circuits() {
        // Balance failure reported even when several checks would fail.
        let m = manager();
        let ctx = RiskContext {
            balance: dec!(1),
            position: dec!(5000),
            daily_pnl: dec!(-10_000),
        };
        let err = m.validate(opportunity(), accepted_edge(), &ctx).unwrap_err();
        assert!(matches!(err, RiskRejection::InsufficientBalance { .. }));
    }

    #[test]
    fn test_pair_suppression() {
        let m = manager();
        m.suppress_pair("m1");
        let err = m
            .validate(opportunity(), accepted_edge(), &healthy_ctx())
            .unwrap_err();
        assert_eq!(err, RiskRejection::PairSuppressed);

        m.clear_suppression("m1");
        assert!(m
            .validate(opportunity(), accepted_edge(), &healthy_ctx())
            .is_ok());
    }

    #[test]
    fn test_anomaly_flag_maps_to_rejection() {
        let guard = Arc::new(AnomalyGuard::new(AnomalyConfig::default(), None));
        // Divergent pair: |1 - 0.70| > 0.15.
        guard.observe("m1", dec!(0.30), dec!(0.40), dec!(1000));

        let m = RiskManager::new(RiskConfig::default(), Some(guard));
        let err = m
            .validate(opportunity(), accepted_edge(), &healthy_ctx())
            .unwrap_err();
        assert_eq!(err, RiskRejection::ResolutionUncertain);
    }

    #[test]
    fn test_idempotency_key_stability() {
        // Same pair, quantity, and bucket -> same key; different bucket
        // or quantity -> different key.
        let a = RiskManager::key_for("m1", dec!(10.00001), 42);
        let b = RiskManager::key_for("m1", dec!(10.00002), 42);
        let c = RiskManager::key_for("m1", dec!(10.2), 42);
        let d = RiskManager::key_for("m1", dec!(10.00001), 43);

        // Rounding to 4 dp collapses sub-precision differences.
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(
            RiskManager::key_for("m1", dec!(10), 42),
            RiskManager::key_for("m2", dec!(10), 42)
        );
    }
}
