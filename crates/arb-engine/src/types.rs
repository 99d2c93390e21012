//! Engine-side domain types: opportunities, signals, fills, tx results.

use std::fmt;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use arb_common::{MarketPair, Side, TokenId};

use crate::edge::EdgeBreakdown;

/// Trace identifier minted at detection and propagated through every
/// derived artifact for latency and causal attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotency key: stable keccak fingerprint of
/// (pair id, rounded trade quantity, detection time bucket).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn from_hex(hex: String) -> Self {
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A detected cross-side arbitrage candidate.
///
/// Invariant: `yes_vwap + no_vwap < 1` before costs, `qty > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub pair: MarketPair,
    /// VWAP to fill the YES leg budget.
    pub yes_vwap: Decimal,
    /// VWAP to fill the NO leg budget.
    pub no_vwap: Decimal,
    /// Paired quantity (min of achievable leg quantities, 6 dp).
    pub qty: Decimal,
    /// Total USDC committed across both legs.
    pub trade_size_usdc: Decimal,
    /// 1 - (yes_vwap + no_vwap).
    pub expected_profit_per_unit: Decimal,
    /// expected_profit_per_unit * qty.
    pub expected_profit_total: Decimal,
    /// True when either ladder could not absorb its full leg budget.
    pub partial_depth: bool,
    pub detected_at: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl ArbitrageOpportunity {
    /// USDC budget for one leg.
    pub fn leg_budget(&self) -> Decimal {
        self.trade_size_usdc / Decimal::TWO
    }

    /// Combined per-share cost of the pair.
    pub fn combined_cost(&self) -> Decimal {
        self.yes_vwap + self.no_vwap
    }
}

/// A validated opportunity ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub opportunity: ArbitrageOpportunity,
    pub edge: EdgeBreakdown,
    pub idempotency_key: IdempotencyKey,
    pub trace_id: TraceId,
    pub strategy_tag: String,
}

impl Signal {
    pub fn market_id(&self) -> &str {
        &self.opportunity.pair.market_id
    }
}

/// A single executed (or simulated) leg fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub token_id: TokenId,
    pub side: Side,
    /// Shares filled.
    pub quantity: Decimal,
    /// Volume-weighted fill price.
    pub price_vwap: Decimal,
    pub fees_paid: Decimal,
    pub slippage_bps: u32,
    pub tx_hash: Option<B256>,
    pub is_simulated: bool,
    pub timestamp: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl Fill {
    /// USDC notional of the fill.
    pub fn notional(&self) -> Decimal {
        self.price_vwap * self.quantity
    }

    /// Slippage cost in USDC implied by the recorded bps.
    pub fn slippage_cost(&self) -> Decimal {
        self.notional() * Decimal::from(self.slippage_bps) / Decimal::from(10_000u32)
    }
}

/// Disjoint error taxonomy for the execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // Transient I/O.
    Timeout,
    ConnectionReset,
    RpcServerError,
    // Chain protocol (retryable, nonce handled specially).
    NonceTooLow,
    ReplacementUnderpriced,
    GasAllowanceExceeded,
    // Chain terminal.
    InsufficientFunds,
    InvalidAddress,
    Reverted,
    Unauthorized,
    // Engine-originated terminals.
    InsufficientLiquidity,
    CircuitOpen,
    DuplicateSuppressed,
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::ConnectionReset
                | ErrorKind::RpcServerError
                | ErrorKind::NonceTooLow
                | ErrorKind::ReplacementUnderpriced
                | ErrorKind::GasAllowanceExceeded
        )
    }
}

impl ErrorKind {
    /// Stable SCREAMING_SNAKE_CASE code, matching the serde form.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ConnectionReset => "CONNECTION_RESET",
            ErrorKind::RpcServerError => "RPC_SERVER_ERROR",
            ErrorKind::NonceTooLow => "NONCE_TOO_LOW",
            ErrorKind::ReplacementUnderpriced => "REPLACEMENT_UNDERPRICED",
            ErrorKind::GasAllowanceExceeded => "GAS_ALLOWANCE_EXCEEDED",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::InvalidAddress => "INVALID_ADDRESS",
            ErrorKind::Reverted => "REVERTED",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::InsufficientLiquidity => "INSUFFICIENT_LIQUIDITY",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::DuplicateSuppressed => "DUPLICATE_SUPPRESSED",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Terminal status of a two-leg execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Both legs confirmed.
    Success,
    /// Leg 1 confirmed, leg 2 terminally failed: one-legged exposure.
    Partial,
    /// Nothing confirmed.
    Failed,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Success => write!(f, "SUCCESS"),
            TxStatus::Partial => write!(f, "PARTIAL"),
            TxStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Per-leg submission outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegResult {
    pub tx_hash: B256,
    pub nonce: u64,
    /// Total attempts spent on the leg (1 = no retries).
    pub attempts: u32,
}

/// Terminal result of an admitted signal. Exactly one is produced per
/// signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub signal: Signal,
    pub status: TxStatus,
    pub yes_leg: Option<LegResult>,
    pub no_leg: Option<LegResult>,
    pub error_kind: Option<ErrorKind>,
}

impl TxResult {
    pub fn success(&self) -> bool {
        self.status == TxStatus::Success
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.signal.idempotency_key
    }

    pub fn trace_id(&self) -> TraceId {
        self.signal.trace_id
    }
}
