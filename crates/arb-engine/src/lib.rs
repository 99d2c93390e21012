//! Two-leg atomic arbitrage engine for binary prediction markets.
//!
//! The engine consumes streaming order-book updates for YES/NO market
//! pairs, detects cross-side arbitrage (YES + NO < 1 USDC), gates each
//! opportunity through edge accounting and risk validation, and routes
//! accepted signals to either a simulated or a live two-leg executor.
//!
//! ## Pipeline
//!
//! feed -> book store -> detector -> edge -> risk -> router -> executor -> pnl
//!
//! The live submission path is guarded by a circuit breaker, a nonce
//! manager, a retry policy, and an idempotency registry. Every artifact
//! carries the trace id minted at detection.
//!
//! ## Modules
//!
//! - `config`: TOML + env + CLI configuration
//! - `detector`: VWAP-pair opportunity detection
//! - `edge`: gross -> net edge breakdown with cost attribution
//! - `risk`: risk gating, anomaly guard, PnL tracking
//! - `exec`: execution router, executors, and submission-path guards
//! - `telemetry`: trace-scoped events, latency buckets, event log
//! - `engine`: root task wiring and housekeeping

pub mod config;
pub mod detector;
pub mod edge;
pub mod engine;
pub mod exec;
pub mod queue;
pub mod risk;
pub mod snapshot;
pub mod telemetry;
pub mod types;

pub use config::EngineConfig;
pub use detector::{DetectorConfig, OpportunityDetector};
pub use edge::{EdgeBreakdown, EdgeCalculator, EdgeConfig, EdgeDecision, EdgeReject, PriceOracle};
pub use engine::Engine;
pub use exec::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use exec::chain::{ChainClient, ChainError, GasEstimate, Order, SignedOrder, TxReceipt};
pub use exec::idempotency::{IdempotencyRegistry, IdempotencyStatus};
pub use exec::live::LiveExecutor;
pub use exec::nonce::NonceManager;
pub use exec::retry::{RetryConfig, RetryPolicy};
pub use exec::router::ExecutionRouter;
pub use exec::simulated::SimulatedExecutor;
pub use exec::{ArbExecutor, ExecutionOutcome};
pub use risk::anomaly::{AnomalyConfig, AnomalyGuard, AnomalyKind};
pub use risk::manager::{RiskContext, RiskManager, RiskRejection};
pub use risk::pnl::{PnlSummary, PnlTracker};
pub use telemetry::bus::TelemetryBus;
pub use telemetry::events::{EventType, TelemetryEvent};
pub use telemetry::latency::{LatencyStage, LatencyTracker};
pub use telemetry::recorder::EventRecorder;
pub use types::{
    ArbitrageOpportunity, ErrorKind, Fill, IdempotencyKey, LegResult, Signal, TraceId, TxResult,
    TxStatus,
};
