//! Execution: router, executors, and the guards on the live path.
//!
//! Both executors expose the same two-leg `execute_arbitrage` surface
//! so downstream PnL and telemetry are indistinguishable in structure
//! between dry-run and live.

pub mod breaker;
pub mod chain;
pub mod idempotency;
pub mod live;
pub mod nonce;
pub mod retry;
pub mod router;
pub mod simulated;

use async_trait::async_trait;

use crate::types::{Fill, Signal, TxResult};

/// Outcome of one two-leg execution: the fills that happened plus the
/// terminal transaction result.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub yes_fill: Option<Fill>,
    pub no_fill: Option<Fill>,
    pub tx: TxResult,
}

impl ExecutionOutcome {
    /// Fills actually produced, in leg order.
    pub fn fills(&self) -> Vec<&Fill> {
        self.yes_fill.iter().chain(self.no_fill.iter()).collect()
    }
}

/// Two-leg arbitrage executor.
///
/// Implementations must uphold the termination guarantees: every
/// admitted signal produces exactly one terminal [`TxResult`], every
/// allocated nonce is confirmed or released, and every idempotency key
/// is finalized.
#[async_trait]
pub trait ArbExecutor: Send + Sync {
    async fn execute_arbitrage(&self, signal: Signal) -> ExecutionOutcome;
}
