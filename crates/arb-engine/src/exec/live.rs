//! Live two-leg executor.
//!
//! Submission protocol per signal:
//! 1. consult the idempotency registry (duplicate -> cached result)
//! 2. enter the circuit-breaker scope (OPEN -> fail fast)
//! 3. allocate a nonce, build/sign/submit leg 1, retry per policy
//! 4. on leg-1 confirmation, fresh nonce and the same for leg 2
//! 5. leg-2 terminal failure after leg 1 confirmed -> PARTIAL result,
//!    surfaced so the risk manager suppresses the pair
//!
//! ```text
//! NEW -> NONCE_ALLOCATED -> LEG1_SUBMITTED -> LEG1_CONFIRMED
//!     -> NONCE2_ALLOCATED -> LEG2_SUBMITTED -> LEG2_CONFIRMED -> DONE
//! any step -> FAILED_RETRYABLE (retry loop) | FAILED_TERMINAL
//! LEG1_CONFIRMED + LEG2 terminal failure -> PARTIAL (terminal)
//! ```
//!
//! Termination guarantees: exactly one terminal [`TxResult`] per
//! admitted signal; every allocated nonce confirmed or released (drop
//! guards cover cancellation); every idempotency key finalized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use arb_common::{Outcome, Side, TokenId};

use crate::edge::PriceOracle;
use crate::telemetry::{EventType, TelemetryBus};
use crate::types::{ErrorKind, Fill, LegResult, Signal, TxResult, TxStatus};

use super::breaker::CircuitBreaker;
use super::chain::{ChainClient, GasEstimate, Order, TxReceipt};
use super::idempotency::{Admission, CachedOutcome, IdempotencyRegistry};
use super::nonce::NonceManager;
use super::retry::RetryPolicy;
use super::{ArbExecutor, ExecutionOutcome};

/// Live execution phases, logged per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    New,
    NonceAllocated,
    Leg1Submitted,
    Leg1Confirmed,
    Nonce2Allocated,
    Leg2Submitted,
    Leg2Confirmed,
    Done,
    Partial,
    FailedTerminal,
}

/// Terminal failure of one leg after the retry loop.
struct LegFailure {
    kind: ErrorKind,
    attempts: u32,
    /// Measured USDC gas cost of the failing call, when a receipt
    /// existed (reverts burn gas).
    gas_cost: Option<Decimal>,
}

/// Live-execution statistics.
#[derive(Debug, Default)]
pub struct LiveStats {
    pub total: AtomicU64,
    pub success: AtomicU64,
    pub partial: AtomicU64,
    pub failed: AtomicU64,
    pub suppressed: AtomicU64,
}

/// Releases a pending nonce on drop unless defused. Covers the
/// cancellation path: a task killed mid-submission must not leak its
/// nonce.
struct NonceGuard {
    nonces: Arc<NonceManager>,
    nonce: u64,
    armed: bool,
}

impl NonceGuard {
    fn new(nonces: Arc<NonceManager>, nonce: u64) -> Self {
        Self {
            nonces,
            nonce,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.nonces.mark_failed(self.nonce) {
                warn!("nonce guard release failed: {e}");
            }
        }
    }
}

/// Finalizes an idempotency key as CANCELLED on drop unless defused.
struct IdempotencyGuard {
    registry: Arc<IdempotencyRegistry>,
    key: crate::types::IdempotencyKey,
    armed: bool,
}

impl IdempotencyGuard {
    fn new(registry: Arc<IdempotencyRegistry>, key: crate::types::IdempotencyKey) -> Self {
        Self {
            registry,
            key,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for IdempotencyGuard {
    fn drop(&mut self) {
        if self.armed {
            let outcome = CachedOutcome {
                status: TxStatus::Failed,
                yes_tx: None,
                no_tx: None,
                error_kind: Some(ErrorKind::Cancelled),
            };
            if let Err(e) = self.registry.finalize(&self.key, outcome) {
                warn!("idempotency guard finalize failed: {e}");
            }
        }
    }
}

/// Live executor: real order creation, signing-capability invocation,
/// and two-leg fill tracking.
pub struct LiveExecutor {
    chain: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    breaker: Arc<CircuitBreaker>,
    idempotency: Arc<IdempotencyRegistry>,
    retry: RetryPolicy,
    oracle: Arc<dyn PriceOracle>,
    wallet: Address,
    fee_rate: Decimal,
    receipt_timeout: Duration,
    telemetry: TelemetryBus,
    stats: Arc<LiveStats>,
}

impl LiveExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        nonces: Arc<NonceManager>,
        breaker: Arc<CircuitBreaker>,
        idempotency: Arc<IdempotencyRegistry>,
        retry: RetryPolicy,
        oracle: Arc<dyn PriceOracle>,
        wallet: Address,
        fee_rate: Decimal,
        receipt_timeout: Duration,
        telemetry: TelemetryBus,
    ) -> Self {
        Self {
            chain,
            nonces,
            breaker,
            idempotency,
            retry,
            oracle,
            wallet,
            fee_rate,
            receipt_timeout,
            telemetry,
            stats: Arc::new(LiveStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LiveStats> {
        Arc::clone(&self.stats)
    }

    fn gas_cost_usdc(&self, gas: &GasEstimate, gas_used: u64) -> Decimal {
        let wei = Decimal::from(gas.max_fee_per_gas_wei()) * Decimal::from(gas_used);
        let native = wei / Decimal::from(1_000_000_000_000_000_000u64);
        self.oracle.native_to_usdc(native)
    }

    fn build_order(&self, token: &TokenId, price: Decimal, size: Decimal) -> Order {
        Order {
            maker: self.wallet,
            token_id: token.clone(),
            side: Side::Buy,
            price,
            size,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            salt: rand::thread_rng().gen(),
        }
    }

    /// Submit one leg with retries. Owns the leg's nonce lifecycle:
    /// the returned nonce is confirmed, any abandoned nonce released.
    async fn submit_leg(
        &self,
        signal: &Signal,
        outcome_leg: Outcome,
    ) -> Result<(LegResult, TxReceipt), LegFailure> {
        let opp = &signal.opportunity;
        let (token, price) = match outcome_leg {
            Outcome::Yes => (&opp.pair.yes_token_id, opp.yes_vwap),
            Outcome::No => (&opp.pair.no_token_id, opp.no_vwap),
        };
        let size = opp.qty;

        let mut attempt: u32 = 0;
        let mut nonce = match self.nonces.allocate() {
            Ok(n) => n,
            Err(e) => {
                warn!("nonce allocation failed: {e}");
                return Err(LegFailure {
                    kind: ErrorKind::Cancelled,
                    attempts: 0,
                    gas_cost: None,
                });
            }
        };
        let mut guard = NonceGuard::new(Arc::clone(&self.nonces), nonce);

        loop {
            attempt += 1;

            // Refresh the gas estimate every attempt: a retry after
            // `gas required exceeds allowance` is only meaningful with
            // a raised allowance.
            let result = self.attempt_leg(signal, token, price, size, nonce).await;

            match result {
                Ok(receipt) => {
                    guard.defuse();
                    if let Err(e) = self.nonces.mark_confirmed(nonce) {
                        warn!("confirm of nonce {nonce} failed: {e}");
                    }
                    debug!(
                        "{outcome_leg} leg confirmed: tx={} nonce={nonce} attempt={attempt}",
                        receipt.tx_hash
                    );
                    return Ok((
                        LegResult {
                            tx_hash: receipt.tx_hash,
                            nonce,
                            attempts: attempt,
                        },
                        receipt,
                    ));
                }
                Err((kind, gas_cost)) => {
                    if self.retry.should_retry(kind, attempt) {
                        // Nonce-too-low means the chain consumed this
                        // nonce elsewhere; release and take a fresh one.
                        if kind == ErrorKind::NonceTooLow {
                            guard.defuse();
                            let _ = self.nonces.mark_failed(nonce);
                            match self.nonces.allocate() {
                                Ok(n) => {
                                    nonce = n;
                                    guard =
                                        NonceGuard::new(Arc::clone(&self.nonces), nonce);
                                }
                                Err(e) => {
                                    warn!("nonce reallocation failed: {e}");
                                    return Err(LegFailure {
                                        kind,
                                        attempts: attempt,
                                        gas_cost,
                                    });
                                }
                            }
                        }
                        let delay = self.retry.delay_for(attempt);
                        debug!(
                            "{outcome_leg} leg attempt {attempt} failed ({kind}), \
                             retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    guard.defuse();
                    let _ = self.nonces.mark_failed(nonce);
                    return Err(LegFailure {
                        kind,
                        attempts: attempt,
                        gas_cost,
                    });
                }
            }
        }
    }

    /// One sign/submit/receipt round for a leg.
    async fn attempt_leg(
        &self,
        signal: &Signal,
        token: &TokenId,
        price: Decimal,
        size: Decimal,
        nonce: u64,
    ) -> Result<TxReceipt, (ErrorKind, Option<Decimal>)> {
        let gas = self
            .chain
            .get_gas_estimate()
            .await
            .map_err(|e| (e.kind(), None))?;

        let order = self.build_order(token, price, size);
        let signed = self
            .chain
            .sign_order(&order)
            .await
            .map_err(|e| (e.kind(), None))?;

        let tx_hash = self
            .chain
            .submit_order(&signed, nonce)
            .await
            .map_err(|e| (e.kind(), None))?;

        self.telemetry.emit(
            EventType::OrderSubmitted,
            signal.trace_id,
            json!({
                "token_id": token.as_str(),
                "nonce": nonce,
                "tx_hash": tx_hash.to_string(),
                "price": price.to_string(),
                "size": size.to_string(),
                "mode": "live",
            }),
        );

        let receipt = self
            .chain
            .wait_for_receipt(tx_hash, self.receipt_timeout)
            .await
            .map_err(|e| (e.kind(), None))?;

        if !receipt.success {
            // Reverts still burn gas; report the measured cost so the
            // breaker's gas rule can see it.
            let cost = self.gas_cost_usdc(&gas, receipt.gas_used);
            return Err((ErrorKind::Reverted, Some(cost)));
        }
        Ok(receipt)
    }

    fn leg_fill(&self, signal: &Signal, outcome_leg: Outcome, leg: &LegResult) -> Fill {
        let opp = &signal.opportunity;
        let (token, price) = match outcome_leg {
            Outcome::Yes => (&opp.pair.yes_token_id, opp.yes_vwap),
            Outcome::No => (&opp.pair.no_token_id, opp.no_vwap),
        };
        let fill = Fill {
            token_id: token.clone(),
            side: Side::Buy,
            quantity: opp.qty,
            price_vwap: price,
            fees_paid: price * opp.qty * self.fee_rate,
            slippage_bps: 0,
            tx_hash: Some(leg.tx_hash),
            is_simulated: false,
            timestamp: Utc::now(),
            trace_id: signal.trace_id,
        };
        self.telemetry.emit(
            EventType::FillObserved,
            signal.trace_id,
            json!({
                "token_id": fill.token_id.as_str(),
                "side": fill.side.to_string(),
                "price": fill.price_vwap.to_string(),
                "quantity": fill.quantity.to_string(),
                "fees": fill.fees_paid.to_string(),
                "tx_hash": leg.tx_hash.to_string(),
                "is_simulated": false,
            }),
        );
        fill
    }

    fn cached_result(&self, signal: Signal, cached: Option<CachedOutcome>) -> ExecutionOutcome {
        self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
        let tx = match cached {
            Some(outcome) => TxResult {
                signal,
                status: outcome.status,
                yes_leg: None,
                no_leg: None,
                error_kind: outcome.error_kind,
            },
            None => TxResult {
                signal,
                status: TxStatus::Failed,
                yes_leg: None,
                no_leg: None,
                error_kind: Some(ErrorKind::DuplicateSuppressed),
            },
        };
        ExecutionOutcome {
            yes_fill: None,
            no_fill: None,
            tx,
        }
    }
}

#[async_trait]
impl ArbExecutor for LiveExecutor {
    async fn execute_arbitrage(&self, signal: Signal) -> ExecutionOutcome {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let mut phase = ExecPhase::New;
        debug!("phase {phase:?}: trace={}", signal.trace_id);

        // 1. Idempotency gate.
        match self.idempotency.begin(&signal.idempotency_key) {
            Admission::Started => {}
            Admission::Suppressed(cached) => {
                info!(
                    "duplicate submission suppressed: key={}",
                    signal.idempotency_key
                );
                return self.cached_result(signal, cached);
            }
        }
        let idem_guard =
            IdempotencyGuard::new(Arc::clone(&self.idempotency), signal.idempotency_key.clone());

        // 2. Circuit-breaker scope.
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                warn!(
                    "signal rejected, circuit open (retry in {:?}): trace={}",
                    open.retry_after, signal.trace_id
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                idem_guard.defuse();
                let _ = self.idempotency.finalize(
                    &signal.idempotency_key,
                    CachedOutcome {
                        status: TxStatus::Failed,
                        yes_tx: None,
                        no_tx: None,
                        error_kind: Some(ErrorKind::CircuitOpen),
                    },
                );
                self.telemetry.emit(
                    EventType::CircuitTransition,
                    signal.trace_id,
                    json!({
                        "rejected": true,
                        "retry_after_ms": open.retry_after.as_millis() as u64,
                    }),
                );
                return ExecutionOutcome {
                    yes_fill: None,
                    no_fill: None,
                    tx: TxResult {
                        signal,
                        status: TxStatus::Failed,
                        yes_leg: None,
                        no_leg: None,
                        error_kind: Some(ErrorKind::CircuitOpen),
                    },
                };
            }
        };

        // 3-5. Leg 1.
        phase = ExecPhase::NonceAllocated;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        phase = ExecPhase::Leg1Submitted;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        let yes = match self.submit_leg(&signal, Outcome::Yes).await {
            Ok((leg, _receipt)) => leg,
            Err(failure) => {
                phase = ExecPhase::FailedTerminal;
                debug!("phase {phase:?}: trace={}", signal.trace_id);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                permit.record_failure(failure.gas_cost);
                idem_guard.defuse();
                let _ = self.idempotency.finalize(
                    &signal.idempotency_key,
                    CachedOutcome {
                        status: TxStatus::Failed,
                        yes_tx: None,
                        no_tx: None,
                        error_kind: Some(failure.kind),
                    },
                );
                return ExecutionOutcome {
                    yes_fill: None,
                    no_fill: None,
                    tx: TxResult {
                        signal,
                        status: TxStatus::Failed,
                        yes_leg: None,
                        no_leg: None,
                        error_kind: Some(failure.kind),
                    },
                };
            }
        };
        phase = ExecPhase::Leg1Confirmed;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        let yes_fill = self.leg_fill(&signal, Outcome::Yes, &yes);

        // 6. Leg 2 with a fresh nonce.
        phase = ExecPhase::Nonce2Allocated;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        phase = ExecPhase::Leg2Submitted;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        let no = match self.submit_leg(&signal, Outcome::No).await {
            Ok((leg, _receipt)) => leg,
            Err(failure) => {
                // 7. Partial: leg 1 confirmed, leg 2 terminally failed.
                phase = ExecPhase::Partial;
                warn!(
                    "phase {phase:?}: yes leg confirmed, no leg failed ({}) \
                     market={} trace={}",
                    failure.kind,
                    signal.market_id(),
                    signal.trace_id
                );
                self.stats.partial.fetch_add(1, Ordering::Relaxed);
                permit.record_failure(failure.gas_cost);
                idem_guard.defuse();
                let _ = self.idempotency.finalize(
                    &signal.idempotency_key,
                    CachedOutcome {
                        status: TxStatus::Partial,
                        yes_tx: Some(yes.tx_hash),
                        no_tx: None,
                        error_kind: Some(failure.kind),
                    },
                );
                return ExecutionOutcome {
                    yes_fill: Some(yes_fill),
                    no_fill: None,
                    tx: TxResult {
                        signal,
                        status: TxStatus::Partial,
                        yes_leg: Some(yes),
                        no_leg: None,
                        error_kind: Some(failure.kind),
                    },
                };
            }
        };
        phase = ExecPhase::Leg2Confirmed;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        let no_fill = self.leg_fill(&signal, Outcome::No, &no);

        phase = ExecPhase::Done;
        debug!("phase {phase:?}: trace={}", signal.trace_id);
        self.stats.success.fetch_add(1, Ordering::Relaxed);
        permit.record_success();
        idem_guard.defuse();
        let _ = self.idempotency.finalize(
            &signal.idempotency_key,
            CachedOutcome {
                status: TxStatus::Success,
                yes_tx: Some(yes.tx_hash),
                no_tx: Some(no.tx_hash),
                error_kind: None,
            },
        );

        info!(
            "live arbitrage complete: market={} qty={} yes_tx={} no_tx={}",
            signal.market_id(),
            signal.opportunity.qty,
            yes.tx_hash,
            no.tx_hash
        );

        ExecutionOutcome {
            yes_fill: Some(yes_fill),
            no_fill: Some(no_fill),
            tx: TxResult {
                signal,
                status: TxStatus::Success,
                yes_leg: Some(yes),
                no_leg: Some(no),
                error_kind: None,
            },
        }
    }
}
