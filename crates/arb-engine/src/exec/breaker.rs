//! Circuit breaker guarding the live execution path.
//!
//! Three states:
//! - CLOSED: calls admitted normally
//! - OPEN: all submissions rejected until the open timeout elapses
//! - HALF_OPEN: up to `half_open_max` probe calls admitted; all must
//!   succeed to close, any failure reopens with a refreshed timeout
//!
//! Admission hands out an [`ExecutionPermit`]; the outcome of every
//! admitted call must be reported through the permit exactly once. A
//! permit dropped without a report releases its half-open slot without
//! counting as success or failure (cancellation path).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping.
    pub consec_threshold: u32,
    /// Failure-rate trip threshold over the call window, in [0, 1].
    pub rate_threshold: f64,
    /// Call-count window for the rate computation.
    pub window: usize,
    /// How long to stay OPEN before probing.
    pub open_timeout: Duration,
    /// Probe budget in HALF_OPEN.
    pub half_open_max: u32,
    /// A failed call whose measured gas cost exceeds this trips
    /// immediately (USDC).
    pub gas_cost_threshold: Decimal,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            consec_threshold: 3,
            rate_threshold: 0.5,
            window: 20,
            open_timeout: Duration::from_secs(60),
            half_open_max: 3,
            gas_cost_threshold: Decimal::TWO,
        }
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpenError {
    /// How long until the breaker will probe again.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Ring of recent call outcomes (true = success).
    history: Vec<bool>,
    history_pos: usize,
    history_len: usize,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
    total_trips: u64,
}

impl Inner {
    fn new(window: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            history: vec![false; window.max(1)],
            history_pos: 0,
            history_len: 0,
            opened_at: None,
            half_open_inflight: 0,
            half_open_successes: 0,
            total_trips: 0,
        }
    }

    fn push_outcome(&mut self, success: bool) {
        let cap = self.history.len();
        self.history[self.history_pos] = success;
        self.history_pos = (self.history_pos + 1) % cap;
        self.history_len = (self.history_len + 1).min(cap);
    }

    /// Failure rate over the window; None until the window is full.
    fn failure_rate(&self) -> Option<f64> {
        if self.history_len < self.history.len() {
            return None;
        }
        let failures = self.history.iter().filter(|s| !**s).count();
        Some(failures as f64 / self.history.len() as f64)
    }
}

/// Circuit breaker. All transitions happen under one mutex.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let inner = Mutex::new(Inner::new(config.window));
        Self { config, inner }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying the OPEN -> HALF_OPEN timeout transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_probe(&mut inner);
        inner.state
    }

    pub fn total_trips(&self) -> u64 {
        self.inner.lock().total_trips
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Admit a call, or refuse with the time until the next probe.
    pub fn try_acquire(self: &Arc<Self>) -> Result<ExecutionPermit, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.maybe_probe(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(ExecutionPermit {
                breaker: Arc::clone(self),
                probe: false,
                reported: false,
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_inflight + inner.half_open_successes
                    >= self.config.half_open_max
                {
                    // Probe budget exhausted; treat as still open.
                    return Err(CircuitOpenError {
                        retry_after: self.config.open_timeout,
                    });
                }
                inner.half_open_inflight += 1;
                Ok(ExecutionPermit {
                    breaker: Arc::clone(self),
                    probe: true,
                    reported: false,
                })
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                Err(CircuitOpenError {
                    retry_after: self.config.open_timeout.saturating_sub(elapsed),
                })
            }
        }
    }

    /// Force OPEN (anomaly guard escalation, operator command).
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        self.open(&mut inner, "forced trip");
    }

    /// Reset to CLOSED, clearing counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let window = self.config.window;
        *inner = Inner::new(window);
        info!("circuit breaker reset to CLOSED");
    }

    fn maybe_probe(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.open_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_inflight = 0;
                inner.half_open_successes = 0;
                info!("circuit breaker OPEN -> HALF_OPEN (timeout elapsed)");
            }
        }
    }

    fn open(&self, inner: &mut Inner, reason: &str) {
        if inner.state != CircuitState::Open {
            inner.total_trips += 1;
            warn!("circuit breaker -> OPEN ({reason})");
        }
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_inflight = 0;
        inner.half_open_successes = 0;
    }

    fn report_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.push_outcome(true);

        if probe && inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_max {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.history_len = 0;
                inner.history_pos = 0;
                info!("circuit breaker HALF_OPEN -> CLOSED (probes succeeded)");
            }
        }
    }

    fn report_failure(&self, probe: bool, gas_cost: Option<Decimal>) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.push_outcome(false);

        if probe && inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
            self.open(&mut inner, "probe failed");
            return;
        }

        if inner.consecutive_failures >= self.config.consec_threshold {
            self.open(&mut inner, "consecutive failures");
            return;
        }
        if let Some(rate) = inner.failure_rate() {
            if rate >= self.config.rate_threshold {
                self.open(&mut inner, "failure rate");
                return;
            }
        }
        if let Some(gas) = gas_cost {
            if gas > self.config.gas_cost_threshold {
                self.open(&mut inner, "gas cost on failed call");
            }
        }
    }

    fn release_unreported(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }
}

/// Admission token for one guarded call. Consume with
/// [`ExecutionPermit::record_success`] or
/// [`ExecutionPermit::record_failure`].
pub struct ExecutionPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    reported: bool,
}

impl std::fmt::Debug for ExecutionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPermit")
            .field("probe", &self.probe)
            .field("reported", &self.reported)
            .finish()
    }
}

impl ExecutionPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.report_success(self.probe);
    }

    /// `gas_cost` is the measured USDC gas cost of the failed call, when
    /// known; it feeds the gas-threshold trip rule.
    pub fn record_failure(mut self, gas_cost: Option<Decimal>) {
        self.reported = true;
        self.breaker.report_failure(self.probe, gas_cost);
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        if !self.reported {
            // Cancelled before an outcome existed: free the probe slot
            // without biasing the counters.
            self.breaker.release_unreported(self.probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: BreakerConfig) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(config))
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            open_timeout: Duration::from_millis(20),
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn test_closed_admits() {
        let b = breaker(BreakerConfig::default());
        let permit = b.try_acquire().unwrap();
        assert!(!permit.is_probe());
        permit.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trips_on_consecutive_failures() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..3 {
            b.try_acquire().unwrap().record_failure(None);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.total_trips(), 1);

        let err = b.try_acquire().unwrap_err();
        assert!(err.retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let b = breaker(BreakerConfig::default());
        b.try_acquire().unwrap().record_failure(None);
        b.try_acquire().unwrap().record_failure(None);
        b.try_acquire().unwrap().record_success();
        b.try_acquire().unwrap().record_failure(None);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_trips_on_failure_rate() {
        let config = BreakerConfig {
            consec_threshold: 100, // keep the consecutive rule out of the way
            window: 4,
            rate_threshold: 0.5,
            ..BreakerConfig::default()
        };
        let b = breaker(config);
        // Alternate to avoid consecutive trips: S F S F -> rate 0.5.
        b.try_acquire().unwrap().record_success();
        b.try_acquire().unwrap().record_failure(None);
        b.try_acquire().unwrap().record_success();
        b.try_acquire().unwrap().record_failure(None);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_rate_needs_full_window() {
        let config = BreakerConfig {
            consec_threshold: 100,
            window: 20,
            ..BreakerConfig::default()
        };
        let b = breaker(config);
        // One failure of one call is a 100% rate but the window is not
        // full, so no trip.
        b.try_acquire().unwrap().record_failure(None);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_gas_cost_trip_on_failed_call() {
        let b = breaker(BreakerConfig::default());
        b.try_acquire()
            .unwrap()
            .record_failure(Some(Decimal::new(5, 0)));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_timeout_admits_probe() {
        // After open_timeout with no further failures, at least one
        // probe is admitted.
        let b = breaker(fast_config());
        b.trip();
        assert!(b.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(30));
        let permit = b.try_acquire().unwrap();
        assert!(permit.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        permit.record_success();
    }

    #[test]
    fn test_half_open_all_probes_succeed_closes() {
        let b = breaker(fast_config());
        b.trip();
        std::thread::sleep(Duration::from_millis(30));

        for _ in 0..3 {
            let permit = b.try_acquire().unwrap();
            permit.record_success();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(fast_config());
        b.trip();
        std::thread::sleep(Duration::from_millis(30));

        let permit = b.try_acquire().unwrap();
        permit.record_failure(None);
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.total_trips(), 2);
        // Timeout refreshed: still open right away.
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_probe_cap() {
        let b = breaker(fast_config());
        b.trip();
        std::thread::sleep(Duration::from_millis(30));

        let p1 = b.try_acquire().unwrap();
        let p2 = b.try_acquire().unwrap();
        let p3 = b.try_acquire().unwrap();
        // Cap of 3 concurrent probes: the fourth is refused.
        assert!(b.try_acquire().is_err());

        p1.record_success();
        p2.record_success();
        // Still half-open with one probe outstanding; budget is spent.
        assert!(b.try_acquire().is_err());
        p3.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_permit_frees_probe_slot() {
        let b = breaker(fast_config());
        b.trip();
        std::thread::sleep(Duration::from_millis(30));

        {
            let _p = b.try_acquire().unwrap();
            // Dropped without report (cancellation).
        }
        // Slot released: three probes still available.
        let p1 = b.try_acquire().unwrap();
        let p2 = b.try_acquire().unwrap();
        let p3 = b.try_acquire().unwrap();
        p1.record_success();
        p2.record_success();
        p3.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let b = breaker(BreakerConfig::default());
        b.trip();
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire().is_ok());
    }
}
