//! Anomaly guard: anti-manipulation defense for the risk manager.
//!
//! Keeps short per-pair windows of price and depth observations and
//! flags three conditions:
//! - price pulse: a mid move beyond `pulse_threshold` inside the window
//! - depth depletion: ask depth collapsing by more than `depth_threshold`
//! - pair divergence: |1 - (yes_mid + no_mid)| beyond
//!   `correlation_threshold`
//!
//! Flags carry a severity in [0, 1]. Severity >= 0.7 force-trips the
//! circuit breaker; severity >= 0.4 degrades admitted trade size.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exec::breaker::CircuitBreaker;

/// Severity at which admitted size is reduced.
pub const DEGRADE_SEVERITY: f64 = 0.4;
/// Severity at which the breaker is tripped.
pub const HALT_SEVERITY: f64 = 0.7;

/// Anomaly categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    PricePulse,
    DepthDrop,
    PairDivergence,
}

/// One raised flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyFlag {
    pub kind: AnomalyKind,
    pub severity: f64,
    pub at: DateTime<Utc>,
}

/// Guard configuration.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub enabled: bool,
    /// Fractional mid move that counts as a pulse (e.g. 0.08 = 8%).
    pub pulse_threshold: Decimal,
    /// Fractional depth collapse that counts as depletion.
    pub depth_threshold: Decimal,
    /// Allowed |1 - (yes + no)| divergence.
    pub correlation_threshold: Decimal,
    /// Observation window.
    pub window: Duration,
    /// How long a flag keeps suppressing new signals.
    pub flag_window: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pulse_threshold: Decimal::new(8, 2),        // 8%
            depth_threshold: Decimal::new(6, 1),        // 60%
            correlation_threshold: Decimal::new(15, 2), // 0.15
            window: Duration::from_secs(30),
            flag_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct PairWindow {
    mids: VecDeque<(Decimal, DateTime<Utc>)>,
    depths: VecDeque<(Decimal, DateTime<Utc>)>,
    last_flag: Option<AnomalyFlag>,
}

/// Per-pair anomaly state. Shared with the risk manager.
pub struct AnomalyGuard {
    config: AnomalyConfig,
    pairs: Mutex<HashMap<String, PairWindow>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl AnomalyGuard {
    pub fn new(config: AnomalyConfig, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        Self {
            config,
            pairs: Mutex::new(HashMap::new()),
            breaker,
        }
    }

    /// Feed one observation of a pair: leg mids and combined ask depth.
    /// Returns the flag raised by this observation, if any.
    pub fn observe(
        &self,
        market_id: &str,
        yes_mid: Decimal,
        no_mid: Decimal,
        ask_depth: Decimal,
    ) -> Option<AnomalyFlag> {
        if !self.config.enabled {
            return None;
        }
        let now = Utc::now();
        let horizon = now
            - chrono::Duration::from_std(self.config.window).unwrap_or(chrono::Duration::zero());

        let mut pairs = self.pairs.lock();
        let state = pairs.entry(market_id.to_string()).or_default();

        while state.mids.front().is_some_and(|(_, t)| *t < horizon) {
            state.mids.pop_front();
        }
        while state.depths.front().is_some_and(|(_, t)| *t < horizon) {
            state.depths.pop_front();
        }

        let flag = self
            .check_divergence(yes_mid, no_mid, now)
            .or_else(|| self.check_pulse(state, yes_mid, now))
            .or_else(|| self.check_depth(state, ask_depth, now));

        state.mids.push_back((yes_mid, now));
        state.depths.push_back((ask_depth, now));

        if let Some(flag) = flag {
            warn!(
                "anomaly on {market_id}: {:?} severity={:.2}",
                flag.kind, flag.severity
            );
            state.last_flag = Some(flag);
            if flag.severity >= HALT_SEVERITY {
                if let Some(breaker) = &self.breaker {
                    breaker.trip();
                }
            }
        }
        flag
    }

    /// The flag currently suppressing a pair, if inside the flag window.
    pub fn active_flag(&self, market_id: &str) -> Option<AnomalyFlag> {
        let pairs = self.pairs.lock();
        let flag = pairs.get(market_id)?.last_flag?;
        let horizon = Utc::now()
            - chrono::Duration::from_std(self.config.flag_window)
                .unwrap_or(chrono::Duration::zero());
        (flag.at >= horizon).then_some(flag)
    }

    /// Size multiplier for new signals on a pair: 0.5 while degraded,
    /// 1 otherwise.
    pub fn size_multiplier(&self, market_id: &str) -> Decimal {
        match self.active_flag(market_id) {
            Some(flag) if flag.severity >= DEGRADE_SEVERITY => Decimal::new(5, 1),
            _ => Decimal::ONE,
        }
    }

    /// Clear a pair's flag (operator intervention).
    pub fn clear(&self, market_id: &str) {
        if let Some(state) = self.pairs.lock().get_mut(market_id) {
            state.last_flag = None;
        }
    }

    fn check_divergence(
        &self,
        yes_mid: Decimal,
        no_mid: Decimal,
        now: DateTime<Utc>,
    ) -> Option<AnomalyFlag> {
        let divergence = (Decimal::ONE - (yes_mid + no_mid)).abs();
        if divergence <= self.config.correlation_threshold {
            return None;
        }
        Some(AnomalyFlag {
            kind: AnomalyKind::PairDivergence,
            severity: severity_ratio(divergence, self.config.correlation_threshold),
            at: now,
        })
    }

    fn check_pulse(
        &self,
        state: &PairWindow,
        current: Decimal,
        now: DateTime<Utc>,
    ) -> Option<AnomalyFlag> {
        if state.mids.len() < 3 {
            return None;
        }
        let sum: Decimal = state.mids.iter().map(|(p, _)| *p).sum();
        let avg = sum / Decimal::from(state.mids.len());
        if avg.is_zero() {
            return None;
        }
        let change = ((current - avg) / avg).abs();
        if change <= self.config.pulse_threshold {
            return None;
        }
        Some(AnomalyFlag {
            kind: AnomalyKind::PricePulse,
            severity: severity_ratio(change, self.config.pulse_threshold),
            at: now,
        })
    }

    fn check_depth(
        &self,
        state: &PairWindow,
        current: Decimal,
        now: DateTime<Utc>,
    ) -> Option<AnomalyFlag> {
        let peak = state.depths.iter().map(|(d, _)| *d).max()?;
        if peak.is_zero() || state.depths.len() < 3 {
            return None;
        }
        let drop = (peak - current) / peak;
        if drop <= self.config.depth_threshold {
            return None;
        }
        Some(AnomalyFlag {
            kind: AnomalyKind::DepthDrop,
            severity: severity_ratio(drop, self.config.depth_threshold),
            at: now,
        })
    }
}

/// Severity scaling: crossing the threshold maps to 0.5, twice the
/// threshold (or more) maps to 1.0.
fn severity_ratio(value: Decimal, threshold: Decimal) -> f64 {
    let ratio = (value / (threshold * Decimal::TWO)).to_f64().unwrap_or(1.0);
    ratio.clamp(0.0, 1.0)
}
