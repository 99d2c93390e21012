//! Per-trace latency attribution.
//!
//! Each trace progresses through fixed pipeline marks; the tracker
//! computes stage durations from monotonic timestamps and folds them
//! into fixed histogram buckets.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Histogram bucket upper bounds in milliseconds; the last bucket is
/// open-ended.
pub const BUCKET_BOUNDS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

/// Number of buckets (bounds + overflow).
pub const BUCKET_COUNT: usize = BUCKET_BOUNDS_MS.len() + 1;

use crate::types::TraceId;

/// Pipeline stages measured per trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyStage {
    /// Wire receive -> book applied.
    WsToBook,
    /// Book applied -> opportunity emitted.
    BookToSignal,
    /// Opportunity emitted -> risk verdict.
    SignalToRisk,
    /// Risk verdict -> order submitted.
    RiskToSend,
    /// Wire receive -> terminal result.
    EndToEnd,
}

impl LatencyStage {
    pub const ALL: [LatencyStage; 5] = [
        LatencyStage::WsToBook,
        LatencyStage::BookToSignal,
        LatencyStage::SignalToRisk,
        LatencyStage::RiskToSend,
        LatencyStage::EndToEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyStage::WsToBook => "ws_to_book",
            LatencyStage::BookToSignal => "book_to_signal",
            LatencyStage::SignalToRisk => "signal_to_risk",
            LatencyStage::RiskToSend => "risk_to_send",
            LatencyStage::EndToEnd => "end_to_end",
        }
    }

    fn index(&self) -> usize {
        match self {
            LatencyStage::WsToBook => 0,
            LatencyStage::BookToSignal => 1,
            LatencyStage::SignalToRisk => 2,
            LatencyStage::RiskToSend => 3,
            LatencyStage::EndToEnd => 4,
        }
    }
}

/// Monotonic marks recorded for one trace.
#[derive(Debug, Clone, Copy, Default)]
struct TraceMarks {
    ws_received: Option<Instant>,
    book_applied: Option<Instant>,
    signal_emitted: Option<Instant>,
    risk_passed: Option<Instant>,
    order_sent: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    traces: HashMap<TraceId, TraceMarks>,
    /// [stage][bucket] observation counts.
    buckets: [[u64; BUCKET_COUNT]; 5],
}

/// Latency tracker shared across pipeline stages.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    inner: Mutex<Inner>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wire-receive and book-apply marks for a trace.
    pub fn mark_book(&self, trace: TraceId, ws_received: Instant, book_applied: Instant) {
        let mut inner = self.inner.lock();
        let marks = inner.traces.entry(trace).or_default();
        marks.ws_received = Some(ws_received);
        marks.book_applied = Some(book_applied);
        let (ws, applied) = (marks.ws_received, marks.book_applied);
        if let (Some(a), Some(b)) = (ws, applied) {
            Self::observe(&mut inner, LatencyStage::WsToBook, b.duration_since(a));
        }
    }

    pub fn mark_signal(&self, trace: TraceId, at: Instant) {
        let mut inner = self.inner.lock();
        let marks = inner.traces.entry(trace).or_default();
        marks.signal_emitted = Some(at);
        let from = marks.book_applied;
        if let Some(from) = from {
            Self::observe(&mut inner, LatencyStage::BookToSignal, at.duration_since(from));
        }
    }

    pub fn mark_risk_passed(&self, trace: TraceId, at: Instant) {
        let mut inner = self.inner.lock();
        let marks = inner.traces.entry(trace).or_default();
        marks.risk_passed = Some(at);
        let from = marks.signal_emitted;
        if let Some(from) = from {
            Self::observe(&mut inner, LatencyStage::SignalToRisk, at.duration_since(from));
        }
    }

    pub fn mark_order_sent(&self, trace: TraceId, at: Instant) {
        let mut inner = self.inner.lock();
        let marks = inner.traces.entry(trace).or_default();
        marks.order_sent = Some(at);
        let from = marks.risk_passed;
        if let Some(from) = from {
            Self::observe(&mut inner, LatencyStage::RiskToSend, at.duration_since(from));
        }
    }

    /// Record the terminal mark and release the trace's state.
    pub fn mark_terminal(&self, trace: TraceId, at: Instant) {
        let mut inner = self.inner.lock();
        if let Some(marks) = inner.traces.remove(&trace) {
            if let Some(ws) = marks.ws_received {
                Self::observe(&mut inner, LatencyStage::EndToEnd, at.duration_since(ws));
            }
        }
    }

    /// Snapshot of bucket counts per stage.
    pub fn snapshot(&self) -> HashMap<&'static str, [u64; BUCKET_COUNT]> {
        let inner = self.inner.lock();
        LatencyStage::ALL
            .iter()
            .map(|s| (s.as_str(), inner.buckets[s.index()]))
            .collect()
    }

    /// Number of traces still in flight.
    pub fn open_traces(&self) -> usize {
        self.inner.lock().traces.len()
    }

    fn observe(inner: &mut Inner, stage: LatencyStage, elapsed: std::time::Duration) {
        let ms = elapsed.as_millis() as u64;
        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_COUNT - 1);
        inner.buckets[stage.index()][bucket] += 1;
    }
}
