//! Fire-and-forget telemetry bus.
//!
//! Hot-path emission is a single atomic check plus a `try_send` on a
//! bounded channel; a full channel drops the event and bumps a counter.
//! Telemetry must never add latency or backpressure to trading.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::TraceId;

use super::events::{EventType, TelemetryEvent};

/// Default bounded channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Emission counters.
#[derive(Debug, Default)]
pub struct TelemetryStats {
    pub emitted: AtomicU64,
    pub dropped: AtomicU64,
}

impl TelemetryStats {
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable sender half of the telemetry pipeline.
#[derive(Debug, Clone)]
pub struct TelemetryBus {
    tx: mpsc::Sender<TelemetryEvent>,
    enabled: Arc<AtomicBool>,
    stats: Arc<TelemetryStats>,
}

impl TelemetryBus {
    /// Create a bus and its drain receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(16));
        let bus = Self {
            tx,
            enabled: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(TelemetryStats::default()),
        };
        (bus, rx)
    }

    /// A bus that drops everything. Useful for tests and tools.
    pub fn disabled() -> Self {
        let (bus, _rx) = Self::new(16);
        bus.enabled.store(false, Ordering::Release);
        bus
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn stats(&self) -> Arc<TelemetryStats> {
        Arc::clone(&self.stats)
    }

    /// Emit an event without blocking. Drops on a full channel.
    #[inline]
    pub fn emit(&self, event_type: EventType, trace_id: TraceId, data: Value) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let event = TelemetryEvent::new(event_type, trace_id, data);
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
