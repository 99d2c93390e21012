//! Trace-scoped telemetry: structured events, a fire-and-forget bus,
//! latency buckets, and the append-only event log.
//!
//! Every opportunity, signal, and fill carries the trace id generated at
//! detection; the bus attributes each recorded event to that trace so
//! per-stage latency can be reconstructed offline.

pub mod bus;
pub mod events;
pub mod latency;
pub mod recorder;

pub use bus::{TelemetryBus, TelemetryStats};
pub use events::{EventType, TelemetryEvent};
pub use latency::{LatencyStage, LatencyTracker};
pub use recorder::{run_recorder, EventRecorder};
