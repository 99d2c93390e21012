//! Structured telemetry events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TraceId;

/// Telemetry event types recorded by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EventReceived,
    OpportunityDetected,
    RiskPassed,
    RiskRejected,
    OrderSubmitted,
    FillObserved,
    PnlUpdate,
    CircuitTransition,
    SequenceGap,
    OpportunityCoalesced,
    FeedDisconnected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EventReceived => "event_received",
            EventType::OpportunityDetected => "opportunity_detected",
            EventType::RiskPassed => "risk_passed",
            EventType::RiskRejected => "risk_rejected",
            EventType::OrderSubmitted => "order_submitted",
            EventType::FillObserved => "fill_observed",
            EventType::PnlUpdate => "pnl_update",
            EventType::CircuitTransition => "circuit_transition",
            EventType::SequenceGap => "sequence_gap",
            EventType::OpportunityCoalesced => "opportunity_coalesced",
            EventType::FeedDisconnected => "feed_disconnected",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One structured event. Serialized as a single JSON line in the event
/// log: `{event_type, ts, trace_id, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: EventType,
    pub ts: DateTime<Utc>,
    pub trace_id: TraceId,
    pub data: Value,
}

impl TelemetryEvent {
    pub fn new(event_type: EventType, trace_id: TraceId, data: Value) -> Self {
        Self {
            event_type,
            ts: Utc::now(),
            trace_id,
            data,
        }
    }
}
