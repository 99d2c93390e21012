//! Risk gating, anomaly defense, and PnL accounting.

pub mod anomaly;
pub mod manager;
pub mod pnl;

pub use anomaly::{AnomalyConfig, AnomalyGuard, AnomalyKind};
pub use manager::{RiskConfig, RiskContext, RiskManager, RiskRejection};
pub use pnl::{PnlSummary, PnlTracker};
