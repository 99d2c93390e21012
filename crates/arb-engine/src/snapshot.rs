//! Optional crash-recovery snapshot.
//!
//! Persists {next_nonce, idempotency entries, circuit state, cumulative
//! PnL} as JSON. On restart the snapshot is advisory only: the chain's
//! pending-nonce view is the source of truth for the nonce, and
//! in-flight idempotency entries restore as failed.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::exec::breaker::CircuitState;
use crate::exec::idempotency::{IdempotencyEntry, IdempotencyRegistry};
use crate::exec::nonce::NonceManager;
use crate::risk::pnl::PnlTracker;
use crate::types::IdempotencyKey;

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialized recovery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub next_nonce: Option<u64>,
    pub idempotency: Vec<(IdempotencyKey, IdempotencyEntry)>,
    pub circuit_state: CircuitState,
    pub cumulative_expected_edge: Decimal,
    pub cumulative_simulated_pnl: Decimal,
    pub cumulative_realized_pnl: Decimal,
    pub cumulative_settled_pnl: Decimal,
}

impl RecoverySnapshot {
    /// Capture current state.
    pub fn capture(
        nonces: &NonceManager,
        idempotency: &IdempotencyRegistry,
        circuit_state: CircuitState,
        pnl: &PnlTracker,
    ) -> Self {
        let summary = pnl.summary();
        Self {
            next_nonce: nonces.next_nonce(),
            idempotency: idempotency.export(),
            circuit_state,
            cumulative_expected_edge: summary.cumulative_expected_edge,
            cumulative_simulated_pnl: summary.cumulative_simulated_pnl,
            cumulative_realized_pnl: summary.cumulative_realized_pnl,
            cumulative_settled_pnl: summary.cumulative_settled_pnl,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Apply to live components. `chain_nonce`, when available, wins
    /// over the snapshot's nonce.
    pub fn restore(
        self,
        nonces: &NonceManager,
        idempotency: &IdempotencyRegistry,
        pnl: &PnlTracker,
        chain_nonce: Option<u64>,
    ) {
        match (chain_nonce, self.next_nonce) {
            (Some(chain), saved) => {
                if saved.is_some_and(|s| s != chain) {
                    info!(
                        "snapshot nonce {saved:?} superseded by chain nonce {chain}"
                    );
                }
                nonces.initialize_at(chain);
            }
            (None, Some(saved)) => nonces.initialize_at(saved),
            (None, None) => {}
        }
        idempotency.restore(self.idempotency);
        pnl.restore_cumulative(
            self.cumulative_expected_edge,
            self.cumulative_simulated_pnl,
            self.cumulative_realized_pnl,
            self.cumulative_settled_pnl,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("recovery.json");

        let nonces = NonceManager::new();
        nonces.initialize_at(42);
        nonces.allocate().unwrap();

        let registry = IdempotencyRegistry::new(Duration::from_secs(300));
        registry.begin(&IdempotencyKey::from_hex("k1".into()));

        let pnl = PnlTracker::new();
        pnl.record_expected_edge(dec!(1.5));

        let snap =
            RecoverySnapshot::capture(&nonces, &registry, CircuitState::Closed, &pnl);
        snap.save(&path).unwrap();

        let loaded = RecoverySnapshot::load(&path).unwrap();
        assert_eq!(loaded.next_nonce, Some(43));
        assert_eq!(loaded.idempotency.len(), 1);
        assert_eq!(loaded.cumulative_expected_edge, dec!(1.5));
        assert_eq!(loaded.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn test_chain_nonce_wins_on_restore() {
        let nonces = NonceManager::new();
        let registry = IdempotencyRegistry::new(Duration::from_secs(300));
        let pnl = PnlTracker::new();

        let snap = RecoverySnapshot {
            next_nonce: Some(10),
            idempotency: Vec::new(),
            circuit_state: CircuitState::Closed,
            cumulative_expected_edge: dec!(1),
            cumulative_simulated_pnl: dec!(2),
            cumulative_realized_pnl: dec!(3),
            cumulative_settled_pnl: dec!(0),
        };
        snap.restore(&nonces, &registry, &pnl, Some(25));

        assert_eq!(nonces.next_nonce(), Some(25));
        let summary = pnl.summary();
        assert_eq!(summary.cumulative_realized_pnl, dec!(3));
    }

    #[test]
    fn test_snapshot_nonce_used_without_chain() {
        let nonces = NonceManager::new();
        let registry = IdempotencyRegistry::new(Duration::from_secs(300));
        let pnl = PnlTracker::new();

        let snap = RecoverySnapshot {
            next_nonce: Some(10),
            idempotency: Vec::new(),
            circuit_state: CircuitState::Open,
            cumulative_expected_edge: Decimal::ZERO,
            cumulative_simulated_pnl: Decimal::ZERO,
            cumulative_realized_pnl: Decimal::ZERO,
            cumulative_settled_pnl: Decimal::ZERO,
        };
        snap.restore(&nonces, &registry, &pnl, None);
        assert_eq!(nonces.next_nonce(), Some(10));
    }
}
