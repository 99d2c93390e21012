//! Monotonic nonce allocation with safe reuse on failure.
//!
//! `next_nonce` is initialized from the chain's pending-nonce view and
//! totally orders live submissions per wallet. Allocation, confirmation,
//! and failure handling are serialized under a single mutex: no nonce is
//! ever handed out twice unless its prior allocation was explicitly
//! released.

use std::collections::BTreeSet;

use alloy::primitives::Address;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use super::chain::{ChainClient, ChainError};

/// Errors from nonce management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NonceError {
    #[error("nonce manager not initialized")]
    Uninitialized,

    #[error("nonce {0} is not pending")]
    NotPending(u64),
}

#[derive(Debug, Default)]
struct NonceInner {
    next: Option<u64>,
    pending: BTreeSet<u64>,
    confirmed: BTreeSet<u64>,
    /// Released nonces below `next` that could not be safely reused.
    /// Reclaimed by the next re-initialization from chain state.
    gaps: BTreeSet<u64>,
}

/// Wallet-scoped nonce state.
#[derive(Debug, Default)]
pub struct NonceManager {
    inner: Mutex<NonceInner>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `next_nonce` from the chain's pending-nonce view. The chain
    /// is the source of truth: any recorded gaps are discarded.
    pub async fn initialize(
        &self,
        chain: &dyn ChainClient,
        wallet: Address,
    ) -> Result<u64, ChainError> {
        let on_chain = chain.get_pending_nonce(wallet).await?;
        let mut inner = self.inner.lock();
        inner.next = Some(on_chain);
        inner.pending.clear();
        inner.gaps.clear();
        info!("nonce manager initialized: next_nonce={on_chain}");
        Ok(on_chain)
    }

    /// Seed directly (snapshot restore in tests and tools).
    pub fn initialize_at(&self, nonce: u64) {
        let mut inner = self.inner.lock();
        inner.next = Some(nonce);
        inner.pending.clear();
        inner.gaps.clear();
    }

    /// Allocate the next nonce and record it as pending.
    pub fn allocate(&self) -> Result<u64, NonceError> {
        let mut inner = self.inner.lock();
        let next = inner.next.ok_or(NonceError::Uninitialized)?;
        inner.next = Some(next + 1);
        inner.pending.insert(next);
        debug!("allocated nonce {next}");
        Ok(next)
    }

    /// Move a pending nonce to the confirmed set.
    pub fn mark_confirmed(&self, nonce: u64) -> Result<(), NonceError> {
        let mut inner = self.inner.lock();
        if !inner.pending.remove(&nonce) {
            return Err(NonceError::NotPending(nonce));
        }
        inner.confirmed.insert(nonce);
        debug!("nonce {nonce} confirmed");
        Ok(())
    }

    /// Release a pending nonce after a failed submission.
    ///
    /// If the nonce is the highest allocated (`next_nonce - 1`) it is
    /// safely reused by decrementing `next_nonce`; otherwise it becomes
    /// a gap reclaimed on the next re-initialization.
    pub fn mark_failed(&self, nonce: u64) -> Result<(), NonceError> {
        let mut inner = self.inner.lock();
        if !inner.pending.remove(&nonce) {
            return Err(NonceError::NotPending(nonce));
        }
        match inner.next {
            Some(next) if nonce + 1 == next => {
                inner.next = Some(nonce);
                debug!("nonce {nonce} released for reuse");
            }
            _ => {
                inner.gaps.insert(nonce);
                debug!("nonce {nonce} recorded as gap");
            }
        }
        Ok(())
    }

    pub fn is_pending(&self, nonce: u64) -> bool {
        self.inner.lock().pending.contains(&nonce)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.inner.lock().confirmed.len()
    }

    pub fn gap_count(&self) -> usize {
        self.inner.lock().gaps.len()
    }

    /// Current `next_nonce`, if initialized.
    pub fn next_nonce(&self) -> Option<u64> {
        self.inner.lock().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_uninitialized_rejects_allocation() {
        let mgr = NonceManager::new();
        assert_eq!(mgr.allocate(), Err(NonceError::Uninitialized));
    }

    #[test]
    fn test_monotonic_allocation() {
        let mgr = NonceManager::new();
        mgr.initialize_at(7);
        assert_eq!(mgr.allocate().unwrap(), 7);
        assert_eq!(mgr.allocate().unwrap(), 8);
        assert_eq!(mgr.allocate().unwrap(), 9);
        assert_eq!(mgr.pending_count(), 3);
    }

    #[test]
    fn test_confirm_moves_to_confirmed() {
        let mgr = NonceManager::new();
        mgr.initialize_at(0);
        let n = mgr.allocate().unwrap();
        mgr.mark_confirmed(n).unwrap();
        assert_eq!(mgr.pending_count(), 0);
        assert_eq!(mgr.confirmed_count(), 1);
        assert!(!mgr.is_pending(n));
    }

    #[test]
    fn test_highest_failed_nonce_reused() {
        let mgr = NonceManager::new();
        mgr.initialize_at(10);
        let n = mgr.allocate().unwrap();
        assert_eq!(n, 10);
        mgr.mark_failed(n).unwrap();
        // Safe reuse: next allocation hands out the same value.
        assert_eq!(mgr.allocate().unwrap(), 10);
        assert_eq!(mgr.gap_count(), 0);
    }

    #[test]
    fn test_lower_failed_nonce_becomes_gap() {
        let mgr = NonceManager::new();
        mgr.initialize_at(0);
        let a = mgr.allocate().unwrap(); // 0
        let b = mgr.allocate().unwrap(); // 1
        mgr.mark_failed(a).unwrap();
        // 0 is not next-1 (next is 2), so it must not be reused live.
        assert_eq!(mgr.allocate().unwrap(), 2);
        assert_eq!(mgr.gap_count(), 1);
        mgr.mark_confirmed(b).unwrap();
    }

    #[test]
    fn test_reinitialize_reclaims_gaps() {
        let mgr = NonceManager::new();
        mgr.initialize_at(0);
        let a = mgr.allocate().unwrap();
        let _b = mgr.allocate().unwrap();
        mgr.mark_failed(a).unwrap();
        assert_eq!(mgr.gap_count(), 1);

        mgr.initialize_at(5);
        assert_eq!(mgr.gap_count(), 0);
        assert_eq!(mgr.allocate().unwrap(), 5);
    }

    #[test]
    fn test_double_release_rejected() {
        let mgr = NonceManager::new();
        mgr.initialize_at(0);
        let n = mgr.allocate().unwrap();
        mgr.mark_failed(n).unwrap();
        assert_eq!(mgr.mark_failed(n), Err(NonceError::NotPending(n)));
        assert_eq!(mgr.mark_confirmed(n), Err(NonceError::NotPending(n)));
    }

    #[test]
    fn test_no_duplicate_allocation_across_threads() {
        // Across any interleaving of allocate/confirm/fail, no two
        // live allocations share a nonce.
        let mgr = Arc::new(NonceManager::new());
        mgr.initialize_at(0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = Arc::clone(&mgr);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for i in 0..100 {
                    let n = mgr.allocate().unwrap();
                    if i % 3 == 0 {
                        // Fail some; reuse is only safe for the highest,
                        // so the manager may or may not hand it back.
                        mgr.mark_failed(n).unwrap();
                    } else {
                        mgr.mark_confirmed(n).unwrap();
                        seen.push(n);
                    }
                }
                seen
            }));
        }

        let mut confirmed = HashSet::new();
        for handle in handles {
            for n in handle.join().unwrap() {
                assert!(confirmed.insert(n), "nonce {n} confirmed twice");
            }
        }
    }
}
