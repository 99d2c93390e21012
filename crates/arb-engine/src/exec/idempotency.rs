//! Idempotency registry: fingerprint -> result cache.
//!
//! Suppresses duplicate submissions inside the idempotency window. Keys
//! transition IN_FLIGHT -> DONE_* exactly once; a second finalization is
//! an invariant violation surfaced to the caller.

use std::collections::HashMap;

use alloy::primitives::B256;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{ErrorKind, IdempotencyKey, TxStatus};

/// Entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InFlight,
    DoneSuccess,
    DoneFailure,
}

/// Compact cached outcome, enough to reconstruct a duplicate's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutcome {
    pub status: TxStatus,
    pub yes_tx: Option<B256>,
    pub no_tx: Option<B256>,
    pub error_kind: Option<ErrorKind>,
}

/// One registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub status: IdempotencyStatus,
    pub outcome: Option<CachedOutcome>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of trying to begin work under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New key: the caller owns the submission.
    Started,
    /// Key is IN_FLIGHT or DONE_SUCCESS: suppress this duplicate.
    Suppressed(Option<CachedOutcome>),
}

/// Double-finalization is a programming error, surfaced as fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("idempotency key {0} finalized twice")]
    DoubleFinalize(IdempotencyKey),

    #[error("idempotency key {0} finalized without begin")]
    FinalizeWithoutBegin(IdempotencyKey),
}

/// Keyed registry with TTL expiry.
pub struct IdempotencyRegistry {
    entries: Mutex<HashMap<IdempotencyKey, IdempotencyEntry>>,
    ttl: ChronoDuration,
}

impl IdempotencyRegistry {
    /// `ttl` should cover one idempotency window plus grace.
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::minutes(5)),
        }
    }

    /// Try to begin a submission under `key`.
    ///
    /// - no entry (or expired, or DONE_FAILURE): records IN_FLIGHT and
    ///   returns [`Admission::Started`]
    /// - IN_FLIGHT or DONE_SUCCESS: returns [`Admission::Suppressed`]
    ///   with the cached outcome when finalized
    pub fn begin(&self, key: &IdempotencyKey) -> Admission {
        let now = Utc::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => match entry.status {
                IdempotencyStatus::InFlight => {
                    debug!("duplicate in-flight submission suppressed: {key}");
                    return Admission::Suppressed(None);
                }
                IdempotencyStatus::DoneSuccess => {
                    debug!("duplicate of completed submission suppressed: {key}");
                    return Admission::Suppressed(entry.outcome);
                }
                // A failed submission may be retried under the same key.
                IdempotencyStatus::DoneFailure => {}
            },
            _ => {}
        }

        entries.insert(
            key.clone(),
            IdempotencyEntry {
                status: IdempotencyStatus::InFlight,
                outcome: None,
                expires_at: now + self.ttl,
            },
        );
        Admission::Started
    }

    /// Finalize a key exactly once.
    pub fn finalize(
        &self,
        key: &IdempotencyKey,
        outcome: CachedOutcome,
    ) -> Result<(), IdempotencyError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::FinalizeWithoutBegin(key.clone()))?;
        if entry.status != IdempotencyStatus::InFlight {
            return Err(IdempotencyError::DoubleFinalize(key.clone()));
        }
        entry.status = match outcome.status {
            TxStatus::Success => IdempotencyStatus::DoneSuccess,
            TxStatus::Partial | TxStatus::Failed => IdempotencyStatus::DoneFailure,
        };
        entry.outcome = Some(outcome);
        entry.expires_at = Utc::now() + self.ttl;
        Ok(())
    }

    /// Current status of a key, if present and unexpired.
    pub fn status(&self, key: &IdempotencyKey) -> Option<IdempotencyStatus> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .map(|e| e.status)
    }

    /// Drop expired entries. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Export all live entries (crash-recovery snapshot).
    pub fn export(&self) -> Vec<(IdempotencyKey, IdempotencyEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Restore entries from a snapshot, keeping only unexpired ones.
    /// IN_FLIGHT entries restore as DONE_FAILURE: the process died before
    /// finalizing them, and the chain is the source of truth.
    pub fn restore(&self, saved: Vec<(IdempotencyKey, IdempotencyEntry)>) {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        for (key, mut entry) in saved {
            if entry.expires_at <= now {
                continue;
            }
            if entry.status == IdempotencyStatus::InFlight {
                entry.status = IdempotencyStatus::DoneFailure;
            }
            entries.insert(key, entry);
        }
    }
}
