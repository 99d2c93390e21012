//! Shared per-token book table.
//!
//! The store is the single owner of all [`OrderBook`] state. The feed
//! ingestor is its only writer; detection tasks receive change
//! notifications over a broadcast channel and read frozen
//! [`BookSnapshot`] views.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use arb_common::{OrderLevel, Side, TokenId};

use crate::book::{BookError, BookSnapshot, OrderBook, VwapWalk};

/// Notification that a token's book changed.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub token_id: TokenId,
    pub seq: u64,
    /// Monotonic receive timestamp of the wire message, for latency
    /// attribution downstream.
    pub received_at: Instant,
    /// Monotonic timestamp at which the store applied the update.
    pub applied_at: Instant,
}

/// Per-token order-book table with change notifications.
pub struct BookStore {
    books: DashMap<TokenId, OrderBook>,
    depth_cap: usize,
    updates: broadcast::Sender<BookUpdate>,
}

impl BookStore {
    pub fn new(depth_cap: usize, notify_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(notify_capacity.max(16));
        Self {
            books: DashMap::new(),
            depth_cap,
            updates,
        }
    }

    /// Subscribe to book-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BookUpdate> {
        self.updates.subscribe()
    }

    /// Replace a token's book with a snapshot. Creates the book on first
    /// sight of the token.
    pub fn apply_snapshot(
        &self,
        token_id: &TokenId,
        bids: Vec<OrderLevel>,
        asks: Vec<OrderLevel>,
        seq: u64,
        ts: DateTime<Utc>,
        received_at: Instant,
    ) -> Result<(), BookError> {
        let mut book = self
            .books
            .entry(token_id.clone())
            .or_insert_with(|| OrderBook::new(token_id.clone(), self.depth_cap));
        book.apply_snapshot(bids, asks, seq, ts)?;
        drop(book);
        self.notify(token_id, seq, received_at);
        Ok(())
    }

    /// Apply a delta batch to a token's book. Unknown tokens are ignored:
    /// a delta before the first snapshot carries no usable state.
    pub fn apply_delta(
        &self,
        token_id: &TokenId,
        updates: &[(Side, OrderLevel)],
        seq: u64,
        ts: DateTime<Utc>,
        received_at: Instant,
    ) -> Result<(), BookError> {
        let Some(mut book) = self.books.get_mut(token_id) else {
            return Ok(());
        };
        book.apply_delta(updates, seq, ts)?;
        drop(book);
        self.notify(token_id, seq, received_at);
        Ok(())
    }

    /// Mark a token stale pending a snapshot reseed. Detection sees no
    /// quotes for stale tokens.
    pub fn mark_stale(&self, token_id: &TokenId) {
        if let Some(mut book) = self.books.get_mut(token_id) {
            book.mark_stale();
        }
    }

    /// Last applied sequence for a token, if the token is known.
    pub fn last_seq(&self, token_id: &TokenId) -> Option<u64> {
        self.books.get(token_id).map(|b| b.last_update_seq())
    }

    pub fn best_bid(&self, token_id: &TokenId) -> Option<OrderLevel> {
        self.books.get(token_id).and_then(|b| b.best_bid())
    }

    pub fn best_ask(&self, token_id: &TokenId) -> Option<OrderLevel> {
        self.books.get(token_id).and_then(|b| b.best_ask())
    }

    /// Walk a token's ask ladder for a USDC budget.
    pub fn walk_asks(&self, token_id: &TokenId, budget: Decimal) -> Result<VwapWalk, BookError> {
        match self.books.get(token_id) {
            Some(book) if !book.is_stale() => book.walk_asks(budget),
            _ => Err(BookError::InsufficientLiquidity {
                token_id: token_id.clone(),
                budget,
            }),
        }
    }

    /// Frozen view of a token's book. Returns `None` for unknown or
    /// stale tokens so detection cannot act on reseeding state.
    pub fn snapshot(&self, token_id: &TokenId) -> Option<BookSnapshot> {
        let book = self.books.get(token_id)?;
        if book.is_stale() {
            return None;
        }
        Some(book.snapshot())
    }

    /// Number of tracked tokens.
    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    fn notify(&self, token_id: &TokenId, seq: u64, received_at: Instant) {
        // Lagging receivers miss intermediate updates, which is fine:
        // detection always re-reads the latest snapshot.
        let _ = self.updates.send(BookUpdate {
            token_id: token_id.clone(),
            seq,
            received_at,
            applied_at: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> BookStore {
        BookStore::new(50, 64)
    }

    fn asks(pairs: &[(Decimal, Decimal)]) -> Vec<OrderLevel> {
        pairs.iter().map(|(p, s)| OrderLevel::new(*p, *s)).collect()
    }

    #[tokio::test]
    async fn test_snapshot_then_delta_and_notify() {
        let s = store();
        let mut rx = s.subscribe();
        let tok = TokenId::new("t1");

        s.apply_snapshot(
            &tok,
            Vec::new(),
            asks(&[(dec!(0.50), dec!(10))]),
            1,
            Utc::now(),
            Instant::now(),
        )
        .unwrap();

        s.apply_delta(
            &tok,
            &[(Side::Sell, OrderLevel::new(dec!(0.49), dec!(5)))],
            2,
            Utc::now(),
            Instant::now(),
        )
        .unwrap();

        assert_eq!(s.best_ask(&tok).unwrap().price, dec!(0.49));
        assert_eq!(s.last_seq(&tok), Some(2));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.token_id, tok);
    }

    #[tokio::test]
    async fn test_delta_for_unknown_token_ignored() {
        let s = store();
        let tok = TokenId::new("unknown");
        s.apply_delta(
            &tok,
            &[(Side::Sell, OrderLevel::new(dec!(0.5), dec!(1)))],
            1,
            Utc::now(),
            Instant::now(),
        )
        .unwrap();
        assert!(s.snapshot(&tok).is_none());
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_stale_token_hides_snapshot_and_walk() {
        let s = store();
        let tok = TokenId::new("t1");
        s.apply_snapshot(
            &tok,
            Vec::new(),
            asks(&[(dec!(0.50), dec!(10))]),
            1,
            Utc::now(),
            Instant::now(),
        )
        .unwrap();
        assert!(s.snapshot(&tok).is_some());

        s.mark_stale(&tok);
        assert!(s.snapshot(&tok).is_none());
        assert!(matches!(
            s.walk_asks(&tok, dec!(1)),
            Err(BookError::InsufficientLiquidity { .. })
        ));

        // Reseed clears staleness.
        s.apply_snapshot(
            &tok,
            Vec::new(),
            asks(&[(dec!(0.51), dec!(10))]),
            5,
            Utc::now(),
            Instant::now(),
        )
        .unwrap();
        assert_eq!(s.snapshot(&tok).unwrap().seq, 5);
    }
}
