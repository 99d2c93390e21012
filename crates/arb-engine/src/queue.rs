//! Coalescing opportunity queue between detection and execution.
//!
//! Detection can outrun execution. The queue keeps at most one pending
//! opportunity per market pair: a newer opportunity for a pair replaces
//! the older one (the stale prices are worthless anyway), and every
//! replacement is counted and reported, never dropped silently.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::ArbitrageOpportunity;

#[derive(Debug, Default)]
struct QueueInner {
    /// FIFO of market ids with a pending opportunity.
    order: VecDeque<String>,
    /// Latest opportunity per market id.
    latest: HashMap<String, ArbitrageOpportunity>,
    closed: bool,
}

/// Bounded-by-pairs coalescing queue.
#[derive(Debug, Default)]
pub struct OpportunityQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    coalesced: AtomicU64,
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// New pending entry for this pair.
    Queued,
    /// Replaced an older pending opportunity for the same pair.
    Coalesced,
}

impl OpportunityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an opportunity, coalescing per pair (newest wins).
    pub fn push(&self, opportunity: ArbitrageOpportunity) -> Pushed {
        let market_id = opportunity.pair.market_id.clone();
        let result = {
            let mut inner = self.inner.lock();
            if inner.latest.insert(market_id.clone(), opportunity).is_some() {
                Pushed::Coalesced
            } else {
                inner.order.push_back(market_id);
                Pushed::Queued
            }
        };
        if result == Pushed::Coalesced {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        result
    }

    /// Dequeue the oldest pending pair's newest opportunity, waiting
    /// for one if the queue is empty. Returns `None` once closed and
    /// drained.
    pub async fn pop(&self) -> Option<ArbitrageOpportunity> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(market_id) = inner.order.pop_front() {
                    let opp = inner
                        .latest
                        .remove(&market_id)
                        .expect("order and latest are in sync");
                    return Some(opp);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<ArbitrageOpportunity> {
        let mut inner = self.inner.lock();
        let market_id = inner.order.pop_front()?;
        Some(
            inner
                .latest
                .remove(&market_id)
                .expect("order and latest are in sync"),
        )
    }

    /// Close the queue: pending items drain, further pops return None.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// How many opportunities were replaced by newer ones.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraceId;
    use arb_common::MarketPair;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn opp(market: &str, qty: rust_decimal::Decimal) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            pair: MarketPair::new(market, "yes", "no", "q", None).unwrap(),
            yes_vwap: dec!(0.45),
            no_vwap: dec!(0.50),
            qty,
            trade_size_usdc: dec!(10),
            expected_profit_per_unit: dec!(0.05),
            expected_profit_total: dec!(0.5),
            partial_depth: false,
            detected_at: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }

    #[tokio::test]
    async fn test_fifo_across_pairs() {
        let q = OpportunityQueue::new();
        assert_eq!(q.push(opp("m1", dec!(1))), Pushed::Queued);
        assert_eq!(q.push(opp("m2", dec!(2))), Pushed::Queued);

        assert_eq!(q.pop().await.unwrap().pair.market_id, "m1");
        assert_eq!(q.pop().await.unwrap().pair.market_id, "m2");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_coalesce_keeps_newest() {
        let q = OpportunityQueue::new();
        q.push(opp("m1", dec!(1)));
        assert_eq!(q.push(opp("m1", dec!(2))), Pushed::Coalesced);
        assert_eq!(q.push(opp("m1", dec!(3))), Pushed::Coalesced);
        assert_eq!(q.len(), 1);
        assert_eq!(q.coalesced_count(), 2);

        let got = q.pop().await.unwrap();
        assert_eq!(got.qty, dec!(3));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = std::sync::Arc::new(OpportunityQueue::new());
        let q2 = std::sync::Arc::clone(&q);
        let waiter = tokio::spawn(async move { q2.pop().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(opp("m1", dec!(1)));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.pair.market_id, "m1");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let q = OpportunityQueue::new();
        q.push(opp("m1", dec!(1)));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_try_pop() {
        let q = OpportunityQueue::new();
        assert!(q.try_pop().is_none());
        q.push(opp("m1", dec!(1)));
        assert!(q.try_pop().is_some());
        assert!(q.try_pop().is_none());
    }
}
