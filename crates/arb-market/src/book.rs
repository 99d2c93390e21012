//! Single-token order-book state.
//!
//! Maintains sorted bid/ask ladders bounded to a configurable depth,
//! tracks the last applied sequence number, and implements the VWAP
//! budget walk used by opportunity detection.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use arb_common::{OrderLevel, Side, TokenId};

/// Default maximum ladder depth per side.
pub const DEFAULT_DEPTH_CAP: usize = 50;

/// Errors from order-book operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    /// The ask ladder cannot fill any part of the requested budget.
    #[error("insufficient liquidity on {token_id}: budget {budget} unfilled")]
    InsufficientLiquidity { token_id: TokenId, budget: Decimal },

    /// Best bid crossed best ask after an update. This indicates corrupt
    /// feed state and must halt the affected token.
    #[error("crossed book on {token_id}: bid {bid} >= ask {ask}")]
    Crossed {
        token_id: TokenId,
        bid: Decimal,
        ask: Decimal,
    },

    /// Sequence number regressed inside the store. The ingestor filters
    /// stale sequences, so hitting this is a programming error.
    #[error("sequence regression on {token_id}: {seq} <= {last}")]
    SequenceRegression {
        token_id: TokenId,
        seq: u64,
        last: u64,
    },
}

/// Result of a VWAP walk down the ask ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VwapWalk {
    /// Shares obtained.
    pub qty: Decimal,
    /// Volume-weighted average price paid.
    pub vwap: Decimal,
    /// USDC actually consumed (== budget unless partial).
    pub spent: Decimal,
    /// True when the ladder exhausted before the budget was filled.
    pub partial: bool,
}

/// Immutable view of a book handed to detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookSnapshot {
    pub token_id: TokenId,
    pub bids: Vec<OrderLevel>,
    pub asks: Vec<OrderLevel>,
    pub seq: u64,
    pub ts: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<OrderLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<OrderLevel> {
        self.asks.first().copied()
    }

    /// Total shares resting on the ask side.
    pub fn ask_depth(&self) -> Decimal {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// Walk the ask ladder for a USDC budget. Same semantics as
    /// [`OrderBook::walk_asks`], operating on the frozen view.
    pub fn walk_asks(&self, budget: Decimal) -> Result<VwapWalk, BookError> {
        walk_ladder(&self.token_id, &self.asks, budget)
    }
}

/// In-memory order book for a single token.
///
/// Bids are kept strictly descending by price, asks strictly ascending.
/// A level update at an existing price replaces that level; zero size
/// removes it. Ladders are truncated to `depth_cap` levels per side.
#[derive(Debug, Clone)]
pub struct OrderBook {
    token_id: TokenId,
    bids: Vec<OrderLevel>,
    asks: Vec<OrderLevel>,
    depth_cap: usize,
    last_update_seq: u64,
    last_update_ts: DateTime<Utc>,
    /// Set when a sequence gap was observed; cleared by the next snapshot.
    stale: bool,
}

impl OrderBook {
    pub fn new(token_id: TokenId, depth_cap: usize) -> Self {
        Self {
            token_id,
            bids: Vec::new(),
            asks: Vec::new(),
            depth_cap: depth_cap.max(1),
            last_update_seq: 0,
            last_update_ts: DateTime::<Utc>::MIN_UTC,
            stale: true,
        }
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn last_update_seq(&self) -> u64 {
        self.last_update_seq
    }

    pub fn last_update_ts(&self) -> DateTime<Utc> {
        self.last_update_ts
    }

    /// True while the book is awaiting a snapshot reseed. Detection must
    /// not act on a stale book.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Mark the book stale until the next snapshot overwrites it.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Replace the entire book with a snapshot.
    pub fn apply_snapshot(
        &mut self,
        bids: Vec<OrderLevel>,
        asks: Vec<OrderLevel>,
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<(), BookError> {
        self.bids = bids;
        self.asks = asks;
        self.bids.retain(|l| l.size > Decimal::ZERO);
        self.asks.retain(|l| l.size > Decimal::ZERO);
        // Snapshots arrive best-first from the wire, but re-sorting is cheap
        // at 50 levels and makes the ordering invariant unconditional.
        self.bids.sort_by(|a, b| b.price.cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.cmp(&b.price));
        self.bids.truncate(self.depth_cap);
        self.asks.truncate(self.depth_cap);
        self.last_update_seq = seq;
        self.last_update_ts = ts;
        self.stale = false;
        self.check_not_crossed()
    }

    /// Apply one delta batch: level replacements keyed by (side, price).
    ///
    /// The caller (ingestor) is responsible for sequence admission; the
    /// book only refuses outright regressions.
    pub fn apply_delta(
        &mut self,
        updates: &[(Side, OrderLevel)],
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<(), BookError> {
        if seq <= self.last_update_seq {
            return Err(BookError::SequenceRegression {
                token_id: self.token_id.clone(),
                seq,
                last: self.last_update_seq,
            });
        }
        for (side, level) in updates {
            match side {
                Side::Buy => Self::upsert_desc(&mut self.bids, *level),
                Side::Sell => Self::upsert_asc(&mut self.asks, *level),
            }
        }
        self.bids.truncate(self.depth_cap);
        self.asks.truncate(self.depth_cap);
        self.last_update_seq = seq;
        self.last_update_ts = ts;
        self.check_not_crossed()
    }

    pub fn best_bid(&self) -> Option<OrderLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<OrderLevel> {
        self.asks.first().copied()
    }

    /// Walk the ask ladder for a USDC budget.
    ///
    /// Iterates asks in ascending price. At each level the available
    /// notional is `price * size`; if it covers the remaining budget the
    /// walk consumes `remaining / price` shares and stops, otherwise it
    /// consumes the whole level and continues. Reports `partial = true`
    /// with the achieved quantity when the ladder runs out first.
    pub fn walk_asks(&self, budget: Decimal) -> Result<VwapWalk, BookError> {
        walk_ladder(&self.token_id, &self.asks, budget)
    }

    /// Freeze the current state into an immutable view.
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            token_id: self.token_id.clone(),
            bids: self.bids.clone(),
            asks: self.asks.clone(),
            seq: self.last_update_seq,
            ts: self.last_update_ts,
        }
    }

    fn upsert_desc(ladder: &mut Vec<OrderLevel>, level: OrderLevel) {
        match ladder.binary_search_by(|l| level.price.cmp(&l.price)) {
            Ok(i) => {
                if level.size.is_zero() {
                    ladder.remove(i);
                } else {
                    ladder[i] = level;
                }
            }
            Err(i) => {
                if !level.size.is_zero() {
                    ladder.insert(i, level);
                }
            }
        }
    }

    fn upsert_asc(ladder: &mut Vec<OrderLevel>, level: OrderLevel) {
        match ladder.binary_search_by(|l| l.price.cmp(&level.price)) {
            Ok(i) => {
                if level.size.is_zero() {
                    ladder.remove(i);
                } else {
                    ladder[i] = level;
                }
            }
            Err(i) => {
                if !level.size.is_zero() {
                    ladder.insert(i, level);
                }
            }
        }
    }

    fn check_not_crossed(&self) -> Result<(), BookError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(BookError::Crossed {
                    token_id: self.token_id.clone(),
                    bid: bid.price,
                    ask: ask.price,
                });
            }
        }
        Ok(())
    }
}

fn walk_ladder(
    token_id: &TokenId,
    asks: &[OrderLevel],
    budget: Decimal,
) -> Result<VwapWalk, BookError> {
    let mut remaining = budget;
    let mut qty = Decimal::ZERO;
    let mut spent = Decimal::ZERO;

    for level in asks {
        if remaining <= Decimal::ZERO {
            break;
        }
        let available = level.notional();
        if available >= remaining {
            qty += remaining / level.price;
            spent += remaining;
            remaining = Decimal::ZERO;
            break;
        }
        qty += level.size;
        spent += available;
        remaining -= available;
    }

    if qty.is_zero() {
        return Err(BookError::InsufficientLiquidity {
            token_id: token_id.clone(),
            budget,
        });
    }

    Ok(VwapWalk {
        qty,
        vwap: spent / qty,
        spent,
        partial: remaining > Decimal::ZERO,
    })
}
