//! Core market types shared across the engine crates.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome token of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// Interned token identifier.
///
/// Token ids are long numeric strings on the exchange; cloning them on the
/// hot path would churn the allocator, so the handle is a shared `Arc<str>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Arc<str>);

impl TokenId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single level in an order book (price + size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLevel {
    /// Price in USDC per share, in (0, 1) for outcome tokens.
    pub price: Decimal,
    /// Shares available at this price.
    pub size: Decimal,
}

impl OrderLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// USDC notional available at this level.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Errors produced when validating a market pair.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("YES and NO token ids must differ (both were {0})")]
    IdenticalTokens(TokenId),

    #[error("market id must not be empty")]
    EmptyMarketId,
}

/// A YES/NO market pair with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPair {
    /// Market identifier (condition id on the exchange).
    pub market_id: String,
    /// Token id for the YES outcome.
    pub yes_token_id: TokenId,
    /// Token id for the NO outcome.
    pub no_token_id: TokenId,
    /// Market question.
    pub question: String,
    /// When the market resolves, if known.
    pub end_date: Option<DateTime<Utc>>,
}

impl MarketPair {
    pub fn new(
        market_id: impl Into<String>,
        yes_token_id: impl Into<TokenId>,
        no_token_id: impl Into<TokenId>,
        question: impl Into<String>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Self, PairError> {
        let pair = Self {
            market_id: market_id.into(),
            yes_token_id: yes_token_id.into(),
            no_token_id: no_token_id.into(),
            question: question.into(),
            end_date,
        };
        pair.validate()?;
        Ok(pair)
    }

    /// Both legs must belong to the same market and must be distinct tokens.
    pub fn validate(&self) -> Result<(), PairError> {
        if self.market_id.is_empty() {
            return Err(PairError::EmptyMarketId);
        }
        if self.yes_token_id == self.no_token_id {
            return Err(PairError::IdenticalTokens(self.yes_token_id.clone()));
        }
        Ok(())
    }

    /// Returns the outcome a token id represents in this pair, if any.
    pub fn outcome_of(&self, token_id: &TokenId) -> Option<Outcome> {
        if token_id == &self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == &self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Returns the token id for the given outcome.
    pub fn token_for(&self, outcome: Outcome) -> &TokenId {
        match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        }
    }

    /// True if either leg of this pair is the given token.
    pub fn contains(&self, token_id: &TokenId) -> bool {
        self.outcome_of(token_id).is_some()
    }
}
