//! Shared domain types for the binary-market arbitrage engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{MarketPair, OrderLevel, Outcome, PairError, Side, TokenId};
