//! Injected signing + submission capability.
//!
//! The engine never talks to a chain client directly; everything it
//! needs from the EVM side goes through [`ChainClient`]. Production
//! wires an exchange/RPC implementation, tests wire mocks.

use std::time::Duration;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use arb_common::{Side, TokenId};

use crate::types::ErrorKind;

/// Chain-boundary errors, classified into the engine's taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("rpc timeout: {0}")]
    Timeout(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("rpc server error ({status}): {message}")]
    RpcServer { status: u16, message: String },

    #[error("nonce too low (chain expects higher)")]
    NonceTooLow,

    #[error("replacement transaction underpriced")]
    ReplacementUnderpriced,

    #[error("gas required exceeds allowance")]
    GasAllowanceExceeded,

    #[error("insufficient funds for transaction")]
    InsufficientFunds,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("authorization failure: {0}")]
    Unauthorized(String),
}

impl ChainError {
    /// Map into the engine-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Timeout(_) => ErrorKind::Timeout,
            ChainError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            ChainError::RpcServer { .. } => ErrorKind::RpcServerError,
            ChainError::NonceTooLow => ErrorKind::NonceTooLow,
            ChainError::ReplacementUnderpriced => ErrorKind::ReplacementUnderpriced,
            ChainError::GasAllowanceExceeded => ErrorKind::GasAllowanceExceeded,
            ChainError::InsufficientFunds => ErrorKind::InsufficientFunds,
            ChainError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            ChainError::Reverted(_) => ErrorKind::Reverted,
            ChainError::Unauthorized(_) => ErrorKind::Unauthorized,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// EIP-1559 gas estimate from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    pub base_fee_wei: u64,
    pub priority_fee_wei: u64,
    pub gas_limit: u64,
}

impl GasEstimate {
    pub fn max_fee_per_gas_wei(&self) -> u64 {
        self.base_fee_wei + self.priority_fee_wei
    }
}

/// An unsigned CLOB order. Amounts are expressed in decimal units here;
/// conversion to integer base units happens inside the signing
/// capability, at the exchange boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub maker: Address,
    pub token_id: TokenId,
    pub side: Side,
    /// Limit price in USDC per share.
    pub price: Decimal,
    /// Shares.
    pub size: Decimal,
    /// Order expiration.
    pub expires_at: DateTime<Utc>,
    /// Uniqueness salt.
    pub salt: u64,
}

/// A signed order ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedOrder {
    pub order: Order,
    pub signature: Vec<u8>,
}

/// Transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub success: bool,
    pub gas_used: u64,
}

/// Signing + submission capability injected into the live executor.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Sign an order (EIP-712 under the hood; opaque to the engine).
    async fn sign_order(&self, order: &Order) -> Result<SignedOrder, ChainError>;

    /// Submit a signed order at the given nonce. Returns the tx hash.
    async fn submit_order(&self, signed: &SignedOrder, nonce: u64) -> Result<B256, ChainError>;

    /// USDC balance of a wallet.
    async fn get_balance(&self, wallet: Address) -> Result<Decimal, ChainError>;

    /// The chain's pending-nonce view for a wallet.
    async fn get_pending_nonce(&self, wallet: Address) -> Result<u64, ChainError>;

    /// Current gas estimate.
    async fn get_gas_estimate(&self) -> Result<GasEstimate, ChainError>;

    /// Wait for a receipt, up to `timeout`.
    async fn wait_for_receipt(
        &self,
        tx_hash: B256,
        timeout: Duration,
    ) -> Result<TxReceipt, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ChainError::Timeout("t".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(ChainError::NonceTooLow.kind(), ErrorKind::NonceTooLow);
        assert_eq!(
            ChainError::Reverted("bad".into()).kind(),
            ErrorKind::Reverted
        );
        assert!(ChainError::GasAllowanceExceeded.is_retryable());
        assert!(!ChainError::InsufficientFunds.is_retryable());
        assert!(!ChainError::Unauthorized("no".into()).is_retryable());
    }

    #[test]
    fn test_gas_estimate_max_fee() {
        let gas = GasEstimate {
            base_fee_wei: 30,
            priority_fee_wei: 2,
            gas_limit: 21_000,
        };
        assert_eq!(gas.max_fee_per_gas_wei(), 32);
    }
}
