//! Chain-data provider capability.
//!
//! The monitors only talk to a chain through this trait. `RpcChainAdapter`
//! is the JSON-RPC implementation; tests use an in-memory mock.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use thiserror::Error;

use crate::onchain::types::{CandidateTx, RawAmount, TxReceipt};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 429-class response or quota exhaustion. Retried with a longer backoff.
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    /// Network error, 5xx, dropped connection.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider call timed out after {0}s")]
    Timeout(u64),
    /// The provider answered with data we cannot interpret. Not retried.
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Malformed(_))
    }

    /// Sort an error string from an RPC client into the taxonomy above.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let is_rate_limited = lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("rate limit")
            || lower.contains("exceeded")
            || lower.contains("capacity");
        if is_rate_limited {
            ProviderError::RateLimited(message)
        } else {
            ProviderError::Transient(message)
        }
    }
}

/// Read-only view of one chain.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Transactions whose `to` is `address`, in blocks `from_block..=to_block`.
    async fn get_transactions_to(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<CandidateTx>, ProviderError>;

    /// `Ok(None)` when the transaction is not (yet) mined or propagated.
    async fn get_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ProviderError>;

    async fn get_token_balance(
        &self,
        holder: Address,
        token: Address,
    ) -> Result<RawAmount, ProviderError>;

    async fn get_native_balance(&self, holder: Address) -> Result<RawAmount, ProviderError>;

    async fn get_head_block_number(&self) -> Result<u64, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection() {
        assert!(matches!(
            ProviderError::from_message("HTTP error 429 with body: Too Many Requests"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_message("Your app has exceeded its compute units per second capacity"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_message("connection reset by peer"),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn test_malformed_is_not_retryable() {
        assert!(!ProviderError::Malformed("x".into()).is_retryable());
        assert!(ProviderError::Timeout(5).is_retryable());
    }
}
