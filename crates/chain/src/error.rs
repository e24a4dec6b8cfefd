//! Chain error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`ChainClient`](crate::ChainClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// RPC transport or node error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Call did not complete within its timeout tier.
    #[error("chain call timed out after {0:?}")]
    Timeout(Duration),

    /// Event subscription ended.
    #[error("event subscription closed")]
    SubscriptionClosed,

    /// Could not reach the chain endpoint.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Job is not (yet) present in chain state.
    #[error("job {0} not found")]
    JobNotFound(String),

    /// Payload or storage bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// No transaction with the given hash.
    #[error("transaction {0} not found")]
    TransactionNotFound(String),

    /// Extrinsic was included but dispatch failed.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// Signing key could not be loaded.
    #[error("signer error: {0}")]
    Signer(String),

    /// Timeout tiers are not strictly increasing.
    #[error("invalid timeouts: {0}")]
    InvalidTimeouts(String),

    /// The current reward round was already distributed.
    #[error("reward already distributed for this round")]
    AlreadyRewarded,
}

impl ChainError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_)
                | ChainError::Timeout(_)
                | ChainError::SubscriptionClosed
                | ChainError::Connection(_)
                | ChainError::JobNotFound(_)
        )
    }
}

/// Result type alias for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
