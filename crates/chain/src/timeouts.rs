//! Timeout tiers for chain access.

use crate::error::{ChainError, ChainResult};
use std::future::Future;
use std::time::Duration;

/// Per-tier deadlines. Must satisfy `rpc < event < mined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTimeouts {
    /// Single RPC round trip.
    pub rpc: Duration,
    /// Full resolution of one job event, retries included.
    pub event: Duration,
    /// Submission of a transaction until it is finalized.
    pub mined: Duration,
}

impl Default for ChainTimeouts {
    fn default() -> Self {
        Self {
            rpc: Duration::from_secs(10),
            event: Duration::from_secs(30),
            mined: Duration::from_secs(60),
        }
    }
}

impl ChainTimeouts {
    /// Reject tiers that are zero or not strictly increasing.
    pub fn validate(&self) -> ChainResult<()> {
        if self.rpc.is_zero() {
            return Err(ChainError::InvalidTimeouts("rpc timeout is zero".into()));
        }
        if self.rpc >= self.event || self.event >= self.mined {
            return Err(ChainError::InvalidTimeouts(format!(
                "expected rpc < event < mined, got {:?} / {:?} / {:?}",
                self.rpc, self.event, self.mined
            )));
        }
        Ok(())
    }
}

/// Run `fut` under `limit`, mapping expiry to [`ChainError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> ChainResult<T>
where
    F: Future<Output = ChainResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ChainError::Timeout(limit))?
}
