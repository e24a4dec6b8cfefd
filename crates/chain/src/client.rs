//! Chain collaborator contract.

use crate::error::ChainResult;
use crate::types::{JobInfo, JobLog, Transaction, TxHash};
use async_trait::async_trait;
use tokio::sync::mpsc;
use vtn_types::Claim;

/// Everything the job pipeline needs from the chain.
///
/// Implementations take `&self` and are shared as `Arc<dyn ChainClient>`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Account this client signs for.
    fn account(&self) -> &str;

    /// Whether this account is currently an active transcoder.
    async fn is_active_transcoder(&self) -> ChainResult<bool>;

    /// Bonded stake of this account.
    async fn transcoder_stake(&self) -> ChainResult<u128>;

    /// Subscribe to job-assignment events for this account.
    ///
    /// The channel closes when the underlying subscription ends.
    async fn subscribe_job_events(&self) -> ChainResult<mpsc::Receiver<JobLog>>;

    /// Look up the extrinsic that emitted an event.
    async fn transaction_by_hash(&self, hash: &TxHash) -> ChainResult<Transaction>;

    /// Resolve job metadata for an event.
    async fn job_info(&self, log: &JobLog) -> ChainResult<JobInfo>;

    /// Submit a work claim; returns the finalized extrinsic hash.
    async fn submit_claim(&self, claim: &Claim) -> ChainResult<TxHash>;

    /// Invoke the reward call for the current round.
    async fn reward(&self) -> ChainResult<TxHash>;
}
