//! Chain collaborator for VTN transcoder nodes.
//!
//! [`ChainClient`] is the contract the job pipeline consumes: eligibility and
//! stake queries, job-event subscription, transaction lookup, job metadata,
//! claim submission and reward invocation. [`SubxtChainClient`] implements it
//! against a Substrate node; `MockChainClient` (feature `test-utils`) is an
//! in-memory double.
//!
//! Chain access is bounded by [`ChainTimeouts`], three strictly increasing
//! tiers: RPC, event resolution and mined transaction.

mod client;
mod error;
mod payload;
mod subxt_client;
mod timeouts;
mod types;

#[cfg(any(test, feature = "test-utils"))]
mod mock;

pub use client::ChainClient;
pub use error::{ChainError, ChainResult};
pub use payload::{parse_job_payload, JobParams, JobPayload};
pub use subxt_client::SubxtChainClient;
pub use timeouts::{with_timeout, ChainTimeouts};
pub use types::{JobInfo, JobLog, Transaction, TxHash};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockChainClient, RewardMode};
