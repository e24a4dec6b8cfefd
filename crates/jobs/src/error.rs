//! Error types for job orchestration.
//!
//! One enum per component, rolled up into [`JobsError`] for callers that
//! drive the whole pipeline.

use thiserror::Error;
use vtn_chain::ChainError;
use vtn_net::NetError;

/// Top-level error type for the job pipeline.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Job event listener errors.
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Transcoding errors.
    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    /// Claim errors.
    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),

    /// Reward loop errors.
    #[error("reward error: {0}")]
    Reward(#[from] RewardError),

    /// Chain access errors outside a component.
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A spawned task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

/// Errors resolving one job event.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Event subscription could not be established.
    #[error("event subscription failed: {0}")]
    Subscription(ChainError),

    /// Transaction payload is malformed.
    #[error("malformed job payload: {0}")]
    Parse(String),

    /// Profile tag names an unknown profile.
    #[error("unknown profile tag: {0}")]
    UnknownProfile(String),

    /// Chain lookup failed after retries.
    #[error("chain lookup failed: {0}")]
    Chain(ChainError),

    /// Job is assigned to another transcoder.
    #[error("job assigned to {0}")]
    NotAssigned(String),
}

impl ListenerError {
    /// Whether the event was discarded because its content is invalid.
    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            ListenerError::Parse(_) | ListenerError::UnknownProfile(_)
        )
    }
}

/// Errors raised while transcoding a job.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Overlay operation failed.
    #[error("network error: {0}")]
    Network(#[from] NetError),

    /// Source subscription ended without an end-of-stream marker.
    #[error("source stream {0} ended unexpectedly")]
    SourceEnded(String),

    /// Transcoding engine failed for one profile.
    #[error("engine failed for {profile}: {reason}")]
    Engine {
        /// Profile name.
        profile: String,
        /// Engine error output.
        reason: String,
    },

    /// Transcoding a segment exceeded its deadline.
    #[error("transcoding {profile} timed out after {timeout_ms}ms")]
    Timeout {
        /// Profile name.
        profile: String,
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Every requested profile failed.
    #[error("all profiles failed for job {0}")]
    AllProfilesFailed(String),

    /// Job was cancelled.
    #[error("job cancelled")]
    Cancelled,
}

/// Errors raised by the claim manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Receipt sequence does not advance.
    #[error("receipt {seq} out of order (last {last})")]
    OutOfOrder {
        /// Rejected sequence number.
        seq: u64,
        /// Last accepted sequence number.
        last: u64,
    },

    /// Manager no longer accepts receipts.
    #[error("claim manager closed")]
    Closed,

    /// Invalid claim configuration.
    #[error("invalid claim configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised by the reward manager.
#[derive(Debug, Error)]
pub enum RewardError {
    /// Interval must be non-zero.
    #[error("reward interval must be non-zero")]
    ZeroInterval,
}

/// Result type alias for the job pipeline.
pub type JobsResult<T> = Result<T, JobsError>;

/// Result type alias for listener operations.
pub type ListenerResult<T> = Result<T, ListenerError>;

/// Result type alias for claim operations.
pub type ClaimResult<T> = Result<T, ClaimError>;
