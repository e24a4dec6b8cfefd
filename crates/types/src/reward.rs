//! Reward evaluation rounds.

use serde::{Deserialize, Serialize};

/// Result of evaluating one reward cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardOutcome {
    /// Node was not an active transcoder; nothing was called.
    Ineligible,
    /// Reward call succeeded.
    Rewarded {
        /// Stake observed before the call.
        stake: u128,
    },
    /// Chain reported the cycle as already rewarded.
    AlreadyRewarded,
    /// Eligibility check or reward call failed.
    Failed(String),
}

impl RewardOutcome {
    /// Whether the outcome counts as an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RewardOutcome::Failed(_))
    }
}

/// One reward-evaluation round. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardCycle {
    /// Monotonic cycle index, starting at 0.
    pub index: u64,
    /// Evaluation time (unix millis).
    pub evaluated_at_ms: u64,
    /// Eligibility result; `false` also when the check itself failed.
    pub eligible: bool,
    /// What happened.
    pub outcome: RewardOutcome,
}
