//! Periodic reward distribution.
//!
//! Independent of any job. Every interval the manager checks whether this
//! node is an active transcoder and, if so, reads its stake and invokes the
//! chain's reward call. Ticks are evaluated inline, so evaluations never
//! overlap, and missed ticks are skipped rather than bunched.

use crate::cancel::cancelled;
use crate::error::RewardError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument, Span};
use vtn_chain::{with_timeout, ChainClient, ChainError};
use vtn_types::{RewardCycle, RewardOutcome};

/// Configuration for the reward manager.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Time between evaluations.
    pub interval: Duration,
    /// Cycles kept in [`RewardStats`].
    pub history: usize,
    /// Deadline for each chain call within a cycle.
    pub call_timeout: Duration,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            history: 64,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Evaluation counters and recent cycles.
#[derive(Debug)]
pub struct RewardStats {
    evaluations: AtomicU64,
    capacity: usize,
    cycles: Mutex<VecDeque<RewardCycle>>,
}

impl RewardStats {
    fn new(capacity: usize) -> Self {
        Self {
            evaluations: AtomicU64::new(0),
            capacity: capacity.max(1),
            cycles: Mutex::new(VecDeque::new()),
        }
    }

    /// Cycles evaluated since start.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Most recent cycles, oldest first.
    pub fn history(&self) -> Vec<RewardCycle> {
        self.lock().iter().cloned().collect()
    }

    /// Latest cycle, if any.
    pub fn last(&self) -> Option<RewardCycle> {
        self.lock().back().cloned()
    }

    /// Retained cycles whose outcome counts as an error.
    pub fn errors(&self) -> usize {
        self.lock().iter().filter(|c| c.outcome.is_error()).count()
    }

    fn record(&self, cycle: RewardCycle) {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let mut cycles = self.lock();
        if cycles.len() == self.capacity {
            cycles.pop_front();
        }
        cycles.push_back(cycle);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RewardCycle>> {
        self.cycles.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Reward loop for one node.
pub struct RewardManager {
    chain: Arc<dyn ChainClient>,
    config: RewardConfig,
    stats: Arc<RewardStats>,
    span: Span,
}

impl RewardManager {
    /// Create a manager. A zero interval is rejected.
    pub fn new(chain: Arc<dyn ChainClient>, config: RewardConfig) -> Result<Self, RewardError> {
        if config.interval.is_zero() {
            return Err(RewardError::ZeroInterval);
        }
        Ok(Self {
            chain,
            stats: Arc::new(RewardStats::new(config.history)),
            config,
            span: tracing::info_span!("reward_manager"),
        })
    }

    /// Run under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<RewardStats> {
        Arc::clone(&self.stats)
    }

    /// Run the loop on a new task.
    pub fn spawn(self, cancel: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until cancelled. The first evaluation happens one interval after start.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let span = self.span.clone();
        async move {
            let period = self.config.interval;
            info!(interval_ms = period.as_millis() as u64, "Starting reward manager");

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut index = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    _ = ticker.tick() => {
                        let cycle = self.evaluate(index).await;
                        self.stats.record(cycle);
                        index += 1;
                    }
                }
            }

            info!(evaluations = self.stats.evaluations(), "Reward manager stopped");
        }
        .instrument(span)
        .await
    }

    /// Evaluate one cycle.
    pub async fn evaluate(&self, index: u64) -> RewardCycle {
        let timeout = self.config.call_timeout;
        let evaluated_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let cycle = |eligible, outcome| RewardCycle {
            index,
            evaluated_at_ms,
            eligible,
            outcome,
        };

        match with_timeout(timeout, self.chain.is_active_transcoder()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cycle = index, "Not an active transcoder, skipping reward");
                return cycle(false, RewardOutcome::Ineligible);
            }
            Err(e) => {
                warn!(cycle = index, error = %e, "Eligibility check failed");
                return cycle(false, RewardOutcome::Failed(e.to_string()));
            }
        }

        let stake = match with_timeout(timeout, self.chain.transcoder_stake()).await {
            Ok(stake) => stake,
            Err(e) => {
                warn!(cycle = index, error = %e, "Stake query failed");
                return cycle(true, RewardOutcome::Failed(e.to_string()));
            }
        };

        match with_timeout(timeout, self.chain.reward()).await {
            Ok(tx) => {
                info!(cycle = index, stake, tx = %tx, "Reward submitted");
                cycle(true, RewardOutcome::Rewarded { stake })
            }
            Err(ChainError::AlreadyRewarded) => {
                debug!(cycle = index, "Round already rewarded");
                cycle(true, RewardOutcome::AlreadyRewarded)
            }
            Err(e) => {
                warn!(cycle = index, stake, error = %e, "Reward call failed");
                cycle(true, RewardOutcome::Failed(e.to_string()))
            }
        }
    }
}
