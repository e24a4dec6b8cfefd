//! Per-job claim manager.
//!
//! Receipts flow into a [`ClaimBook`], which cuts them into claims when the
//! buffer is full, when the flush interval elapses, and when the job ends.
//! Cut claims are queued to a per-job submitter so a job's claims reach the
//! chain one at a time, in range order, while retries for one claim never
//! block new receipts.
//!
//! Lifecycle: `Open → Finalizing → Closed`.

use crate::error::{ClaimError, ClaimResult};
use crate::retry::{retry_transient, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn, Instrument, Span};
use vtn_chain::{with_timeout, ChainClient};
use vtn_types::{Claim, ClaimStatus, JobId, TranscodeReceipt};

const COMMAND_BUFFER: usize = 64;

/// Claim batching and submission settings.
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    /// Receipts per claim; reaching it triggers a cut.
    pub max_batch: usize,
    /// Time between periodic cuts.
    pub flush_interval: Duration,
    /// Retry policy for transient submission failures.
    pub retry: RetryPolicy,
    /// Deadline for one submission attempt, until finalized.
    pub submit_timeout: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_batch: 10,
            flush_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            submit_timeout: Duration::from_secs(60),
        }
    }
}

impl ClaimConfig {
    /// Reject settings the manager cannot run with.
    pub fn validate(&self) -> ClaimResult<()> {
        if self.max_batch == 0 {
            return Err(ClaimError::InvalidConfig("max_batch must be at least 1".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(ClaimError::InvalidConfig("flush_interval must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClaimError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Lifecycle of a job's claim manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Accepting receipts.
    Open,
    /// Job ended; flushing the last claim.
    Finalizing,
    /// Done; receipts are rejected.
    Closed,
}

/// Synchronous receipt ledger for one job.
#[derive(Debug)]
pub struct ClaimBook {
    job_id: JobId,
    max_batch: usize,
    claim_work: bool,
    buffer: Vec<TranscodeReceipt>,
    last_seq: Option<u64>,
    state: ClaimState,
    accepted: u64,
    rejected: u64,
    unclaimed: u64,
}

impl ClaimBook {
    /// Empty ledger. With `claim_work` unset, cuts discard receipts instead of
    /// producing claims.
    pub fn new(job_id: JobId, max_batch: usize, claim_work: bool) -> Self {
        Self {
            job_id,
            max_batch: max_batch.max(1),
            claim_work,
            buffer: Vec::new(),
            last_seq: None,
            state: ClaimState::Open,
            accepted: 0,
            rejected: 0,
            unclaimed: 0,
        }
    }

    /// Accept a receipt whose sequence number exceeds every earlier one.
    pub fn add(&mut self, receipt: TranscodeReceipt) -> ClaimResult<()> {
        if self.state != ClaimState::Open {
            self.rejected += 1;
            return Err(ClaimError::Closed);
        }
        if let Some(last) = self.last_seq {
            if receipt.seq <= last {
                self.rejected += 1;
                return Err(ClaimError::OutOfOrder {
                    seq: receipt.seq,
                    last,
                });
            }
        }
        self.last_seq = Some(receipt.seq);
        self.buffer.push(receipt);
        self.accepted += 1;
        Ok(())
    }

    /// Whether the buffer holds a full batch.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_batch
    }

    /// Receipts waiting for the next cut.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Move buffered receipts into claims, split at sequence gaps and capped
    /// at `max_batch` receipts each.
    pub fn cut(&mut self) -> Vec<Claim> {
        let receipts = std::mem::take(&mut self.buffer);
        if !self.claim_work {
            self.unclaimed += receipts.len() as u64;
            return Vec::new();
        }

        let mut claims = Vec::new();
        let mut run: Vec<TranscodeReceipt> = Vec::with_capacity(self.max_batch);
        for receipt in receipts {
            let contiguous = run
                .last()
                .map_or(true, |prev| prev.seq.checked_add(1) == Some(receipt.seq));
            if !contiguous || run.len() == self.max_batch {
                claims.extend(Claim::from_receipts(self.job_id.clone(), &run));
                run.clear();
            }
            run.push(receipt);
        }
        claims.extend(Claim::from_receipts(self.job_id.clone(), &run));
        claims
    }

    /// Stop accepting receipts and cut what remains.
    pub fn begin_finalize(&mut self) -> Vec<Claim> {
        if self.state == ClaimState::Open {
            self.state = ClaimState::Finalizing;
        }
        self.cut()
    }

    /// Mark the ledger closed.
    pub fn close(&mut self) {
        self.state = ClaimState::Closed;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClaimState {
        self.state
    }

    fn summary(&self, claims: Vec<Claim>) -> ClaimSummary {
        ClaimSummary {
            job_id: self.job_id.clone(),
            accepted: self.accepted,
            rejected: self.rejected,
            unclaimed: self.unclaimed,
            claims,
        }
    }
}

/// Final account of a job's receipts and claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSummary {
    /// Job the summary belongs to.
    pub job_id: JobId,
    /// Receipts accepted.
    pub accepted: u64,
    /// Receipts rejected.
    pub rejected: u64,
    /// Accepted receipts never claimed because claiming was disabled.
    pub unclaimed: u64,
    /// Every claim cut, in submission order, with its final status.
    pub claims: Vec<Claim>,
}

impl ClaimSummary {
    /// Claims the chain accepted.
    pub fn submitted(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| matches!(c.status, ClaimStatus::Submitted { .. }))
            .count()
    }

    /// Claims given up on.
    pub fn failed(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| matches!(c.status, ClaimStatus::Failed { .. }))
            .count()
    }
}

enum Command {
    Add(TranscodeReceipt, oneshot::Sender<ClaimResult<()>>),
    Finish(oneshot::Sender<ClaimSummary>),
}

/// Handle to a job's claim manager task.
///
/// The task owns a [`ClaimBook`] and a submitter. Receipts go in through
/// [`add_receipt`](Self::add_receipt); contiguous ranges are cut into claims
/// on a full batch, on every flush tick and at [`finish`](Self::finish).
/// Clones share the same task.
#[derive(Clone)]
pub struct ClaimManager {
    job_id: JobId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ClaimState>,
}

impl ClaimManager {
    /// Spawn the manager for `job_id`.
    ///
    /// # Arguments
    /// * `job_id` - Job whose receipts are claimed
    /// * `claim_work` - When false, receipts are counted but never submitted
    /// * `chain` - Chain the claims are submitted to
    /// * `config` - Batch size, flush cadence and submit retries
    /// * `span` - Span the manager task runs under
    ///
    /// # Errors
    /// [`ClaimError::InvalidConfig`] if `config` fails validation.
    pub fn spawn(
        job_id: JobId,
        claim_work: bool,
        chain: Arc<dyn ChainClient>,
        config: ClaimConfig,
        span: Span,
    ) -> ClaimResult<Self> {
        config.validate()?;
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state) = watch::channel(ClaimState::Open);
        let book = ClaimBook::new(job_id.clone(), config.max_batch, claim_work);

        tokio::spawn(run_manager(book, chain, config, inbox, state_tx).instrument(span));
        Ok(Self {
            job_id,
            commands,
            state,
        })
    }

    /// Job this manager claims for.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClaimState {
        *self.state.borrow()
    }

    /// Offer a receipt. Out-of-order receipts and receipts after the job
    /// ended are rejected.
    pub async fn add_receipt(&self, receipt: TranscodeReceipt) -> ClaimResult<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Add(receipt, reply))
            .await
            .map_err(|_| ClaimError::Closed)?;
        response.await.map_err(|_| ClaimError::Closed)?
    }

    /// Signal that the job ended and wait until the manager is closed.
    ///
    /// Pending receipts are cut and submitted before the summary comes back.
    ///
    /// # Errors
    /// [`ClaimError::Closed`] if the manager task is already gone.
    pub async fn finish(&self) -> ClaimResult<ClaimSummary> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Finish(reply))
            .await
            .map_err(|_| ClaimError::Closed)?;
        response.await.map_err(|_| ClaimError::Closed)
    }
}

fn dispatch(queue: &mpsc::UnboundedSender<Claim>, claims: Vec<Claim>) {
    for claim in claims {
        info!(start = claim.start, end = claim.end, digest = %claim.digest, "Cut claim");
        if queue.send(claim).is_err() {
            error!("Claim submitter gone, dropping claim");
        }
    }
}

async fn run_manager(
    mut book: ClaimBook,
    chain: Arc<dyn ChainClient>,
    config: ClaimConfig,
    mut inbox: mpsc::Receiver<Command>,
    state: watch::Sender<ClaimState>,
) {
    let (queue, pending) = mpsc::unbounded_channel();
    let submitter = tokio::spawn(
        submit_claims(chain, config.retry, config.submit_timeout, pending).in_current_span(),
    );

    let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reply = loop {
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Add(receipt, reply)) => {
                    let seq = receipt.seq;
                    let result = book.add(receipt);
                    if let Err(e) = &result {
                        warn!(seq, error = %e, "Rejected receipt");
                    }
                    let _ = reply.send(result);
                    if book.is_full() {
                        dispatch(&queue, book.cut());
                    }
                }
                Some(Command::Finish(reply)) => break Some(reply),
                None => break None,
            },
            _ = ticker.tick() => {
                if book.buffered() > 0 {
                    dispatch(&queue, book.cut());
                }
            }
        }
    };

    state.send_replace(ClaimState::Finalizing);
    dispatch(&queue, book.begin_finalize());
    drop(queue);

    let claims = match submitter.await {
        Ok(claims) => claims,
        Err(e) => {
            error!(error = %e, "Claim submitter task failed");
            Vec::new()
        }
    };
    book.close();
    state.send_replace(ClaimState::Closed);

    let summary = book.summary(claims);
    info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        submitted = summary.submitted(),
        failed = summary.failed(),
        "Claim manager closed"
    );
    if let Some(reply) = reply {
        let _ = reply.send(summary);
    }
}

async fn submit_claims(
    chain: Arc<dyn ChainClient>,
    retry: RetryPolicy,
    submit_timeout: Duration,
    mut pending: mpsc::UnboundedReceiver<Claim>,
) -> Vec<Claim> {
    let mut done = Vec::new();
    while let Some(mut claim) = pending.recv().await {
        let (result, attempts) = retry_transient(&retry, || {
            with_timeout(submit_timeout, chain.submit_claim(&claim))
        })
        .await;

        claim.status = match result {
            Ok(tx) => {
                info!(start = claim.start, end = claim.end, attempts, tx = %tx, "Claim submitted");
                ClaimStatus::Submitted { attempts }
            }
            Err(e) => {
                error!(start = claim.start, end = claim.end, attempts, error = %e, "Claim failed, discarding range");
                ClaimStatus::Failed {
                    attempts,
                    reason: e.to_string(),
                }
            }
        };
        done.push(claim);
    }
    done
}
