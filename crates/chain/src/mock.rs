//! In-memory chain for tests.
//!
//! Jobs are registered with [`MockChainClient::add_job`], which stores the
//! creating transaction and the job record and returns the event log. Events
//! are delivered with [`MockChainClient::emit`]. Events emitted while nobody
//! is subscribed are queued for the next subscriber.

use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::payload::JobPayload;
use crate::types::{JobInfo, JobLog, Transaction, TxHash};
use async_trait::async_trait;
use parity_scale_codec::Encode;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use vtn_types::{Claim, JobId, StreamId};

const MOCK_EVENT_BUFFER: usize = 1024;

/// How the mock answers reward calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardMode {
    /// Reward succeeds.
    Ok,
    /// Chain reports the round as already rewarded.
    AlreadyRewarded,
    /// Transient RPC failure.
    Fail,
}

struct MockState {
    active: bool,
    stake: u128,
    next_tx: u64,
    block: u64,
    transactions: HashMap<TxHash, Transaction>,
    jobs: HashMap<JobId, JobInfo>,
    pending: Vec<JobLog>,
    subscribers: Vec<mpsc::Sender<JobLog>>,
    subscribe_failures: u32,
    tx_lookup_failures: u32,
    tx_lookup_delays: HashMap<TxHash, Duration>,
    job_info_failures: u32,
    eligibility_failures: u32,
    claim_failures: u32,
    claim_error: Option<ChainError>,
    poisoned_claim_starts: HashSet<u64>,
    reward_mode: RewardMode,
    claims: Vec<Claim>,
    claim_attempts: u32,
    reward_calls: u32,
    eligibility_checks: u32,
    subscriptions: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            active: false,
            stake: 0,
            next_tx: 0,
            block: 0,
            transactions: HashMap::new(),
            jobs: HashMap::new(),
            pending: Vec::new(),
            subscribers: Vec::new(),
            subscribe_failures: 0,
            tx_lookup_failures: 0,
            tx_lookup_delays: HashMap::new(),
            job_info_failures: 0,
            eligibility_failures: 0,
            claim_failures: 0,
            claim_error: None,
            poisoned_claim_starts: HashSet::new(),
            reward_mode: RewardMode::Ok,
            claims: Vec::new(),
            claim_attempts: 0,
            reward_calls: 0,
            eligibility_checks: 0,
            subscriptions: 0,
        }
    }
}

/// Scriptable [`ChainClient`] backed by in-memory state.
pub struct MockChainClient {
    account: String,
    state: Mutex<MockState>,
}

fn injected() -> ChainError {
    ChainError::Rpc("injected failure".into())
}

/// Take one unit from a failure budget.
fn consume(budget: &mut u32) -> bool {
    if *budget > 0 {
        *budget -= 1;
        true
    } else {
        false
    }
}

impl MockChainClient {
    /// Create a mock chain signing as `account`.
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Set active-transcoder status.
    pub fn with_active(self, active: bool) -> Self {
        self.lock().active = active;
        self
    }

    /// Set bonded stake.
    pub fn with_stake(self, stake: u128) -> Self {
        self.lock().stake = stake;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Change active-transcoder status.
    pub fn set_active(&self, active: bool) {
        self.lock().active = active;
    }

    /// Register a job created with `tag` for `stream`, assigned to this
    /// account. Returns the event log; call [`emit`](Self::emit) to deliver it.
    pub fn add_job(
        &self,
        stream: &StreamId,
        tag: &str,
        job_id: JobId,
        broadcaster: &str,
        max_price_per_segment: u128,
    ) -> JobLog {
        let input = JobPayload::new(stream, tag, max_price_per_segment).encode();
        self.add_job_with_input(job_id, broadcaster, max_price_per_segment, input)
    }

    /// Register a job whose creating call carries arbitrary `input` bytes.
    pub fn add_job_with_input(
        &self,
        job_id: JobId,
        broadcaster: &str,
        max_price_per_segment: u128,
        input: Vec<u8>,
    ) -> JobLog {
        let mut state = self.lock();
        state.next_tx += 1;
        state.block += 1;
        let hash = TxHash::of(&state.next_tx.to_le_bytes());

        state.transactions.insert(
            hash,
            Transaction {
                hash,
                from: Some(broadcaster.to_string()),
                input,
            },
        );
        let end_block = state.block + 1000;
        state.jobs.insert(
            job_id.clone(),
            JobInfo {
                job_id: job_id.clone(),
                broadcaster: broadcaster.to_string(),
                transcoder: self.account.clone(),
                max_price_per_segment,
                end_block,
            },
        );

        JobLog {
            tx_hash: hash,
            block_number: state.block,
            job_id,
            broadcaster: broadcaster.to_string(),
            transcoder: self.account.clone(),
        }
    }

    /// Deliver an event to live subscribers, or queue it if there are none.
    pub fn emit(&self, log: JobLog) {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        if state.subscribers.is_empty() {
            state.pending.push(log);
            return;
        }
        state
            .subscribers
            .retain(|tx| tx.try_send(log.clone()).is_ok());
    }

    /// End every live subscription.
    pub fn close_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    /// Fail the next `n` subscription attempts.
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.lock().subscribe_failures = n;
    }

    /// Fail the next `n` transaction lookups with a transient error.
    pub fn fail_next_tx_lookups(&self, n: u32) {
        self.lock().tx_lookup_failures = n;
    }

    /// Hold every lookup of transaction `hash` for `delay` before answering.
    pub fn delay_tx_lookup(&self, hash: TxHash, delay: Duration) {
        self.lock().tx_lookup_delays.insert(hash, delay);
    }

    /// Fail the next `n` job-info lookups with a transient error.
    pub fn fail_next_job_info(&self, n: u32) {
        self.lock().job_info_failures = n;
    }

    /// Fail the next `n` eligibility checks.
    pub fn fail_next_eligibility(&self, n: u32) {
        self.lock().eligibility_failures = n;
    }

    /// Fail the next `n` claim submissions with a transient error.
    pub fn fail_next_claims(&self, n: u32) {
        self.lock().claim_failures = n;
    }

    /// Fail every claim submission with `error` (`None` clears).
    pub fn set_claim_error(&self, error: Option<ChainError>) {
        self.lock().claim_error = error;
    }

    /// Fail, transiently and forever, every claim whose range starts at `start`.
    pub fn fail_claims_starting_at(&self, start: u64) {
        self.lock().poisoned_claim_starts.insert(start);
    }

    /// Choose how reward calls are answered.
    pub fn set_reward_mode(&self, mode: RewardMode) {
        self.lock().reward_mode = mode;
    }

    /// Claims accepted so far, in submission order.
    pub fn claims(&self) -> Vec<Claim> {
        self.lock().claims.clone()
    }

    /// Claim submissions attempted, including failures.
    pub fn claim_attempts(&self) -> u32 {
        self.lock().claim_attempts
    }

    /// Reward calls made.
    pub fn reward_calls(&self) -> u32 {
        self.lock().reward_calls
    }

    /// Eligibility checks made.
    pub fn eligibility_checks(&self) -> u32 {
        self.lock().eligibility_checks
    }

    /// Successful subscriptions made.
    pub fn subscriptions(&self) -> u32 {
        self.lock().subscriptions
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn account(&self) -> &str {
        &self.account
    }

    async fn is_active_transcoder(&self) -> ChainResult<bool> {
        let mut state = self.lock();
        state.eligibility_checks += 1;
        if consume(&mut state.eligibility_failures) {
            return Err(injected());
        }
        Ok(state.active)
    }

    async fn transcoder_stake(&self) -> ChainResult<u128> {
        Ok(self.lock().stake)
    }

    async fn subscribe_job_events(&self) -> ChainResult<mpsc::Receiver<JobLog>> {
        let mut state = self.lock();
        if consume(&mut state.subscribe_failures) {
            return Err(ChainError::Connection("injected failure".into()));
        }
        let (tx, rx) = mpsc::channel(MOCK_EVENT_BUFFER);
        for log in state.pending.drain(..).collect::<Vec<_>>() {
            let _ = tx.try_send(log);
        }
        state.subscribers.push(tx);
        state.subscriptions += 1;
        Ok(rx)
    }

    async fn transaction_by_hash(&self, hash: &TxHash) -> ChainResult<Transaction> {
        let delay = self.lock().tx_lookup_delays.get(hash).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if consume(&mut state.tx_lookup_failures) {
            return Err(injected());
        }
        state
            .transactions
            .get(hash)
            .cloned()
            .ok_or_else(|| ChainError::TransactionNotFound(hash.to_string()))
    }

    async fn job_info(&self, log: &JobLog) -> ChainResult<JobInfo> {
        let mut state = self.lock();
        if consume(&mut state.job_info_failures) {
            return Err(injected());
        }
        state
            .jobs
            .get(&log.job_id)
            .cloned()
            .ok_or_else(|| ChainError::JobNotFound(log.job_id.to_string()))
    }

    async fn submit_claim(&self, claim: &Claim) -> ChainResult<TxHash> {
        let mut state = self.lock();
        state.claim_attempts += 1;
        if let Some(error) = state.claim_error.clone() {
            return Err(error);
        }
        if state.poisoned_claim_starts.contains(&claim.start)
            || consume(&mut state.claim_failures)
        {
            return Err(injected());
        }
        state.claims.push(claim.clone());
        state.next_tx += 1;
        Ok(TxHash::of(&state.next_tx.to_le_bytes()))
    }

    async fn reward(&self) -> ChainResult<TxHash> {
        let mut state = self.lock();
        state.reward_calls += 1;
        match state.reward_mode {
            RewardMode::Ok => {
                state.next_tx += 1;
                Ok(TxHash::of(&state.next_tx.to_le_bytes()))
            }
            RewardMode::AlreadyRewarded => Err(ChainError::AlreadyRewarded),
            RewardMode::Fail => Err(injected()),
        }
    }
}
