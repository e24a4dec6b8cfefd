//! Transcoder job service.
//!
//! Wires the listener, the orchestrator, per-job claim managers and the
//! reward manager together. Requests are consumed continuously; each new job
//! runs on its own task, at most `max_concurrent_jobs` at a time. Requests
//! over the cap wait in the listener channel.

use crate::cancel::{cancel_pair, cancelled, CancelHandle};
use crate::claim::{ClaimConfig, ClaimManager};
use crate::error::{JobsError, JobsResult, TranscodeError};
use crate::listener::{JobListener, ListenerConfig, ListenerStats};
use crate::orchestrator::TranscodeOrchestrator;
use crate::playlist::PlaylistUpdate;
use crate::reward::{RewardConfig, RewardManager, RewardStats};
use crate::transcoder::Transcoder;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument, Span};
use vtn_chain::{with_timeout, ChainClient};
use vtn_net::VideoNetwork;
use vtn_types::{JobId, StreamId, TranscodeRequest};

/// Configuration for [`JobService`].
#[derive(Debug, Clone)]
pub struct JobServiceConfig {
    /// Event listener settings.
    pub listener: ListenerConfig,
    /// Per-job claim manager settings.
    pub claims: ClaimConfig,
    /// Reward loop settings.
    pub rewards: RewardConfig,
    /// Jobs allowed to run at once.
    pub max_concurrent_jobs: usize,
    /// Capacity of the listener's request channel.
    pub request_buffer: usize,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            claims: ClaimConfig::default(),
            rewards: RewardConfig::default(),
            max_concurrent_jobs: 4,
            request_buffer: 16,
        }
    }
}

impl JobServiceConfig {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> JobsResult<()> {
        self.listener.timeouts.validate()?;
        self.claims.validate()?;
        if self.rewards.interval.is_zero() {
            return Err(crate::error::RewardError::ZeroInterval.into());
        }
        if self.max_concurrent_jobs == 0 {
            return Err(JobsError::Config("max_concurrent_jobs must be at least 1".into()));
        }
        Ok(())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished; derived streams in requested-profile order.
    Completed(Vec<StreamId>),
    /// Cancelled before the source ended.
    Cancelled,
    /// Failed with the given reason.
    Failed(String),
}

/// Record of one finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Job that ran.
    pub job_id: JobId,
    /// How it ended.
    pub outcome: JobOutcome,
}

#[derive(Default)]
struct RegistryState {
    seen: HashSet<JobId>,
    active: HashMap<JobId, CancelHandle>,
    reports: Vec<JobReport>,
}

/// Job bookkeeping shared between the dispatcher and the handle.
#[derive(Default)]
struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit a job. Returns its cancel signal, or `None` if already seen.
    fn admit(&self, job_id: &JobId) -> Option<watch::Receiver<bool>> {
        let mut state = self.lock();
        if !state.seen.insert(job_id.clone()) {
            return None;
        }
        let (handle, rx) = cancel_pair();
        state.active.insert(job_id.clone(), handle);
        Some(rx)
    }

    fn cancel(&self, job_id: &JobId) -> bool {
        match self.lock().active.get(job_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for handle in self.lock().active.values() {
            handle.cancel();
        }
    }

    fn release(&self, job_id: &JobId, outcome: Option<JobOutcome>) {
        let mut state = self.lock();
        state.active.remove(job_id);
        if let Some(outcome) = outcome {
            state.reports.push(JobReport {
                job_id: job_id.clone(),
                outcome,
            });
        }
    }
}

/// Removes a job from the registry however its task ends.
struct ActiveEntry {
    registry: Arc<Registry>,
    job_id: JobId,
    outcome: Option<JobOutcome>,
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        self.registry.release(&self.job_id, self.outcome.take());
    }
}

/// Job pipeline for a transcoder node.
pub struct JobService {
    chain: Arc<dyn ChainClient>,
    network: Arc<dyn VideoNetwork>,
    transcoder: Arc<dyn Transcoder>,
    config: JobServiceConfig,
    playlists: Option<mpsc::UnboundedSender<PlaylistUpdate>>,
    span: Span,
}

impl JobService {
    /// Create a service; the configuration is validated here.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        network: Arc<dyn VideoNetwork>,
        transcoder: Arc<dyn Transcoder>,
        config: JobServiceConfig,
    ) -> JobsResult<Self> {
        config.validate()?;
        Ok(Self {
            chain,
            network,
            transcoder,
            config,
            playlists: None,
            span: tracing::info_span!("job_service"),
        })
    }

    /// Forward playlist updates of every job to `sink`.
    pub fn with_playlist_sink(mut self, sink: mpsc::UnboundedSender<PlaylistUpdate>) -> Self {
        self.playlists = Some(sink);
        self
    }

    /// Run under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Check eligibility once, then start the reward loop, the listener and
    /// the job dispatcher.
    ///
    /// An ineligible transcoder still starts; the eligibility check is only
    /// logged.
    ///
    /// # Returns
    /// Handle for inspecting, cancelling and shutting down running jobs.
    ///
    /// # Errors
    /// [`JobsError::Reward`] if the reward configuration is rejected.
    pub async fn start(self) -> JobsResult<JobServiceHandle> {
        self.log_eligibility().instrument(self.span.clone()).await;

        let (cancel, _) = cancel_pair();

        let rewards = RewardManager::new(Arc::clone(&self.chain), self.config.rewards.clone())?
            .with_span(tracing::info_span!(parent: &self.span, "rewards"));
        let reward_stats = rewards.stats();
        let reward_task = rewards.spawn(cancel.subscribe());

        let listener = JobListener::new(Arc::clone(&self.chain), self.config.listener.clone())
            .with_span(tracing::info_span!(parent: &self.span, "listener"));
        let listener_stats = listener.stats();
        let (requests, listener_task) =
            listener.listen(self.config.request_buffer, cancel.subscribe());

        let mut orchestrator =
            TranscodeOrchestrator::new(Arc::clone(&self.network), Arc::clone(&self.transcoder))
                .with_span(self.span.clone());
        if let Some(sink) = self.playlists.clone() {
            orchestrator = orchestrator.with_playlist_sink(sink);
        }

        let registry = Arc::new(Registry::default());
        let dispatcher = Dispatcher {
            chain: Arc::clone(&self.chain),
            orchestrator,
            claims: self.config.claims.clone(),
            max_jobs: self.config.max_concurrent_jobs,
            registry: Arc::clone(&registry),
            span: self.span.clone(),
        };
        let dispatch_task = tokio::spawn(
            dispatcher
                .run(requests, cancel.subscribe())
                .instrument(self.span.clone()),
        );

        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Job service started"
        );
        Ok(JobServiceHandle {
            cancel,
            registry,
            listener_stats,
            reward_stats,
            tasks: vec![dispatch_task, listener_task, reward_task],
        })
    }

    async fn log_eligibility(&self) {
        let rpc = self.config.listener.timeouts.rpc;
        let account = self.chain.account();
        match with_timeout(rpc, self.chain.is_active_transcoder()).await {
            Ok(true) => {
                let stake = with_timeout(rpc, self.chain.transcoder_stake()).await;
                match stake {
                    Ok(stake) => info!(account, stake, "Node is an active transcoder"),
                    Err(e) => info!(account, error = %e, "Node is an active transcoder, stake unknown"),
                }
            }
            Ok(false) => warn!(account, "Node is not an active transcoder, starting anyway"),
            Err(e) => warn!(account, error = %e, "Eligibility check failed, starting anyway"),
        }
    }
}

struct Dispatcher {
    chain: Arc<dyn ChainClient>,
    orchestrator: TranscodeOrchestrator,
    claims: ClaimConfig,
    max_jobs: usize,
    registry: Arc<Registry>,
    span: Span,
}

impl Dispatcher {
    async fn run(
        self,
        mut requests: mpsc::Receiver<TranscodeRequest>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut jobs = JoinSet::new();

        loop {
            if jobs.len() >= self.max_jobs {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    Some(joined) = jobs.join_next() => reap(joined),
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => reap(joined),
                request = requests.recv() => match request {
                    Some(request) => self.dispatch(request, &mut jobs),
                    None => {
                        info!("Listener closed, no more jobs");
                        break;
                    }
                },
            }
        }

        if !jobs.is_empty() {
            info!(active = jobs.len(), "Cancelling active jobs");
        }
        self.registry.cancel_all();
        while let Some(joined) = jobs.join_next().await {
            reap(joined);
        }
        info!("Job dispatcher stopped");
    }

    fn dispatch(&self, request: TranscodeRequest, jobs: &mut JoinSet<()>) {
        let job_id = request.job_id.clone();
        let Some(cancel) = self.registry.admit(&job_id) else {
            debug!(job_id = %job_id, "Duplicate job, ignoring");
            return;
        };

        let span = tracing::info_span!(parent: &self.span, "job_task", job_id = %job_id);
        let mut entry = ActiveEntry {
            registry: Arc::clone(&self.registry),
            job_id: job_id.clone(),
            outcome: None,
        };
        let chain = Arc::clone(&self.chain);
        let orchestrator = self.orchestrator.clone().with_span(span.clone());
        let config = self.claims.clone();

        jobs.spawn(
            async move {
                let claims =
                    match ClaimManager::spawn(job_id, request.claim, chain, config, Span::current()) {
                        Ok(claims) => claims,
                        Err(e) => {
                            error!(error = %e, "Could not start claim manager");
                            entry.outcome = Some(JobOutcome::Failed(e.to_string()));
                            return;
                        }
                    };

                let outcome = match orchestrator.transcode(&request, &claims, cancel).await {
                    Ok(streams) => {
                        info!(streams = streams.len(), "Job completed");
                        JobOutcome::Completed(streams)
                    }
                    Err(TranscodeError::Cancelled) => JobOutcome::Cancelled,
                    Err(e) => {
                        error!(error = %e, "Job failed");
                        JobOutcome::Failed(e.to_string())
                    }
                };
                entry.outcome = Some(outcome);
            }
            .instrument(span),
        );
    }
}

fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job task aborted");
    }
}

/// Control handle for a running [`JobService`].
pub struct JobServiceHandle {
    cancel: CancelHandle,
    registry: Arc<Registry>,
    listener_stats: Arc<ListenerStats>,
    reward_stats: Arc<RewardStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl JobServiceHandle {
    /// Jobs currently running.
    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.registry.lock().active.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    /// Cancel one job. Returns false if it is not running.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        self.registry.cancel(job_id)
    }

    /// Finished jobs, in completion order.
    pub fn reports(&self) -> Vec<JobReport> {
        self.registry.lock().reports.clone()
    }

    /// Listener counters.
    pub fn listener_stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.listener_stats)
    }

    /// Reward loop counters.
    pub fn reward_stats(&self) -> Arc<RewardStats> {
        Arc::clone(&self.reward_stats)
    }

    /// Stop accepting work, cancel every job and wait for all tasks.
    pub async fn shutdown(self) -> JobsResult<()> {
        info!("Shutting down job service");
        self.cancel.cancel();
        let mut failure = None;
        for task in self.tasks {
            if let Err(e) = task.await {
                failure.get_or_insert(JobsError::Task(e.to_string()));
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoder::FakeTranscoder;
    use std::time::Duration;
    use vtn_chain::MockChainClient;
    use vtn_net::{BroadcasterGuard, MemoryHub};

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn service(chain: &Arc<MockChainClient>, hub: &MemoryHub, max_jobs: usize) -> JobService {
        JobService::new(
            Arc::clone(chain) as Arc<dyn ChainClient>,
            Arc::new(hub.join("worker")),
            Arc::new(FakeTranscoder::new()),
            JobServiceConfig {
                max_concurrent_jobs: max_jobs,
                ..JobServiceConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = JobServiceConfig::default();
        assert!(config.validate().is_ok());
        config.max_concurrent_jobs = 0;
        assert!(matches!(config.validate(), Err(JobsError::Config(_))));
    }

    #[test]
    fn test_registry_dedups() {
        let registry = Registry::default();
        let id = JobId::from(9u64);
        assert!(registry.admit(&id).is_some());
        assert!(registry.admit(&id).is_none());
        registry.release(&id, None);
        assert!(registry.admit(&id).is_none());
    }

    #[tokio::test]
    async fn test_cap_limits_running_jobs() {
        let hub = MemoryHub::new();
        let origin = hub.join("origin");
        let chain = Arc::new(MockChainClient::new("worker").with_active(true));

        // Three live sources that never end.
        let mut feeds = Vec::new();
        for n in 0..3u64 {
            let stream = StreamId::new("origin", format!("feed{n}")).unwrap();
            let mut feed = BroadcasterGuard::acquire(&origin, stream.clone()).unwrap();
            feed.broadcast(0, b"seg".to_vec()).await.unwrap();
            feeds.push(feed);
            let log = chain.add_job(&stream, "P144p30fps16x9", JobId::from(n), "bcast", 1);
            chain.emit(log);
        }

        let handle = service(&chain, &hub, 2).start().await.unwrap();
        eventually(|| handle.active_jobs().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.active_jobs().len(), 2);

        let first = handle.active_jobs()[0].clone();
        assert!(handle.cancel_job(&first));
        eventually(|| handle.reports().len() == 1).await;
        assert_eq!(handle.reports()[0].outcome, JobOutcome::Cancelled);
        eventually(|| handle.active_jobs().len() == 2).await;

        handle.shutdown().await.unwrap();
        drop(feeds);
    }
}
