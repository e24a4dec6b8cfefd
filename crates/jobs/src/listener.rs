//! Job event listener.
//!
//! Subscribes to job-assignment events for this node and turns each into a
//! [`TranscodeRequest`]. Events are resolved concurrently, one task per
//! event, so a slow or failing event never holds up the next one.

use crate::cancel::cancelled;
use crate::error::{ListenerError, ListenerResult};
use crate::retry::{retry_transient, RetryPolicy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument, Span};
use vtn_chain::{parse_job_payload, with_timeout, ChainClient, ChainError, ChainTimeouts, JobLog};
use vtn_types::{parse_profile_tag, JobId, TranscodeRequest};

/// Configuration for the job event listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Chain timeout tiers.
    pub timeouts: ChainTimeouts,
    /// Retry policy for transient lookup failures.
    pub retry: RetryPolicy,
    /// Delay before resubscribing after the subscription fails or ends.
    pub reconnect_interval: Duration,
    /// Whether emitted requests claim their work on chain.
    pub claim_work: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            timeouts: ChainTimeouts::default(),
            retry: RetryPolicy::default(),
            reconnect_interval: Duration::from_secs(5),
            claim_work: true,
        }
    }
}

/// Counters describing what the listener has done so far.
#[derive(Debug, Default)]
pub struct ListenerStats {
    received: AtomicU64,
    emitted: AtomicU64,
    parse_discards: AtomicU64,
    chain_discards: AtomicU64,
    ignored: AtomicU64,
}

impl ListenerStats {
    /// Events delivered by the subscription.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Requests emitted.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events discarded for a malformed payload or unknown profile.
    pub fn parse_discards(&self) -> u64 {
        self.parse_discards.load(Ordering::Relaxed)
    }

    /// Events discarded because chain lookups failed.
    pub fn chain_discards(&self) -> u64 {
        self.chain_discards.load(Ordering::Relaxed)
    }

    /// Events for jobs assigned elsewhere.
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Events that have finished resolving one way or another.
    pub fn settled(&self) -> u64 {
        self.emitted() + self.parse_discards() + self.chain_discards() + self.ignored()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Listens for job-assignment events and emits transcode requests.
pub struct JobListener {
    chain: Arc<dyn ChainClient>,
    config: Arc<ListenerConfig>,
    stats: Arc<ListenerStats>,
    span: Span,
}

impl JobListener {
    /// Create a listener over `chain`.
    pub fn new(chain: Arc<dyn ChainClient>, config: ListenerConfig) -> Self {
        Self {
            chain,
            config: Arc::new(config),
            stats: Arc::new(ListenerStats::default()),
            span: tracing::info_span!("job_listener"),
        }
    }

    /// Run under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Shared counters; remain readable after the listener stops.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the listener and return the request stream.
    pub fn listen(
        self,
        buffer: usize,
        cancel: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<TranscodeRequest>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    /// Run until cancelled or until `sink` is dropped.
    pub async fn run(self, sink: mpsc::Sender<TranscodeRequest>, mut cancel: watch::Receiver<bool>) {
        let span = self.span.clone();
        async move {
            info!(account = %self.chain.account(), "Starting job event listener");
            let mut tasks = JoinSet::new();

            'subscribe: loop {
                if *cancel.borrow() {
                    break;
                }

                let events = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    result = with_timeout(self.config.timeouts.rpc, self.chain.subscribe_job_events()) => result,
                };

                match events {
                    Ok(mut events) => loop {
                        tokio::select! {
                            biased;
                            _ = cancelled(&mut cancel) => break 'subscribe,
                            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                                if !self.settle(joined, &sink).await {
                                    break 'subscribe;
                                }
                            }
                            event = events.recv() => match event {
                                Some(log) => self.spawn_resolution(&mut tasks, log),
                                None => {
                                    warn!("Job event subscription closed, reconnecting...");
                                    break;
                                }
                            },
                        }
                    },
                    Err(e) => {
                        warn!(error = %ListenerError::Subscription(e), "Job event subscription failed, reconnecting...");
                    }
                }

                // Keep settling in-flight events while waiting to resubscribe.
                let reconnect = tokio::time::sleep(self.config.reconnect_interval);
                tokio::pin!(reconnect);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => break 'subscribe,
                        _ = &mut reconnect => break,
                        Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                            if !self.settle(joined, &sink).await {
                                break 'subscribe;
                            }
                        }
                    }
                }
            }

            // In-flight resolutions get the event budget to finish.
            if !tasks.is_empty() {
                let budget = self.config.timeouts.event;
                let drain = async {
                    while let Some(joined) = tasks.join_next().await {
                        if !self.settle(joined, &sink).await {
                            break;
                        }
                    }
                };
                if tokio::time::timeout(budget, drain).await.is_err() {
                    warn!(pending = tasks.len(), "Abandoning unresolved job events");
                }
            }
            tasks.abort_all();
            info!(
                received = self.stats.received(),
                emitted = self.stats.emitted(),
                "Job event listener stopped"
            );
        }
        .instrument(span)
        .await
    }

    /// Resolve one event into a request without emitting it.
    pub async fn resolve(&self, log: &JobLog) -> ListenerResult<TranscodeRequest> {
        resolve_event(self.chain.as_ref(), &self.config, log).await
    }

    fn spawn_resolution(
        &self,
        tasks: &mut JoinSet<(JobId, ListenerResult<TranscodeRequest>)>,
        log: JobLog,
    ) {
        ListenerStats::bump(&self.stats.received);
        debug!(job_id = %log.job_id, tx = %log.tx_hash, "Job event received");

        let chain = Arc::clone(&self.chain);
        let config = Arc::clone(&self.config);
        tasks.spawn(
            async move {
                let result = resolve_event(chain.as_ref(), &config, &log).await;
                (log.job_id, result)
            }
            .in_current_span(),
        );
    }

    /// Account for one finished resolution. Returns false once the request
    /// sink is gone.
    async fn settle(
        &self,
        joined: Result<(JobId, ListenerResult<TranscodeRequest>), tokio::task::JoinError>,
        sink: &mpsc::Sender<TranscodeRequest>,
    ) -> bool {
        let (job_id, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Event resolution task failed");
                ListenerStats::bump(&self.stats.chain_discards);
                return true;
            }
        };

        match result {
            Ok(request) => {
                info!(
                    job_id = %job_id,
                    source = %request.source,
                    profiles = request.profiles.len(),
                    "Emitting transcode request"
                );
                ListenerStats::bump(&self.stats.emitted);
                if sink.send(request).await.is_err() {
                    info!("Request consumer gone, stopping listener");
                    return false;
                }
            }
            Err(ListenerError::NotAssigned(transcoder)) => {
                debug!(job_id = %job_id, transcoder = %transcoder, "Ignoring job for another transcoder");
                ListenerStats::bump(&self.stats.ignored);
            }
            Err(e) if e.is_parse() => {
                error!(job_id = %job_id, error = %e, "Discarding job event");
                ListenerStats::bump(&self.stats.parse_discards);
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Discarding job event after chain failure");
                ListenerStats::bump(&self.stats.chain_discards);
            }
        }
        true
    }
}

async fn resolve_event(
    chain: &dyn ChainClient,
    config: &ListenerConfig,
    log: &JobLog,
) -> ListenerResult<TranscodeRequest> {
    if log.transcoder != chain.account() {
        return Err(ListenerError::NotAssigned(log.transcoder.clone()));
    }

    let budget = config.timeouts.event;
    tokio::time::timeout(budget, resolve_within_budget(chain, config, log))
        .await
        .map_err(|_| ListenerError::Chain(ChainError::Timeout(budget)))?
}

async fn resolve_within_budget(
    chain: &dyn ChainClient,
    config: &ListenerConfig,
    log: &JobLog,
) -> ListenerResult<TranscodeRequest> {
    let rpc = config.timeouts.rpc;

    let (tx, _) = retry_transient(&config.retry, || {
        with_timeout(rpc, chain.transaction_by_hash(&log.tx_hash))
    })
    .await;
    let tx = tx.map_err(ListenerError::Chain)?;

    let params = parse_job_payload(&tx.input).map_err(|e| ListenerError::Parse(e.to_string()))?;

    let (info, _) = retry_transient(&config.retry, || with_timeout(rpc, chain.job_info(log))).await;
    let info = info.map_err(ListenerError::Chain)?;

    let profiles = parse_profile_tag(&params.profile_tag)
        .map_err(|e| ListenerError::UnknownProfile(e.to_string()))?;

    TranscodeRequest::new(info.job_id, params.stream_id, profiles, config.claim_work)
        .map(|request| request.with_requester(info.broadcaster, info.max_price_per_segment))
        .map_err(|e| ListenerError::Parse(e.to_string()))
}
