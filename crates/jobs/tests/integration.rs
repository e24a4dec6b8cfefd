//! End-to-end job pipeline over the mock chain and the in-memory overlay.

use std::sync::Arc;
use std::time::Duration;
use vtn_chain::{ChainClient, JobLog, MockChainClient, TxHash};
use vtn_jobs::{
    FakeTranscoder, JobOutcome, JobService, JobServiceConfig, JobServiceHandle, ListenerConfig,
    RetryPolicy, Transcoder,
};
use vtn_net::{BroadcasterGuard, MemoryHub, MemoryNetwork};
use vtn_types::{lookup_profile, JobId, StreamId};

struct Harness {
    hub: MemoryHub,
    origin: MemoryNetwork,
    chain: Arc<MockChainClient>,
    transcoder: Arc<FakeTranscoder>,
}

impl Harness {
    fn new(transcoder: FakeTranscoder) -> Self {
        let hub = MemoryHub::new();
        let origin = hub.join("12D3KooWOrigin");
        Self {
            hub,
            origin,
            chain: Arc::new(MockChainClient::new("transcoder").with_active(true).with_stake(10)),
            transcoder: Arc::new(transcoder),
        }
    }

    /// Publish a complete source stream of `segments` segments.
    async fn publish(&self, suffix: &str, segments: u64) -> StreamId {
        let stream = StreamId::new("12D3KooWOrigin", suffix).unwrap();
        let mut out = BroadcasterGuard::acquire(&self.origin, stream.clone()).unwrap();
        for seq in 0..segments {
            out.broadcast(seq, vec![seq as u8; 32]).await.unwrap();
        }
        out.finish().unwrap();
        stream
    }

    async fn start(&self) -> JobServiceHandle {
        let config = JobServiceConfig {
            listener: ListenerConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(40),
                },
                reconnect_interval: Duration::from_millis(50),
                ..ListenerConfig::default()
            },
            ..JobServiceConfig::default()
        };
        JobService::new(
            Arc::clone(&self.chain) as Arc<dyn ChainClient>,
            Arc::new(self.hub.join("transcoder")),
            Arc::clone(&self.transcoder) as Arc<dyn Transcoder>,
            config,
        )
        .unwrap()
        .start()
        .await
        .unwrap()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_assigned_job_is_transcoded_and_notified() {
    let h = Harness::new(FakeTranscoder::new());
    let source = h.publish("feed", 5).await;
    let log = h
        .chain
        .add_job(&source, "P240p30fps16x9", JobId::from(1u64), "broadcaster", 3);
    h.chain.emit(log);

    let service = h.start().await;
    eventually(|| service.reports().len() == 1).await;

    let reports = service.reports();
    let report = &reports[0];
    assert_eq!(report.job_id, JobId::from(1u64));
    let JobOutcome::Completed(streams) = &report.outcome else {
        panic!("job did not complete: {:?}", report.outcome);
    };
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].node_id(), "transcoder");

    let notes = h.hub.notifications_for("12D3KooWOrigin");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].origin, source);
    assert_eq!(
        notes[0].result.get(&streams[0]),
        lookup_profile("P240p30fps16x9").as_ref()
    );

    let claims = h.chain.claims();
    assert_eq!(claims.len(), 1);
    assert_eq!((claims[0].start, claims[0].end), (0, 4));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_profile_tag_never_reaches_orchestrator() {
    let h = Harness::new(FakeTranscoder::new());
    let source = h.publish("feed", 2).await;
    let log = h.chain.add_job(&source, "unknown", JobId::from(2u64), "broadcaster", 3);
    h.chain.emit(log);

    let service = h.start().await;
    let stats = service.listener_stats();
    eventually(|| stats.parse_discards() == 1).await;

    assert_eq!(stats.emitted(), 0);
    assert!(service.reports().is_empty());
    assert_eq!(h.transcoder.calls(), 0);
    assert_eq!(h.hub.subscriber_count(&source), 0);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_redelivered_job_runs_once() {
    let h = Harness::new(FakeTranscoder::new());
    let source = h.publish("feed", 3).await;
    let log = h
        .chain
        .add_job(&source, "P144p30fps16x9", JobId::from(3u64), "broadcaster", 1);
    h.chain.emit(log.clone());
    h.chain.emit(log);

    let service = h.start().await;
    let stats = service.listener_stats();
    eventually(|| stats.emitted() == 2 && service.reports().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(service.reports().len(), 1);
    assert_eq!(h.hub.notifications_for("12D3KooWOrigin").len(), 1);
    assert_eq!(h.chain.claims().len(), 1);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_surviving_profile_is_still_notified() {
    let h = Harness::new(FakeTranscoder::new().fail_always("P360p30fps16x9"));
    let source = h.publish("feed", 3).await;
    let log = h.chain.add_job(
        &source,
        "P240p30fps16x9,P360p30fps16x9",
        JobId::from(4u64),
        "broadcaster",
        1,
    );
    h.chain.emit(log);

    let service = h.start().await;
    eventually(|| service.reports().len() == 1).await;

    let reports = service.reports();
    let JobOutcome::Completed(streams) = &reports[0].outcome else {
        panic!("job did not complete");
    };
    assert_eq!(streams.len(), 1);
    let notes = h.hub.notifications_for("12D3KooWOrigin");
    assert_eq!(notes[0].result.len(), 1);
    assert_eq!(
        notes[0].result.get(&streams[0]).map(|p| p.name),
        Some("P240p30fps16x9")
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_all_profiles_failing_fails_job_without_notify() {
    let h = Harness::new(
        FakeTranscoder::new()
            .fail_always("P240p30fps16x9")
            .fail_always("P360p30fps16x9"),
    );
    let source = h.publish("feed", 3).await;
    let log = h.chain.add_job(
        &source,
        "P240p30fps16x9,P360p30fps16x9",
        JobId::from(5u64),
        "broadcaster",
        1,
    );
    h.chain.emit(log);

    let service = h.start().await;
    eventually(|| service.reports().len() == 1).await;

    assert!(matches!(service.reports()[0].outcome, JobOutcome::Failed(_)));
    assert!(h.hub.notifications_for("12D3KooWOrigin").is_empty());
    assert!(h.chain.claims().is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_lookup_failure_emits_once() {
    let h = Harness::new(FakeTranscoder::new());
    let source = h.publish("feed", 1).await;
    let log = h
        .chain
        .add_job(&source, "P144p30fps16x9", JobId::from(6u64), "broadcaster", 1);
    h.chain.fail_next_tx_lookups(2);
    h.chain.emit(log);

    let service = h.start().await;
    let stats = service.listener_stats();
    eventually(|| service.reports().len() == 1).await;

    assert_eq!(stats.emitted(), 1);
    assert_eq!(stats.chain_discards(), 0);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_permanent_chain_failure_is_discarded() {
    let h = Harness::new(FakeTranscoder::new());
    h.chain.emit(JobLog {
        tx_hash: TxHash([0xEE; 32]),
        block_number: 1,
        job_id: JobId::from(7u64),
        broadcaster: "broadcaster".into(),
        transcoder: "transcoder".into(),
    });

    let service = h.start().await;
    let stats = service.listener_stats();
    eventually(|| stats.chain_discards() == 1).await;

    assert_eq!(stats.emitted(), 0);
    assert!(service.reports().is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_active_job_can_be_cancelled() {
    let h = Harness::new(FakeTranscoder::new());
    let source = StreamId::new("12D3KooWOrigin", "live").unwrap();
    let mut live = BroadcasterGuard::acquire(&h.origin, source.clone()).unwrap();
    live.broadcast(0, b"first".to_vec()).await.unwrap();
    let log = h
        .chain
        .add_job(&source, "P144p30fps16x9", JobId::from(8u64), "broadcaster", 1);
    h.chain.emit(log);

    let service = h.start().await;
    eventually(|| service.active_jobs() == vec![JobId::from(8u64)]).await;
    eventually(|| h.transcoder.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(service.cancel_job(&JobId::from(8u64)));
    eventually(|| service.reports().len() == 1).await;

    assert_eq!(service.reports()[0].outcome, JobOutcome::Cancelled);
    assert!(service.active_jobs().is_empty());
    assert_eq!(h.hub.subscriber_count(&source), 0);
    assert!(h.hub.notifications_for("12D3KooWOrigin").is_empty());
    // Work done before cancellation is still claimed.
    assert_eq!(h.chain.claims().len(), 1);

    service.shutdown().await.unwrap();
    drop(live);
}
