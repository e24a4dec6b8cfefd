//! Transcode orchestrator.
//!
//! Drives one job: subscribes to the source stream, transcodes every segment
//! into each live profile, re-broadcasts the output on a derived stream per
//! profile, hands a receipt per segment to the job's claim manager and
//! finally notifies the origin node of the derived streams.

use crate::cancel::cancelled;
use crate::claim::ClaimManager;
use crate::error::TranscodeError;
use crate::playlist::{MediaPlaylist, PlaylistUpdate};
use crate::transcoder::Transcoder;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument, Span};
use vtn_net::{BroadcasterGuard, NetError, Segment, SubscriptionGuard, TranscodeResult, VideoNetwork};
use vtn_types::{Fingerprint, StreamId, TranscodeReceipt, TranscodeRequest, VideoProfile};

/// Output side of one requested profile.
struct ProfileOutput {
    profile: VideoProfile,
    broadcaster: BroadcasterGuard,
    playlist: MediaPlaylist,
    failure: Option<String>,
}

impl ProfileOutput {
    fn stream(&self) -> &StreamId {
        self.broadcaster.stream_id()
    }

    fn is_live(&self) -> bool {
        self.failure.is_none()
    }

    fn fail(&mut self, reason: String) {
        warn!(profile = %self.profile, stream = %self.stream(), reason = %reason, "Profile failed, stopping its stream");
        if let Err(e) = self.broadcaster.finish() {
            warn!(stream = %self.stream(), error = %e, "Failed to finish broadcaster");
        }
        self.failure = Some(reason);
    }
}

/// Resources held while a job runs; released on drop.
struct ActiveJob {
    _source: SubscriptionGuard,
    segments: mpsc::UnboundedReceiver<Segment>,
    outputs: Vec<ProfileOutput>,
}

/// Runs transcode requests against the overlay and a transcoding engine.
#[derive(Clone)]
pub struct TranscodeOrchestrator {
    network: Arc<dyn VideoNetwork>,
    transcoder: Arc<dyn Transcoder>,
    playlists: Option<mpsc::UnboundedSender<PlaylistUpdate>>,
    span: Span,
}

impl TranscodeOrchestrator {
    /// Create an orchestrator.
    pub fn new(network: Arc<dyn VideoNetwork>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            network,
            transcoder,
            playlists: None,
            span: tracing::info_span!("orchestrator"),
        }
    }

    /// Receive a manifest after every playlist update.
    pub fn with_playlist_sink(mut self, sink: mpsc::UnboundedSender<PlaylistUpdate>) -> Self {
        self.playlists = Some(sink);
        self
    }

    /// Run under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Transcode `request` to completion.
    ///
    /// # Arguments
    /// * `request` - Job to run; one derived stream per profile
    /// * `claims` - Claim manager for this job; receives one receipt per segment
    /// * `cancel` - Stops the job early; claims for accepted receipts still go out
    ///
    /// # Returns
    /// Derived streams of the profiles that did not fail, in requested order.
    /// The claim manager is finished and closed before this returns, whatever
    /// the outcome.
    ///
    /// # Errors
    /// * [`TranscodeError::Network`] if the source cannot be subscribed
    /// * [`TranscodeError::SourceEnded`] if the source stops without an end marker
    /// * [`TranscodeError::AllProfilesFailed`] once no profile is left
    /// * [`TranscodeError::Cancelled`] when `cancel` fires first
    pub async fn transcode(
        &self,
        request: &TranscodeRequest,
        claims: &ClaimManager,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Vec<StreamId>, TranscodeError> {
        let span = tracing::info_span!(parent: &self.span, "job", job_id = %request.job_id);
        async move {
            info!(
                source = %request.source,
                profiles = request.profiles.len(),
                claim = request.claim,
                "Starting transcode job"
            );

            let mut job = match self.open(request).await {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "Failed to open job streams");
                    self.close_claims(claims).await;
                    return Err(e);
                }
            };

            let outcome = self.drive(&mut job, request, claims, &mut cancel).await;
            if outcome.is_ok() {
                for output in job.outputs.iter_mut().filter(|o| o.is_live()) {
                    output.playlist.end();
                    self.publish(&output.playlist);
                    if let Err(e) = output.broadcaster.finish() {
                        warn!(stream = %output.stream(), error = %e, "Failed to finish broadcaster");
                    }
                }
            }
            // Claims are finalized while the streams are still held.
            self.close_claims(claims).await;
            outcome?;

            let derived: Vec<(StreamId, VideoProfile)> = job
                .outputs
                .iter()
                .filter(|o| o.is_live())
                .map(|o| (o.stream().clone(), o.profile))
                .collect();
            drop(job);

            let result: TranscodeResult = derived.iter().cloned().collect();
            let origin = request.source.node_id();
            match self
                .network
                .send_transcode_result(origin, &request.source, &result)
                .await
            {
                Ok(()) => info!(origin = %origin, streams = result.len(), "Notified origin node"),
                Err(e) => warn!(origin = %origin, error = %e, "Failed to notify origin node"),
            }

            Ok(derived.into_iter().map(|(stream, _)| stream).collect())
        }
        .instrument(span)
        .await
    }

    async fn open(&self, request: &TranscodeRequest) -> Result<ActiveJob, TranscodeError> {
        let (source, segments) =
            SubscriptionGuard::open(self.network.as_ref(), request.source.clone()).await?;

        let mut outputs = Vec::with_capacity(request.profiles.len());
        for profile in &request.profiles {
            let stream = StreamId::random(self.network.node_id())
                .map_err(|e| NetError::Protocol(e.to_string()))?;
            let broadcaster = BroadcasterGuard::acquire(self.network.as_ref(), stream.clone())?;
            debug!(profile = %profile, stream = %stream, "Derived stream allocated");
            outputs.push(ProfileOutput {
                profile: *profile,
                broadcaster,
                playlist: MediaPlaylist::new(stream),
                failure: None,
            });
        }

        Ok(ActiveJob {
            _source: source,
            segments,
            outputs,
        })
    }

    async fn drive(
        &self,
        job: &mut ActiveJob,
        request: &TranscodeRequest,
        claims: &ClaimManager,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), TranscodeError> {
        loop {
            let segment = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    info!("Job cancelled");
                    return Err(TranscodeError::Cancelled);
                }
                segment = job.segments.recv() => segment,
            };

            let Some(segment) = segment else {
                return Err(TranscodeError::SourceEnded(request.source.to_string()));
            };
            if segment.eof {
                info!(last_seq = segment.seq, "Source stream ended");
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    info!("Job cancelled mid-segment");
                    return Err(TranscodeError::Cancelled);
                }
                result = self.process_segment(job, claims, segment) => result?,
            }

            if job.outputs.iter().all(|o| !o.is_live()) {
                error!("Every profile failed");
                return Err(TranscodeError::AllProfilesFailed(request.job_id.to_string()));
            }
        }
    }

    async fn process_segment(
        &self,
        job: &mut ActiveJob,
        claims: &ClaimManager,
        segment: Segment,
    ) -> Result<(), TranscodeError> {
        let seq = segment.seq;
        let input = Fingerprint::of(&segment.data);

        let live: Vec<usize> = (0..job.outputs.len())
            .filter(|&i| job.outputs[i].is_live())
            .collect();
        let transcoder = self.transcoder.as_ref();
        let data = &segment.data;
        let results = join_all(live.iter().map(|&i| {
            let profile = job.outputs[i].profile;
            async move { (i, transcoder.transcode_segment(&profile, seq, data).await) }
        }))
        .await;

        let mut fingerprints = Vec::with_capacity(results.len());
        for (i, result) in results {
            let output = &mut job.outputs[i];
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    output.fail(e.to_string());
                    continue;
                }
            };
            let fingerprint = Fingerprint::of(&bytes);
            match output.broadcaster.broadcast(seq, bytes).await {
                Ok(()) => {
                    fingerprints.push(fingerprint);
                    output.playlist.push(seq);
                    self.publish(&output.playlist);
                }
                Err(e) => output.fail(format!("broadcast failed: {e}")),
            }
        }

        if fingerprints.is_empty() {
            debug!(seq, "No profile completed segment, no receipt");
            return Ok(());
        }

        let receipt = TranscodeReceipt {
            seq,
            input,
            output: Fingerprint::combine(&fingerprints),
        };
        if let Err(e) = claims.add_receipt(receipt).await {
            warn!(seq, error = %e, "Claim manager rejected receipt");
        }
        Ok(())
    }

    fn publish(&self, playlist: &MediaPlaylist) {
        if let Some(sink) = &self.playlists {
            let _ = sink.send(playlist.update());
        }
    }

    async fn close_claims(&self, claims: &ClaimManager) {
        match claims.finish().await {
            Ok(summary) => debug!(
                submitted = summary.submitted(),
                failed = summary.failed(),
                "Claims finalized"
            ),
            Err(e) => warn!(error = %e, "Claim manager already closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::claim::{ClaimConfig, ClaimState};
    use crate::transcoder::FakeTranscoder;
    use vtn_chain::{ChainClient, MockChainClient};
    use vtn_net::MemoryHub;
    use vtn_types::{lookup_profile, JobId};

    struct Fixture {
        hub: MemoryHub,
        origin: vtn_net::MemoryNetwork,
        source: StreamId,
        chain: Arc<MockChainClient>,
    }

    fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let origin = hub.join("origin");
        Fixture {
            source: StreamId::new("origin", "live").unwrap(),
            hub,
            origin,
            chain: Arc::new(MockChainClient::new("worker")),
        }
    }

    async fn publish_source(f: &Fixture, count: u64) {
        let mut out = BroadcasterGuard::acquire(&f.origin, f.source.clone()).unwrap();
        for seq in 0..count {
            out.broadcast(seq, format!("segment-{seq}").into_bytes())
                .await
                .unwrap();
        }
        out.finish().unwrap();
    }

    fn request(f: &Fixture, profiles: &[&str]) -> TranscodeRequest {
        let profiles = profiles.iter().map(|p| lookup_profile(p).unwrap()).collect();
        TranscodeRequest::new(JobId::from(11u64), f.source.clone(), profiles, true).unwrap()
    }

    fn claims(f: &Fixture) -> ClaimManager {
        ClaimManager::spawn(
            JobId::from(11u64),
            true,
            Arc::clone(&f.chain) as Arc<dyn ChainClient>,
            ClaimConfig::default(),
            Span::none(),
        )
        .unwrap()
    }

    fn orchestrator(f: &Fixture, transcoder: FakeTranscoder) -> TranscodeOrchestrator {
        TranscodeOrchestrator::new(Arc::new(f.hub.join("worker")), Arc::new(transcoder))
    }

    #[tokio::test]
    async fn test_single_profile_job() {
        let f = fixture();
        publish_source(&f, 3).await;
        let (playlist_tx, mut playlist_rx) = mpsc::unbounded_channel();
        let orch = orchestrator(&f, FakeTranscoder::new()).with_playlist_sink(playlist_tx);
        let claims = claims(&f);
        let (_cancel, rx) = cancel_pair();

        let derived = orch
            .transcode(&request(&f, &["P240p30fps16x9"]), &claims, rx)
            .await
            .unwrap();

        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].node_id(), "worker");
        assert_eq!(claims.state(), ClaimState::Closed);

        let history = f.hub.stream_history(&derived[0]);
        let profile = lookup_profile("P240p30fps16x9").unwrap();
        assert_eq!(
            history[1].data,
            FakeTranscoder::expected_output(&profile, 1, b"segment-1")
        );
        assert!(f.hub.is_finished(&derived[0]));

        let notes = f.hub.notifications_for("origin");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].result.get(&derived[0]), Some(&profile));

        let claimed = f.chain.claims();
        assert_eq!((claimed[0].start, claimed[0].end), (0, 2));

        let mut last = None;
        while let Ok(update) = playlist_rx.try_recv() {
            last = Some(update);
        }
        assert!(last.unwrap().manifest.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[tokio::test]
    async fn test_failed_profile_is_dropped() {
        let f = fixture();
        publish_source(&f, 4).await;
        let orch = orchestrator(&f, FakeTranscoder::new().fail_from("P360p30fps16x9", 1));
        let claims = claims(&f);
        let (_cancel, rx) = cancel_pair();

        let derived = orch
            .transcode(&request(&f, &["P240p30fps16x9", "P360p30fps16x9"]), &claims, rx)
            .await
            .unwrap();

        assert_eq!(derived.len(), 1);
        let notes = f.hub.notifications_for("origin");
        assert_eq!(notes[0].result.len(), 1);
        assert_eq!(
            notes[0].result.get(&derived[0]).map(|p| p.name),
            Some("P240p30fps16x9")
        );
        // Every segment still produced a receipt from the surviving profile.
        assert_eq!((f.chain.claims()[0].start, f.chain.claims()[0].end), (0, 3));
    }

    #[tokio::test]
    async fn test_all_profiles_failed() {
        let f = fixture();
        publish_source(&f, 3).await;
        let orch = orchestrator(&f, FakeTranscoder::new().fail_always("P240p30fps16x9"));
        let claims = claims(&f);
        let (_cancel, rx) = cancel_pair();

        let err = orch
            .transcode(&request(&f, &["P240p30fps16x9"]), &claims, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::AllProfilesFailed(_)));
        assert!(f.hub.notifications_for("origin").is_empty());
        assert!(f.chain.claims().is_empty());
        assert_eq!(claims.state(), ClaimState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_finalizes_claims_without_notify() {
        let f = fixture();
        // Source never ends, so only cancellation stops the job.
        let mut out = BroadcasterGuard::acquire(&f.origin, f.source.clone()).unwrap();
        out.broadcast(0, b"first".to_vec()).await.unwrap();

        let orch = orchestrator(&f, FakeTranscoder::new());
        let claims = claims(&f);
        let (cancel, rx) = cancel_pair();

        let claims_for_job = claims.clone();
        let req = request(&f, &["P240p30fps16x9"]);
        let job = tokio::spawn(async move { orch.transcode(&req, &claims_for_job, rx).await });

        while f.hub.subscriber_count(&f.source) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let result = job.await.unwrap();
        assert!(matches!(result, Err(TranscodeError::Cancelled)));
        assert_eq!(claims.state(), ClaimState::Closed);
        assert_eq!(f.hub.subscriber_count(&f.source), 0);
        assert!(f.hub.notifications_for("origin").is_empty());
        assert_eq!(f.chain.claims().len(), 1);
        drop(out);
    }

    #[tokio::test]
    async fn test_unreachable_origin_still_returns_streams() {
        let hub = MemoryHub::new();
        let publisher = hub.join("publisher");
        // Source claims an origin that never joined the hub.
        let source = StreamId::new("ghost", "live").unwrap();
        let mut out = BroadcasterGuard::acquire(&publisher, source.clone()).unwrap();
        out.broadcast(0, b"x".to_vec()).await.unwrap();
        out.finish().unwrap();

        let chain = Arc::new(MockChainClient::new("worker"));
        let claims = ClaimManager::spawn(
            JobId::from(2u64),
            true,
            chain as Arc<dyn ChainClient>,
            ClaimConfig::default(),
            Span::none(),
        )
        .unwrap();
        let orch = TranscodeOrchestrator::new(
            Arc::new(hub.join("worker")),
            Arc::new(FakeTranscoder::new()),
        );
        let request = TranscodeRequest::new(
            JobId::from(2u64),
            source,
            vec![lookup_profile("P144p30fps16x9").unwrap()],
            true,
        )
        .unwrap();
        let (_cancel, rx) = cancel_pair();

        let derived = orch.transcode(&request, &claims, rx).await.unwrap();
        assert_eq!(derived.len(), 1);
    }
}
