//! In-process overlay.
//!
//! A [`MemoryHub`] is shared by any number of [`MemoryNetwork`] node handles.
//! Streams keep a bounded history so late subscribers get a replay, which
//! makes the hub deterministic enough for tests and usable for a standalone
//! single-process node. Only the most recent segments of a stream are kept,
//! and only the most recently finished streams.

use crate::error::{NetError, NetResult};
use crate::network::{Broadcaster, Segment, Subscriber, TranscodeResult, VideoNetwork};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};
use vtn_types::StreamId;

/// Notification delivered to a node's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeNotification {
    /// Sending node.
    pub from: String,
    /// Original stream owned by the receiver.
    pub origin: StreamId,
    /// Derived streams and their profiles.
    pub result: TranscodeResult,
}

/// Segments replayed to a late subscriber, per stream.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Finished streams kept for replay before the oldest is dropped.
pub const DEFAULT_FINISHED_LIMIT: usize = 64;

#[derive(Debug, Default)]
struct StreamChannel {
    history: VecDeque<Segment>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Segment>>,
    last_seq: Option<u64>,
    finished: bool,
}

#[derive(Debug, Default)]
struct HubState {
    streams: HashMap<StreamId, StreamChannel>,
    inboxes: HashMap<String, Vec<TranscodeNotification>>,
    connections: HashSet<(String, String)>,
    bootnodes: HashSet<String>,
    next_subscription: u64,
    finished_streams: VecDeque<StreamId>,
}

/// Shared in-memory overlay.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    history_limit: usize,
    finished_limit: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::with_limits(DEFAULT_HISTORY_LIMIT, DEFAULT_FINISHED_LIMIT)
    }
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty hub keeping at most `history` segments per stream
    /// and at most `finished` finished streams.
    pub fn with_limits(history: usize, finished: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            history_limit: history.max(1),
            finished_limit: finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // Hub state stays consistent across a panicking holder: every
        // mutation is a single insert/push.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a node and return its network handle.
    pub fn join(&self, node_id: impl Into<String>) -> MemoryNetwork {
        let node_id = node_id.into();
        self.lock().inboxes.entry(node_id.clone()).or_default();
        MemoryNetwork {
            node_id,
            hub: self.clone(),
        }
    }

    /// Notifications received by `node_id`, oldest first.
    pub fn notifications_for(&self, node_id: &str) -> Vec<TranscodeNotification> {
        self.lock().inboxes.get(node_id).cloned().unwrap_or_default()
    }

    /// Retained segments of `stream`, including the end marker.
    pub fn stream_history(&self, stream: &StreamId) -> Vec<Segment> {
        self.lock()
            .streams
            .get(stream)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of streams the hub currently holds.
    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// Whether `stream` has been finished.
    pub fn is_finished(&self, stream: &StreamId) -> bool {
        self.lock().streams.get(stream).is_some_and(|c| c.finished)
    }

    /// Number of live subscriptions on `stream`.
    pub fn subscriber_count(&self, stream: &StreamId) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Whether `a` has connected to `b`.
    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        self.lock()
            .connections
            .contains(&(a.to_string(), b.to_string()))
    }

    fn publish(&self, stream: &StreamId, segment: Segment) -> NetResult<()> {
        let mut state = self.lock();
        let channel = state.streams.entry(stream.clone()).or_default();
        if channel.finished {
            return Err(NetError::StreamFinished(stream.to_string()));
        }
        if !segment.eof {
            if let Some(last) = channel.last_seq {
                if segment.seq <= last {
                    return Err(NetError::OutOfOrder {
                        stream: stream.to_string(),
                        seq: segment.seq,
                        last,
                    });
                }
            }
            channel.last_seq = Some(segment.seq);
        } else {
            channel.finished = true;
        }
        channel
            .subscribers
            .retain(|_, tx| tx.send(segment.clone()).is_ok());
        let eof = segment.eof;
        channel.history.push_back(segment);
        while channel.history.len() > self.history_limit {
            channel.history.pop_front();
        }

        if eof {
            state.finished_streams.push_back(stream.clone());
            while state.finished_streams.len() > self.finished_limit {
                if let Some(oldest) = state.finished_streams.pop_front() {
                    debug!(stream = %oldest, "Dropping finished stream history");
                    state.streams.remove(&oldest);
                }
            }
        }
        Ok(())
    }

    fn attach(&self, stream: &StreamId) -> (u64, mpsc::UnboundedReceiver<Segment>) {
        let mut state = self.lock();
        let id = state.next_subscription;
        state.next_subscription += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = state.streams.entry(stream.clone()).or_default();
        let replay_ok = channel
            .history
            .iter()
            .all(|segment| tx.send(segment.clone()).is_ok());
        if replay_ok && !channel.finished {
            channel.subscribers.insert(id, tx);
        }
        (id, rx)
    }

    fn detach(&self, stream: &StreamId, id: u64) {
        if let Some(channel) = self.lock().streams.get_mut(stream) {
            channel.subscribers.remove(&id);
        }
    }
}

/// One node's view of a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    node_id: String,
    hub: MemoryHub,
}

impl MemoryNetwork {
    /// Hub this node is attached to.
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl VideoNetwork for MemoryNetwork {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn broadcaster(&self, stream: &StreamId) -> NetResult<Box<dyn Broadcaster>> {
        Ok(Box::new(MemoryBroadcaster {
            hub: self.hub.clone(),
            stream: stream.clone(),
            next_end_seq: 0,
            finished: false,
        }))
    }

    fn subscriber(&self, stream: &StreamId) -> NetResult<Box<dyn Subscriber>> {
        Ok(Box::new(MemorySubscriber {
            hub: self.hub.clone(),
            stream: stream.clone(),
            subscription: None,
        }))
    }

    async fn connect(&self, node_id: &str, addr: &str) -> NetResult<()> {
        let mut state = self.hub.lock();
        if !state.inboxes.contains_key(node_id) {
            return Err(NetError::PeerUnreachable(format!("{node_id} at {addr}")));
        }
        state
            .connections
            .insert((self.node_id.clone(), node_id.to_string()));
        debug!(peer = %node_id, addr = %addr, "Connected to peer");
        Ok(())
    }

    async fn setup_protocol(&self) -> NetResult<()> {
        self.hub.lock().bootnodes.insert(self.node_id.clone());
        info!(node_id = %self.node_id, "Protocol set up as bootnode");
        Ok(())
    }

    async fn send_transcode_result(
        &self,
        node_id: &str,
        origin: &StreamId,
        result: &TranscodeResult,
    ) -> NetResult<()> {
        let mut state = self.hub.lock();
        let inbox = state
            .inboxes
            .get_mut(node_id)
            .ok_or_else(|| NetError::PeerUnreachable(node_id.to_string()))?;
        inbox.push(TranscodeNotification {
            from: self.node_id.clone(),
            origin: origin.clone(),
            result: result.clone(),
        });
        Ok(())
    }
}

struct MemoryBroadcaster {
    hub: MemoryHub,
    stream: StreamId,
    next_end_seq: u64,
    finished: bool,
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    async fn broadcast(&mut self, seq: u64, data: Vec<u8>) -> NetResult<()> {
        if self.finished {
            return Err(NetError::StreamFinished(self.stream.to_string()));
        }
        let end_seq = seq
            .checked_add(1)
            .ok_or_else(|| NetError::SequenceExhausted(self.stream.to_string()))?;
        self.hub.publish(&self.stream, Segment::data(seq, data))?;
        self.next_end_seq = end_seq;
        Ok(())
    }

    fn finish(&mut self) -> NetResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.hub
            .publish(&self.stream, Segment::end(self.next_end_seq))
    }
}

struct MemorySubscriber {
    hub: MemoryHub,
    stream: StreamId,
    subscription: Option<u64>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self) -> NetResult<mpsc::UnboundedReceiver<Segment>> {
        if self.subscription.is_some() {
            return Err(NetError::AlreadySubscribed(self.stream.to_string()));
        }
        let (id, rx) = self.hub.attach(&self.stream);
        self.subscription = Some(id);
        Ok(rx)
    }

    fn unsubscribe(&mut self) -> NetResult<()> {
        if let Some(id) = self.subscription.take() {
            self.hub.detach(&self.stream, id);
        }
        Ok(())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(node: &str) -> StreamId {
        StreamId::new(node, "s1").unwrap()
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let id = stream("a");

        let mut b = net.broadcaster(&id).unwrap();
        b.broadcast(0, b"zero".to_vec()).await.unwrap();
        b.broadcast(1, b"one".to_vec()).await.unwrap();

        let mut sub = net.subscriber(&id).unwrap();
        let mut rx = sub.subscribe().await.unwrap();
        b.finish().unwrap();

        assert_eq!(rx.recv().await.unwrap(), Segment::data(0, b"zero".to_vec()));
        assert_eq!(rx.recv().await.unwrap(), Segment::data(1, b"one".to_vec()));
        assert_eq!(rx.recv().await.unwrap(), Segment::end(2));
        assert!(hub.is_finished(&id));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let mut b = net.broadcaster(&stream("a")).unwrap();
        b.broadcast(5, vec![1]).await.unwrap();
        assert!(matches!(
            b.broadcast(5, vec![2]).await,
            Err(NetError::OutOfOrder { seq: 5, last: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_write_after_finish_rejected() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let mut b = net.broadcaster(&stream("a")).unwrap();
        b.finish().unwrap();
        b.finish().unwrap();
        assert!(matches!(
            b.broadcast(0, vec![]).await,
            Err(NetError::StreamFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let id = stream("a");
        let mut sub = net.subscriber(&id).unwrap();
        let _rx = sub.subscribe().await.unwrap();
        assert_eq!(hub.subscriber_count(&id), 1);
        sub.unsubscribe().unwrap();
        assert_eq!(hub.subscriber_count(&id), 0);
    }

    #[tokio::test]
    async fn test_notify_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let result = net
            .send_transcode_result("ghost", &stream("ghost"), &TranscodeResult::new())
            .await;
        assert!(matches!(result, Err(NetError::PeerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_connect_requires_known_peer() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let _b = hub.join("b");
        a.connect("b", "/memory/b").await.unwrap();
        assert!(hub.is_connected("a", "b"));
        assert!(a.connect("c", "/memory/c").await.is_err());
    }

    #[tokio::test]
    async fn test_last_sequence_number_rejected() {
        let hub = MemoryHub::new();
        let net = hub.join("a");
        let mut b = net.broadcaster(&stream("a")).unwrap();
        b.broadcast(u64::MAX - 1, vec![1]).await.unwrap();
        assert!(matches!(
            b.broadcast(u64::MAX, vec![2]).await,
            Err(NetError::SequenceExhausted(_))
        ));
        b.finish().unwrap();
        assert_eq!(hub.stream_history(&stream("a")).last(), Some(&Segment::end(u64::MAX)));
    }

    #[tokio::test]
    async fn test_history_is_capped_per_stream() {
        let hub = MemoryHub::with_limits(3, 8);
        let net = hub.join("a");
        let id = stream("a");
        let mut b = net.broadcaster(&id).unwrap();
        for seq in 0..10 {
            b.broadcast(seq, vec![seq as u8]).await.unwrap();
        }

        let seqs: Vec<_> = hub.stream_history(&id).iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![7, 8, 9]);

        let mut sub = net.subscriber(&id).unwrap();
        let mut rx = sub.subscribe().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().seq, 7);
    }

    #[tokio::test]
    async fn test_oldest_finished_stream_is_dropped() {
        let hub = MemoryHub::with_limits(16, 2);
        let net = hub.join("a");
        for suffix in ["s1", "s2", "s3"] {
            let id = StreamId::new("a", suffix).unwrap();
            let mut b = net.broadcaster(&id).unwrap();
            b.broadcast(0, vec![0]).await.unwrap();
            b.finish().unwrap();
        }

        assert_eq!(hub.stream_count(), 2);
        assert!(hub.stream_history(&StreamId::new("a", "s1").unwrap()).is_empty());
        assert!(hub.is_finished(&StreamId::new("a", "s3").unwrap()));
    }
}
