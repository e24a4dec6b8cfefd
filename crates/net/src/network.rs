//! Capability contracts over the P2P overlay.

use crate::error::NetResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use vtn_types::{StreamId, VideoProfile};

/// Mapping of derived stream to the profile it carries.
pub type TranscodeResult = BTreeMap<StreamId, VideoProfile>;

/// One delivered unit of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number within the stream.
    pub seq: u64,
    /// Segment payload; empty on the end-of-stream marker.
    pub data: Vec<u8>,
    /// Set on the final delivery of a stream.
    pub eof: bool,
}

impl Segment {
    /// Data segment.
    pub fn data(seq: u64, data: Vec<u8>) -> Self {
        Self {
            seq,
            data,
            eof: false,
        }
    }

    /// End-of-stream marker.
    pub fn end(seq: u64) -> Self {
        Self {
            seq,
            data: Vec::new(),
            eof: true,
        }
    }
}

/// Write end of a stream.
///
/// Writes must carry strictly increasing sequence numbers.
#[async_trait]
pub trait Broadcaster: Send {
    /// Publish one segment.
    async fn broadcast(&mut self, seq: u64, data: Vec<u8>) -> NetResult<()>;

    /// Signal end of stream. Idempotent.
    fn finish(&mut self) -> NetResult<()>;
}

/// Read end of a stream.
#[async_trait]
pub trait Subscriber: Send {
    /// Start delivery. Segments arrive in order; the last one has `eof` set.
    async fn subscribe(&mut self) -> NetResult<mpsc::UnboundedReceiver<Segment>>;

    /// Stop delivery and release resources. Idempotent.
    fn unsubscribe(&mut self) -> NetResult<()>;
}

/// Contract the job pipeline consumes from the overlay.
#[async_trait]
pub trait VideoNetwork: Send + Sync {
    /// This node's identity string.
    fn node_id(&self) -> &str;

    /// Acquire the write end for `stream`.
    fn broadcaster(&self, stream: &StreamId) -> NetResult<Box<dyn Broadcaster>>;

    /// Acquire the read end for `stream`.
    fn subscriber(&self, stream: &StreamId) -> NetResult<Box<dyn Subscriber>>;

    /// Connect to a peer.
    async fn connect(&self, node_id: &str, addr: &str) -> NetResult<()>;

    /// Bootstrap the protocol (bootnode role).
    async fn setup_protocol(&self) -> NetResult<()>;

    /// Tell `node_id` that the derived streams in `result` now carry the
    /// given profiles of `origin`.
    async fn send_transcode_result(
        &self,
        node_id: &str,
        origin: &StreamId,
        result: &TranscodeResult,
    ) -> NetResult<()>;
}
