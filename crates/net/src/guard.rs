//! Scoped acquisition of overlay handles.
//!
//! Both guards release their handle on drop, covering early returns, `?`,
//! task cancellation and panics alike.

use crate::error::NetResult;
use crate::network::{Broadcaster, Segment, Subscriber, VideoNetwork};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vtn_types::StreamId;

/// Broadcaster that is finished when dropped.
pub struct BroadcasterGuard {
    stream: StreamId,
    inner: Box<dyn Broadcaster>,
    finished: bool,
}

impl BroadcasterGuard {
    /// Acquire the broadcaster for `stream`.
    pub fn acquire(network: &dyn VideoNetwork, stream: StreamId) -> NetResult<Self> {
        let inner = network.broadcaster(&stream)?;
        Ok(Self {
            stream,
            inner,
            finished: false,
        })
    }

    /// Stream this guard writes to.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream
    }

    /// Publish one segment.
    pub async fn broadcast(&mut self, seq: u64, data: Vec<u8>) -> NetResult<()> {
        self.inner.broadcast(seq, data).await
    }

    /// Signal end of stream explicitly.
    pub fn finish(&mut self) -> NetResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.inner.finish()
    }
}

impl Drop for BroadcasterGuard {
    fn drop(&mut self) {
        if !self.finished {
            debug!(stream = %self.stream, "Finishing broadcaster on release");
            if let Err(e) = self.finish() {
                warn!(stream = %self.stream, error = %e, "Failed to finish broadcaster");
            }
        }
    }
}

/// Active subscription that is cancelled when dropped.
pub struct SubscriptionGuard {
    stream: StreamId,
    inner: Box<dyn Subscriber>,
    active: bool,
}

impl SubscriptionGuard {
    /// Subscribe to `stream`, returning the guard and the delivery channel.
    pub async fn open(
        network: &dyn VideoNetwork,
        stream: StreamId,
    ) -> NetResult<(Self, mpsc::UnboundedReceiver<Segment>)> {
        let mut inner = network.subscriber(&stream)?;
        let rx = inner.subscribe().await?;
        Ok((
            Self {
                stream,
                inner,
                active: true,
            },
            rx,
        ))
    }

    /// Stream this guard reads from.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream
    }

    /// Cancel delivery explicitly.
    pub fn cancel(&mut self) -> NetResult<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.inner.unsubscribe()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.active {
            debug!(stream = %self.stream, "Cancelling subscription on release");
            if let Err(e) = self.cancel() {
                warn!(stream = %self.stream, error = %e, "Failed to cancel subscription");
            }
        }
    }
}
