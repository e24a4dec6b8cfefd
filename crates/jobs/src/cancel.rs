//! Cancellation signal shared by the long-running loops.
//!
//! A `watch` channel carrying `true` once cancelled. Dropping the sender also
//! counts as cancellation.

use tokio::sync::watch;

/// Sending half; `cancel()` stops every receiver.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Signal cancellation.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Whether cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// New receiver for this signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Create a fresh, not-yet-cancelled signal.
pub fn cancel_pair() -> (CancelHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), rx)
}

/// Resolve once `rx` is cancelled or its sender is gone.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}
