//! Error types for the network facade and key material.

use thiserror::Error;

/// Errors raised by overlay operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Target node is not reachable.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Write after the stream was finished.
    #[error("stream already finished: {0}")]
    StreamFinished(String),

    /// Broadcaster received a sequence number that does not advance.
    #[error("out-of-order segment {seq} on {stream} (last {last})")]
    OutOfOrder {
        /// Stream written to.
        stream: String,
        /// Rejected sequence number.
        seq: u64,
        /// Last accepted sequence number.
        last: u64,
    },

    /// Sequence number leaves no room for the end marker.
    #[error("sequence number space exhausted on {0}")]
    SequenceExhausted(String),

    /// Subscriber handle already has an active subscription.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// Bootstrap or transport setup failed.
    #[error("protocol setup failed: {0}")]
    Protocol(String),

    /// Overlay state is unavailable.
    #[error("network closed")]
    Closed,
}

/// Errors raised while loading persisted key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// File could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a valid key record.
    #[error("key file malformed: {0}")]
    Format(#[from] serde_json::Error),

    /// A field is not valid base64.
    #[error("key field not base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Bytes are not a valid key.
    #[error("Invalid keypair format")]
    InvalidKeypair,

    /// Stored public key does not belong to the stored private key.
    #[error("public key does not match private key")]
    Mismatch,
}

/// Result type alias for overlay operations.
pub type NetResult<T> = Result<T, NetError>;
