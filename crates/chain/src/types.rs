//! Raw chain records consumed by the job pipeline.

use std::fmt;
use vtn_types::JobId;

/// Hash of an extrinsic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    /// Hash raw extrinsic bytes (blake2-256).
    pub fn of(extrinsic: &[u8]) -> Self {
        Self(sp_core::hashing::blake2_256(extrinsic))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

/// Job-assignment event as delivered by the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLog {
    /// Extrinsic that created the job.
    pub tx_hash: TxHash,
    /// Block the event was finalized in.
    pub block_number: u64,
    /// Job identifier carried by the event.
    pub job_id: JobId,
    /// Account that created the job.
    pub broadcaster: String,
    /// Account assigned to transcode.
    pub transcoder: String,
}

/// Extrinsic looked up by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Extrinsic hash.
    pub hash: TxHash,
    /// Signer account, if signed.
    pub from: Option<String>,
    /// SCALE-encoded call arguments.
    pub input: Vec<u8>,
}

/// Job metadata from chain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job identifier.
    pub job_id: JobId,
    /// Account that created the job.
    pub broadcaster: String,
    /// Assigned transcoder account.
    pub transcoder: String,
    /// Maximum price per segment the broadcaster pays.
    pub max_price_per_segment: u128,
    /// Block after which the job expires.
    pub end_block: u64,
}
