//! Job identifiers and work orders.

use crate::error::{TypesError, TypesResult};
use crate::profile::VideoProfile;
use crate::stream::StreamId;
use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// On-chain job identifier (arbitrary precision, exact).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(BigUint);

impl JobId {
    /// Wrap a big integer.
    pub fn new(value: BigUint) -> Self {
        Self(value)
    }

    /// Decode from a little-endian word (the chain encodes ids as U256).
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_le(bytes))
    }

    /// Encode as a fixed 32-byte little-endian word.
    ///
    /// Returns `None` when the id does not fit in 256 bits.
    pub fn to_le_word(&self) -> Option<[u8; 32]> {
        let bytes = self.0.to_bytes_le();
        if bytes.len() > 32 {
            return None;
        }
        let mut word = [0u8; 32];
        word[..bytes.len()].copy_from_slice(&bytes);
        Some(word)
    }

    /// Borrow the underlying integer.
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<u128> for JobId {
    fn from(value: u128) -> Self {
        Self(BigUint::from(value))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TypesError::InvalidJobId(s.to_string()));
        }
        BigUint::from_str(s)
            .map(Self)
            .map_err(|_| TypesError::InvalidJobId(s.to_string()))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Work order built from a single job-assignment event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    /// Chain job identifier.
    pub job_id: JobId,
    /// Stream to transcode.
    pub source: StreamId,
    /// Requested profiles, in requested order.
    pub profiles: Vec<VideoProfile>,
    /// Whether completed work is claimed on chain.
    pub claim: bool,
    /// Account that created the job.
    pub requester: String,
    /// Price per segment offered by the requester.
    pub price_per_segment: u128,
}

impl TranscodeRequest {
    /// Build a request, rejecting an empty profile set.
    pub fn new(
        job_id: JobId,
        source: StreamId,
        profiles: Vec<VideoProfile>,
        claim: bool,
    ) -> TypesResult<Self> {
        if profiles.is_empty() {
            return Err(TypesError::EmptyProfiles);
        }
        Ok(Self {
            job_id,
            source,
            profiles,
            claim,
            requester: String::new(),
            price_per_segment: 0,
        })
    }

    /// Attach requester and price metadata.
    pub fn with_requester(mut self, requester: impl Into<String>, price_per_segment: u128) -> Self {
        self.requester = requester.into();
        self.price_per_segment = price_per_segment;
        self
    }
}
