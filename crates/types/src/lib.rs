//! Core types for VTN transcoding nodes
//!
//! This crate provides the shared vocabulary used by the network facade, the
//! chain client and the job pipeline: stream and job identifiers, the video
//! profile catalog, work orders, per-segment receipts and claims.

mod error;
mod job;
mod profile;
mod proof;
mod reward;
mod stream;

pub use error::{TypesError, TypesResult};
pub use job::{JobId, TranscodeRequest};
pub use profile::{lookup_profile, parse_profile_tag, VideoProfile, VIDEO_PROFILES};
pub use proof::{merkle_root, Claim, ClaimStatus, Fingerprint, TranscodeReceipt};
pub use reward::{RewardCycle, RewardOutcome};
pub use stream::StreamId;
