//! # VTN Job Orchestration
//!
//! The transcoder side of the network: turns on-chain job assignments into
//! transcoded streams and turns completed work into on-chain claims.
//!
//! ## Architecture
//!
//! ```text
//! Chain events → JobListener → JobService → TranscodeOrchestrator → Network notify
//!                                               │
//!                                               └→ ClaimManager → Chain claims
//! RewardManager (independent, fixed interval) → Chain reward
//! ```
//!
//! ## Components
//!
//! - [`JobListener`]: subscribes to job events and resolves each to a [`TranscodeRequest`](vtn_types::TranscodeRequest)
//! - [`TranscodeOrchestrator`]: runs one job across its profiles and notifies the origin
//! - [`ClaimManager`]: per-job actor batching receipts into non-overlapping claims
//! - [`RewardManager`]: periodic eligibility check and reward call
//! - [`JobService`]: wires the above, deduplicates jobs and caps concurrency
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vtn_jobs::{FfmpegTranscoder, JobService, JobServiceConfig};
//!
//! let service = JobService::new(chain, network, Arc::new(FfmpegTranscoder::default()), JobServiceConfig::default())?;
//! let handle = service.start().await?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! ```

mod cancel;
mod claim;
mod error;
mod listener;
mod orchestrator;
mod playlist;
mod retry;
mod reward;
mod service;
mod transcoder;

pub use cancel::{cancel_pair, cancelled, CancelHandle};
pub use claim::{ClaimBook, ClaimConfig, ClaimManager, ClaimState, ClaimSummary};
pub use error::{
    ClaimError, ClaimResult, JobsError, JobsResult, ListenerError, ListenerResult, RewardError,
    TranscodeError,
};
pub use listener::{JobListener, ListenerConfig, ListenerStats};
pub use orchestrator::TranscodeOrchestrator;
pub use playlist::{MediaPlaylist, PlaylistUpdate, SEGMENT_DURATION_SECS};
pub use retry::{retry_transient, RetryPolicy};
pub use reward::{RewardConfig, RewardManager, RewardStats};
pub use service::{JobOutcome, JobReport, JobService, JobServiceConfig, JobServiceHandle};
pub use transcoder::{FfmpegConfig, FfmpegTranscoder, Transcoder};

#[cfg(any(test, feature = "test-utils"))]
pub use transcoder::FakeTranscoder;
