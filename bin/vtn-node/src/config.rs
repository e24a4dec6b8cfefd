//! Node configuration
//!
//! Loaded from an optional TOML file; command-line flags override file
//! values. Every field has a default, so an empty file is a valid config.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vtn_chain::ChainTimeouts;
use vtn_jobs::{ClaimConfig, FfmpegConfig, JobServiceConfig, ListenerConfig, RewardConfig};

/// Full node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Overlay listen port
    pub port: u16,

    /// HTTP port of the media server
    pub http_port: u16,

    /// RTMP port of the media server
    pub rtmp_port: u16,

    /// Data directory holding `keys.json`
    pub datadir: PathBuf,

    /// Bootstrap peer identity
    pub boot_id: Option<String>,

    /// Bootstrap peer address
    pub boot_addr: Option<String>,

    /// Run as bootstrap node instead of connecting to one
    pub bootnode: bool,

    /// Accept transcoding jobs
    pub transcoder: bool,

    /// Chain access
    pub chain: ChainSection,

    /// Job pipeline tuning
    pub jobs: JobsSection,

    /// Transcoding engine
    pub ffmpeg: FfmpegSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 15000,
            http_port: 8935,
            rtmp_port: 1935,
            datadir: PathBuf::from("./data"),
            boot_id: None,
            boot_addr: None,
            bootnode: false,
            transcoder: false,
            chain: ChainSection::default(),
            jobs: JobsSection::default(),
            ffmpeg: FfmpegSection::default(),
        }
    }
}

/// Chain endpoint and timeout tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    /// WebSocket RPC endpoint; off-chain mode when unset
    pub endpoint: Option<String>,

    /// Protocol contract address
    pub protocol_addr: Option<String>,

    /// sr25519 signer SURI
    pub signer_suri: String,

    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub event_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub mined_timeout: Duration,
}

impl Default for ChainSection {
    fn default() -> Self {
        let timeouts = ChainTimeouts::default();
        Self {
            endpoint: None,
            protocol_addr: None,
            signer_suri: "//Alice".to_string(),
            rpc_timeout: timeouts.rpc,
            event_timeout: timeouts.event,
            mined_timeout: timeouts.mined,
        }
    }
}

impl ChainSection {
    /// Timeout tiers as the chain crate expects them
    pub fn timeouts(&self) -> ChainTimeouts {
        ChainTimeouts {
            rpc: self.rpc_timeout,
            event: self.event_timeout,
            mined: self.mined_timeout,
        }
    }
}

/// Job pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    /// Submit claims for completed work
    pub claim_work: bool,

    /// Jobs allowed to run at once
    pub max_concurrent_jobs: usize,

    /// Receipts per claim
    pub claim_batch: usize,

    /// Claim flush cadence
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,

    /// Reward evaluation cadence
    #[serde(with = "humantime_serde")]
    pub reward_interval: Duration,
}

impl Default for JobsSection {
    fn default() -> Self {
        let service = JobServiceConfig::default();
        Self {
            claim_work: true,
            max_concurrent_jobs: service.max_concurrent_jobs,
            claim_batch: service.claims.max_batch,
            claim_interval: service.claims.flush_interval,
            reward_interval: service.rewards.interval,
        }
    }
}

/// Transcoding engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegSection {
    /// `ffmpeg` binary
    pub binary: PathBuf,

    /// Deadline per segment
    #[serde(with = "humantime_serde")]
    pub segment_timeout: Duration,
}

impl Default for FfmpegSection {
    fn default() -> Self {
        let ffmpeg = FfmpegConfig::default();
        Self {
            binary: ffmpeg.binary,
            segment_timeout: ffmpeg.segment_timeout,
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid node configuration")
    }

    /// Load `path` if given; a missing file yields the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_toml(&text)
            }
            Some(path) => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject configurations the node cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("Please provide port");
        }
        if self.http_port == 0 {
            bail!("Please provide http port");
        }
        if self.rtmp_port == 0 {
            bail!("Please provide rtmp port");
        }
        if !self.bootnode && (self.boot_id.is_none() || self.boot_addr.is_none()) {
            bail!("either --bootnode or both --boot-id and --boot-addr are required");
        }
        self.chain
            .timeouts()
            .validate()
            .context("invalid chain timeouts")?;
        self.job_service().validate().context("invalid job settings")?;
        Ok(())
    }

    /// Job service settings derived from this config
    pub fn job_service(&self) -> JobServiceConfig {
        let defaults = JobServiceConfig::default();
        JobServiceConfig {
            listener: ListenerConfig {
                timeouts: self.chain.timeouts(),
                claim_work: self.jobs.claim_work,
                ..defaults.listener
            },
            claims: ClaimConfig {
                max_batch: self.jobs.claim_batch,
                flush_interval: self.jobs.claim_interval,
                submit_timeout: self.chain.mined_timeout,
                ..defaults.claims
            },
            rewards: RewardConfig {
                interval: self.jobs.reward_interval,
                call_timeout: self.chain.mined_timeout,
                ..defaults.rewards
            },
            max_concurrent_jobs: self.jobs.max_concurrent_jobs,
            ..defaults
        }
    }

    /// Engine settings derived from this config
    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary: self.ffmpeg.binary.clone(),
            segment_timeout: self.ffmpeg.segment_timeout,
        }
    }
}
