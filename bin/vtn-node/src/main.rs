//! VTN Node Binary
//!
//! Subcommands:
//! - node: Run an overlay node, optionally taking transcoding jobs from chain
//! - stream: Play a stream from the local media server with ffplay
//! - broadcast: Capture the local camera and broadcast it (macOS only)

mod config;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::NodeConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command as Process;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vtn_chain::{ChainClient, SubxtChainClient};
use vtn_jobs::{FfmpegTranscoder, JobService, PlaylistUpdate};
use vtn_net::{load_or_generate_keys, node_id, MemoryHub, VideoNetwork};
use vtn_types::StreamId;

/// Playback attempts before giving up.
const STREAM_ATTEMPTS: u32 = 3;

/// Shorter playback runs count as a network hiccup.
const MIN_PLAYBACK: Duration = Duration::from_secs(10);

/// Delay before asking the media server for the broadcast stream id.
const STREAM_ID_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "vtn-node")]
#[command(about = "VTN video transcoding network node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node
    Node(NodeArgs),
    /// Play a stream with ffplay
    Stream {
        /// Stream ID
        #[arg(long)]
        id: String,

        /// HTTP port of the media server
        #[arg(long, default_value_t = 8935)]
        http_port: u16,
    },
    /// Capture and broadcast the local camera
    Broadcast {
        /// RTMP port to broadcast to
        #[arg(long, default_value_t = 1935)]
        rtmp: u16,

        /// HTTP port for getting the broadcast stream ID
        #[arg(long, default_value_t = 8935)]
        http: u16,
    },
}

/// Flags for `node`; each overrides the config file when given.
#[derive(Args, Default)]
struct NodeArgs {
    /// Overlay listen port
    #[arg(long)]
    port: Option<u16>,

    /// HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// RTMP port
    #[arg(long)]
    rtmp_port: Option<u16>,

    /// Data directory
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// Bootstrap node ID
    #[arg(long)]
    boot_id: Option<String>,

    /// Bootstrap node address
    #[arg(long)]
    boot_addr: Option<String>,

    /// Start as bootstrap node
    #[arg(long)]
    bootnode: bool,

    /// Accept transcoding jobs
    #[arg(long)]
    transcoder: bool,

    /// Chain RPC endpoint (off-chain mode when absent)
    #[arg(long)]
    chain_endpoint: Option<String>,

    /// Protocol contract address
    #[arg(long)]
    protocol_addr: Option<String>,

    /// Signer SURI for chain transactions
    #[arg(long)]
    signer_suri: Option<String>,
}

impl NodeArgs {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.rtmp_port {
            config.rtmp_port = port;
        }
        if let Some(datadir) = self.datadir {
            config.datadir = datadir;
        }
        if self.boot_id.is_some() {
            config.boot_id = self.boot_id;
        }
        if self.boot_addr.is_some() {
            config.boot_addr = self.boot_addr;
        }
        config.bootnode |= self.bootnode;
        config.transcoder |= self.transcoder;
        if self.chain_endpoint.is_some() {
            config.chain.endpoint = self.chain_endpoint;
        }
        if self.protocol_addr.is_some() {
            config.chain.protocol_addr = self.protocol_addr;
        }
        if let Some(suri) = self.signer_suri {
            config.chain.signer_suri = suri;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Command::Node(args) => {
            let mut config = NodeConfig::load(cli.config.as_deref())?;
            args.apply(&mut config);
            run_node(config).await
        }
        Command::Stream { id, http_port } => stream(&id, http_port).await,
        Command::Broadcast { rtmp, http } => broadcast(rtmp, http).await,
    }
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
    .map_err(|e| anyhow!(e))
}

async fn run_node(config: NodeConfig) -> Result<()> {
    config.validate()?;
    ensure_datadir(&config.datadir)?;

    let keypair = load_or_generate_keys(Some(&config.datadir));
    let node_id = node_id(&keypair);
    info!(
        node_id = %node_id,
        port = config.port,
        http_port = config.http_port,
        rtmp_port = config.rtmp_port,
        "Starting VTN node"
    );

    let hub = MemoryHub::new();
    let network = Arc::new(hub.join(node_id));
    if config.bootnode {
        info!("Setting up bootnode");
        network
            .setup_protocol()
            .await
            .context("Cannot set up protocol")?;
    } else if let (Some(boot_id), Some(boot_addr)) = (&config.boot_id, &config.boot_addr) {
        network
            .connect(boot_id, boot_addr)
            .await
            .context("Cannot connect to bootstrap node")?;
    }

    let chain: Option<Arc<dyn ChainClient>> = match &config.chain.endpoint {
        Some(endpoint) => {
            let client = SubxtChainClient::connect(endpoint, &config.chain.signer_suri)
                .await
                .context("Cannot connect to chain")?;
            if let Some(addr) = &config.chain.protocol_addr {
                info!(protocol_addr = %addr, "Using protocol contract");
            }
            Some(Arc::new(client) as Arc<dyn ChainClient>)
        }
        None => {
            info!("No chain endpoint, running off-chain");
            None
        }
    };

    let (playlist_tx, playlist_rx) = mpsc::unbounded_channel();
    let playlist_task = tokio::spawn(log_playlists(playlist_rx));

    let service = match (chain, config.transcoder) {
        (Some(chain), true) => {
            let transcoder = Arc::new(FfmpegTranscoder::new(config.ffmpeg()));
            let service = JobService::new(
                chain,
                network.clone() as Arc<dyn VideoNetwork>,
                transcoder,
                config.job_service(),
            )?
            .with_playlist_sink(playlist_tx);
            Some(service.start().await?)
        }
        (None, true) => {
            warn!("Transcoder mode needs a chain endpoint, not accepting jobs");
            None
        }
        _ => None,
    };

    info!("VTN node initialized successfully");
    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down VTN node");
    if let Some(service) = service {
        service.shutdown().await?;
    }
    playlist_task.abort();
    Ok(())
}

fn ensure_datadir(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create data directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

async fn log_playlists(mut updates: mpsc::UnboundedReceiver<PlaylistUpdate>) {
    while let Some(update) = updates.recv().await {
        debug!(stream = %update.stream, bytes = update.manifest.len(), "Playlist updated");
    }
}

fn stream_url(http_port: u16, stream: &StreamId) -> String {
    format!("http://localhost:{http_port}/stream/{stream}.m3u8")
}

async fn stream(id: &str, http_port: u16) -> Result<()> {
    let stream: StreamId = id.parse().context("Need a valid stream ID via --id")?;
    let url = stream_url(http_port, &stream);

    for attempt in 1..=STREAM_ATTEMPTS {
        info!(url = %url, attempt, "Now streaming");
        let started = Instant::now();
        let status = Process::new("ffplay")
            .arg(&url)
            .status()
            .await
            .context("Couldn't start the stream")?;

        // ffplay exits cleanly even when playback failed; only duration tells.
        if started.elapsed() >= MIN_PLAYBACK {
            info!(status = %status, "Finished the stream");
            return Ok(());
        }
        warn!(status = %status, attempt, "Stream ended early, trying again");
    }
    bail!("stream ended early {STREAM_ATTEMPTS} times")
}

fn capture_args(rtmp_port: u16) -> Vec<String> {
    [
        "-f",
        "avfoundation",
        "-framerate",
        "30",
        "-pixel_format",
        "uyvy422",
        "-i",
        "0:0",
        "-vcodec",
        "libx264",
        "-tune",
        "zerolatency",
        "-b",
        "1000k",
        "-x264-params",
        "keyint=60:min-keyint=60",
        "-acodec",
        "aac",
        "-ac",
        "1",
        "-b:a",
        "96k",
        "-f",
        "flv",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(format!("rtmp://localhost:{rtmp_port}/movie")))
    .collect()
}

async fn fetch_stream_id(http_port: u16) -> Result<String> {
    let body = reqwest::get(format!("http://localhost:{http_port}/streamID"))
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().to_string())
}

async fn broadcast(rtmp_port: u16, http_port: u16) -> Result<()> {
    if !cfg!(target_os = "macos") {
        bail!("The broadcast command only supports macOS for now. Please use OBS to broadcast.");
    }

    let mut child = Process::new("ffmpeg")
        .args(capture_args(rtmp_port))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("Couldn't broadcast the stream")?;
    info!(rtmp_port, "Now broadcasting");

    tokio::time::sleep(STREAM_ID_DELAY).await;
    match fetch_stream_id(http_port).await {
        Ok(id) => info!(stream_id = %id, "Broadcast stream ID"),
        Err(e) => error!(error = %e, "Error getting stream ID"),
    }

    let status = child.wait().await.context("Error running broadcast")?;
    if !status.success() {
        bail!("broadcast exited with {status}");
    }
    Ok(())
}
