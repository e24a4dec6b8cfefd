//! Transcoding engine seam.
//!
//! The orchestrator hands each source segment to a [`Transcoder`] once per
//! live profile. [`FfmpegTranscoder`] pipes the segment through an `ffmpeg`
//! child process.

use crate::error::TranscodeError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use vtn_types::VideoProfile;

/// Transcodes one segment into one profile.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `input` (sequence `seq`) for `profile`.
    async fn transcode_segment(
        &self,
        profile: &VideoProfile,
        seq: u64,
        input: &[u8],
    ) -> Result<Vec<u8>, TranscodeError>;
}

/// Configuration for [`FfmpegTranscoder`].
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// Path to the `ffmpeg` binary.
    pub binary: PathBuf,
    /// Deadline for one segment.
    pub segment_timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            segment_timeout: Duration::from_secs(30),
        }
    }
}

/// Transcoder backed by the `ffmpeg` CLI, MPEG-TS in and out.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    config: FfmpegConfig,
}

impl FfmpegTranscoder {
    /// Create a transcoder with `config`.
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for `profile`.
    pub fn args(profile: &VideoProfile) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "mpegts",
            "-i",
            "pipe:0",
            "-s",
            profile.resolution,
            "-b:v",
            profile.bitrate,
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            "-r".to_string(),
            profile.framerate.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "mpegts".to_string(),
            "pipe:1".to_string(),
        ])
        .collect()
    }

    async fn run(&self, profile: &VideoProfile, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
        let engine_error = |reason: String| TranscodeError::Engine {
            profile: profile.name.to_string(),
            reason,
        };

        let mut child = Command::new(&self.config.binary)
            .args(Self::args(profile))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| engine_error(format!("spawn failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| engine_error("stdin unavailable".into()))?;
        let data = input.to_vec();
        // Feed stdin concurrently so a full stdout pipe cannot deadlock us.
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&data).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| engine_error(e.to_string()))?;
        if let Ok(Err(e)) = writer.await {
            debug!(profile = %profile, error = %e, "ffmpeg closed stdin early");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(engine_error(format!(
                "exit {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode_segment(
        &self,
        profile: &VideoProfile,
        seq: u64,
        input: &[u8],
    ) -> Result<Vec<u8>, TranscodeError> {
        let limit = self.config.segment_timeout;
        debug!(profile = %profile, seq, bytes = input.len(), "Transcoding segment");
        tokio::time::timeout(limit, self.run(profile, input))
            .await
            .map_err(|_| TranscodeError::Timeout {
                profile: profile.name.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })?
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Deterministic in-process transcoder for tests.
    ///
    /// Output is `<profile>:<seq>:` followed by the input bytes. Failures can
    /// be scheduled per profile, either from a sequence onwards or always.
    #[derive(Debug, Default)]
    pub struct FakeTranscoder {
        failures: Mutex<HashSet<(String, Option<u64>)>>,
        delay: Mutex<Option<Duration>>,
        calls: AtomicU64,
    }

    impl FakeTranscoder {
        /// Transcoder that never fails.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail `profile` for every segment from `seq` onwards.
        pub fn fail_from(self, profile: &str, seq: u64) -> Self {
            self.lock_failures().insert((profile.to_string(), Some(seq)));
            self
        }

        /// Fail `profile` for every segment.
        pub fn fail_always(self, profile: &str) -> Self {
            self.lock_failures().insert((profile.to_string(), None));
            self
        }

        /// Sleep this long per segment.
        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
            self
        }

        /// Segments transcoded or attempted.
        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Output the fake produces for a successful call.
        pub fn expected_output(profile: &VideoProfile, seq: u64, input: &[u8]) -> Vec<u8> {
            let mut out = format!("{}:{}:", profile.name, seq).into_bytes();
            out.extend_from_slice(input);
            out
        }

        fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashSet<(String, Option<u64>)>> {
            self.failures.lock().unwrap_or_else(|p| p.into_inner())
        }

        fn should_fail(&self, profile: &str, seq: u64) -> bool {
            self.lock_failures().iter().any(|(name, from)| {
                name == profile && from.map_or(true, |start| seq >= start)
            })
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode_segment(
            &self,
            profile: &VideoProfile,
            seq: u64,
            input: &[u8],
        ) -> Result<Vec<u8>, TranscodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail(profile.name, seq) {
                return Err(TranscodeError::Engine {
                    profile: profile.name.to_string(),
                    reason: format!("scripted failure at segment {seq}"),
                });
            }
            Ok(Self::expected_output(profile, seq, input))
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use fake::FakeTranscoder;

#[cfg(test)]
mod tests {
    use super::*;
    use vtn_types::lookup_profile;

    #[test]
    fn test_ffmpeg_args_follow_profile() {
        let profile = lookup_profile("P360p30fps4x3").unwrap();
        let args = FfmpegTranscoder::args(&profile);
        let joined = args.join(" ");
        assert!(joined.contains("-s 480x360"));
        assert!(joined.contains("-b:v 1000k"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-c:v libx264"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_engine_error() {
        let transcoder = FfmpegTranscoder::new(FfmpegConfig {
            binary: PathBuf::from("/nonexistent/ffmpeg-binary"),
            segment_timeout: Duration::from_secs(5),
        });
        let profile = lookup_profile("P144p30fps16x9").unwrap();
        let err = transcoder
            .transcode_segment(&profile, 0, b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Engine { .. }));
    }

    #[tokio::test]
    async fn test_fake_failure_schedule() {
        let p240 = lookup_profile("P240p30fps16x9").unwrap();
        let p360 = lookup_profile("P360p30fps16x9").unwrap();
        let fake = FakeTranscoder::new().fail_from("P240p30fps16x9", 2);

        assert!(fake.transcode_segment(&p240, 1, b"x").await.is_ok());
        assert!(fake.transcode_segment(&p240, 2, b"x").await.is_err());
        assert!(fake.transcode_segment(&p240, 3, b"x").await.is_err());
        assert_eq!(
            fake.transcode_segment(&p360, 3, b"x").await.unwrap(),
            FakeTranscoder::expected_output(&p360, 3, b"x")
        );
        assert_eq!(fake.calls(), 4);
    }
}
