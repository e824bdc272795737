//! Probe executor.
//!
//! Runs the external media inspector against one stream URL and turns its
//! diagnostic output into a [`StreamStats`] record. The executor never
//! returns an error to its caller: every failure mode (spawn error, timeout,
//! unparseable output) becomes a fully-populated record with a non-OK status.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::{ProbeStatus, StreamStats};
use crate::probe::parser::parse_diagnostics;

/// Parameters for one probe invocation
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Seconds of media the inspector reads
    pub duration_secs: u64,
    /// Inspector read timeout
    pub timeout_secs: u64,
    /// Extra wall-clock allowance for inspector startup
    pub startup_buffer_secs: u64,
    /// Additional attempts on Timeout/Error verdicts; 0 is a valid no-op
    pub retries: u32,
    pub retry_delay: Duration,
}

impl ProbeSpec {
    /// Hard wall-clock limit for one inspector run
    #[must_use]
    pub const fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.duration_secs + self.timeout_secs + self.startup_buffer_secs)
    }
}

/// Driver for the external media inspector subprocess
pub struct ProbeExecutor {
    inspector_path: String,
    user_agent: String,
}

impl ProbeExecutor {
    #[must_use]
    pub fn new(inspector_path: String, user_agent: String) -> Self {
        Self {
            inspector_path,
            user_agent,
        }
    }

    /// Probe one URL. Retries on Timeout/Error verdicts up to `spec.retries`
    /// extra attempts with a fixed delay; always returns a populated record.
    pub async fn probe(&self, url: &str, spec: &ProbeSpec) -> StreamStats {
        let attempts = spec.retries.saturating_add(1);
        let mut stats = self.probe_once(url, spec).await;

        for attempt in 1..attempts {
            if stats.status.is_ok() || stats.status == ProbeStatus::Dead {
                break;
            }
            debug!(
                url,
                attempt,
                status = ?stats.status,
                "Retrying probe after failure"
            );
            tokio::time::sleep(spec.retry_delay).await;
            stats = self.probe_once(url, spec).await;
        }

        stats
    }

    async fn probe_once(&self, url: &str, spec: &ProbeSpec) -> StreamStats {
        let mut command = Command::new(&self.inspector_path);
        command
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-user_agent")
            .arg(&self.user_agent)
            .arg("-i")
            .arg(url)
            .arg("-t")
            .arg(spec.duration_secs.to_string())
            .arg("-f")
            .arg("null")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(url, error = %err, "Failed to spawn media inspector");
                return StreamStats::failed(ProbeStatus::Error);
            }
        };

        let output = match tokio::time::timeout(spec.hard_timeout(), child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(url, error = %err, "Media inspector I/O failure");
                return StreamStats::failed(ProbeStatus::Error);
            }
            Err(_) => {
                debug!(url, timeout_secs = spec.hard_timeout().as_secs(), "Probe timed out");
                return StreamStats::failed(ProbeStatus::Timeout);
            }
        };

        let diagnostics = String::from_utf8_lossy(&output.stderr);
        let parsed = parse_diagnostics(&diagnostics, spec.duration_secs);

        let has_signal = parsed.resolution.is_some_and(|(w, h)| w > 0 && h > 0)
            || parsed.fps.is_some_and(|fps| fps > 0.0)
            || parsed.bitrate_kbps.is_some_and(|kbps| kbps > 0.0);

        if !has_signal {
            if !output.status.success() {
                debug!(url, code = ?output.status.code(), "Inspector exited non-zero with no parseable output");
            }
            return StreamStats::failed(ProbeStatus::Error);
        }

        StreamStats {
            resolution: parsed
                .resolution
                .map_or_else(|| "0x0".to_string(), |(w, h)| format!("{w}x{h}")),
            source_fps: parsed.fps.unwrap_or(0.0),
            video_codec: parsed.video_codec,
            audio_codec: parsed.audio_codec,
            ffmpeg_output_bitrate: parsed.bitrate_kbps,
            status: ProbeStatus::Ok,
            probed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn spec(retries: u32) -> ProbeSpec {
        ProbeSpec {
            duration_secs: 30,
            timeout_secs: 5,
            startup_buffer_secs: 5,
            retries,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Write a fake inspector that prints canned diagnostics to stderr
    fn fake_inspector(dir: &tempfile::TempDir, diagnostics: &str) -> String {
        let path = dir.path().join("inspector.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "cat <<'EOF' 1>&2").unwrap();
        writeln!(file, "{diagnostics}").unwrap();
        writeln!(file, "EOF").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_hard_timeout_formula() {
        let spec = ProbeSpec {
            duration_secs: 30,
            timeout_secs: 10,
            startup_buffer_secs: 10,
            retries: 0,
            retry_delay: Duration::ZERO,
        };
        assert_eq!(spec.hard_timeout(), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_missing_inspector_returns_populated_error_stats() {
        let executor = ProbeExecutor::new(
            "/nonexistent/inspector".to_string(),
            "StreamFlow/0.1".to_string(),
        );
        // retries=0 must still yield a fully-populated record
        let stats = executor.probe("http://x/stream", &spec(0)).await;

        assert_eq!(stats.status, ProbeStatus::Error);
        assert_eq!(stats.resolution, "0x0");
        assert_eq!(stats.source_fps, 0.0);
        assert_eq!(stats.video_codec, "N/A");
        assert_eq!(stats.audio_codec, "N/A");
        assert!(stats.ffmpeg_output_bitrate.is_none());
    }

    #[tokio::test]
    async fn test_successful_probe_parses_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = fake_inspector(
            &dir,
            "    Stream #0:0(und): Video: h264 (High), yuv420p, 1920x1080, 25 fps\n\
             \u{20}   Stream #0:1(und): Audio: aac, 48000 Hz, stereo\n\
             Statistics: 15000000 bytes read; 0 seeks",
        );
        let executor = ProbeExecutor::new(inspector, "StreamFlow/0.1".to_string());

        let stats = executor.probe("http://x/stream", &spec(0)).await;
        assert_eq!(stats.status, ProbeStatus::Ok);
        assert_eq!(stats.resolution, "1920x1080");
        assert_eq!(stats.source_fps, 25.0);
        assert_eq!(stats.video_codec, "h264");
        assert_eq!(stats.audio_codec, "aac");
        let bitrate = stats.ffmpeg_output_bitrate.unwrap();
        assert!((bitrate - 4000.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_no_signal_output_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = fake_inspector(&dir, "[info] nothing useful here");
        let executor = ProbeExecutor::new(inspector, "StreamFlow/0.1".to_string());

        let stats = executor.probe("http://x/stream", &spec(0)).await;
        assert_eq!(stats.status, ProbeStatus::Error);
    }

    #[tokio::test]
    async fn test_retries_rerun_failed_probe() {
        // The fake inspector appends to a counter file on each run so the
        // retry count is observable.
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let path = dir.path().join("inspector.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo run >> {}", counter.display()).unwrap();
        writeln!(file, "exit 1").unwrap();
        drop(file);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let executor = ProbeExecutor::new(
            path.to_string_lossy().into_owned(),
            "StreamFlow/0.1".to_string(),
        );
        let stats = executor.probe("http://x/stream", &spec(2)).await;

        assert_eq!(stats.status, ProbeStatus::Error);
        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 3, "expected initial attempt plus 2 retries");
    }
}
