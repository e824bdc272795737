use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
    pub checker: CheckerSettings,
    pub state_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
            checker: CheckerSettings::default(),
            state_dir: "./data".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("upstream", &self.upstream)
            .field("logging", &self.logging)
            .field("checker", &self.checker)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

/// Upstream orchestrator connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub http_timeout_seconds: u64,
    pub user_agent: String,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("http_timeout_seconds", &self.http_timeout_seconds)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            http_timeout_seconds: 30,
            user_agent: "StreamFlow/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Probe pipeline mode.
///
/// `Disabled` turns the scheduler loops into no-ops (status queries keep
/// working); the other modes select progressively longer analysis windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineMode {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "pipeline_1")]
    Pipeline1,
    #[serde(rename = "pipeline_1_5")]
    Pipeline15,
    #[serde(rename = "pipeline_2")]
    Pipeline2,
    #[serde(rename = "pipeline_2_5")]
    Pipeline25,
    #[serde(rename = "pipeline_3")]
    Pipeline3,
}

/// Probe analysis window for a pipeline mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimings {
    /// Seconds of media the inspector reads
    pub duration_secs: u64,
    /// Read timeout passed to the inspector
    pub timeout_secs: u64,
}

impl PipelineMode {
    /// Analysis timings for this mode, or `None` when disabled.
    ///
    /// The mapping is fixed so that two runs with the same configuration
    /// always probe with identical windows.
    #[must_use]
    pub const fn probe_timings(self) -> Option<ProbeTimings> {
        match self {
            Self::Disabled => None,
            Self::Pipeline1 => Some(ProbeTimings {
                duration_secs: 10,
                timeout_secs: 10,
            }),
            Self::Pipeline15 => Some(ProbeTimings {
                duration_secs: 15,
                timeout_secs: 12,
            }),
            Self::Pipeline2 => Some(ProbeTimings {
                duration_secs: 20,
                timeout_secs: 15,
            }),
            Self::Pipeline25 => Some(ProbeTimings {
                duration_secs: 25,
                timeout_secs: 18,
            }),
            Self::Pipeline3 => Some(ProbeTimings {
                duration_secs: 30,
                timeout_secs: 20,
            }),
        }
    }

    #[must_use]
    pub const fn is_disabled(self) -> bool {
        matches!(self, Self::Disabled)
    }
}

/// Concurrency limits for in-flight probes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentStreamsConfig {
    pub enabled: bool,
    /// Upper bound on probes in flight across all accounts
    pub global_limit: usize,
    /// Seconds to wait between probe submissions within one channel batch
    pub stagger_delay: f64,
}

impl Default for ConcurrentStreamsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_limit: 10,
            stagger_delay: 1.0,
        }
    }
}

/// Dead-stream classification thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadStreamConfig {
    pub enabled: bool,
    /// When set, dead streams are detached from the channel upstream;
    /// otherwise they stay associated but tracked.
    pub removal_enabled: bool,
    pub min_resolution_width: u32,
    pub min_resolution_height: u32,
    pub min_bitrate_kbps: f64,
    pub min_score: f64,
}

impl Default for DeadStreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            removal_enabled: false,
            min_resolution_width: 0,
            min_resolution_height: 0,
            min_bitrate_kbps: 0.0,
            min_score: 0.0,
        }
    }
}

/// Daily global sweep schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalCheckSchedule {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
}

impl Default for GlobalCheckSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: 3,
            minute: 0,
        }
    }
}

/// Check queue sizing and dirty-queue behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on queued + in-progress channels
    pub max_size: usize,
    /// Queue channels automatically when an M3U refresh marks them dirty
    pub check_on_update: bool,
    /// Max dirty channels drained per dirty-queue tick
    pub max_channels_per_run: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            check_on_update: true,
            max_channels_per_run: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamAnalysisConfig {
    /// Extra wall-clock seconds allowed for inspector startup
    pub stream_startup_buffer: u64,
    /// Media inspector binary invoked per probe
    pub inspector_path: String,
}

impl Default for StreamAnalysisConfig {
    fn default() -> Self {
        Self {
            stream_startup_buffer: 10,
            inspector_path: "ffmpeg".to_string(),
        }
    }
}

/// Profile-aware empty-channel handling
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyChannelsConfig {
    pub disable_enabled: bool,
    /// Profile whose disabled channels are re-enabled when they regain a
    /// working stream
    pub profile_id: Option<i64>,
}

/// Runtime-tunable checker settings.
///
/// The whole record can be swapped at runtime through
/// [`SettingsHandle::update`]; invalid updates are rejected and the previous
/// settings retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerSettings {
    pub pipeline_mode: PipelineMode,
    /// Worker loops draining the check queue
    pub workers: usize,
    /// Probe retries on Timeout/Error verdicts
    pub retries: u32,
    pub retry_delay_seconds: f64,
    pub concurrent_streams: ConcurrentStreamsConfig,
    pub dead_stream_handling: DeadStreamConfig,
    pub global_check_schedule: GlobalCheckSchedule,
    pub queue: QueueConfig,
    pub stream_analysis: StreamAnalysisConfig,
    /// Re-probe streams that already carry stats during a global sweep
    pub validate_existing_streams: bool,
    pub empty_channels: EmptyChannelsConfig,
    /// Case sensitivity of candidate-matcher patterns
    pub case_sensitive_matching: bool,
    /// Grace period for in-flight checks on shutdown
    pub shutdown_grace_seconds: u64,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            pipeline_mode: PipelineMode::Pipeline2,
            workers: 1,
            retries: 1,
            retry_delay_seconds: 2.0,
            concurrent_streams: ConcurrentStreamsConfig::default(),
            dead_stream_handling: DeadStreamConfig::default(),
            global_check_schedule: GlobalCheckSchedule::default(),
            queue: QueueConfig::default(),
            stream_analysis: StreamAnalysisConfig::default(),
            validate_existing_streams: false,
            empty_channels: EmptyChannelsConfig::default(),
            case_sensitive_matching: true,
            shutdown_grace_seconds: 60,
        }
    }
}

impl CheckerSettings {
    /// Validate a settings record, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.global_check_schedule.hour > 23 {
            errors.push(format!(
                "global_check_schedule.hour must be 0-23, got {}",
                self.global_check_schedule.hour
            ));
        }
        if self.global_check_schedule.minute > 59 {
            errors.push(format!(
                "global_check_schedule.minute must be 0-59, got {}",
                self.global_check_schedule.minute
            ));
        }
        if self.queue.max_size == 0 {
            errors.push("queue.max_size must be greater than 0".to_string());
        }
        if self.queue.max_channels_per_run == 0 {
            errors.push("queue.max_channels_per_run must be greater than 0".to_string());
        }
        if self.workers == 0 {
            errors.push("workers must be greater than 0".to_string());
        }
        if self.concurrent_streams.enabled && self.concurrent_streams.global_limit == 0 {
            errors.push(
                "concurrent_streams.global_limit must be greater than 0 when enabled".to_string(),
            );
        }
        if self.concurrent_streams.stagger_delay < 0.0 {
            errors.push(format!(
                "concurrent_streams.stagger_delay must be >= 0, got {}",
                self.concurrent_streams.stagger_delay
            ));
        }
        if self.retry_delay_seconds < 0.0 {
            errors.push(format!(
                "retry_delay_seconds must be >= 0, got {}",
                self.retry_delay_seconds
            ));
        }
        if self.empty_channels.disable_enabled && self.empty_channels.profile_id.is_none() {
            errors.push(
                "empty_channels.profile_id must be set when disable_enabled is true".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Shared handle to the runtime-tunable settings.
///
/// Readers take a cheap snapshot; writers go through [`Self::update`] which
/// validates before swapping.
#[derive(Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<CheckerSettings>>,
}

impl SettingsHandle {
    #[must_use]
    pub fn new(settings: CheckerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Snapshot of the current settings
    #[must_use]
    pub fn get(&self) -> CheckerSettings {
        self.inner.read().clone()
    }

    /// Replace the settings after validation.
    ///
    /// On validation failure the previous settings are retained and the
    /// collected errors returned.
    pub fn update(&self, settings: CheckerSettings) -> crate::Result<()> {
        settings
            .validate()
            .map_err(|errors| crate::Error::InvalidInput(errors.join("; ")))?;
        *self.inner.write() = settings;
        Ok(())
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, config::FileFormat::Yaml));
            }
        }

        // Override with environment variables (STREAMFLOW_UPSTREAM_BASE_URL, etc.)
        builder = builder.add_source(
            Environment::with_prefix("STREAMFLOW")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate configuration at startup (fail fast on misconfigurations)
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.upstream.base_url.is_empty() {
            errors.push("upstream.base_url must not be empty".to_string());
        } else if url::Url::parse(&self.upstream.base_url).is_err() {
            errors.push(format!(
                "upstream.base_url '{}' is not a valid URL",
                self.upstream.base_url
            ));
        }
        if self.upstream.http_timeout_seconds == 0 {
            errors.push("upstream.http_timeout_seconds must be greater than 0".to_string());
        }
        if self.state_dir.is_empty() {
            errors.push("state_dir must not be empty".to_string());
        }

        if let Err(mut checker_errors) = self.checker.validate() {
            errors.append(&mut checker_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
