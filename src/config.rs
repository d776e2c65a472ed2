//! Runtime configuration for the orchestration engine.
//!
//! Covers credential cooldown policy, job pacing and parallelism, snapshot
//! persistence, artifact storage and the external generation service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the orchestration service.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Credential policy
    /// How long a quota-exhausted credential stays out of rotation.
    pub quota_cooldown: Duration,
    /// Consecutive transient failures before a credential is cooled down.
    pub transient_failure_threshold: u32,
    /// Cooldown applied once the transient threshold is reached.
    pub transient_cooldown: Duration,

    // Scheduling
    /// Upper bound on concurrent Jobs of one non-synced Task.
    pub max_parallel_jobs: usize,
    /// Pause between consecutive Jobs of one Task.
    pub job_interval: Duration,
    /// Safety tick for the driver loop when no wake-up arrives.
    pub idle_poll_interval: Duration,

    // Persistence
    /// How often the persister checks for store changes.
    pub snapshot_interval: Duration,
    /// JSON snapshot of tasks; persistence is off when unset. Credentials are
    /// saved beside it (see [`ForgeConfig::credential_file`]).
    pub state_file: Option<PathBuf>,
    /// Root directory of the filesystem blob store.
    pub artifact_dir: PathBuf,

    // External service
    /// Image generation model.
    pub model: String,
    /// Text model used for character analysis and assisted splitting.
    pub text_model: String,
    /// Base URL of the generative language API.
    pub api_base_url: String,
    /// Per-request timeout for external calls.
    pub request_timeout: Duration,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            // Credential defaults
            quota_cooldown: Duration::from_secs(300),
            transient_failure_threshold: 3,
            transient_cooldown: Duration::from_secs(30),

            // Scheduling defaults
            max_parallel_jobs: 2,
            job_interval: Duration::from_secs(1),
            idle_poll_interval: Duration::from_secs(2),

            // Persistence defaults
            snapshot_interval: Duration::from_secs(2),
            state_file: None,
            artifact_dir: PathBuf::from("./images"),

            // Service defaults
            model: "gemini-2.0-flash-preview-image-generation".to_string(),
            text_model: "gemini-2.0-flash".to_string(),
            api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// On-disk shape of the YAML configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    quota_cooldown_secs: Option<u64>,
    transient_failure_threshold: Option<u32>,
    transient_cooldown_secs: Option<u64>,
    max_parallel_jobs: Option<usize>,
    job_interval_ms: Option<u64>,
    idle_poll_interval_ms: Option<u64>,
    snapshot_interval_ms: Option<u64>,
    state_file: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    model: Option<String>,
    text_model: Option<String>,
    api_base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_QUOTA_COOLDOWN_SECS`: Quota cooldown in seconds (default: 300)
    /// - `FORGE_TRANSIENT_THRESHOLD`: Consecutive transient failures before cooldown (default: 3)
    /// - `FORGE_TRANSIENT_COOLDOWN_SECS`: Transient cooldown in seconds (default: 30)
    /// - `FORGE_MAX_PARALLEL_JOBS`: Parallel jobs for non-synced tasks (default: 2)
    /// - `FORGE_JOB_INTERVAL_MS`: Pause between jobs in milliseconds (default: 1000)
    /// - `FORGE_STATE_FILE`: Task snapshot path (default: unset)
    /// - `FORGE_ARTIFACT_DIR`: Artifact directory (default: ./images)
    /// - `FORGE_MODEL`: Image generation model
    /// - `FORGE_TEXT_MODEL`: Text model for analysis and splitting
    /// - `FORGE_API_BASE_URL`: Generative language API base URL
    /// - `FORGE_REQUEST_TIMEOUT_SECS`: External request timeout (default: 120)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file and then applies environment overrides.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML configuration on top of the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = if content.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(content)?
        };

        let mut config = Self::default();
        if let Some(secs) = file.quota_cooldown_secs {
            config.quota_cooldown = Duration::from_secs(secs);
        }
        if let Some(threshold) = file.transient_failure_threshold {
            config.transient_failure_threshold = threshold;
        }
        if let Some(secs) = file.transient_cooldown_secs {
            config.transient_cooldown = Duration::from_secs(secs);
        }
        if let Some(max) = file.max_parallel_jobs {
            config.max_parallel_jobs = max;
        }
        if let Some(ms) = file.job_interval_ms {
            config.job_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.idle_poll_interval_ms {
            config.idle_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.snapshot_interval_ms {
            config.snapshot_interval = Duration::from_millis(ms);
        }
        if file.state_file.is_some() {
            config.state_file = file.state_file;
        }
        if let Some(dir) = file.artifact_dir {
            config.artifact_dir = dir;
        }
        if let Some(model) = file.model {
            config.model = model;
        }
        if let Some(model) = file.text_model {
            config.text_model = model;
        }
        if let Some(url) = file.api_base_url {
            config.api_base_url = url;
        }
        if let Some(secs) = file.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Credential policy
        if let Ok(val) = std::env::var("FORGE_QUOTA_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_QUOTA_COOLDOWN_SECS")?;
            self.quota_cooldown = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("FORGE_TRANSIENT_THRESHOLD") {
            self.transient_failure_threshold = parse_env_value(&val, "FORGE_TRANSIENT_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("FORGE_TRANSIENT_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_TRANSIENT_COOLDOWN_SECS")?;
            self.transient_cooldown = Duration::from_secs(secs);
        }

        // Scheduling
        if let Ok(val) = std::env::var("FORGE_MAX_PARALLEL_JOBS") {
            self.max_parallel_jobs = parse_env_value(&val, "FORGE_MAX_PARALLEL_JOBS")?;
        }

        if let Ok(val) = std::env::var("FORGE_JOB_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "FORGE_JOB_INTERVAL_MS")?;
            self.job_interval = Duration::from_millis(ms);
        }

        // Persistence
        if let Ok(val) = std::env::var("FORGE_STATE_FILE") {
            self.state_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("FORGE_ARTIFACT_DIR") {
            self.artifact_dir = PathBuf::from(val);
        }

        // External service
        if let Ok(val) = std::env::var("FORGE_MODEL") {
            self.model = val;
        }

        if let Ok(val) = std::env::var("FORGE_TEXT_MODEL") {
            self.text_model = val;
        }

        if let Ok(val) = std::env::var("FORGE_API_BASE_URL") {
            self.api_base_url = val;
        }

        if let Ok(val) = std::env::var("FORGE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FORGE_REQUEST_TIMEOUT_SECS")?;
            self.request_timeout = Duration::from_secs(secs);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transient_failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "transient_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.max_parallel_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_jobs must be greater than 0".to_string(),
            ));
        }

        if self.idle_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "idle_poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.snapshot_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "snapshot_interval must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.model.is_empty() || self.text_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "model names cannot be empty".to_string(),
            ));
        }

        if self.api_base_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_base_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Credential file kept next to the state file, e.g.
    /// `state/tasks.json` -> `state/tasks.credentials.json`.
    pub fn credential_file(&self) -> Option<PathBuf> {
        self.state_file
            .as_ref()
            .map(|path| path.with_extension("credentials.json"))
    }

    /// Builder method to set the quota cooldown.
    pub fn with_quota_cooldown(mut self, cooldown: Duration) -> Self {
        self.quota_cooldown = cooldown;
        self
    }

    /// Builder method to set the transient failure policy.
    pub fn with_transient_policy(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.transient_failure_threshold = threshold;
        self.transient_cooldown = cooldown;
        self
    }

    /// Builder method to set max parallel jobs.
    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = max;
        self
    }

    /// Builder method to set the pause between jobs.
    pub fn with_job_interval(mut self, interval: Duration) -> Self {
        self.job_interval = interval;
        self
    }

    /// Builder method to set the driver's idle tick.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Builder method to set the snapshot file.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Builder method to set the snapshot check interval.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Builder method to set the artifact directory.
    pub fn with_artifact_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_dir = path.into();
        self
    }

    /// Builder method to set the image model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builder method to set the API base URL.
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}
