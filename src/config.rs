//! Run configuration, read once at start from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Command-line flags are applied on top by the binary.

use crate::error::ConfigError;
use crate::extraction::DispatchFilters;
use crate::formats::DefectKind;
use crate::logging::LogFormat;
use crate::rpc::{RetryPolicy, RpcAuth};
use crate::types::ImageFormat;
use crate::validation::{Strictness, ValidationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_url")]
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Used when no user/password pair is set.
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_min_candidate_size")]
    pub min_candidate_size: usize,
    #[serde(default = "default_formats")]
    pub allowed_formats: Vec<ImageFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub strictness: Strictness,
    /// Defect kinds that permissive mode routes to repair.
    #[serde(default = "default_repairable")]
    pub repairable: Vec<DefectKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_true")]
    pub auto_repair: bool,
    #[serde(default)]
    pub force_save_invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub start_height: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_mempool_seen_capacity")]
    pub mempool_seen_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub auto_thumbnail: bool,
    #[serde(default = "default_thumbnail_edge")]
    pub thumbnail_edge: u32,
    /// External viewer invoked with the payload path, e.g. `viu`.
    #[serde(default)]
    pub viewer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

// Serde default helpers

fn default_data_dir() -> PathBuf {
    PathBuf::from("./chainscry_data")
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8332".to_string()
}

fn default_min_candidate_size() -> usize {
    1
}

fn default_formats() -> Vec<ImageFormat> {
    ImageFormat::ALL.to_vec()
}

fn default_repairable() -> Vec<DefectKind> {
    DefectKind::ALL.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_mempool_seen_capacity() -> usize {
    crate::cursor::DEFAULT_SEEN_CAPACITY
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_thumbnail_edge() -> u32 {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Human
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            user: None,
            password: None,
            cookie_file: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_candidate_size: default_min_candidate_size(),
            allowed_formats: default_formats(),
        }
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            repairable: default_repairable(),
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            auto_repair: default_true(),
            force_save_invalid: false,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_height: None,
            poll_interval_ms: default_poll_interval_ms(),
            mempool_seen_capacity: default_mempool_seen_capacity(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            auto_thumbnail: false,
            thumbnail_edge: default_thumbnail_edge(),
            viewer: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            rpc: RpcConfig::default(),
            extraction: ExtractionConfig::default(),
            validation: ValidationSection::default(),
            repair: RepairConfig::default(),
            scan: ScanConfig::default(),
            retry: RetryConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.extraction.allowed_formats.is_empty() {
            return Err(ConfigError::Invalid {
                field: "extraction.allowed_formats",
                message: "at least one format is required".into(),
            });
        }
        if self.scan.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scan.poll_interval_ms",
                message: "must be positive".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                message: "must be at least 1".into(),
            });
        }
        if self.output.thumbnail_edge == 0 {
            return Err(ConfigError::Invalid {
                field: "output.thumbnail_edge",
                message: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_start_height(mut self, height: u64) -> Self {
        self.scan.start_height = Some(height);
        self
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.validation.strictness = strictness;
        self
    }

    pub fn with_allowed_formats(mut self, formats: impl Into<Vec<ImageFormat>>) -> Self {
        self.extraction.allowed_formats = formats.into();
        self
    }

    pub fn with_min_candidate_size(mut self, bytes: usize) -> Self {
        self.extraction.min_candidate_size = bytes;
        self
    }

    pub fn with_auto_repair(mut self, enabled: bool) -> Self {
        self.repair.auto_repair = enabled;
        self
    }

    pub fn with_force_save_invalid(mut self, enabled: bool) -> Self {
        self.repair.force_save_invalid = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.scan.poll_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, initial: Duration, max: Duration) -> Self {
        self.retry = RetryConfig {
            max_attempts,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
        };
        self
    }

    pub fn dispatch_filters(&self) -> DispatchFilters {
        DispatchFilters::default()
            .with_min_size(self.extraction.min_candidate_size)
            .with_allowed_formats(self.extraction.allowed_formats.clone())
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig::new()
            .with_strictness(self.validation.strictness)
            .with_allowed_formats(self.extraction.allowed_formats.clone())
            .with_repairable(self.validation.repairable.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_intervals(
                Duration::from_millis(self.retry.initial_backoff_ms),
                Duration::from_millis(self.retry.max_backoff_ms),
            )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.scan.poll_interval_ms)
    }

    pub fn rpc_auth(&self) -> RpcAuth {
        match (&self.rpc.user, &self.rpc.password, &self.rpc.cookie_file) {
            (Some(user), Some(password), _) => RpcAuth::UserPass {
                user: user.clone(),
                password: password.clone(),
            },
            (_, _, Some(cookie)) => RpcAuth::Cookie(cookie.clone()),
            _ => RpcAuth::None,
        }
    }
}
