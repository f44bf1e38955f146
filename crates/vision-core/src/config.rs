//! Configuration management for visiond
//!
//! Provides a unified configuration system that supports YAML files,
//! environment variables, and command-line argument overrides.

use crate::types::{BatchProfile, Precision};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides (`VISIOND_ENGINE__PRECISION=full`)
pub const ENV_PREFIX: &str = "VISIOND";

/// Main configuration structure for visiond
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Inference engine configuration
    pub engine: EngineConfig,

    /// GPU telemetry configuration
    pub telemetry: TelemetryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    ///
    /// Command line overrides are applied by the binary afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()));
        } else {
            for candidate in &["./visiond.yaml", "/etc/visiond/config.yaml"] {
                builder = builder.add_source(config::File::with_name(candidate).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file, ignoring the environment
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.engine.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to
    pub bind_addr: SocketAddr,

    /// Allow cross-origin requests from the dashboard
    pub enable_cors: bool,

    /// Largest accepted upload in bytes
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_upload_bytes == 0 {
            return Err(Error::config("max_upload_bytes must be > 0"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            enable_cors: true,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Which device executes inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelector {
    /// Host execution only
    Cpu,
    /// Accelerator by ordinal
    Accelerator(u32),
}

impl DeviceSelector {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, DeviceSelector::Accelerator(_))
    }
}

impl std::str::FromStr for DeviceSelector {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        match lowered.as_str() {
            "cpu" => return Ok(DeviceSelector::Cpu),
            "cuda" | "gpu" => return Ok(DeviceSelector::Accelerator(0)),
            _ => {}
        }

        let index = lowered
            .strip_prefix("cuda:")
            .or_else(|| lowered.strip_prefix("gpu:"))
            .ok_or_else(|| format!("Unknown device selector: {}", s))?;

        index
            .parse::<u32>()
            .map(DeviceSelector::Accelerator)
            .map_err(|e| format!("Invalid device index in '{}': {}", s, e))
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSelector> for String {
    fn from(value: DeviceSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Cpu => write!(f, "cpu"),
            DeviceSelector::Accelerator(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// What a request does while the artifact is being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileWait {
    /// Wait for the compilation to resolve to Ready or Failed
    Block,
    /// Serve immediately through the fallback path
    Degrade,
}

/// Inference engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Device selector (`cpu`, `cuda:N`)
    pub device: DeviceSelector,

    /// Run on the host when the selected accelerator is absent
    pub cpu_fallback: bool,

    /// Precision of the compiled artifact
    pub precision: Precision,

    /// Serve through the reference path while no compiled artifact is ready
    pub allow_fallback: bool,

    /// Behavior of requests that arrive during compilation
    pub compile_wait: CompileWait,

    /// Where the compiled artifact is stored
    pub artifact_path: PathBuf,

    /// Bincode-encoded model weights; generated from `seed` when absent
    pub weights_path: Option<PathBuf>,

    /// Newline-separated class names
    pub labels_path: Option<PathBuf>,

    /// Dynamic batch bounds for the compiled artifact
    pub batch_profile: BatchProfile,

    /// Square input resolution expected by the model
    pub input_size: u32,

    /// Side length of the square patches the model embeds
    pub patch_size: u32,

    /// Hidden width of generated weights
    pub hidden_dim: usize,

    /// Number of classes of generated weights
    pub num_classes: usize,

    /// Seed for generated weights
    pub seed: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.batch_profile.validate()?;

        if self.input_size == 0 || self.patch_size == 0 {
            return Err(Error::config("input_size and patch_size must be > 0"));
        }
        if self.input_size % self.patch_size != 0 {
            return Err(Error::config(format!(
                "input_size {} is not a multiple of patch_size {}",
                self.input_size, self.patch_size
            )));
        }
        if self.hidden_dim == 0 || self.num_classes == 0 {
            return Err(Error::config("hidden_dim and num_classes must be > 0"));
        }
        if self.artifact_path.as_os_str().is_empty() {
            return Err(Error::config("artifact_path cannot be empty"));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Accelerator(0),
            cpu_fallback: true,
            precision: Precision::Reduced,
            allow_fallback: true,
            compile_wait: CompileWait::Block,
            artifact_path: PathBuf::from("artifacts/classifier_fp16.plan"),
            weights_path: None,
            labels_path: None,
            batch_profile: BatchProfile::from_max(8),
            input_size: 224,
            patch_size: 16,
            hidden_dim: 64,
            num_classes: 1000,
            seed: 0x5EED_1234,
        }
    }
}

/// GPU telemetry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Delay between consecutive samples in one poll (milliseconds)
    pub interval_ms: u64,

    /// dcgm-exporter scrape URL for the primary tier
    pub dcgm_endpoint: Option<String>,

    /// Probe NVML as the secondary tier
    pub enable_nvml: bool,

    /// GPU ordinal to report
    pub device_index: u32,

    /// Timeout for a single probe or read (milliseconds)
    pub probe_timeout_ms: u64,

    /// Re-probe the real tiers after this many consecutive read failures
    pub reprobe_after_failures: Option<u32>,

    /// Largest sample count one poll may request
    pub max_samples: usize,

    /// Sample count when the caller does not ask for one
    pub default_samples: usize,
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(Error::config("max_samples must be > 0"));
        }
        if self.default_samples == 0 || self.default_samples > self.max_samples {
            return Err(Error::config(format!(
                "default_samples must be within 1..={}",
                self.max_samples
            )));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::config("probe_timeout_ms must be > 0"));
        }
        if self.reprobe_after_failures == Some(0) {
            return Err(Error::config("reprobe_after_failures must be > 0 when set"));
        }
        Ok(())
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            dcgm_endpoint: Some("http://127.0.0.1:9400/metrics".to_string()),
            enable_nvml: true,
            device_index: 0,
            probe_timeout_ms: 500,
            reprobe_after_failures: None,
            max_samples: 120,
            default_samples: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}
