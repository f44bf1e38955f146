//! # vision-adapter-gpu
//!
//! Tiered GPU telemetry for visiond.
//!
//! This crate provides:
//! - A DCGM exporter scraper (primary tier, highest fidelity)
//! - An NVML reader (secondary tier, driver-level)
//! - A deterministic stub (always available, respects the same bounds)
//! - [`TelemetryChain`], which probes the tiers once, binds the first one that
//!   answers, and exposes the same sampling contract whichever tier is bound
//!
//! ## Supported Backends
//!
//! - **DCGM**: scraped from a `dcgm-exporter` endpoint
//! - **NVML**: NVIDIA Management Library, behind the `nvml` feature
//! - **Stub**: synthetic values for hosts without GPU tooling
//!
//! ## Example
//!
//! ```rust,no_run
//! use vision_adapter_gpu::{ChainConfig, TelemetryChain};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChainConfig::default()
//!         .with_interval(Duration::from_millis(500))
//!         .with_dcgm_endpoint("http://127.0.0.1:9400/metrics");
//!
//!     let chain = TelemetryChain::new(config);
//!     let samples = chain.sample(3).await?;
//!     println!("{} samples from {}", samples.len(), chain.describe().await.active_tier);
//!
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod chain;
pub mod config;
pub mod dcgm;
pub mod nvml;
pub mod stub;

// Re-export main types
pub use chain::{TelemetryBackend, TelemetryChain};
pub use config::ChainConfig;
pub use dcgm::DcgmSource;
pub use nvml::NvmlSource;
pub use stub::StubSource;

/// Result type for GPU telemetry operations
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors that can occur during GPU telemetry operations
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Telemetry source unavailable: {0}")]
    Unavailable(String),

    #[error("Telemetry read failed: {0}")]
    Read(String),

    #[error("GPU not found: {0}")]
    GpuNotFound(String),

    #[error("NVML error: {0}")]
    NvmlError(String),

    #[error("DCGM error: {0}")]
    DcgmError(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl GpuError {
    /// Check if this error is transient for a bound tier
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GpuError::Read(_) | GpuError::Http(_) | GpuError::Timeout(_) | GpuError::DcgmError(_)
        )
    }

    /// Check if this error means the tier cannot be used at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, GpuError::Unavailable(_) | GpuError::GpuNotFound(_))
    }
}

impl From<GpuError> for vision_core::Error {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::Configuration(msg) => vision_core::Error::invalid_request(msg),
            other => vision_core::Error::telemetry_read(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_error_properties() {
        let read_error = GpuError::Read("scrape returned 500".to_string());
        assert!(read_error.is_retryable());
        assert!(!read_error.is_unavailable());

        let unavailable = GpuError::Unavailable("no daemon".to_string());
        assert!(!unavailable.is_retryable());
        assert!(unavailable.is_unavailable());
    }

    #[test]
    fn test_error_display() {
        let error = GpuError::GpuNotFound("GPU-0".to_string());
        assert_eq!(error.to_string(), "GPU not found: GPU-0");
    }

    #[test]
    fn test_core_error_conversion() {
        let core: vision_core::Error = GpuError::Read("boom".to_string()).into();
        assert_eq!(core.category(), "telemetry_read");

        let core: vision_core::Error = GpuError::Configuration("samples=0".to_string()).into();
        assert!(core.is_client_error());
    }
}
