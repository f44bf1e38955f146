//! Telemetry chain configuration

use std::time::Duration;
use vision_core::TelemetryConfig;

/// Configuration for [`crate::TelemetryChain`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    /// Delay between consecutive samples of one poll
    pub interval: Duration,

    /// dcgm-exporter scrape URL; the primary tier is skipped when unset
    pub dcgm_endpoint: Option<String>,

    /// Probe NVML as the secondary tier
    pub enable_nvml: bool,

    /// GPU ordinal to read
    pub device_index: u32,

    /// Timeout for probes and reads
    pub probe_timeout: Duration,

    /// Re-probe the real tiers after this many consecutive read failures
    pub reprobe_after_failures: Option<u32>,

    /// Largest sample count one call may request
    pub max_samples: usize,
}

impl ChainConfig {
    /// Set the sampling interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the dcgm-exporter endpoint
    pub fn with_dcgm_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.dcgm_endpoint = Some(endpoint.into());
        self
    }

    /// Skip the primary tier
    pub fn without_dcgm(mut self) -> Self {
        self.dcgm_endpoint = None;
        self
    }

    /// Enable or disable the NVML tier
    pub fn with_nvml(mut self, enabled: bool) -> Self {
        self.enable_nvml = enabled;
        self
    }

    /// Set the probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Enable bounded re-probing
    pub fn with_reprobe_after(mut self, failures: u32) -> Self {
        self.reprobe_after_failures = Some(failures.max(1));
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_samples == 0 {
            return Err("max_samples must be > 0".to_string());
        }
        if self.probe_timeout.is_zero() {
            return Err("probe_timeout must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

impl From<&TelemetryConfig> for ChainConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            interval: config.interval(),
            dcgm_endpoint: config.dcgm_endpoint.clone(),
            enable_nvml: config.enable_nvml,
            device_index: config.device_index,
            probe_timeout: config.probe_timeout(),
            reprobe_after_failures: config.reprobe_after_failures,
            max_samples: config.max_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_methods() {
        let config = ChainConfig::default()
            .with_interval(Duration::from_millis(10))
            .without_dcgm()
            .with_nvml(false)
            .with_reprobe_after(0);

        assert_eq!(config.interval, Duration::from_millis(10));
        assert!(config.dcgm_endpoint.is_none());
        assert!(!config.enable_nvml);
        assert_eq!(config.reprobe_after_failures, Some(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_core_config() {
        let mut core = TelemetryConfig::default();
        core.interval_ms = 250;
        core.max_samples = 10;

        let config = ChainConfig::from(&core);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.max_samples, 10);
    }
}
