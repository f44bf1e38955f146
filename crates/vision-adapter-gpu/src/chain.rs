//! Tier selection and the uniform sampling contract

use crate::config::ChainConfig;
use crate::dcgm::DcgmSource;
use crate::nvml::NvmlSource;
use crate::stub::StubSource;
use crate::{GpuError, Result};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vision_core::types::{TelemetryReport, TelemetrySample, TelemetrySourceState, TelemetryTier};
use vision_core::TelemetryProvider;

/// A bound telemetry tier.
///
/// An enum rather than a trait object: the set of tiers is closed and the
/// bound variant is what `describe` reports.
#[derive(Debug)]
pub enum TelemetryBackend {
    Primary(DcgmSource),
    Secondary(NvmlSource),
    Stub(StubSource),
}

impl TelemetryBackend {
    pub fn tier(&self) -> TelemetryTier {
        match self {
            TelemetryBackend::Primary(_) => TelemetryTier::Primary,
            TelemetryBackend::Secondary(_) => TelemetryTier::Secondary,
            TelemetryBackend::Stub(_) => TelemetryTier::Stub,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            TelemetryBackend::Primary(source) => source.device_id(),
            TelemetryBackend::Secondary(source) => source.device_id(),
            TelemetryBackend::Stub(source) => source.device_id(),
        }
    }

    /// Take one reading from the bound tier
    pub async fn read(&self) -> Result<TelemetrySample> {
        match self {
            TelemetryBackend::Primary(source) => source.read().await,
            TelemetryBackend::Secondary(source) => source.read().await,
            TelemetryBackend::Stub(source) => Ok(source.read()),
        }
    }

    fn state(&self) -> TelemetrySourceState {
        TelemetrySourceState {
            active_tier: self.tier(),
            device_id: self.device_id().to_string(),
        }
    }
}

/// Telemetry collector that binds one tier on first use and keeps it.
pub struct TelemetryChain {
    config: ChainConfig,
    binding: RwLock<Option<Arc<TelemetryBackend>>>,
    bind_lock: Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl TelemetryChain {
    /// Create an unbound chain; tiers are probed on the first call
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            binding: RwLock::new(None),
            bind_lock: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Create a chain already bound to `backend`, skipping the probe
    pub fn with_backend(config: ChainConfig, backend: TelemetryBackend) -> Self {
        Self {
            config,
            binding: RwLock::new(Some(Arc::new(backend))),
            bind_lock: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Poll the bound tier `count` times, `interval` apart.
    ///
    /// A read failure fails the whole call and leaves the binding in place.
    /// Timestamps within one call never decrease.
    pub async fn sample(&self, count: usize) -> Result<Vec<TelemetrySample>> {
        let (_, samples) = self.sample_from_bound(count).await?;
        Ok(samples)
    }

    /// Report the bound tier, probing first if nothing is bound yet
    pub async fn describe(&self) -> TelemetrySourceState {
        self.bound().await.state()
    }

    /// Sample and wrap the result for the metrics endpoint.
    ///
    /// `source` and `device` name the backend that produced the samples.
    pub async fn report(&self, count: usize) -> Result<TelemetryReport> {
        let (backend, samples) = self.sample_from_bound(count).await?;
        Ok(TelemetryReport {
            samples,
            source: backend.tier().source_name().to_string(),
            interval_s: self.config.interval.as_secs_f64(),
            device: Some(backend.device_id().to_string()),
        })
    }

    async fn sample_from_bound(&self, count: usize) -> Result<(Arc<TelemetryBackend>, Vec<TelemetrySample>)> {
        if count == 0 || count > self.config.max_samples {
            return Err(GpuError::Configuration(format!(
                "sample count must be between 1 and {}, got {}",
                self.config.max_samples, count
            )));
        }

        let backend = self.bound().await;
        let mut samples: Vec<TelemetrySample> = Vec::with_capacity(count);

        for i in 0..count {
            if i > 0 && !self.config.interval.is_zero() {
                tokio::time::sleep(self.config.interval).await;
            }

            let mut sample = match backend.read().await {
                Ok(sample) => sample,
                Err(e) => {
                    self.record_failure(&backend, &e).await;
                    return Err(GpuError::Read(format!("{} read failed: {}", backend.tier(), e)));
                }
            };

            if let Some(previous) = samples.last() {
                if sample.timestamp < previous.timestamp {
                    sample.timestamp = previous.timestamp;
                }
            }
            samples.push(sample);
        }

        self.consecutive_failures.store(0, Ordering::Relaxed);
        Ok((backend, samples))
    }

    async fn bound(&self) -> Arc<TelemetryBackend> {
        if let Some(backend) = self.binding.read().await.as_ref() {
            return Arc::clone(backend);
        }

        let _guard = self.bind_lock.lock().await;
        // Another caller may have bound while we waited.
        if let Some(backend) = self.binding.read().await.as_ref() {
            return Arc::clone(backend);
        }

        let backend = Arc::new(self.probe_chain().await);
        info!(
            "Telemetry bound to {} tier (device {})",
            backend.tier(),
            backend.device_id()
        );
        *self.binding.write().await = Some(Arc::clone(&backend));
        backend
    }

    async fn probe_chain(&self) -> TelemetryBackend {
        if let Some(backend) = self.probe_real_tiers().await {
            return backend;
        }
        info!("No GPU telemetry source available, using stub tier");
        TelemetryBackend::Stub(StubSource::new())
    }

    async fn probe_real_tiers(&self) -> Option<TelemetryBackend> {
        if let Some(endpoint) = &self.config.dcgm_endpoint {
            match DcgmSource::probe(endpoint, self.config.device_index, self.config.probe_timeout).await {
                Ok(source) => return Some(TelemetryBackend::Primary(source)),
                Err(e) if e.is_unavailable() => debug!("DCGM tier unavailable: {}", e),
                Err(e) => warn!("DCGM probe failed: {}", e),
            }
        }

        if self.config.enable_nvml {
            let probe = NvmlSource::probe(self.config.device_index);
            match tokio::time::timeout(self.config.probe_timeout, probe).await {
                Ok(Ok(source)) => return Some(TelemetryBackend::Secondary(source)),
                Ok(Err(e)) if e.is_unavailable() => debug!("NVML tier unavailable: {}", e),
                Ok(Err(e)) => warn!("NVML probe failed: {}", e),
                Err(_) => debug!("NVML probe timed out after {:?}", self.config.probe_timeout),
            }
        }

        None
    }

    /// Count a read failure and re-probe when configured to.
    ///
    /// A non-retryable error (the device is gone from the source) re-probes
    /// immediately instead of waiting for the failure threshold.
    async fn record_failure(&self, backend: &Arc<TelemetryBackend>, error: &GpuError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Telemetry read from {} tier failed ({} consecutive): {}",
            backend.tier(),
            failures,
            error
        );

        let Some(threshold) = self.config.reprobe_after_failures else {
            return;
        };
        if !backend.tier().is_real() || (error.is_retryable() && failures < threshold) {
            return;
        }

        let Ok(_guard) = self.bind_lock.try_lock() else {
            return;
        };
        self.consecutive_failures.store(0, Ordering::Relaxed);

        match self.probe_real_tiers().await {
            Some(replacement) => {
                info!(
                    "Telemetry re-probe rebound {} tier to {} tier",
                    backend.tier(),
                    replacement.tier()
                );
                *self.binding.write().await = Some(Arc::new(replacement));
            }
            None => warn!(
                "Telemetry re-probe found no real tier, keeping {} binding",
                backend.tier()
            ),
        }
    }
}

#[async_trait]
impl TelemetryProvider for TelemetryChain {
    async fn collect(&self, samples: usize) -> vision_core::Result<TelemetryReport> {
        Ok(self.report(samples).await?)
    }

    async fn describe(&self) -> TelemetrySourceState {
        TelemetryChain::describe(self).await
    }
}
