//! NVML (NVIDIA Management Library) backend
//!
//! NVML calls block, so every read is moved onto the blocking pool. The
//! library handle is initialized once at probe time and shared.

use crate::{GpuError, Result};

use vision_core::types::TelemetrySample;

#[cfg(feature = "nvml")]
use std::sync::Arc;
#[cfg(feature = "nvml")]
use tracing::{debug, info};
#[cfg(feature = "nvml")]
use vision_core::types::epoch_seconds;

/// Secondary-tier source reading one GPU through NVML
#[derive(Clone)]
pub struct NvmlSource {
    #[cfg(feature = "nvml")]
    nvml: Arc<nvml_wrapper::Nvml>,
    gpu_index: u32,
    device_name: String,
}

impl std::fmt::Debug for NvmlSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmlSource")
            .field("gpu_index", &self.gpu_index)
            .field("device_name", &self.device_name)
            .finish()
    }
}

#[cfg(feature = "nvml")]
impl NvmlSource {
    /// Initialize NVML and confirm the device answers a full reading
    pub async fn probe(gpu_index: u32) -> Result<Self> {
        debug!("Probing NVML for GPU {}", gpu_index);

        let (nvml, device_name) = tokio::task::spawn_blocking(move || {
            let nvml = nvml_wrapper::Nvml::init()
                .map_err(|e| GpuError::Unavailable(format!("NVML init failed: {}", e)))?;
            let device_name = {
                let device = nvml
                    .device_by_index(gpu_index)
                    .map_err(|e| GpuError::GpuNotFound(format!("GPU {}: {}", gpu_index, e)))?;
                let name = device.name().unwrap_or_else(|_| format!("GPU {}", gpu_index));
                read_device(&device, 0.0)
                    .map_err(|e| GpuError::Unavailable(format!("GPU {} unreadable: {}", gpu_index, e)))?;
                name
            };
            Ok::<_, GpuError>((nvml, device_name))
        })
        .await
        .map_err(|e| GpuError::Unavailable(format!("NVML probe task failed: {}", e)))??;

        info!("NVML bound to {} (index {})", device_name, gpu_index);

        Ok(Self {
            nvml: Arc::new(nvml),
            gpu_index,
            device_name,
        })
    }

    /// Take one reading
    pub async fn read(&self) -> Result<TelemetrySample> {
        let nvml = Arc::clone(&self.nvml);
        let gpu_index = self.gpu_index;

        tokio::task::spawn_blocking(move || {
            let device = nvml
                .device_by_index(gpu_index)
                .map_err(|e| GpuError::Read(format!("GPU {} lost: {}", gpu_index, e)))?;
            read_device(&device, epoch_seconds())
        })
        .await
        .map_err(|e| GpuError::Read(format!("NVML read task failed: {}", e)))?
    }
}

#[cfg(not(feature = "nvml"))]
impl NvmlSource {
    /// NVML support was not compiled in
    pub async fn probe(gpu_index: u32) -> Result<Self> {
        Err(GpuError::Unavailable(format!(
            "NVML support not compiled in (GPU {})",
            gpu_index
        )))
    }

    pub async fn read(&self) -> Result<TelemetrySample> {
        Err(GpuError::Read("NVML support not compiled in".to_string()))
    }
}

impl NvmlSource {
    /// Device identifier reported for this source
    pub fn device_id(&self) -> &str {
        &self.device_name
    }
}

#[cfg(feature = "nvml")]
fn read_device(device: &nvml_wrapper::Device<'_>, timestamp: f64) -> Result<TelemetrySample> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;

    let nvml_err = |what: &str, e: nvml_wrapper::error::NvmlError| GpuError::NvmlError(format!("{}: {}", what, e));

    let utilization = device
        .utilization_rates()
        .map_err(|e| nvml_err("utilization", e))?;
    let memory = device.memory_info().map_err(|e| nvml_err("memory", e))?;
    // Power and temperature are optional on some boards.
    let power_mw = device.power_usage().unwrap_or(0);
    let limit_mw = device.enforced_power_limit().unwrap_or(0);
    let temperature = device.temperature(TemperatureSensor::Gpu).unwrap_or(0);

    Ok(sample_from_raw(
        utilization.gpu,
        utilization.memory,
        memory.used,
        memory.total,
        power_mw,
        limit_mw,
        temperature,
        timestamp,
    ))
}

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Convert NVML units (bytes, milliwatts) into a normalized sample
#[allow(clippy::too_many_arguments)]
pub fn sample_from_raw(
    gpu_util: u32,
    mem_util: u32,
    used_bytes: u64,
    total_bytes: u64,
    power_mw: u32,
    limit_mw: u32,
    temperature_c: u32,
    timestamp: f64,
) -> TelemetrySample {
    TelemetrySample {
        gpu_util_pct: gpu_util as f64,
        mem_util_pct: mem_util as f64,
        memory_used_mb: used_bytes as f64 / BYTES_PER_MIB,
        memory_total_mb: total_bytes as f64 / BYTES_PER_MIB,
        power_w: power_mw as f64 / 1000.0,
        power_limit_w: limit_mw as f64 / 1000.0,
        temperature_c: temperature_c as f64,
        timestamp,
    }
    .normalized()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        let sample = sample_from_raw(55, 20, 4 * 1024 * 1024 * 1024, 16 * 1024 * 1024 * 1024, 120_500, 300_000, 61, 5.0);
        assert_eq!(sample.gpu_util_pct, 55.0);
        assert_eq!(sample.memory_used_mb, 4096.0);
        assert_eq!(sample.memory_total_mb, 16384.0);
        assert_eq!(sample.power_w, 120.5);
        assert_eq!(sample.power_limit_w, 300.0);
        assert_eq!(sample.temperature_c, 61.0);
        assert_eq!(sample.timestamp, 5.0);
    }

    #[test]
    fn test_conversion_respects_bounds() {
        let sample = sample_from_raw(140, 0, 10, 5, 400_000, 250_000, 40, 0.0);
        assert_eq!(sample.gpu_util_pct, 100.0);
        assert!(sample.within_bounds());
    }

    #[tokio::test]
    async fn test_probe_without_driver() {
        // CI hosts carry no NVIDIA driver; a probe must fail cleanly rather than panic.
        if std::path::Path::new("/dev/nvidiactl").exists() {
            return;
        }
        let result = NvmlSource::probe(0).await;
        assert!(result.is_err());
    }
}
