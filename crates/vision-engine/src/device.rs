//! Device selection and the per-process execution lock

use crate::{EngineError, Result};

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use vision_core::{DeviceSelector, EngineConfig};

/// Where a tensor lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Host,
    Accelerator(u32),
}

/// Handle on the execution device.
///
/// Kernels run on the host either way; the handle serializes execution so a
/// process never runs two forward passes on one device at once.
#[derive(Debug)]
pub struct Device {
    residency: Residency,
    exec_lock: Mutex<()>,
}

/// Directory holding the driver device nodes
const DRIVER_NODE_DIR: &str = "/dev";

impl Device {
    /// Host-only device
    pub fn host() -> Self {
        Self {
            residency: Residency::Host,
            exec_lock: Mutex::new(()),
        }
    }

    /// Accelerator device, without probing for it
    pub fn accelerator(index: u32) -> Self {
        Self {
            residency: Residency::Accelerator(index),
            exec_lock: Mutex::new(()),
        }
    }

    /// Open the device the configuration selects.
    ///
    /// An absent accelerator degrades to the host when `cpu_fallback` is set and
    /// fails with [`EngineError::DeviceUnavailable`] otherwise.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        Self::open_with_probe(config, |index| driver_node(index).exists())
    }

    pub(crate) fn open_with_probe(config: &EngineConfig, present: impl Fn(u32) -> bool) -> Result<Self> {
        match config.device {
            DeviceSelector::Cpu => {
                info!("Using host device");
                Ok(Self::host())
            }
            DeviceSelector::Accelerator(index) if present(index) => {
                info!("Using accelerator cuda:{}", index);
                Ok(Self::accelerator(index))
            }
            DeviceSelector::Accelerator(index) if config.cpu_fallback => {
                warn!("Accelerator cuda:{} not present, falling back to host", index);
                Ok(Self::host())
            }
            DeviceSelector::Accelerator(index) => Err(EngineError::DeviceUnavailable(format!(
                "cuda:{} requested but {} does not exist and cpu_fallback is disabled",
                index,
                driver_node(index).display()
            ))),
        }
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self.residency, Residency::Accelerator(_))
    }

    /// Device name as reported by health checks
    pub fn name(&self) -> String {
        match self.residency {
            Residency::Host => "cpu".to_string(),
            Residency::Accelerator(index) => format!("cuda:{}", index),
        }
    }

    /// Take the execution lock, blocking until the device is free
    pub fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.exec_lock
            .lock()
            .map_err(|_| EngineError::Execution(format!("{} lock poisoned by a failed run", self.name())))
    }
}

fn driver_node(index: u32) -> PathBuf {
    Path::new(DRIVER_NODE_DIR).join(format!("nvidia{}", index))
}
