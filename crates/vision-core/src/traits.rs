//! Core traits for visiond components
//!
//! These traits are the seams between the HTTP surface and the two
//! independent flows it fronts: classification and GPU telemetry.

use crate::types::{ClassificationResult, TelemetryReport, TelemetrySourceState};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Turns raw image bytes into ranked class predictions
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one encoded image
    async fn classify(&self, image_bytes: Vec<u8>) -> Result<ClassificationResult>;

    /// Snapshot of the device and artifact state for health reporting
    async fn status(&self) -> ClassifierStatus;
}

/// Polls GPU health telemetry
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Take `samples` consecutive readings from the bound tier
    async fn collect(&self, samples: usize) -> Result<TelemetryReport>;

    /// Which tier is bound, binding one if none is yet
    async fn describe(&self) -> TelemetrySourceState;
}

/// Health view of a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierStatus {
    /// Whether an accelerator backs execution
    pub gpu_available: bool,

    /// Device the executor runs on (`cpu`, `cuda:0`)
    pub device: String,

    /// Artifact status (`uncompiled`, `compiling`, `ready`, `failed`)
    pub engine_status: String,
}
