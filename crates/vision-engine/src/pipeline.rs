//! Classification pipeline: artifact resolution, preprocessing, execution

use crate::artifact::{ArtifactCache, ResolvedArtifact};
use crate::compiler::{ArtifactBuilder, ExecutablePlan, PlanCompiler};
use crate::device::Device;
use crate::executor::Executor;
use crate::fingerprint::Fingerprint;
use crate::model::{resolve_labels, ModelWeights};
use crate::preprocess::Preprocessor;
use crate::{EngineError, Result};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use vision_core::{ClassificationResult, Classifier, ClassifierStatus, EngineConfig, Precision};

/// The classification service object.
///
/// Constructed once per process and shared; tests build isolated instances.
pub struct InferencePipeline {
    config: EngineConfig,
    device: Arc<Device>,
    weights: Arc<ModelWeights>,
    fingerprint: Fingerprint,
    cache: Arc<ArtifactCache<ExecutablePlan>>,
    builder: Arc<dyn ArtifactBuilder>,
    preprocessor: Arc<Preprocessor>,
    executor: Arc<Executor>,
}

impl InferencePipeline {
    /// Open the configured device and load weights
    pub fn new(config: EngineConfig) -> Result<Self> {
        let device = Device::open(&config)?;
        Self::with_parts(config, device, Arc::new(PlanCompiler::new()))
    }

    /// Assemble a pipeline around an explicit device and artifact builder
    pub fn with_parts(config: EngineConfig, device: Device, builder: Arc<dyn ArtifactBuilder>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        let weights = ModelWeights::from_config(&config)?;
        let labels = resolve_labels(&config, &weights)?;
        let checksum = weights.checksum()?;
        let fingerprint = Fingerprint::compute(config.precision, config.batch_profile, &checksum, config.input_size);

        let device = Arc::new(device);
        let weights = Arc::new(weights);
        let cache = Arc::new(ArtifactCache::new(&config.artifact_path, config.compile_wait));
        let executor = Arc::new(Executor::new(
            Arc::clone(&device),
            Arc::clone(&weights),
            Arc::new(labels),
            config.allow_fallback,
        ));

        info!(
            "Inference pipeline on {} with artifact {} ({})",
            device.name(),
            fingerprint.short(),
            cache.storage_path(&fingerprint).display()
        );

        Ok(Self {
            preprocessor: Arc::new(Preprocessor::new(config.input_size)),
            config,
            device,
            weights,
            fingerprint,
            cache,
            builder,
            executor,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn cache(&self) -> &ArtifactCache<ExecutablePlan> {
        &self.cache
    }

    /// Resolve this pipeline's artifact, compiling it on first use
    pub async fn ensure_artifact(&self) -> Result<ResolvedArtifact<ExecutablePlan>> {
        let weights = Arc::clone(&self.weights);
        let builder = Arc::clone(&self.builder);
        let precision = self.config.precision;
        let profile = self.config.batch_profile;

        self.cache
            .ensure_ready(&self.fingerprint, move || builder.build(&weights, precision, profile))
            .await
    }

    /// Classify one encoded image
    pub async fn run(&self, image_bytes: Vec<u8>) -> Result<ClassificationResult> {
        let resolved = self.ensure_artifact().await?;

        let precision = resolved
            .ready()
            .map(|plan| plan.precision())
            .unwrap_or(Precision::Full);
        let residency = self.device.residency();

        let preprocessor = Arc::clone(&self.preprocessor);
        let started = Instant::now();
        let tensor = tokio::task::spawn_blocking(move || preprocessor.prepare(&image_bytes, precision, residency))
            .await
            .map_err(|e| EngineError::Execution(format!("preprocessing task failed: {}", e)))??;
        let preprocess_ms = started.elapsed().as_secs_f64() * 1000.0;

        let executor = Arc::clone(&self.executor);
        let result = tokio::task::spawn_blocking(move || executor.run(&tensor, &resolved))
            .await
            .map_err(|e| EngineError::Execution(format!("execution task failed: {}", e)))??;

        debug!(
            "Classified as {} ({:.3}) via {} in {:.2}ms",
            result.top1.label, result.top1.confidence, result.engine, result.latency_ms
        );

        Ok(result.with_preprocess_ms(preprocess_ms))
    }

    /// Device and artifact state for health reporting
    pub fn snapshot(&self) -> ClassifierStatus {
        let engine_status = self
            .cache
            .descriptor(&self.fingerprint)
            .map(|resolved| resolved.descriptor.status.to_string())
            .unwrap_or_else(|e| format!("unknown ({})", e));

        ClassifierStatus {
            gpu_available: self.device.is_accelerator(),
            device: self.device.name(),
            engine_status,
        }
    }
}

#[async_trait]
impl Classifier for InferencePipeline {
    async fn classify(&self, image_bytes: Vec<u8>) -> vision_core::Result<ClassificationResult> {
        Ok(self.run(image_bytes).await?)
    }

    async fn status(&self) -> ClassifierStatus {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStatus;
    use vision_core::{BatchProfile, DeviceSelector};

    fn small_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            device: DeviceSelector::Cpu,
            artifact_path: dir.join("classifier.plan"),
            input_size: 16,
            patch_size: 8,
            hidden_dim: 8,
            num_classes: 6,
            batch_profile: BatchProfile::from_max(2),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            patch_size: 5,
            ..small_config(dir.path())
        };
        let result = InferencePipeline::with_parts(config, Device::host(), Arc::new(PlanCompiler::new()));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_status_before_and_after_compile() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = InferencePipeline::new(small_config(dir.path())).unwrap();

        let status = pipeline.status().await;
        assert!(!status.gpu_available);
        assert_eq!(status.device, "cpu");
        assert_eq!(status.engine_status, "uncompiled");

        let resolved = pipeline.ensure_artifact().await.unwrap();
        assert_eq!(resolved.descriptor.status, ArtifactStatus::Ready);
        assert_eq!(pipeline.status().await.engine_status, "ready");
    }

    #[tokio::test]
    async fn test_fingerprint_follows_precision() {
        let dir = tempfile::tempdir().unwrap();
        let reduced = InferencePipeline::new(small_config(dir.path())).unwrap();
        let full = InferencePipeline::new(EngineConfig {
            precision: Precision::Full,
            ..small_config(dir.path())
        })
        .unwrap();
        assert_ne!(reduced.fingerprint(), full.fingerprint());
    }
}
