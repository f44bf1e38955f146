//! End-to-end classification through the pipeline

use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vision_core::{
    BatchProfile, Classifier, CompileWait, DeviceSelector, EngineConfig, EngineKind, Precision,
};
use vision_engine::{
    ArtifactBuilder, ArtifactStatus, Device, EngineError, ExecutablePlan, InferencePipeline, ModelWeights,
    PlanCompiler,
};

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        device: DeviceSelector::Cpu,
        artifact_path: dir.join("classifier.plan"),
        input_size: 32,
        patch_size: 8,
        hidden_dim: 16,
        num_classes: 10,
        batch_profile: BatchProfile::from_max(4),
        ..EngineConfig::default()
    }
}

fn gradient_png(size: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(size, size, |x, y| {
        Rgb([(x * 255 / size) as u8, (y * 255 / size) as u8, ((x + y) % 256) as u8])
    });
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Counts builds and delays each one so concurrent callers overlap
struct SlowCountingBuilder {
    builds: AtomicUsize,
    delay: Duration,
}

impl SlowCountingBuilder {
    fn new(delay: Duration) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            delay,
        }
    }
}

impl ArtifactBuilder for SlowCountingBuilder {
    fn build(&self, weights: &ModelWeights, precision: Precision, profile: BatchProfile) -> vision_engine::Result<ExecutablePlan> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        PlanCompiler::new().build(weights, precision, profile)
    }
}

/// Simulates a host without a working optimizer
struct FailingBuilder;

impl ArtifactBuilder for FailingBuilder {
    fn build(&self, _: &ModelWeights, _: Precision, _: BatchProfile) -> vision_engine::Result<ExecutablePlan> {
        Err(EngineError::Compilation("optimizer not installed".to_string()))
    }
}

#[tokio::test]
async fn classifies_full_resolution_image() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = InferencePipeline::new(EngineConfig {
        device: DeviceSelector::Cpu,
        artifact_path: dir.path().join("resnet.plan"),
        ..EngineConfig::default()
    })
    .unwrap();

    let result = pipeline.classify(gradient_png(224)).await.unwrap();
    assert_eq!(result.engine, EngineKind::Compiled);
    assert!(result.top1.confidence > 0.0);
    assert!(result.latency_ms > 0.0);
    assert!(result.throughput_fps > 0.0);
    assert_eq!(result.batch_size, 1);
    assert_eq!(result.top5.len(), 5);
    assert!(result.is_consistent());
    assert!(result.top1.label.starts_with("class_"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_compiles_once() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Arc::new(SlowCountingBuilder::new(Duration::from_millis(100)));
    let pipeline = Arc::new(
        InferencePipeline::with_parts(config(dir.path()), Device::host(), builder.clone()).unwrap(),
    );

    let image = gradient_png(48);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&pipeline);
        let image = image.clone();
        handles.push(tokio::spawn(async move { pipeline.classify(image).await }));
    }

    let mut labels = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.engine, EngineKind::Compiled);
        assert!(result.is_consistent());
        labels.push(result.top1.label);
    }

    assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    assert!(labels.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn repeated_requests_reuse_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Arc::new(SlowCountingBuilder::new(Duration::ZERO));
    let pipeline = InferencePipeline::with_parts(config(dir.path()), Device::host(), builder.clone()).unwrap();

    for _ in 0..3 {
        pipeline.classify(gradient_png(40)).await.unwrap();
    }
    assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restart_restores_persisted_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(SlowCountingBuilder::new(Duration::ZERO));
    InferencePipeline::with_parts(config(dir.path()), Device::host(), first.clone())
        .unwrap()
        .ensure_artifact()
        .await
        .unwrap();

    let second = Arc::new(SlowCountingBuilder::new(Duration::ZERO));
    let restarted = InferencePipeline::with_parts(config(dir.path()), Device::host(), second.clone()).unwrap();
    let result = restarted.classify(gradient_png(32)).await.unwrap();

    assert_eq!(result.engine, EngineKind::Compiled);
    assert_eq!(first.builds.load(Ordering::SeqCst), 1);
    assert_eq!(second.builds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_compilation_serves_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = InferencePipeline::with_parts(config(dir.path()), Device::host(), Arc::new(FailingBuilder)).unwrap();

    for _ in 0..2 {
        let result = pipeline.classify(gradient_png(32)).await.unwrap();
        assert_eq!(result.engine, EngineKind::Fallback);
        assert!(result.is_consistent());
    }

    let resolved = pipeline.ensure_artifact().await.unwrap();
    assert_eq!(resolved.descriptor.status, ArtifactStatus::Failed);
    assert_eq!(pipeline.status().await.engine_status, "failed");
}

#[tokio::test]
async fn failed_compilation_without_fallback_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        allow_fallback: false,
        ..config(dir.path())
    };
    let pipeline = InferencePipeline::with_parts(config, Device::host(), Arc::new(FailingBuilder)).unwrap();

    let err = pipeline.classify(gradient_png(32)).await.unwrap_err();
    assert_eq!(err.category(), "service_degraded");
    assert_eq!(err.to_http_status(), 503);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degrade_policy_serves_fallback_during_compile() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        compile_wait: CompileWait::Degrade,
        ..config(dir.path())
    };
    let builder = Arc::new(SlowCountingBuilder::new(Duration::from_millis(400)));
    let pipeline = Arc::new(InferencePipeline::with_parts(config, Device::host(), builder.clone()).unwrap());

    let warming = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.ensure_artifact().await })
    };
    while pipeline.status().await.engine_status != "compiling" {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let during = pipeline.classify(gradient_png(32)).await.unwrap();
    assert_eq!(during.engine, EngineKind::Fallback);

    warming.await.unwrap().unwrap();
    let after = pipeline.classify(gradient_png(32)).await.unwrap();
    assert_eq!(after.engine, EngineKind::Compiled);
    assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_images_are_client_errors() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = InferencePipeline::new(config(dir.path())).unwrap();

    for payload in [Vec::new(), b"GIF89a-but-not-really".to_vec()] {
        let err = pipeline.classify(payload).await.unwrap_err();
        assert_eq!(err.category(), "input_validation");
        assert_eq!(err.to_http_status(), 400);
    }
}

#[tokio::test]
async fn preprocessing_time_reported_separately() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = InferencePipeline::new(config(dir.path())).unwrap();
    let result = pipeline.classify(gradient_png(256)).await.unwrap();
    assert!(result.preprocess_ms > 0.0);
}

#[test]
fn required_accelerator_must_exist() {
    if Path::new("/dev/nvidia99").exists() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        device: DeviceSelector::Accelerator(99),
        cpu_fallback: false,
        ..config(dir.path())
    };
    let result = InferencePipeline::new(config);
    assert!(matches!(result, Err(EngineError::DeviceUnavailable(_))));
}

#[tokio::test]
async fn labels_file_names_classes() {
    let dir = tempfile::tempdir().unwrap();
    let labels_path = dir.path().join("labels.txt");
    let names: Vec<String> = (0..10).map(|i| format!("species_{}", i)).collect();
    std::fs::write(&labels_path, names.join("\n")).unwrap();

    let pipeline = InferencePipeline::new(EngineConfig {
        labels_path: Some(labels_path),
        ..config(dir.path())
    })
    .unwrap();
    let result = pipeline.classify(gradient_png(32)).await.unwrap();
    assert!(result.top5.iter().all(|c| c.label.starts_with("species_")));
}
