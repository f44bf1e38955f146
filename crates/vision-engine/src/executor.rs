//! Forward execution, probability normalization and ranking

use crate::artifact::ResolvedArtifact;
use crate::compiler::ExecutablePlan;
use crate::device::Device;
use crate::model::ModelWeights;
use crate::preprocess::DeviceTensor;
use crate::{EngineError, Result};

use ndarray::Axis;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use vision_core::{ClassificationCandidate, ClassificationResult, EngineKind};

/// Number of ranked candidates returned per request
pub const TOP_K: usize = 5;

/// Runs one request on the device through the compiled plan or the reference path
pub struct Executor {
    device: Arc<Device>,
    weights: Arc<ModelWeights>,
    labels: Arc<Vec<String>>,
    allow_fallback: bool,
}

impl Executor {
    pub fn new(device: Arc<Device>, weights: Arc<ModelWeights>, labels: Arc<Vec<String>>, allow_fallback: bool) -> Self {
        Self {
            device,
            weights,
            labels,
            allow_fallback,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Execute `tensor` and rank the first image of the batch.
    ///
    /// Blocks on the device lock. `latency_ms` starts once the lock is held and
    /// covers the forward pass, softmax and top-k.
    pub fn run(&self, tensor: &DeviceTensor, resolved: &ResolvedArtifact<ExecutablePlan>) -> Result<ClassificationResult> {
        let plan = resolved.ready();
        if plan.is_none() && !self.allow_fallback {
            return Err(EngineError::ServiceDegraded(format!(
                "artifact {} is {} and fallback is disabled",
                resolved.descriptor.fingerprint.short(),
                resolved.descriptor.status
            )));
        }

        let batch_size = tensor.batch_size();
        if batch_size == 0 {
            return Err(EngineError::Execution("empty batch".to_string()));
        }

        let _device = self.device.lock()?;
        let started = Instant::now();

        let (logits, engine) = match plan {
            Some(plan) => {
                let input = tensor.as_f32();
                let logits = plan.forward(input.view())?;
                (logits.index_axis(Axis(0), 0).to_vec(), EngineKind::Compiled)
            }
            None => {
                debug!(
                    "Serving through reference path, artifact is {}",
                    resolved.descriptor.status
                );
                let input = tensor.as_f32();
                let image = input.index_axis(Axis(0), 0);
                (self.weights.reference_forward(image), EngineKind::Fallback)
            }
        };

        let probabilities = softmax(&logits);
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(EngineError::Execution(format!(
                "{} path produced non-finite scores",
                engine
            )));
        }
        let ranked = self.rank(&probabilities)?;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        ClassificationResult::from_ranked(ranked, latency_ms, engine, batch_size as u32)
            .ok_or_else(|| EngineError::Execution("model produced no classes".to_string()))
    }

    fn rank(&self, probabilities: &[f32]) -> Result<Vec<ClassificationCandidate>> {
        top_k(probabilities, TOP_K)
            .into_iter()
            .map(|(index, confidence)| {
                let label = self
                    .labels
                    .get(index)
                    .ok_or_else(|| EngineError::Execution(format!("no label for class {}", index)))?;
                Ok(ClassificationCandidate::new(label.clone(), confidence))
            })
            .collect()
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Indices and scores of the `k` largest values, ties broken by lower index
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}
