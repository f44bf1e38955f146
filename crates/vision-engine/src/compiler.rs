//! Lowering model weights into an executable plan
//!
//! A plan stores the patch projection and head transposed for one fused matrix
//! multiply each, at the configured precision. Reduced plans keep weights as
//! IEEE half and accumulate in f32.

use crate::artifact::Artifact;
use crate::model::{ModelWeights, CHANNELS};
use crate::{EngineError, Result};

use half::f16;
use ndarray::{Array1, Array2, Array4, ArrayView3, ArrayView4, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vision_core::{BatchProfile, Precision};

/// Something that can produce an executable plan from weights
pub trait ArtifactBuilder: Send + Sync {
    fn build(&self, weights: &ModelWeights, precision: Precision, profile: BatchProfile) -> Result<ExecutablePlan>;
}

/// Weight matrix at storage precision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StoredMatrix {
    Half(Array2<f16>),
    Full(Array2<f32>),
}

impl StoredMatrix {
    fn store(matrix: &Array2<f32>, precision: Precision) -> Self {
        match precision {
            Precision::Reduced => StoredMatrix::Half(matrix.mapv(f16::from_f32)),
            Precision::Full => StoredMatrix::Full(matrix.clone()),
        }
    }

    fn expand(&self) -> Array2<f32> {
        match self {
            StoredMatrix::Half(matrix) => matrix.mapv(f16::to_f32),
            StoredMatrix::Full(matrix) => matrix.clone(),
        }
    }
}

/// Serialized form of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlanImage {
    precision: Precision,
    batch_profile: BatchProfile,
    input_size: usize,
    patch_size: usize,
    /// `patch_dim x hidden_dim`
    embed_t: StoredMatrix,
    embed_bias: Vec<f32>,
    /// `hidden_dim x num_classes`
    head_t: StoredMatrix,
    head_bias: Vec<f32>,
}

/// A compiled plan ready to execute
#[derive(Debug, Clone)]
pub struct ExecutablePlan {
    image: PlanImage,
    embed_t: Array2<f32>,
    embed_bias: Array1<f32>,
    head_t: Array2<f32>,
    head_bias: Array1<f32>,
}

impl ExecutablePlan {
    fn from_image(image: PlanImage) -> Result<Self> {
        let embed_t = image.embed_t.expand();
        let head_t = image.head_t.expand();
        let patch_dim = CHANNELS * image.patch_size * image.patch_size;

        if image.patch_size == 0 || image.input_size % image.patch_size != 0 {
            return Err(EngineError::Artifact("plan has inconsistent input geometry".to_string()));
        }
        if embed_t.nrows() != patch_dim
            || embed_t.ncols() != image.embed_bias.len()
            || head_t.nrows() != embed_t.ncols()
            || head_t.ncols() != image.head_bias.len()
        {
            return Err(EngineError::Artifact("plan matrices disagree on shape".to_string()));
        }

        Ok(Self {
            embed_bias: Array1::from_vec(image.embed_bias.clone()),
            head_bias: Array1::from_vec(image.head_bias.clone()),
            embed_t,
            head_t,
            image,
        })
    }

    pub fn precision(&self) -> Precision {
        self.image.precision
    }

    pub fn batch_profile(&self) -> BatchProfile {
        self.image.batch_profile
    }

    pub fn input_size(&self) -> usize {
        self.image.input_size
    }

    pub fn num_classes(&self) -> usize {
        self.head_t.ncols()
    }

    /// Run a batch of CHW images, returning `batch x num_classes` logits
    pub fn forward(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let (n, c, h, w) = batch.dim();
        let size = self.image.input_size;
        if c != CHANNELS || h != size || w != size {
            return Err(EngineError::Execution(format!(
                "plan expects (N, {}, {}, {}) input, got ({}, {}, {}, {})",
                CHANNELS, size, size, n, c, h, w
            )));
        }
        if !self.image.batch_profile.admits(n as u32) {
            return Err(EngineError::Execution(format!(
                "batch of {} outside plan bounds {}..={}",
                n, self.image.batch_profile.min, self.image.batch_profile.max
            )));
        }

        let hidden = self.embed_t.ncols();
        let mut pooled = Array2::<f32>::zeros((n, hidden));

        for (index, image) in batch.outer_iter().enumerate() {
            let patches = self.unfold(image);
            let mut projected = patches.dot(&self.embed_t);
            projected += &self.embed_bias;
            projected.mapv_inplace(|v| v.max(0.0));

            let mean = projected
                .mean_axis(Axis(0))
                .ok_or_else(|| EngineError::Execution("image produced no patches".to_string()))?;
            pooled.row_mut(index).assign(&mean);
        }

        let mut logits = pooled.dot(&self.head_t);
        logits += &self.head_bias;
        Ok(logits)
    }

    /// Lay out every patch of one image as a row
    fn unfold(&self, image: ArrayView3<'_, f32>) -> Array2<f32> {
        let patch = self.image.patch_size;
        let side = self.image.input_size / patch;
        let area = patch * patch;

        Array2::from_shape_fn((side * side, CHANNELS * area), |(p, k)| {
            let (py, px) = (p / side, p % side);
            let (c, offset) = (k / area, k % area);
            let (dy, dx) = (offset / patch, offset % patch);
            image[[c, py * patch + dy, px * patch + dx]]
        })
    }
}

impl Artifact for ExecutablePlan {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.image)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let image: PlanImage = bincode::deserialize(bytes)?;
        Self::from_image(image)
    }
}

/// Default builder: transpose, convert precision, then warm up at every batch bound
#[derive(Debug, Clone, Default)]
pub struct PlanCompiler;

impl PlanCompiler {
    pub fn new() -> Self {
        Self
    }

    fn warm_up(plan: &ExecutablePlan) -> Result<()> {
        let profile = plan.batch_profile();
        let size = plan.input_size();
        let mut batches = vec![profile.min, profile.opt, profile.max];
        batches.dedup();

        for batch in batches {
            let input = Array4::from_shape_fn((batch as usize, CHANNELS, size, size), |(n, c, y, x)| {
                ((n + c + y + x) % 7) as f32 / 7.0 - 0.5
            });
            let logits = plan
                .forward(input.view())
                .map_err(|e| EngineError::Compilation(format!("warm-up at batch {} failed: {}", batch, e)))?;

            if logits.dim() != (batch as usize, plan.num_classes()) {
                return Err(EngineError::Compilation(format!(
                    "warm-up at batch {} produced shape {:?}",
                    batch,
                    logits.dim()
                )));
            }
            if logits.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::Compilation(format!(
                    "warm-up at batch {} produced non-finite logits at {} precision",
                    batch,
                    plan.precision()
                )));
            }
            debug!("Warm-up at batch {} passed", batch);
        }
        Ok(())
    }
}

impl ArtifactBuilder for PlanCompiler {
    fn build(&self, weights: &ModelWeights, precision: Precision, profile: BatchProfile) -> Result<ExecutablePlan> {
        profile
            .validate()
            .map_err(|e| EngineError::Compilation(e.to_string()))?;
        weights
            .validate()
            .map_err(|e| EngineError::Compilation(e.to_string()))?;

        info!(
            "Compiling plan: precision={} batch={}/{}/{} classes={}",
            precision,
            profile.min,
            profile.opt,
            profile.max,
            weights.num_classes()
        );

        let image = PlanImage {
            precision,
            batch_profile: profile,
            input_size: weights.input_size,
            patch_size: weights.patch_size,
            embed_t: StoredMatrix::store(&weights.embed.t().to_owned(), precision),
            embed_bias: weights.embed_bias.to_vec(),
            head_t: StoredMatrix::store(&weights.head.t().to_owned(), precision),
            head_bias: weights.head_bias.to_vec(),
        };

        let plan = ExecutablePlan::from_image(image)?;
        Self::warm_up(&plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> ModelWeights {
        ModelWeights::generate(8, 4, 6, 5, 11)
    }

    fn image_batch(n: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, 3, 8, 8), |(i, c, y, x)| ((i * 3 + c * 5 + y * 7 + x) % 11) as f32 / 11.0 - 0.5)
    }

    #[test]
    fn test_full_plan_matches_reference() {
        let weights = tiny();
        let plan = PlanCompiler::new()
            .build(&weights, Precision::Full, BatchProfile::from_max(4))
            .unwrap();

        let batch = image_batch(2);
        let logits = plan.forward(batch.view()).unwrap();
        for (i, image) in batch.outer_iter().enumerate() {
            let reference = weights.reference_forward(image);
            for (a, b) in logits.row(i).iter().zip(&reference) {
                assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_reduced_plan_close_to_reference() {
        let weights = tiny();
        let plan = PlanCompiler::new()
            .build(&weights, Precision::Reduced, BatchProfile::from_max(4))
            .unwrap();
        assert_eq!(plan.precision(), Precision::Reduced);

        let batch = image_batch(1);
        let logits = plan.forward(batch.view()).unwrap();
        let reference = weights.reference_forward(batch.index_axis(Axis(0), 0));
        for (a, b) in logits.row(0).iter().zip(&reference) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_batch_outside_profile() {
        let plan = PlanCompiler::new()
            .build(&tiny(), Precision::Full, BatchProfile::from_max(2))
            .unwrap();
        let result = plan.forward(image_batch(3).view());
        assert!(matches!(result, Err(EngineError::Execution(_))));
    }

    #[test]
    fn test_invalid_profile_fails_compilation() {
        let profile = BatchProfile { min: 3, opt: 2, max: 4 };
        let result = PlanCompiler::new().build(&tiny(), Precision::Full, profile);
        assert!(matches!(result, Err(EngineError::Compilation(_))));
    }

    #[test]
    fn test_non_finite_weights_fail_warm_up() {
        let mut weights = tiny();
        // Overflows f16.
        weights.head.fill(1.0e6);
        weights.embed_bias.fill(1.0);
        let result = PlanCompiler::new().build(&weights, Precision::Reduced, BatchProfile::from_max(2));
        assert!(matches!(result, Err(EngineError::Compilation(_))));
    }

    #[test]
    fn test_plan_encode_decode() {
        let plan = PlanCompiler::new()
            .build(&tiny(), Precision::Reduced, BatchProfile::from_max(4))
            .unwrap();
        let decoded = ExecutablePlan::decode(&plan.encode().unwrap()).unwrap();
        assert_eq!(decoded.image, plan.image);
        assert!(ExecutablePlan::decode(b"not a plan").is_err());
    }
}
