//! Patch-embedding classifier weights and the reference forward pass
//!
//! The input image is cut into non-overlapping `patch x patch` tiles. Each tile
//! is flattened channel-major, projected to `hidden_dim`, passed through ReLU,
//! and the projections are mean-pooled into one vector that a linear head maps
//! onto `num_classes` logits.

use crate::{EngineError, Result};

use ndarray::{Array1, Array2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{info, warn};
use vision_core::EngineConfig;

/// Input channels (RGB)
pub const CHANNELS: usize = 3;

/// Model weights as stored on disk (bincode)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Square input resolution
    pub input_size: usize,

    /// Patch side length
    pub patch_size: usize,

    /// Patch projection, `hidden_dim x patch_dim`
    pub embed: Array2<f32>,

    /// Patch projection bias, `hidden_dim`
    pub embed_bias: Array1<f32>,

    /// Classification head, `num_classes x hidden_dim`
    pub head: Array2<f32>,

    /// Classification head bias, `num_classes`
    pub head_bias: Array1<f32>,

    /// Class names shipped with the weights
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

impl ModelWeights {
    /// Deterministic weights for hosts without a weights file
    pub fn generate(input_size: usize, patch_size: usize, hidden_dim: usize, num_classes: usize, seed: u64) -> Self {
        let patch_dim = CHANNELS * patch_size * patch_size;
        let mut rng = StdRng::seed_from_u64(seed);

        let embed_scale = (1.0 / patch_dim as f32).sqrt();
        let head_scale = (1.0 / hidden_dim as f32).sqrt();

        let embed = Array2::from_shape_simple_fn((hidden_dim, patch_dim), || rng.gen_range(-embed_scale..embed_scale));
        let embed_bias = Array1::from_shape_simple_fn(hidden_dim, || rng.gen_range(-0.1f32..0.1));
        let head = Array2::from_shape_simple_fn((num_classes, hidden_dim), || rng.gen_range(-head_scale..head_scale));
        let head_bias = Array1::from_shape_simple_fn(num_classes, || rng.gen_range(-0.1f32..0.1));

        Self {
            input_size,
            patch_size,
            embed,
            embed_bias,
            head,
            head_bias,
            labels: None,
        }
    }

    /// Load weights from `weights_path`, or generate them from `seed`
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let weights = match &config.weights_path {
            Some(path) => Self::load(path)?,
            None => {
                info!("No weights_path configured, generating weights from seed {:#x}", config.seed);
                Self::generate(
                    config.input_size as usize,
                    config.patch_size as usize,
                    config.hidden_dim,
                    config.num_classes,
                    config.seed,
                )
            }
        };

        if weights.input_size != config.input_size as usize {
            return Err(EngineError::Configuration(format!(
                "weights expect {}x{} input but input_size is {}",
                weights.input_size, weights.input_size, config.input_size
            )));
        }
        Ok(weights)
    }

    /// Read bincode-encoded weights
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::Model(format!("Failed to read weights {}: {}", path.display(), e)))?;
        let weights: Self = bincode::deserialize(&bytes)?;
        weights.validate()?;
        info!(
            "Loaded weights from {} ({} classes, hidden {})",
            path.display(),
            weights.num_classes(),
            weights.hidden_dim()
        );
        Ok(weights)
    }

    /// Write bincode-encoded weights
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode()?)?;
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// SHA-256 of the encoded weights, hex
    pub fn checksum(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.encode()?)))
    }

    pub fn hidden_dim(&self) -> usize {
        self.embed.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.head.nrows()
    }

    pub fn patch_dim(&self) -> usize {
        CHANNELS * self.patch_size * self.patch_size
    }

    pub fn patches_per_side(&self) -> usize {
        self.input_size / self.patch_size
    }

    /// Check that every matrix agrees with the declared geometry
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.input_size == 0 || self.input_size % self.patch_size != 0 {
            return Err(EngineError::Model(format!(
                "input_size {} is not a positive multiple of patch_size {}",
                self.input_size, self.patch_size
            )));
        }
        if self.embed.ncols() != self.patch_dim() {
            return Err(EngineError::Model(format!(
                "embed has {} columns, expected {}",
                self.embed.ncols(),
                self.patch_dim()
            )));
        }
        if self.embed_bias.len() != self.hidden_dim() || self.head.ncols() != self.hidden_dim() {
            return Err(EngineError::Model("hidden dimension mismatch".to_string()));
        }
        if self.head_bias.len() != self.num_classes() {
            return Err(EngineError::Model("head bias does not match class count".to_string()));
        }
        if self.num_classes() == 0 {
            return Err(EngineError::Model("model has no classes".to_string()));
        }
        Ok(())
    }

    /// Unfused full-precision forward pass over one CHW image.
    ///
    /// Returns raw logits. This is the path served when no compiled plan is
    /// ready, so it favors plain loops over speed.
    pub fn reference_forward(&self, image: ArrayView3<'_, f32>) -> Vec<f32> {
        let patch = self.patch_size;
        let side = self.patches_per_side();
        let hidden = self.hidden_dim();

        let mut pooled = vec![0.0f32; hidden];
        let mut projection = vec![0.0f32; hidden];

        for py in 0..side {
            for px in 0..side {
                for (h, value) in projection.iter_mut().enumerate() {
                    let mut acc = self.embed_bias[h];
                    let mut k = 0;
                    for c in 0..CHANNELS {
                        for dy in 0..patch {
                            for dx in 0..patch {
                                acc += self.embed[[h, k]] * image[[c, py * patch + dy, px * patch + dx]];
                                k += 1;
                            }
                        }
                    }
                    *value = acc.max(0.0);
                }
                for (sum, value) in pooled.iter_mut().zip(&projection) {
                    *sum += value;
                }
            }
        }

        let count = (side * side) as f32;
        pooled.iter_mut().for_each(|v| *v /= count);

        (0..self.num_classes())
            .map(|class| {
                let row = self.head.row(class);
                row.iter().zip(&pooled).map(|(w, x)| w * x).sum::<f32>() + self.head_bias[class]
            })
            .collect()
    }
}

/// Resolve class names: `labels_path`, then the weights file, then `class_{idx}`.
///
/// The result always holds exactly `num_classes` names.
pub fn resolve_labels(config: &EngineConfig, weights: &ModelWeights) -> Result<Vec<String>> {
    let num_classes = weights.num_classes();

    let mut labels = match (&config.labels_path, &weights.labels) {
        (Some(path), _) => std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("Failed to read labels {}: {}", path.display(), e)))?
            .lines()
            .map(str::trim)
            .enumerate()
            .map(|(idx, line)| match line {
                "" => format!("class_{}", idx),
                name => name.to_string(),
            })
            .collect(),
        (None, Some(labels)) => labels.clone(),
        (None, None) => Vec::new(),
    };

    if !labels.is_empty() && labels.len() != num_classes {
        warn!("{} labels for {} classes, padding or truncating", labels.len(), num_classes);
    }
    labels.truncate(num_classes);
    let known = labels.len();
    labels.extend((known..num_classes).map(|idx| format!("class_{}", idx)));

    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use std::io::Write;

    fn tiny() -> ModelWeights {
        ModelWeights::generate(8, 4, 6, 5, 7)
    }

    #[test]
    fn test_generate_is_deterministic() {
        assert_eq!(tiny(), tiny());
        assert_ne!(tiny(), ModelWeights::generate(8, 4, 6, 5, 8));
        assert!(tiny().validate().is_ok());
    }

    #[test]
    fn test_geometry() {
        let weights = tiny();
        assert_eq!(weights.patch_dim(), 48);
        assert_eq!(weights.patches_per_side(), 2);
        assert_eq!(weights.hidden_dim(), 6);
        assert_eq!(weights.num_classes(), 5);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = tiny();
        let mut b = tiny();
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        b.head_bias[0] += 1.0;
        assert_ne!(a.checksum().unwrap(), b.checksum().unwrap());
        assert_eq!(a.checksum().unwrap().len(), 64);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let mut weights = tiny();
        weights.labels = Some(vec!["a".into(), "b".into()]);
        weights.save(&path).unwrap();
        assert_eq!(ModelWeights::load(&path).unwrap(), weights);
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let mut weights = tiny();
        weights.head_bias = Array1::zeros(3);
        assert!(matches!(weights.validate(), Err(EngineError::Model(_))));
    }

    #[test]
    fn test_reference_forward_on_zero_image() {
        let weights = tiny();
        let image = Array3::<f32>::zeros((3, 8, 8));
        let logits = weights.reference_forward(image.view());
        assert_eq!(logits.len(), 5);

        // A zero image leaves only the biases: relu(embed_bias) pooled through the head.
        let hidden: Vec<f32> = weights.embed_bias.iter().map(|b| b.max(0.0)).collect();
        let expected: f32 = weights.head.row(0).iter().zip(&hidden).map(|(w, x)| w * x).sum::<f32>()
            + weights.head_bias[0];
        assert!((logits[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_label_resolution_order() {
        let mut weights = tiny();
        let config = EngineConfig::default();
        let labels = resolve_labels(&config, &weights).unwrap();
        assert_eq!(labels, vec!["class_0", "class_1", "class_2", "class_3", "class_4"]);

        weights.labels = Some(vec!["cat".into(), "dog".into()]);
        let labels = resolve_labels(&config, &weights).unwrap();
        assert_eq!(labels[..3], ["cat", "dog", "class_2"]);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tabby\n\nbeagle\nfox\nwolf\nhorse\ncow").unwrap();
        let config = EngineConfig {
            labels_path: Some(file.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let labels = resolve_labels(&config, &weights).unwrap();
        assert_eq!(labels, vec!["tabby", "class_1", "beagle", "fox", "wolf"]);
    }
}
