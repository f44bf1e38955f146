//! Image decoding and normalization

use crate::device::Residency;
use crate::{EngineError, Result};

use half::f16;
use image::imageops::FilterType;
use ndarray::{Array4, ArrayView4, CowArray, Ix4};
use vision_core::Precision;

/// ImageNet channel means (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Tensor payload at its numeric precision, `N x C x H x W`
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Array4<f16>),
    F32(Array4<f32>),
}

/// Normalized input batch tagged with where it lives
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTensor {
    pub data: TensorData,
    pub residency: Residency,
}

impl DeviceTensor {
    pub fn shape(&self) -> [usize; 4] {
        let (n, c, h, w) = match &self.data {
            TensorData::F16(array) => array.dim(),
            TensorData::F32(array) => array.dim(),
        };
        [n, c, h, w]
    }

    pub fn batch_size(&self) -> usize {
        self.shape()[0]
    }

    pub fn precision(&self) -> Precision {
        match self.data {
            TensorData::F16(_) => Precision::Reduced,
            TensorData::F32(_) => Precision::Full,
        }
    }

    /// Full-precision view, widening half data
    pub fn as_f32(&self) -> CowArray<'_, f32, Ix4> {
        match &self.data {
            TensorData::F16(array) => CowArray::from(array.mapv(f16::to_f32)),
            TensorData::F32(array) => CowArray::from(array.view()),
        }
    }

    pub fn f32_view(&self) -> Option<ArrayView4<'_, f32>> {
        match &self.data {
            TensorData::F32(array) => Some(array.view()),
            TensorData::F16(_) => None,
        }
    }
}

/// Decodes raw image bytes into a normalized single-image batch
#[derive(Debug, Clone)]
pub struct Preprocessor {
    input_size: u32,
}

impl Preprocessor {
    pub fn new(input_size: u32) -> Self {
        Self { input_size }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Decode, resize (bilinear), normalize and convert to `precision`.
    ///
    /// Empty or undecodable input fails with [`EngineError::InputValidation`].
    pub fn prepare(&self, bytes: &[u8], precision: Precision, residency: Residency) -> Result<DeviceTensor> {
        if bytes.is_empty() {
            return Err(EngineError::InputValidation("image payload is empty".to_string()));
        }

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| EngineError::InputValidation(format!("not a supported image: {}", e)))?;

        let size = self.input_size;
        let rgb = decoded.resize_exact(size, size, FilterType::Triangle).to_rgb8();

        let side = size as usize;
        let normalized = Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
        });

        let data = match precision {
            Precision::Reduced => TensorData::F16(normalized.mapv(f16::from_f32)),
            Precision::Full => TensorData::F32(normalized),
        };

        Ok(DeviceTensor { data, residency })
    }
}
