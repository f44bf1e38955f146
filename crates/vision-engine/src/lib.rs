//! # vision-engine
//!
//! Image classification engine for visiond.
//!
//! This crate provides:
//! - A patch-embedding classifier with loadable or seeded weights
//! - [`PlanCompiler`], which lowers weights into a precision-reduced plan
//! - [`ArtifactCache`], which builds each plan at most once per fingerprint and
//!   persists it across restarts
//! - Image preprocessing into device-tagged tensors
//! - [`Executor`], running the compiled plan or the full-precision reference
//!   path and ranking the top five classes
//! - [`InferencePipeline`], composing the above behind [`vision_core::Classifier`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use vision_core::{Classifier, EngineConfig};
//! use vision_engine::InferencePipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = InferencePipeline::new(EngineConfig::default())?;
//!     pipeline.ensure_artifact().await?;
//!
//!     let bytes = std::fs::read("cat.jpg")?;
//!     let result = pipeline.classify(bytes).await?;
//!     println!("{} ({:.3}) via {}", result.top1.label, result.top1.confidence, result.engine);
//!
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod artifact;
pub mod compiler;
pub mod device;
pub mod executor;
pub mod fingerprint;
pub mod model;
pub mod pipeline;
pub mod preprocess;

// Re-export main types
pub use artifact::{Artifact, ArtifactCache, ArtifactDescriptor, ArtifactStatus, ResolvedArtifact};
pub use compiler::{ArtifactBuilder, ExecutablePlan, PlanCompiler};
pub use device::{Device, Residency};
pub use executor::Executor;
pub use fingerprint::Fingerprint;
pub use model::ModelWeights;
pub use pipeline::InferencePipeline;
pub use preprocess::{DeviceTensor, Preprocessor, TensorData};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the inference engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InputValidation(String),

    #[error("Compilation failed: {0}")]
    Compilation(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Service degraded: {0}")]
    ServiceDegraded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<EngineError> for vision_core::Error {
    fn from(err: EngineError) -> Self {
        use vision_core::Error;
        match err {
            EngineError::InputValidation(msg) => Error::input_validation(msg),
            EngineError::Compilation(msg) => Error::compilation(msg),
            EngineError::DeviceUnavailable(msg) => Error::device_unavailable(msg),
            EngineError::Execution(msg) => Error::inference_execution(msg),
            EngineError::ServiceDegraded(msg) => Error::service_degraded(msg),
            EngineError::Configuration(msg) => Error::config(msg),
            EngineError::Io(e) => Error::Io(e),
            other => Error::inference_execution(other.to_string()),
        }
    }
}
