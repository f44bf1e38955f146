//! # vision-core
//!
//! Core types, traits, and utilities for visiond - a GPU image classification
//! service with tiered GPU telemetry.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across all other visiond components. It includes:
//!
//! - Classification results and telemetry samples
//! - Traits for the classification and telemetry flows
//! - Configuration schema and loading
//! - The error taxonomy surfaced to clients

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{AppConfig, CompileWait, DeviceSelector, EngineConfig, LoggingConfig, ServerConfig, TelemetryConfig};
pub use error::{Error, Result};
pub use traits::{Classifier, ClassifierStatus, TelemetryProvider};
pub use types::{
    BatchProfile, ClassificationCandidate, ClassificationResult, EngineKind, Precision, TelemetryReport,
    TelemetrySample, TelemetrySourceState, TelemetryTier,
};
