//! Core type definitions for visiond
//!
//! Request-scoped classification results and telemetry samples. Both are
//! immutable once built and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric precision of the compiled artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 16-bit floating point weights and inputs
    Reduced,
    /// 32-bit floating point throughout
    Full,
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reduced" | "fp16" | "half" => Ok(Precision::Reduced),
            "full" | "fp32" | "float" => Ok(Precision::Full),
            _ => Err(format!("Unknown precision mode: {}", s)),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Reduced => write!(f, "reduced"),
            Precision::Full => write!(f, "full"),
        }
    }
}

/// Dynamic batch bounds the artifact is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchProfile {
    /// Smallest batch the artifact accepts
    pub min: u32,

    /// Batch size the artifact is tuned for
    pub opt: u32,

    /// Largest batch the artifact accepts
    pub max: u32,
}

impl BatchProfile {
    /// Derive the profile from a maximum batch size, tuning for `max / 2 + 1`
    pub fn from_max(max: u32) -> Self {
        let max = max.max(1);
        Self {
            min: 1,
            opt: (max / 2 + 1).min(max),
            max,
        }
    }

    /// Check `1 <= min <= opt <= max`
    pub fn validate(&self) -> crate::Result<()> {
        if self.min == 0 || self.min > self.opt || self.opt > self.max {
            return Err(crate::Error::config(format!(
                "Invalid batch profile: min={} opt={} max={} (need 1 <= min <= opt <= max)",
                self.min, self.opt, self.max
            )));
        }
        Ok(())
    }

    /// Check whether a batch size falls within the profile
    pub fn admits(&self, batch_size: u32) -> bool {
        batch_size >= self.min && batch_size <= self.max
    }
}

impl Default for BatchProfile {
    fn default() -> Self {
        Self::from_max(8)
    }
}

/// Execution path that actually served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// The compiled, precision-reduced artifact
    Compiled,
    /// The uncompiled full-precision reference forward pass
    Fallback,
}

impl EngineKind {
    /// Label used for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Compiled => "compiled",
            EngineKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked class prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCandidate {
    /// Human readable label
    pub label: String,

    /// Probability score in [0, 1]
    pub confidence: f32,
}

impl ClassificationCandidate {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Outcome of a single classification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Highest-probability candidate, always equal to `top5[0]`
    pub top1: ClassificationCandidate,

    /// Up to five candidates sorted by descending confidence
    pub top5: Vec<ClassificationCandidate>,

    /// Forward pass plus post-processing wall-clock time
    pub latency_ms: f64,

    /// `batch_size / (latency_ms / 1000)`
    pub throughput_fps: f64,

    /// Path that actually executed
    pub engine: EngineKind,

    /// Number of images in the executed batch
    pub batch_size: u32,

    /// Decode, resize and normalize time (not part of `latency_ms`)
    #[serde(default)]
    pub preprocess_ms: f64,
}

impl ClassificationResult {
    /// Assemble a result from candidates already ranked by the executor.
    ///
    /// Returns `None` when there are no candidates.
    pub fn from_ranked(
        ranked: Vec<ClassificationCandidate>,
        latency_ms: f64,
        engine: EngineKind,
        batch_size: u32,
    ) -> Option<Self> {
        let top1 = ranked.first()?.clone();
        let latency_ms = latency_ms.max(f64::EPSILON);
        Some(Self {
            top1,
            top5: ranked.into_iter().take(5).collect(),
            latency_ms,
            throughput_fps: throughput_fps(batch_size, latency_ms),
            engine,
            batch_size,
            preprocess_ms: 0.0,
        })
    }

    /// Attach the preprocessing time
    pub fn with_preprocess_ms(mut self, preprocess_ms: f64) -> Self {
        self.preprocess_ms = preprocess_ms;
        self
    }

    /// Check that `top5` is sorted descending and headed by `top1`
    pub fn is_consistent(&self) -> bool {
        self.top5.first() == Some(&self.top1)
            && self.top5.len() <= 5
            && self
                .top5
                .windows(2)
                .all(|pair| pair[0].confidence >= pair[1].confidence)
    }
}

/// Frames per second for a batch executed in `latency_ms`
pub fn throughput_fps(batch_size: u32, latency_ms: f64) -> f64 {
    if latency_ms <= 0.0 {
        return 0.0;
    }
    batch_size as f64 / (latency_ms / 1000.0)
}

/// Telemetry source priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryTier {
    /// High-fidelity vendor daemon (DCGM)
    Primary,
    /// Driver-level management library (NVML)
    Secondary,
    /// Deterministic synthetic generator
    Stub,
}

impl TelemetryTier {
    /// Name reported as `source` by the metrics endpoint
    pub fn source_name(&self) -> &'static str {
        match self {
            TelemetryTier::Primary => "dcgm",
            TelemetryTier::Secondary => "nvml",
            TelemetryTier::Stub => "stub",
        }
    }

    /// Whether this tier reads real hardware
    pub fn is_real(&self) -> bool {
        !matches!(self, TelemetryTier::Stub)
    }
}

impl fmt::Display for TelemetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_name())
    }
}

/// Tier binding of the telemetry chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySourceState {
    /// Tier bound at first successful probe
    pub active_tier: TelemetryTier,

    /// Device identifier as reported by the tier
    pub device_id: String,
}

/// One GPU telemetry reading, normalized across tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// GPU utilization percentage
    pub gpu_util_pct: f64,

    /// Memory (copy engine) utilization percentage
    pub mem_util_pct: f64,

    /// Framebuffer used in MiB
    pub memory_used_mb: f64,

    /// Framebuffer total in MiB
    pub memory_total_mb: f64,

    /// Instantaneous power draw in watts
    pub power_w: f64,

    /// Power cap in watts
    pub power_limit_w: f64,

    /// GPU temperature in Celsius
    pub temperature_c: f64,

    /// Epoch timestamp in seconds
    pub timestamp: f64,
}

impl TelemetrySample {
    /// Clamp percentages to [0, 100] and used values to their reported totals.
    ///
    /// A total or limit of zero means the source could not report it and the
    /// paired value is left alone.
    pub fn normalized(mut self) -> Self {
        self.gpu_util_pct = self.gpu_util_pct.clamp(0.0, 100.0);
        self.mem_util_pct = self.mem_util_pct.clamp(0.0, 100.0);
        self.memory_used_mb = self.memory_used_mb.max(0.0);
        self.power_w = self.power_w.max(0.0);
        if self.memory_total_mb > 0.0 {
            self.memory_used_mb = self.memory_used_mb.min(self.memory_total_mb);
        }
        if self.power_limit_w > 0.0 {
            self.power_w = self.power_w.min(self.power_limit_w);
        }
        self
    }

    /// Check the memory and power bounds
    pub fn within_bounds(&self) -> bool {
        let memory_ok = self.memory_total_mb <= 0.0 || self.memory_used_mb <= self.memory_total_mb;
        let power_ok = self.power_limit_w <= 0.0 || self.power_w <= self.power_limit_w;
        memory_ok && power_ok
    }
}

/// Current wall-clock time as epoch seconds
pub fn epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Payload returned by the GPU metrics endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Samples in polling order
    pub samples: Vec<TelemetrySample>,

    /// Telemetry provider (dcgm, nvml or stub)
    pub source: String,

    /// Sampling interval in seconds
    pub interval_s: f64,

    /// Device identifier
    pub device: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(label: &str, confidence: f32) -> ClassificationCandidate {
        ClassificationCandidate::new(label, confidence)
    }

    #[test]
    fn test_precision_parsing() {
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::Reduced);
        assert_eq!("FULL".parse::<Precision>().unwrap(), Precision::Full);
        assert!("int8".parse::<Precision>().is_err());
        assert_eq!(Precision::Reduced.to_string(), "reduced");
    }

    #[test]
    fn test_batch_profile_from_max() {
        let profile = BatchProfile::from_max(8);
        assert_eq!(profile, BatchProfile { min: 1, opt: 5, max: 8 });
        assert!(profile.validate().is_ok());
        assert!(profile.admits(1));
        assert!(!profile.admits(9));

        let single = BatchProfile::from_max(1);
        assert_eq!(single, BatchProfile { min: 1, opt: 1, max: 1 });
    }

    #[test]
    fn test_batch_profile_validation() {
        let bad = BatchProfile { min: 4, opt: 2, max: 8 };
        assert!(bad.validate().is_err());
        let zero = BatchProfile { min: 0, opt: 1, max: 1 };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_result_from_ranked() {
        let ranked = vec![
            candidate("cat", 0.42),
            candidate("dog", 0.33),
            candidate("fox", 0.09),
            candidate("wolf", 0.08),
            candidate("horse", 0.05),
            candidate("cow", 0.03),
        ];
        let result = ClassificationResult::from_ranked(ranked, 12.5, EngineKind::Compiled, 1).unwrap();
        assert_eq!(result.top1.label, "cat");
        assert_eq!(result.top5.len(), 5);
        assert!(result.is_consistent());
        assert!((result.throughput_fps - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_result_from_empty() {
        assert!(ClassificationResult::from_ranked(Vec::new(), 1.0, EngineKind::Fallback, 1).is_none());
    }

    #[test]
    fn test_engine_kind_serialization() {
        let json = serde_json::to_string(&EngineKind::Fallback).unwrap();
        assert_eq!(json, "\"Fallback\"");
    }

    #[test]
    fn test_sample_normalization() {
        let sample = TelemetrySample {
            gpu_util_pct: 130.0,
            mem_util_pct: -2.0,
            memory_used_mb: 9000.0,
            memory_total_mb: 8192.0,
            power_w: 260.0,
            power_limit_w: 250.0,
            temperature_c: 50.0,
            timestamp: 0.0,
        }
        .normalized();
        assert_eq!(sample.gpu_util_pct, 100.0);
        assert_eq!(sample.mem_util_pct, 0.0);
        assert_eq!(sample.memory_used_mb, 8192.0);
        assert_eq!(sample.power_w, 250.0);
        assert!(sample.within_bounds());
    }

    #[test]
    fn test_sample_unreported_totals() {
        let sample = TelemetrySample {
            gpu_util_pct: 10.0,
            mem_util_pct: 5.0,
            memory_used_mb: 512.0,
            memory_total_mb: 0.0,
            power_w: 80.0,
            power_limit_w: 0.0,
            temperature_c: 40.0,
            timestamp: 0.0,
        }
        .normalized();
        assert_eq!(sample.memory_used_mb, 512.0);
        assert_eq!(sample.power_w, 80.0);
        assert!(sample.within_bounds());
    }

    #[test]
    fn test_tier_names() {
        assert_eq!(TelemetryTier::Primary.source_name(), "dcgm");
        assert_eq!(TelemetryTier::Secondary.to_string(), "nvml");
        assert!(!TelemetryTier::Stub.is_real());
    }
}
