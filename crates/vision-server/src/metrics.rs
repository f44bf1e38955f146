//! Prometheus service metrics

use crate::{Result, ServerError};

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use vision_core::ClassificationResult;

/// Latency buckets in milliseconds
const LATENCY_BUCKETS_MS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Counters and histograms for the HTTP surface
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    requests: IntCounterVec,
    errors: IntCounterVec,
    latency: Histogram,
    telemetry_errors: IntCounter,
}

impl ServiceMetrics {
    /// Create the metrics on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("visiond_inference_requests_total", "Classification requests served, by execution path"),
            &["engine"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("visiond_inference_errors_total", "Classification requests failed, by error kind"),
            &["kind"],
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new("visiond_inference_latency_ms", "Forward pass plus post-processing time")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;
        let telemetry_errors = IntCounter::new("visiond_telemetry_errors_total", "Failed GPU telemetry polls")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(telemetry_errors.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            latency,
            telemetry_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_inference(&self, result: &ClassificationResult) {
        self.requests.with_label_values(&[result.engine.as_str()]).inc();
        self.latency.observe(result.latency_ms);
    }

    pub fn record_inference_error(&self, error: &vision_core::Error) {
        self.errors.with_label_values(&[error.category()]).inc();
    }

    pub fn record_telemetry_error(&self) {
        self.telemetry_errors.inc();
    }

    /// Export metrics as Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| ServerError::Server(format!("Metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vision_core::{ClassificationCandidate, EngineKind};

    fn result(engine: EngineKind) -> ClassificationResult {
        ClassificationResult::from_ranked(vec![ClassificationCandidate::new("cat", 0.9)], 3.0, engine, 1).unwrap()
    }

    #[test]
    fn test_metrics_export() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.observe_inference(&result(EngineKind::Compiled));
        metrics.observe_inference(&result(EngineKind::Fallback));
        metrics.observe_inference(&result(EngineKind::Fallback));
        metrics.record_inference_error(&vision_core::Error::input_validation("empty"));
        metrics.record_telemetry_error();

        let text = metrics.export().unwrap();
        assert!(text.contains("visiond_inference_requests_total{engine=\"compiled\"} 1"));
        assert!(text.contains("visiond_inference_requests_total{engine=\"fallback\"} 2"));
        assert!(text.contains("visiond_inference_errors_total{kind=\"input_validation\"} 1"));
        assert!(text.contains("visiond_inference_latency_ms_count 3"));
        assert!(text.contains("visiond_telemetry_errors_total 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = ServiceMetrics::new().unwrap();
        let b = ServiceMetrics::new().unwrap();
        a.record_telemetry_error();
        assert!(b.export().unwrap().contains("visiond_telemetry_errors_total 0"));
    }
}
