//! HTTP server, routes and handlers

use crate::metrics::ServiceMetrics;
use crate::{Result, ServerError};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use vision_core::{Classifier, ServerConfig, TelemetryConfig, TelemetryProvider};

/// Name of the multipart field carrying the image
pub const UPLOAD_FIELD: &str = "file";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn Classifier>,
    pub telemetry: Arc<dyn TelemetryProvider>,
    pub metrics: Arc<ServiceMetrics>,
    pub default_samples: usize,
    pub max_samples: usize,
}

/// Error response: `{"error": {"kind", "message"}}` with the mapped status
#[derive(Debug)]
pub struct ApiError(pub vision_core::Error);

impl From<vision_core::Error> for ApiError {
    fn from(err: vision_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "kind": self.0.category(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// HTTP server fronting the classifier and the telemetry provider
pub struct HttpServer {
    config: ServerConfig,
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ServerConfig,
        telemetry_config: &TelemetryConfig,
        classifier: Arc<dyn Classifier>,
        telemetry: Arc<dyn TelemetryProvider>,
    ) -> Result<Self> {
        telemetry_config.validate()?;

        let state = AppState {
            classifier,
            telemetry,
            metrics: Arc::new(ServiceMetrics::new()?),
            default_samples: telemetry_config.default_samples,
            max_samples: telemetry_config.max_samples,
        };

        Ok(Self { config, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the axum router with all routes and middleware
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/infer", post(infer_handler))
            .route("/metrics/gpu", get(gpu_metrics_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr;
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Server(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Starting HTTP server on {}", addr);

        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("HTTP server error: {}", e);
            return Err(ServerError::Server(format!("HTTP server failed: {}", e)));
        }

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Classify the uploaded image
async fn infer_handler(State(state): State<AppState>, multipart: Multipart) -> std::result::Result<Response, ApiError> {
    let outcome = match read_upload(multipart).await {
        Ok(bytes) => state.classifier.classify(bytes).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(result) => {
            state.metrics.observe_inference(&result);
            Ok(Json(result).into_response())
        }
        Err(e) => {
            state.metrics.record_inference_error(&e);
            Err(ApiError(e))
        }
    }
}

/// Pull the image bytes out of the `file` field
async fn read_upload(mut multipart: Multipart) -> vision_core::Result<Vec<u8>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| vision_core::Error::invalid_request(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| vision_core::Error::invalid_request(format!("failed to read upload: {}", e)))?;
        if bytes.is_empty() {
            return Err(vision_core::Error::input_validation("uploaded file is empty"));
        }
        return Ok(bytes.to_vec());
    }

    Err(vision_core::Error::invalid_request(format!(
        "multipart body has no '{}' field",
        UPLOAD_FIELD
    )))
}

#[derive(Debug, Deserialize)]
struct GpuMetricsQuery {
    samples: Option<String>,
}

/// Poll GPU telemetry
async fn gpu_metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<GpuMetricsQuery>,
) -> std::result::Result<Response, ApiError> {
    let samples = match query.samples.as_deref() {
        None => state.default_samples,
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
            vision_core::Error::invalid_request(format!("samples must be an integer, got '{}'", raw))
        })?,
    };

    if samples == 0 || samples > state.max_samples {
        return Err(vision_core::Error::invalid_request(format!(
            "samples must be between 1 and {}, got {}",
            state.max_samples, samples
        ))
        .into());
    }

    match state.telemetry.collect(samples).await {
        Ok(report) => Ok(Json(report).into_response()),
        Err(e) => {
            state.metrics.record_telemetry_error();
            Err(ApiError(e))
        }
    }
}

/// Device and artifact state
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.classifier.status().await;
    let overall = if status.engine_status == "failed" { "degraded" } else { "ok" };

    Json(json!({
        "status": overall,
        "gpu_available": status.gpu_available,
        "device": status.device,
        "engine_status": status.engine_status,
    }))
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to export metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to export metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status() {
        let response = ApiError(vision_core::Error::input_validation("empty")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError(vision_core::Error::service_degraded("no plan")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = ApiError(vision_core::Error::inference_execution("fault")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
