//! # vision-server
//!
//! HTTP surface for visiond.
//!
//! This crate provides:
//! - `POST /infer`, classifying one uploaded image
//! - `GET /metrics/gpu`, polling the bound telemetry tier
//! - `GET /health`, device and artifact state
//! - `GET /metrics`, Prometheus service counters
//! - The `visiond` binary
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vision_adapter_gpu::{ChainConfig, TelemetryChain};
//! use vision_core::AppConfig;
//! use vision_engine::InferencePipeline;
//! use vision_server::HttpServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::default();
//!     let pipeline = Arc::new(InferencePipeline::new(config.engine.clone())?);
//!     let telemetry = Arc::new(TelemetryChain::new(ChainConfig::from(&config.telemetry)));
//!
//!     let server = HttpServer::new(config.server, &config.telemetry, pipeline, telemetry)?;
//!     server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod metrics;
pub mod server;

// Re-export main types
pub use metrics::ServiceMetrics;
pub use server::{ApiError, AppState, HttpServer};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can occur while running the server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] vision_core::Error),

    #[error(transparent)]
    Engine(#[from] vision_engine::EngineError),
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(logging_config: &vision_core::LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| ServerError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ServerError::Configuration("bad bind address".to_string());
        assert_eq!(error.to_string(), "Configuration error: bad bind address");

        let error: ServerError = vision_core::Error::input_validation("empty").into();
        assert_eq!(error.to_string(), "Invalid input: empty");
    }
}
