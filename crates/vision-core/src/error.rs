//! Error handling for visiond
//!
//! Provides the unified error taxonomy shared by the inference pipeline, the
//! telemetry chain, and the HTTP surface.

/// Result type alias for visiond operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for visiond
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The uploaded payload is empty or is not a decodable image
    #[error("Invalid input: {0}")]
    InputValidation(String),

    /// Building the compiled artifact failed
    #[error("Compilation failed: {0}")]
    Compilation(String),

    /// A device was required but is not present
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Forward pass or post-processing failed for a request
    #[error("Inference execution failed: {0}")]
    InferenceExecution(String),

    /// No compiled artifact is ready and the fallback path is disabled
    #[error("Service degraded: {0}")]
    ServiceDegraded(String),

    /// Reading from the bound telemetry tier failed
    #[error("Telemetry read failed: {0}")]
    TelemetryRead(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Invalid request parameters (outside of image validation)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an input validation error
    pub fn input_validation(msg: impl Into<String>) -> Self {
        Self::InputValidation(msg.into())
    }

    /// Create a compilation error
    pub fn compilation(msg: impl Into<String>) -> Self {
        Self::Compilation(msg.into())
    }

    /// Create a device unavailable error
    pub fn device_unavailable(msg: impl Into<String>) -> Self {
        Self::DeviceUnavailable(msg.into())
    }

    /// Create an inference execution error
    pub fn inference_execution(msg: impl Into<String>) -> Self {
        Self::InferenceExecution(msg.into())
    }

    /// Create a service degraded error
    pub fn service_degraded(msg: impl Into<String>) -> Self {
        Self::ServiceDegraded(msg.into())
    }

    /// Create a telemetry read error
    pub fn telemetry_read(msg: impl Into<String>) -> Self {
        Self::TelemetryRead(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Check if this error is worth retrying by the caller.
    ///
    /// Execution failures are never retried: repeating a device-resident
    /// fault tends to reproduce it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TelemetryRead(_) | Error::ServiceDegraded(_))
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InputValidation(_) | Error::InvalidRequest(_) | Error::InvalidConfiguration(_)
        )
    }

    /// Check if this error indicates a server-side problem
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InputValidation(_) => "input_validation",
            Error::Compilation(_) => "compilation",
            Error::DeviceUnavailable(_) => "device_unavailable",
            Error::InferenceExecution(_) => "inference_execution",
            Error::ServiceDegraded(_) => "service_degraded",
            Error::TelemetryRead(_) => "telemetry_read",
            Error::InvalidConfiguration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InputValidation(_) | Error::InvalidRequest(_) | Error::InvalidConfiguration(_) => 400,
            Error::ServiceDegraded(_) | Error::DeviceUnavailable(_) | Error::TelemetryRead(_) => 503,
            _ => 500,
        }
    }
}
