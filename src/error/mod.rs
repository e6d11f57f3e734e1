use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Control plane error types
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Key-value store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Rate limit config not found for {environment}/{endpoint_type}")]
    ConfigNotFound {
        environment: String,
        endpoint_type: String,
    },

    #[error("{message}")]
    LimitExceeded {
        message: String,
        limit: u32,
        retry_after_secs: u64,
    },

    #[error("No healthy worker available for capability '{0}'")]
    NoHealthyWorker(String),

    #[error("Worker execution failed after {attempts} attempts: {message}")]
    WorkerExecutionFailed { attempts: u32, message: String },

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown cache strategy: {0}")]
    InvalidStrategy(String),

    #[error("Unknown endpoint type: {0}")]
    InvalidEndpointType(String),

    #[error("Unknown environment: {0}")]
    InvalidEnvironment(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlPlaneError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlPlaneError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlPlaneError::ConfigNotFound { .. } => StatusCode::NOT_FOUND,
            ControlPlaneError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ControlPlaneError::NoHealthyWorker(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlPlaneError::WorkerExecutionFailed { .. } => StatusCode::BAD_GATEWAY,
            ControlPlaneError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            ControlPlaneError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::InvalidStrategy(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::InvalidEndpointType(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::InvalidEnvironment(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlPlaneError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlPlaneError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlPlaneError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code callers can branch on
    pub fn code(&self) -> &'static str {
        match self {
            ControlPlaneError::Config(_) => "CONFIG_ERROR",
            ControlPlaneError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ControlPlaneError::ConfigNotFound { .. } => "CONFIG_NOT_FOUND",
            ControlPlaneError::LimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ControlPlaneError::NoHealthyWorker(_) => "NO_HEALTHY_WORKER",
            ControlPlaneError::WorkerExecutionFailed { .. } => "WORKER_EXECUTION_FAILED",
            ControlPlaneError::WorkerNotFound(_) => "WORKER_NOT_FOUND",
            ControlPlaneError::InvalidRequest(_) => "INVALID_REQUEST",
            ControlPlaneError::InvalidStrategy(_) => "INVALID_STRATEGY",
            ControlPlaneError::InvalidEndpointType(_) => "INVALID_ENDPOINT_TYPE",
            ControlPlaneError::InvalidEnvironment(_) => "INVALID_ENVIRONMENT",
            ControlPlaneError::Repository(_) => "REPOSITORY_ERROR",
            ControlPlaneError::Serialization(_) => "SERIALIZATION_ERROR",
            ControlPlaneError::Io(_) => "IO_ERROR",
            ControlPlaneError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(e: serde_json::Error) -> Self {
        ControlPlaneError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for ControlPlaneError {
    fn from(e: redis::RedisError) -> Self {
        ControlPlaneError::StoreUnavailable(e.to_string())
    }
}

impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
        });

        let retry_after = match &self {
            ControlPlaneError::LimitExceeded {
                limit,
                retry_after_secs,
                ..
            } => {
                body["limit"] = json!(limit);
                body["retry_after"] = json!(retry_after_secs);
                Some(*retry_after_secs)
            }
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
