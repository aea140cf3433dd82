//! Common error types for ModelServe
//!
//! This module defines the error taxonomy shared by the registry, the batch
//! scheduler and the dispatcher. All errors are convertible to gRPC status
//! codes so the gateway can report a specific reason to the client.

use thiserror::Error;

/// Main error type for ModelServe
#[derive(Error, Debug)]
pub enum ServeError {
    /// Missing or corrupt model files at registration
    #[error("Invalid artifact: {0}")]
    ArtifactInvalid(String),

    /// Unknown model or version
    #[error("Not found: {0}")]
    NotFound(String),

    /// Runtime error while materializing a model
    #[error("Model load failed: {0}")]
    LoadFailed(String),

    /// Failure during the batched compute step
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Request rejected before batching because its model could not be loaded
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// Out-of-range request parameter
    #[error("Validation error: {0}")]
    Validation(String),

    /// Catalog persistence errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue full (backpressure)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Replica unavailable
    #[error("Replica unavailable: {0}")]
    ReplicaUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ServeError {
    fn from(err: config::ConfigError) -> Self {
        ServeError::Config(err.to_string())
    }
}

impl ServeError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            ServeError::ArtifactInvalid(msg) => {
                tonic::Status::failed_precondition(format!("Invalid artifact: {}", msg))
            }
            ServeError::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            ServeError::LoadFailed(msg) => {
                tonic::Status::internal(format!("Model load failed: {}", msg))
            }
            ServeError::Generation(msg) => {
                tonic::Status::internal(format!("Generation failed: {}", msg))
            }
            ServeError::ModelUnavailable(msg) => {
                tonic::Status::unavailable(format!("Model unavailable: {}", msg))
            }
            ServeError::Validation(msg) => tonic::Status::invalid_argument(msg.clone()),
            ServeError::Registry(msg) => {
                tonic::Status::internal(format!("Registry error: {}", msg))
            }
            ServeError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            ServeError::Serialization(err) => {
                tonic::Status::internal(format!("Serialization error: {}", err))
            }
            ServeError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            ServeError::QueueFull(msg) => {
                tonic::Status::resource_exhausted(format!("Queue full: {}", msg))
            }
            ServeError::Timeout(msg) => {
                tonic::Status::deadline_exceeded(format!("Timeout: {}", msg))
            }
            ServeError::ReplicaUnavailable(msg) => {
                tonic::Status::unavailable(format!("Replica unavailable: {}", msg))
            }
            ServeError::Internal(msg) => {
                tonic::Status::internal(format!("Internal error: {}", msg))
            }
        }
    }

    /// Whether a caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServeError::QueueFull(_) | ServeError::Timeout(_) | ServeError::ReplicaUnavailable(_)
        )
    }

    /// Create an invalid artifact error
    pub fn artifact_invalid(msg: impl Into<String>) -> Self {
        ServeError::ArtifactInvalid(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        ServeError::NotFound(msg.into())
    }

    /// Create a load failed error
    pub fn load_failed(msg: impl Into<String>) -> Self {
        ServeError::LoadFailed(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        ServeError::Generation(msg.into())
    }

    /// Create a model unavailable error
    pub fn model_unavailable(msg: impl Into<String>) -> Self {
        ServeError::ModelUnavailable(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ServeError::Validation(msg.into())
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        ServeError::Registry(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ServeError::Config(msg.into())
    }

    /// Create a queue full error
    pub fn queue_full(msg: impl Into<String>) -> Self {
        ServeError::QueueFull(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ServeError::Timeout(msg.into())
    }

    /// Create a replica unavailable error
    pub fn replica_unavailable(msg: impl Into<String>) -> Self {
        ServeError::ReplicaUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ServeError::Internal(msg.into())
    }
}

/// Result type alias for ModelServe operations
pub type Result<T> = std::result::Result<T, ServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = ServeError::validation("temperature 2.5 outside [0, 2]").to_status();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = ServeError::model_unavailable("demo").to_status();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status = ServeError::not_found("demo:9.9").to_status();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_retryable() {
        assert!(ServeError::queue_full("full").is_retryable());
        assert!(ServeError::timeout("slow").is_retryable());
        assert!(!ServeError::generation("boom").is_retryable());
        assert!(!ServeError::validation("bad").is_retryable());
    }
}
