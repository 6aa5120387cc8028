//! Error types for the handover coordinator.

use std::io;

/// Result type alias for handover operations.
pub type Result<T> = std::result::Result<T, HandoverError>;

/// Error type for handover operations.
#[derive(Debug, thiserror::Error)]
pub enum HandoverError {
    /// Detection violates the schema (vector length, non-finite values, bad payload).
    #[error("malformed detection: {0}")]
    MalformedDetection(String),

    /// Detection references a camera absent from the topology.
    #[error("unknown camera: {0}")]
    UnknownCamera(String),

    /// Registry state is inconsistent. Fatal: the registry must be rebuilt.
    #[error("registry invariant violation: {0}")]
    RegistryInvariantViolation(String),

    /// Message bus connection lost.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HandoverError {
    /// Returns true if the error must escalate to process-level handling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandoverError::RegistryInvariantViolation(_))
    }

    /// Returns true if the error only concerns a single detection.
    pub fn is_per_detection(&self) -> bool {
        matches!(
            self,
            HandoverError::MalformedDetection(_) | HandoverError::UnknownCamera(_)
        )
    }
}
