//! Error types for the fly-tunnel-operator

use std::fmt;

use crate::provider::ProviderError;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Optimistic concurrency conflict on a Kubernetes write
    Conflict(String),
    /// Configuration error
    Configuration(String),
    /// Reconciliation error
    Reconciliation(String),
    /// Remote provider (Fly.io) error
    Provider(ProviderError),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// Invalid resource state
    InvalidState(String),
    /// A user-supplied value failed validation
    Validation(String),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Reconciliation(msg) => write!(f, "Reconciliation error: {}", msg),
            OperatorError::Provider(err) => write!(f, "Fly.io API error: {}", err),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            OperatorError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperatorError::Provider(err) => Some(err),
            _ => None,
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message),
            other => OperatorError::KubeApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<ProviderError> for OperatorError {
    fn from(err: ProviderError) -> Self {
        OperatorError::Provider(err)
    }
}
