//! Error types for the PostgreSQL Operator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operator lacks the privileges required in a namespace
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A controller group operation could not proceed
    #[error("Controller group error: {0}")]
    ControllerGroup(String),

    /// A bounded wait ran out of time
    #[error("Timed out after {timeout:?}: {message}")]
    Timeout { message: String, timeout: Duration },

    /// A bounded wait was cancelled before completing
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Command executed inside a pod failed
    #[error("Exec error: {0}")]
    Exec(String),

    /// Rejected cluster state change
    #[error("Invalid lifecycle transition for cluster {cluster}: {from} -> {to}")]
    InvalidTransition {
        cluster: String,
        from: String,
        to: String,
    },

    /// A resource expected by a workflow is missing
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Task type not handled by the operator
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Event publishing error
    #[error("Event error: {0}")]
    Event(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an exec error
    pub fn exec(msg: impl Into<String>) -> Self {
        Error::Exec(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            message: msg.into(),
            timeout,
        }
    }

    /// Whether the error is a 404 from the API server (or a local not-found)
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(e) => is_kube_not_found(e),
            Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// Whether the error is a 409 "already exists" from the API server
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}

/// Whether a kube client error is a 404
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
