//! Error types for builds and deployments

use thiserror::Error;

/// Main error type for Fairing operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error, surfaced unretried
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Error while watching an object for a condition
    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),

    /// A bounded wait ran out of time
    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    /// Object serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Log stream read failed
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The cluster returned an object without the metadata we rely on
    #[error("Object is missing {0}")]
    MissingMetadata(String),

    /// A pod spec mutator aborted the pipeline
    #[error("Mutator '{mutator}' failed: {message}")]
    MutatorFailed { mutator: String, message: String },

    /// Operation requires a prior successful deploy
    #[error("Nothing has been deployed yet")]
    NotDeployed,
}

/// Result alias for Fairing operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a mutator failure for the named mutator
    pub fn mutator(mutator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MutatorFailed {
            mutator: mutator.into(),
            message: message.into(),
        }
    }
}

impl From<fairing_config::ConfigError> for Error {
    fn from(err: fairing_config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}
