//! Error types for the autoscaling control loop.

use thiserror::Error;

/// Errors raised by a single autoscaler run or one of its collaborators.
///
/// None of these escape a scheduled task: the task boundary logs them and the
/// next period runs as usual.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A remote command could not be run in a pod
    #[error("exec in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    /// The run was interrupted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// The autoscaler spec violates one of its own invariants
    #[error("invalid autoscaler configuration: {0}")]
    InvalidConfig(String),

    /// Output from a pod or the API server could not be understood
    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn exec(pod: &str, message: impl Into<String>) -> Self {
        Error::Exec {
            pod: pod.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn parse(what: &str, message: impl std::fmt::Display) -> Self {
        Error::Parse {
            what: what.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
