//! Staging controller error types

use std::time::Duration;

/// Result type for staging operations
pub type Result<T> = std::result::Result<T, StagingError>;

/// Error raised while processing a queue
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("{0}")]
    Common(#[from] stagehand_common::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("peer rpc error: {0}")]
    Rpc(#[from] stagehand_rpc::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("deploy engine {engine} failed: {message}")]
    Engine { engine: String, message: String },

    #[error("test runner {runner} failed: {message}")]
    TestRunner { runner: String, message: String },

    #[error("component {0} is not in the team configuration")]
    ComponentNotFound(String),

    #[error("queue {0} not found")]
    QueueNotFound(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("diagnostics error: {0}")]
    Diagnostics(String),

    #[error("queue {queue} cannot be processed in state {state}")]
    InvalidState { queue: String, state: String },
}

impl StagingError {
    pub fn engine(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn test_runner(runner: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TestRunner {
            runner: runner.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube(e) => stagehand_common::kube_utils::is_not_found(e),
            Self::Common(e) => e.is_not_found(),
            Self::QueueNotFound(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_name_the_operation() {
        let err = StagingError::Timeout {
            operation: "test trigger",
            timeout: Duration::from_secs(15),
        };
        assert_eq!(err.to_string(), "test trigger timed out after 15s");
    }

    #[test]
    fn not_found_is_recognized_across_variants() {
        assert!(StagingError::QueueNotFound("redis".into()).is_not_found());
        assert!(!StagingError::ComponentNotFound("redis".into()).is_not_found());
        assert!(!StagingError::engine("helm", "boom").is_not_found());
    }
}
