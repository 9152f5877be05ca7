//! Error types shared by the Stagehand crates
//!
//! Errors carry the queue or team they concern so that a failed tick can be
//! traced back to the unit of work without reading the surrounding logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Stagehand operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A queue (or one of its collaborators) is malformed
    #[error("validation error for {queue}: {message}")]
    Validation {
        /// Name of the queue being processed
        queue: String,
        /// Description of what's invalid
        message: String,
    },

    /// Tenant configuration is missing or unusable
    #[error("configuration error for team {team}: {message}")]
    Configuration {
        /// Team the configuration belongs to
        team: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "store", "diagnostics")
        context: String,
    },
}

impl Error {
    /// Create a validation error without queue context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            queue: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific queue
    pub fn validation_for(queue: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            queue: queue.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for a team
    pub fn configuration(team: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            team: team.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific document kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error wraps a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube { source } => crate::kube_utils::is_not_found(source),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", e.to_string())
    }
}
