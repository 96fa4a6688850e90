//! Error taxonomy shared by the mesh, its backends and the tool router.

use thiserror::Error;

use crate::traits::PersistenceError;

/// Errors returned by mesh and router operations.
///
/// A read path never reports [`MeshError::AccessDenied`]: a key the caller
/// may not see is indistinguishable from a missing one.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Malformed call, e.g. both agents and topics on one push.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Key absent, expired, or not visible to the caller.
    #[error("Context not found: {0}")]
    NotFound(String),

    /// Operation outside the caller's allowed set.
    #[error("Access denied: agent '{agent}' may not invoke '{operation}'")]
    AccessDenied {
        operation: String,
        agent: String,
        available: Vec<String>,
    },

    /// Operation name not in the dispatch table.
    #[error("Unknown operation: {operation}")]
    UnknownOperation {
        operation: String,
        available: Vec<String>,
    },

    /// Subscription to topics outside the agent's permitted set.
    #[error("Agent '{agent}' is not permitted to subscribe to: {}", .topics.join(", "))]
    TopicNotPermitted { agent: String, topics: Vec<String> },

    /// Backend connect/read/write failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl MeshError {
    /// Stable machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::AccessDenied { .. } => "access_denied",
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::TopicNotPermitted { .. } => "topic_not_permitted",
            Self::Persistence(_) => "persistence_error",
        }
    }

    /// Operations the caller could use instead, for denied or unknown calls.
    #[must_use]
    pub fn available_operations(&self) -> Option<&[String]> {
        match self {
            Self::AccessDenied { available, .. } | Self::UnknownOperation { available, .. } => {
                Some(available)
            }
            _ => None,
        }
    }
}

/// Result alias for mesh operations.
pub type Result<T, E = MeshError> = std::result::Result<T, E>;
