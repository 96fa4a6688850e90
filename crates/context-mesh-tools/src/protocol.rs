//! Plain request/response envelopes for external tool-calling adapters.

use context_mesh_core::{MeshError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ops::Operation;

/// An operation invocation as received from an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Operation name, e.g. `push_context`.
    pub operation: String,
    /// Operation arguments; missing means none.
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    /// Call `operation` with `arguments`.
    #[must_use]
    pub fn new(operation: impl Into<String>, arguments: Value) -> Self {
        Self {
            operation: operation.into(),
            arguments,
        }
    }
}

/// Outcome of a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    /// The operation ran.
    Ok { result: Value },
    /// The operation was rejected or failed.
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        available_operations: Option<Vec<String>>,
    },
}

impl ToolResponse {
    /// Whether the operation ran.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Error kind, if this is an error.
    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { kind, .. } => Some(kind),
        }
    }
}

impl From<&MeshError> for ToolResponse {
    fn from(err: &MeshError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            available_operations: err.available_operations().map(<[String]>::to_vec),
        }
    }
}

impl From<Result<Value>> for ToolResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(result) => Self::Ok { result },
            Err(err) => Self::from(&err),
        }
    }
}

/// Name, summary and argument names of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub arguments: Vec<String>,
}

impl From<Operation> for ToolDescriptor {
    fn from(op: Operation) -> Self {
        Self {
            name: op.name().to_string(),
            description: op.description().to_string(),
            arguments: op
                .argument_names()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}
