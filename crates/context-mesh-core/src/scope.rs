//! Per-user namespacing of persisted rows.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::validate_identifier;
use crate::error::MeshError;

/// Row scope used when no [`UserScope`] is configured.
///
/// [`UserScope::new`] rejects blank ids, so no named scope can collide with it.
pub const IMPLICIT_SCOPE: &str = "";

/// Tenant namespace folded into every stored row.
///
/// Two meshes opened with different scopes against the same backend never
/// observe each other's items, subscriptions or permissions, even when they
/// reuse keys, agent names or topic names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserScope(String);

impl UserScope {
    /// Create a scope from a non-blank identifier.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] if `id` is blank.
    pub fn new(id: impl Into<String>) -> Result<Self, MeshError> {
        let id = id.into();
        validate_identifier("user scope", &id)?;
        Ok(Self(id))
    }

    /// The scope identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Row key for an optional scope.
    #[must_use]
    pub fn storage_key(scope: Option<&Self>) -> &str {
        scope.map_or(IMPLICIT_SCOPE, Self::as_str)
    }
}

impl fmt::Display for UserScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserScope {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserScope> for String {
    fn from(scope: UserScope) -> Self {
        scope.0
    }
}
