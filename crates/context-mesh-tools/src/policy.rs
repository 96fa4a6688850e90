//! Per-agent operation permissions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::ops::Operation;

/// Predefined permission levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(rename = "readonly")]
    ReadOnly,
    Contributor,
    Moderator,
    Admin,
}

impl Role {
    /// Every role, least privileged first.
    pub const ALL: [Self; 4] = [Self::ReadOnly, Self::Contributor, Self::Moderator, Self::Admin];

    /// Name used in policies and config.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::Contributor => "contributor",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
        }
    }

    /// Predefined role by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.name() == name)
    }

    /// Operations granted by this role. Each role includes the one before it.
    #[must_use]
    pub fn operations(self) -> BTreeSet<Operation> {
        use crate::ops::Operation::{
            DiscoverTopics, GetContext, GetSubscriptions, ListContext, ListContextKeys,
            PushContext, RemoveContext, SubscribeToTopics, UnsubscribeFromTopics,
        };

        match self {
            Self::ReadOnly => [
                GetContext,
                ListContext,
                ListContextKeys,
                GetSubscriptions,
                DiscoverTopics,
            ]
            .into(),
            Self::Contributor => {
                let mut ops = Self::ReadOnly.operations();
                ops.extend([PushContext, SubscribeToTopics, UnsubscribeFromTopics]);
                ops
            }
            Self::Moderator => {
                let mut ops = Self::Contributor.operations();
                ops.insert(RemoveContext);
                ops
            }
            Self::Admin => Operation::ALL.into(),
        }
    }
}

/// Which operations a router lets its agent invoke.
///
/// The effective set starts from the role's operations (every operation when
/// no role is set), drops `denied`, then intersects with `allowed` if one is
/// given. An unknown role name grants nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessPolicy {
    allowed: Option<BTreeSet<Operation>>,
    denied: BTreeSet<Operation>,
    role: Option<String>,
    custom_roles: BTreeMap<String, BTreeSet<Operation>>,
}

impl AccessPolicy {
    /// Policy that permits everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `ops`.
    #[must_use]
    pub fn with_allowed(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.set_allowed(ops);
        self
    }

    /// Never permit `ops`.
    #[must_use]
    pub fn with_denied(mut self, ops: impl IntoIterator<Item = Operation>) -> Self {
        self.set_denied(ops);
        self
    }

    /// Start from the operations of `role`.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.set_role(role);
        self
    }

    /// Add a custom role; a custom role shadows a predefined one of the same name.
    #[must_use]
    pub fn with_custom_role(
        mut self,
        name: impl Into<String>,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Self {
        self.register_role(name, ops);
        self
    }

    /// Effective permitted operations.
    #[must_use]
    pub fn allowed_operations(&self) -> BTreeSet<Operation> {
        let mut ops = match &self.role {
            Some(role) => self.role_operations(role),
            None => Operation::ALL.into(),
        };
        ops.retain(|op| !self.denied.contains(op));
        if let Some(allowed) = &self.allowed {
            ops.retain(|op| allowed.contains(op));
        }
        ops
    }

    /// Whether `op` is in the effective set.
    #[must_use]
    pub fn permits(&self, op: Operation) -> bool {
        self.allowed_operations().contains(&op)
    }

    /// Operations granted by a role name, custom roles first.
    #[must_use]
    pub fn role_operations(&self, role: &str) -> BTreeSet<Operation> {
        self.custom_roles
            .get(role)
            .cloned()
            .or_else(|| Role::from_name(role).map(Role::operations))
            .unwrap_or_default()
    }

    /// Explicit allow list, if any.
    #[must_use]
    pub const fn allowed(&self) -> Option<&BTreeSet<Operation>> {
        self.allowed.as_ref()
    }

    #[must_use]
    pub const fn denied(&self) -> &BTreeSet<Operation> {
        &self.denied
    }

    /// Configured role name.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    #[must_use]
    pub const fn custom_roles(&self) -> &BTreeMap<String, BTreeSet<Operation>> {
        &self.custom_roles
    }

    /// Replace the explicit allow list.
    pub fn set_allowed(&mut self, ops: impl IntoIterator<Item = Operation>) {
        self.allowed = Some(ops.into_iter().collect());
    }

    /// Extend the explicit allow list. Without one, everything is already allowed.
    pub fn add_allowed(&mut self, op: Operation) {
        if let Some(allowed) = &mut self.allowed {
            allowed.insert(op);
        }
    }

    /// Take `op` out of the allow list, materializing one if there was none.
    pub fn remove_allowed(&mut self, op: Operation) {
        self.allowed
            .get_or_insert_with(|| Operation::ALL.into())
            .remove(&op);
    }

    /// Drop the explicit allow list.
    pub fn clear_allowed(&mut self) {
        self.allowed = None;
    }

    /// Replace the deny list.
    pub fn set_denied(&mut self, ops: impl IntoIterator<Item = Operation>) {
        self.denied = ops.into_iter().collect();
    }

    /// Deny `op` regardless of role or allow list.
    pub fn add_denied(&mut self, op: Operation) {
        self.denied.insert(op);
    }

    /// Stop denying `op`.
    pub fn remove_denied(&mut self, op: Operation) {
        self.denied.remove(&op);
    }

    /// Set the role the effective set starts from.
    pub fn set_role(&mut self, role: impl Into<String>) {
        self.role = Some(role.into());
    }

    /// Drop the role; the effective set starts from every operation.
    pub fn clear_role(&mut self) {
        self.role = None;
    }

    /// Define or replace a custom role.
    pub fn register_role(&mut self, name: impl Into<String>, ops: impl IntoIterator<Item = Operation>) {
        self.custom_roles
            .insert(name.into(), ops.into_iter().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Operation::{DeleteTopic, GetContext, PushContext, RemoveContext};

    #[test]
    fn test_default_permits_everything() {
        let policy = AccessPolicy::new();
        assert_eq!(policy.allowed_operations().len(), Operation::ALL.len());
    }

    #[test]
    fn test_role_hierarchy() {
        let readonly = Role::ReadOnly.operations();
        let contributor = Role::Contributor.operations();
        let moderator = Role::Moderator.operations();

        assert!(!readonly.contains(&PushContext));
        assert!(readonly.is_subset(&contributor));
        assert!(contributor.contains(&PushContext));
        assert!(!contributor.contains(&RemoveContext));
        assert!(contributor.is_subset(&moderator));
        assert!(moderator.contains(&RemoveContext));
        assert!(!moderator.contains(&DeleteTopic));
        assert!(Role::Admin.operations().contains(&DeleteTopic));
    }

    #[test]
    fn test_role_then_denied_then_allowed() {
        let policy = AccessPolicy::new()
            .with_role("contributor")
            .with_denied([PushContext])
            .with_allowed([GetContext, PushContext, RemoveContext]);
        assert_eq!(policy.allowed_operations(), BTreeSet::from([GetContext]));
    }

    #[test]
    fn test_unknown_role_grants_nothing() {
        let policy = AccessPolicy::new().with_role("superuser");
        assert!(policy.allowed_operations().is_empty());
    }

    #[test]
    fn test_custom_role_shadows_predefined() {
        let policy = AccessPolicy::new()
            .with_custom_role("readonly", [GetContext])
            .with_role("readonly");
        assert_eq!(policy.allowed_operations(), BTreeSet::from([GetContext]));
    }

    #[test]
    fn test_allow_list_mutators() {
        let mut policy = AccessPolicy::new();
        policy.add_allowed(PushContext);
        assert!(policy.allowed().is_none());

        policy.remove_allowed(DeleteTopic);
        assert!(!policy.permits(DeleteTopic));
        assert!(policy.permits(PushContext));

        policy.set_allowed([GetContext]);
        assert!(!policy.permits(PushContext));
        policy.add_allowed(PushContext);
        assert!(policy.permits(PushContext));

        policy.add_denied(PushContext);
        assert!(!policy.permits(PushContext));
        policy.remove_denied(PushContext);
        policy.clear_allowed();
        assert!(policy.permits(DeleteTopic));
    }

    #[test]
    fn test_policy_deserializes_from_config() {
        let policy: AccessPolicy = serde_json::from_str(
            r#"{"role": "reviewer", "custom_roles": {"reviewer": ["get_context", "list_context"]}, "denied": ["list_context"]}"#,
        )
        .unwrap();
        assert_eq!(policy.allowed_operations(), BTreeSet::from([GetContext]));
    }
}
