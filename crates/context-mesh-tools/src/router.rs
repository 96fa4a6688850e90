//! Permission-gated dispatch of named operations onto a mesh.

use std::sync::Arc;

use context_mesh_core::{AgentId, MeshError, Result, context::validate_identifier};
use context_mesh_store::ContextMesh;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    ops::{
        DeleteTopicArgs, DiscoverArgs, KeyArgs, Operation, PushArgs, TopicsArgs, names,
        parse_args,
    },
    policy::AccessPolicy,
    protocol::{ToolCall, ToolDescriptor, ToolResponse},
};

/// Routes operation calls for one agent to a shared mesh.
///
/// The bound agent is the identity used for every visibility check; callers
/// cannot act as another agent through the arguments. The policy can be
/// changed while calls are in flight.
pub struct ToolRouter {
    mesh: Arc<ContextMesh>,
    agent: AgentId,
    policy: RwLock<AccessPolicy>,
}

impl ToolRouter {
    /// Router that permits every operation.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank agent id.
    pub fn new(mesh: Arc<ContextMesh>, agent: impl Into<AgentId>) -> Result<Self> {
        Self::with_policy(mesh, agent, AccessPolicy::new())
    }

    /// Router with an initial policy.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank agent id.
    pub fn with_policy(
        mesh: Arc<ContextMesh>,
        agent: impl Into<AgentId>,
        policy: AccessPolicy,
    ) -> Result<Self> {
        let agent = agent.into();
        validate_identifier("agent id", &agent)?;
        Ok(Self {
            mesh,
            agent,
            policy: RwLock::new(policy),
        })
    }

    /// Agent every call runs as.
    #[must_use]
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Underlying mesh.
    #[must_use]
    pub const fn mesh(&self) -> &Arc<ContextMesh> {
        &self.mesh
    }

    /// Snapshot of the current policy.
    #[must_use]
    pub fn policy(&self) -> AccessPolicy {
        self.policy.read().clone()
    }

    /// Operations this router's agent may invoke right now.
    #[must_use]
    pub fn available_operations(&self) -> Vec<Operation> {
        self.policy.read().allowed_operations().into_iter().collect()
    }

    /// Descriptors for the currently available operations.
    #[must_use]
    pub fn describe(&self) -> Vec<ToolDescriptor> {
        self.available_operations()
            .into_iter()
            .map(ToolDescriptor::from)
            .collect()
    }

    /// Replace the explicit allow list.
    pub fn set_allowed(&self, ops: impl IntoIterator<Item = Operation>) {
        self.policy.write().set_allowed(ops);
    }

    /// Add `op` to the allow list, if one is set.
    pub fn add_allowed(&self, op: Operation) {
        self.policy.write().add_allowed(op);
    }

    /// Take `op` out of the allow list.
    pub fn remove_allowed(&self, op: Operation) {
        self.policy.write().remove_allowed(op);
    }

    /// Drop the allow list.
    pub fn clear_allowed(&self) {
        self.policy.write().clear_allowed();
    }

    /// Replace the deny list.
    pub fn set_denied(&self, ops: impl IntoIterator<Item = Operation>) {
        self.policy.write().set_denied(ops);
    }

    /// Deny `op`.
    pub fn add_denied(&self, op: Operation) {
        self.policy.write().add_denied(op);
    }

    /// Stop denying `op`.
    pub fn remove_denied(&self, op: Operation) {
        self.policy.write().remove_denied(op);
    }

    /// Base permissions on a named role.
    pub fn set_role(&self, role: impl Into<String>) {
        self.policy.write().set_role(role);
    }

    /// Go back to permitting every operation before deny/allow apply.
    pub fn clear_role(&self) {
        self.policy.write().clear_role();
    }

    /// Define or replace a custom role.
    pub fn register_role(&self, name: impl Into<String>, ops: impl IntoIterator<Item = Operation>) {
        self.policy.write().register_role(name, ops);
    }

    /// Run `operation` with `arguments` as this router's agent.
    ///
    /// # Errors
    /// Returns [`MeshError::UnknownOperation`] for a name outside the
    /// dispatch table, [`MeshError::AccessDenied`] when the policy excludes
    /// the operation (both carry the relevant operation list), or whatever
    /// the mesh call returns.
    pub async fn invoke(&self, operation: &str, arguments: Value) -> Result<Value> {
        let Some(op) = Operation::from_name(operation) else {
            warn!(agent = %self.agent, operation, "Unknown operation");
            return Err(MeshError::UnknownOperation {
                operation: operation.to_string(),
                available: Operation::all_names(),
            });
        };

        let allowed = self.policy.read().allowed_operations();
        if !allowed.contains(&op) {
            warn!(agent = %self.agent, operation, "Operation denied");
            return Err(MeshError::AccessDenied {
                operation: operation.to_string(),
                agent: self.agent.clone(),
                available: names(allowed),
            });
        }

        debug!(agent = %self.agent, operation, "Dispatching operation");
        self.dispatch(op, arguments).await
    }

    /// [`ToolRouter::invoke`] with the outcome folded into a response envelope.
    pub async fn handle(&self, call: ToolCall) -> ToolResponse {
        self.invoke(&call.operation, call.arguments).await.into()
    }

    async fn dispatch(&self, op: Operation, arguments: Value) -> Result<Value> {
        let agent = self.agent.as_str();
        match op {
            Operation::GetContext => {
                let KeyArgs { key } = parse_args(op, arguments)?;
                let value = self.mesh.get(&key, Some(agent)).await?;
                Ok(json!({ "key": key, "value": value }))
            }
            Operation::PushContext => {
                let args: PushArgs = parse_args(op, arguments)?;
                let options = args.options()?;
                self.mesh.push(&args.key, args.value, options).await?;
                Ok(json!({ "key": args.key, "stored": true }))
            }
            Operation::ListContext => {
                let items = self.mesh.get_all_for_agent(agent).await?;
                Ok(json!({ "agent": agent, "count": items.len(), "items": items }))
            }
            Operation::ListContextKeys => {
                let listing = self.mesh.list_keys_for_agent(agent).await?;
                Ok(json!({ "agent": agent, "keys": listing }))
            }
            Operation::RemoveContext => {
                let KeyArgs { key } = parse_args(op, arguments)?;
                let removed = self.mesh.remove(&key).await?;
                Ok(json!({ "key": key, "removed": removed }))
            }
            Operation::SubscribeToTopics => {
                let TopicsArgs { topics } = parse_args(op, arguments)?;
                let subscribed = self.mesh.register_agent_topics(agent, topics).await?;
                Ok(json!({ "agent": agent, "topics": subscribed }))
            }
            Operation::UnsubscribeFromTopics => {
                let TopicsArgs { topics } = parse_args(op, arguments)?;
                let remaining = self.mesh.unsubscribe_topics(agent, topics).await?;
                Ok(json!({ "agent": agent, "topics": remaining }))
            }
            Operation::GetSubscriptions => {
                let topics = self.mesh.get_agent_topics(agent).await;
                Ok(json!({ "agent": agent, "topics": topics }))
            }
            Operation::DiscoverTopics => {
                let DiscoverArgs {
                    include_subscribers,
                } = parse_args(op, arguments)?;
                let topics = self.mesh.discover_topics(include_subscribers).await;
                Ok(json!({ "topics": topics }))
            }
            Operation::DeleteTopic => {
                let DeleteTopicArgs { topic, confirm } = parse_args(op, arguments)?;
                let agents = self.mesh.delete_topic(&topic, confirm).await?;
                Ok(json!({ "topic": topic, "unsubscribed_agents": agents }))
            }
        }
    }
}
