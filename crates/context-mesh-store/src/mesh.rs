//! The context mesh: a concurrent, access-controlled, expiring key/value store.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use context_mesh_core::{
    AgentId, BackendKind, ContextItem, MeshConfig, MeshError, PersistenceBackend,
    PersistenceError, PushOptions, Result, TopicName, UserScope, Visibility,
    context::validate_identifier,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::connect_backend;

/// Keys visible to one agent, grouped by how they are visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyListing {
    /// Keys readable by everyone.
    pub global: Vec<String>,
    /// Keys addressed to the agent directly.
    pub direct: Vec<String>,
    /// Topic-addressed keys, under each subscribed topic that admits them.
    pub by_topic: BTreeMap<TopicName, Vec<String>>,
    /// Every visible key, sorted and de-duplicated.
    pub all: Vec<String>,
}

/// A topic and who subscribes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: TopicName,
    /// Agents currently subscribed.
    pub subscriber_count: usize,
    /// Subscriber ids, sorted; only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<Vec<AgentId>>,
}

/// Point-in-time counters over the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    /// Items held in memory, expired or not.
    pub total_items: usize,
    /// Items not yet expired.
    pub active_items: usize,
    /// Items expired but not yet swept.
    pub expired_items: usize,
    /// Items readable by everyone.
    pub global_items: usize,
    /// Items addressed to an explicit agent list.
    pub private_items: usize,
    /// Items addressed to topics.
    pub topic_items: usize,
    /// Agents with a non-empty subscription set.
    pub agents_with_topics: usize,
    /// Distinct topics with at least one subscriber.
    pub topics: usize,
}

/// Everything guarded by the mesh-wide lock.
struct MeshState {
    items: HashMap<String, ContextItem>,
    agent_index: HashMap<AgentId, HashSet<String>>,
    global_keys: HashSet<String>,
    topic_keys: HashSet<String>,
    topic_subscriptions: HashMap<AgentId, BTreeSet<TopicName>>,
    agent_permissions: HashMap<AgentId, BTreeSet<TopicName>>,
    last_cleanup: Instant,
}

impl MeshState {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            agent_index: HashMap::new(),
            global_keys: HashSet::new(),
            topic_keys: HashSet::new(),
            topic_subscriptions: HashMap::new(),
            agent_permissions: HashMap::new(),
            last_cleanup: Instant::now(),
        }
    }

    fn index(&mut self, key: &str, visibility: &Visibility) {
        match visibility {
            Visibility::Global => {
                self.global_keys.insert(key.to_string());
            }
            Visibility::Agents(agents) => {
                for agent in agents {
                    self.agent_index
                        .entry(agent.clone())
                        .or_default()
                        .insert(key.to_string());
                }
            }
            Visibility::Topics(_) => {
                self.topic_keys.insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, visibility: &Visibility) {
        match visibility {
            Visibility::Global => {
                self.global_keys.remove(key);
            }
            Visibility::Agents(agents) => {
                for agent in agents {
                    if let Some(keys) = self.agent_index.get_mut(agent) {
                        keys.remove(key);
                        if keys.is_empty() {
                            self.agent_index.remove(agent);
                        }
                    }
                }
            }
            Visibility::Topics(_) => {
                self.topic_keys.remove(key);
            }
        }
    }

    /// Insert or replace an item, dropping the old item's index entries first.
    fn insert_item(&mut self, key: String, item: ContextItem, indexing: bool) {
        if let Some(old) = self.items.remove(&key) {
            if indexing {
                self.unindex(&key, old.visibility());
            }
        }
        if indexing {
            self.index(&key, item.visibility());
        }
        self.items.insert(key, item);
    }

    fn remove_item(&mut self, key: &str, indexing: bool) -> Option<ContextItem> {
        let item = self.items.remove(key)?;
        if indexing {
            self.unindex(key, item.visibility());
        }
        Some(item)
    }

    fn sweep(&mut self, now: DateTime<Utc>, indexing: bool) -> usize {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_item(key, indexing);
        }
        self.last_cleanup = Instant::now();
        expired.len()
    }

    fn clear_items(&mut self) {
        self.items.clear();
        self.agent_index.clear();
        self.global_keys.clear();
        self.topic_keys.clear();
    }

    /// Unexpired items `agent` may read, checked against current subscriptions.
    fn visible(&self, agent: &str, now: DateTime<Utc>, indexing: bool) -> Vec<(&str, &ContextItem)> {
        let subscriptions = self.topic_subscriptions.get(agent);
        let admitted = |item: &ContextItem| {
            !item.is_expired_at(now) && item.visibility().admits(agent, subscriptions)
        };

        if indexing {
            let direct = self.agent_index.get(agent).into_iter().flatten();
            self.global_keys
                .iter()
                .chain(direct)
                .chain(self.topic_keys.iter())
                .filter_map(|key| self.items.get_key_value(key))
                .filter(|&(_, item)| admitted(item))
                .map(|(key, item)| (key.as_str(), item))
                .collect()
        } else {
            self.items
                .iter()
                .filter(|&(_, item)| admitted(item))
                .map(|(key, item)| (key.as_str(), item))
                .collect()
        }
    }
}

/// Concurrent context store shared by many agents.
///
/// All mutations and index-consistent reads run under one mesh-wide lock.
/// When a backend is attached, each mutation is applied in memory first and
/// then written through while the lock is still held. A failed write is
/// returned to the caller as [`MeshError::Persistence`] but the in-memory
/// change stays applied: durability is per call, not transactional.
pub struct ContextMesh {
    state: Mutex<MeshState>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    scope: Option<UserScope>,
    indexing: bool,
    auto_cleanup: bool,
    cleanup_interval: Duration,
}

impl ContextMesh {
    /// Memory-only mesh with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::memory_only(&MeshConfig::default(), None)
    }

    fn memory_only(config: &MeshConfig, scope: Option<UserScope>) -> Self {
        Self {
            state: Mutex::new(MeshState::new()),
            backend: None,
            scope,
            indexing: config.enable_indexing,
            auto_cleanup: config.auto_cleanup,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// Build a mesh from configuration, connecting and loading the backend
    /// when persistence is enabled.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank user scope, or
    /// [`MeshError::Persistence`] if the backend cannot be opened or loaded
    /// and `fallback_to_memory` is off.
    pub async fn open(config: MeshConfig) -> Result<Self> {
        let scope = config.scope()?;
        if !config.enable_persistence {
            return Ok(Self::memory_only(&config, scope));
        }

        match connect_backend(&config.backend).await {
            Ok(backend) => Self::with_backend(config, backend).await,
            Err(err) => Self::degrade(&config, scope, err),
        }
    }

    /// Build a mesh over an already-connected backend and load its rows for
    /// the configured scope.
    ///
    /// Several meshes may share one backend as long as their scopes differ.
    ///
    /// # Errors
    /// Same as [`ContextMesh::open`].
    pub async fn with_backend(
        config: MeshConfig,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Result<Self> {
        let scope = config.scope()?;
        let row_scope = UserScope::storage_key(scope.as_ref()).to_string();

        match load_state(backend.as_ref(), &row_scope, config.enable_indexing).await {
            Ok(state) => {
                info!(
                    scope = %row_scope,
                    backend = %backend.kind(),
                    items = state.items.len(),
                    agents_with_topics = state.topic_subscriptions.len(),
                    "Context mesh loaded"
                );
                Ok(Self {
                    state: Mutex::new(state),
                    backend: Some(backend),
                    scope,
                    indexing: config.enable_indexing,
                    auto_cleanup: config.auto_cleanup,
                    cleanup_interval: config.cleanup_interval(),
                })
            }
            Err(err) => Self::degrade(&config, scope, err),
        }
    }

    fn degrade(
        config: &MeshConfig,
        scope: Option<UserScope>,
        err: PersistenceError,
    ) -> Result<Self> {
        if !config.fallback_to_memory {
            return Err(err.into());
        }
        warn!(error = %err, "Persistence unavailable, continuing memory-only");
        Ok(Self::memory_only(config, scope))
    }

    /// Configured user scope.
    #[must_use]
    pub const fn scope(&self) -> Option<&UserScope> {
        self.scope.as_ref()
    }

    /// Whether mutations are written through to a backend.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    /// Attached backend implementation, if any.
    #[must_use]
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|backend| backend.kind())
    }

    fn row_scope(&self) -> &str {
        UserScope::storage_key(self.scope.as_ref())
    }

    /// Surface a write-through failure after the memory mutation is applied.
    fn written<T>(
        &self,
        result: std::result::Result<T, PersistenceError>,
        operation: &'static str,
    ) -> Result<T> {
        result.map_err(|err| {
            warn!(
                scope = %self.row_scope(),
                operation,
                error = %err,
                "Persistence write failed, in-memory state kept"
            );
            MeshError::from(err)
        })
    }

    /// Store `value` under `key`, replacing any existing item.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank key or when both agents
    /// and topics are given, or [`MeshError::Persistence`] if the write-through
    /// fails (the item is stored in memory regardless).
    pub async fn push(&self, key: &str, value: Value, options: PushOptions) -> Result<()> {
        validate_identifier("key", key)?;
        let visibility = options.visibility()?;
        let item = ContextItem::new(value, visibility, options.ttl);

        let mut state = self.state.lock().await;
        if self.auto_cleanup && state.last_cleanup.elapsed() >= self.cleanup_interval {
            self.sweep_locked(&mut state).await;
        }

        state.insert_item(key.to_string(), item.clone(), self.indexing);
        debug!(key = %key, visibility = ?item.visibility(), "Context pushed");

        if let Some(backend) = &self.backend {
            let saved = backend.save_item(self.row_scope(), key, &item).await;
            self.written(saved, "push")?;
        }
        Ok(())
    }

    /// Read one value.
    ///
    /// With `agent` set, the value is returned only if that agent may see it;
    /// an invisible key is reported exactly like a missing one. Without an
    /// agent the visibility check is skipped.
    ///
    /// # Errors
    /// Returns [`MeshError::NotFound`] if the key is absent, expired, or not
    /// visible to `agent`.
    pub async fn get(&self, key: &str, agent: Option<&str>) -> Result<Value> {
        validate_identifier("key", key)?;
        let state = self.state.lock().await;
        let not_found = || MeshError::NotFound(key.to_string());

        let item = state.items.get(key).ok_or_else(not_found)?;
        if item.is_expired() {
            return Err(not_found());
        }
        if let Some(agent) = agent {
            if !item
                .visibility()
                .admits(agent, state.topic_subscriptions.get(agent))
            {
                return Err(not_found());
            }
        }
        Ok(item.value().clone())
    }

    /// Every value `agent` may read: global items, items addressed to it, and
    /// items on topics it currently subscribes to.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank agent id.
    pub async fn get_all_for_agent(&self, agent: &str) -> Result<BTreeMap<String, Value>> {
        validate_identifier("agent id", agent)?;
        let state = self.state.lock().await;
        Ok(state
            .visible(agent, Utc::now(), self.indexing)
            .into_iter()
            .map(|(key, item)| (key.to_string(), item.value().clone()))
            .collect())
    }

    /// Keys `agent` may read, without cloning values.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank agent id.
    pub async fn list_keys_for_agent(&self, agent: &str) -> Result<KeyListing> {
        validate_identifier("agent id", agent)?;
        let state = self.state.lock().await;
        let subscriptions = state.topic_subscriptions.get(agent);
        let mut listing = KeyListing::default();

        for (key, item) in state.visible(agent, Utc::now(), self.indexing) {
            match item.visibility() {
                Visibility::Global => listing.global.push(key.to_string()),
                Visibility::Agents(_) => listing.direct.push(key.to_string()),
                Visibility::Topics(topics) => {
                    let Some(subscriptions) = subscriptions else {
                        continue;
                    };
                    for topic in topics.intersection(subscriptions) {
                        listing
                            .by_topic
                            .entry(topic.clone())
                            .or_default()
                            .push(key.to_string());
                    }
                }
            }
            listing.all.push(key.to_string());
        }

        listing.global.sort();
        listing.direct.sort();
        listing.by_topic.values_mut().for_each(|keys| keys.sort());
        listing.all.sort();
        Ok(listing)
    }

    /// Subscribe `agent` to `topics`, returning its full subscription set.
    ///
    /// Subscriptions take effect for items already stored.
    ///
    /// # Errors
    /// Returns [`MeshError::TopicNotPermitted`] if the agent has a permission
    /// row that excludes any of the topics, [`MeshError::Validation`] for
    /// blank names, or [`MeshError::Persistence`] if the write-through fails.
    pub async fn register_agent_topics<I>(&self, agent: &str, topics: I) -> Result<BTreeSet<TopicName>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        validate_identifier("agent id", agent)?;
        let topics = collect_topics(topics)?;

        let mut state = self.state.lock().await;
        if let Some(allowed) = state.agent_permissions.get(agent) {
            let rejected: Vec<String> = topics.difference(allowed).cloned().collect();
            if !rejected.is_empty() {
                return Err(MeshError::TopicNotPermitted {
                    agent: agent.to_string(),
                    topics: rejected,
                });
            }
        }

        let subscriptions = state
            .topic_subscriptions
            .entry(agent.to_string())
            .or_default();
        subscriptions.extend(topics);
        let subscriptions = subscriptions.clone();
        debug!(agent = %agent, topics = ?subscriptions, "Agent subscribed");

        self.save_subscriptions(agent, &subscriptions).await?;
        Ok(subscriptions)
    }

    /// Drop `topics` from `agent`'s subscriptions, returning what remains.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for blank names or
    /// [`MeshError::Persistence`] if the write-through fails.
    pub async fn unsubscribe_topics<I>(&self, agent: &str, topics: I) -> Result<BTreeSet<TopicName>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        validate_identifier("agent id", agent)?;
        let topics = collect_topics(topics)?;

        let mut state = self.state.lock().await;
        let Some(subscriptions) = state.topic_subscriptions.get_mut(agent) else {
            return Ok(BTreeSet::new());
        };
        subscriptions.retain(|topic| !topics.contains(topic));
        let remaining = subscriptions.clone();
        debug!(agent = %agent, topics = ?remaining, "Agent unsubscribed");

        self.save_subscriptions(agent, &remaining).await?;
        Ok(remaining)
    }

    /// Remove `topic` from every agent's subscriptions, returning the agents
    /// that were subscribed. Items published to the topic are kept.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] unless `confirm` is set, or
    /// [`MeshError::Persistence`] if a write-through fails.
    pub async fn delete_topic(&self, topic: &str, confirm: bool) -> Result<Vec<AgentId>> {
        validate_identifier("topic", topic)?;
        if !confirm {
            return Err(MeshError::Validation(format!(
                "deleting topic '{topic}' unsubscribes every agent; pass confirm to proceed"
            )));
        }

        let mut state = self.state.lock().await;
        let mut affected = Vec::new();
        for (agent, subscriptions) in &mut state.topic_subscriptions {
            if subscriptions.remove(topic) {
                affected.push((agent.clone(), subscriptions.clone()));
            }
        }
        affected.sort_by(|a, b| a.0.cmp(&b.0));
        info!(topic = %topic, agents = affected.len(), "Topic deleted");

        for (agent, subscriptions) in &affected {
            self.save_subscriptions(agent, subscriptions).await?;
        }
        Ok(affected.into_iter().map(|(agent, _)| agent).collect())
    }

    async fn save_subscriptions(&self, agent: &str, topics: &BTreeSet<TopicName>) -> Result<()> {
        if let Some(backend) = &self.backend {
            let saved = backend
                .save_agent_topics(self.row_scope(), agent, topics)
                .await;
            self.written(saved, "save_agent_topics")?;
        }
        Ok(())
    }

    /// Current subscriptions of `agent`.
    pub async fn get_agent_topics(&self, agent: &str) -> BTreeSet<TopicName> {
        self.state
            .lock()
            .await
            .topic_subscriptions
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }

    /// Topics with at least one subscriber, most subscribed first.
    pub async fn discover_topics(&self, include_subscribers: bool) -> Vec<TopicInfo> {
        let state = self.state.lock().await;
        let mut by_topic: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (agent, topics) in &state.topic_subscriptions {
            for topic in topics {
                by_topic.entry(topic).or_default().push(agent);
            }
        }

        let mut infos: Vec<TopicInfo> = by_topic
            .into_iter()
            .map(|(name, mut agents)| {
                agents.sort_unstable();
                TopicInfo {
                    name: name.to_string(),
                    subscriber_count: agents.len(),
                    subscribers: include_subscribers
                        .then(|| agents.iter().map(ToString::to_string).collect()),
                }
            })
            .collect();
        infos.sort_by(|a, b| {
            b.subscriber_count
                .cmp(&a.subscriber_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        infos
    }

    /// Restrict the topics `agent` may subscribe to. Existing subscriptions
    /// are left as they are.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for blank names or
    /// [`MeshError::Persistence`] if the write-through fails.
    pub async fn set_agent_permissions<I>(&self, agent: &str, allowed_topics: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        validate_identifier("agent id", agent)?;
        let allowed = collect_topics(allowed_topics)?;

        let mut state = self.state.lock().await;
        state
            .agent_permissions
            .insert(agent.to_string(), allowed.clone());
        debug!(agent = %agent, allowed = ?allowed, "Agent topic permissions set");

        if let Some(backend) = &self.backend {
            let saved = backend
                .save_agent_permissions(self.row_scope(), agent, &allowed)
                .await;
            self.written(saved, "save_agent_permissions")?;
        }
        Ok(())
    }

    /// Topics `agent` may subscribe to; `None` means unrestricted.
    pub async fn get_agent_permissions(&self, agent: &str) -> Option<BTreeSet<TopicName>> {
        self.state.lock().await.agent_permissions.get(agent).cloned()
    }

    /// Lift `agent`'s topic restriction. Returns whether one existed.
    ///
    /// # Errors
    /// Returns [`MeshError::Persistence`] if the write-through fails.
    pub async fn clear_agent_permissions(&self, agent: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.agent_permissions.remove(agent).is_some();

        if let Some(backend) = &self.backend {
            let deleted = backend
                .delete_agent_permissions(self.row_scope(), agent)
                .await;
            return Ok(self.written(deleted, "delete_agent_permissions")? || existed);
        }
        Ok(existed)
    }

    /// Delete one item. Returns whether it existed.
    ///
    /// # Errors
    /// Returns [`MeshError::Validation`] for a blank key or
    /// [`MeshError::Persistence`] if the write-through fails.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        validate_identifier("key", key)?;
        let mut state = self.state.lock().await;
        let existed = state.remove_item(key, self.indexing).is_some();
        debug!(key = %key, existed, "Context removed");

        if let Some(backend) = &self.backend {
            let deleted = backend.delete_item(self.row_scope(), key).await;
            return Ok(self.written(deleted, "remove")? || existed);
        }
        Ok(existed)
    }

    /// Drop expired items now. Returns how many were removed from memory.
    ///
    /// # Errors
    /// Returns [`MeshError::Persistence`] if the backend sweep fails.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let removed = state.sweep(now, self.indexing);

        if let Some(backend) = &self.backend {
            let swept = backend.cleanup_expired(self.row_scope(), now).await;
            self.written(swept, "cleanup_expired")?;
        }
        debug!(removed, "Expired context cleaned up");
        Ok(removed)
    }

    /// Lazy sweep on the push path. Backend failures are logged, not returned.
    async fn sweep_locked(&self, state: &mut MeshState) {
        let now = Utc::now();
        let removed = state.sweep(now, self.indexing);
        if let Some(backend) = &self.backend {
            if let Err(err) = backend.cleanup_expired(self.row_scope(), now).await {
                warn!(error = %err, "Background expiry sweep failed on backend");
            }
        }
        if removed > 0 {
            debug!(removed, "Lazy expiry sweep");
        }
    }

    /// Delete every item. Subscriptions and permissions are kept.
    ///
    /// # Errors
    /// Returns [`MeshError::Persistence`] if the write-through fails.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.clear_items();
        info!(scope = %self.row_scope(), "Context mesh cleared");

        if let Some(backend) = &self.backend {
            let cleared = backend.clear_all(self.row_scope()).await;
            self.written(cleared, "clear")?;
        }
        Ok(())
    }

    /// Item and subscription counters.
    pub async fn stats(&self) -> MeshStats {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut stats = MeshStats {
            total_items: state.items.len(),
            agents_with_topics: state
                .topic_subscriptions
                .values()
                .filter(|topics| !topics.is_empty())
                .count(),
            topics: state
                .topic_subscriptions
                .values()
                .flatten()
                .collect::<HashSet<_>>()
                .len(),
            ..MeshStats::default()
        };

        for item in state.items.values() {
            if item.is_expired_at(now) {
                stats.expired_items += 1;
            } else {
                stats.active_items += 1;
            }
            match item.visibility() {
                Visibility::Global => stats.global_items += 1,
                Visibility::Agents(_) => stats.private_items += 1,
                Visibility::Topics(_) => stats.topic_items += 1,
            }
        }
        stats
    }

    /// Release the backend. The mesh keeps serving from memory, but later
    /// writes will fail with [`MeshError::Persistence`].
    pub async fn close(&self) {
        if let Some(backend) = &self.backend {
            backend.close().await;
            info!(scope = %self.row_scope(), "Context mesh closed");
        }
    }
}

impl Default for ContextMesh {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_state(
    backend: &dyn PersistenceBackend,
    scope: &str,
    indexing: bool,
) -> std::result::Result<MeshState, PersistenceError> {
    backend.init_schema().await?;
    let items = backend.get_all_items(scope).await?;
    let topic_subscriptions = backend.get_all_agent_topics(scope).await?;
    let agent_permissions = backend.get_all_agent_permissions(scope).await?;

    let now = Utc::now();
    let mut state = MeshState::new();
    let mut skipped = 0usize;
    for (key, item) in items {
        if item.is_expired_at(now) {
            skipped += 1;
            continue;
        }
        state.insert_item(key, item, indexing);
    }
    if skipped > 0 {
        debug!(skipped, "Skipped expired items on load");
    }

    state.topic_subscriptions = topic_subscriptions;
    state.agent_permissions = agent_permissions;
    Ok(state)
}

fn collect_topics<I>(topics: I) -> Result<BTreeSet<TopicName>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    topics
        .into_iter()
        .map(|topic| {
            let topic = topic.into();
            validate_identifier("topic", &topic)?;
            Ok(topic)
        })
        .collect()
}
