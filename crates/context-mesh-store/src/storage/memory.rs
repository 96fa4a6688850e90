//! In-memory persistence backend.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_mesh_core::{BackendKind, ContextItem, PersistenceBackend, PersistenceError};

type ScopedKey = (String, String);

/// In-memory backend implementation.
///
/// Useful for tests and for sharing state between mesh instances in one
/// process. Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    items: RwLock<HashMap<ScopedKey, ContextItem>>,
    topics: RwLock<HashMap<ScopedKey, BTreeSet<String>>>,
    permissions: RwLock<HashMap<ScopedKey, BTreeSet<String>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn scoped(scope: &str, key: &str) -> ScopedKey {
    (scope.to_string(), key.to_string())
}

fn poisoned<T>(e: PoisonError<T>) -> PersistenceError {
    PersistenceError::Query(e.to_string())
}

fn collect_scope<V: Clone>(map: &HashMap<ScopedKey, V>, scope: &str) -> HashMap<String, V> {
    map.iter()
        .filter(|((s, _), _)| s == scope)
        .map(|((_, key), value)| (key.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn save_item(
        &self,
        scope: &str,
        key: &str,
        item: &ContextItem,
    ) -> Result<(), PersistenceError> {
        self.items
            .write()
            .map_err(poisoned)?
            .insert(scoped(scope, key), item.clone());
        Ok(())
    }

    async fn get_item(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<ContextItem>, PersistenceError> {
        Ok(self
            .items
            .read()
            .map_err(poisoned)?
            .get(&scoped(scope, key))
            .cloned())
    }

    async fn delete_item(&self, scope: &str, key: &str) -> Result<bool, PersistenceError> {
        Ok(self
            .items
            .write()
            .map_err(poisoned)?
            .remove(&scoped(scope, key))
            .is_some())
    }

    async fn get_all_items(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, ContextItem>, PersistenceError> {
        let items = self.items.read().map_err(poisoned)?;
        Ok(collect_scope(&items, scope))
    }

    async fn cleanup_expired(
        &self,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let mut items = self.items.write().map_err(poisoned)?;
        let before = items.len();
        items.retain(|(s, _), item| s != scope || !item.is_expired_at(now));
        Ok((before - items.len()) as u64)
    }

    async fn clear_all(&self, scope: &str) -> Result<(), PersistenceError> {
        self.items
            .write()
            .map_err(poisoned)?
            .retain(|(s, _), _| s != scope);
        Ok(())
    }

    async fn save_agent_topics(
        &self,
        scope: &str,
        agent: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError> {
        self.topics
            .write()
            .map_err(poisoned)?
            .insert(scoped(scope, agent), topics.clone());
        Ok(())
    }

    async fn get_agent_topics(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError> {
        Ok(self
            .topics
            .read()
            .map_err(poisoned)?
            .get(&scoped(scope, agent))
            .cloned())
    }

    async fn get_all_agent_topics(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError> {
        let topics = self.topics.read().map_err(poisoned)?;
        Ok(collect_scope(&topics, scope))
    }

    async fn save_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
        allowed_topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError> {
        self.permissions
            .write()
            .map_err(poisoned)?
            .insert(scoped(scope, agent), allowed_topics.clone());
        Ok(())
    }

    async fn get_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError> {
        Ok(self
            .permissions
            .read()
            .map_err(poisoned)?
            .get(&scoped(scope, agent))
            .cloned())
    }

    async fn get_all_agent_permissions(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError> {
        let permissions = self.permissions.read().map_err(poisoned)?;
        Ok(collect_scope(&permissions, scope))
    }

    async fn delete_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<bool, PersistenceError> {
        Ok(self
            .permissions
            .write()
            .map_err(poisoned)?
            .remove(&scoped(scope, agent))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use chrono::TimeDelta;
    use context_mesh_core::Visibility;
    use serde_json::json;

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let backend = MemoryBackend::new();
        let a = ContextItem::new(json!("a"), Visibility::Global, None);
        let b = ContextItem::new(json!("b"), Visibility::Global, None);

        backend.save_item("scope-1", "k", &a).await.unwrap();
        backend.save_item("scope-2", "k", &b).await.unwrap();

        let got = backend.get_item("scope-1", "k").await.unwrap().unwrap();
        assert_eq!(got.value(), &json!("a"));
        assert_eq!(backend.get_all_items("scope-2").await.unwrap().len(), 1);

        backend.clear_all("scope-1").await.unwrap();
        assert!(backend.get_item("scope-1", "k").await.unwrap().is_none());
        assert!(backend.get_item("scope-2", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_expired_only_touches_scope() {
        let backend = MemoryBackend::new();
        let created = Utc::now() - TimeDelta::seconds(60);
        let stale = ContextItem::restore(
            json!(1),
            Visibility::Global,
            created,
            Some(Duration::from_secs(1)),
        );

        backend.save_item("s1", "old", &stale).await.unwrap();
        backend.save_item("s2", "old", &stale).await.unwrap();

        assert_eq!(backend.cleanup_expired("s1", Utc::now()).await.unwrap(), 1);
        assert!(backend.get_item("s2", "old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_agent_rows() {
        let backend = MemoryBackend::new();
        let topics: BTreeSet<String> = ["t1".to_string()].into();

        backend.save_agent_topics("s", "agent", &topics).await.unwrap();
        backend
            .save_agent_permissions("s", "agent", &topics)
            .await
            .unwrap();

        assert_eq!(
            backend.get_agent_topics("s", "agent").await.unwrap(),
            Some(topics.clone())
        );
        assert!(backend.get_agent_topics("other", "agent").await.unwrap().is_none());
        assert_eq!(backend.get_all_agent_permissions("s").await.unwrap().len(), 1);
        assert!(backend.delete_agent_permissions("s", "agent").await.unwrap());
        assert!(!backend.delete_agent_permissions("s", "agent").await.unwrap());
    }
}
