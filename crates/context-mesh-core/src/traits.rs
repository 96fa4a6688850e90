//! Persistence trait and the row codec shared by backends.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::context::{ContextItem, Visibility};

/// Which backend implementation is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Process-local maps.
    Memory,
    /// File-based `SQLite`.
    Sqlite,
    /// `PostgreSQL` server.
    Postgres,
}

impl BackendKind {
    /// Lowercase backend name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence error.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to connect to {backend} backend: {message}")]
    Connect {
        backend: BackendKind,
        message: String,
    },
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Storage error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupted row for '{key}': {message}")]
    Corrupted { key: String, message: String },
    #[error("Backend is closed")]
    Closed,
}

/// Trait for durable mirrors of mesh state.
///
/// Every call takes the row scope (see [`crate::UserScope::storage_key`]), so
/// one backend instance can serve several isolated meshes. Topic and
/// permission sets are stored as JSON arrays.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Backend implementation.
    fn kind(&self) -> BackendKind;

    /// Create tables and indexes if missing.
    async fn init_schema(&self) -> Result<(), PersistenceError>;

    /// Release connections. Later calls fail with [`PersistenceError::Closed`]
    /// or a connection error.
    async fn close(&self);

    /// Insert or fully replace one item.
    async fn save_item(
        &self,
        scope: &str,
        key: &str,
        item: &ContextItem,
    ) -> Result<(), PersistenceError>;

    /// Fetch one item, expired or not.
    async fn get_item(&self, scope: &str, key: &str)
    -> Result<Option<ContextItem>, PersistenceError>;

    /// Delete one item. Returns whether a row existed.
    async fn delete_item(&self, scope: &str, key: &str) -> Result<bool, PersistenceError>;

    /// All items in the scope.
    async fn get_all_items(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, ContextItem>, PersistenceError>;

    /// Delete items whose TTL elapsed before `now`. Returns the number removed.
    async fn cleanup_expired(&self, scope: &str, now: DateTime<Utc>)
    -> Result<u64, PersistenceError>;

    /// Delete every item in the scope. Subscriptions and permissions are kept.
    async fn clear_all(&self, scope: &str) -> Result<(), PersistenceError>;

    /// Replace an agent's topic subscriptions.
    async fn save_agent_topics(
        &self,
        scope: &str,
        agent: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError>;

    /// An agent's topic subscriptions.
    async fn get_agent_topics(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError>;

    /// Topic subscriptions for every agent in the scope.
    async fn get_all_agent_topics(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError>;

    /// Replace the set of topics an agent may subscribe to.
    async fn save_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
        allowed_topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError>;

    /// Topics an agent may subscribe to; `None` means unrestricted.
    async fn get_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError>;

    /// Permission rows for every agent in the scope.
    async fn get_all_agent_permissions(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError>;

    /// Drop an agent's permission row. Returns whether one existed.
    async fn delete_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<bool, PersistenceError>;
}

/// Column values of one `context_items` row.
///
/// `ttl` is in seconds and `created_at` in seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub value_json: String,
    pub agents_json: Option<String>,
    pub topics_json: Option<String>,
    pub ttl: Option<f64>,
    pub created_at: f64,
}

impl ItemRow {
    /// Encode an item into column values.
    ///
    /// # Errors
    /// Returns a serialization error if the value cannot be encoded.
    pub fn encode(item: &ContextItem) -> Result<Self, PersistenceError> {
        let (agents_json, topics_json) = match item.visibility() {
            Visibility::Global => (None, None),
            Visibility::Agents(agents) => (Some(serde_json::to_string(agents)?), None),
            Visibility::Topics(topics) => (None, Some(serde_json::to_string(topics)?)),
        };

        Ok(Self {
            value_json: serde_json::to_string(item.value())?,
            agents_json,
            topics_json,
            ttl: item.ttl().map(|ttl| ttl.as_secs_f64()),
            created_at: timestamp_secs(item.created_at()),
        })
    }

    /// Decode column values back into an item.
    ///
    /// # Errors
    /// Returns [`PersistenceError::Corrupted`] if the row cannot be decoded.
    pub fn decode(self, key: &str) -> Result<ContextItem, PersistenceError> {
        let corrupted = |message: String| PersistenceError::Corrupted {
            key: key.to_string(),
            message,
        };

        let value: Value =
            serde_json::from_str(&self.value_json).map_err(|e| corrupted(e.to_string()))?;
        let agents = decode_set(self.agents_json.as_deref()).map_err(&corrupted)?;
        let topics = decode_set(self.topics_json.as_deref()).map_err(&corrupted)?;
        let visibility =
            Visibility::from_targets(agents, topics).map_err(|e| corrupted(e.to_string()))?;

        let ttl = self
            .ttl
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| corrupted(e.to_string()))?;
        let created_at = from_timestamp_secs(self.created_at)
            .ok_or_else(|| corrupted(format!("invalid created_at {}", self.created_at)))?;

        Ok(ContextItem::restore(value, visibility, created_at, ttl))
    }
}

/// Encode a name set as a JSON array.
///
/// # Errors
/// Returns a serialization error if encoding fails.
pub fn encode_set(set: &BTreeSet<String>) -> Result<String, PersistenceError> {
    Ok(serde_json::to_string(set)?)
}

/// Decode a JSON array of names; `None` or `null` is an empty set.
///
/// # Errors
/// Returns the parse error message if the text is not a string array.
pub fn decode_set(json: Option<&str>) -> Result<BTreeSet<String>, String> {
    match json {
        None => Ok(BTreeSet::new()),
        Some(text) => serde_json::from_str::<Option<BTreeSet<String>>>(text)
            .map(Option::unwrap_or_default)
            .map_err(|e| e.to_string()),
    }
}

/// Seconds since the Unix epoch with microsecond precision.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn timestamp_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`timestamp_secs`].
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_timestamp_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_row_preserves_topics_and_ttl() {
        let visibility = Visibility::from_targets(Vec::<String>::new(), ["alpha", "beta"]).unwrap();
        let item = ContextItem::new(
            json!({"plan": [1, 2, 3]}),
            visibility.clone(),
            Some(Duration::from_millis(1500)),
        );

        let row = ItemRow::encode(&item).unwrap();
        assert!(row.agents_json.is_none());
        assert_eq!(row.topics_json.as_deref(), Some(r#"["alpha","beta"]"#));
        assert_eq!(row.ttl, Some(1.5));

        let decoded = row.decode("k").unwrap();
        assert_eq!(decoded.value(), item.value());
        assert_eq!(decoded.visibility(), &visibility);
        assert_eq!(decoded.ttl(), Some(Duration::from_millis(1500)));
        assert_eq!(
            decoded.created_at().timestamp_micros(),
            item.created_at().timestamp_micros()
        );
    }

    #[test]
    fn test_empty_agent_list_decodes_as_global() {
        let row = ItemRow {
            value_json: "1".into(),
            agents_json: Some("[]".into()),
            topics_json: None,
            ttl: None,
            created_at: 1_700_000_000.0,
        };
        let item = row.decode("k").unwrap();
        assert!(item.visibility().is_global());
    }

    #[test]
    fn test_corrupted_row() {
        let row = ItemRow {
            value_json: "{not json".into(),
            agents_json: None,
            topics_json: None,
            ttl: None,
            created_at: 1_700_000_000.0,
        };
        let err = row.decode("broken").unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupted { ref key, .. } if key == "broken"));
    }

    #[test]
    fn test_row_with_agents_and_topics_is_corrupted() {
        let row = ItemRow {
            value_json: "null".into(),
            agents_json: Some(r#"["a"]"#.into()),
            topics_json: Some(r#"["t"]"#.into()),
            ttl: None,
            created_at: 1_700_000_000.0,
        };
        assert!(row.decode("k").is_err());
    }

    #[test]
    fn test_decode_set_accepts_null() {
        assert!(decode_set(Some("null")).unwrap().is_empty());
        assert!(decode_set(None).unwrap().is_empty());
        assert!(decode_set(Some("42")).is_err());
    }
}
