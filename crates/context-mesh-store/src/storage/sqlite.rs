//! `SQLite` persistence backend (feature-gated).

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_mesh_core::{
    BackendKind, ContextItem, ItemRow, PersistenceBackend, PersistenceError, SqliteConfig,
    traits::{decode_set, encode_set, timestamp_secs},
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// `SQLITE_CORRUPT` and `SQLITE_NOTADB` primary result codes.
const CORRUPTION_CODES: [&str; 2] = ["11", "26"];

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS context_items (
        scope TEXT NOT NULL DEFAULT '',
        key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        agents_json TEXT,
        topics_json TEXT,
        ttl REAL,
        created_at REAL NOT NULL,
        PRIMARY KEY (scope, key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_context_items_expiry
        ON context_items (scope, created_at) WHERE ttl IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS agent_topics (
        scope TEXT NOT NULL DEFAULT '',
        agent TEXT NOT NULL,
        topics_json TEXT NOT NULL,
        PRIMARY KEY (scope, agent)
    )",
    "CREATE TABLE IF NOT EXISTS agent_permissions (
        scope TEXT NOT NULL DEFAULT '',
        agent TEXT NOT NULL,
        allowed_topics_json TEXT NOT NULL,
        PRIMARY KEY (scope, agent)
    )",
];

type ItemTuple = (String, String, Option<String>, Option<String>, Option<f64>, f64);

/// `SQLite` backend implementation.
///
/// Uses WAL journaling with `synchronous = NORMAL` and a busy timeout so
/// several meshes (one per user scope) can share one file. A file that
/// fails to open as a database, or whose pages fail `PRAGMA quick_check`,
/// is renamed aside and replaced by a fresh one.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteBackend {
    /// Open (creating if missing) the database described by `config`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened, even after replacing
    /// a corrupted file.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn connect(config: &SqliteConfig) -> Result<Self, PersistenceError> {
        match Self::open(config).await {
            Ok(backend) => Ok(backend),
            Err(err) if !config.is_in_memory() && err.is_corruption() => {
                let moved_to = quarantine(&config.path).await?;
                warn!(
                    moved_to = %moved_to.display(),
                    error = %err,
                    "SQLite database is corrupted, starting with a fresh file"
                );
                Self::open(config).await.map_err(connect_error)
            }
            Err(err) => Err(connect_error(err)),
        }
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(config: &SqliteConfig) -> Result<Self, OpenError> {
        if !config.is_in_memory() {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(sqlx::Error::Io)?;
            }
        }

        let pool_options = if config.is_in_memory() {
            // The database lives exactly as long as its one connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options(config)?).await?;

        if let Err(err) = prepare(&pool).await {
            pool.close().await;
            return Err(err);
        }

        info!("SQLite backend ready");
        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }
}

/// Why a database could not be opened.
#[derive(Debug, Error)]
enum OpenError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// The file opened but `PRAGMA quick_check` found damaged pages.
    #[error("integrity check failed: {0}")]
    Damaged(String),
}

impl OpenError {
    fn is_corruption(&self) -> bool {
        match self {
            Self::Database(err) => is_corruption(err),
            Self::Damaged(_) => true,
        }
    }
}

/// Verify the file, then create any missing tables.
///
/// A file with an intact header but damaged data pages opens cleanly and
/// only fails on the first read, so every page is checked up front.
async fn prepare(pool: &SqlitePool) -> Result<(), OpenError> {
    let report: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
        .fetch_all(pool)
        .await?;
    if !matches!(report.as_slice(), [only] if only == "ok") {
        return Err(OpenError::Damaged(report.join("; ")));
    }

    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn connect_options(config: &SqliteConfig) -> Result<SqliteConnectOptions, sqlx::Error> {
    let busy_timeout = Duration::from_secs(config.busy_timeout_secs);

    if config.is_in_memory() {
        return Ok(SqliteConnectOptions::from_str("sqlite::memory:")?.busy_timeout(busy_timeout));
    }

    Ok(SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout))
}

fn is_corruption(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    if db_err
        .code()
        .is_some_and(|code| CORRUPTION_CODES.contains(&&*code))
    {
        return true;
    }
    let message = db_err.message();
    message.contains("not a database") || message.contains("malformed")
}

/// Move a corrupted database (and its WAL side files) out of the way.
async fn quarantine(path: &Path) -> Result<PathBuf, PersistenceError> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let mut moved_to = path.as_os_str().to_owned();
    moved_to.push(format!(".corrupt-{stamp}"));
    let moved_to = PathBuf::from(moved_to);

    tokio::fs::rename(path, &moved_to)
        .await
        .map_err(|e| PersistenceError::Connect {
            backend: BackendKind::Sqlite,
            message: format!("failed to move corrupted database aside: {e}"),
        })?;

    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        let _ = tokio::fs::remove_file(PathBuf::from(side)).await;
    }

    Ok(moved_to)
}

fn connect_error(err: impl fmt::Display) -> PersistenceError {
    PersistenceError::Connect {
        backend: BackendKind::Sqlite,
        message: err.to_string(),
    }
}

fn query_error(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::PoolClosed => PersistenceError::Closed,
        other => PersistenceError::Query(other.to_string()),
    }
}

fn decode_item(row: ItemTuple) -> Result<(String, ContextItem), PersistenceError> {
    let (key, value_json, agents_json, topics_json, ttl, created_at) = row;
    let item = ItemRow {
        value_json,
        agents_json,
        topics_json,
        ttl,
        created_at,
    }
    .decode(&key)?;
    Ok((key, item))
}

fn decode_agent_row(agent: &str, json: &str) -> Result<BTreeSet<String>, PersistenceError> {
    decode_set(Some(json)).map_err(|message| PersistenceError::Corrupted {
        key: agent.to_string(),
        message,
    })
}

#[async_trait]
impl PersistenceBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn init_schema(&self) -> Result<(), PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| PersistenceError::Schema(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn save_item(
        &self,
        scope: &str,
        key: &str,
        item: &ContextItem,
    ) -> Result<(), PersistenceError> {
        let row = ItemRow::encode(item)?;
        sqlx::query(
            "INSERT INTO context_items (scope, key, value_json, agents_json, topics_json, ttl, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (scope, key) DO UPDATE SET
                value_json = excluded.value_json,
                agents_json = excluded.agents_json,
                topics_json = excluded.topics_json,
                ttl = excluded.ttl,
                created_at = excluded.created_at",
        )
        .bind(scope)
        .bind(key)
        .bind(row.value_json)
        .bind(row.agents_json)
        .bind(row.topics_json)
        .bind(row.ttl)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_item(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<ContextItem>, PersistenceError> {
        let row: Option<ItemTuple> = sqlx::query_as(
            "SELECT key, value_json, agents_json, topics_json, ttl, created_at
             FROM context_items WHERE scope = ? AND key = ?",
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(decode_item)
            .transpose()
            .map(|found| found.map(|(_, item)| item))
    }

    async fn delete_item(&self, scope: &str, key: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM context_items WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_all_items(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, ContextItem>, PersistenceError> {
        let rows: Vec<ItemTuple> = sqlx::query_as(
            "SELECT key, value_json, agents_json, topics_json, ttl, created_at
             FROM context_items WHERE scope = ?",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter().map(decode_item).collect()
    }

    async fn cleanup_expired(
        &self,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "DELETE FROM context_items
             WHERE scope = ? AND ttl IS NOT NULL AND created_at + ttl < ?",
        )
        .bind(scope)
        .bind(timestamp_secs(now))
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self, scope: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM context_items WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn save_agent_topics(
        &self,
        scope: &str,
        agent: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO agent_topics (scope, agent, topics_json) VALUES (?, ?, ?)
             ON CONFLICT (scope, agent) DO UPDATE SET topics_json = excluded.topics_json",
        )
        .bind(scope)
        .bind(agent)
        .bind(encode_set(topics)?)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_agent_topics(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT topics_json FROM agent_topics WHERE scope = ? AND agent = ?")
                .bind(scope)
                .bind(agent)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error)?;

        row.map(|(json,)| decode_agent_row(agent, &json)).transpose()
    }

    async fn get_all_agent_topics(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT agent, topics_json FROM agent_topics WHERE scope = ?")
                .bind(scope)
                .fetch_all(&self.pool)
                .await
                .map_err(query_error)?;

        rows.into_iter()
            .map(|(agent, json)| decode_agent_row(&agent, &json).map(|topics| (agent, topics)))
            .collect()
    }

    async fn save_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
        allowed_topics: &BTreeSet<String>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO agent_permissions (scope, agent, allowed_topics_json) VALUES (?, ?, ?)
             ON CONFLICT (scope, agent) DO UPDATE SET allowed_topics_json = excluded.allowed_topics_json",
        )
        .bind(scope)
        .bind(agent)
        .bind(encode_set(allowed_topics)?)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<Option<BTreeSet<String>>, PersistenceError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT allowed_topics_json FROM agent_permissions WHERE scope = ? AND agent = ?",
        )
        .bind(scope)
        .bind(agent)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(|(json,)| decode_agent_row(agent, &json)).transpose()
    }

    async fn get_all_agent_permissions(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, BTreeSet<String>>, PersistenceError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT agent, allowed_topics_json FROM agent_permissions WHERE scope = ?",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter()
            .map(|(agent, json)| decode_agent_row(&agent, &json).map(|topics| (agent, topics)))
            .collect()
    }

    async fn delete_agent_permissions(
        &self,
        scope: &str,
        agent: &str,
    ) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM agent_permissions WHERE scope = ? AND agent = ?")
            .bind(scope)
            .bind(agent)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::TimeDelta;
    use context_mesh_core::Visibility;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_in(dir: &Path) -> SqliteBackend {
        SqliteBackend::connect(&SqliteConfig::new(dir.join("mesh.db")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_item_roundtrip_and_upsert() {
        let temp_dir = tempdir().unwrap();
        let backend = open_in(temp_dir.path()).await;

        let visibility = Visibility::from_targets(["alice", "bob"], Vec::<String>::new()).unwrap();
        let first = ContextItem::new(json!({"v": 1}), visibility.clone(), None);
        let second = ContextItem::new(json!({"v": 2}), Visibility::Global, None);

        backend.save_item("", "plan", &first).await.unwrap();
        let loaded = backend.get_item("", "plan").await.unwrap().unwrap();
        assert_eq!(loaded.value(), &json!({"v": 1}));
        assert_eq!(loaded.visibility(), &visibility);

        backend.save_item("", "plan", &second).await.unwrap();
        let loaded = backend.get_item("", "plan").await.unwrap().unwrap();
        assert_eq!(loaded.value(), &json!({"v": 2}));
        assert!(loaded.visibility().is_global());

        assert!(backend.delete_item("", "plan").await.unwrap());
        assert!(!backend.delete_item("", "plan").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired_rows() {
        let temp_dir = tempdir().unwrap();
        let backend = open_in(temp_dir.path()).await;

        let stale = ContextItem::restore(
            json!("old"),
            Visibility::Global,
            Utc::now() - TimeDelta::seconds(30),
            Some(Duration::from_secs(5)),
        );
        let fresh = ContextItem::new(json!("new"), Visibility::Global, Some(Duration::from_secs(60)));
        let forever = ContextItem::new(json!("kept"), Visibility::Global, None);

        backend.save_item("s", "stale", &stale).await.unwrap();
        backend.save_item("s", "fresh", &fresh).await.unwrap();
        backend.save_item("s", "forever", &forever).await.unwrap();

        assert_eq!(backend.cleanup_expired("s", Utc::now()).await.unwrap(), 1);
        let remaining = backend.get_all_items("s").await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_two_backends_share_file_without_leaking_scopes() {
        let temp_dir = tempdir().unwrap();
        let first = Arc::new(open_in(temp_dir.path()).await);
        let second = Arc::new(open_in(temp_dir.path()).await);

        let a = ContextItem::new(json!("a"), Visibility::Global, None);
        let b = ContextItem::new(json!("b"), Visibility::Global, None);
        first.save_item("user-1", "k", &a).await.unwrap();
        second.save_item("user-2", "k", &b).await.unwrap();

        let from_first = first.get_item("user-1", "k").await.unwrap().unwrap();
        let from_second = second.get_item("user-2", "k").await.unwrap().unwrap();
        assert_eq!(from_first.value(), &json!("a"));
        assert_eq!(from_second.value(), &json!("b"));
        assert_eq!(first.get_all_items("user-2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_topics_and_permissions() {
        let temp_dir = tempdir().unwrap();
        let backend = open_in(temp_dir.path()).await;
        let topics: BTreeSet<String> = ["alpha".to_string(), "beta".to_string()].into();

        backend.save_agent_topics("s", "a1", &topics).await.unwrap();
        backend
            .save_agent_topics("s", "a2", &BTreeSet::new())
            .await
            .unwrap();
        backend.save_agent_permissions("s", "a1", &topics).await.unwrap();

        assert_eq!(
            backend.get_agent_topics("s", "a1").await.unwrap(),
            Some(topics.clone())
        );
        assert_eq!(
            backend.get_agent_topics("s", "a2").await.unwrap(),
            Some(BTreeSet::new())
        );
        assert!(backend.get_agent_topics("s", "nobody").await.unwrap().is_none());
        assert_eq!(backend.get_all_agent_topics("s").await.unwrap().len(), 2);
        assert_eq!(
            backend.get_agent_permissions("s", "a1").await.unwrap(),
            Some(topics)
        );
        assert!(backend.delete_agent_permissions("s", "a1").await.unwrap());
        assert!(backend.get_all_agent_permissions("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_renamed_and_replaced() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("mesh.db");
        std::fs::write(&path, vec![0xAB; 8192]).unwrap();

        let backend = SqliteBackend::connect(&SqliteConfig::new(&path))
            .await
            .unwrap();
        let item = ContextItem::new(json!(true), Visibility::Global, None);
        backend.save_item("", "k", &item).await.unwrap();

        let quarantined: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn test_damaged_data_pages_are_renamed_and_replaced() {
        use std::io::{Seek, SeekFrom, Write};

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("mesh.db");
        let backend = open_in(temp_dir.path()).await;
        let padding = "x".repeat(200);
        for i in 0..300 {
            let item = ContextItem::new(json!({"n": i, "pad": padding}), Visibility::Global, None);
            backend.save_item("", &format!("k{i}"), &item).await.unwrap();
        }
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&backend.pool)
            .await
            .unwrap();
        backend.close().await;

        // Keep page 1 (header and schema), trash everything after it.
        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len > 4096 * 4);
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(4096)).unwrap();
        file.write_all(&vec![0xAB; usize::try_from(len - 4096).unwrap()])
            .unwrap();
        drop(file);

        let backend = open_in(temp_dir.path()).await;
        assert!(backend.get_all_items("").await.unwrap().is_empty());
        let item = ContextItem::new(json!("fresh"), Visibility::Global, None);
        backend.save_item("", "k", &item).await.unwrap();

        let quarantined = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(quarantined, 1);
    }

    #[tokio::test]
    async fn test_in_memory_database() {
        let backend = SqliteBackend::connect(&SqliteConfig::new(":memory:"))
            .await
            .unwrap();
        let item = ContextItem::new(json!([1, 2]), Visibility::Global, None);
        backend.save_item("", "k", &item).await.unwrap();
        assert!(backend.get_item("", "k").await.unwrap().is_some());

        let options = backend.pool.options();
        assert_eq!(options.get_max_connections(), 1);
        assert_eq!(options.get_min_connections(), 1);
        assert!(options.get_idle_timeout().is_none());
        assert!(options.get_max_lifetime().is_none());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_error() {
        let temp_dir = tempdir().unwrap();
        let backend = open_in(temp_dir.path()).await;
        backend.close().await;

        let err = backend.get_all_items("").await.unwrap_err();
        assert!(matches!(err, PersistenceError::Closed));
    }
}
