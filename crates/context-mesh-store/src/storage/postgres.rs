//! `PostgreSQL` persistence backend (feature-gated).

use std::{
    collections::{BTreeSet, HashMap},
    str::FromStr,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_mesh_core::{
    BackendKind, ContextItem, ItemRow, PersistenceBackend, PersistenceError, PostgresConfig,
    traits::{decode_set, encode_set, timestamp_secs},
};
use secrecy::ExposeSecret;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
};
use tracing::{info, instrument};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS context_items (
        scope TEXT NOT NULL DEFAULT '',
        key TEXT NOT NULL,
        value_json JSON NOT NULL,
        agents_json JSON,
        topics_json JSON,
        ttl DOUBLE PRECISION,
        created_at DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (scope, key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_context_items_expiry
        ON context_items (scope, created_at) WHERE ttl IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS agent_topics (
        scope TEXT NOT NULL DEFAULT '',
        agent TEXT NOT NULL,
        topics_json JSON NOT NULL,
        PRIMARY KEY (scope, agent)
    )",
    "CREATE TABLE IF NOT EXISTS agent_permissions (
        scope TEXT NOT NULL DEFAULT '',
        agent TEXT NOT NULL,
        allowed_topics_json JSON NOT NULL,
        PRIMARY KEY (scope, agent)
    )",
];

const SELECT_ITEM_COLUMNS: &str = "SELECT key, value_json::text, agents_json::text, topics_json::text, ttl, created_at
     FROM context_items";

type ItemTuple = (String, String, Option<String>, Option<String>, Option<f64>, f64);

/// `PostgreSQL` backend implementation.
///
/// Values and name sets live in `JSON` (not `JSONB`) columns, which keep
/// the text as written, so strings holding `\u0000` round-trip as they do
/// on `SQLite`. Timestamps are stored as seconds since the epoch so rows stay
/// interchangeable with the `SQLite` layout.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect a pool and create the schema.
    ///
    /// # Errors
    /// Returns error if the server is unreachable or the schema cannot be created.
    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PersistenceError> {
        let options = connect_options(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| PersistenceError::Connect {
                backend: BackendKind::Postgres,
                message: e.to_string(),
            })?;

        let backend = Self { pool };
        backend.init_schema().await?;
        info!("PostgreSQL backend ready");
        Ok(backend)
    }
}

/// Build connection options from either the connection string or the
/// discrete fields.
///
/// # Errors
/// Returns [`PersistenceError::Connect`] for an unparsable URL or SSL mode.
pub fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, PersistenceError> {
    let invalid = |e: sqlx::Error| PersistenceError::Connect {
        backend: BackendKind::Postgres,
        message: e.to_string(),
    };

    if let Some(url) = &config.connection_string {
        return PgConnectOptions::from_str(url.expose_secret()).map_err(invalid);
    }

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .database(&config.database)
        .username(&config.user)
        .ssl_mode(PgSslMode::from_str(&config.sslmode).map_err(invalid)?);
    if let Some(password) = &config.password {
        options = options.password(password.expose_secret());
    }
    Ok(options)
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
impl PersistenceBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
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
             VALUES ($1, $2, $3::json, $4::json, $5::json, $6, $7)
             ON CONFLICT (scope, key) DO UPDATE SET
                value_json = EXCLUDED.value_json,
                agents_json = EXCLUDED.agents_json,
                topics_json = EXCLUDED.topics_json,
                ttl = EXCLUDED.ttl,
                created_at = EXCLUDED.created_at",
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
        let row: Option<ItemTuple> =
            sqlx::query_as(&format!("{SELECT_ITEM_COLUMNS} WHERE scope = $1 AND key = $2"))
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
        let result = sqlx::query("DELETE FROM context_items WHERE scope = $1 AND key = $2")
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
        let rows: Vec<ItemTuple> =
            sqlx::query_as(&format!("{SELECT_ITEM_COLUMNS} WHERE scope = $1"))
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
             WHERE scope = $1 AND ttl IS NOT NULL AND created_at + ttl < $2",
        )
        .bind(scope)
        .bind(timestamp_secs(now))
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self, scope: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM context_items WHERE scope = $1")
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
            "INSERT INTO agent_topics (scope, agent, topics_json) VALUES ($1, $2, $3::json)
             ON CONFLICT (scope, agent) DO UPDATE SET topics_json = EXCLUDED.topics_json",
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
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT topics_json::text FROM agent_topics WHERE scope = $1 AND agent = $2",
        )
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
            sqlx::query_as("SELECT agent, topics_json::text FROM agent_topics WHERE scope = $1")
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
            "INSERT INTO agent_permissions (scope, agent, allowed_topics_json) VALUES ($1, $2, $3::json)
             ON CONFLICT (scope, agent) DO UPDATE SET allowed_topics_json = EXCLUDED.allowed_topics_json",
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
            "SELECT allowed_topics_json::text FROM agent_permissions WHERE scope = $1 AND agent = $2",
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
            "SELECT agent, allowed_topics_json::text FROM agent_permissions WHERE scope = $1",
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
        let result = sqlx::query("DELETE FROM agent_permissions WHERE scope = $1 AND agent = $2")
            .bind(scope)
            .bind(agent)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}
