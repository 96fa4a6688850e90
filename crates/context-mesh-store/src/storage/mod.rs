//! Storage implementations.

use std::sync::Arc;

use context_mesh_core::{BackendConfig, BackendKind, PersistenceBackend, PersistenceError};

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::MemoryBackend;

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Open the backend described by `config`.
///
/// # Errors
/// Returns [`PersistenceError::Connect`] if the backend cannot be reached or
/// was not compiled in.
pub async fn connect_backend(
    config: &BackendConfig,
) -> Result<Arc<dyn PersistenceBackend>, PersistenceError> {
    match config {
        #[cfg(feature = "memory")]
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "sqlite")]
        BackendConfig::Sqlite(sqlite) => Ok(Arc::new(SqliteBackend::connect(sqlite).await?)),
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres(pg) => Ok(Arc::new(PostgresBackend::connect(pg).await?)),
        #[allow(unreachable_patterns)]
        other => Err(PersistenceError::Connect {
            backend: kind_of(other),
            message: "backend support not compiled in".to_string(),
        }),
    }
}

const fn kind_of(config: &BackendConfig) -> BackendKind {
    match config {
        BackendConfig::Memory => BackendKind::Memory,
        BackendConfig::Sqlite(_) => BackendKind::Sqlite,
        BackendConfig::Postgres(_) => BackendKind::Postgres,
    }
}

#[cfg(all(test, feature = "memory", feature = "sqlite"))]
mod tests {
    use super::*;
    use context_mesh_core::SqliteConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let backend = connect_backend(&BackendConfig::Memory).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_connect_sqlite_backend() {
        let temp_dir = tempdir().unwrap();
        let config = BackendConfig::Sqlite(SqliteConfig::new(temp_dir.path().join("nested/mesh.db")));
        let backend = connect_backend(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Sqlite);
        assert!(temp_dir.path().join("nested/mesh.db").exists());
        backend.close().await;
    }
}
