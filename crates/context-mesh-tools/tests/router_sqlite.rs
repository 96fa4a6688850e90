//! End-to-end: routers over meshes persisted to one `SQLite` file.

use std::sync::Arc;

use anyhow::Result;
use context_mesh_core::{BackendConfig, MeshConfig, PersistenceBackend, SqliteConfig};
use context_mesh_store::{ContextMesh, storage::SqliteBackend};
use context_mesh_tools::{AccessPolicy, Operation, ToolCall, ToolRouter};
use futures::future::join_all;
use serde_json::json;
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("context_mesh_store=debug,context_mesh_tools=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_router_writes_survive_reopen() -> Result<()> {
    init_tracing();
    let temp_dir = tempdir()?;
    let config = MeshConfig::new()
        .with_persistence(BackendConfig::Sqlite(SqliteConfig::new(
            temp_dir.path().join("mesh.db"),
        )))
        .with_user_scope("team-a");

    let mesh = Arc::new(ContextMesh::open(config.clone()).await?);
    let router = ToolRouter::with_policy(
        Arc::clone(&mesh),
        "planner",
        AccessPolicy::new().with_allowed([Operation::GetContext]),
    )?;

    let push = ToolCall::new(
        "push_context",
        json!({"key": "plan", "value": {"steps": ["a", "b"]}, "topics": ["planning"]}),
    );
    let denied = router.handle(push.clone()).await;
    assert_eq!(denied.error_kind(), Some("access_denied"));

    router.add_allowed(Operation::PushContext);
    router.add_allowed(Operation::SubscribeToTopics);
    assert!(router.handle(push).await.is_ok());
    router
        .invoke("subscribe_to_topics", json!({"topics": ["planning"]}))
        .await?;
    mesh.close().await;

    let reopened = Arc::new(ContextMesh::open(config).await?);
    let reader = ToolRouter::new(Arc::clone(&reopened), "planner")?;
    let listed = reader.invoke("list_context", json!({})).await?;
    assert_eq!(listed["items"]["plan"]["steps"], json!(["a", "b"]));

    let outsider = ToolRouter::new(reopened, "outsider")?;
    let err = outsider
        .invoke("get_context", json!({"key": "plan"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scoped_routers_share_one_file() -> Result<()> {
    init_tracing();
    let temp_dir = tempdir()?;
    let backend: Arc<dyn PersistenceBackend> =
        Arc::new(SqliteBackend::connect(&SqliteConfig::new(temp_dir.path().join("shared.db"))).await?);

    let mesh_one = Arc::new(
        ContextMesh::with_backend(MeshConfig::new().with_user_scope("user-1"), Arc::clone(&backend))
            .await?,
    );
    let mesh_two = Arc::new(
        ContextMesh::with_backend(MeshConfig::new().with_user_scope("user-2"), Arc::clone(&backend))
            .await?,
    );
    let one = Arc::new(ToolRouter::new(mesh_one, "agent")?);
    let two = Arc::new(ToolRouter::new(mesh_two, "agent")?);

    let pushes = (0..20).map(|i| {
        let router = if i % 2 == 0 { Arc::clone(&one) } else { Arc::clone(&two) };
        async move {
            router
                .invoke("push_context", json!({"key": "shared", "value": i % 2}))
                .await
        }
    });
    for result in join_all(pushes).await {
        result?;
    }

    let from_one = one.invoke("get_context", json!({"key": "shared"})).await?;
    let from_two = two.invoke("get_context", json!({"key": "shared"})).await?;
    assert_eq!(from_one["value"], 0);
    assert_eq!(from_two["value"], 1);

    let rows_one = backend.get_all_items("user-1").await?;
    let rows_two = backend.get_all_items("user-2").await?;
    assert_eq!(rows_one.len(), 1);
    assert_eq!(rows_two.len(), 1);
    Ok(())
}
