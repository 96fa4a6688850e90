//! Core abstractions for the context mesh.
//!
//! This crate provides the fundamental building blocks:
//! - `ContextItem` / `Visibility` - Stored values and who may read them
//! - `UserScope` - Tenant namespacing for shared backends
//! - `MeshConfig` - Construction parameters
//! - `PersistenceBackend` - Trait for durable backends, plus the row codec
//! - `MeshError` - Error taxonomy shared by every layer

pub mod config;
pub mod context;
pub mod error;
pub mod scope;
pub mod traits;

pub use config::{BackendConfig, MeshConfig, PostgresConfig, SqliteConfig};
pub use context::{AgentId, ContextItem, PushOptions, TopicName, Visibility};
pub use error::{MeshError, Result};
pub use scope::{IMPLICIT_SCOPE, UserScope};
pub use traits::{BackendKind, ItemRow, PersistenceBackend, PersistenceError};
