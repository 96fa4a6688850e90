//! Context mesh store and persistence backends.
//!
//! Provides:
//! - `ContextMesh` - Concurrent store with visibility rules, TTL and topics
//! - Storage implementations (memory, SQLite, PostgreSQL)

pub mod mesh;
pub mod storage;

pub use mesh::{ContextMesh, KeyListing, MeshStats, TopicInfo};
pub use storage::connect_backend;
