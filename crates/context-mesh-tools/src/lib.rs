//! Permission-gated operation routing for the context mesh.
//!
//! Provides:
//! - `Operation` - The closed set of named mesh operations and their arguments
//! - `AccessPolicy` / `Role` - Allow, deny and role rules per agent
//! - `ToolRouter` - Dispatch of named calls onto a mesh as one agent
//! - Request/response envelopes for external adapters

pub mod ops;
pub mod policy;
pub mod protocol;
pub mod router;

pub use ops::Operation;
pub use policy::{AccessPolicy, Role};
pub use protocol::{ToolCall, ToolDescriptor, ToolResponse};
pub use router::ToolRouter;
