//! # wolverine-id
//!
//! Stable identifier types for the message-bus runtime.
//!
//! ## Design Principles
//!
//! - Identities are system-generated UUIDs with a canonical hyphenated form
//! - IDs are typed to prevent mixing different resource types
//! - Node numbers are positive integers; `0` is reserved as [`ANY_NODE`]
//! - Agents are identified purely by URI, the scheme naming the agent family
//!
//! ## Examples
//!
//! - `NodeId`: `0190f7a2-4c1e-7d3b-9a55-2f1c0e8b6d42`
//! - `NodeNumber`: `3`
//! - `AgentUri`: `wolverinedb://master`, `wolverine://leader`

mod agent;
mod error;
mod macros;
mod types;

pub use agent::{AgentUri, LEADER_URI};
pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
