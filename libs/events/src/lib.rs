//! # wolverine-events
//!
//! Cluster membership model and the events that describe its changes.
//!
//! ## Design Principles
//!
//! - Events are immutable records of cluster state transitions
//! - Every event knows how to fold itself into a [`NodeStateTracker`]
//! - Applying the same event twice leaves the tracker unchanged, because
//!   control messages are delivered at least once
//! - Cross-node convergence comes from every node applying the same
//!   broadcast events, never from shared memory
//!
//! ## Event Types
//!
//! - Node events (`node.started`, `node.exiting`, `node.leadership_assumed`)
//! - Agent events (`agent.started`, `agent.stopped`, `agent.assignments_changed`)

mod error;
mod events;
mod tracker;
mod types;

pub use error::EventError;
pub use events::*;
pub use tracker::NodeStateTracker;
pub use types::*;
