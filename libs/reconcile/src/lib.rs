//! Reconciliation primitives for agent placement.
//!
//! The leader periodically converges the cluster from what is actually
//! running (current state) toward a balanced placement (desired state):
//!
//! - [`AssignmentGrid`] is an ephemeral snapshot of live nodes and known
//!   agents. Distribution algorithms mutate only the desired owner of each
//!   agent.
//! - [`AgentDelta`] is the minimal set of corrections between the two.
//! - [`RetryTracker`] and [`BackoffPolicy`] bound how hard a failing
//!   operation is retried.
//!
//! # Invariants
//!
//! - Computations are pure and deterministic given the same inputs
//! - An unpaused agent is assigned to at most one node
//! - The leadership sentinel is never part of a grid

mod delta;
mod grid;
mod retry;

pub use delta::AgentDelta;
pub use grid::{AssignmentGrid, GridAgent, GridNode};
pub use retry::{BackoffPolicy, RetryTracker};

use std::time::Duration;

use thiserror::Error;
use wolverine_id::AgentUri;

/// Errors raised by grid computations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    /// A pin names a node number that is not part of the grid.
    #[error("agent {agent} pinned to unknown node {node_number}")]
    UnknownNode { agent: AgentUri, node_number: i32 },

    /// A pin names a node that does not advertise the agent.
    #[error("node {node_number} does not support agent {agent}")]
    UnsupportedAgent { agent: AgentUri, node_number: i32 },
}

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
