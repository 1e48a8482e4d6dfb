//! Node agent errors.

use thiserror::Error;
use wolverine_durability::StoreError;
use wolverine_id::AgentUri;

/// Failure to deliver a command to another node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No node answers at the control address.
    #[error("unknown node at {0}")]
    UnknownNode(String),

    #[error("timed out invoking {0}")]
    Timeout(String),

    /// The remote node received the command and failed it.
    #[error("remote failure: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    /// Errors the next evaluation or verification pass is expected to heal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UnknownNode(_) | Self::Timeout(_))
    }
}

/// Errors raised while executing an agent command.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No agent family handles the URI's scheme.
    #[error("no agent family for {0}")]
    InvalidAgent(AgentUri),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("agent {uri} failed: {reason}")]
    AgentFailed { uri: AgentUri, reason: String },

    /// The controller has not joined the cluster yet, or has left it.
    #[error("node has not joined the cluster")]
    NotJoined,
}

impl ControllerError {
    pub fn agent_failed(uri: &AgentUri, reason: impl ToString) -> Self {
        Self::AgentFailed {
            uri: uri.clone(),
            reason: reason.to_string(),
        }
    }
}
