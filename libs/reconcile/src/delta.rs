//! Corrections between actual and desired agent placement.

use wolverine_id::{AgentUri, NodeId};

/// A single correction the leader must dispatch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentDelta {
    /// The agent is not running and should run on `node_id`.
    Assign { agent_uri: AgentUri, node_id: NodeId },

    /// The agent runs on `from` but belongs on `to`.
    Reassign {
        agent_uri: AgentUri,
        from: NodeId,
        to: NodeId,
    },

    /// The agent runs on `node_id` and should not run anywhere.
    Stop { agent_uri: AgentUri, node_id: NodeId },
}

impl AgentDelta {
    /// Computes the correction for one agent, or `None` when nothing is off.
    pub fn between(agent_uri: &AgentUri, actual: Option<NodeId>, desired: Option<NodeId>) -> Option<Self> {
        match (actual, desired) {
            (None, None) => None,
            (None, Some(node_id)) => Some(Self::Assign {
                agent_uri: agent_uri.clone(),
                node_id,
            }),
            (Some(node_id), None) => Some(Self::Stop {
                agent_uri: agent_uri.clone(),
                node_id,
            }),
            (Some(from), Some(to)) if from != to => Some(Self::Reassign {
                agent_uri: agent_uri.clone(),
                from,
                to,
            }),
            (Some(_), Some(_)) => None,
        }
    }

    pub fn agent_uri(&self) -> &AgentUri {
        match self {
            Self::Assign { agent_uri, .. }
            | Self::Reassign { agent_uri, .. }
            | Self::Stop { agent_uri, .. } => agent_uri,
        }
    }
}
