//! The closed set of coordination commands exchanged between nodes.
//!
//! A command executed by [`crate::NodeAgentController`] yields zero or more
//! follow-up commands; the controller's driver loop keeps executing them
//! until none remain.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use wolverine_events::ClusterEvent;
use wolverine_id::{AgentUri, NodeId};
use wolverine_reconcile::AgentDelta;

/// A coordination command, routed in-process or to a peer's control URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Start an agent on the receiving node.
    StartAgent { agent_uri: AgentUri },
    StartAgents { agent_uris: Vec<AgentUri> },

    /// Stop an agent on the receiving node.
    StopAgent { agent_uri: AgentUri },
    StopAgents { agent_uris: Vec<AgentUri> },

    /// Leader side: make `node_id` run the agent.
    AssignAgent { agent_uri: AgentUri, node_id: NodeId },
    AssignAgents { node_id: NodeId, agent_uris: Vec<AgentUri> },

    /// Leader side: stop on `from`, then on success assign to `to`.
    ReassignAgent {
        agent_uri: AgentUri,
        from: NodeId,
        to: NodeId,
    },

    /// Leader side: make `node_id` stop the agent.
    StopRemoteAgent { agent_uri: AgentUri, node_id: NodeId },
    StopRemoteAgents { node_id: NodeId, agent_uris: Vec<AgentUri> },

    EvaluateAssignments,
    VerifyAssignments,

    /// Bid for leadership, expecting `current_leader` in the store.
    TryAssumeLeadership { current_leader: Option<NodeId> },

    CheckHealth,

    /// Request/reply: which agents does the receiver run.
    QueryRunningAgents,

    /// A cluster event to fold into the receiver's tracker.
    ClusterEvent { event: ClusterEvent },
}

impl AgentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartAgent { .. } => "start_agent",
            Self::StartAgents { .. } => "start_agents",
            Self::StopAgent { .. } => "stop_agent",
            Self::StopAgents { .. } => "stop_agents",
            Self::AssignAgent { .. } => "assign_agent",
            Self::AssignAgents { .. } => "assign_agents",
            Self::ReassignAgent { .. } => "reassign_agent",
            Self::StopRemoteAgent { .. } => "stop_remote_agent",
            Self::StopRemoteAgents { .. } => "stop_remote_agents",
            Self::EvaluateAssignments => "evaluate_assignments",
            Self::VerifyAssignments => "verify_assignments",
            Self::TryAssumeLeadership { .. } => "try_assume_leadership",
            Self::CheckHealth => "check_health",
            Self::QueryRunningAgents => "query_running_agents",
            Self::ClusterEvent { .. } => "cluster_event",
        }
    }

    /// Turns grid corrections into commands, batching assigns and stops
    /// that target the same node.
    pub fn from_deltas(deltas: impl IntoIterator<Item = AgentDelta>) -> Vec<Self> {
        let mut assigns: BTreeMap<NodeId, Vec<AgentUri>> = BTreeMap::new();
        let mut stops: BTreeMap<NodeId, Vec<AgentUri>> = BTreeMap::new();
        let mut reassigns = Vec::new();

        for delta in deltas {
            match delta {
                AgentDelta::Assign { agent_uri, node_id } => {
                    assigns.entry(node_id).or_default().push(agent_uri)
                }
                AgentDelta::Stop { agent_uri, node_id } => {
                    stops.entry(node_id).or_default().push(agent_uri)
                }
                AgentDelta::Reassign {
                    agent_uri,
                    from,
                    to,
                } => reassigns.push(Self::ReassignAgent {
                    agent_uri,
                    from,
                    to,
                }),
            }
        }

        // Stops first so capacity frees up before new work lands.
        let stops = stops.into_iter().map(|(node_id, mut agent_uris)| {
            if agent_uris.len() == 1 {
                Self::StopRemoteAgent {
                    agent_uri: agent_uris.remove(0),
                    node_id,
                }
            } else {
                Self::StopRemoteAgents { node_id, agent_uris }
            }
        });
        let assigns = assigns.into_iter().map(|(node_id, mut agent_uris)| {
            if agent_uris.len() == 1 {
                Self::AssignAgent {
                    agent_uri: agent_uris.remove(0),
                    node_id,
                }
            } else {
                Self::AssignAgents { node_id, agent_uris }
            }
        });

        stops.chain(reassigns).chain(assigns).collect()
    }
}

/// Answer to a remotely invoked command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum AgentReply {
    Accepted,

    /// Agents running on `node_id` after the command.
    Running {
        node_id: NodeId,
        agents: BTreeSet<AgentUri>,
    },

    Failed { reason: String },
}
