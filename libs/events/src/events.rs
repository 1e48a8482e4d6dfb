//! Cluster events broadcast between nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wolverine_id::{AgentUri, NodeId};

use crate::error::EventError;
use crate::tracker::NodeStateTracker;
use crate::types::WolverineNode;

// =============================================================================
// Event Type Constants
// =============================================================================

/// Event type strings used on the wire and in logs.
pub mod event_types {
    pub const NODE_STARTED: &str = "node.started";
    pub const NODE_EXITING: &str = "node.exiting";
    pub const NODE_LEADERSHIP_ASSUMED: &str = "node.leadership_assumed";

    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_ASSIGNMENTS_CHANGED: &str = "agent.assignments_changed";

    pub const ALL: &[&str] = &[
        NODE_STARTED,
        NODE_EXITING,
        NODE_LEADERSHIP_ASSUMED,
        AGENT_STARTED,
        AGENT_STOPPED,
        AGENT_ASSIGNMENTS_CHANGED,
    ];
}

// =============================================================================
// Node Events
// =============================================================================

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventType {
    Started,
    Exiting,
    LeadershipAssumed,
}

impl NodeEventType {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started => event_types::NODE_STARTED,
            Self::Exiting => event_types::NODE_EXITING,
            Self::LeadershipAssumed => event_types::NODE_LEADERSHIP_ASSUMED,
        }
    }
}

/// A node lifecycle event. Carries a full snapshot of the node so receivers
/// that never saw it before can add it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: WolverineNode,
    pub kind: NodeEventType,
}

impl NodeEvent {
    pub fn started(node: WolverineNode) -> Self {
        Self {
            node,
            kind: NodeEventType::Started,
        }
    }

    pub fn exiting(node: WolverineNode) -> Self {
        Self {
            node,
            kind: NodeEventType::Exiting,
        }
    }

    pub fn leadership_assumed(node: WolverineNode) -> Self {
        Self {
            node,
            kind: NodeEventType::LeadershipAssumed,
        }
    }
}

// =============================================================================
// Cluster Events
// =============================================================================

/// Everything that changes a node's view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum ClusterEvent {
    #[serde(rename = "node")]
    Node(NodeEvent),

    #[serde(rename = "agent.started")]
    AgentStarted { node_id: NodeId, agent_uri: AgentUri },

    #[serde(rename = "agent.stopped")]
    AgentStopped { agent_uri: AgentUri },

    #[serde(rename = "agent.assignments_changed")]
    AgentAssignmentsChanged {
        assignments: BTreeMap<AgentUri, NodeId>,
    },
}

impl ClusterEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Node(event) => event.kind.event_type(),
            Self::AgentStarted { .. } => event_types::AGENT_STARTED,
            Self::AgentStopped { .. } => event_types::AGENT_STOPPED,
            Self::AgentAssignmentsChanged { .. } => event_types::AGENT_ASSIGNMENTS_CHANGED,
        }
    }

    /// Folds this event into a tracker. Applying the same event twice has
    /// the same effect as applying it once.
    pub fn apply(&self, tracker: &mut NodeStateTracker) {
        match self {
            Self::Node(event) => match event.kind {
                NodeEventType::Started => tracker.add(event.node.clone()),
                NodeEventType::Exiting => tracker.remove(&event.node.node_id),
                NodeEventType::LeadershipAssumed => {
                    tracker.add(event.node.clone());
                    tracker.mark_as_leader(&event.node.node_id);
                }
            },
            Self::AgentStarted { node_id, agent_uri } => {
                tracker.agent_started(node_id, agent_uri.clone())
            }
            Self::AgentStopped { agent_uri } => tracker.agent_stopped(agent_uri),
            Self::AgentAssignmentsChanged { assignments } => {
                tracker.assignments_changed(assignments)
            }
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self, EventError> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        let tag = value
            .get("event_type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| EventError::InvalidPayload("missing event_type".to_string()))?;
        if tag != "node" && !event_types::ALL.contains(&tag) {
            return Err(EventError::UnknownEventType(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl From<NodeEvent> for ClusterEvent {
    fn from(event: NodeEvent) -> Self {
        Self::Node(event)
    }
}
