//! In-process view of cluster membership, leadership and agent placement.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use wolverine_id::{AgentUri, NodeId};

use crate::events::ClusterEvent;
use crate::types::WolverineNode;

/// One node's view of the cluster, built by folding [`ClusterEvent`]s.
///
/// The tracker holds no locks of its own; the owner serializes access.
#[derive(Debug, Clone, Default)]
pub struct NodeStateTracker {
    nodes: BTreeMap<NodeId, WolverineNode>,
    /// Placement of running agents only; stopped agents are forgotten.
    agents: BTreeMap<AgentUri, NodeId>,
    leader: Option<NodeId>,
}

impl NodeStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an event to this tracker.
    pub fn publish(&mut self, event: &ClusterEvent) {
        debug!(event_type = event.event_type(), "applying cluster event");
        event.apply(self);
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Adds or replaces a node. Agents the node reports as running are
    /// recorded against it.
    pub fn add(&mut self, node: WolverineNode) {
        let node_id = node.node_id;
        let is_leader = node.is_leader();
        for agent in node.running_agents() {
            self.agents.insert(agent.clone(), node_id);
        }
        self.nodes.insert(node_id, node);

        if is_leader {
            self.mark_as_leader(&node_id);
        } else if self.leader == Some(node_id) {
            // The replacement snapshot no longer carries the sentinel.
            self.leader = None;
            self.agents.remove(&AgentUri::leader());
        }
    }

    /// Removes a node and forgets the agents it ran.
    pub fn remove(&mut self, node_id: &NodeId) {
        if self.nodes.remove(node_id).is_none() {
            return;
        }
        self.agents.retain(|_, owner| owner != node_id);
        if self.leader.as_ref() == Some(node_id) {
            self.leader = None;
        }
    }

    /// Moves the leadership sentinel to `node_id`. Unknown nodes are ignored.
    pub fn mark_as_leader(&mut self, node_id: &NodeId) {
        if !self.nodes.contains_key(node_id) {
            debug!(node_id = %node_id, "ignoring leadership for unknown node");
            return;
        }
        let leader = AgentUri::leader();
        for node in self.nodes.values_mut() {
            if &node.node_id == node_id {
                node.active_agents.insert(leader.clone());
            } else {
                node.active_agents.remove(&leader);
            }
        }
        self.agents.insert(leader, *node_id);
        self.leader = Some(*node_id);
    }

    /// Records that `agent` now runs on `node_id`, moving it off any other node.
    pub fn agent_started(&mut self, node_id: &NodeId, agent: AgentUri) {
        if agent.is_leader() {
            self.mark_as_leader(node_id);
            return;
        }
        for node in self.nodes.values_mut() {
            if &node.node_id != node_id {
                node.active_agents.remove(&agent);
            }
        }
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.active_agents.insert(agent.clone());
        }
        self.agents.insert(agent, *node_id);
    }

    /// Records that `agent` no longer runs anywhere.
    pub fn agent_stopped(&mut self, agent: &AgentUri) {
        for node in self.nodes.values_mut() {
            node.active_agents.remove(agent);
        }
        self.agents.remove(agent);
        if agent.is_leader() {
            self.leader = None;
        }
    }

    /// Replaces the placement of every non-leader agent with `assignments`.
    /// Agents missing from the snapshot are recorded as stopped.
    pub fn assignments_changed(&mut self, assignments: &BTreeMap<AgentUri, NodeId>) {
        let stale: Vec<AgentUri> = self
            .agents
            .keys()
            .filter(|uri| !uri.is_leader() && !assignments.contains_key(*uri))
            .cloned()
            .collect();
        for uri in stale {
            self.agent_stopped(&uri);
        }
        for (uri, node_id) in assignments {
            if !uri.is_leader() {
                self.agent_started(node_id, uri.clone());
            }
        }
    }

    /// Updates the heartbeat timestamp of a known node.
    pub fn update_health_check(&mut self, node_id: &NodeId, at: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.last_health_check = at;
        }
    }

    /// Drops every node, agent and leader. Used before reloading from storage.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.agents.clear();
        self.leader = None;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// All known nodes ordered by assigned node number.
    pub fn nodes(&self) -> Vec<&WolverineNode> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.assigned_node_number);
        nodes
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&WolverineNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leader(&self) -> Option<&WolverineNode> {
        self.leader.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader
    }

    /// Node with the lowest assigned number, the default leadership candidate.
    pub fn find_lowest_node(&self) -> Option<&WolverineNode> {
        self.nodes.values().min_by_key(|n| n.assigned_node_number)
    }

    /// Every node except `self_id`, ordered by node number.
    pub fn other_nodes(&self, self_id: &NodeId) -> Vec<&WolverineNode> {
        self.nodes()
            .into_iter()
            .filter(|n| &n.node_id != self_id)
            .collect()
    }

    /// Node currently running `agent`, if any.
    pub fn owner_of(&self, agent: &AgentUri) -> Option<NodeId> {
        self.agents.get(agent).copied()
    }

    /// Every agent currently placed on a node, the leader sentinel included.
    pub fn running_agents(&self) -> BTreeSet<AgentUri> {
        self.agents.keys().cloned().collect()
    }

    /// Current placement of every running non-leader agent.
    pub fn assignments(&self) -> BTreeMap<AgentUri, NodeId> {
        self.agents
            .iter()
            .filter(|(uri, _)| !uri.is_leader())
            .map(|(uri, owner)| (uri.clone(), *owner))
            .collect()
    }

    /// Nodes whose heartbeat is older than `timeout`.
    pub fn stale_nodes(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<&WolverineNode> {
        self.nodes()
            .into_iter()
            .filter(|n| n.is_stale(now, timeout))
            .collect()
    }
}
