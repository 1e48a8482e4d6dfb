//! Cluster membership and operator override model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wolverine_id::{AgentUri, NodeId, NodeNumber, RestrictionId, ANY_NODE};

// =============================================================================
// Nodes
// =============================================================================

/// A node that is about to join the cluster and has not been numbered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub description: String,
    pub control_uri: String,
    pub capabilities: BTreeSet<AgentUri>,
    pub version: String,
    pub started: DateTime<Utc>,
}

impl NodeRegistration {
    /// Creates a registration stamped with the current time.
    pub fn new(node_id: NodeId, control_uri: impl Into<String>) -> Self {
        Self {
            node_id,
            description: String::new(),
            control_uri: control_uri.into(),
            capabilities: BTreeSet::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = AgentUri>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    /// Completes the registration with the number handed out by the node store.
    pub fn into_node(self, assigned_node_number: NodeNumber) -> WolverineNode {
        WolverineNode {
            node_id: self.node_id,
            assigned_node_number,
            description: self.description,
            control_uri: self.control_uri,
            capabilities: self.capabilities,
            active_agents: BTreeSet::new(),
            started: self.started,
            last_health_check: self.started,
            version: self.version,
        }
    }
}

/// A live member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WolverineNode {
    /// Stable identity of the node process.
    pub node_id: NodeId,

    /// Unique positive number; owner id for envelopes this node works.
    pub assigned_node_number: NodeNumber,

    /// Human readable description (host name, pod name).
    pub description: String,

    /// Address peers use to send coordination commands to this node.
    pub control_uri: String,

    /// Agent URIs this node is able to host.
    pub capabilities: BTreeSet<AgentUri>,

    /// Agent URIs currently running here, including the leader sentinel.
    pub active_agents: BTreeSet<AgentUri>,

    pub started: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
    pub version: String,
}

impl WolverineNode {
    /// Returns true if this node currently runs the leadership sentinel.
    pub fn is_leader(&self) -> bool {
        self.active_agents.iter().any(AgentUri::is_leader)
    }

    /// Returns true if the last heartbeat is older than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_health_check) > timeout
    }

    /// Returns true if this node advertises the capability to run `agent`.
    pub fn supports(&self, agent: &AgentUri) -> bool {
        self.capabilities.contains(agent)
    }

    /// Sorted capabilities restricted to one agent family.
    pub fn capabilities_for<'a>(&'a self, scheme: &'a str) -> impl Iterator<Item = &'a AgentUri> {
        self.capabilities.iter().filter(move |c| c.scheme() == scheme)
    }

    /// Running agents excluding the leadership sentinel.
    pub fn running_agents(&self) -> impl Iterator<Item = &AgentUri> {
        self.active_agents.iter().filter(|a| !a.is_leader())
    }
}

// =============================================================================
// Restrictions
// =============================================================================

/// Kind of operator override placed on an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionType {
    /// The agent must run on a specific node.
    Pinned,
    /// The agent must not run anywhere.
    Paused,
    /// No binding force; logically absent.
    None,
}

impl RestrictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pinned => "pinned",
            Self::Paused => "paused",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pinned" => Some(Self::Pinned),
            "paused" => Some(Self::Paused),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for RestrictionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator override for a single agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRestriction {
    pub id: RestrictionId,
    pub agent_uri: AgentUri,
    pub restriction_type: RestrictionType,
    /// Target node number for pins, `ANY_NODE` otherwise.
    pub node_number: i32,
}

impl AgentRestriction {
    /// Returns false for restrictions of type `None`.
    pub fn is_effective(&self) -> bool {
        self.restriction_type != RestrictionType::None
    }
}

/// The full set of operator overrides, at most one per agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRestrictions {
    restrictions: Vec<AgentRestriction>,
}

impl AgentRestrictions {
    pub fn new(restrictions: Vec<AgentRestriction>) -> Self {
        Self { restrictions }
    }

    /// All restrictions, including ones of type `None` that still need to be
    /// deleted from storage.
    pub fn all(&self) -> &[AgentRestriction] {
        &self.restrictions
    }

    /// Restrictions that carry binding force.
    pub fn effective(&self) -> impl Iterator<Item = &AgentRestriction> {
        self.restrictions.iter().filter(|r| r.is_effective())
    }

    pub fn find(&self, agent: &AgentUri) -> Option<&AgentRestriction> {
        self.restrictions
            .iter()
            .find(|r| &r.agent_uri == agent && r.is_effective())
    }

    pub fn is_paused(&self, agent: &AgentUri) -> bool {
        self.find(agent)
            .is_some_and(|r| r.restriction_type == RestrictionType::Paused)
    }

    /// Node number an agent is pinned to, if any.
    pub fn pinned_node(&self, agent: &AgentUri) -> Option<i32> {
        self.find(agent)
            .filter(|r| r.restriction_type == RestrictionType::Pinned)
            .map(|r| r.node_number)
    }

    /// Pins an agent to a node, replacing any earlier override for it.
    pub fn pin(&mut self, agent: AgentUri, node: NodeNumber) {
        self.upsert(agent, RestrictionType::Pinned, node.value());
    }

    /// Pauses an agent, replacing any earlier override for it.
    pub fn pause(&mut self, agent: AgentUri) {
        self.upsert(agent, RestrictionType::Paused, ANY_NODE);
    }

    /// Lifts any override on an agent.
    pub fn remove(&mut self, agent: &AgentUri) {
        if let Some(existing) = self.restrictions.iter_mut().find(|r| &r.agent_uri == agent) {
            existing.restriction_type = RestrictionType::None;
            existing.node_number = ANY_NODE;
        }
    }

    fn upsert(&mut self, agent: AgentUri, restriction_type: RestrictionType, node_number: i32) {
        match self.restrictions.iter_mut().find(|r| r.agent_uri == agent) {
            Some(existing) => {
                existing.restriction_type = restriction_type;
                existing.node_number = node_number;
            }
            None => self.restrictions.push(AgentRestriction {
                id: RestrictionId::new(),
                agent_uri: agent,
                restriction_type,
                node_number,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> AgentUri {
        AgentUri::parse(s).unwrap()
    }

    #[test]
    fn test_registration_into_node() {
        let node = NodeRegistration::new(NodeId::new(), "memory://node-1")
            .with_capabilities([uri("fake://one"), uri("fake://two")])
            .into_node(NodeNumber::new(1).unwrap());

        assert_eq!(node.assigned_node_number.value(), 1);
        assert!(node.supports(&uri("fake://one")));
        assert!(!node.is_leader());
        assert_eq!(node.last_health_check, node.started);
    }

    #[test]
    fn test_is_stale() {
        let mut node = NodeRegistration::new(NodeId::new(), "memory://node-1")
            .into_node(NodeNumber::new(1).unwrap());
        let now = Utc::now();
        node.last_health_check = now - chrono::Duration::seconds(90);

        assert!(node.is_stale(now, chrono::Duration::seconds(60)));
        assert!(!node.is_stale(now, chrono::Duration::seconds(120)));
    }

    #[test]
    fn test_restriction_none_is_logically_absent() {
        let mut restrictions = AgentRestrictions::default();
        let agent = uri("fake://one");

        restrictions.pin(agent.clone(), NodeNumber::new(2).unwrap());
        assert_eq!(restrictions.pinned_node(&agent), Some(2));

        restrictions.remove(&agent);
        assert_eq!(restrictions.pinned_node(&agent), None);
        assert!(restrictions.find(&agent).is_none());
        assert_eq!(restrictions.all().len(), 1);
        assert_eq!(restrictions.effective().count(), 0);
    }

    #[test]
    fn test_pause_replaces_pin() {
        let mut restrictions = AgentRestrictions::default();
        let agent = uri("fake://one");

        restrictions.pin(agent.clone(), NodeNumber::new(2).unwrap());
        restrictions.pause(agent.clone());

        assert!(restrictions.is_paused(&agent));
        assert_eq!(restrictions.pinned_node(&agent), None);
        assert_eq!(restrictions.all().len(), 1);
    }

    #[test]
    fn test_restriction_type_strings() {
        for t in [
            RestrictionType::Pinned,
            RestrictionType::Paused,
            RestrictionType::None,
        ] {
            assert_eq!(RestrictionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(RestrictionType::parse("bogus"), None);
    }
}
