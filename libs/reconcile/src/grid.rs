//! Assignment grid: desired agent placement computed from a topology snapshot.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use wolverine_events::{AgentRestrictions, NodeStateTracker, RestrictionType, WolverineNode};
use wolverine_id::{AgentUri, NodeId, NodeNumber};

use crate::delta::AgentDelta;
use crate::GridError;

// =============================================================================
// Grid Members
// =============================================================================

/// A live node as seen by one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridNode {
    pub node_id: NodeId,
    pub number: NodeNumber,
    pub is_leader: bool,
    pub capabilities: BTreeSet<AgentUri>,
}

impl GridNode {
    pub fn new(node_id: NodeId, number: NodeNumber) -> Self {
        Self {
            node_id,
            number,
            is_leader: false,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn as_leader(mut self) -> Self {
        self.is_leader = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = AgentUri>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn supports(&self, agent: &AgentUri) -> bool {
        self.capabilities.contains(agent)
    }

    fn capabilities_for(&self, scheme: &str) -> Vec<&AgentUri> {
        self.capabilities
            .iter()
            .filter(|c| c.scheme() == scheme)
            .collect()
    }
}

impl From<&WolverineNode> for GridNode {
    fn from(node: &WolverineNode) -> Self {
        Self {
            node_id: node.node_id,
            number: node.assigned_node_number,
            is_leader: node.is_leader(),
            capabilities: node.capabilities.clone(),
        }
    }
}

/// An agent as seen by one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridAgent {
    pub uri: AgentUri,
    pub is_pinned: bool,
    pub is_paused: bool,
    /// Where the agent actually ran when the grid was built.
    pub original_node: Option<NodeId>,
    /// Where the agent should run once the pass completes.
    pub assigned_node: Option<NodeId>,
    /// Nodes able to host the agent. Filled by blue/green distribution only.
    pub candidate_nodes: Vec<NodeId>,
}

impl GridAgent {
    fn new(uri: AgentUri) -> Self {
        Self {
            uri,
            is_pinned: false,
            is_paused: false,
            original_node: None,
            assigned_node: None,
            candidate_nodes: Vec::new(),
        }
    }

    fn detach(&mut self) {
        self.assigned_node = None;
        self.is_pinned = false;
    }
}

// =============================================================================
// Assignment Grid
// =============================================================================

/// Ephemeral snapshot of live nodes and known agents.
///
/// Distribution algorithms only move `assigned_node`; `original_node` stays
/// as built so [`AssignmentGrid::diff`] can derive the corrections.
#[derive(Debug, Clone)]
pub struct AssignmentGrid {
    nodes: BTreeMap<NodeId, GridNode>,
    agents: BTreeMap<AgentUri, GridAgent>,
    evaluated_at: DateTime<Utc>,
}

impl Default for AssignmentGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentGrid {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            agents: BTreeMap::new(),
            evaluated_at: Utc::now(),
        }
    }

    /// Builds a grid from the tracker's current view. Only running agents
    /// are seeded; callers add whatever the agent families list.
    pub fn for_tracker(tracker: &NodeStateTracker) -> Self {
        let mut grid = Self::new();
        for node in tracker.nodes() {
            grid.add_node(GridNode::from(node));
            for agent in node.running_agents() {
                grid.running(agent.clone(), node.node_id);
            }
        }
        grid
    }

    // -------------------------------------------------------------------------
    // Building
    // -------------------------------------------------------------------------

    pub fn add_node(&mut self, node: GridNode) -> &mut Self {
        self.nodes.insert(node.node_id, node);
        self
    }

    /// Registers agents as known. Existing entries are left untouched.
    pub fn with_agents(&mut self, uris: impl IntoIterator<Item = AgentUri>) -> &mut Self {
        for uri in uris {
            if !uri.is_leader() {
                self.agents
                    .entry(uri.clone())
                    .or_insert_with(|| GridAgent::new(uri));
            }
        }
        self
    }

    /// Records that `uri` is currently running on `node_id`.
    pub fn running(&mut self, uri: AgentUri, node_id: NodeId) -> &mut Self {
        if uri.is_leader() {
            return self;
        }
        let agent = self
            .agents
            .entry(uri.clone())
            .or_insert_with(|| GridAgent::new(uri));
        agent.original_node = Some(node_id);
        agent.assigned_node = Some(node_id);
        self
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }

    /// Nodes ordered by node number.
    pub fn nodes(&self) -> Vec<&GridNode> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.number);
        nodes
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&GridNode> {
        self.nodes.get(node_id)
    }

    pub fn node_by_number(&self, number: i32) -> Option<&GridNode> {
        self.nodes.values().find(|n| n.number.value() == number)
    }

    pub fn agents(&self) -> impl Iterator<Item = &GridAgent> {
        self.agents.values()
    }

    pub fn agent(&self, uri: &AgentUri) -> Option<&GridAgent> {
        self.agents.get(uri)
    }

    /// Desired owner of every assigned agent.
    pub fn assignments(&self) -> BTreeMap<AgentUri, NodeId> {
        self.agents
            .values()
            .filter_map(|a| a.assigned_node.map(|n| (a.uri.clone(), n)))
            .collect()
    }

    /// Number of agents of one family assigned to each node, zeros included.
    pub fn agent_counts(&self, scheme: &str) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for agent in self.agents.values().filter(|a| a.uri.scheme() == scheme) {
            if let Some(count) = agent.assigned_node.and_then(|n| counts.get_mut(&n)) {
                *count += 1;
            }
        }
        counts
    }

    // -------------------------------------------------------------------------
    // Restrictions
    // -------------------------------------------------------------------------

    /// Forces an agent onto the node with `node_number`.
    pub fn pin(&mut self, uri: &AgentUri, node_number: i32) -> Result<(), GridError> {
        let node = self
            .node_by_number(node_number)
            .ok_or_else(|| GridError::UnknownNode {
                agent: uri.clone(),
                node_number,
            })?;
        if !node.supports(uri) {
            return Err(GridError::UnsupportedAgent {
                agent: uri.clone(),
                node_number,
            });
        }
        let node_id = node.node_id;

        self.with_agents([uri.clone()]);
        if let Some(agent) = self.agents.get_mut(uri) {
            agent.assigned_node = Some(node_id);
            agent.is_pinned = true;
            agent.is_paused = false;
        }
        Ok(())
    }

    /// Detaches an agent and excludes it from every later distribution.
    pub fn pause(&mut self, uri: &AgentUri) {
        self.with_agents([uri.clone()]);
        if let Some(agent) = self.agents.get_mut(uri) {
            agent.detach();
            agent.is_paused = true;
        }
    }

    /// Applies operator overrides. Pins that cannot be honoured are dropped
    /// and the agent distributes normally.
    pub fn apply_restrictions(&mut self, restrictions: &AgentRestrictions) {
        for restriction in restrictions.effective() {
            match restriction.restriction_type {
                RestrictionType::Paused => self.pause(&restriction.agent_uri),
                RestrictionType::Pinned => {
                    if let Err(e) = self.pin(&restriction.agent_uri, restriction.node_number) {
                        warn!(error = %e, "dropping agent pin");
                    }
                }
                RestrictionType::None => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Distribution
    // -------------------------------------------------------------------------

    /// True when every node advertises the same capabilities for `scheme`.
    pub fn all_nodes_have_same_capabilities(&self, scheme: &str) -> bool {
        let mut sets = self.nodes.values().map(|n| n.capabilities_for(scheme));
        let Some(first) = sets.next() else {
            return true;
        };
        sets.all(|set| set == first)
    }

    /// Picks the simple or the capability-aware algorithm for `scheme`.
    pub fn distribute(&mut self, scheme: &str) {
        if self.all_nodes_have_same_capabilities(scheme) {
            self.distribute_evenly(scheme);
        } else {
            self.distribute_evenly_with_blue_green_semantics(scheme);
        }
    }

    /// Spreads the unpaused agents of `scheme` so node loads differ by at
    /// most one, moving as few running agents as possible.
    pub fn distribute_evenly(&mut self, scheme: &str) {
        let order = self.node_order();
        let uris = self.prepare(scheme, |_, _| true);
        if order.is_empty() {
            self.detach_all(&uris);
            return;
        }

        let total = uris.len();
        let minimum = total / order.len();
        let remainder = total % order.len();
        let maximum = minimum + usize::from(remainder > 0);

        let (mut placed, mut queue) = self.current_placement(&order, &uris);

        // Pass 1: nothing above the ceiling.
        for id in &order {
            if let Some(list) = placed.get_mut(id) {
                while list.len() > maximum {
                    match self.take_unpinned(list) {
                        Some(uri) => queue.push(uri),
                        None => break,
                    }
                }
            }
        }

        // Only `remainder` nodes may sit at the ceiling. Shed from the
        // leader first, then from the highest numbers.
        if remainder > 0 {
            let mut at_max: Vec<NodeId> = order
                .iter()
                .filter(|id| placed[*id].len() >= maximum)
                .copied()
                .collect();
            at_max.reverse();
            at_max.sort_by_key(|id| !self.nodes[id].is_leader);

            let mut excess = at_max.len().saturating_sub(remainder);
            for id in at_max {
                if excess == 0 {
                    break;
                }
                if let Some(list) = placed.get_mut(&id) {
                    if let Some(uri) = self.take_unpinned(list) {
                        queue.push(uri);
                        excess -= 1;
                    }
                }
            }
        }

        queue.sort();
        let mut queue: VecDeque<AgentUri> = queue.into();

        // Pass 2: fill everyone to the floor.
        for id in &order {
            let list = placed.entry(*id).or_default();
            while list.len() < minimum {
                match queue.pop_front() {
                    Some(uri) => list.push(uri),
                    None => break,
                }
            }
        }

        // Pass 3: the remainder, non-leaders first.
        let mut preferred: Vec<NodeId> = order.clone();
        preferred.sort_by_key(|id| self.nodes[id].is_leader);
        for id in &preferred {
            if queue.is_empty() {
                break;
            }
            let list = placed.entry(*id).or_default();
            if list.len() < maximum {
                if let Some(uri) = queue.pop_front() {
                    list.push(uri);
                }
            }
        }

        // Pins can push nodes past the ceiling; whatever is left goes to the
        // least loaded node.
        while let Some(uri) = queue.pop_front() {
            let Some(id) = self.least_loaded(&preferred, &placed) else {
                break;
            };
            placed.entry(id).or_default().push(uri);
        }

        self.write_back(placed);
        debug!(scheme, total, nodes = order.len(), "distributed agents evenly");
    }

    /// Capability-aware distribution for clusters running mixed versions.
    /// An agent only ever lands on a node that advertises it.
    pub fn distribute_evenly_with_blue_green_semantics(&mut self, scheme: &str) {
        let order = self.node_order();
        let uris = self.prepare(scheme, |node, uri| node.supports(uri));
        if order.is_empty() {
            self.detach_all(&uris);
            return;
        }

        let eligible = uris
            .iter()
            .filter(|uri| !self.agents[*uri].candidate_nodes.is_empty())
            .count();
        let maximum = eligible.div_ceil(order.len());

        let (mut placed, mut queue) = self.current_placement(&order, &uris);

        for id in &order {
            if let Some(list) = placed.get_mut(id) {
                while list.len() > maximum {
                    match self.take_unpinned(list) {
                        Some(uri) => queue.push(uri),
                        None => break,
                    }
                }
            }
        }

        // Most constrained first so rare agents are not starved.
        queue.sort_by(|a, b| {
            let ca = self.agents[a].candidate_nodes.len();
            let cb = self.agents[b].candidate_nodes.len();
            ca.cmp(&cb).then_with(|| a.cmp(b))
        });

        for uri in queue {
            let candidates = self.agents[&uri].candidate_nodes.clone();
            match self.least_loaded(&candidates, &placed) {
                Some(id) => placed.entry(id).or_default().push(uri),
                None => debug!(agent = %uri, "no node advertises agent"),
            }
        }

        self.write_back(placed);
        debug!(scheme, eligible, nodes = order.len(), "distributed agents by capability");
    }

    // -------------------------------------------------------------------------
    // Deltas
    // -------------------------------------------------------------------------

    /// Corrections that move every agent from its original to its assigned
    /// node.
    pub fn diff(&self) -> Vec<AgentDelta> {
        self.agents
            .values()
            .filter_map(|a| AgentDelta::between(&a.uri, a.original_node, a.assigned_node))
            .collect()
    }

    /// Corrections between externally reported placement and this grid.
    /// Agents running that the grid has never heard of are stopped.
    pub fn find_delta(&self, actual: &BTreeMap<AgentUri, NodeId>) -> Vec<AgentDelta> {
        let mut deltas: Vec<AgentDelta> = self
            .agents
            .values()
            .filter_map(|a| AgentDelta::between(&a.uri, actual.get(&a.uri).copied(), a.assigned_node))
            .collect();

        for (uri, node_id) in actual {
            if !uri.is_leader() && !self.agents.contains_key(uri) {
                deltas.push(AgentDelta::Stop {
                    agent_uri: uri.clone(),
                    node_id: *node_id,
                });
            }
        }
        deltas
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn node_order(&self) -> Vec<NodeId> {
        self.nodes().into_iter().map(|n| n.node_id).collect()
    }

    /// Collects the unpaused agents of `scheme`, computes their candidates
    /// and detaches any that sit on a missing or ineligible node.
    fn prepare<F>(&mut self, scheme: &str, eligible: F) -> Vec<AgentUri>
    where
        F: Fn(&GridNode, &AgentUri) -> bool,
    {
        let order = self.node_order();
        let mut uris = Vec::new();
        for agent in self.agents.values_mut() {
            if agent.uri.scheme() != scheme || agent.is_paused {
                continue;
            }
            agent.candidate_nodes = order
                .iter()
                .filter(|id| eligible(&self.nodes[*id], &agent.uri))
                .copied()
                .collect();

            if let Some(node_id) = agent.assigned_node {
                if !agent.candidate_nodes.contains(&node_id) {
                    agent.detach();
                }
            }
            uris.push(agent.uri.clone());
        }
        uris
    }

    fn detach_all(&mut self, uris: &[AgentUri]) {
        for uri in uris {
            if let Some(agent) = self.agents.get_mut(uri) {
                agent.detach();
            }
        }
    }

    fn current_placement(
        &self,
        order: &[NodeId],
        uris: &[AgentUri],
    ) -> (BTreeMap<NodeId, Vec<AgentUri>>, Vec<AgentUri>) {
        let mut placed: BTreeMap<NodeId, Vec<AgentUri>> =
            order.iter().map(|id| (*id, Vec::new())).collect();
        let mut queue = Vec::new();
        for uri in uris {
            match self.agents[uri].assigned_node {
                Some(node_id) => placed.entry(node_id).or_default().push(uri.clone()),
                None => queue.push(uri.clone()),
            }
        }
        (placed, queue)
    }

    /// Removes the last unpinned agent from a node's list.
    fn take_unpinned(&self, list: &mut Vec<AgentUri>) -> Option<AgentUri> {
        let index = list.iter().rposition(|uri| !self.agents[uri].is_pinned)?;
        Some(list.remove(index))
    }

    /// Least loaded node among `candidates`; ties go to non-leaders, then to
    /// the lower node number.
    fn least_loaded(
        &self,
        candidates: &[NodeId],
        placed: &BTreeMap<NodeId, Vec<AgentUri>>,
    ) -> Option<NodeId> {
        candidates
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .min_by_key(|n| {
                let load = placed.get(&n.node_id).map(Vec::len).unwrap_or(0);
                (load, n.is_leader, n.number)
            })
            .map(|n| n.node_id)
    }

    fn write_back(&mut self, placed: BTreeMap<NodeId, Vec<AgentUri>>) {
        for (node_id, uris) in placed {
            for uri in uris {
                if let Some(agent) = self.agents.get_mut(&uri) {
                    agent.assigned_node = Some(node_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wolverine_events::NodeRegistration;

    fn uri(s: &str) -> AgentUri {
        AgentUri::parse(s).unwrap()
    }

    fn fake_agents(count: usize) -> Vec<AgentUri> {
        (0..count).map(|i| uri(&format!("fake://agent-{i:02}"))).collect()
    }

    fn grid_with_nodes(count: i32, capabilities: &[AgentUri]) -> (AssignmentGrid, Vec<NodeId>) {
        let mut grid = AssignmentGrid::new();
        let mut ids = Vec::new();
        for number in 1..=count {
            let id = NodeId::new();
            let mut node = GridNode::new(id, NodeNumber::new(number).unwrap())
                .with_capabilities(capabilities.iter().cloned());
            if number == 1 {
                node = node.as_leader();
            }
            grid.add_node(node);
            ids.push(id);
        }
        (grid, ids)
    }

    fn counts(grid: &AssignmentGrid, ids: &[NodeId]) -> Vec<usize> {
        let counts = grid.agent_counts("fake");
        ids.iter().map(|id| counts[id]).collect()
    }

    #[test]
    fn test_distribute_ten_agents_over_three_nodes() {
        let agents = fake_agents(10);
        let (mut grid, ids) = grid_with_nodes(3, &agents);
        grid.with_agents(agents);

        grid.distribute_evenly("fake");

        // The single extra agent avoids the leader.
        assert_eq!(counts(&grid, &ids), vec![3, 4, 3]);
        assert_eq!(grid.diff().len(), 10);
    }

    #[test]
    fn test_single_leader_node_takes_everything() {
        let agents = fake_agents(5);
        let (mut grid, ids) = grid_with_nodes(1, &agents);
        grid.with_agents(agents);

        grid.distribute_evenly("fake");

        assert_eq!(counts(&grid, &ids), vec![5]);
    }

    #[test]
    fn test_no_nodes_detaches_everything() {
        let mut grid = AssignmentGrid::new();
        grid.running(uri("fake://one"), NodeId::new());

        grid.distribute_evenly("fake");

        assert_eq!(grid.agent(&uri("fake://one")).unwrap().assigned_node, None);
    }

    #[test]
    fn test_balanced_grid_produces_no_delta() {
        let agents = fake_agents(6);
        let (mut grid, ids) = grid_with_nodes(3, &agents);
        for (i, agent) in agents.into_iter().enumerate() {
            grid.running(agent, ids[i % 3]);
        }

        grid.distribute_evenly("fake");

        assert!(grid.diff().is_empty());
    }

    #[test]
    fn test_new_node_only_receives_moved_agents() {
        let agents = fake_agents(6);
        let (mut grid, ids) = grid_with_nodes(3, &agents);
        for (i, agent) in agents.into_iter().enumerate() {
            grid.running(agent, ids[i % 2]);
        }

        grid.distribute_evenly("fake");

        assert_eq!(counts(&grid, &ids), vec![2, 2, 2]);
        let deltas = grid.diff();
        assert_eq!(deltas.len(), 2);
        assert!(deltas
            .iter()
            .all(|d| matches!(d, AgentDelta::Reassign { to, .. } if *to == ids[2])));
    }

    #[test]
    fn test_other_schemes_are_untouched() {
        let agents = fake_agents(4);
        let (mut grid, ids) = grid_with_nodes(2, &agents);
        grid.with_agents(agents);
        grid.running(uri("other://one"), ids[0]);

        grid.distribute_evenly("fake");

        assert_eq!(grid.agent(&uri("other://one")).unwrap().assigned_node, Some(ids[0]));
        assert_eq!(counts(&grid, &ids), vec![2, 2]);
    }

    #[test]
    fn test_paused_agent_is_detached_and_excluded() {
        let agents = fake_agents(4);
        let (mut grid, ids) = grid_with_nodes(2, &agents);
        for (i, agent) in agents.iter().cloned().enumerate() {
            grid.running(agent, ids[i % 2]);
        }
        let mut restrictions = AgentRestrictions::default();
        restrictions.pause(agents[0].clone());

        grid.apply_restrictions(&restrictions);
        grid.distribute_evenly("fake");

        let paused = grid.agent(&agents[0]).unwrap();
        assert!(paused.is_paused);
        assert_eq!(paused.assigned_node, None);
        assert!(grid.diff().contains(&AgentDelta::Stop {
            agent_uri: agents[0].clone(),
            node_id: ids[0],
        }));
        assert_eq!(counts(&grid, &ids).iter().sum::<usize>(), 3);
    }

    #[test]
    fn test_pin_is_stable_across_passes() {
        let agents = fake_agents(6);
        let (mut grid, ids) = grid_with_nodes(3, &agents);
        grid.with_agents(agents.clone());
        let mut restrictions = AgentRestrictions::default();
        restrictions.pin(agents[5].clone(), NodeNumber::new(3).unwrap());

        for _ in 0..3 {
            grid.apply_restrictions(&restrictions);
            grid.distribute_evenly("fake");
            let pinned = grid.agent(&agents[5]).unwrap();
            assert!(pinned.is_pinned);
            assert_eq!(pinned.assigned_node, Some(ids[2]));
            assert_eq!(counts(&grid, &ids), vec![2, 2, 2]);
        }
    }

    #[test]
    fn test_pin_to_missing_node_is_dropped() {
        let agents = fake_agents(4);
        let (mut grid, ids) = grid_with_nodes(2, &agents);
        grid.with_agents(agents.clone());
        let mut restrictions = AgentRestrictions::default();
        restrictions.pin(agents[0].clone(), NodeNumber::new(9).unwrap());

        grid.apply_restrictions(&restrictions);
        grid.distribute_evenly("fake");

        let agent = grid.agent(&agents[0]).unwrap();
        assert!(!agent.is_pinned);
        assert!(agent.assigned_node.is_some());
        assert_eq!(counts(&grid, &ids), vec![2, 2]);
    }

    #[test]
    fn test_pin_to_unsupporting_node_fails() {
        let (mut grid, _) = grid_with_nodes(1, &[]);
        let err = grid.pin(&uri("fake://one"), 1).unwrap_err();
        assert!(matches!(err, GridError::UnsupportedAgent { node_number: 1, .. }));
    }

    #[test]
    fn test_same_capabilities() {
        let agents = fake_agents(3);
        let (mut grid, _) = grid_with_nodes(2, &agents);
        assert!(grid.all_nodes_have_same_capabilities("fake"));

        grid.add_node(
            GridNode::new(NodeId::new(), NodeNumber::new(3).unwrap())
                .with_capabilities(agents[..1].iter().cloned()),
        );
        assert!(!grid.all_nodes_have_same_capabilities("fake"));
        assert!(grid.all_nodes_have_same_capabilities("other"));
    }

    #[test]
    fn test_blue_green_respects_capabilities() {
        let agents = fake_agents(4);
        let mut grid = AssignmentGrid::new();
        let old = NodeId::new();
        let new = NodeId::new();
        grid.add_node(
            GridNode::new(old, NodeNumber::new(1).unwrap())
                .as_leader()
                .with_capabilities(agents[..2].iter().cloned()),
        );
        grid.add_node(
            GridNode::new(new, NodeNumber::new(2).unwrap())
                .with_capabilities(agents.iter().cloned()),
        );
        grid.with_agents(agents.clone());
        grid.running(agents[3].clone(), old);

        grid.distribute("fake");

        assert_eq!(grid.agent(&agents[2]).unwrap().assigned_node, Some(new));
        assert_eq!(grid.agent(&agents[3]).unwrap().assigned_node, Some(new));
        assert_eq!(grid.agent(&agents[3]).unwrap().candidate_nodes, vec![new]);
        assert_eq!(grid.agent_counts("fake")[&old], 2);
    }

    #[test]
    fn test_find_delta() {
        let agents = fake_agents(4);
        let (mut grid, ids) = grid_with_nodes(2, &agents);
        grid.with_agents(agents.clone());
        grid.distribute_evenly("fake");
        let desired = grid.assignments();

        let mut actual = desired.clone();
        // missing
        actual.remove(&agents[0]);
        // wrong place
        let wrong = if desired[&agents[1]] == ids[0] { ids[1] } else { ids[0] };
        actual.insert(agents[1].clone(), wrong);
        // unknown to the grid
        actual.insert(uri("fake://rogue"), ids[0]);

        let deltas = grid.find_delta(&actual);

        assert_eq!(deltas.len(), 3);
        assert!(deltas.contains(&AgentDelta::Assign {
            agent_uri: agents[0].clone(),
            node_id: desired[&agents[0]],
        }));
        assert!(deltas.contains(&AgentDelta::Reassign {
            agent_uri: agents[1].clone(),
            from: wrong,
            to: desired[&agents[1]],
        }));
        assert!(deltas.contains(&AgentDelta::Stop {
            agent_uri: uri("fake://rogue"),
            node_id: ids[0],
        }));
    }

    #[test]
    fn test_for_tracker_skips_leader_sentinel() {
        let mut tracker = NodeStateTracker::new();
        let node = NodeRegistration::new(NodeId::new(), "memory://one")
            .into_node(NodeNumber::new(1).unwrap());
        let id = node.node_id;
        tracker.add(node);
        tracker.mark_as_leader(&id);
        tracker.agent_started(&id, uri("fake://one"));

        let grid = AssignmentGrid::for_tracker(&tracker);

        assert!(grid.agent(&AgentUri::leader()).is_none());
        assert_eq!(grid.agent(&uri("fake://one")).unwrap().original_node, Some(id));
        assert!(grid.node(&id).unwrap().is_leader);
    }

    #[test]
    fn test_for_tracker_omits_stopped_agents() {
        let mut tracker = NodeStateTracker::new();
        let node = NodeRegistration::new(NodeId::new(), "memory://one")
            .into_node(NodeNumber::new(1).unwrap());
        let id = node.node_id;
        tracker.add(node);
        tracker.agent_started(&id, uri("fake://one"));
        tracker.agent_started(&id, uri("fake://two"));
        tracker.agent_stopped(&uri("fake://two"));

        let grid = AssignmentGrid::for_tracker(&tracker);

        assert!(grid.agent(&uri("fake://one")).is_some());
        assert!(grid.agent(&uri("fake://two")).is_none());
    }

    fn arb_grid() -> impl Strategy<Value = (usize, usize, Vec<Option<usize>>)> {
        (1usize..8, 0usize..60).prop_flat_map(|(nodes, agents)| {
            (
                Just(nodes),
                Just(agents),
                prop::collection::vec(prop::option::of(0usize..nodes), agents),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_distribute_evenly_balances((nodes, agents, placement) in arb_grid()) {
            let uris = fake_agents(agents);
            let (mut grid, ids) = grid_with_nodes(nodes as i32, &uris);
            for (agent, node) in uris.iter().zip(&placement) {
                match node {
                    Some(i) => { grid.running(agent.clone(), ids[*i]); }
                    None => { grid.with_agents([agent.clone()]); }
                }
            }

            grid.distribute_evenly("fake");

            for agent in &uris {
                let assigned = grid.agent(agent).unwrap().assigned_node;
                prop_assert!(assigned.is_some_and(|n| ids.contains(&n)));
            }
            let counts = counts(&grid, &ids);
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = counts.iter().min().copied().unwrap_or(0);
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn prop_blue_green_never_violates_capabilities(
            nodes in 1usize..6,
            masks in prop::collection::vec(0u8..64, 1..6),
            agents in 0usize..20,
        ) {
            let uris = fake_agents(agents);
            let mut grid = AssignmentGrid::new();
            let mut ids = Vec::new();
            for n in 0..nodes {
                let mask = masks[n % masks.len()];
                let caps = uris.iter().enumerate()
                    .filter(|(i, _)| mask & (1 << (i % 6)) != 0)
                    .map(|(_, u)| u.clone());
                let id = NodeId::new();
                grid.add_node(GridNode::new(id, NodeNumber::new(n as i32 + 1).unwrap()).with_capabilities(caps));
                ids.push(id);
            }
            grid.with_agents(uris.clone());

            grid.distribute_evenly_with_blue_green_semantics("fake");

            for agent in &uris {
                let entry = grid.agent(agent).unwrap();
                let supported = ids.iter().any(|id| grid.node(id).unwrap().supports(agent));
                match entry.assigned_node {
                    Some(node) => prop_assert!(grid.node(&node).unwrap().supports(agent)),
                    None => prop_assert!(!supported),
                }
            }
        }
    }
}
