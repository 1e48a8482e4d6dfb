//! Per-node orchestration of leadership, membership and agent placement.
//!
//! Every coordination step is an [`AgentCommand`]. Executing one returns
//! follow-up commands, and [`NodeAgentController::run_commands`] keeps
//! draining them until none remain. Remote dispatch failures are logged and
//! absorbed; the next health check, evaluation or verification pass heals
//! whatever they left behind.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use wolverine_durability::NodeAgentPersistence;
use wolverine_events::{
    AgentRestrictions, ClusterEvent, NodeEvent, NodeEventType, NodeRegistration,
    NodeStateTracker, WolverineNode,
};
use wolverine_id::{AgentUri, NodeId, NodeNumber};
use wolverine_reconcile::{AssignmentGrid, BackoffPolicy};

use crate::commands::{AgentCommand, AgentReply};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::families::{Agent, AgentContext, AgentFamilyRegistry};
use crate::transport::ControlTransport;

/// Upper bound on commands executed by one driver run.
const MAX_COMMANDS_PER_DRIVE: usize = 1_000;

/// How long shutdown waits for a background loop before aborting it.
const LOOP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ControllerState {
    tracker: NodeStateTracker,
    node_number: Option<NodeNumber>,
    last_grid: Option<AssignmentGrid>,
    /// Nodes that announced `Exiting`; their rows may outlive the event.
    departed: BTreeSet<NodeId>,
}

/// The per-node controller.
pub struct NodeAgentController {
    config: ControllerConfig,
    node_id: NodeId,
    control_uri: String,
    description: String,
    store: Arc<dyn NodeAgentPersistence>,
    transport: Arc<dyn ControlTransport>,
    families: AgentFamilyRegistry,

    state: Mutex<ControllerState>,
    agents: tokio::sync::Mutex<BTreeMap<AgentUri, Arc<dyn Agent>>>,

    evaluation_tx: mpsc::UnboundedSender<()>,
    evaluation_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    evaluations_run: AtomicU64,

    exiting: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeAgentController {
    pub fn new(
        config: ControllerConfig,
        node_id: NodeId,
        control_uri: impl Into<String>,
        store: Arc<dyn NodeAgentPersistence>,
        transport: Arc<dyn ControlTransport>,
        families: AgentFamilyRegistry,
    ) -> Self {
        let (evaluation_tx, evaluation_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            node_id,
            control_uri: control_uri.into(),
            description: String::new(),
            store,
            transport,
            families,
            state: Mutex::new(ControllerState::default()),
            agents: tokio::sync::Mutex::new(BTreeMap::new()),
            evaluation_tx,
            evaluation_rx: Mutex::new(Some(evaluation_rx)),
            evaluations_run: AtomicU64::new(0),
            exiting: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn control_uri(&self) -> &str {
        &self.control_uri
    }

    /// Assigned node number once joined.
    pub fn node_number(&self) -> Option<NodeNumber> {
        self.state().node_number
    }

    pub fn is_leader(&self) -> bool {
        self.state().tracker.leader_id() == Some(self.node_id)
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state().tracker.leader_id()
    }

    /// Snapshot of this node's view of the cluster.
    pub fn tracker(&self) -> NodeStateTracker {
        self.state().tracker.clone()
    }

    /// Evaluation passes executed so far.
    pub fn evaluations_run(&self) -> u64 {
        self.evaluations_run.load(Ordering::SeqCst)
    }

    /// Agents running on this node, including the leadership sentinel.
    pub async fn running_agents(&self) -> BTreeSet<AgentUri> {
        let mut running: BTreeSet<AgentUri> = self.agents.lock().await.keys().cloned().collect();
        if self.is_leader() {
            running.insert(AgentUri::leader());
        }
        running
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Joins the cluster and starts the health check, verification and
    /// debounced evaluation loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), ControllerError> {
        self.join().await?;

        let mut tasks = vec![
            tokio::spawn({
                let controller = Arc::clone(self);
                let shutdown = self.shutdown.subscribe();
                async move { controller.run_health_checks(shutdown).await }
            }),
            tokio::spawn({
                let controller = Arc::clone(self);
                let shutdown = self.shutdown.subscribe();
                async move { controller.run_verification(shutdown).await }
            }),
        ];

        let requests = self
            .evaluation_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(requests) = requests {
            tasks.push(tokio::spawn({
                let controller = Arc::clone(self);
                let shutdown = self.shutdown.subscribe();
                async move { controller.run_evaluations(requests, shutdown).await }
            }));
        }

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    /// Persists this node, announces it to every peer and makes sure some
    /// node bids for leadership when none is known.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn join(&self) -> Result<(), ControllerError> {
        let registration = self.registration().await?;
        let node = self.store.persist_node(&registration).await?;
        info!(
            node_number = %node.assigned_node_number,
            control_uri = %self.control_uri,
            "Joined cluster"
        );

        self.reload().await?;
        self.state().node_number = Some(node.assigned_node_number);

        let commands = self.announce(node).await;
        self.run_commands(commands).await;
        Ok(())
    }

    /// Leaves the cluster gracefully. Stops local agents, tells the leader
    /// (or everyone when leading), then deletes this node's row, releasing
    /// the envelopes it owned.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> Result<(), ControllerError> {
        info!("Stopping node agent controller");
        self.exiting.store(true, Ordering::SeqCst);
        self.stop_loops().await;

        let running: Vec<AgentUri> = self.agents.lock().await.keys().cloned().collect();
        for uri in &running {
            self.stop_agent(uri).await;
        }

        let (node, targets) = {
            let state = self.state();
            let node = state.tracker.node(&self.node_id).cloned();
            let targets: Vec<String> = match state.tracker.leader() {
                Some(leader) if leader.node_id != self.node_id => vec![leader.control_uri.clone()],
                _ => state
                    .tracker
                    .other_nodes(&self.node_id)
                    .into_iter()
                    .map(|n| n.control_uri.clone())
                    .collect(),
            };
            (node, targets)
        };
        if let Some(node) = node {
            self.broadcast(&targets, ClusterEvent::Node(NodeEvent::exiting(node)))
                .await;
        }
        let deleted = self.store.delete_node(&self.node_id).await;

        {
            let mut state = self.state();
            state.tracker.clear();
            state.node_number = None;
            state.last_grid = None;
            state.departed.clear();
        }
        if let Err(e) = deleted {
            error!(error = %e, "Failed to delete node row; the leader will eject it once stale");
            return Err(e.into());
        }
        info!("Node agent controller stopped");
        Ok(())
    }

    /// Stops loops and local agents without telling anyone or touching the
    /// store, as a crashed process would.
    pub async fn halt(&self) {
        warn!(node_id = %self.node_id, "Halting node agent controller");
        self.exiting.store(true, Ordering::SeqCst);
        self.stop_loops().await;

        let agents = std::mem::take(&mut *self.agents.lock().await);
        for agent in agents.into_values() {
            if let Err(e) = agent.stop().await {
                debug!(agent_uri = %agent.uri(), error = %e, "agent failed to stop during halt");
            }
        }
    }

    async fn stop_loops(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for mut task in tasks {
            if tokio::time::timeout(LOOP_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!(node_id = %self.node_id, "Background loop did not stop in time; aborting");
                task.abort();
            }
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Runs one health check through the driver loop.
    pub async fn health_check(&self) {
        self.run_commands(vec![AgentCommand::CheckHealth]).await;
    }

    /// Runs one evaluation pass through the driver loop.
    pub async fn evaluate_assignments(&self) {
        self.run_commands(vec![AgentCommand::EvaluateAssignments]).await;
    }

    /// Runs one verification pass through the driver loop.
    pub async fn verify_assignments(&self) {
        self.run_commands(vec![AgentCommand::VerifyAssignments]).await;
    }

    /// Asks for an evaluation. Requests arriving within the debounce window
    /// collapse into one pass.
    pub fn request_evaluation(&self) {
        let _ = self.evaluation_tx.send(());
    }

    /// Answers a command sent by a peer.
    #[instrument(skip(self, command), fields(node_id = %self.node_id, command = command.name()))]
    pub async fn handle(&self, command: AgentCommand) -> AgentReply {
        if self.exiting.load(Ordering::SeqCst) {
            return AgentReply::Failed {
                reason: "node is leaving the cluster".to_string(),
            };
        }

        match command {
            AgentCommand::QueryRunningAgents => match self.agent_context() {
                Ok(_) => self.running_reply().await,
                Err(e) => AgentReply::Failed {
                    reason: e.to_string(),
                },
            },
            AgentCommand::StartAgent { agent_uri } => match self.start_agent(&agent_uri).await {
                Ok(()) => self.running_reply().await,
                Err(e) => AgentReply::Failed {
                    reason: e.to_string(),
                },
            },
            AgentCommand::StartAgents { agent_uris } => {
                self.start_agents(&agent_uris).await;
                self.running_reply().await
            }
            command => match self.execute(command).await {
                Ok(follow_ups) => {
                    self.run_commands(follow_ups).await;
                    AgentReply::Accepted
                }
                Err(e) => {
                    warn!(error = %e, "Remote command failed");
                    AgentReply::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        }
    }

    /// Executes commands and their follow-ups until none remain. Failures
    /// are logged and yield no follow-ups. Returns the number executed.
    pub async fn run_commands(&self, commands: Vec<AgentCommand>) -> usize {
        let mut queue: VecDeque<AgentCommand> = commands.into();
        let mut executed = 0;

        while let Some(command) = queue.pop_front() {
            if executed >= MAX_COMMANDS_PER_DRIVE {
                error!(
                    node_id = %self.node_id,
                    dropped = queue.len() + 1,
                    "Command driver limit reached"
                );
                break;
            }
            executed += 1;

            let name = command.name();
            match self.execute(command).await {
                Ok(follow_ups) => queue.extend(follow_ups),
                Err(e) => warn!(node_id = %self.node_id, command = name, error = %e, "Command failed"),
            }
        }
        executed
    }

    /// Executes a single command and returns its follow-ups.
    #[instrument(skip(self, command), fields(node_id = %self.node_id, command = command.name()))]
    pub async fn execute(&self, command: AgentCommand) -> Result<Vec<AgentCommand>, ControllerError> {
        match command {
            AgentCommand::StartAgent { agent_uri } => {
                self.start_agent(&agent_uri).await?;
                Ok(Vec::new())
            }
            AgentCommand::StartAgents { agent_uris } => {
                self.start_agents(&agent_uris).await;
                Ok(Vec::new())
            }
            AgentCommand::StopAgent { agent_uri } => {
                self.stop_agent(&agent_uri).await;
                Ok(Vec::new())
            }
            AgentCommand::StopAgents { agent_uris } => {
                for uri in &agent_uris {
                    self.stop_agent(uri).await;
                }
                Ok(Vec::new())
            }
            AgentCommand::AssignAgent { agent_uri, node_id } => {
                self.assign(node_id, vec![agent_uri]).await;
                Ok(Vec::new())
            }
            AgentCommand::AssignAgents { node_id, agent_uris } => {
                self.assign(node_id, agent_uris).await;
                Ok(Vec::new())
            }
            AgentCommand::ReassignAgent {
                agent_uri,
                from,
                to,
            } => {
                if self.stop_on(from, vec![agent_uri.clone()]).await {
                    Ok(vec![AgentCommand::AssignAgent {
                        agent_uri,
                        node_id: to,
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
            AgentCommand::StopRemoteAgent { agent_uri, node_id } => {
                self.stop_on(node_id, vec![agent_uri]).await;
                Ok(Vec::new())
            }
            AgentCommand::StopRemoteAgents { node_id, agent_uris } => {
                self.stop_on(node_id, agent_uris).await;
                Ok(Vec::new())
            }
            AgentCommand::EvaluateAssignments => self.evaluate().await,
            AgentCommand::VerifyAssignments => self.verify().await,
            AgentCommand::TryAssumeLeadership { current_leader } => {
                self.try_assume_leadership(current_leader).await
            }
            AgentCommand::CheckHealth => self.check_health().await,
            AgentCommand::QueryRunningAgents => Ok(Vec::new()),
            AgentCommand::ClusterEvent { event } => self.apply_event(event).await,
        }
    }

    // =========================================================================
    // Leadership
    // =========================================================================

    async fn try_assume_leadership(
        &self,
        current_leader: Option<NodeId>,
    ) -> Result<Vec<AgentCommand>, ControllerError> {
        if self.is_leader() {
            return Ok(Vec::new());
        }
        self.agent_context()?;

        let backoff = BackoffPolicy::default();
        for attempt in 0..self.config.max_leadership_attempts {
            match self.store.mark_as_leader(current_leader, self.node_id).await? {
                Some(winner) if winner == self.node_id => return self.assume_leadership().await,
                Some(winner) => {
                    info!(node_id = %self.node_id, leader = %winner, "Another node holds leadership");
                    self.record_leader(winner).await?;
                    return Ok(Vec::new());
                }
                None => {
                    debug!(node_id = %self.node_id, attempt, "Leadership lock contended");
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
            }
        }

        warn!(
            node_id = %self.node_id,
            attempts = self.config.max_leadership_attempts,
            "Gave up bidding for leadership"
        );
        Ok(Vec::new())
    }

    async fn assume_leadership(&self) -> Result<Vec<AgentCommand>, ControllerError> {
        // Placement other nodes persisted is fresher than what this node
        // heard as a follower.
        self.reload().await?;
        let (node, peers) = {
            let mut state = self.state();
            state.tracker.mark_as_leader(&self.node_id);
            let node = state.tracker.node(&self.node_id).cloned();
            (node, peer_uris(&state.tracker, &self.node_id))
        };
        let node = node.ok_or(ControllerError::NotJoined)?;

        info!(node_id = %self.node_id, node_number = %node.assigned_node_number, "Assumed leadership");
        self.broadcast(&peers, ClusterEvent::Node(NodeEvent::leadership_assumed(node)))
            .await;
        Ok(vec![AgentCommand::EvaluateAssignments])
    }

    async fn record_leader(&self, leader: NodeId) -> Result<(), ControllerError> {
        let known = self.state().tracker.contains(&leader);
        if !known {
            self.reload().await?;
        }
        self.state().tracker.mark_as_leader(&leader);
        Ok(())
    }

    /// Asks the lowest numbered live node to bid for leadership.
    async fn nominate(&self, current_leader: Option<NodeId>, excluded: &[NodeId]) -> Vec<AgentCommand> {
        let candidate = {
            let state = self.state();
            state
                .tracker
                .nodes()
                .into_iter()
                .find(|n| !excluded.contains(&n.node_id))
                .map(|n| (n.node_id, n.control_uri.clone()))
        };
        let command = AgentCommand::TryAssumeLeadership { current_leader };

        match candidate {
            Some((candidate, control_uri)) if candidate != self.node_id => {
                info!(node_id = %self.node_id, candidate = %candidate, "Nominating leader");
                self.send(&control_uri, command).await;
                Vec::new()
            }
            _ => vec![command],
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    async fn check_health(&self) -> Result<Vec<AgentCommand>, ControllerError> {
        let now = Utc::now();
        if !self.store.mark_health_check(&self.node_id, now).await? {
            warn!(node_id = %self.node_id, "Node row is missing; registering again");
            return self.reregister().await;
        }

        let nodes = self.store.load_all_nodes().await?;
        let store_leader = self.store.current_leader().await?;
        let timeout = self.config.stale_timeout();
        let stale: Vec<NodeId> = nodes
            .iter()
            .filter(|n| n.node_id != self.node_id && n.is_stale(now, timeout))
            .map(|n| n.node_id)
            .collect();

        {
            let mut state = self.state();
            merge_membership(&mut state, &nodes);
            state.tracker.update_health_check(&self.node_id, now);
            if state.tracker.leader_id().is_none() {
                if let Some(leader) = store_leader {
                    state.tracker.mark_as_leader(&leader);
                }
            }
        }

        if self.is_leader() {
            if stale.is_empty() {
                return Ok(Vec::new());
            }
            for node_id in &stale {
                warn!(node_id = %self.node_id, stale_node = %node_id, "Ejecting stale node");
                if let Err(e) = self.store.delete_node(node_id).await {
                    error!(stale_node = %node_id, error = %e, "Failed to delete stale node");
                    continue;
                }
                self.state().tracker.remove(node_id);
            }
            return Ok(vec![AgentCommand::EvaluateAssignments]);
        }

        let leader = self.leader_id();
        let leader_alive = leader.is_some_and(|id| {
            !stale.contains(&id) && nodes.iter().any(|n| n.node_id == id)
        });
        if leader_alive {
            return Ok(Vec::new());
        }

        info!(node_id = %self.node_id, leader = ?leader, "Leader is missing or stale");
        Ok(self.nominate(leader, &stale).await)
    }

    async fn reregister(&self) -> Result<Vec<AgentCommand>, ControllerError> {
        let registration = self.registration().await?;
        let node = self.store.persist_node(&registration).await?;
        info!(
            node_id = %self.node_id,
            node_number = %node.assigned_node_number,
            "Registered again"
        );

        let running: Vec<AgentUri> = self.agents.lock().await.keys().cloned().collect();
        {
            let mut state = self.state();
            state.node_number = Some(node.assigned_node_number);
            state.tracker.add(node.clone());
            for uri in &running {
                state.tracker.agent_started(&self.node_id, uri.clone());
            }
        }
        for uri in &running {
            if let Err(e) = self.store.add_assignment(&self.node_id, uri).await {
                warn!(agent_uri = %uri, error = %e, "Failed to persist agent assignment");
            }
        }

        Ok(self.announce(node).await)
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    async fn evaluate(&self) -> Result<Vec<AgentCommand>, ControllerError> {
        if !self.is_leader() {
            debug!(node_id = %self.node_id, "Skipping evaluation on a non-leader");
            return Ok(Vec::new());
        }
        self.evaluations_run.fetch_add(1, Ordering::SeqCst);

        let mut grid = AssignmentGrid::for_tracker(&self.state().tracker);
        for family in self.families.all() {
            match family.all_known_agents().await {
                Ok(agents) => {
                    grid.with_agents(agents);
                }
                Err(e) => warn!(scheme = family.scheme(), error = %e, "Failed to list known agents"),
            }
        }

        let restrictions = match self.store.load_restrictions().await {
            Ok(restrictions) => restrictions,
            Err(e) => {
                warn!(error = %e, "Failed to load agent restrictions");
                AgentRestrictions::default()
            }
        };
        grid.apply_restrictions(&restrictions);
        for family in self.families.all() {
            family.evaluate_assignments(&mut grid);
        }

        let commands = AgentCommand::from_deltas(grid.diff());
        info!(
            node_id = %self.node_id,
            nodes = grid.nodes().len(),
            agents = grid.agents().count(),
            commands = commands.len(),
            "Evaluated agent assignments"
        );
        self.state().last_grid = Some(grid);
        Ok(commands)
    }

    /// Asks every node what it runs and corrects drift from the last grid.
    async fn verify(&self) -> Result<Vec<AgentCommand>, ControllerError> {
        if !self.is_leader() {
            return Ok(Vec::new());
        }

        let (peers, grid) = {
            let state = self.state();
            let peers: Vec<(NodeId, String, BTreeSet<AgentUri>)> = state
                .tracker
                .other_nodes(&self.node_id)
                .into_iter()
                .map(|n| (n.node_id, n.control_uri.clone(), n.active_agents.clone()))
                .collect();
            (peers, state.last_grid.clone())
        };

        let Some(grid) = grid else {
            return Ok(vec![AgentCommand::EvaluateAssignments]);
        };
        let topology_changed = grid.nodes().len() != peers.len() + 1
            || peers.iter().any(|(id, _, _)| grid.node(id).is_none());
        if topology_changed {
            debug!(node_id = %self.node_id, "Membership changed since the last evaluation");
            return Ok(vec![AgentCommand::EvaluateAssignments]);
        }

        let mut actual: BTreeMap<AgentUri, NodeId> = self
            .running_agents()
            .await
            .into_iter()
            .map(|uri| (uri, self.node_id))
            .collect();
        for (node_id, control_uri, last_known) in peers {
            let agents = match self.send(&control_uri, AgentCommand::QueryRunningAgents).await {
                Some(AgentReply::Running { agents, .. }) => agents,
                // Unreachable peers keep their last known placement.
                _ => last_known,
            };
            for uri in agents {
                actual.insert(uri, node_id);
            }
        }
        actual.retain(|uri, _| !uri.is_leader());

        self.state()
            .tracker
            .publish(&ClusterEvent::AgentAssignmentsChanged {
                assignments: actual.clone(),
            });

        let deltas = grid.find_delta(&actual);
        if !deltas.is_empty() {
            info!(node_id = %self.node_id, corrections = deltas.len(), "Verification found drift");
        }
        Ok(AgentCommand::from_deltas(deltas))
    }

    /// Starts agents on `node_id`, locally or through its control URI.
    async fn assign(&self, node_id: NodeId, agent_uris: Vec<AgentUri>) {
        if node_id == self.node_id {
            self.start_agents(&agent_uris).await;
            return;
        }

        let Some(control_uri) = self.control_uri_of(&node_id) else {
            warn!(node_id = %node_id, agents = agent_uris.len(), "Cannot assign agents to an unknown node");
            return;
        };
        let command = match agent_uris.as_slice() {
            [agent_uri] => AgentCommand::StartAgent {
                agent_uri: agent_uri.clone(),
            },
            _ => AgentCommand::StartAgents {
                agent_uris: agent_uris.clone(),
            },
        };

        if let Some(AgentReply::Running { agents, .. }) = self.send(&control_uri, command).await {
            let mut state = self.state();
            for uri in agent_uris.iter().filter(|uri| agents.contains(*uri)) {
                state.tracker.agent_started(&node_id, uri.clone());
            }
        }
    }

    /// Stops agents on `node_id`. Returns true once they are known stopped.
    async fn stop_on(&self, node_id: NodeId, agent_uris: Vec<AgentUri>) -> bool {
        if node_id == self.node_id {
            for uri in &agent_uris {
                self.stop_agent(uri).await;
            }
            return true;
        }

        let Some(control_uri) = self.control_uri_of(&node_id) else {
            // The node is gone, and its agents with it.
            let mut state = self.state();
            for uri in &agent_uris {
                state.tracker.agent_stopped(uri);
            }
            return true;
        };
        let command = match agent_uris.as_slice() {
            [agent_uri] => AgentCommand::StopAgent {
                agent_uri: agent_uri.clone(),
            },
            _ => AgentCommand::StopAgents {
                agent_uris: agent_uris.clone(),
            },
        };

        match self.send(&control_uri, command).await {
            Some(AgentReply::Accepted | AgentReply::Running { .. }) => {
                let mut state = self.state();
                for uri in &agent_uris {
                    state.tracker.agent_stopped(uri);
                }
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Local agents
    // =========================================================================

    /// Starts an agent on this node. Starting a running agent is a no-op.
    pub async fn start_agent(&self, uri: &AgentUri) -> Result<(), ControllerError> {
        let ctx = self.agent_context()?;
        {
            let mut agents = self.agents.lock().await;
            if agents.contains_key(uri) {
                return Ok(());
            }
            let family = self.families.for_agent(uri)?;
            let agent = family.build_agent(uri).await?;
            agent.start(&ctx).await?;
            agents.insert(uri.clone(), agent);
        }

        self.state().tracker.agent_started(&self.node_id, uri.clone());
        if let Err(e) = self.store.add_assignment(&self.node_id, uri).await {
            warn!(agent_uri = %uri, error = %e, "Failed to persist agent assignment");
        }
        info!(node_id = %self.node_id, agent_uri = %uri, "Started agent");
        Ok(())
    }

    async fn start_agents(&self, uris: &[AgentUri]) {
        for uri in uris {
            if let Err(e) = self.start_agent(uri).await {
                warn!(node_id = %self.node_id, agent_uri = %uri, error = %e, "Failed to start agent");
            }
        }
    }

    /// Stops an agent on this node. Stopping an unknown agent is a no-op.
    pub async fn stop_agent(&self, uri: &AgentUri) {
        let agent = self.agents.lock().await.remove(uri);
        let Some(agent) = agent else {
            return;
        };
        if let Err(e) = agent.stop().await {
            warn!(agent_uri = %uri, error = %e, "Agent failed to stop cleanly");
        }

        self.state().tracker.agent_stopped(uri);
        if let Err(e) = self.store.remove_assignment(&self.node_id, uri).await {
            warn!(agent_uri = %uri, error = %e, "Failed to remove agent assignment");
        }
        info!(node_id = %self.node_id, agent_uri = %uri, "Stopped agent");
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn apply_event(&self, event: ClusterEvent) -> Result<Vec<AgentCommand>, ControllerError> {
        let leader_before = self.leader_id();
        let ClusterEvent::Node(NodeEvent { node, kind }) = &event else {
            self.state().tracker.publish(&event);
            return Ok(Vec::new());
        };
        {
            let mut state = self.state();
            state.tracker.publish(&event);
            match kind {
                NodeEventType::Exiting => {
                    state.departed.insert(node.node_id);
                }
                NodeEventType::Started => {
                    state.departed.remove(&node.node_id);
                }
                NodeEventType::LeadershipAssumed => {}
            }
        }

        match kind {
            NodeEventType::Started | NodeEventType::Exiting if self.is_leader() => {
                self.request_evaluation();
                Ok(Vec::new())
            }
            NodeEventType::Exiting if leader_before == Some(node.node_id) => {
                info!(node_id = %self.node_id, leader = %node.node_id, "Leader left the cluster");
                // Its row still names it leader until it finishes exiting.
                Ok(self.nominate(Some(node.node_id), &[node.node_id]).await)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Broadcasts `Started` and returns leadership commands when no leader
    /// is known.
    async fn announce(&self, node: WolverineNode) -> Vec<AgentCommand> {
        let (peers, leader) = {
            let state = self.state();
            (peer_uris(&state.tracker, &self.node_id), state.tracker.leader_id())
        };
        self.broadcast(&peers, ClusterEvent::Node(NodeEvent::started(node)))
            .await;

        match leader {
            Some(_) => Vec::new(),
            None if peers.is_empty() => vec![AgentCommand::TryAssumeLeadership {
                current_leader: None,
            }],
            None => self.nominate(None, &[]).await,
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    #[instrument(skip(self, shutdown), fields(node_id = %self.node_id))]
    async fn run_health_checks(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.health_check_interval.as_millis() as u64,
            "Starting health check loop"
        );

        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.health_check().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health check loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, shutdown), fields(node_id = %self.node_id))]
    async fn run_verification(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.verify_interval.as_millis() as u64,
            "Starting verification loop"
        );

        let mut interval = tokio::time::interval(self.config.verify_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.is_leader() {
                        self.verify_assignments().await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Verification loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self, requests, shutdown), fields(node_id = %self.node_id))]
    async fn run_evaluations(
        &self,
        mut requests: mpsc::UnboundedReceiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            debounce_ms = self.config.evaluation_debounce.as_millis() as u64,
            "Starting evaluation loop"
        );

        loop {
            tokio::select! {
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                    tokio::time::sleep(self.config.evaluation_debounce).await;
                    let mut coalesced = 1;
                    while requests.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    debug!(coalesced, "Running debounced evaluation");
                    self.evaluate_assignments().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Evaluation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn agent_context(&self) -> Result<AgentContext, ControllerError> {
        let node_number = self.state().node_number.ok_or(ControllerError::NotJoined)?;
        Ok(AgentContext {
            node_id: self.node_id,
            node_number,
        })
    }

    fn control_uri_of(&self, node_id: &NodeId) -> Option<String> {
        self.state()
            .tracker
            .node(node_id)
            .map(|n| n.control_uri.clone())
    }

    async fn registration(&self) -> Result<NodeRegistration, ControllerError> {
        let capabilities = self.families.supported_agents().await?;
        Ok(NodeRegistration::new(self.node_id, self.control_uri.clone())
            .with_description(self.description.clone())
            .with_capabilities(capabilities))
    }

    async fn running_reply(&self) -> AgentReply {
        AgentReply::Running {
            node_id: self.node_id,
            agents: self.running_agents().await,
        }
    }

    /// Replaces the tracker with the store's view of the cluster.
    async fn reload(&self) -> Result<(), ControllerError> {
        let nodes = self.store.load_all_nodes().await?;
        let leader = self.store.current_leader().await?;

        let mut state = self.state();
        let ControllerState {
            tracker, departed, ..
        } = &mut *state;
        tracker.clear();
        for node in nodes.into_iter().filter(|n| !departed.contains(&n.node_id)) {
            tracker.add(node);
        }
        if let Some(leader) = leader {
            state.tracker.mark_as_leader(&leader);
        }
        Ok(())
    }

    async fn broadcast(&self, control_uris: &[String], event: ClusterEvent) {
        for control_uri in control_uris {
            self.send(
                control_uri,
                AgentCommand::ClusterEvent {
                    event: event.clone(),
                },
            )
            .await;
        }
    }

    /// Invokes a command on a peer. Failures are logged and absorbed.
    async fn send(&self, control_uri: &str, command: AgentCommand) -> Option<AgentReply> {
        let name = command.name();
        match self.transport.invoke(control_uri, command).await {
            Ok(AgentReply::Failed { reason }) => {
                warn!(node_id = %self.node_id, control_uri, command = name, reason = %reason, "Peer failed command");
                None
            }
            Ok(reply) => Some(reply),
            Err(e) if e.is_transient() => {
                warn!(node_id = %self.node_id, control_uri, command = name, error = %e, "Peer unreachable");
                None
            }
            Err(e) => {
                error!(node_id = %self.node_id, control_uri, command = name, error = %e, "Command dispatch failed");
                None
            }
        }
    }
}

fn peer_uris(tracker: &NodeStateTracker, self_id: &NodeId) -> Vec<String> {
    tracker
        .other_nodes(self_id)
        .into_iter()
        .map(|n| n.control_uri.clone())
        .collect()
}

/// Folds the store's node list into the tracker: adds nodes we never heard
/// of, refreshes heartbeats and drops nodes the store no longer has.
fn merge_membership(state: &mut ControllerState, nodes: &[WolverineNode]) {
    let known: BTreeSet<NodeId> = nodes.iter().map(|n| n.node_id).collect();
    state.departed.retain(|id| known.contains(id));
    let ControllerState {
        tracker, departed, ..
    } = state;
    let nodes = nodes.iter().filter(|n| !departed.contains(&n.node_id));
    let gone: Vec<NodeId> = tracker
        .nodes()
        .into_iter()
        .map(|n| n.node_id)
        .filter(|id| !known.contains(id))
        .collect();
    for node_id in gone {
        tracker.remove(&node_id);
    }

    for node in nodes {
        if tracker.contains(&node.node_id) {
            tracker.update_health_check(&node.node_id, node.last_health_check);
        } else {
            tracker.add(node.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::families::fakes::FakeFamily;
    use crate::transport::InMemoryControlTransport;
    use async_trait::async_trait;
    use chrono::DateTime;
    use wolverine_durability::{InMemoryMessageStore, StoreError};

    struct Cluster {
        store: InMemoryMessageStore,
        transport: Arc<InMemoryControlTransport>,
        family: Arc<FakeFamily>,
    }

    impl Cluster {
        fn new(agents: usize) -> Self {
            Self {
                store: InMemoryMessageStore::new("master"),
                transport: Arc::new(InMemoryControlTransport::new(Duration::from_secs(5))),
                family: Arc::new(FakeFamily::with_agents(agents)),
            }
        }

        fn node(&self, name: &str) -> Arc<NodeAgentController> {
            let controller = Arc::new(NodeAgentController::new(
                ControllerConfig::default(),
                NodeId::new(),
                format!("memory://{name}"),
                Arc::new(self.store.connect()),
                self.transport.clone(),
                AgentFamilyRegistry::new().register(self.family.clone()),
            ));
            self.transport.register(&controller);
            controller
        }
    }

    fn uri(s: &str) -> AgentUri {
        AgentUri::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_single_node_leads_and_runs_everything() {
        let cluster = Cluster::new(3);
        let node = cluster.node("one");

        node.join().await.unwrap();

        assert!(node.is_leader());
        let running = node.running_agents().await;
        assert_eq!(running.len(), 4);
        assert!(running.contains(&AgentUri::leader()));
        assert_eq!(cluster.store.current_leader().await.unwrap(), Some(node.node_id()));
    }

    #[tokio::test]
    async fn test_evaluation_does_not_restart_unlisted_agent() {
        let cluster = Cluster::new(3);
        let node = cluster.node("one");
        node.join().await.unwrap();
        let retired = uri("fake://3");

        cluster.family.set_known(2);
        node.stop_agent(&retired).await;
        node.evaluate_assignments().await;

        let running = node.running_agents().await;
        assert!(!running.contains(&retired));
        assert!(running.contains(&uri("fake://1")));
        assert!(running.contains(&uri("fake://2")));
        assert_eq!(node.tracker().owner_of(&retired), None);
    }

    #[tokio::test]
    async fn test_second_node_learns_leader() {
        let cluster = Cluster::new(0);
        let first = cluster.node("one");
        let second = cluster.node("two");

        first.join().await.unwrap();
        second.join().await.unwrap();

        assert_eq!(second.leader_id(), Some(first.node_id()));
        assert!(first.tracker().contains(&second.node_id()));
        assert!(!second.is_leader());
    }

    #[tokio::test]
    async fn test_evaluation_spreads_agents() {
        let cluster = Cluster::new(4);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();

        first.evaluate_assignments().await;

        let on_first = first.running_agents().await.len() - 1;
        let on_second = second.running_agents().await.len();
        assert_eq!((on_first, on_second), (2, 2));
        assert_eq!(first.tracker().assignments().len(), 4);
    }

    #[tokio::test]
    async fn test_start_unknown_scheme_is_invalid() {
        let cluster = Cluster::new(0);
        let node = cluster.node("one");
        node.join().await.unwrap();

        let err = node.start_agent(&uri("nope://1")).await.unwrap_err();

        assert!(matches!(err, ControllerError::InvalidAgent(_)));
    }

    #[tokio::test]
    async fn test_failed_start_is_not_recorded() {
        let cluster = Cluster::new(2);
        cluster.family.fail_to_start(&uri("fake://2"));
        let node = cluster.node("one");

        node.join().await.unwrap();

        let running = node.running_agents().await;
        assert!(running.contains(&uri("fake://1")));
        assert!(!running.contains(&uri("fake://2")));
        assert_eq!(node.tracker().owner_of(&uri("fake://2")), None);
    }

    #[tokio::test]
    async fn test_reassign_moves_agent_between_nodes() {
        let cluster = Cluster::new(1);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();
        let agent = uri("fake://1");
        assert!(first.running_agents().await.contains(&agent));

        first
            .run_commands(vec![AgentCommand::ReassignAgent {
                agent_uri: agent.clone(),
                from: first.node_id(),
                to: second.node_id(),
            }])
            .await;

        assert!(!first.running_agents().await.contains(&agent));
        assert!(second.running_agents().await.contains(&agent));
        assert_eq!(first.tracker().owner_of(&agent), Some(second.node_id()));
    }

    #[tokio::test]
    async fn test_reassign_keeps_agent_when_stop_fails() {
        let cluster = Cluster::new(0);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();
        let agent = uri("fake://1");
        cluster.family.set_known(1);
        second.start_agent(&agent).await.unwrap();
        cluster.transport.unregister(second.control_uri());

        let executed = first
            .run_commands(vec![AgentCommand::ReassignAgent {
                agent_uri: agent.clone(),
                from: second.node_id(),
                to: first.node_id(),
            }])
            .await;

        assert_eq!(executed, 1);
        assert!(!first.running_agents().await.contains(&agent));
    }

    #[tokio::test]
    async fn test_verify_restarts_missing_agent() {
        let cluster = Cluster::new(2);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();
        first.evaluate_assignments().await;
        let lost = second.running_agents().await.into_iter().next().unwrap();

        // A stop the leader never heard about.
        second.stop_agent(&lost).await;
        first.verify_assignments().await;

        assert!(second.running_agents().await.contains(&lost));
    }

    #[tokio::test]
    async fn test_verify_stops_unknown_agent() {
        let cluster = Cluster::new(1);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();
        first.evaluate_assignments().await;

        cluster.family.set_known(2);
        second.start_agent(&uri("fake://2")).await.unwrap();
        cluster.family.set_known(1);
        first.verify_assignments().await;

        assert!(!second.running_agents().await.contains(&uri("fake://2")));
    }

    #[tokio::test]
    async fn test_leader_ejects_stale_node() {
        let cluster = Cluster::new(4);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();
        first.evaluate_assignments().await;

        second.halt().await;
        cluster.transport.unregister(second.control_uri());
        cluster
            .store
            .mark_health_check(&second.node_id(), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        first.health_check().await;

        assert!(!first.tracker().contains(&second.node_id()));
        assert_eq!(first.running_agents().await.len(), 5);
        assert_eq!(cluster.store.load_all_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_follower_nominates_when_leader_stale() {
        let cluster = Cluster::new(0);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();

        first.halt().await;
        cluster.transport.unregister(first.control_uri());
        cluster
            .store
            .mark_health_check(&first.node_id(), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        second.health_check().await;

        assert!(second.is_leader());
        assert_eq!(cluster.store.current_leader().await.unwrap(), Some(second.node_id()));
    }

    #[tokio::test]
    async fn test_health_check_registers_missing_row() {
        let cluster = Cluster::new(0);
        let node = cluster.node("one");
        node.join().await.unwrap();
        let first_number = node.node_number().unwrap();

        cluster.store.delete_node(&node.node_id()).await.unwrap();
        node.health_check().await;

        let number = node.node_number().unwrap();
        assert!(number.value() > first_number.value());
        assert!(cluster.store.load_node(&node.node_id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_graceful_stop_hands_over_leadership() {
        let cluster = Cluster::new(2);
        let first = cluster.node("one");
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();

        first.stop().await.unwrap();
        cluster.transport.unregister(first.control_uri());

        assert!(second.is_leader());
        assert!(cluster.store.load_node(&first.node_id()).await.unwrap().is_none());
        second.evaluate_assignments().await;
        assert_eq!(second.running_agents().await.len(), 3);
    }

    /// Node persistence that refuses to delete node rows.
    struct UndeletableNodes(InMemoryMessageStore);

    #[async_trait]
    impl NodeAgentPersistence for UndeletableNodes {
        async fn persist_node(&self, registration: &NodeRegistration) -> Result<WolverineNode, StoreError> {
            self.0.persist_node(registration).await
        }

        async fn delete_node(&self, node_id: &NodeId) -> Result<(), StoreError> {
            Err(StoreError::NodeNotFound(*node_id))
        }

        async fn load_all_nodes(&self) -> Result<Vec<WolverineNode>, StoreError> {
            self.0.load_all_nodes().await
        }

        async fn load_node(&self, node_id: &NodeId) -> Result<Option<WolverineNode>, StoreError> {
            self.0.load_node(node_id).await
        }

        async fn mark_health_check(&self, node_id: &NodeId, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.0.mark_health_check(node_id, at).await
        }

        async fn mark_as_leader(
            &self,
            expected: Option<NodeId>,
            candidate: NodeId,
        ) -> Result<Option<NodeId>, StoreError> {
            self.0.mark_as_leader(expected, candidate).await
        }

        async fn current_leader(&self) -> Result<Option<NodeId>, StoreError> {
            self.0.current_leader().await
        }

        async fn add_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
            self.0.add_assignment(node_id, agent).await
        }

        async fn remove_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
            self.0.remove_assignment(node_id, agent).await
        }

        async fn load_restrictions(&self) -> Result<AgentRestrictions, StoreError> {
            self.0.load_restrictions().await
        }

        async fn persist_restrictions(&self, restrictions: &AgentRestrictions) -> Result<(), StoreError> {
            self.0.persist_restrictions(restrictions).await
        }
    }

    #[tokio::test]
    async fn test_exiting_is_broadcast_when_row_delete_fails() {
        let cluster = Cluster::new(2);
        let first = Arc::new(NodeAgentController::new(
            ControllerConfig::default(),
            NodeId::new(),
            "memory://one",
            Arc::new(UndeletableNodes(cluster.store.connect())),
            cluster.transport.clone(),
            AgentFamilyRegistry::new().register(cluster.family.clone()),
        ));
        cluster.transport.register(&first);
        let second = cluster.node("two");
        first.join().await.unwrap();
        second.join().await.unwrap();

        let err = first.stop().await.unwrap_err();

        assert!(matches!(err, ControllerError::Store(_)));
        // The row is still there, yet the survivor has moved on.
        assert!(cluster.store.load_node(&first.node_id()).await.unwrap().is_some());
        assert!(second.is_leader());
        assert!(!second.tracker().contains(&first.node_id()));
        assert_eq!(second.running_agents().await.len(), 3);
    }

    #[tokio::test]
    async fn test_paused_agent_is_stopped() {
        let cluster = Cluster::new(2);
        let node = cluster.node("one");
        node.join().await.unwrap();

        let mut restrictions = AgentRestrictions::default();
        restrictions.pause(uri("fake://1"));
        cluster.store.persist_restrictions(&restrictions).await.unwrap();
        node.evaluate_assignments().await;

        assert!(!node.running_agents().await.contains(&uri("fake://1")));
        assert!(node.running_agents().await.contains(&uri("fake://2")));
    }

    #[tokio::test]
    async fn test_debounced_evaluations_coalesce() {
        let cluster = Cluster::new(0);
        let node = cluster.node("one");
        node.start().await.unwrap();
        let before = node.evaluations_run();

        for _ in 0..5 {
            node.request_evaluation();
        }
        tokio::time::sleep(ControllerConfig::default().evaluation_debounce * 3).await;

        assert_eq!(node.evaluations_run(), before + 1);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_refuses_commands_while_exiting() {
        let cluster = Cluster::new(0);
        let node = cluster.node("one");
        node.join().await.unwrap();
        node.halt().await;

        let reply = node.handle(AgentCommand::QueryRunningAgents).await;

        assert!(matches!(reply, AgentReply::Failed { .. }));
    }
}
