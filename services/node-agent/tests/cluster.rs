//! Multi-node scenarios on the in-memory store and transport.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use wolverine_durability::{InMemoryMessageStore, NodeAgentPersistence};
use wolverine_events::AgentRestrictions;
use wolverine_id::AgentUri;
use wolverine_node_agent::{
    Agent, AgentContext, AgentFamily, AgentFamilyRegistry, AgentStatus, ControllerConfig,
    ControllerError, InMemoryControlTransport, NodeAgentController,
};

// =============================================================================
// Test Harness
// =============================================================================

const SCHEME: &str = "fake";

#[derive(Default)]
struct FakeFamily {
    known: Mutex<Vec<AgentUri>>,
}

impl FakeFamily {
    fn with_agents(count: usize) -> Self {
        let family = Self::default();
        family.set_known(count);
        family
    }

    fn set_known(&self, count: usize) {
        *self.known.lock().unwrap() = (1..=count).map(|i| agent(&i.to_string())).collect();
    }
}

#[async_trait]
impl AgentFamily for FakeFamily {
    fn scheme(&self) -> &str {
        SCHEME
    }

    async fn all_known_agents(&self) -> Result<Vec<AgentUri>, ControllerError> {
        Ok(self.known.lock().unwrap().clone())
    }

    async fn supported_agents(&self) -> Result<Vec<AgentUri>, ControllerError> {
        self.all_known_agents().await
    }

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>, ControllerError> {
        Ok(Arc::new(FakeAgent {
            uri: uri.clone(),
            running: AtomicBool::new(false),
        }))
    }
}

struct FakeAgent {
    uri: AgentUri,
    running: AtomicBool,
}

#[async_trait]
impl Agent for FakeAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    async fn start(&self, _ctx: &AgentContext) -> Result<(), ControllerError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControllerError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        if self.running.load(Ordering::SeqCst) {
            AgentStatus::Running
        } else {
            AgentStatus::Stopped
        }
    }
}

struct Cluster {
    store: InMemoryMessageStore,
    transport: Arc<InMemoryControlTransport>,
    family: Arc<FakeFamily>,
    nodes: Vec<Arc<NodeAgentController>>,
}

impl Cluster {
    fn new(agents: usize, size: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("wolverine_node_agent=debug")
            .with_test_writer()
            .try_init();

        let store = InMemoryMessageStore::new("master");
        let transport = Arc::new(InMemoryControlTransport::new(Duration::from_secs(5)));
        let family = Arc::new(FakeFamily::with_agents(agents));
        let nodes = (1..=size)
            .map(|i| {
                let controller = Arc::new(NodeAgentController::new(
                    ControllerConfig::default(),
                    wolverine_id::NodeId::new(),
                    format!("memory://node{i}"),
                    Arc::new(store.connect()),
                    transport.clone(),
                    AgentFamilyRegistry::new().register(family.clone()),
                ));
                transport.register(&controller);
                controller
            })
            .collect();
        Self {
            store,
            transport,
            family,
            nodes,
        }
    }

    /// Nodes join one after another, so the first one leads.
    async fn join_all(&self) {
        for node in &self.nodes {
            node.join().await.unwrap();
        }
    }

    /// Simulates a crash: the process vanishes and its heartbeat ages out.
    async fn crash(&self, index: usize) {
        let node = &self.nodes[index];
        node.halt().await;
        self.transport.unregister(node.control_uri());
        self.store
            .mark_health_check(&node.node_id(), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
    }
}

fn agent(path: &str) -> AgentUri {
    AgentUri::from_parts(SCHEME, path).unwrap()
}

async fn fake_agents(node: &NodeAgentController) -> BTreeSet<AgentUri> {
    node.running_agents()
        .await
        .into_iter()
        .filter(|a| a.scheme() == SCHEME)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_lowest_node_leads_and_agents_balance() {
    let cluster = Cluster::new(10, 3);
    cluster.join_all().await;
    let leader = &cluster.nodes[0];

    leader.evaluate_assignments().await;

    for node in &cluster.nodes {
        assert_eq!(node.leader_id(), Some(leader.node_id()));
    }
    let mut all = BTreeSet::new();
    for node in &cluster.nodes {
        let running = fake_agents(node).await;
        assert!((3..=4).contains(&running.len()), "unbalanced: {}", running.len());
        for uri in running {
            assert!(all.insert(uri), "agent running twice");
        }
    }
    assert_eq!(all.len(), 10);
}

#[tokio::test]
async fn test_crashed_node_is_ejected_and_its_agents_move() {
    let cluster = Cluster::new(10, 3);
    cluster.join_all().await;
    let leader = &cluster.nodes[0];
    leader.evaluate_assignments().await;

    cluster.crash(1).await;
    leader.health_check().await;

    assert!(!leader.tracker().contains(&cluster.nodes[1].node_id()));
    assert_eq!(fake_agents(&cluster.nodes[0]).await.len(), 5);
    assert_eq!(fake_agents(&cluster.nodes[2]).await.len(), 5);
    assert_eq!(cluster.store.load_all_nodes().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_joins_agree_on_one_leader() {
    let cluster = Cluster::new(0, 3);

    let (a, b, c) = tokio::join!(
        cluster.nodes[0].join(),
        cluster.nodes[1].join(),
        cluster.nodes[2].join()
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    for node in &cluster.nodes {
        node.health_check().await;
    }

    let leader = cluster.store.current_leader().await.unwrap();
    assert!(leader.is_some());
    for node in &cluster.nodes {
        assert_eq!(node.leader_id(), leader);
    }
    let leaders = cluster.nodes.iter().filter(|n| n.is_leader()).count();
    assert_eq!(leaders, 1);
}

#[tokio::test]
async fn test_leader_crash_elects_successor() {
    let cluster = Cluster::new(6, 3);
    cluster.join_all().await;
    cluster.nodes[0].evaluate_assignments().await;

    cluster.crash(0).await;
    cluster.nodes[1].health_check().await;
    // The new leader ejects the crashed node on its next pass.
    cluster.nodes[1].health_check().await;

    assert!(cluster.nodes[1].is_leader());
    assert_eq!(cluster.nodes[2].leader_id(), Some(cluster.nodes[1].node_id()));
    assert_eq!(fake_agents(&cluster.nodes[1]).await.len(), 3);
    assert_eq!(fake_agents(&cluster.nodes[2]).await.len(), 3);
}

#[tokio::test]
async fn test_graceful_leader_exit_hands_over() {
    let cluster = Cluster::new(6, 3);
    cluster.join_all().await;
    cluster.nodes[0].evaluate_assignments().await;

    cluster.nodes[0].stop().await.unwrap();
    cluster.transport.unregister(cluster.nodes[0].control_uri());

    let successor = cluster.nodes[1].node_id();
    assert!(cluster.nodes[1].is_leader());
    assert_eq!(cluster.nodes[2].leader_id(), Some(successor));
    assert_eq!(cluster.store.current_leader().await.unwrap(), Some(successor));
    assert_eq!(fake_agents(&cluster.nodes[1]).await.len(), 3);
    assert_eq!(fake_agents(&cluster.nodes[2]).await.len(), 3);
}

#[tokio::test]
async fn test_pinned_agent_stays_on_its_node() {
    let cluster = Cluster::new(4, 2);
    cluster.join_all().await;
    let pinned = agent("1");
    let target = cluster.nodes[1].node_number().unwrap();

    let mut restrictions = AgentRestrictions::default();
    restrictions.pin(pinned.clone(), target);
    cluster.store.persist_restrictions(&restrictions).await.unwrap();
    cluster.nodes[0].evaluate_assignments().await;

    let on_second = fake_agents(&cluster.nodes[1]).await;
    assert!(on_second.contains(&pinned));
    assert_eq!(on_second.len(), 2);
    assert_eq!(fake_agents(&cluster.nodes[0]).await.len(), 2);
}

#[tokio::test]
async fn test_pin_is_dropped_when_its_node_dies() {
    let cluster = Cluster::new(6, 3);
    cluster.join_all().await;
    let pinned = agent("1");
    let mut restrictions = AgentRestrictions::default();
    restrictions.pin(pinned.clone(), cluster.nodes[2].node_number().unwrap());
    cluster.store.persist_restrictions(&restrictions).await.unwrap();
    cluster.nodes[0].evaluate_assignments().await;
    assert!(fake_agents(&cluster.nodes[2]).await.contains(&pinned));

    cluster.crash(2).await;
    cluster.nodes[0].health_check().await;

    let survivors = [
        fake_agents(&cluster.nodes[0]).await,
        fake_agents(&cluster.nodes[1]).await,
    ];
    assert_eq!(survivors.iter().filter(|s| s.contains(&pinned)).count(), 1);
    assert_eq!(survivors[0].len() + survivors[1].len(), 6);
}

#[tokio::test]
async fn test_verification_heals_drift() {
    let cluster = Cluster::new(6, 3);
    cluster.join_all().await;
    let leader = &cluster.nodes[0];
    leader.evaluate_assignments().await;

    let lost = fake_agents(&cluster.nodes[2]).await.into_iter().next().unwrap();
    cluster.nodes[2].stop_agent(&lost).await;
    cluster.family.set_known(7);
    cluster.nodes[1].start_agent(&agent("7")).await.unwrap();
    cluster.family.set_known(6);

    leader.verify_assignments().await;

    assert!(fake_agents(&cluster.nodes[2]).await.contains(&lost));
    assert!(!fake_agents(&cluster.nodes[1]).await.contains(&agent("7")));
}

#[tokio::test]
async fn test_evaluation_is_stable() {
    let cluster = Cluster::new(5, 2);
    cluster.join_all().await;
    let leader = &cluster.nodes[0];
    leader.evaluate_assignments().await;
    let before = leader.tracker().assignments();

    leader.evaluate_assignments().await;
    leader.verify_assignments().await;

    assert_eq!(leader.tracker().assignments(), before);
}
