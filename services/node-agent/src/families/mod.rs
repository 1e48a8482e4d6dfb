//! Agent families: the kinds of singleton background work a node can host.
//!
//! A family owns one URI scheme. It enumerates the agents it knows about,
//! advertises which of them this node can run, builds runnable agents and
//! picks the distribution policy used when the leader evaluates assignments.

mod durability;

pub use durability::{DurabilityAgent, DurabilityAgentFamily, DURABILITY_SCHEME};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use wolverine_id::{AgentUri, NodeId, NodeNumber};
use wolverine_reconcile::AssignmentGrid;

use crate::error::ControllerError;

/// Lifecycle state of a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Stopped,
    Running,
    Failed,
}

/// Identity of the node an agent is started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentContext {
    pub node_id: NodeId,
    pub node_number: NodeNumber,
}

/// A unit of singleton background work.
#[async_trait]
pub trait Agent: Send + Sync {
    fn uri(&self) -> &AgentUri;

    async fn start(&self, ctx: &AgentContext) -> Result<(), ControllerError>;

    /// Stops the agent. Stopping an agent that is not running is a no-op.
    async fn stop(&self) -> Result<(), ControllerError>;

    fn status(&self) -> AgentStatus;
}

/// Strategy for one URI scheme.
#[async_trait]
pub trait AgentFamily: Send + Sync {
    fn scheme(&self) -> &str;

    /// Every agent of this family that should run somewhere in the cluster.
    async fn all_known_agents(&self) -> Result<Vec<AgentUri>, ControllerError>;

    /// Agents this node is able to host.
    async fn supported_agents(&self) -> Result<Vec<AgentUri>, ControllerError>;

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>, ControllerError>;

    /// Assignment policy. Even distribution when every node advertises the
    /// same capabilities, capability-aware distribution otherwise.
    fn evaluate_assignments(&self, grid: &mut AssignmentGrid) {
        grid.distribute(self.scheme());
    }
}

/// Families keyed by scheme.
#[derive(Default, Clone)]
pub struct AgentFamilyRegistry {
    families: BTreeMap<String, Arc<dyn AgentFamily>>,
}

impl AgentFamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, family: Arc<dyn AgentFamily>) -> Self {
        self.families
            .insert(family.scheme().to_ascii_lowercase(), family);
        self
    }

    pub fn find(&self, scheme: &str) -> Option<&Arc<dyn AgentFamily>> {
        self.families.get(scheme)
    }

    /// Resolves the family owning `uri`.
    pub fn for_agent(&self, uri: &AgentUri) -> Result<&Arc<dyn AgentFamily>, ControllerError> {
        self.find(uri.scheme())
            .ok_or_else(|| ControllerError::InvalidAgent(uri.clone()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn AgentFamily>> {
        self.families.values()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Union of what every family can host on this node.
    pub async fn supported_agents(&self) -> Result<BTreeSet<AgentUri>, ControllerError> {
        let mut supported = BTreeSet::new();
        for family in self.all() {
            supported.extend(family.supported_agents().await?);
        }
        Ok(supported)
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub const FAKE_SCHEME: &str = "fake";

    /// Family whose agents do nothing; the known set is shared and mutable.
    #[derive(Default)]
    pub struct FakeFamily {
        known: Arc<Mutex<Vec<AgentUri>>>,
        failing: Arc<Mutex<BTreeSet<AgentUri>>>,
    }

    impl FakeFamily {
        pub fn with_agents(count: usize) -> Self {
            let family = Self::default();
            family.set_known(count);
            family
        }

        pub fn set_known(&self, count: usize) {
            *self.known.lock().unwrap() = (1..=count)
                .map(|i| AgentUri::from_parts(FAKE_SCHEME, &i.to_string()).unwrap())
                .collect();
        }

        pub fn fail_to_start(&self, uri: &AgentUri) {
            self.failing.lock().unwrap().insert(uri.clone());
        }
    }

    #[async_trait]
    impl AgentFamily for FakeFamily {
        fn scheme(&self) -> &str {
            FAKE_SCHEME
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
                fail: self.failing.lock().unwrap().contains(uri),
                status: AtomicU8::new(0),
            }))
        }
    }

    pub struct FakeAgent {
        uri: AgentUri,
        fail: bool,
        status: AtomicU8,
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn uri(&self) -> &AgentUri {
            &self.uri
        }

        async fn start(&self, _ctx: &AgentContext) -> Result<(), ControllerError> {
            if self.fail {
                self.status.store(2, Ordering::SeqCst);
                return Err(ControllerError::agent_failed(&self.uri, "configured to fail"));
            }
            self.status.store(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), ControllerError> {
            self.status.store(0, Ordering::SeqCst);
            Ok(())
        }

        fn status(&self) -> AgentStatus {
            match self.status.load(Ordering::SeqCst) {
                1 => AgentStatus::Running,
                2 => AgentStatus::Failed,
                _ => AgentStatus::Stopped,
            }
        }
    }
}
