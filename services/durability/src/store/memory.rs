//! In-process message store.
//!
//! Shares one state between every connection created from the same root, so
//! several simulated nodes in one process see the same rows and contend for
//! the same advisory locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use wolverine_events::{AgentRestriction, AgentRestrictions, NodeRegistration, WolverineNode};
use wolverine_id::{AgentUri, EnvelopeId, NodeId, NodeNumber, ANY_NODE};

use super::{
    AdvisoryLock, DeadLetters, MessageInbox, MessageOutbox, MessageStore, MessageStoreAdmin,
    NodeAgentPersistence,
};
use crate::config::DurabilitySettings;
use crate::envelope::{
    DeadLetterEnvelope, DeadLetterQuery, DeadLetterSummary, Envelope, EnvelopeStatus,
    ExceptionInfo, PersistedCounts,
};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    incoming: BTreeMap<EnvelopeId, Envelope>,
    outgoing: BTreeMap<EnvelopeId, Envelope>,
    dead_letters: BTreeMap<EnvelopeId, DeadLetterEnvelope>,
    nodes: BTreeMap<NodeId, WolverineNode>,
    /// agent uri -> node, including the leadership sentinel
    assignments: BTreeMap<AgentUri, NodeId>,
    restrictions: BTreeMap<AgentUri, AgentRestriction>,
    last_node_number: i32,
    last_connection: u64,
    /// lock id -> holding connection
    locks: HashMap<i64, u64>,
}

impl MemoryState {
    fn lock_held_by_other(&self, lock_id: i64, connection: u64) -> bool {
        self.locks
            .get(&lock_id)
            .is_some_and(|holder| *holder != connection)
    }

    fn node_with_agents(&self, node: &WolverineNode) -> WolverineNode {
        let mut node = node.clone();
        node.active_agents = self
            .assignments
            .iter()
            .filter(|(_, owner)| **owner == node.node_id)
            .map(|(uri, _)| uri.clone())
            .collect();
        node
    }

    fn remove_node(&mut self, node_id: &NodeId) -> Option<WolverineNode> {
        let node = self.nodes.remove(node_id)?;
        self.assignments.retain(|_, owner| owner != node_id);
        let number = node.assigned_node_number.value();
        for envelope in self.incoming.values_mut().chain(self.outgoing.values_mut()) {
            if envelope.owner_id == number {
                envelope.owner_id = ANY_NODE;
            }
        }
        Some(node)
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the connection's advisory locks when the last handle drops.
#[derive(Debug)]
struct Connection {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.locks.retain(|_, holder| *holder != self.id);
    }
}

/// Message store held in process memory.
///
/// Clones share the connection; [`InMemoryMessageStore::connect`] opens a
/// new connection on the same data.
#[derive(Debug, Clone)]
pub struct InMemoryMessageStore {
    name: String,
    settings: Arc<DurabilitySettings>,
    state: Arc<Mutex<MemoryState>>,
    connection: Arc<Connection>,
}

impl InMemoryMessageStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, DurabilitySettings::default())
    }

    pub fn with_settings(name: impl Into<String>, settings: DurabilitySettings) -> Self {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        let connection = Self::open(&state);
        Self {
            name: name.into(),
            settings: Arc::new(settings),
            state,
            connection,
        }
    }

    /// Opens another connection on the same data.
    pub fn connect(&self) -> Self {
        Self {
            name: self.name.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            connection: Self::open(&self.state),
        }
    }

    pub fn settings(&self) -> &DurabilitySettings {
        &self.settings
    }

    fn open(state: &Arc<Mutex<MemoryState>>) -> Arc<Connection> {
        let id = {
            let mut guard = lock_state(state);
            guard.last_connection += 1;
            guard.last_connection
        };
        Arc::new(Connection {
            id,
            state: state.clone(),
        })
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }
}

// =============================================================================
// Inbox
// =============================================================================

#[async_trait]
impl MessageInbox for InMemoryMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.store_incoming_batch(std::slice::from_ref(envelope)).await
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let mut state = self.state();
        let mut seen = std::collections::BTreeSet::new();
        for envelope in envelopes {
            if state.incoming.contains_key(&envelope.id) || !seen.insert(envelope.id) {
                return Err(StoreError::DuplicateEnvelope(envelope.id));
            }
        }
        for envelope in envelopes {
            state.incoming.insert(envelope.id, envelope.clone());
        }
        Ok(())
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(row) = state
            .incoming
            .get_mut(&envelope.id)
            .filter(|row| row.owner_id == envelope.owner_id)
        {
            row.status = EnvelopeStatus::Scheduled;
            row.scheduled_time = envelope.scheduled_time;
            row.attempts = envelope.attempts;
            row.owner_id = ANY_NODE;
        }
        Ok(())
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.incoming.contains_key(&envelope.id) {
            return Err(StoreError::DuplicateEnvelope(envelope.id));
        }
        let mut row = envelope.clone();
        row.status = EnvelopeStatus::Scheduled;
        row.owner_id = ANY_NODE;
        state.incoming.insert(row.id, row);
        Ok(())
    }

    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        exception: &ExceptionInfo,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let stored = state
            .incoming
            .remove(&envelope.id)
            .unwrap_or_else(|| envelope.clone());
        state.dead_letters.insert(
            envelope.id,
            DeadLetterEnvelope {
                envelope: Envelope {
                    attempts: envelope.attempts,
                    ..stored
                },
                exception: exception.clone(),
                replayable: false,
            },
        );
        Ok(())
    }

    async fn increment_incoming_envelope_attempts(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(row) = state
            .incoming
            .get_mut(&envelope.id)
            .filter(|row| row.owner_id == envelope.owner_id)
        {
            row.attempts = envelope.attempts;
        }
        Ok(())
    }

    async fn mark_incoming_envelope_as_handled(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.mark_incoming_envelopes_as_handled(std::slice::from_ref(envelope))
            .await
    }

    async fn mark_incoming_envelopes_as_handled(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let keep_until = self.settings.keep_until(Utc::now());
        let mut state = self.state();
        for envelope in envelopes {
            if let Some(row) = state
                .incoming
                .get_mut(&envelope.id)
                .filter(|row| row.owner_id == envelope.owner_id)
            {
                row.status = EnvelopeStatus::Handled;
                row.keep_until = Some(keep_until);
            }
        }
        Ok(())
    }

    async fn release_incoming(&self, owner_id: i32) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut released = 0;
        for row in state.incoming.values_mut().filter(|r| r.owner_id == owner_id) {
            row.owner_id = ANY_NODE;
            released += 1;
        }
        Ok(released)
    }

    async fn reassign_incoming(&self, owner_id: i32, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let mut state = self.state();
        for envelope in envelopes {
            if let Some(row) = state.incoming.get_mut(&envelope.id) {
                row.owner_id = owner_id;
            }
        }
        Ok(())
    }

    async fn claim_orphaned_incoming(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        let mut state = self.state();
        let claimed: Vec<Envelope> = state
            .incoming
            .values_mut()
            .filter(|r| r.owner_id == ANY_NODE && r.status == EnvelopeStatus::Incoming)
            .take(limit)
            .map(|row| {
                row.owner_id = owner_id;
                row.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn claim_scheduled_due(
        &self,
        owner_id: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut state = self.state();
        if state.lock_held_by_other(self.settings.scheduled_job_lock_id, self.connection.id) {
            debug!(store = %self.name, "scheduled job lock held elsewhere");
            return Ok(Vec::new());
        }

        let mut due: Vec<&mut Envelope> = state
            .incoming
            .values_mut()
            .filter(|r| r.status == EnvelopeStatus::Scheduled && !r.is_scheduled_for_later(now))
            .collect();
        due.sort_by_key(|r| r.scheduled_time);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|row| {
                row.status = EnvelopeStatus::Incoming;
                row.owner_id = owner_id;
                row.clone()
            })
            .collect())
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[async_trait]
impl MessageOutbox for InMemoryMessageStore {
    async fn load_outgoing(&self, destination: &str) -> Result<Vec<Envelope>, StoreError> {
        let state = self.state();
        Ok(state
            .outgoing
            .values()
            .filter(|r| r.destination.as_deref() == Some(destination))
            .cloned()
            .collect())
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.outgoing.contains_key(&envelope.id) {
            return Err(StoreError::DuplicateEnvelope(envelope.id));
        }
        let mut row = envelope.clone();
        row.status = EnvelopeStatus::Outgoing;
        row.owner_id = owner_id;
        state.outgoing.insert(row.id, row);
        Ok(())
    }

    async fn delete_outgoing(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.state().outgoing.remove(&envelope.id);
        Ok(())
    }

    async fn delete_outgoing_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let mut state = self.state();
        for envelope in envelopes {
            state.outgoing.remove(&envelope.id);
        }
        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        owner_id: i32,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        for envelope in discards {
            state.outgoing.remove(&envelope.id);
        }
        for envelope in reassigned {
            if let Some(row) = state.outgoing.get_mut(&envelope.id) {
                row.owner_id = owner_id;
            }
        }
        Ok(())
    }

    async fn claim_orphaned_outgoing(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        let mut state = self.state();
        Ok(state
            .outgoing
            .values_mut()
            .filter(|r| r.owner_id == ANY_NODE)
            .take(limit)
            .map(|row| {
                row.owner_id = owner_id;
                row.clone()
            })
            .collect())
    }
}

// =============================================================================
// Admin
// =============================================================================

#[async_trait]
impl MessageStoreAdmin for InMemoryMessageStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut state = self.state();
        state.incoming.clear();
        state.outgoing.clear();
        state.dead_letters.clear();
        Ok(())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, StoreError> {
        let state = self.state();
        let mut counts = PersistedCounts::default();
        for row in state.incoming.values() {
            match row.status {
                EnvelopeStatus::Incoming => counts.incoming += 1,
                EnvelopeStatus::Scheduled => counts.scheduled += 1,
                EnvelopeStatus::Handled => counts.handled += 1,
                EnvelopeStatus::Outgoing => {}
            }
        }
        counts.outgoing = state.outgoing.len() as i64;
        counts.dead_letter = state.dead_letters.len() as i64;
        Ok(counts)
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, StoreError> {
        Ok(self.state().incoming.values().cloned().collect())
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, StoreError> {
        Ok(self.state().outgoing.values().cloned().collect())
    }

    async fn release_all_ownership(&self) -> Result<(), StoreError> {
        let mut state = self.state();
        let MemoryState {
            incoming, outgoing, ..
        } = &mut *state;
        for row in incoming.values_mut().chain(outgoing.values_mut()) {
            row.owner_id = ANY_NODE;
        }
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>, batch: usize) -> Result<u64, StoreError> {
        let mut state = self.state();
        let expired: Vec<EnvelopeId> = state
            .incoming
            .values()
            .filter(|r| {
                r.status == EnvelopeStatus::Handled && r.keep_until.is_some_and(|k| k <= now)
            })
            .take(batch)
            .map(|r| r.id)
            .collect();
        for id in &expired {
            state.incoming.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

// =============================================================================
// Dead Letters
// =============================================================================

#[async_trait]
impl DeadLetters for InMemoryMessageStore {
    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>, StoreError> {
        let state = self.state();
        let mut groups: BTreeMap<(Option<String>, String, String), i64> = BTreeMap::new();
        for dead_letter in state.dead_letters.values() {
            let key = (
                dead_letter.envelope.received_at.clone(),
                dead_letter.envelope.message_type.clone(),
                dead_letter.exception.exception_type.clone(),
            );
            *groups.entry(key).or_default() += 1;
        }
        Ok(groups
            .into_iter()
            .map(|((received_at, message_type, exception_type), count)| DeadLetterSummary {
                tenant_id: None,
                received_at,
                message_type,
                exception_type,
                count,
            })
            .collect())
    }

    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEnvelope>, StoreError> {
        let state = self.state();
        Ok(state
            .dead_letters
            .values()
            .filter(|d| query.matches(d))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn mark_dead_letters_for_replay(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut marked = 0;
        for id in ids {
            if let Some(dead_letter) = state.dead_letters.get_mut(id) {
                dead_letter.replayable = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let mut state = self.state();
        Ok(ids
            .iter()
            .filter(|id| state.dead_letters.remove(*id).is_some())
            .count() as u64)
    }

    async fn replay_dead_letters(&self, limit: usize) -> Result<u64, StoreError> {
        let mut state = self.state();
        let ids: Vec<EnvelopeId> = state
            .dead_letters
            .values()
            .filter(|d| d.replayable)
            .take(limit)
            .map(|d| d.envelope.id)
            .collect();

        for id in &ids {
            if let Some(dead_letter) = state.dead_letters.remove(id) {
                let mut envelope = dead_letter.envelope;
                envelope.status = EnvelopeStatus::Incoming;
                envelope.owner_id = ANY_NODE;
                envelope.attempts = 0;
                envelope.scheduled_time = None;
                state.incoming.entry(envelope.id).or_insert(envelope);
            }
        }
        Ok(ids.len() as u64)
    }
}

// =============================================================================
// Advisory Locks
// =============================================================================

#[async_trait]
impl AdvisoryLock for InMemoryMessageStore {
    async fn has_lock(&self, lock_id: i64) -> bool {
        self.state().locks.get(&lock_id) == Some(&self.connection.id)
    }

    async fn try_attain_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state();
        let holder = *state.locks.entry(lock_id).or_insert(self.connection.id);
        Ok(holder == self.connection.id)
    }

    async fn release_lock(&self, lock_id: i64) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.locks.get(&lock_id) == Some(&self.connection.id) {
            state.locks.remove(&lock_id);
        }
        Ok(())
    }
}

// =============================================================================
// Node Persistence
// =============================================================================

#[async_trait]
impl NodeAgentPersistence for InMemoryMessageStore {
    async fn persist_node(&self, registration: &NodeRegistration) -> Result<WolverineNode, StoreError> {
        let mut state = self.state();
        state.remove_node(&registration.node_id);
        state.last_node_number += 1;
        let number = NodeNumber::new(state.last_node_number)?;
        let node = registration.clone().into_node(number);
        state.nodes.insert(node.node_id, node.clone());
        Ok(node)
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<(), StoreError> {
        self.state().remove_node(node_id);
        Ok(())
    }

    async fn load_all_nodes(&self) -> Result<Vec<WolverineNode>, StoreError> {
        let state = self.state();
        let mut nodes: Vec<WolverineNode> = state
            .nodes
            .values()
            .map(|n| state.node_with_agents(n))
            .collect();
        nodes.sort_by_key(|n| n.assigned_node_number);
        Ok(nodes)
    }

    async fn load_node(&self, node_id: &NodeId) -> Result<Option<WolverineNode>, StoreError> {
        let state = self.state();
        Ok(state.nodes.get(node_id).map(|n| state.node_with_agents(n)))
    }

    async fn mark_health_check(&self, node_id: &NodeId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_health_check = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_as_leader(
        &self,
        expected: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>, StoreError> {
        let mut state = self.state();
        if state.lock_held_by_other(self.settings.leadership_lock_id, self.connection.id) {
            return Ok(None);
        }

        let leader = AgentUri::leader();
        let current = state.assignments.get(&leader).copied();
        if current.is_none() || current == expected {
            if !state.nodes.contains_key(&candidate) {
                return Err(StoreError::NodeNotFound(candidate));
            }
            state.assignments.insert(leader, candidate);
            return Ok(Some(candidate));
        }
        Ok(current)
    }

    async fn current_leader(&self) -> Result<Option<NodeId>, StoreError> {
        Ok(self.state().assignments.get(&AgentUri::leader()).copied())
    }

    async fn add_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.nodes.contains_key(node_id) {
            return Err(StoreError::NodeNotFound(*node_id));
        }
        state.assignments.insert(agent.clone(), *node_id);
        Ok(())
    }

    async fn remove_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.assignments.get(agent) == Some(node_id) {
            state.assignments.remove(agent);
        }
        Ok(())
    }

    async fn load_restrictions(&self) -> Result<AgentRestrictions, StoreError> {
        let state = self.state();
        Ok(AgentRestrictions::new(
            state.restrictions.values().cloned().collect(),
        ))
    }

    async fn persist_restrictions(&self, restrictions: &AgentRestrictions) -> Result<(), StoreError> {
        let mut state = self.state();
        for restriction in restrictions.all() {
            if restriction.is_effective() {
                state
                    .restrictions
                    .insert(restriction.agent_uri.clone(), restriction.clone());
            } else {
                state.restrictions.remove(&restriction.agent_uri);
            }
        }
        Ok(())
    }
}

impl MessageStore for InMemoryMessageStore {
    fn name(&self) -> &str {
        &self.name
    }
}
