//! Storage contracts for envelopes, dead letters, locks and cluster nodes.
//!
//! Every backend implements the same contracts with the same semantics:
//!
//! - Inserting an envelope id twice fails with [`StoreError::DuplicateEnvelope`]
//! - Status transitions are conditional on `(id, owner_id)` so concurrent
//!   nodes never block each other
//! - Claiming unowned envelopes never hands the same row to two callers
//! - Scheduled dispatch and leadership are the only operations behind a
//!   cluster-wide advisory lock

mod memory;
mod postgres;

pub use memory::InMemoryMessageStore;
pub use postgres::PostgresMessageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use wolverine_events::{AgentRestrictions, NodeRegistration, WolverineNode};
use wolverine_id::{AgentUri, EnvelopeId, NodeId};

use crate::envelope::{
    DeadLetterEnvelope, DeadLetterQuery, DeadLetterSummary, Envelope, ExceptionInfo,
    PersistedCounts,
};
use crate::error::StoreError;

/// Durable inbox.
#[async_trait]
pub trait MessageInbox: Send + Sync {
    /// Persists an incoming envelope. A second insert of the same id fails
    /// with `DuplicateEnvelope` and leaves the first row untouched.
    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Persists several incoming envelopes in one unit.
    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError>;

    /// Moves an existing incoming envelope back to `Scheduled`, releasing
    /// ownership and persisting its attempts and execution time.
    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Inserts a new envelope to run at its scheduled time.
    async fn schedule_job(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Deletes the envelope from the inbox and records it as a dead letter
    /// in one unit.
    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        exception: &ExceptionInfo,
    ) -> Result<(), StoreError>;

    /// Persists `envelope.attempts`, already incremented by the caller.
    async fn increment_incoming_envelope_attempts(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Soft delete: flips the row to `Handled` with a keep-until window.
    async fn mark_incoming_envelope_as_handled(&self, envelope: &Envelope) -> Result<(), StoreError>;

    async fn mark_incoming_envelopes_as_handled(&self, envelopes: &[Envelope]) -> Result<(), StoreError>;

    /// Releases every incoming envelope owned by `owner_id`.
    async fn release_incoming(&self, owner_id: i32) -> Result<u64, StoreError>;

    /// Hands the given incoming envelopes to `owner_id`.
    async fn reassign_incoming(&self, owner_id: i32, envelopes: &[Envelope]) -> Result<(), StoreError>;

    /// Atomically claims up to `limit` unowned `Incoming` envelopes.
    async fn claim_orphaned_incoming(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError>;

    /// Claims due scheduled envelopes while holding the scheduled-job lock,
    /// flipping them to `Incoming`. Returns nothing when another node holds
    /// the lock.
    async fn claim_scheduled_due(
        &self,
        owner_id: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError>;
}

/// Durable outbox.
#[async_trait]
pub trait MessageOutbox: Send + Sync {
    async fn load_outgoing(&self, destination: &str) -> Result<Vec<Envelope>, StoreError>;

    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<(), StoreError>;

    async fn delete_outgoing(&self, envelope: &Envelope) -> Result<(), StoreError>;

    async fn delete_outgoing_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError>;

    /// Deletes `discards` and hands `reassigned` to `owner_id` in one unit.
    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        owner_id: i32,
    ) -> Result<(), StoreError>;

    /// Atomically claims up to `limit` unowned outgoing envelopes.
    async fn claim_orphaned_outgoing(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError>;
}

/// Maintenance and diagnostics.
#[async_trait]
pub trait MessageStoreAdmin: Send + Sync {
    /// Creates missing tables. Safe to run repeatedly.
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Deletes every envelope and dead letter.
    async fn clear_all(&self) -> Result<(), StoreError>;

    /// Migrates then clears.
    async fn rebuild(&self) -> Result<(), StoreError> {
        self.migrate().await?;
        self.clear_all().await
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, StoreError>;

    async fn all_incoming(&self) -> Result<Vec<Envelope>, StoreError>;

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, StoreError>;

    /// Resets every owner id to `ANY_NODE`.
    async fn release_all_ownership(&self) -> Result<(), StoreError>;

    async fn check_connectivity(&self) -> Result<(), StoreError>;

    /// Purges up to `batch` handled rows whose keep-until has passed,
    /// skipping rows locked by live traffic.
    async fn delete_expired_handled(&self, now: DateTime<Utc>, batch: usize) -> Result<u64, StoreError>;
}

/// Dead-letter storage.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>, StoreError>;

    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEnvelope>, StoreError>;

    async fn mark_dead_letters_for_replay(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError>;

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError>;

    /// Moves up to `limit` replayable dead letters back into the inbox as
    /// unowned `Incoming` envelopes with zero attempts.
    async fn replay_dead_letters(&self, limit: usize) -> Result<u64, StoreError>;
}

/// Cluster-wide mutual exclusion keyed by integer id.
///
/// At most one holder per lock id. Locks are released when the holding
/// connection goes away. Releasing a lock that is not held is a no-op.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    async fn has_lock(&self, lock_id: i64) -> bool;

    async fn try_attain_lock(&self, lock_id: i64) -> Result<bool, StoreError>;

    async fn release_lock(&self, lock_id: i64) -> Result<(), StoreError>;
}

/// Cluster membership persistence.
#[async_trait]
pub trait NodeAgentPersistence: Send + Sync {
    /// Inserts the node and hands out a node number never used before.
    async fn persist_node(&self, registration: &NodeRegistration) -> Result<WolverineNode, StoreError>;

    /// Deletes the node and its assignments and releases the envelopes it
    /// owned, in one unit.
    async fn delete_node(&self, node_id: &NodeId) -> Result<(), StoreError>;

    /// Every node with its active agents, ordered by node number.
    async fn load_all_nodes(&self) -> Result<Vec<WolverineNode>, StoreError>;

    async fn load_node(&self, node_id: &NodeId) -> Result<Option<WolverineNode>, StoreError>;

    /// Writes a heartbeat. Returns false if the node row no longer exists.
    async fn mark_health_check(&self, node_id: &NodeId, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Compare-and-set on leadership. When the current leader is absent or
    /// equals `expected`, `candidate` becomes leader. Returns the actual
    /// leader afterwards, or `None` when the leadership lock is contended.
    async fn mark_as_leader(
        &self,
        expected: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>, StoreError>;

    async fn current_leader(&self) -> Result<Option<NodeId>, StoreError>;

    async fn add_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError>;

    async fn remove_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError>;

    async fn load_restrictions(&self) -> Result<AgentRestrictions, StoreError>;

    /// Upserts effective restrictions and deletes lifted ones.
    async fn persist_restrictions(&self, restrictions: &AgentRestrictions) -> Result<(), StoreError>;
}

/// A complete message store backend.
pub trait MessageStore:
    MessageInbox + MessageOutbox + MessageStoreAdmin + DeadLetters + AdvisoryLock + NodeAgentPersistence
{
    /// Name used in logs and agent URIs.
    fn name(&self) -> &str;
}
