//! Routing of envelope storage to per-tenant databases.
//!
//! Tenant keys `""`, `"*DEFAULT*"` and `"Master"` (any case) resolve to the
//! master store. Bulk operations are grouped per store and each group runs
//! through a [`RetryBlock`]; a failing tenant never aborts the others and is
//! reported as [`StoreError::TenantFailures`] once every group has run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use wolverine_events::{AgentRestrictions, NodeRegistration, WolverineNode};
use wolverine_id::{AgentUri, EnvelopeId, NodeId};
use wolverine_reconcile::BackoffPolicy;

use crate::envelope::{
    DeadLetterEnvelope, DeadLetterQuery, DeadLetterSummary, Envelope, ExceptionInfo,
    PersistedCounts,
};
use crate::error::{StoreError, TenantFailure};
use crate::store::{
    AdvisoryLock, DeadLetters, MessageInbox, MessageOutbox, MessageStore, MessageStoreAdmin,
    NodeAgentPersistence,
};

pub const DEFAULT_TENANT: &str = "*DEFAULT*";
pub const MASTER_TENANT: &str = "Master";

/// Returns true if the tenant key addresses the master store.
pub fn is_master_key(tenant_id: &str) -> bool {
    tenant_id.is_empty()
        || tenant_id.eq_ignore_ascii_case(DEFAULT_TENANT)
        || tenant_id.eq_ignore_ascii_case(MASTER_TENANT)
}

fn normalize(tenant_id: Option<&str>) -> &str {
    match tenant_id {
        Some(id) if !is_master_key(id) => id,
        _ => "",
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The master store plus every registered tenant store.
pub struct TenantedMessageStores {
    master: Arc<dyn MessageStore>,
    tenants: RwLock<BTreeMap<String, Arc<dyn MessageStore>>>,
}

impl TenantedMessageStores {
    pub fn new(master: Arc<dyn MessageStore>) -> Self {
        Self {
            master,
            tenants: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_tenant(&self, tenant_id: impl Into<String>, store: Arc<dyn MessageStore>) {
        let tenant_id = tenant_id.into();
        debug!(tenant_id = %tenant_id, store = store.name(), "registering tenant store");
        self.tenants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, store);
    }

    pub fn master(&self) -> Arc<dyn MessageStore> {
        self.master.clone()
    }

    /// Resolves the store for a tenant key.
    pub fn find(&self, tenant_id: Option<&str>) -> Result<Arc<dyn MessageStore>, StoreError> {
        let key = normalize(tenant_id);
        if key.is_empty() {
            return Ok(self.master.clone());
        }
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTenant(key.to_string()))
    }

    /// Every store keyed by tenant id, master first under `"Master"`.
    pub fn active(&self) -> Vec<(String, Arc<dyn MessageStore>)> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        std::iter::once((MASTER_TENANT.to_string(), self.master.clone()))
            .chain(tenants.iter().map(|(id, store)| (id.clone(), store.clone())))
            .collect()
    }
}

// =============================================================================
// Retry Block
// =============================================================================

/// Bounded retry of a store operation. Only transient errors are retried.
#[derive(Debug, Clone)]
pub struct RetryBlock {
    attempts: u32,
    backoff: BackoffPolicy,
}

impl Default for RetryBlock {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::default())
    }
}

impl RetryBlock {
    pub fn new(attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying store operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Multi-tenanted store
// =============================================================================

/// Message store facade that routes each operation to the right tenant.
///
/// Node persistence and advisory locks always go to the master store.
pub struct MultiTenantedMessageStore {
    stores: Arc<TenantedMessageStores>,
    retry: RetryBlock,
}

impl MultiTenantedMessageStore {
    pub fn new(stores: Arc<TenantedMessageStores>) -> Self {
        Self {
            stores,
            retry: RetryBlock::default(),
        }
    }

    pub fn stores(&self) -> &Arc<TenantedMessageStores> {
        &self.stores
    }

    fn master(&self) -> Arc<dyn MessageStore> {
        self.stores.master()
    }

    fn route(&self, envelope: &Envelope) -> Result<Arc<dyn MessageStore>, StoreError> {
        self.stores.find(envelope.tenant_id.as_deref())
    }

    /// Runs `op` against every active store. Fails with `TenantFailures`
    /// after all stores have run if any of them failed.
    async fn fan_out<T, F, Fut>(&self, op: F) -> Result<Vec<(String, T)>, StoreError>
    where
        F: Fn(Arc<dyn MessageStore>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for (tenant_id, store) in self.stores.active() {
            match self.retry.execute(|| op(store.clone())).await {
                Ok(value) => results.push((tenant_id, value)),
                Err(e) => failures.push(failure(&tenant_id, &e)),
            }
        }
        finish(results, failures)
    }

    /// Groups envelopes by resolved store and runs `op` once per group.
    async fn per_tenant<F, Fut>(&self, envelopes: &[Envelope], op: F) -> Result<(), StoreError>
    where
        F: Fn(Arc<dyn MessageStore>, Vec<Envelope>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), StoreError>> + Send,
    {
        let mut groups: BTreeMap<&str, Vec<Envelope>> = BTreeMap::new();
        for envelope in envelopes {
            groups
                .entry(normalize(envelope.tenant_id.as_deref()))
                .or_default()
                .push(envelope.clone());
        }

        let mut failures = Vec::new();
        for (tenant_id, group) in groups {
            let store = match self.stores.find(Some(tenant_id)) {
                Ok(store) => store,
                Err(e) => {
                    failures.push(failure(tenant_id, &e));
                    continue;
                }
            };
            if let Err(e) = self
                .retry
                .execute(|| op(store.clone(), group.clone()))
                .await
            {
                failures.push(failure(tenant_id, &e));
            }
        }
        finish(Vec::<()>::new(), failures).map(|_| ())
    }

    /// Claims from each store in turn until `limit` is reached. Stores that
    /// fail are logged and skipped so rows already claimed are not lost.
    async fn claim_across<F, Fut>(&self, limit: usize, op: F) -> Vec<Envelope>
    where
        F: Fn(Arc<dyn MessageStore>, usize) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<Envelope>, StoreError>> + Send,
    {
        let mut claimed = Vec::new();
        for (tenant_id, store) in self.stores.active() {
            let remaining = limit.saturating_sub(claimed.len());
            if remaining == 0 {
                break;
            }
            match op(store, remaining).await {
                Ok(page) => claimed.extend(page),
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "claim failed for tenant store"),
            }
        }
        claimed
    }
}

fn failure(tenant_id: &str, err: &StoreError) -> TenantFailure {
    warn!(tenant_id = %tenant_id, error = %err, "tenant store operation failed");
    TenantFailure {
        tenant_id: if tenant_id.is_empty() {
            MASTER_TENANT.to_string()
        } else {
            tenant_id.to_string()
        },
        message: err.to_string(),
    }
}

fn finish<T>(results: Vec<T>, failures: Vec<TenantFailure>) -> Result<Vec<T>, StoreError> {
    if failures.is_empty() {
        Ok(results)
    } else {
        Err(StoreError::TenantFailures(failures))
    }
}

fn tenant_tag(tenant_id: &str) -> Option<String> {
    (tenant_id != MASTER_TENANT).then(|| tenant_id.to_string())
}

#[async_trait]
impl MessageInbox for MultiTenantedMessageStore {
    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry.execute(|| store.store_incoming(envelope)).await
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        self.per_tenant(envelopes, |store, group| async move {
            store.store_incoming_batch(&group).await
        })
        .await
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry.execute(|| store.schedule_execution(envelope)).await
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry.execute(|| store.schedule_job(envelope)).await
    }

    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        exception: &ExceptionInfo,
    ) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry
            .execute(|| store.move_to_dead_letter_storage(envelope, exception))
            .await
    }

    async fn increment_incoming_envelope_attempts(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry
            .execute(|| store.increment_incoming_envelope_attempts(envelope))
            .await
    }

    async fn mark_incoming_envelope_as_handled(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry
            .execute(|| store.mark_incoming_envelope_as_handled(envelope))
            .await
    }

    async fn mark_incoming_envelopes_as_handled(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        self.per_tenant(envelopes, |store, group| async move {
            store.mark_incoming_envelopes_as_handled(&group).await
        })
        .await
    }

    async fn release_incoming(&self, owner_id: i32) -> Result<u64, StoreError> {
        let released = self
            .fan_out(|store| async move { store.release_incoming(owner_id).await })
            .await?;
        Ok(released.into_iter().map(|(_, n)| n).sum())
    }

    async fn reassign_incoming(&self, owner_id: i32, envelopes: &[Envelope]) -> Result<(), StoreError> {
        self.per_tenant(envelopes, |store, group| async move {
            store.reassign_incoming(owner_id, &group).await
        })
        .await
    }

    async fn claim_orphaned_incoming(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        Ok(self
            .claim_across(limit, |store, remaining| async move {
                store.claim_orphaned_incoming(owner_id, remaining).await
            })
            .await)
    }

    async fn claim_scheduled_due(
        &self,
        owner_id: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        Ok(self
            .claim_across(limit, |store, remaining| async move {
                store.claim_scheduled_due(owner_id, now, remaining).await
            })
            .await)
    }
}

#[async_trait]
impl MessageOutbox for MultiTenantedMessageStore {
    async fn load_outgoing(&self, destination: &str) -> Result<Vec<Envelope>, StoreError> {
        let loaded = self
            .fan_out(|store| async move { store.load_outgoing(destination).await })
            .await?;
        Ok(loaded.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry
            .execute(|| store.store_outgoing(envelope, owner_id))
            .await
    }

    async fn delete_outgoing(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let store = self.route(envelope)?;
        self.retry.execute(|| store.delete_outgoing(envelope)).await
    }

    async fn delete_outgoing_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        self.per_tenant(envelopes, |store, group| async move {
            store.delete_outgoing_batch(&group).await
        })
        .await
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        owner_id: i32,
    ) -> Result<(), StoreError> {
        self.per_tenant(discards, |store, group| async move {
            store.discard_and_reassign_outgoing(&group, &[], owner_id).await
        })
        .await?;
        self.per_tenant(reassigned, |store, group| async move {
            store.discard_and_reassign_outgoing(&[], &group, owner_id).await
        })
        .await
    }

    async fn claim_orphaned_outgoing(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        Ok(self
            .claim_across(limit, |store, remaining| async move {
                store.claim_orphaned_outgoing(owner_id, remaining).await
            })
            .await)
    }
}

#[async_trait]
impl MessageStoreAdmin for MultiTenantedMessageStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        self.fan_out(|store| async move { store.migrate().await })
            .await
            .map(|_| ())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.fan_out(|store| async move { store.clear_all().await })
            .await
            .map(|_| ())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, StoreError> {
        let counts = self
            .fan_out(|store| async move { store.fetch_counts().await })
            .await?;
        Ok(counts
            .into_iter()
            .fold(PersistedCounts::default(), |total, (_, counts)| total + counts))
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, StoreError> {
        let rows = self
            .fan_out(|store| async move { store.all_incoming().await })
            .await?;
        Ok(rows.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, StoreError> {
        let rows = self
            .fan_out(|store| async move { store.all_outgoing().await })
            .await?;
        Ok(rows.into_iter().flat_map(|(_, rows)| rows).collect())
    }

    async fn release_all_ownership(&self) -> Result<(), StoreError> {
        self.fan_out(|store| async move { store.release_all_ownership().await })
            .await
            .map(|_| ())
    }

    async fn check_connectivity(&self) -> Result<(), StoreError> {
        self.fan_out(|store| async move { store.check_connectivity().await })
            .await
            .map(|_| ())
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>, batch: usize) -> Result<u64, StoreError> {
        let deleted = self
            .fan_out(|store| async move { store.delete_expired_handled(now, batch).await })
            .await?;
        Ok(deleted.into_iter().map(|(_, n)| n).sum())
    }
}

#[async_trait]
impl DeadLetters for MultiTenantedMessageStore {
    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>, StoreError> {
        let summaries = self
            .fan_out(|store| async move { store.summarize_dead_letters().await })
            .await?;
        Ok(summaries
            .into_iter()
            .flat_map(|(tenant_id, rows)| {
                rows.into_iter().map(move |row| DeadLetterSummary {
                    tenant_id: tenant_tag(&tenant_id),
                    ..row
                })
            })
            .collect())
    }

    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEnvelope>, StoreError> {
        if let Some(tenant_id) = query.tenant_id.as_deref() {
            let store = self.stores.find(Some(tenant_id))?;
            return store.query_dead_letters(query).await;
        }

        let rows = self
            .fan_out(|store| async move { store.query_dead_letters(query).await })
            .await?;
        Ok(rows
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn mark_dead_letters_for_replay(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let marked = self
            .fan_out(|store| async move { store.mark_dead_letters_for_replay(ids).await })
            .await?;
        Ok(marked.into_iter().map(|(_, n)| n).sum())
    }

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let deleted = self
            .fan_out(|store| async move { store.delete_dead_letters(ids).await })
            .await?;
        Ok(deleted.into_iter().map(|(_, n)| n).sum())
    }

    async fn replay_dead_letters(&self, limit: usize) -> Result<u64, StoreError> {
        let mut replayed = 0u64;
        let mut failures = Vec::new();
        for (tenant_id, store) in self.stores.active() {
            let remaining = (limit as u64).saturating_sub(replayed);
            if remaining == 0 {
                break;
            }
            let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
            match self
                .retry
                .execute(|| store.replay_dead_letters(remaining))
                .await
            {
                Ok(n) => replayed += n,
                Err(e) => failures.push(failure(&tenant_id, &e)),
            }
        }
        finish(vec![replayed], failures).map(|_| replayed)
    }
}

#[async_trait]
impl AdvisoryLock for MultiTenantedMessageStore {
    async fn has_lock(&self, lock_id: i64) -> bool {
        self.master().has_lock(lock_id).await
    }

    async fn try_attain_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        self.master().try_attain_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: i64) -> Result<(), StoreError> {
        self.master().release_lock(lock_id).await
    }
}

#[async_trait]
impl NodeAgentPersistence for MultiTenantedMessageStore {
    async fn persist_node(&self, registration: &NodeRegistration) -> Result<WolverineNode, StoreError> {
        self.master().persist_node(registration).await
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<(), StoreError> {
        let master = self.master();
        let node = master.load_node(node_id).await?;
        master.delete_node(node_id).await?;

        // The master release happened with the delete; tenants hold rows too.
        if let Some(node) = node {
            let owner = node.assigned_node_number.value();
            for (tenant_id, store) in self.stores.active().into_iter().skip(1) {
                if let Err(e) = store.release_incoming(owner).await {
                    warn!(tenant_id = %tenant_id, error = %e, "failed to release incoming for deleted node");
                }
                let outgoing = store.all_outgoing().await?;
                let owned: Vec<Envelope> = outgoing.into_iter().filter(|e| e.owner_id == owner).collect();
                if !owned.is_empty() {
                    store
                        .discard_and_reassign_outgoing(&[], &owned, wolverine_id::ANY_NODE)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn load_all_nodes(&self) -> Result<Vec<WolverineNode>, StoreError> {
        self.master().load_all_nodes().await
    }

    async fn load_node(&self, node_id: &NodeId) -> Result<Option<WolverineNode>, StoreError> {
        self.master().load_node(node_id).await
    }

    async fn mark_health_check(&self, node_id: &NodeId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.master().mark_health_check(node_id, at).await
    }

    async fn mark_as_leader(
        &self,
        expected: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>, StoreError> {
        self.master().mark_as_leader(expected, candidate).await
    }

    async fn current_leader(&self) -> Result<Option<NodeId>, StoreError> {
        self.master().current_leader().await
    }

    async fn add_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        self.master().add_assignment(node_id, agent).await
    }

    async fn remove_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        self.master().remove_assignment(node_id, agent).await
    }

    async fn load_restrictions(&self) -> Result<AgentRestrictions, StoreError> {
        self.master().load_restrictions().await
    }

    async fn persist_restrictions(&self, restrictions: &AgentRestrictions) -> Result<(), StoreError> {
        self.master().persist_restrictions(restrictions).await
    }
}

impl MessageStore for MultiTenantedMessageStore {
    fn name(&self) -> &str {
        self.stores.master.name()
    }
}
