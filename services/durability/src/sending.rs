//! Outbound side of the durable pipeline.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use wolverine_id::ANY_NODE;
use wolverine_reconcile::RetryTracker;

use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::store::MessageOutbox;
use crate::transport::Sender;

// =============================================================================
// Retry Queue
// =============================================================================

/// Bounded in-memory queue of envelopes whose send failed.
#[derive(Debug)]
pub struct OutgoingRetryQueue {
    capacity: usize,
    queue: VecDeque<Envelope>,
}

impl OutgoingRetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queues envelopes up to capacity and returns the overflow.
    pub fn enqueue(&mut self, envelopes: impl IntoIterator<Item = Envelope>) -> Vec<Envelope> {
        let mut overflow = Vec::new();
        for envelope in envelopes {
            if self.queue.len() < self.capacity {
                self.queue.push_back(envelope);
            } else {
                overflow.push(envelope);
            }
        }
        overflow
    }

    /// Removes and returns envelopes whose delivery deadline has passed.
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        let (expired, live): (Vec<_>, Vec<_>) =
            self.queue.drain(..).partition(|e| e.is_expired(now));
        self.queue = live.into();
        expired
    }

    pub fn take_all(&mut self) -> Vec<Envelope> {
        self.queue.drain(..).collect()
    }
}

// =============================================================================
// Sending Agent
// =============================================================================

/// Result of handing an envelope to [`DurableSendingAgent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Send failed; the envelope waits in the retry queue or for recovery.
    Queued,
    Expired,
}

/// Store-and-forward sender for one destination.
///
/// After repeated failures the agent latches: sends go straight to the retry
/// queue until a ping succeeds.
pub struct DurableSendingAgent {
    outbox: Arc<dyn MessageOutbox>,
    sender: Arc<dyn Sender>,
    node_number: i32,
    retries: Mutex<OutgoingRetryQueue>,
    failures: Mutex<RetryTracker>,
}

impl DurableSendingAgent {
    pub fn new(
        outbox: Arc<dyn MessageOutbox>,
        sender: Arc<dyn Sender>,
        node_number: i32,
        retry_capacity: usize,
    ) -> Self {
        Self {
            outbox,
            sender,
            node_number,
            retries: Mutex::new(OutgoingRetryQueue::new(retry_capacity)),
            failures: Mutex::new(RetryTracker::default()),
        }
    }

    pub fn destination(&self) -> &str {
        self.sender.destination()
    }

    /// Envelopes waiting in the retry queue.
    pub fn pending(&self) -> usize {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_latched(&self) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_exhausted(self.sender.destination())
    }

    /// Persists the envelope in the outbox owned by this node, then sends it.
    #[instrument(skip(self, envelope), fields(envelope_id = %envelope.id, destination = self.destination()))]
    pub async fn store_and_forward(&self, envelope: Envelope) -> Result<SendOutcome, StoreError> {
        let envelope = Envelope {
            destination: Some(self.sender.destination().to_string()),
            ..envelope
        };
        self.outbox.store_outgoing(&envelope, self.node_number).await?;
        self.forward(envelope).await
    }

    /// Sends an envelope that is already in the outbox.
    pub async fn forward(&self, envelope: Envelope) -> Result<SendOutcome, StoreError> {
        if envelope.is_expired(Utc::now()) {
            debug!(envelope_id = %envelope.id, "discarding expired outgoing envelope");
            self.outbox.delete_outgoing(&envelope).await?;
            return Ok(SendOutcome::Expired);
        }

        if self.is_latched() {
            self.queue_for_retry(vec![envelope]).await?;
            return Ok(SendOutcome::Queued);
        }

        match self.sender.send(&envelope).await {
            Ok(()) => {
                self.outbox.delete_outgoing(&envelope).await?;
                self.record_success();
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                warn!(envelope_id = %envelope.id, destination = self.destination(), error = %e, "send failed");
                self.record_failure();
                self.queue_for_retry(vec![envelope]).await?;
                Ok(SendOutcome::Queued)
            }
        }
    }

    /// Resends queued envelopes. Returns how many were delivered.
    pub async fn retry_pending(&self) -> Result<usize, StoreError> {
        let queued = {
            let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
            if retries.is_empty() {
                return Ok(0);
            }
            retries.take_all()
        };

        if self.is_latched() {
            if !self.sender.ping().await {
                self.queue_for_retry(queued).await?;
                return Ok(0);
            }
            info!(destination = self.destination(), "destination reachable again");
            self.record_success();
        }

        let now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) = queued.into_iter().partition(|e| e.is_expired(now));
        if !expired.is_empty() {
            self.outbox.delete_outgoing_batch(&expired).await?;
        }

        let mut sent = Vec::new();
        let mut failed = Vec::new();
        for envelope in live {
            match self.sender.send(&envelope).await {
                Ok(()) => sent.push(envelope),
                Err(e) => {
                    debug!(envelope_id = %envelope.id, error = %e, "retry send failed");
                    failed.push(envelope);
                }
            }
        }

        if !sent.is_empty() {
            self.outbox.delete_outgoing_batch(&sent).await?;
        }
        if failed.is_empty() {
            self.record_success();
        } else {
            self.record_failure();
            self.queue_for_retry(failed).await?;
        }
        Ok(sent.len())
    }

    /// Queues envelopes. Expired ones are deleted and overflow is released
    /// to `ANY_NODE` for outgoing recovery, in one unit.
    async fn queue_for_retry(&self, envelopes: Vec<Envelope>) -> Result<(), StoreError> {
        let (expired, overflow) = {
            let mut retries = self.retries.lock().unwrap_or_else(PoisonError::into_inner);
            let overflow = retries.enqueue(envelopes);
            (retries.drain_expired(Utc::now()), overflow)
        };

        if expired.is_empty() && overflow.is_empty() {
            return Ok(());
        }
        debug!(
            expired = expired.len(),
            overflow = overflow.len(),
            "discarding and releasing outgoing envelopes"
        );
        self.outbox
            .discard_and_reassign_outgoing(&expired, &overflow, ANY_NODE)
            .await
    }

    fn record_failure(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_failure(self.sender.destination());
    }

    fn record_success(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear(self.sender.destination());
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Sending agents keyed by destination.
#[derive(Default)]
pub struct SendingAgents {
    agents: RwLock<BTreeMap<String, Arc<DurableSendingAgent>>>,
}

impl SendingAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<DurableSendingAgent>) {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.destination().to_string(), agent);
    }

    pub fn find(&self, destination: &str) -> Option<Arc<DurableSendingAgent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<DurableSendingAgent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
