//! Per-node scavengers that keep the durable store draining.
//!
//! Each job does one bounded pass per call. [`DurabilityWorker`] schedules
//! them and re-runs a job immediately while it reports a full page.

mod worker;

pub use worker::DurabilityWorker;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use wolverine_id::ANY_NODE;

use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::sending::SendingAgents;
use crate::store::{DeadLetters, MessageInbox, MessageOutbox, MessageStoreAdmin};
use crate::transport::LocalQueue;

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub processed: usize,
    /// A full page was handled; more work is probably waiting.
    pub should_retrigger: bool,
}

impl JobReport {
    fn page(processed: usize, page_size: usize) -> Self {
        Self {
            processed,
            should_retrigger: page_size > 0 && processed >= page_size,
        }
    }
}

#[async_trait]
pub trait DurabilityJob: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<JobReport, StoreError>;
}

/// Enqueues claimed envelopes and releases the ones the queue rejected.
async fn enqueue_claimed(
    inbox: &dyn MessageInbox,
    queue: &dyn LocalQueue,
    claimed: Vec<Envelope>,
) -> Result<usize, StoreError> {
    let mut rejected = Vec::new();
    let mut accepted = 0;
    for envelope in claimed {
        if rejected.is_empty() {
            match queue.enqueue(envelope.clone()) {
                Ok(()) => {
                    accepted += 1;
                    continue;
                }
                Err(e) => debug!(error = %e, "local queue rejected recovered envelope"),
            }
        }
        rejected.push(envelope);
    }

    if !rejected.is_empty() {
        inbox.reassign_incoming(ANY_NODE, &rejected).await?;
    }
    Ok(accepted)
}

// =============================================================================
// Incoming
// =============================================================================

/// Claims incoming envelopes orphaned by crashed nodes.
pub struct IncomingRecovery {
    inbox: Arc<dyn MessageInbox>,
    queue: Arc<dyn LocalQueue>,
    node_number: i32,
    batch_size: usize,
}

impl IncomingRecovery {
    pub fn new(
        inbox: Arc<dyn MessageInbox>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        batch_size: usize,
    ) -> Self {
        Self {
            inbox,
            queue,
            node_number,
            batch_size,
        }
    }
}

#[async_trait]
impl DurabilityJob for IncomingRecovery {
    fn name(&self) -> &'static str {
        "incoming-recovery"
    }

    async fn run_once(&self) -> Result<JobReport, StoreError> {
        let page_size = self.queue.free_capacity().min(self.batch_size);
        if page_size == 0 {
            return Ok(JobReport::default());
        }

        let claimed = self
            .inbox
            .claim_orphaned_incoming(self.node_number, page_size)
            .await?;
        let count = claimed.len();
        if count > 0 {
            info!(count, node_number = self.node_number, "recovered orphaned incoming envelopes");
        }
        enqueue_claimed(self.inbox.as_ref(), self.queue.as_ref(), claimed).await?;
        Ok(JobReport::page(count, page_size))
    }
}

// =============================================================================
// Scheduled
// =============================================================================

/// Dispatches due scheduled envelopes on the node holding the scheduled-job lock.
pub struct ScheduledJobPoller {
    inbox: Arc<dyn MessageInbox>,
    queue: Arc<dyn LocalQueue>,
    node_number: i32,
    batch_size: usize,
}

impl ScheduledJobPoller {
    pub fn new(
        inbox: Arc<dyn MessageInbox>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        batch_size: usize,
    ) -> Self {
        Self {
            inbox,
            queue,
            node_number,
            batch_size,
        }
    }
}

#[async_trait]
impl DurabilityJob for ScheduledJobPoller {
    fn name(&self) -> &'static str {
        "scheduled-jobs"
    }

    async fn run_once(&self) -> Result<JobReport, StoreError> {
        let page_size = self.queue.free_capacity().min(self.batch_size);
        if page_size == 0 {
            return Ok(JobReport::default());
        }

        let due = self
            .inbox
            .claim_scheduled_due(self.node_number, Utc::now(), page_size)
            .await?;
        let count = due.len();
        if count > 0 {
            debug!(count, "dispatching scheduled envelopes");
        }
        enqueue_claimed(self.inbox.as_ref(), self.queue.as_ref(), due).await?;
        Ok(JobReport::page(count, page_size))
    }
}

// =============================================================================
// Outgoing
// =============================================================================

/// Claims orphaned outgoing envelopes and hands them to the sending agents.
pub struct OutgoingRecovery {
    outbox: Arc<dyn MessageOutbox>,
    senders: Arc<SendingAgents>,
    node_number: i32,
    batch_size: usize,
}

impl OutgoingRecovery {
    pub fn new(
        outbox: Arc<dyn MessageOutbox>,
        senders: Arc<SendingAgents>,
        node_number: i32,
        batch_size: usize,
    ) -> Self {
        Self {
            outbox,
            senders,
            node_number,
            batch_size,
        }
    }
}

#[async_trait]
impl DurabilityJob for OutgoingRecovery {
    fn name(&self) -> &'static str {
        "outgoing-recovery"
    }

    async fn run_once(&self) -> Result<JobReport, StoreError> {
        let claimed = self
            .outbox
            .claim_orphaned_outgoing(self.node_number, self.batch_size)
            .await?;

        let now = Utc::now();
        let mut handled = 0;
        let mut expired = Vec::new();
        let mut released = Vec::new();
        let mut first_error = None;
        for envelope in claimed {
            if envelope.is_expired(now) {
                expired.push(envelope);
                handled += 1;
                continue;
            }
            let agent = envelope
                .destination
                .as_deref()
                .and_then(|destination| self.senders.find(destination));
            let Some(agent) = agent else {
                released.push(envelope);
                continue;
            };
            // A failed forward still leaves the row claimed by this node.
            match agent.forward(envelope.clone()).await {
                Ok(_) => handled += 1,
                Err(e) => {
                    warn!(envelope_id = %envelope.id, error = %e, "failed to forward recovered envelope");
                    released.push(envelope);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !released.is_empty() {
            warn!(count = released.len(), "releasing recovered envelopes that were not forwarded");
        }
        if !expired.is_empty() || !released.is_empty() {
            self.outbox
                .discard_and_reassign_outgoing(&expired, &released, ANY_NODE)
                .await?;
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        for agent in self.senders.all() {
            agent.retry_pending().await?;
        }
        // Released rows are claimable again at once; they never count
        // toward a full page.
        Ok(JobReport::page(handled, self.batch_size))
    }
}

// =============================================================================
// Handled sweep
// =============================================================================

/// Purges handled incoming rows past their keep-until.
pub struct HandledSweeper {
    admin: Arc<dyn MessageStoreAdmin>,
    batch_size: usize,
}

impl HandledSweeper {
    pub fn new(admin: Arc<dyn MessageStoreAdmin>, batch_size: usize) -> Self {
        Self { admin, batch_size }
    }
}

#[async_trait]
impl DurabilityJob for HandledSweeper {
    fn name(&self) -> &'static str {
        "handled-sweep"
    }

    async fn run_once(&self) -> Result<JobReport, StoreError> {
        let deleted = self
            .admin
            .delete_expired_handled(Utc::now(), self.batch_size)
            .await?;
        let deleted = usize::try_from(deleted).unwrap_or(usize::MAX);
        if deleted > 0 {
            debug!(deleted, "purged handled envelopes");
        }
        Ok(JobReport::page(deleted, self.batch_size))
    }
}

// =============================================================================
// Dead letter replay
// =============================================================================

/// Moves dead letters marked replayable back into the inbox.
pub struct DeadLetterReplay {
    dead_letters: Arc<dyn DeadLetters>,
    batch_size: usize,
}

impl DeadLetterReplay {
    pub fn new(dead_letters: Arc<dyn DeadLetters>, batch_size: usize) -> Self {
        Self {
            dead_letters,
            batch_size,
        }
    }
}

#[async_trait]
impl DurabilityJob for DeadLetterReplay {
    fn name(&self) -> &'static str {
        "dead-letter-replay"
    }

    async fn run_once(&self) -> Result<JobReport, StoreError> {
        let replayed = self.dead_letters.replay_dead_letters(self.batch_size).await?;
        let replayed = usize::try_from(replayed).unwrap_or(usize::MAX);
        if replayed > 0 {
            info!(replayed, "replayed dead letters");
        }
        Ok(JobReport::page(replayed, self.batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeStatus, ExceptionInfo};
    use crate::sending::DurableSendingAgent;
    use crate::store::{AdvisoryLock, InMemoryMessageStore};
    use crate::transport::stubs::StubSender;
    use crate::transport::BufferedLocalQueue;

    fn orphans(n: usize) -> Vec<Envelope> {
        (0..n).map(|_| Envelope::new("Ping", vec![])).collect()
    }

    #[tokio::test]
    async fn test_incoming_recovery_pages_by_free_capacity() {
        let store = InMemoryMessageStore::new("master");
        store.store_incoming_batch(&orphans(5)).await.unwrap();
        let (queue, mut rx) = BufferedLocalQueue::new(3);
        let job = IncomingRecovery::new(Arc::new(store.clone()), Arc::new(queue), 2, 100);

        let report = job.run_once().await.unwrap();
        assert_eq!(report.processed, 3);
        assert!(report.should_retrigger);

        // Queue is full now.
        assert_eq!(job.run_once().await.unwrap(), JobReport::default());

        while rx.try_recv().is_ok() {}
        let report = job.run_once().await.unwrap();
        assert_eq!(report.processed, 2);
        assert!(!report.should_retrigger);

        let incoming = store.all_incoming().await.unwrap();
        assert!(incoming.iter().all(|e| e.owner_id == 2));
    }

    #[tokio::test]
    async fn test_two_recovery_passes_never_double_claim() {
        let store = InMemoryMessageStore::new("master");
        store.store_incoming_batch(&orphans(20)).await.unwrap();
        let (queue_a, mut rx_a) = BufferedLocalQueue::new(100);
        let (queue_b, mut rx_b) = BufferedLocalQueue::new(100);
        let a = IncomingRecovery::new(Arc::new(store.connect()), Arc::new(queue_a), 1, 7);
        let b = IncomingRecovery::new(Arc::new(store.connect()), Arc::new(queue_b), 2, 7);

        loop {
            let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
            if ra.unwrap().processed + rb.unwrap().processed == 0 {
                break;
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        while let Ok(e) = rx_a.try_recv() {
            assert!(seen.insert(e.id));
        }
        while let Ok(e) = rx_b.try_recv() {
            assert!(seen.insert(e.id));
        }
        assert_eq!(seen.len(), 20);
        assert!(store
            .all_incoming()
            .await
            .unwrap()
            .iter()
            .all(|e| e.owner_id != ANY_NODE));
    }

    #[tokio::test]
    async fn test_scheduled_poller_only_runs_without_contention() {
        let store = InMemoryMessageStore::new("master");
        let other = store.connect();
        store
            .schedule_job(&Envelope::new("Ping", vec![]).scheduled_for(Utc::now()))
            .await
            .unwrap();
        let (queue, mut rx) = BufferedLocalQueue::new(10);
        let poller = ScheduledJobPoller::new(Arc::new(store.clone()), Arc::new(queue), 1, 10);

        let lock_id = store.settings().scheduled_job_lock_id;
        assert!(other.try_attain_lock(lock_id).await.unwrap());
        assert_eq!(poller.run_once().await.unwrap().processed, 0);

        other.release_lock(lock_id).await.unwrap();
        assert_eq!(poller.run_once().await.unwrap().processed, 1);
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Incoming);
        assert_eq!(envelope.owner_id, 1);
    }

    #[tokio::test]
    async fn test_outgoing_recovery_forwards_and_discards() {
        let store = InMemoryMessageStore::new("master");
        let live = Envelope::new("Ping", vec![]).with_destination("tcp://remote");
        let expired = Envelope::new("Ping", vec![])
            .with_destination("tcp://remote")
            .deliver_by(Utc::now() - chrono::Duration::seconds(1));
        let unroutable = Envelope::new("Ping", vec![]).with_destination("tcp://nowhere");
        for envelope in [&live, &expired, &unroutable] {
            store.store_outgoing(envelope, ANY_NODE).await.unwrap();
        }

        let sender = Arc::new(StubSender::new("tcp://remote"));
        let senders = Arc::new(SendingAgents::new());
        senders.register(Arc::new(DurableSendingAgent::new(
            Arc::new(store.clone()),
            sender.clone(),
            1,
            10,
        )));
        let job = OutgoingRecovery::new(Arc::new(store.clone()), senders, 1, 10);

        let report = job.run_once().await.unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(sender.sent.lock().unwrap().as_slice(), &[live.id]);
        let remaining = store.all_outgoing().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, unroutable.id);
        assert_eq!(remaining[0].owner_id, ANY_NODE);
    }

    /// Outbox whose deletes always fail.
    struct UndeletableOutbox(InMemoryMessageStore);

    #[async_trait]
    impl MessageOutbox for UndeletableOutbox {
        async fn load_outgoing(&self, destination: &str) -> Result<Vec<Envelope>, StoreError> {
            self.0.load_outgoing(destination).await
        }

        async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<(), StoreError> {
            self.0.store_outgoing(envelope, owner_id).await
        }

        async fn delete_outgoing(&self, _envelope: &Envelope) -> Result<(), StoreError> {
            Err(StoreError::InvalidData("outbox is read-only".into()))
        }

        async fn delete_outgoing_batch(&self, _envelopes: &[Envelope]) -> Result<(), StoreError> {
            Err(StoreError::InvalidData("outbox is read-only".into()))
        }

        async fn discard_and_reassign_outgoing(
            &self,
            discards: &[Envelope],
            reassigned: &[Envelope],
            owner_id: i32,
        ) -> Result<(), StoreError> {
            self.0
                .discard_and_reassign_outgoing(discards, reassigned, owner_id)
                .await
        }

        async fn claim_orphaned_outgoing(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
            self.0.claim_orphaned_outgoing(owner_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_outgoing_recovery_releases_envelopes_after_store_error() {
        let store = InMemoryMessageStore::new("master");
        for _ in 0..3 {
            let envelope = Envelope::new("Ping", vec![]).with_destination("tcp://remote");
            store.store_outgoing(&envelope, ANY_NODE).await.unwrap();
        }
        let outbox = Arc::new(UndeletableOutbox(store.clone()));
        let sender = Arc::new(StubSender::new("tcp://remote"));
        let senders = Arc::new(SendingAgents::new());
        senders.register(Arc::new(DurableSendingAgent::new(
            outbox.clone(),
            sender.clone(),
            1,
            10,
        )));
        let job = OutgoingRecovery::new(outbox, senders, 1, 10);

        let err = job.run_once().await.unwrap_err();

        assert!(matches!(err, StoreError::InvalidData(_)));
        assert_eq!(sender.sent.lock().unwrap().len(), 3);
        let remaining = store.all_outgoing().await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|e| e.owner_id == ANY_NODE));
    }

    #[tokio::test]
    async fn test_full_page_of_unroutable_envelopes_does_not_retrigger() {
        let store = InMemoryMessageStore::new("master");
        for _ in 0..4 {
            let envelope = Envelope::new("Ping", vec![]).with_destination("tcp://nowhere");
            store.store_outgoing(&envelope, ANY_NODE).await.unwrap();
        }
        let job = OutgoingRecovery::new(
            Arc::new(store.clone()),
            Arc::new(SendingAgents::new()),
            1,
            4,
        );

        let report = job.run_once().await.unwrap();

        assert_eq!(report, JobReport::default());
        assert!(store
            .all_outgoing()
            .await
            .unwrap()
            .iter()
            .all(|e| e.owner_id == ANY_NODE));
    }

    #[tokio::test]
    async fn test_handled_sweeper() {
        let store = InMemoryMessageStore::with_settings(
            "master",
            crate::config::DurabilitySettings {
                keep_after_message_handling: std::time::Duration::ZERO,
                ..Default::default()
            },
        );
        let envelopes = orphans(3);
        store.store_incoming_batch(&envelopes).await.unwrap();
        store.mark_incoming_envelopes_as_handled(&envelopes).await.unwrap();

        let report = HandledSweeper::new(Arc::new(store.clone()), 2).run_once().await.unwrap();
        assert_eq!(report, JobReport { processed: 2, should_retrigger: true });

        let report = HandledSweeper::new(Arc::new(store.clone()), 2).run_once().await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(!report.should_retrigger);
    }

    #[tokio::test]
    async fn test_dead_letter_replay() {
        let store = InMemoryMessageStore::new("master");
        let envelope = Envelope::new("Ping", vec![]);
        store.store_incoming(&envelope).await.unwrap();
        store
            .move_to_dead_letter_storage(&envelope, &ExceptionInfo::new("Boom", "failed"))
            .await
            .unwrap();
        store.mark_dead_letters_for_replay(&[envelope.id]).await.unwrap();

        let report = DeadLetterReplay::new(Arc::new(store.clone()), 10).run_once().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(store.fetch_counts().await.unwrap().incoming, 1);
    }
}
