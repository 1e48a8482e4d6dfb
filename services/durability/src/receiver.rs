//! Inbound side of the durable pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use wolverine_id::ANY_NODE;

use crate::config::DurabilitySettings;
use crate::envelope::{Envelope, EnvelopeStatus, ExceptionInfo};
use crate::error::StoreError;
use crate::store::MessageInbox;
use crate::transport::{Listener, LocalQueue};

/// What happened to an envelope handed to [`DurableReceiver::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Persisted and queued locally.
    Accepted,
    /// Persisted, but the local queue was full; recovery will pick it up.
    Buffered,
    /// Already persisted by an earlier delivery; discarded.
    Duplicate,
    /// The delivery deadline had passed; discarded.
    Expired,
}

/// What happened to a failed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled(DateTime<Utc>),
    DeadLettered,
}

/// Persists inbound envelopes before acknowledging the listener.
pub struct DurableReceiver {
    inbox: Arc<dyn MessageInbox>,
    queue: Arc<dyn LocalQueue>,
    node_number: i32,
    settings: DurabilitySettings,
}

impl DurableReceiver {
    pub fn new(
        inbox: Arc<dyn MessageInbox>,
        queue: Arc<dyn LocalQueue>,
        node_number: i32,
        settings: DurabilitySettings,
    ) -> Self {
        Self {
            inbox,
            queue,
            node_number,
            settings,
        }
    }

    #[instrument(skip(self, listener, envelope), fields(envelope_id = %envelope.id, listener = listener.address()))]
    pub async fn receive(
        &self,
        listener: &dyn Listener,
        mut envelope: Envelope,
    ) -> Result<ReceiveOutcome, StoreError> {
        if envelope.is_expired(Utc::now()) {
            debug!("discarding expired envelope");
            ack(listener, &envelope).await;
            return Ok(ReceiveOutcome::Expired);
        }

        envelope.status = EnvelopeStatus::Incoming;
        envelope.owner_id = self.node_number;
        envelope
            .received_at
            .get_or_insert_with(|| listener.address().to_string());

        match self.inbox.store_incoming(&envelope).await {
            Ok(()) => {}
            Err(StoreError::DuplicateEnvelope(id)) => {
                debug!(envelope_id = %id, "discarding duplicate envelope");
                ack(listener, &envelope).await;
                return Ok(ReceiveOutcome::Duplicate);
            }
            Err(e) => {
                if let Err(defer_err) = listener.defer(&envelope).await {
                    warn!(error = %defer_err, "failed to defer envelope");
                }
                return Err(e);
            }
        }

        ack(listener, &envelope).await;

        if let Err(e) = self.queue.enqueue(envelope.clone()) {
            warn!(error = %e, "local queue rejected envelope; releasing ownership");
            self.inbox
                .reassign_incoming(ANY_NODE, std::slice::from_ref(&envelope))
                .await?;
            return Ok(ReceiveOutcome::Buffered);
        }
        Ok(ReceiveOutcome::Accepted)
    }

    /// Marks a successfully handled envelope.
    pub async fn complete(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.inbox.mark_incoming_envelope_as_handled(envelope).await
    }

    /// Records a handler failure. Reschedules with backoff until
    /// `max_incoming_attempts` is reached, then dead-letters.
    #[instrument(skip(self, envelope, exception), fields(envelope_id = %envelope.id))]
    pub async fn fail(
        &self,
        mut envelope: Envelope,
        exception: ExceptionInfo,
    ) -> Result<FailureOutcome, StoreError> {
        envelope.attempts += 1;
        self.inbox
            .increment_incoming_envelope_attempts(&envelope)
            .await?;

        if envelope.attempts >= self.settings.max_incoming_attempts {
            warn!(
                attempts = envelope.attempts,
                exception_type = %exception.exception_type,
                "moving envelope to dead letter storage"
            );
            self.inbox
                .move_to_dead_letter_storage(&envelope, &exception)
                .await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        let attempt = u32::try_from(envelope.attempts - 1).unwrap_or(0);
        let delay = self.settings.retry_backoff.delay(attempt);
        let at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        envelope.scheduled_time = Some(at);
        self.inbox.schedule_execution(&envelope).await?;

        debug!(attempts = envelope.attempts, retry_at = %at, "rescheduled failed envelope");
        Ok(FailureOutcome::Rescheduled(at))
    }

    /// Gives up ownership so any node may claim the envelope.
    pub async fn defer(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.inbox
            .reassign_incoming(ANY_NODE, std::slice::from_ref(envelope))
            .await
    }
}

async fn ack(listener: &dyn Listener, envelope: &Envelope) {
    if let Err(e) = listener.complete(envelope).await {
        warn!(envelope_id = %envelope.id, error = %e, "failed to acknowledge envelope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMessageStore, MessageStoreAdmin, DeadLetters};
    use crate::transport::stubs::StubListener;
    use crate::transport::BufferedLocalQueue;
    use wolverine_reconcile::BackoffPolicy;

    fn receiver(store: &InMemoryMessageStore, capacity: usize) -> (DurableReceiver, tokio::sync::mpsc::Receiver<Envelope>) {
        let (queue, rx) = BufferedLocalQueue::new(capacity);
        let settings = DurabilitySettings {
            retry_backoff: BackoffPolicy::immediate(),
            ..Default::default()
        };
        (
            DurableReceiver::new(Arc::new(store.clone()), Arc::new(queue), 1, settings),
            rx,
        )
    }

    #[tokio::test]
    async fn test_receive_persists_then_acks() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, mut rx) = receiver(&store, 10);
        let listener = StubListener::default();
        let envelope = Envelope::new("Ping", vec![]);

        let outcome = receiver.receive(&listener, envelope.clone()).await.unwrap();

        assert_eq!(outcome, ReceiveOutcome::Accepted);
        assert_eq!(listener.completed.lock().unwrap().as_slice(), &[envelope.id]);
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.owner_id, 1);
        assert_eq!(queued.received_at.as_deref(), Some("stub://listener"));
    }

    #[tokio::test]
    async fn test_redelivery_is_discarded() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, mut rx) = receiver(&store, 10);
        let listener = StubListener::default();
        let envelope = Envelope::new("Ping", vec![]);

        receiver.receive(&listener, envelope.clone()).await.unwrap();
        let outcome = receiver.receive(&listener, envelope.clone()).await.unwrap();

        assert_eq!(outcome, ReceiveOutcome::Duplicate);
        assert_eq!(listener.completed.lock().unwrap().len(), 2);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.fetch_counts().await.unwrap().incoming, 1);
    }

    #[tokio::test]
    async fn test_full_queue_releases_ownership() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, _rx) = receiver(&store, 1);
        let listener = StubListener::default();

        receiver.receive(&listener, Envelope::new("Ping", vec![])).await.unwrap();
        let outcome = receiver
            .receive(&listener, Envelope::new("Ping", vec![]))
            .await
            .unwrap();

        assert_eq!(outcome, ReceiveOutcome::Buffered);
        let unowned = store
            .all_incoming()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.owner_id == ANY_NODE)
            .count();
        assert_eq!(unowned, 1);
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, mut rx) = receiver(&store, 10);
        let listener = StubListener::default();
        receiver.receive(&listener, Envelope::new("Ping", vec![])).await.unwrap();
        let mut envelope = rx.try_recv().unwrap();

        for attempt in 1..3 {
            let outcome = receiver
                .fail(envelope.clone(), ExceptionInfo::new("Boom", "failed"))
                .await
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::Rescheduled(_)));

            let row = store.all_incoming().await.unwrap().remove(0);
            assert_eq!(row.status, EnvelopeStatus::Scheduled);
            assert_eq!(row.attempts, attempt);

            // Simulate the poller handing it back to this node.
            envelope = store.claim_scheduled_due(1, Utc::now(), 10).await.unwrap().remove(0);
        }

        let outcome = receiver
            .fail(envelope, ExceptionInfo::new("Boom", "failed"))
            .await
            .unwrap();

        assert_eq!(outcome, FailureOutcome::DeadLettered);
        let counts = store.fetch_counts().await.unwrap();
        assert_eq!(counts.incoming + counts.scheduled, 0);
        assert_eq!(counts.dead_letter, 1);
        assert_eq!(store.summarize_dead_letters().await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn test_complete_marks_handled() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, mut rx) = receiver(&store, 10);
        let listener = StubListener::default();
        receiver.receive(&listener, Envelope::new("Ping", vec![])).await.unwrap();

        receiver.complete(&rx.try_recv().unwrap()).await.unwrap();

        assert_eq!(store.fetch_counts().await.unwrap().handled, 1);
    }

    #[tokio::test]
    async fn test_expired_envelope_is_acked_and_dropped() {
        let store = InMemoryMessageStore::new("master");
        let (receiver, _rx) = receiver(&store, 10);
        let listener = StubListener::default();
        let envelope = Envelope::new("Ping", vec![]).deliver_by(Utc::now() - chrono::Duration::seconds(5));

        let outcome = receiver.receive(&listener, envelope).await.unwrap();

        assert_eq!(outcome, ReceiveOutcome::Expired);
        assert_eq!(store.fetch_counts().await.unwrap().incoming, 0);
    }
}
