//! Minimal contracts consumed from the broker collaborator.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::TransportError;

/// Delivers envelopes at least once and takes explicit acknowledgements.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address envelopes arrive on, recorded as `received_at`.
    fn address(&self) -> &str;

    /// Acknowledges the envelope so the broker stops redelivering it.
    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Returns the envelope to the broker for later redelivery.
    async fn defer(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Sends envelopes to one destination.
#[async_trait]
pub trait Sender: Send + Sync {
    fn destination(&self) -> &str;

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Returns true if the destination is reachable.
    async fn ping(&self) -> bool;
}

/// In-process work queue that handlers drain.
pub trait LocalQueue: Send + Sync {
    /// Free buffer slots. Recovery never claims more than this.
    fn free_capacity(&self) -> usize;

    fn enqueue(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Bounded local queue on a tokio channel.
#[derive(Debug, Clone)]
pub struct BufferedLocalQueue {
    tx: mpsc::Sender<Envelope>,
}

impl BufferedLocalQueue {
    /// Creates the queue and the receiving half handlers read from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl LocalQueue for BufferedLocalQueue {
    fn free_capacity(&self) -> usize {
        self.tx.capacity()
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}
