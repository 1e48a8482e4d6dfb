//! Wolverine durability
//!
//! Durable inbox and outbox storage for the message bus, with the jobs that
//! keep it draining when nodes crash.
//!
//! ## Modules
//!
//! - `store`: storage contracts plus the in-memory and PostgreSQL backends
//! - `receiver` / `sending`: persist-then-ack receive and store-and-forward send
//! - `recovery`: orphan recovery, scheduled dispatch, handled sweeping and
//!   dead-letter replay, driven by [`DurabilityWorker`]
//! - `tenancy`: routing to per-tenant databases
//!
//! Envelope ownership is an integer node number; [`wolverine_id::ANY_NODE`]
//! means any node may claim the row.

pub mod config;
pub mod envelope;
pub mod error;
pub mod receiver;
pub mod recovery;
pub mod sending;
pub mod store;
pub mod tenancy;
pub mod transport;

pub use config::{DbConfig, DurabilitySettings};
pub use envelope::{
    DeadLetterEnvelope, DeadLetterQuery, DeadLetterSummary, Envelope, EnvelopeStatus,
    ExceptionInfo, PersistedCounts,
};
pub use error::{StoreError, TenantFailure, TransportError};
pub use receiver::{DurableReceiver, FailureOutcome, ReceiveOutcome};
pub use recovery::{DurabilityJob, DurabilityWorker, JobReport};
pub use sending::{DurableSendingAgent, SendOutcome, SendingAgents};
pub use store::{
    AdvisoryLock, DeadLetters, InMemoryMessageStore, MessageInbox, MessageOutbox, MessageStore,
    MessageStoreAdmin, NodeAgentPersistence, PostgresMessageStore,
};
pub use tenancy::{MultiTenantedMessageStore, RetryBlock, TenantedMessageStores};
pub use transport::{BufferedLocalQueue, Listener, LocalQueue, Sender};
