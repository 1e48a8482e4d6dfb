//! Storage and transport error types.

use thiserror::Error;
use wolverine_id::{EnvelopeId, IdError, NodeId};

/// Postgres: unique_violation.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
/// Postgres: foreign_key_violation.
pub(crate) const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Postgres: duplicate_table.
pub(crate) const DUPLICATE_TABLE: &str = "42P07";
/// Postgres: duplicate_object.
pub(crate) const DUPLICATE_OBJECT: &str = "42710";

/// One tenant's failure inside a fanned-out operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantFailure {
    pub tenant_id: String,
    pub message: String,
}

/// Message store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An envelope with this id is already persisted. Callers discard the
    /// second copy.
    #[error("duplicate envelope: {0}")]
    DuplicateEnvelope(EnvelopeId),

    /// Failed to execute a query.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// No store is registered for the tenant.
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    /// Some tenant groups of a bulk operation failed; the others completed.
    #[error("{} tenant store(s) failed", .0.len())]
    TenantFailures(Vec<TenantFailure>),

    /// An operation required an advisory lock this connection does not hold.
    #[error("advisory lock {0} is not held")]
    LockNotHeld(i64),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The node row does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A persisted value could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<IdError> for StoreError {
    fn from(err: IdError) -> Self {
        StoreError::InvalidData(err.to_string())
    }
}

impl StoreError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            StoreError::TenantFailures(_) => true,
            _ => false,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateEnvelope(_))
    }

    /// Maps a unique violation on insert to `DuplicateEnvelope`.
    pub(crate) fn from_insert(err: sqlx::Error, id: EnvelopeId) -> Self {
        if has_code(&err, UNIQUE_VIOLATION) {
            return StoreError::DuplicateEnvelope(id);
        }
        StoreError::Database(err)
    }
}

/// Returns true if `err` is a database error with the given vendor code.
pub(crate) fn has_code(err: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(ref db_err) = err {
        return db_err.code().as_deref() == Some(code);
    }
    false
}

/// Returns true for "already exists" failures raised by idempotent DDL.
pub(crate) fn is_already_exists(err: &sqlx::Error) -> bool {
    has_code(err, DUPLICATE_TABLE) || has_code(err, DUPLICATE_OBJECT)
}

/// Listener, sender and local queue errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The remote endpoint could not be reached.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// The remote endpoint refused the envelope.
    #[error("envelope rejected: {0}")]
    Rejected(String),

    /// The local buffer has no free capacity.
    #[error("local queue is full")]
    QueueFull,

    /// The channel has been shut down.
    #[error("channel closed")]
    Closed,
}
