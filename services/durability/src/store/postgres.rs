//! Postgres message store.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use wolverine_events::{
    AgentRestriction, AgentRestrictions, NodeRegistration, RestrictionType, WolverineNode,
};
use wolverine_id::{AgentUri, EnvelopeId, NodeId, NodeNumber, RestrictionId, ANY_NODE, LEADER_URI};

use super::{
    AdvisoryLock, DeadLetters, MessageInbox, MessageOutbox, MessageStore, MessageStoreAdmin,
    NodeAgentPersistence,
};
use crate::config::{DbConfig, DurabilitySettings};
use crate::envelope::{
    DeadLetterEnvelope, DeadLetterQuery, DeadLetterSummary, Envelope, EnvelopeStatus,
    ExceptionInfo, PersistedCounts,
};
use crate::error::{has_code, is_already_exists, StoreError, FOREIGN_KEY_VIOLATION};

macro_rules! envelope_columns {
    () => {
        "id, status, owner_id, destination, received_at, source, scheduled_time, attempts, \
         message_type, body, keep_until, deliver_by, sent_at, tenant_id"
    };
}

macro_rules! insert_envelope_sql {
    ($table:literal) => {
        concat!(
            "INSERT INTO ",
            $table,
            " (",
            envelope_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        )
    };
}

// =============================================================================
// Row mapping
// =============================================================================

impl<'r> FromRow<'r, PgRow> for Envelope {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = EnvelopeStatus::parse(&status)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown envelope status: {status}").into()))?;
        let id: Uuid = row.try_get("id")?;

        Ok(Self {
            id: EnvelopeId::from_uuid(id),
            status,
            owner_id: row.try_get("owner_id")?,
            destination: row.try_get("destination")?,
            received_at: row.try_get("received_at")?,
            source: row.try_get("source")?,
            scheduled_time: row.try_get("scheduled_time")?,
            attempts: row.try_get("attempts")?,
            message_type: row.try_get("message_type")?,
            data: row.try_get("body")?,
            keep_until: row.try_get("keep_until")?,
            deliver_by: row.try_get("deliver_by")?,
            sent_at: row.try_get("sent_at")?,
            tenant_id: row.try_get("tenant_id")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for DeadLetterEnvelope {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            envelope: Envelope::from_row(row)?,
            exception: ExceptionInfo {
                exception_type: row.try_get("exception_type")?,
                message: row.try_get("exception_message")?,
            },
            replayable: row.try_get("replayable")?,
        })
    }
}

struct NodeRow {
    id: Uuid,
    node_number: i32,
    description: String,
    control_uri: String,
    capabilities: Json<Vec<AgentUri>>,
    version: String,
    started: DateTime<Utc>,
    last_health_check: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_number: row.try_get("node_number")?,
            description: row.try_get("description")?,
            control_uri: row.try_get("control_uri")?,
            capabilities: row.try_get("capabilities")?,
            version: row.try_get("version")?,
            started: row.try_get("started")?,
            last_health_check: row.try_get("last_health_check")?,
        })
    }
}

impl NodeRow {
    fn into_node(self) -> Result<WolverineNode, StoreError> {
        Ok(WolverineNode {
            node_id: NodeId::from_uuid(self.id),
            assigned_node_number: NodeNumber::new(self.node_number)?,
            description: self.description,
            control_uri: self.control_uri,
            capabilities: self.capabilities.0.into_iter().collect(),
            active_agents: Default::default(),
            started: self.started,
            last_health_check: self.last_health_check,
            version: self.version,
        })
    }
}

fn restriction_from_row(row: &PgRow) -> Result<AgentRestriction, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let uri: String = row.try_get("uri")?;
    let restriction_type: String = row.try_get("restriction_type")?;
    Ok(AgentRestriction {
        id: RestrictionId::from_uuid(id),
        agent_uri: AgentUri::parse(&uri)?,
        restriction_type: RestrictionType::parse(&restriction_type).ok_or_else(|| {
            StoreError::InvalidData(format!("unknown restriction type: {restriction_type}"))
        })?,
        node_number: row.try_get("node_number")?,
    })
}

fn ids(envelopes: &[Envelope]) -> Vec<Uuid> {
    envelopes.iter().map(|e| e.id.uuid()).collect()
}

fn page(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// =============================================================================
// Advisory locks
// =============================================================================

#[derive(Default)]
struct LockSession {
    conn: Option<PgConnection>,
    held: HashSet<i64>,
}

/// Session-level advisory locks on one dedicated connection, so they are
/// released by the server when the process dies.
struct PgAdvisoryLock {
    pool: PgPool,
    session: Mutex<LockSession>,
}

impl PgAdvisoryLock {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: Mutex::new(LockSession::default()),
        }
    }

    async fn has_lock(&self, lock_id: i64) -> bool {
        self.session.lock().await.held.contains(&lock_id)
    }

    async fn try_attain(&self, lock_id: i64) -> Result<bool, StoreError> {
        let mut session = self.session.lock().await;
        if session.held.contains(&lock_id) {
            return Ok(true);
        }

        let conn = match session.conn.take() {
            Some(conn) => conn,
            None => self.pool.acquire().await?.detach(),
        };
        let session = &mut *session;
        let conn = session.conn.insert(conn);

        let attained = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await;

        match attained {
            Ok(true) => {
                session.held.insert(lock_id);
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                // The server drops session locks with the connection.
                session.conn = None;
                session.held.clear();
                Err(e.into())
            }
        }
    }

    async fn release(&self, lock_id: i64) -> Result<(), StoreError> {
        let mut session = self.session.lock().await;
        if !session.held.remove(&lock_id) {
            return Ok(());
        }
        let Some(conn) = session.conn.as_mut() else {
            return Ok(());
        };

        let result = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(&mut *conn)
            .await;

        if let Err(e) = result {
            session.conn = None;
            session.held.clear();
            return Err(e.into());
        }
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Message store backed by one Postgres database.
#[derive(Clone)]
pub struct PostgresMessageStore {
    name: String,
    pool: PgPool,
    settings: Arc<DurabilitySettings>,
    locks: Arc<PgAdvisoryLock>,
}

impl std::fmt::Debug for PostgresMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresMessageStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PostgresMessageStore {
    /// Create a new connection pool and store.
    pub async fn connect(
        name: impl Into<String>,
        config: &DbConfig,
        settings: DurabilitySettings,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        info!(
            store = %name,
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await?;

        Ok(Self::from_pool(name, pool, settings))
    }

    pub fn from_pool(name: impl Into<String>, pool: PgPool, settings: DurabilitySettings) -> Self {
        Self {
            name: name.into(),
            locks: Arc::new(PgAdvisoryLock::new(pool.clone())),
            pool,
            settings: Arc::new(settings),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &DurabilitySettings {
        &self.settings
    }

    /// Takes a transaction-scoped advisory lock unless this store already
    /// holds the session-level lock for the same id.
    async fn try_xact_lock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        lock_id: i64,
    ) -> Result<bool, StoreError> {
        if self.locks.has_lock(lock_id).await {
            return Ok(true);
        }
        let attained = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(attained)
    }

    async fn delete_node_in(
        tx: &mut Transaction<'_, Postgres>,
        node_id: &NodeId,
    ) -> Result<(), StoreError> {
        let number: Option<i32> =
            sqlx::query_scalar("DELETE FROM wolverine_nodes WHERE id = $1 RETURNING node_number")
                .bind(node_id.uuid())
                .fetch_optional(&mut **tx)
                .await?;

        if let Some(number) = number {
            sqlx::query("UPDATE wolverine_incoming_envelopes SET owner_id = $2 WHERE owner_id = $1")
                .bind(number)
                .bind(ANY_NODE)
                .execute(&mut **tx)
                .await?;
            sqlx::query("UPDATE wolverine_outgoing_envelopes SET owner_id = $2 WHERE owner_id = $1")
                .bind(number)
                .bind(ANY_NODE)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn attach_agents(&self, mut nodes: Vec<WolverineNode>) -> Result<Vec<WolverineNode>, StoreError> {
        let rows = sqlx::query("SELECT id, node_id FROM wolverine_node_assignments")
            .fetch_all(&self.pool)
            .await?;

        let mut by_node: BTreeMap<NodeId, Vec<AgentUri>> = BTreeMap::new();
        for row in rows {
            let uri: String = row.try_get("id")?;
            let node_id: Uuid = row.try_get("node_id")?;
            by_node
                .entry(NodeId::from_uuid(node_id))
                .or_default()
                .push(AgentUri::parse(&uri)?);
        }

        for node in &mut nodes {
            if let Some(agents) = by_node.remove(&node.node_id) {
                node.active_agents.extend(agents);
            }
        }
        Ok(nodes)
    }
}

async fn insert_incoming(
    conn: &mut PgConnection,
    envelope: &Envelope,
    status: EnvelopeStatus,
    owner_id: i32,
) -> Result<(), StoreError> {
    bind_envelope(
        sqlx::query(insert_envelope_sql!("wolverine_incoming_envelopes")),
        envelope,
        status,
        owner_id,
    )
    .execute(conn)
    .await
    .map_err(|e| StoreError::from_insert(e, envelope.id))?;
    Ok(())
}

fn bind_envelope<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    envelope: &'q Envelope,
    status: EnvelopeStatus,
    owner_id: i32,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(envelope.id.uuid())
        .bind(status.as_str())
        .bind(owner_id)
        .bind(&envelope.destination)
        .bind(&envelope.received_at)
        .bind(&envelope.source)
        .bind(envelope.scheduled_time)
        .bind(envelope.attempts)
        .bind(&envelope.message_type)
        .bind(&envelope.data)
        .bind(envelope.keep_until)
        .bind(envelope.deliver_by)
        .bind(envelope.sent_at)
        .bind(&envelope.tenant_id)
}

// =============================================================================
// Inbox
// =============================================================================

#[async_trait]
impl MessageInbox for PostgresMessageStore {
    #[instrument(skip(self, envelope), fields(store = %self.name, envelope_id = %envelope.id))]
    async fn store_incoming(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_incoming(&mut conn, envelope, envelope.status, envelope.owner_id).await
    }

    async fn store_incoming_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            insert_incoming(&mut tx, envelope, envelope.status, envelope.owner_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn schedule_execution(&self, envelope: &Envelope) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE wolverine_incoming_envelopes
            SET status = $3, scheduled_time = $4, attempts = $5, owner_id = $6
            WHERE id = $1 AND owner_id = $2
            "#,
        )
        .bind(envelope.id.uuid())
        .bind(envelope.owner_id)
        .bind(EnvelopeStatus::Scheduled.as_str())
        .bind(envelope.scheduled_time)
        .bind(envelope.attempts)
        .bind(ANY_NODE)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_job(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_incoming(&mut conn, envelope, EnvelopeStatus::Scheduled, ANY_NODE).await
    }

    #[instrument(skip(self, envelope, exception), fields(store = %self.name, envelope_id = %envelope.id))]
    async fn move_to_dead_letter_storage(
        &self,
        envelope: &Envelope,
        exception: &ExceptionInfo,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM wolverine_incoming_envelopes WHERE id = $1")
            .bind(envelope.id.uuid())
            .execute(&mut *tx)
            .await?;

        bind_envelope(
            sqlx::query(concat!(
                "INSERT INTO wolverine_dead_letters (",
                envelope_columns!(),
                ", exception_type, exception_message, replayable) ",
                "VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, false) ",
                "ON CONFLICT (id) DO NOTHING"
            )),
            envelope,
            envelope.status,
            envelope.owner_id,
        )
        .bind(&exception.exception_type)
        .bind(&exception.message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn increment_incoming_envelope_attempts(&self, envelope: &Envelope) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE wolverine_incoming_envelopes SET attempts = $3 WHERE id = $1 AND owner_id = $2",
        )
        .bind(envelope.id.uuid())
        .bind(envelope.owner_id)
        .bind(envelope.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_incoming_envelope_as_handled(&self, envelope: &Envelope) -> Result<(), StoreError> {
        self.mark_incoming_envelopes_as_handled(std::slice::from_ref(envelope))
            .await
    }

    async fn mark_incoming_envelopes_as_handled(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        let keep_until = self.settings.keep_until(Utc::now());
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            sqlx::query(
                r#"
                UPDATE wolverine_incoming_envelopes
                SET status = $3, keep_until = $4
                WHERE id = $1 AND owner_id = $2
                "#,
            )
            .bind(envelope.id.uuid())
            .bind(envelope.owner_id)
            .bind(EnvelopeStatus::Handled.as_str())
            .bind(keep_until)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn release_incoming(&self, owner_id: i32) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE wolverine_incoming_envelopes SET owner_id = $2 WHERE owner_id = $1")
                .bind(owner_id)
                .bind(ANY_NODE)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn reassign_incoming(&self, owner_id: i32, envelopes: &[Envelope]) -> Result<(), StoreError> {
        sqlx::query("UPDATE wolverine_incoming_envelopes SET owner_id = $1 WHERE id = ANY($2)")
            .bind(owner_id)
            .bind(ids(envelopes))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_orphaned_incoming(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        let claimed = sqlx::query_as::<_, Envelope>(concat!(
            r#"
            UPDATE wolverine_incoming_envelopes SET owner_id = $1
            WHERE id IN (
                SELECT id FROM wolverine_incoming_envelopes
                WHERE owner_id = $2 AND status = $3
                ORDER BY id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            envelope_columns!()
        ))
        .bind(owner_id)
        .bind(ANY_NODE)
        .bind(EnvelopeStatus::Incoming.as_str())
        .bind(page(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn claim_scheduled_due(
        &self,
        owner_id: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Envelope>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !self
            .try_xact_lock(&mut tx, self.settings.scheduled_job_lock_id)
            .await?
        {
            debug!(store = %self.name, "scheduled job lock held elsewhere");
            return Ok(Vec::new());
        }

        let claimed = sqlx::query_as::<_, Envelope>(concat!(
            r#"
            UPDATE wolverine_incoming_envelopes SET status = $1, owner_id = $2
            WHERE id IN (
                SELECT id FROM wolverine_incoming_envelopes
                WHERE status = $3 AND scheduled_time <= $4
                ORDER BY scheduled_time
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            envelope_columns!()
        ))
        .bind(EnvelopeStatus::Incoming.as_str())
        .bind(owner_id)
        .bind(EnvelopeStatus::Scheduled.as_str())
        .bind(now)
        .bind(page(limit))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(claimed)
    }
}

// =============================================================================
// Outbox
// =============================================================================

#[async_trait]
impl MessageOutbox for PostgresMessageStore {
    async fn load_outgoing(&self, destination: &str) -> Result<Vec<Envelope>, StoreError> {
        let rows = sqlx::query_as::<_, Envelope>(concat!(
            "SELECT ",
            envelope_columns!(),
            " FROM wolverine_outgoing_envelopes WHERE destination = $1 ORDER BY id"
        ))
        .bind(destination)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self, envelope), fields(store = %self.name, envelope_id = %envelope.id))]
    async fn store_outgoing(&self, envelope: &Envelope, owner_id: i32) -> Result<(), StoreError> {
        bind_envelope(
            sqlx::query(insert_envelope_sql!("wolverine_outgoing_envelopes")),
            envelope,
            EnvelopeStatus::Outgoing,
            owner_id,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_insert(e, envelope.id))?;
        Ok(())
    }

    async fn delete_outgoing(&self, envelope: &Envelope) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wolverine_outgoing_envelopes WHERE id = $1")
            .bind(envelope.id.uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_outgoing_batch(&self, envelopes: &[Envelope]) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wolverine_outgoing_envelopes WHERE id = ANY($1)")
            .bind(ids(envelopes))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn discard_and_reassign_outgoing(
        &self,
        discards: &[Envelope],
        reassigned: &[Envelope],
        owner_id: i32,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM wolverine_outgoing_envelopes WHERE id = ANY($1)")
            .bind(ids(discards))
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE wolverine_outgoing_envelopes SET owner_id = $1 WHERE id = ANY($2)")
            .bind(owner_id)
            .bind(ids(reassigned))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_orphaned_outgoing(&self, owner_id: i32, limit: usize) -> Result<Vec<Envelope>, StoreError> {
        let claimed = sqlx::query_as::<_, Envelope>(concat!(
            r#"
            UPDATE wolverine_outgoing_envelopes SET owner_id = $1
            WHERE id IN (
                SELECT id FROM wolverine_outgoing_envelopes
                WHERE owner_id = $2
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            envelope_columns!()
        ))
        .bind(owner_id)
        .bind(ANY_NODE)
        .bind(page(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(claimed)
    }
}

// =============================================================================
// Admin
// =============================================================================

fn is_benign_migration_error(err: &MigrateError) -> bool {
    match err {
        MigrateError::Execute(e) | MigrateError::ExecuteMigration(e, _) => is_already_exists(e),
        _ => false,
    }
}

#[async_trait]
impl MessageStoreAdmin for PostgresMessageStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        info!(store = %self.name, "Running database migrations");

        let candidates = vec![
            PathBuf::from("./migrations"),
            PathBuf::from("services/durability/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    match migrator.run(&self.pool).await {
                        Ok(()) => {}
                        Err(e) if is_benign_migration_error(&e) => {
                            warn!(store = %self.name, error = %e, "Schema object already exists");
                        }
                        Err(e) => return Err(StoreError::Migration(e)),
                    }
                    info!(store = %self.name, "Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "wolverine_incoming_envelopes",
            "wolverine_outgoing_envelopes",
            "wolverine_dead_letters",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_counts(&self) -> Result<PersistedCounts, StoreError> {
        let mut counts = PersistedCounts::default();

        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM wolverine_incoming_envelopes GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            match EnvelopeStatus::parse(&status) {
                Some(EnvelopeStatus::Incoming) => counts.incoming = count,
                Some(EnvelopeStatus::Scheduled) => counts.scheduled = count,
                Some(EnvelopeStatus::Handled) => counts.handled = count,
                _ => warn!(store = %self.name, %status, "Unexpected incoming envelope status"),
            }
        }

        counts.outgoing = sqlx::query_scalar("SELECT COUNT(*) FROM wolverine_outgoing_envelopes")
            .fetch_one(&self.pool)
            .await?;
        counts.dead_letter = sqlx::query_scalar("SELECT COUNT(*) FROM wolverine_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(counts)
    }

    async fn all_incoming(&self) -> Result<Vec<Envelope>, StoreError> {
        let rows = sqlx::query_as::<_, Envelope>(concat!(
            "SELECT ",
            envelope_columns!(),
            " FROM wolverine_incoming_envelopes ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn all_outgoing(&self) -> Result<Vec<Envelope>, StoreError> {
        let rows = sqlx::query_as::<_, Envelope>(concat!(
            "SELECT ",
            envelope_columns!(),
            " FROM wolverine_outgoing_envelopes ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn release_all_ownership(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE wolverine_incoming_envelopes SET owner_id = $1")
            .bind(ANY_NODE)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE wolverine_outgoing_envelopes SET owner_id = $1")
            .bind(ANY_NODE)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_expired_handled(&self, now: DateTime<Utc>, batch: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM wolverine_incoming_envelopes
            WHERE id IN (
                SELECT id FROM wolverine_incoming_envelopes
                WHERE status = $1 AND keep_until <= $2
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(EnvelopeStatus::Handled.as_str())
        .bind(now)
        .bind(page(batch))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Dead Letters
// =============================================================================

#[async_trait]
impl DeadLetters for PostgresMessageStore {
    async fn summarize_dead_letters(&self) -> Result<Vec<DeadLetterSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT received_at, message_type, exception_type, COUNT(*) AS count
            FROM wolverine_dead_letters
            GROUP BY received_at, message_type, exception_type
            ORDER BY received_at, message_type, exception_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeadLetterSummary, StoreError> {
                Ok(DeadLetterSummary {
                    tenant_id: None,
                    received_at: row.try_get("received_at")?,
                    message_type: row.try_get("message_type")?,
                    exception_type: row.try_get("exception_type")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    async fn query_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetterEnvelope>, StoreError> {
        let rows = sqlx::query_as::<_, DeadLetterEnvelope>(concat!(
            "SELECT ",
            envelope_columns!(),
            r#", exception_type, exception_message, replayable
            FROM wolverine_dead_letters
            WHERE ($1::text IS NULL OR message_type = $1)
              AND ($2::text IS NULL OR exception_type = $2)
              AND ($3::text IS NULL OR received_at = $3)
            ORDER BY id
            LIMIT $4
            "#
        ))
        .bind(&query.message_type)
        .bind(&query.exception_type)
        .bind(&query.received_at)
        .bind(page(query.limit.unwrap_or(usize::MAX)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_dead_letters_for_replay(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(EnvelopeId::uuid).collect();
        let result = sqlx::query("UPDATE wolverine_dead_letters SET replayable = true WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_dead_letters(&self, ids: &[EnvelopeId]) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(EnvelopeId::uuid).collect();
        let result = sqlx::query("DELETE FROM wolverine_dead_letters WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn replay_dead_letters(&self, limit: usize) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let replayed = sqlx::query_as::<_, Envelope>(concat!(
            r#"
            DELETE FROM wolverine_dead_letters
            WHERE id IN (
                SELECT id FROM wolverine_dead_letters
                WHERE replayable
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            envelope_columns!()
        ))
        .bind(page(limit))
        .fetch_all(&mut *tx)
        .await?;

        for envelope in &replayed {
            let envelope = Envelope {
                attempts: 0,
                scheduled_time: None,
                ..envelope.clone()
            };
            bind_envelope(
                sqlx::query(concat!(
                    insert_envelope_sql!("wolverine_incoming_envelopes"),
                    " ON CONFLICT (id) DO NOTHING"
                )),
                &envelope,
                EnvelopeStatus::Incoming,
                ANY_NODE,
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(replayed.len() as u64)
    }
}

// =============================================================================
// Advisory Locks
// =============================================================================

#[async_trait]
impl AdvisoryLock for PostgresMessageStore {
    async fn has_lock(&self, lock_id: i64) -> bool {
        self.locks.has_lock(lock_id).await
    }

    async fn try_attain_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        self.locks.try_attain(lock_id).await
    }

    async fn release_lock(&self, lock_id: i64) -> Result<(), StoreError> {
        self.locks.release(lock_id).await
    }
}

// =============================================================================
// Node Persistence
// =============================================================================

#[async_trait]
impl NodeAgentPersistence for PostgresMessageStore {
    #[instrument(skip(self, registration), fields(store = %self.name, node_id = %registration.node_id))]
    async fn persist_node(&self, registration: &NodeRegistration) -> Result<WolverineNode, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::delete_node_in(&mut tx, &registration.node_id).await?;

        let capabilities: Vec<&AgentUri> = registration.capabilities.iter().collect();
        let number: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO wolverine_nodes (
                id, description, control_uri, capabilities, version, started, last_health_check
            )
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING node_number
            "#,
        )
        .bind(registration.node_id.uuid())
        .bind(&registration.description)
        .bind(&registration.control_uri)
        .bind(Json(capabilities))
        .bind(&registration.version)
        .bind(registration.started)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(registration.clone().into_node(NodeNumber::new(number)?))
    }

    async fn delete_node(&self, node_id: &NodeId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::delete_node_in(&mut tx, node_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_all_nodes(&self) -> Result<Vec<WolverineNode>, StoreError> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM wolverine_nodes ORDER BY node_number")
            .fetch_all(&self.pool)
            .await?;
        let nodes = rows
            .into_iter()
            .map(NodeRow::into_node)
            .collect::<Result<Vec<_>, _>>()?;
        self.attach_agents(nodes).await
    }

    async fn load_node(&self, node_id: &NodeId) -> Result<Option<WolverineNode>, StoreError> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM wolverine_nodes WHERE id = $1")
            .bind(node_id.uuid())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let nodes = self.attach_agents(vec![row.into_node()?]).await?;
        Ok(nodes.into_iter().next())
    }

    async fn mark_health_check(&self, node_id: &NodeId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE wolverine_nodes SET last_health_check = $2 WHERE id = $1")
            .bind(node_id.uuid())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn mark_as_leader(
        &self,
        expected: Option<NodeId>,
        candidate: NodeId,
    ) -> Result<Option<NodeId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !self
            .try_xact_lock(&mut tx, self.settings.leadership_lock_id)
            .await?
        {
            debug!("leadership lock contended");
            return Ok(None);
        }

        let current: Option<Uuid> = sqlx::query_scalar(
            "SELECT node_id FROM wolverine_node_assignments WHERE id = $1 FOR UPDATE",
        )
        .bind(LEADER_URI)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.map(NodeId::from_uuid);

        if current.is_some() && current != expected {
            tx.commit().await?;
            return Ok(current);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO wolverine_node_assignments (id, node_id, started)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE SET node_id = EXCLUDED.node_id, started = EXCLUDED.started
            "#,
        )
        .bind(LEADER_URI)
        .bind(candidate.uuid())
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {
                tx.commit().await?;
                Ok(Some(candidate))
            }
            Err(e) if has_code(&e, FOREIGN_KEY_VIOLATION) => Err(StoreError::NodeNotFound(candidate)),
            Err(e) => Err(e.into()),
        }
    }

    async fn current_leader(&self) -> Result<Option<NodeId>, StoreError> {
        let leader: Option<Uuid> =
            sqlx::query_scalar("SELECT node_id FROM wolverine_node_assignments WHERE id = $1")
                .bind(LEADER_URI)
                .fetch_optional(&self.pool)
                .await?;
        Ok(leader.map(NodeId::from_uuid))
    }

    async fn add_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO wolverine_node_assignments (id, node_id, started)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE SET node_id = EXCLUDED.node_id, started = EXCLUDED.started
            "#,
        )
        .bind(agent.as_str())
        .bind(node_id.uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if has_code(&e, FOREIGN_KEY_VIOLATION) {
                return StoreError::NodeNotFound(*node_id);
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn remove_assignment(&self, node_id: &NodeId, agent: &AgentUri) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM wolverine_node_assignments WHERE id = $1 AND node_id = $2")
            .bind(agent.as_str())
            .bind(node_id.uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_restrictions(&self) -> Result<AgentRestrictions, StoreError> {
        let rows = sqlx::query(
            "SELECT id, uri, restriction_type, node_number FROM wolverine_agent_restrictions ORDER BY uri",
        )
        .fetch_all(&self.pool)
        .await?;
        let restrictions = rows
            .iter()
            .map(restriction_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AgentRestrictions::new(restrictions))
    }

    async fn persist_restrictions(&self, restrictions: &AgentRestrictions) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for restriction in restrictions.all() {
            if restriction.is_effective() {
                sqlx::query(
                    r#"
                    INSERT INTO wolverine_agent_restrictions (id, uri, restriction_type, node_number)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (uri) DO UPDATE
                    SET restriction_type = EXCLUDED.restriction_type,
                        node_number = EXCLUDED.node_number
                    "#,
                )
                .bind(restriction.id.uuid())
                .bind(restriction.agent_uri.as_str())
                .bind(restriction.restriction_type.as_str())
                .bind(restriction.node_number)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query("DELETE FROM wolverine_agent_restrictions WHERE uri = $1")
                    .bind(restriction.agent_uri.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

impl MessageStore for PostgresMessageStore {
    fn name(&self) -> &str {
        &self.name
    }
}
