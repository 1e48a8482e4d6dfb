//! Database and durability configuration.

use std::time::Duration;

use wolverine_reconcile::BackoffPolicy;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/wolverine".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/wolverine".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }

    /// Same pool settings pointed at another database.
    pub fn with_url(&self, database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..self.clone()
        }
    }
}

/// Tuning for envelope persistence and the recovery jobs.
#[derive(Debug, Clone)]
pub struct DurabilitySettings {
    /// How long handled incoming rows are kept before the sweeper purges them.
    pub keep_after_message_handling: Duration,

    /// Upper bound on envelopes claimed per recovery page.
    pub recovery_batch_size: usize,

    /// Interval between scheduled-envelope polls and recovery passes.
    pub scheduled_job_polling_time: Duration,

    /// Advisory lock id guarding scheduled dispatch.
    pub scheduled_job_lock_id: i64,

    /// Advisory lock id guarding leader election.
    pub leadership_lock_id: i64,

    /// Rows purged per sweep batch.
    pub handled_sweep_batch_size: usize,

    /// Failures after which an incoming envelope is dead-lettered.
    pub max_incoming_attempts: i32,

    /// Delay applied when a failed envelope is rescheduled.
    pub retry_backoff: BackoffPolicy,

    /// Capacity of the in-memory outgoing retry queue per destination.
    pub outgoing_retry_capacity: usize,

    /// Dead letters moved back per replay pass.
    pub dead_letter_replay_batch: usize,
}

impl Default for DurabilitySettings {
    fn default() -> Self {
        Self {
            keep_after_message_handling: Duration::from_secs(5 * 60),
            recovery_batch_size: 100,
            scheduled_job_polling_time: Duration::from_secs(5),
            scheduled_job_lock_id: 20_000,
            leadership_lock_id: 9_999_999,
            handled_sweep_batch_size: 100,
            max_incoming_attempts: 3,
            retry_backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
                jitter: 0.1,
            },
            outgoing_retry_capacity: 100,
            dead_letter_replay_batch: 100,
        }
    }
}

impl DurabilitySettings {
    /// Keep-until timestamp for an envelope handled at `now`.
    pub fn keep_until(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        now + chrono::Duration::from_std(self.keep_after_message_handling)
            .unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}
