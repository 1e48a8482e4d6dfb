//! Configuration for the node agent.

use std::time::Duration;

use anyhow::{Context, Result};
use wolverine_durability::DurabilitySettings;
use wolverine_id::NodeId;

/// Timing knobs for [`crate::NodeAgentController`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between heartbeats (and, on the leader, stale node sweeps).
    pub health_check_interval: Duration,

    /// A node whose last heartbeat is older than this is ejected by the leader.
    pub stale_node_timeout: Duration,

    /// Interval between leader-driven verification passes.
    pub verify_interval: Duration,

    /// Window in which evaluation requests are coalesced into one pass.
    pub evaluation_debounce: Duration,

    /// Upper bound on a single remote command invocation.
    pub remote_invoke_timeout: Duration,

    /// Compare-and-set attempts before a leadership bid gives up.
    pub max_leadership_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            stale_node_timeout: Duration::from_secs(60),
            verify_interval: Duration::from_secs(30),
            evaluation_debounce: Duration::from_millis(250),
            remote_invoke_timeout: Duration::from_secs(5),
            max_leadership_attempts: 3,
        }
    }
}

impl ControllerConfig {
    pub(crate) fn stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_node_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

/// A tenant database from `WOLVERINE_TENANTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDatabase {
    pub tenant_id: String,
    pub database_url: String,
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    pub description: String,

    /// Address the control endpoint binds to.
    pub listen_addr: String,

    /// Control URI advertised to peers.
    pub control_uri: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Master database. `None` runs on the in-memory store.
    pub database_url: Option<String>,

    pub tenants: Vec<TenantDatabase>,

    pub controller: ControllerConfig,

    pub durability: DurabilitySettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Node ID can be provided or auto-generated
        let node_id = match std::env::var("WOLVERINE_NODE_ID") {
            Ok(s) => s.parse().context("invalid WOLVERINE_NODE_ID")?,
            Err(_) => NodeId::new(),
        };

        let description = std::env::var("WOLVERINE_NODE_DESCRIPTION")
            .unwrap_or_else(|_| format!("node-agent {}", env!("CARGO_PKG_VERSION")));

        let listen_addr =
            std::env::var("WOLVERINE_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:7400".to_string());

        let control_uri = std::env::var("WOLVERINE_CONTROL_URI")
            .unwrap_or_else(|_| format!("http://{}", listen_addr.replace("0.0.0.0", "127.0.0.1")));

        let log_level = std::env::var("WOLVERINE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let database_url = std::env::var("WOLVERINE_DATABASE_URL").ok();

        let tenants = match std::env::var("WOLVERINE_TENANTS") {
            Ok(raw) => parse_tenants(&raw)?,
            Err(_) => Vec::new(),
        };

        let defaults = ControllerConfig::default();
        let controller = ControllerConfig {
            health_check_interval: millis("WOLVERINE_HEALTH_CHECK_INTERVAL_MS")?
                .unwrap_or(defaults.health_check_interval),
            stale_node_timeout: millis("WOLVERINE_STALE_NODE_TIMEOUT_MS")?
                .unwrap_or(defaults.stale_node_timeout),
            verify_interval: millis("WOLVERINE_VERIFY_INTERVAL_MS")?
                .unwrap_or(defaults.verify_interval),
            evaluation_debounce: millis("WOLVERINE_EVALUATION_DEBOUNCE_MS")?
                .unwrap_or(defaults.evaluation_debounce),
            remote_invoke_timeout: millis("WOLVERINE_REMOTE_INVOKE_TIMEOUT_MS")?
                .unwrap_or(defaults.remote_invoke_timeout),
            ..defaults
        };

        let settings = DurabilitySettings::default();
        let durability = DurabilitySettings {
            recovery_batch_size: number("WOLVERINE_RECOVERY_BATCH_SIZE")?
                .unwrap_or(settings.recovery_batch_size),
            scheduled_job_polling_time: millis("WOLVERINE_SCHEDULED_POLL_INTERVAL_MS")?
                .unwrap_or(settings.scheduled_job_polling_time),
            keep_after_message_handling: millis("WOLVERINE_KEEP_AFTER_HANDLED_MS")?
                .unwrap_or(settings.keep_after_message_handling),
            ..settings
        };

        Ok(Self {
            node_id,
            description,
            listen_addr,
            control_uri,
            log_level,
            database_url,
            tenants,
            controller,
            durability,
        })
    }
}

fn number(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(s) => Ok(Some(s.parse().with_context(|| format!("invalid {key}"))?)),
        Err(_) => Ok(None),
    }
}

fn millis(key: &str) -> Result<Option<Duration>> {
    Ok(number(key)?.map(|ms| Duration::from_millis(ms as u64)))
}

/// Parses `tenant=url` pairs separated by commas.
fn parse_tenants(raw: &str) -> Result<Vec<TenantDatabase>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (tenant_id, database_url) = entry
                .split_once('=')
                .with_context(|| format!("tenant entry {entry:?} is not tenant=url"))?;
            Ok(TenantDatabase {
                tenant_id: tenant_id.trim().to_string(),
                database_url: database_url.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert!(config.stale_node_timeout > config.health_check_interval);
        assert_eq!(config.stale_timeout(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_parse_tenants() {
        let tenants = parse_tenants("red=postgres://db/red, blue=postgres://db/blue,").unwrap();
        assert_eq!(
            tenants,
            vec![
                TenantDatabase {
                    tenant_id: "red".to_string(),
                    database_url: "postgres://db/red".to_string(),
                },
                TenantDatabase {
                    tenant_id: "blue".to_string(),
                    database_url: "postgres://db/blue".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_tenants_rejects_missing_url() {
        assert!(parse_tenants("red").is_err());
    }
}
