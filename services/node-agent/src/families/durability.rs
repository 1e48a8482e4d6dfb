//! One durability agent per message store, so each database's store-wide
//! jobs run on exactly one node.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wolverine_durability::tenancy::MASTER_TENANT;
use wolverine_durability::{DurabilitySettings, DurabilityWorker, LocalQueue, TenantedMessageStores};
use wolverine_id::AgentUri;

use super::{Agent, AgentContext, AgentFamily, AgentStatus};
use crate::error::ControllerError;

pub const DURABILITY_SCHEME: &str = "wolverinedb";

/// `wolverinedb://master` and `wolverinedb://<tenant>` for every store.
pub struct DurabilityAgentFamily {
    stores: Arc<TenantedMessageStores>,
    queue: Arc<dyn LocalQueue>,
    settings: DurabilitySettings,
}

impl DurabilityAgentFamily {
    pub fn new(
        stores: Arc<TenantedMessageStores>,
        queue: Arc<dyn LocalQueue>,
        settings: DurabilitySettings,
    ) -> Self {
        Self {
            stores,
            queue,
            settings,
        }
    }

    fn agent_uri(tenant_id: &str) -> Result<AgentUri, ControllerError> {
        let path = if tenant_id == MASTER_TENANT {
            "master".to_string()
        } else {
            tenant_id.to_string()
        };
        AgentUri::from_parts(DURABILITY_SCHEME, &path)
            .map_err(|e| ControllerError::Store(e.into()))
    }
}

#[async_trait]
impl AgentFamily for DurabilityAgentFamily {
    fn scheme(&self) -> &str {
        DURABILITY_SCHEME
    }

    async fn all_known_agents(&self) -> Result<Vec<AgentUri>, ControllerError> {
        self.stores
            .active()
            .iter()
            .map(|(tenant_id, _)| Self::agent_uri(tenant_id))
            .collect()
    }

    async fn supported_agents(&self) -> Result<Vec<AgentUri>, ControllerError> {
        self.all_known_agents().await
    }

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>, ControllerError> {
        let store = self
            .stores
            .find(Some(uri.path()))
            .map_err(|e| ControllerError::agent_failed(uri, e))?;
        Ok(Arc::new(DurabilityAgent {
            uri: uri.clone(),
            store,
            queue: self.queue.clone(),
            settings: self.settings.clone(),
            running: Mutex::new(None),
        }))
    }
}

/// Runs one store's [`DurabilityWorker`] while started.
pub struct DurabilityAgent {
    uri: AgentUri,
    store: Arc<dyn wolverine_durability::MessageStore>,
    queue: Arc<dyn LocalQueue>,
    settings: DurabilitySettings,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

#[async_trait]
impl Agent for DurabilityAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    async fn start(&self, ctx: &AgentContext) -> Result<(), ControllerError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }

        let worker = DurabilityWorker::for_store(
            self.store.clone(),
            self.queue.clone(),
            ctx.node_number.value(),
            &self.settings,
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        *running = Some((tx, handle));

        info!(agent_uri = %self.uri, store = self.store.name(), "Started durability agent");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControllerError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((tx, handle)) = running else {
            return Ok(());
        };

        let _ = tx.send(true);
        if let Err(e) = handle.await {
            warn!(agent_uri = %self.uri, error = %e, "durability worker task failed");
        }
        info!(agent_uri = %self.uri, "Stopped durability agent");
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        match self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some((_, handle)) if handle.is_finished() => AgentStatus::Failed,
            Some(_) => AgentStatus::Running,
            None => AgentStatus::Stopped,
        }
    }
}
