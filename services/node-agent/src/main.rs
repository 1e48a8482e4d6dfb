//! Wolverine node agent
//!
//! Runs one cluster node: the control endpoint peers talk to, the node agent
//! controller that elects a leader and places agents, and this node's
//! recovery worker for envelopes orphaned by crashed nodes.
//!
//! ## Architecture
//!
//! - **Control endpoint**: `POST /control` accepts coordination commands
//! - **Controller**: heartbeats, leader election, agent evaluation and verification
//! - **Durability agents**: store-wide jobs, one agent per database
//! - **Recovery worker**: per-node reclaiming of orphaned envelopes

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wolverine_durability::{
    BufferedLocalQueue, DbConfig, DurabilitySettings, DurabilityWorker, InMemoryMessageStore,
    LocalQueue, MessageStore, MessageStoreAdmin, MultiTenantedMessageStore, PostgresMessageStore,
    SendingAgents, TenantedMessageStores,
};
use wolverine_node_agent::{
    control_router, AgentFamilyRegistry, Config, DurabilityAgentFamily, HttpControlTransport,
    NodeAgentController,
};

/// Envelopes buffered between recovery and local handlers.
const LOCAL_QUEUE_CAPACITY: usize = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting wolverine node agent");
    info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        control_uri = %config.control_uri,
        tenants = config.tenants.len(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Message stores
    let master = open_store("master", config.database_url.as_deref(), &config.durability).await?;
    let stores = Arc::new(TenantedMessageStores::new(master));
    for tenant in &config.tenants {
        let store = open_store(&tenant.tenant_id, Some(&tenant.database_url), &config.durability).await?;
        stores.add_tenant(tenant.tenant_id.clone(), store);
    }
    let message_store = Arc::new(MultiTenantedMessageStore::new(Arc::clone(&stores)));

    // Recovered envelopes land here; handlers live outside this process.
    let (queue, mut envelopes) = BufferedLocalQueue::new(LOCAL_QUEUE_CAPACITY);
    let queue: Arc<dyn LocalQueue> = Arc::new(queue);
    let drain_handle = tokio::spawn(async move {
        while let Some(envelope) = envelopes.recv().await {
            debug!(
                envelope_id = %envelope.id,
                message_type = %envelope.message_type,
                "Envelope ready for handling"
            );
        }
    });

    // Controller
    let families = AgentFamilyRegistry::new().register(Arc::new(DurabilityAgentFamily::new(
        Arc::clone(&stores),
        Arc::clone(&queue),
        config.durability.clone(),
    )));
    let transport = Arc::new(HttpControlTransport::new(config.controller.remote_invoke_timeout)?);
    let controller = Arc::new(
        NodeAgentController::new(
            config.controller.clone(),
            config.node_id,
            config.control_uri.clone(),
            message_store.clone(),
            transport,
            families,
        )
        .with_description(config.description.clone()),
    );

    // Control endpoint, up before joining so peers can reach us
    let app = control_router(Arc::clone(&controller));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for control commands");

    let server_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut shutdown_rx = shutdown_rx;
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("Control endpoint shutting down");
                })
                .await
        }
    });

    controller.start().await?;
    let node_number = controller
        .node_number()
        .context("node has no number after joining")?;

    let recovery = DurabilityWorker::for_node(
        message_store,
        Arc::clone(&queue),
        Arc::new(SendingAgents::new()),
        node_number.value(),
        &config.durability,
    );
    let recovery_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { recovery.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Control endpoint exited normally"),
                Ok(Err(e)) => error!(error = %e, "Control endpoint error"),
                Err(e) => error!(error = %e, "Control endpoint task panicked"),
            }
        }
    }

    if let Err(e) = controller.stop().await {
        error!(error = %e, "Failed to leave the cluster cleanly");
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, recovery_handle).await.is_err() {
        warn!("Recovery worker did not shut down in time");
    }
    drop(queue);
    drain_handle.abort();

    info!("Node agent shutdown complete");
    Ok(())
}

async fn open_store(
    name: &str,
    database_url: Option<&str>,
    settings: &DurabilitySettings,
) -> Result<Arc<dyn MessageStore>> {
    let Some(database_url) = database_url else {
        warn!(store = name, "No database configured; envelopes will not survive a restart");
        return Ok(Arc::new(InMemoryMessageStore::with_settings(name, settings.clone())));
    };

    let db_config = DbConfig {
        database_url: database_url.to_string(),
        ..DbConfig::from_env()
    };
    let store = PostgresMessageStore::connect(name, &db_config, settings.clone())
        .await
        .with_context(|| format!("failed to connect store {name}"))?;
    store.migrate().await?;
    info!(store = name, "Message store ready");
    Ok(Arc::new(store))
}
