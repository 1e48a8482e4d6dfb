//! Delivery of coordination commands to peers.
//!
//! Peers are addressed by the control URI they advertised when joining.
//! [`HttpControlTransport`] posts JSON to `{control_uri}/control`, served by
//! [`control_router`]. [`InMemoryControlTransport`] routes straight to
//! controllers in the same process and is what the cluster tests run on.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, error};

use crate::commands::{AgentCommand, AgentReply};
use crate::controller::NodeAgentController;
use crate::error::DispatchError;

/// Sends a command to the node behind `control_uri` and waits for its reply.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn invoke(&self, control_uri: &str, command: AgentCommand) -> Result<AgentReply, DispatchError>;
}

// =============================================================================
// In-process
// =============================================================================

/// Routes commands to controllers registered in this process.
pub struct InMemoryControlTransport {
    nodes: RwLock<HashMap<String, Weak<NodeAgentController>>>,
    timeout: Duration,
}

impl InMemoryControlTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Makes `controller` reachable at its control URI.
    pub fn register(&self, controller: &Arc<NodeAgentController>) {
        self.nodes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(controller.control_uri().to_string(), Arc::downgrade(controller));
    }

    /// Makes the node at `control_uri` unreachable, as if its process died.
    pub fn unregister(&self, control_uri: &str) {
        self.nodes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(control_uri);
    }

    fn resolve(&self, control_uri: &str) -> Option<Arc<NodeAgentController>> {
        self.nodes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(control_uri)
            .and_then(Weak::upgrade)
    }
}

#[async_trait]
impl ControlTransport for InMemoryControlTransport {
    async fn invoke(&self, control_uri: &str, command: AgentCommand) -> Result<AgentReply, DispatchError> {
        let controller = self
            .resolve(control_uri)
            .ok_or_else(|| DispatchError::UnknownNode(control_uri.to_string()))?;

        tokio::time::timeout(self.timeout, controller.handle(command))
            .await
            .map_err(|_| DispatchError::Timeout(control_uri.to_string()))
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// Posts commands as JSON to `{control_uri}/control`.
pub struct HttpControlTransport {
    client: reqwest::Client,
}

impl HttpControlTransport {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ControlTransport for HttpControlTransport {
    async fn invoke(&self, control_uri: &str, command: AgentCommand) -> Result<AgentReply, DispatchError> {
        let url = format!("{}/control", control_uri.trim_end_matches('/'));
        debug!(url = %url, command = command.name(), "Sending control command");

        let response = self
            .client
            .post(&url)
            .json(&command)
            .send()
            .await
            .map_err(|e| classify(control_uri, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Control command rejected");
            return Err(DispatchError::Remote(format!("{status}: {body}")));
        }

        response
            .json::<AgentReply>()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))
    }
}

fn classify(control_uri: &str, err: reqwest::Error) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout(control_uri.to_string())
    } else if err.is_connect() {
        DispatchError::UnknownNode(control_uri.to_string())
    } else {
        DispatchError::Transport(err.to_string())
    }
}

/// Control endpoint served by every node.
pub fn control_router(controller: Arc<NodeAgentController>) -> Router {
    Router::new()
        .route("/control", post(handle_control))
        .route("/health", get(health))
        .with_state(controller)
}

async fn handle_control(
    State(controller): State<Arc<NodeAgentController>>,
    Json(command): Json<AgentCommand>,
) -> Json<AgentReply> {
    Json(controller.handle(command).await)
}

async fn health() -> &'static str {
    "ok"
}
