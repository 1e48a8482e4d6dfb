//! The control endpoint served over HTTP on a loopback port.

use std::sync::Arc;
use std::time::Duration;

use wolverine_durability::InMemoryMessageStore;
use wolverine_id::{AgentUri, NodeId};
use wolverine_node_agent::{
    control_router, AgentCommand, AgentFamilyRegistry, AgentReply, ControlTransport,
    ControllerConfig, DispatchError, HttpControlTransport, NodeAgentController,
};

async fn serve_node() -> (Arc<NodeAgentController>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_uri = format!("http://{}", listener.local_addr().unwrap());

    let transport = Arc::new(HttpControlTransport::new(Duration::from_secs(5)).unwrap());
    let controller = Arc::new(NodeAgentController::new(
        ControllerConfig::default(),
        NodeId::new(),
        control_uri.clone(),
        Arc::new(InMemoryMessageStore::new("master")),
        transport,
        AgentFamilyRegistry::new(),
    ));

    let app = control_router(Arc::clone(&controller));
    tokio::spawn(async move { axum::serve(listener, app).await });
    (controller, control_uri)
}

#[tokio::test]
async fn test_query_running_agents_over_http() {
    let (controller, control_uri) = serve_node().await;
    controller.join().await.unwrap();
    let client = HttpControlTransport::new(Duration::from_secs(5)).unwrap();

    let reply = client
        .invoke(&control_uri, AgentCommand::QueryRunningAgents)
        .await
        .unwrap();

    match reply {
        AgentReply::Running { node_id, agents } => {
            assert_eq!(node_id, controller.node_id());
            assert!(agents.contains(&AgentUri::leader()));
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_unjoined_node_reports_failure() {
    let (_controller, control_uri) = serve_node().await;
    let client = HttpControlTransport::new(Duration::from_secs(5)).unwrap();

    let reply = client
        .invoke(&control_uri, AgentCommand::QueryRunningAgents)
        .await
        .unwrap();

    assert!(matches!(reply, AgentReply::Failed { .. }));
}

#[tokio::test]
async fn test_unknown_agent_start_is_rejected() {
    let (controller, control_uri) = serve_node().await;
    controller.join().await.unwrap();
    let client = HttpControlTransport::new(Duration::from_secs(5)).unwrap();

    let reply = client
        .invoke(
            &control_uri,
            AgentCommand::StartAgent {
                agent_uri: AgentUri::parse("nope://1").unwrap(),
            },
        )
        .await
        .unwrap();

    assert!(matches!(reply, AgentReply::Failed { .. }));
}

#[tokio::test]
async fn test_unreachable_node_is_unknown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let client = HttpControlTransport::new(Duration::from_secs(5)).unwrap();

    let err = client
        .invoke(&control_uri, AgentCommand::CheckHealth)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::UnknownNode(_)));
    assert!(err.is_transient());
}
