//! Wolverine node agent.
//!
//! Every process in a cluster runs one [`NodeAgentController`]. Together
//! they elect a single leader through the message store, track membership
//! by heartbeat and spread singleton background agents evenly across the
//! live nodes.
//!
//! ## Modules
//!
//! - `commands`: the coordination command set and its wire format
//! - `controller`: election, health checks, evaluation and verification
//! - `families`: agent families and the durability agents
//! - `transport`: in-process and HTTP command delivery

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod families;
pub mod transport;

pub use commands::{AgentCommand, AgentReply};
pub use config::{Config, ControllerConfig, TenantDatabase};
pub use controller::NodeAgentController;
pub use error::{ControllerError, DispatchError};
pub use families::{
    Agent, AgentContext, AgentFamily, AgentFamilyRegistry, AgentStatus, DurabilityAgent,
    DurabilityAgentFamily, DURABILITY_SCHEME,
};
pub use transport::{control_router, ControlTransport, HttpControlTransport, InMemoryControlTransport};
