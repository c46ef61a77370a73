//! Network emulation engine.
//!
//! The lab lifecycle treats the engine as a topology-wiring and command-execution
//! service: it asks for controllers, switches, hosts and links, and runs commands
//! scoped to a node's network namespace. [`NetnsEngine`] implements it with
//! `ip netns`, veth pairs and Open vSwitch bridges.

pub mod command;
#[cfg(test)]
pub mod mock;
pub mod netns_engine;
pub mod types;

pub use command::{CommandOutput, CommandRunner, SpawnedProcess, SystemRunner};
pub use netns_engine::NetnsEngine;
pub use types::NodeHandle;

use crate::configuration::types::{ControllerSpec, SwitchSpec};
use crate::error_handling::types::EngineError;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;

#[async_trait]
pub trait NetworkEngine: Send + Sync {
    async fn add_controller(&mut self, spec: &ControllerSpec) -> Result<(), EngineError>;

    async fn add_switch(&mut self, spec: &SwitchSpec) -> Result<(), EngineError>;

    /// Creates a host with its own network namespace.
    async fn add_host(&mut self, name: &str) -> Result<NodeHandle, EngineError>;

    /// Creates a node living in the root namespace (used for the NAT gateway).
    async fn add_gateway_node(&mut self, name: &str) -> Result<NodeHandle, EngineError>;

    /// Cables `node` to `switch` and returns the node-side interface name.
    async fn add_link(&mut self, node: &str, switch: &str) -> Result<String, EngineError>;

    async fn add_switch_link(&mut self, left: &str, right: &str) -> Result<(), EngineError>;

    async fn set_ip(&mut self, node: &str, interface: &str, ip: &Ipv4Network)
        -> Result<(), EngineError>;

    /// Runs `argv` inside the node's network namespace.
    async fn exec(&self, node: &NodeHandle, argv: &[&str]) -> Result<CommandOutput, EngineError>;

    fn node(&self, name: &str) -> Option<&NodeHandle>;

    fn nodes(&self) -> Vec<&NodeHandle>;

    async fn start(&mut self) -> Result<(), EngineError>;

    /// Tears the emulated network down. Best effort.
    async fn stop(&mut self) -> Result<(), EngineError>;
}
