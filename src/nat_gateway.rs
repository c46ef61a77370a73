//! NAT between the emulated network and the host's external interface.

pub mod gateway;

pub use gateway::NatGateway;
