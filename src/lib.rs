pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod management_service;
pub mod namespace_reaper;
pub mod nat_gateway;
pub mod network_engine;
pub mod overlay_mount;
pub mod session_management;

pub use controller::LabController;
pub use error_handling::types::LabError;
