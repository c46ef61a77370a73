//! Remote-access service (sshd) of manageable hosts.

pub mod service_controller;
pub mod template;

pub use service_controller::ManagementServiceController;
pub use template::SshdTemplate;
