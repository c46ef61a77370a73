//! Lab configuration and topology documents.
//!
//! Both documents are plain `serde` structures loaded from YAML (`.yaml`/`.yml`)
//! or TOML (anything else) and validated before any kernel state is touched.

pub mod config;
pub mod types;

pub use config::{LabConfig, Topology};
pub use types::{HostSpec, LinkSpec, NatConfig, SshSettings, SwitchSpec};
