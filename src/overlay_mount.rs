//! Copy-on-write root filesystems for lab hosts.

pub mod mount_manager;
pub mod types;

pub use mount_manager::OverlayMountManager;
pub use types::{HostLayout, LabHostState};
