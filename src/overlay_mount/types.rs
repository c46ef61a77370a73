//! Per-host runtime records of the overlay subsystem.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::network_engine::NodeHandle;

/// On-disk layout of one host under the lab root directory.
///
/// Everything is derived from the host name and the lab root, which is what lets
/// a cleanup run find the mounts of a crashed previous run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub host_dir: PathBuf,
    pub work_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub merged_dir: PathBuf,
    pub pid_file: PathBuf,
}

impl HostLayout {
    pub fn new(host_name: &str, lab_root: &Path) -> Self {
        let host_dir = lab_root.join(host_name);
        HostLayout {
            work_dir: host_dir.join("work"),
            upper_dir: host_dir.join("upper"),
            merged_dir: host_dir.join("merged"),
            pid_file: host_dir.join("sshd.pid"),
            host_dir,
        }
    }

    pub fn proc_dir(&self) -> PathBuf {
        self.merged_dir.join("proc")
    }

    pub fn sys_dir(&self) -> PathBuf {
        self.merged_dir.join("sys")
    }

    /// Mount points in the order they are created: root, `proc`, `sys`.
    pub fn mount_points(&self) -> Vec<PathBuf> {
        vec![self.merged_dir.clone(), self.proc_dir(), self.sys_dir()]
    }
}

/// Runtime record of a manageable host, alive while its root is mounted.
#[derive(Debug, Clone)]
pub struct LabHostState {
    pub name: String,
    /// Read-only lower layer.
    pub base_image: PathBuf,
    pub layout: HostLayout,
    /// Active mount points in creation order.
    pub mount_points: Vec<PathBuf>,
    /// Node handle supplied by the network engine.
    pub node: Option<NodeHandle>,
    pub mounted_at: DateTime<Utc>,
}

impl LabHostState {
    pub fn new(name: &str, base_image: &Path, layout: HostLayout) -> Self {
        LabHostState {
            name: name.to_string(),
            base_image: base_image.to_path_buf(),
            layout,
            mount_points: Vec::new(),
            node: None,
            mounted_at: Utc::now(),
        }
    }

    /// Apparent root of the host.
    pub fn merged_dir(&self) -> &Path {
        &self.layout.merged_dir
    }

    pub fn pid_file(&self) -> &Path {
        &self.layout.pid_file
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_points.first() == Some(&self.layout.merged_dir)
    }
}
