use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error_handling::types::LabError;

pub const LOCK_FILE_NAME: &str = ".minilab.lock";

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Exclusive claim on a lab directory, released when dropped.
///
/// Two lab instances sharing a lab directory would unmount each other's hosts,
/// so only one may hold the lock at a time.
#[derive(Debug)]
pub struct LabLock {
    path: PathBuf,
    info: LockInfo,
}

impl LabLock {
    /// Creates `<lab_dir>/.minilab.lock`. A lock left by a dead process is replaced.
    pub fn acquire(lab_dir: &Path) -> Result<Self, LabError> {
        std::fs::create_dir_all(lab_dir).map_err(LabError::LockError)?;
        let path = lab_dir.join(LOCK_FILE_NAME);
        let info = LockInfo {
            pid: std::process::id(),
            instance_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let body = serde_json::to_string_pretty(&info)
                        .map_err(|e| LabError::LockError(e.into()))?;
                    file.write_all(body.as_bytes()).map_err(LabError::LockError)?;
                    info!(
                        "Acquired lab lock {} (instance {})",
                        path.display(),
                        info.instance_id
                    );
                    return Ok(LabLock { path, info });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match read_lock(&path) {
                        Some(holder) if is_process_alive(holder.pid) => {
                            return Err(LabError::Locked { pid: holder.pid });
                        }
                        Some(holder) => {
                            warn!(
                                "Replacing stale lab lock of dead process {} (instance {})",
                                holder.pid, holder.instance_id
                            );
                        }
                        None => warn!("Replacing unreadable lab lock {}", path.display()),
                    }
                    std::fs::remove_file(&path).map_err(LabError::LockError)?;
                }
                Err(e) => return Err(LabError::LockError(e)),
            }
        }

        Err(LabError::LockError(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} was recreated concurrently", path.display()),
        )))
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {}
}

impl Drop for LabLock {
    fn drop(&mut self) {
        // Only remove a lock that is still ours.
        match read_lock(&self.path) {
            Some(current) if current.instance_id == self.info.instance_id => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to remove lab lock {}: {}", self.path.display(), e);
                } else {
                    debug!("Released lab lock {}", self.path.display());
                }
            }
            _ => debug!("Lab lock {} is no longer ours", self.path.display()),
        }
    }
}

fn read_lock(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
