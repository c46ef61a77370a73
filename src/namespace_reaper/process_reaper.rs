use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error_handling::types::ProcessError;

const DEFAULT_PROC_ROOT: &str = "/proc";

/// Delivers the kill signal to a process.
pub trait Signaller: Send + Sync {
    fn kill(&self, pid: u32) -> Result<(), ProcessError>;
}

/// Sends SIGKILL through `kill(2)`.
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|e| {
            ProcessError::SignalFailed {
                pid,
                reason: e.to_string(),
            }
        })
    }
}

/// Finds and kills the processes sharing a network namespace with a reference
/// process.
///
/// Namespace membership is decided by the identity of the `ns/net` entry
/// (device and inode), never by comparing link text.
pub struct NamespaceProcessReaper {
    proc_root: PathBuf,
    signaller: Box<dyn Signaller>,
}

impl Default for NamespaceProcessReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceProcessReaper {
    pub fn new() -> Self {
        NamespaceProcessReaper {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            signaller: Box::new(NixSignaller),
        }
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    pub fn with_signaller(mut self, signaller: Box<dyn Signaller>) -> Self {
        self.signaller = signaller;
        self
    }

    /// Pids in the same network namespace as `reference`, excluding `reference`,
    /// sorted ascending.
    pub fn list_namespace_processes(&self, reference: u32) -> Result<Vec<u32>, ProcessError> {
        let reference_ns = self.proc_root.join(reference.to_string()).join("ns/net");
        let identity = namespace_identity(&reference_ns).map_err(|e| {
            ProcessError::NamespaceUnavailable {
                pid: reference,
                reason: format!("{}: {}", reference_ns.display(), e),
            }
        })?;

        let entries = std::fs::read_dir(&self.proc_root).map_err(|e| {
            ProcessError::NamespaceUnavailable {
                pid: reference,
                reason: format!("{}: {}", self.proc_root.display(), e),
            }
        })?;

        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| *pid != reference)
            .filter(|pid| {
                let ns = self.proc_root.join(pid.to_string()).join("ns/net");
                // Processes exit while we scan, and kernel threads hide their ns.
                match namespace_identity(&ns) {
                    Ok(candidate) => candidate == identity,
                    Err(e) => {
                        debug!("Skipping pid {}: {}", pid, e);
                        false
                    }
                }
            })
            .collect();

        pids.sort_unstable();
        Ok(pids)
    }

    /// Sends SIGKILL to every process in the namespace of `reference` and returns
    /// the pids that were signalled. The reference itself is never signalled.
    pub fn kill_all(&self, reference: u32) -> Result<Vec<u32>, ProcessError> {
        let pids = self.list_namespace_processes(reference)?;
        if pids.is_empty() {
            debug!("No processes left in namespace of {}", reference);
            return Ok(pids);
        }

        info!(
            "Killing {} processes in namespace of {}: {:?}",
            pids.len(),
            reference,
            pids
        );
        let mut signalled = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.signaller.kill(pid) {
                Ok(()) => signalled.push(pid),
                Err(e) => warn!("{}", e),
            }
        }
        Ok(signalled)
    }
}

fn namespace_identity(path: &Path) -> std::io::Result<(u64, u64)> {
    let metadata = std::fs::metadata(path)?;
    Ok((metadata.dev(), metadata.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSignaller {
        killed: Arc<Mutex<Vec<u32>>>,
        refuse: Vec<u32>,
    }

    impl Signaller for RecordingSignaller {
        fn kill(&self, pid: u32) -> Result<(), ProcessError> {
            if self.refuse.contains(&pid) {
                return Err(ProcessError::SignalFailed {
                    pid,
                    reason: "EPERM".to_string(),
                });
            }
            self.killed.lock().unwrap().push(pid);
            Ok(())
        }
    }

    /// Builds `<root>/<pid>/ns/net` links pointing at one file per namespace.
    fn proc_tree(processes: &[(u32, &str)]) -> TempDir {
        let root = TempDir::new().unwrap();
        let namespaces = root.path().join("namespaces");
        std::fs::create_dir_all(&namespaces).unwrap();
        for (pid, ns) in processes {
            let target = namespaces.join(ns);
            if !target.exists() {
                std::fs::write(&target, ns).unwrap();
            }
            let ns_dir = root.path().join(pid.to_string()).join("ns");
            std::fs::create_dir_all(&ns_dir).unwrap();
            symlink(&target, ns_dir.join("net")).unwrap();
        }
        root
    }

    #[test]
    fn test_lists_only_processes_sharing_the_namespace() {
        let tree = proc_tree(&[
            (1, "root"),
            (300, "h1"),
            (120, "h1"),
            (121, "h2"),
            (455, "h1"),
        ]);
        let reaper = NamespaceProcessReaper::new().with_proc_root(tree.path());

        assert_eq!(reaper.list_namespace_processes(300).unwrap(), vec![120, 455]);
        assert_eq!(reaper.list_namespace_processes(121).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_scan_skips_broken_candidates() {
        let tree = proc_tree(&[(10, "h1"), (11, "h1")]);
        std::fs::create_dir_all(tree.path().join("12/ns")).unwrap();
        symlink(tree.path().join("gone"), tree.path().join("12/ns/net")).unwrap();
        std::fs::create_dir_all(tree.path().join("13")).unwrap();
        std::fs::create_dir_all(tree.path().join("self")).unwrap();
        let reaper = NamespaceProcessReaper::new().with_proc_root(tree.path());

        assert_eq!(reaper.list_namespace_processes(10).unwrap(), vec![11]);
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let tree = proc_tree(&[(10, "h1")]);
        let reaper = NamespaceProcessReaper::new().with_proc_root(tree.path());

        assert!(matches!(
            reaper.list_namespace_processes(99),
            Err(ProcessError::NamespaceUnavailable { pid: 99, .. })
        ));
    }

    #[test]
    fn test_kill_all_never_signals_the_reference() {
        let tree = proc_tree(&[(200, "h1"), (201, "h1"), (202, "h1"), (300, "h2")]);
        let killed = Arc::new(Mutex::new(Vec::new()));
        let reaper = NamespaceProcessReaper::new()
            .with_proc_root(tree.path())
            .with_signaller(Box::new(RecordingSignaller {
                killed: killed.clone(),
                refuse: Vec::new(),
            }));

        let signalled = reaper.kill_all(200).unwrap();

        assert_eq!(signalled, vec![201, 202]);
        assert_eq!(*killed.lock().unwrap(), vec![201, 202]);
        assert!(!killed.lock().unwrap().contains(&200));
    }

    #[test]
    fn test_kill_all_skips_failed_signals() {
        let tree = proc_tree(&[(200, "h1"), (201, "h1"), (202, "h1")]);
        let killed = Arc::new(Mutex::new(Vec::new()));
        let reaper = NamespaceProcessReaper::new()
            .with_proc_root(tree.path())
            .with_signaller(Box::new(RecordingSignaller {
                killed: killed.clone(),
                refuse: vec![201],
            }));

        assert_eq!(reaper.kill_all(200).unwrap(), vec![202]);
    }

    #[test]
    fn test_real_proc_scan_excludes_reference() {
        let reaper = NamespaceProcessReaper::new();
        let own = std::process::id();
        if let Ok(pids) = reaper.list_namespace_processes(own) {
            assert!(!pids.contains(&own));
        }
    }
}
