use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::types::{HostLayout, LabHostState};
use crate::error_handling::types::MountError;
use crate::network_engine::command::{command_line, CommandRunner};

const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";
const DEFAULT_UNMOUNT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Creates and destroys the copy-on-write root filesystem of each host.
///
/// Design notes:
/// - The overlay uses the base image as its read-only lower layer and
///   `<lab_root>/<host>/{upper,work}` as writable layer and scratch area, exposed at
///   `<lab_root>/<host>/merged`.
/// - `proc` and `sys` are mounted inside the merged root after the overlay, and
///   unmounted before it.
/// - Unmounting is best effort: every recorded point is attempted, and a busy target
///   is retried a bounded number of times.
pub struct OverlayMountManager {
    runner: Arc<dyn CommandRunner>,
    mountinfo: PathBuf,
    unmount_attempts: u32,
    retry_delay: Duration,
}

impl OverlayMountManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        OverlayMountManager {
            runner,
            mountinfo: PathBuf::from(DEFAULT_MOUNTINFO),
            unmount_attempts: DEFAULT_UNMOUNT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Reads the kernel mount table from `path` instead of `/proc/self/mountinfo`.
    pub fn with_mountinfo(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo = path.into();
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.unmount_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Mounts the isolated root of `host_name` and returns its state.
    ///
    /// The directory tree is only created when missing, so a host provisioned by an
    /// earlier run is re-attached with its upper layer intact. If any mount fails,
    /// the mounts already made are undone before the error is returned.
    pub async fn mount(
        &self,
        host_name: &str,
        base_image: &Path,
        lab_root: &Path,
    ) -> Result<LabHostState, MountError> {
        info!("Mounting filesystem for {}", host_name);
        let layout = HostLayout::new(host_name, lab_root);

        for dir in [
            lab_root,
            &layout.host_dir,
            &layout.work_dir,
            &layout.upper_dir,
            &layout.merged_dir,
        ] {
            if !dir.exists() {
                debug!("Creating directory {}", dir.display());
                std::fs::create_dir_all(dir)?;
            }
        }

        let mut state = LabHostState::new(host_name, base_image, layout.clone());

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            base_image.display(),
            layout.upper_dir.display(),
            layout.work_dir.display()
        );
        let steps: [(&str, &str, Option<String>, PathBuf); 3] = [
            ("overlay", "overlay", Some(options), layout.merged_dir.clone()),
            ("proc", "proc", None, layout.proc_dir()),
            ("sysfs", "sysfs", None, layout.sys_dir()),
        ];

        for (fstype, source, options, target) in steps {
            let result = self
                .mount_one(fstype, source, options.as_deref(), &target)
                .await;
            if let Err(e) = result {
                error!("Mount of {} for {} failed: {}", target.display(), host_name, e);
                if let Err(undo) = self.unmount(&mut state).await {
                    warn!("Rollback of {} left mounts behind: {}", host_name, undo);
                }
                return Err(e);
            }
            state.mount_points.push(target);
        }

        debug!(
            "Mounted {} points for {}: {:?}",
            state.mount_points.len(),
            host_name,
            state.mount_points
        );
        Ok(state)
    }

    /// Unmounts the recorded mount points of `state` in reverse creation order.
    ///
    /// Every point is attempted; the first failure is returned once all attempts
    /// are done. The record is empty afterwards.
    pub async fn unmount(&self, state: &mut LabHostState) -> Result<(), MountError> {
        info!(
            "Unmounting filesystem for {} (mounted at {})",
            state.name,
            state.mounted_at.format("%Y-%m-%d %H:%M:%S")
        );
        let points: Vec<PathBuf> = state.mount_points.drain(..).rev().collect();
        self.unmount_all(&points).await
    }

    /// Unmounts the conventional mount points of a host, whether or not this
    /// process created them. Points absent from the mount table are skipped.
    ///
    /// `lab_root` may be relative or go through symlinks; it is resolved before
    /// being compared with the kernel mount table.
    pub async fn unmount_by_convention(
        &self,
        host_name: &str,
        lab_root: &Path,
    ) -> Result<(), MountError> {
        info!("Cleaning up mounts of {}", host_name);
        let layout = HostLayout::new(host_name, &resolve_path(lab_root));
        let mounted = self.mounted_points()?;

        let points: Vec<PathBuf> = layout
            .mount_points()
            .into_iter()
            .rev()
            .filter(|p| {
                let active = mounted.iter().any(|m| m == p);
                if !active {
                    debug!("{} is not mounted, skipping", p.display());
                }
                active
            })
            .collect();

        self.unmount_all(&points).await
    }

    /// Deletes the whole per-host directory tree.
    ///
    /// Refuses to run while any of the host's mount points is still mounted.
    pub fn hard_reset(&self, host_name: &str, lab_root: &Path) -> Result<(), MountError> {
        let layout = HostLayout::new(host_name, &resolve_path(lab_root));
        let mounted = self.mounted_points()?;
        if let Some(live) = layout
            .mount_points()
            .into_iter()
            .find(|p| mounted.contains(p))
        {
            return Err(MountError::UnmountFailed {
                target: live,
                reason: "still mounted, refusing to delete host tree".to_string(),
            });
        }

        if layout.host_dir.exists() {
            info!("Deleting {}", layout.host_dir.display());
            std::fs::remove_dir_all(&layout.host_dir)?;
        } else {
            debug!("{} does not exist, nothing to delete", layout.host_dir.display());
        }
        Ok(())
    }

    pub fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let target = resolve_path(target);
        Ok(self.mounted_points()?.iter().any(|p| *p == target))
    }

    async fn unmount_all(&self, points: &[PathBuf]) -> Result<(), MountError> {
        let mut first_error = None;
        for point in points {
            if let Err(e) = self.unmount_one(point).await {
                error!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn mount_one(
        &self,
        fstype: &str,
        source: &str,
        options: Option<&str>,
        target: &Path,
    ) -> Result<(), MountError> {
        if !target.exists() {
            std::fs::create_dir_all(target)?;
        }

        let mut args = vec!["-t".to_string(), fstype.to_string(), source.to_string()];
        if let Some(options) = options {
            args.push("-o".to_string());
            args.push(options.to_string());
        }
        args.push(target.display().to_string());

        let output = self.runner.run("mount", &args).await?;
        if !output.is_success() {
            return Err(MountError::MountFailed {
                target: target.to_path_buf(),
                reason: format!("{}: {}", command_line("mount", &args), output.stderr.trim()),
            });
        }
        debug!("Mounted {} at {}", fstype, target.display());
        Ok(())
    }

    async fn unmount_one(&self, target: &Path) -> Result<(), MountError> {
        let args = vec![target.display().to_string()];
        let mut attempt = 1;
        loop {
            let output = self.runner.run("umount", &args).await?;
            if output.is_success() {
                debug!("Unmounted {}", target.display());
                return Ok(());
            }

            let reason = output.stderr.trim().to_string();
            if reason.contains("busy") && attempt < self.unmount_attempts {
                warn!(
                    "{} is busy (attempt {}/{}), retrying in {:?}",
                    target.display(),
                    attempt,
                    self.unmount_attempts,
                    self.retry_delay
                );
                attempt += 1;
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }

            return Err(MountError::UnmountFailed {
                target: target.to_path_buf(),
                reason,
            });
        }
    }

    /// Mount points currently listed in the kernel mount table.
    fn mounted_points(&self) -> Result<Vec<PathBuf>, MountError> {
        let table = std::fs::read_to_string(&self.mountinfo)?;
        Ok(table
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .map(|field| PathBuf::from(unescape_mount_field(field)))
            .collect())
    }
}

/// Absolute, symlink-free form of `path`, the way the kernel lists mount points.
///
/// A path that does not exist cannot carry a mount; it is only made absolute.
fn resolve_path(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(_) => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// Decodes the `\NNN` octal escapes the kernel uses for spaces and the like.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_engine::mock::RecordingRunner;
    use tempfile::TempDir;

    fn manager(runner: &Arc<RecordingRunner>) -> OverlayMountManager {
        OverlayMountManager::new(runner.clone()).with_retry(3, Duration::ZERO)
    }

    /// The kernel reports mount points with symlinks resolved.
    fn canonical_root(dir: &TempDir) -> PathBuf {
        dir.path().canonicalize().unwrap()
    }

    fn mountinfo_line(id: u32, target: &Path) -> String {
        format!(
            "{} 1 0:{} / {} rw,relatime shared:1 - overlay overlay rw\n",
            id,
            id,
            target.display()
        )
    }

    #[tokio::test]
    async fn test_mount_creates_tree_and_records_points_in_order() {
        let lab = TempDir::new().unwrap();
        let lab_root = lab.path().join("lab");
        let runner = Arc::new(RecordingRunner::new());

        let state = manager(&runner)
            .mount("h1", Path::new("/img/base"), &lab_root)
            .await
            .unwrap();

        assert_eq!(state.merged_dir(), lab_root.join("h1/merged"));
        assert!(lab_root.join("h1/work").is_dir());
        assert!(lab_root.join("h1/upper").is_dir());
        assert!(lab_root.join("h1/merged/proc").is_dir());
        assert!(lab_root.join("h1/merged/sys").is_dir());
        assert!(state.is_mounted());
        assert_eq!(
            state.mount_points,
            vec![
                lab_root.join("h1/merged"),
                lab_root.join("h1/merged/proc"),
                lab_root.join("h1/merged/sys"),
            ]
        );

        let mounts = runner.calls_starting_with("mount");
        assert_eq!(mounts.len(), 3);
        assert_eq!(
            mounts[0],
            format!(
                "mount -t overlay overlay -o lowerdir=/img/base,upperdir={},workdir={} {}",
                lab_root.join("h1/upper").display(),
                lab_root.join("h1/work").display(),
                lab_root.join("h1/merged").display()
            )
        );
        assert!(mounts[1].starts_with("mount -t proc proc"));
        assert!(mounts[2].starts_with("mount -t sysfs sysfs"));
    }

    #[tokio::test]
    async fn test_mount_keeps_existing_upper_layer() {
        let lab = TempDir::new().unwrap();
        let upper = lab.path().join("h1/upper");
        std::fs::create_dir_all(&upper).unwrap();
        std::fs::write(upper.join("notes.txt"), "kept").unwrap();
        let runner = Arc::new(RecordingRunner::new());

        manager(&runner)
            .mount("h1", Path::new("/img/base"), lab.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(upper.join("notes.txt")).unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_unmount_reverses_creation_order() {
        let lab = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = manager(&runner);
        let mut state = manager
            .mount("h1", Path::new("/img/base"), lab.path())
            .await
            .unwrap();

        manager.unmount(&mut state).await.unwrap();

        let merged = lab.path().join("h1/merged");
        assert_eq!(
            runner.calls_starting_with("umount"),
            vec![
                format!("umount {}", merged.join("sys").display()),
                format!("umount {}", merged.join("proc").display()),
                format!("umount {}", merged.display()),
            ]
        );
        assert!(state.mount_points.is_empty());
        assert!(!state.is_mounted());
    }

    #[tokio::test]
    async fn test_unmount_of_empty_state_does_nothing() {
        let runner = Arc::new(RecordingRunner::new());
        let mut state = LabHostState::new(
            "h1",
            Path::new("/img/base"),
            HostLayout::new("h1", Path::new("/var/minilab")),
        );

        manager(&runner).unmount(&mut state).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mount_rolls_back_previous_points() {
        let lab = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("mount -t sysfs", "mount: permission denied");

        let result = manager(&runner)
            .mount("h1", Path::new("/img/base"), lab.path())
            .await;

        assert!(matches!(result, Err(MountError::MountFailed { .. })));
        let merged = lab.path().join("h1/merged");
        assert_eq!(
            runner.calls_starting_with("umount"),
            vec![
                format!("umount {}", merged.join("proc").display()),
                format!("umount {}", merged.display()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unmount_continues_past_failures() {
        let lab = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = manager(&runner);
        let mut state = manager
            .mount("h1", Path::new("/img/base"), lab.path())
            .await
            .unwrap();
        runner.fail_on("merged/proc", "umount: not mounted");

        let result = manager.unmount(&mut state).await;

        assert!(matches!(result, Err(MountError::UnmountFailed { .. })));
        assert_eq!(runner.calls_starting_with("umount").len(), 3);
    }

    #[tokio::test]
    async fn test_busy_target_is_retried_a_bounded_number_of_times() {
        let lab = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = manager(&runner);
        let mut state = manager
            .mount("h1", Path::new("/img/base"), lab.path())
            .await
            .unwrap();
        runner.fail_on("merged/sys", "umount: target is busy");

        let result = manager.unmount(&mut state).await;

        assert!(result.is_err());
        let sys_attempts = runner
            .calls_starting_with("umount")
            .into_iter()
            .filter(|c| c.ends_with("merged/sys"))
            .count();
        assert_eq!(sys_attempts, 3);
    }

    #[tokio::test]
    async fn test_unmount_by_convention_skips_unmounted_points() {
        let lab = TempDir::new().unwrap();
        let merged = canonical_root(&lab).join("h1/merged");
        let mountinfo = lab.path().join("mountinfo");
        std::fs::write(
            &mountinfo,
            format!(
                "{}{}",
                mountinfo_line(30, &merged),
                mountinfo_line(31, &merged.join("proc"))
            ),
        )
        .unwrap();
        let runner = Arc::new(RecordingRunner::new());

        manager(&runner)
            .with_mountinfo(&mountinfo)
            .unmount_by_convention("h1", lab.path())
            .await
            .unwrap();

        assert_eq!(
            runner.calls_starting_with("umount"),
            vec![
                format!("umount {}", merged.join("proc").display()),
                format!("umount {}", merged.display()),
            ]
        );
    }

    #[test]
    fn test_hard_reset_deletes_host_tree() {
        let lab = TempDir::new().unwrap();
        std::fs::create_dir_all(lab.path().join("h1/upper/etc")).unwrap();
        let mountinfo = lab.path().join("mountinfo");
        std::fs::write(&mountinfo, "").unwrap();
        let runner = Arc::new(RecordingRunner::new());

        manager(&runner)
            .with_mountinfo(&mountinfo)
            .hard_reset("h1", lab.path())
            .unwrap();

        assert!(!lab.path().join("h1").exists());
    }

    #[test]
    fn test_hard_reset_refuses_mounted_root() {
        let lab = TempDir::new().unwrap();
        let merged = canonical_root(&lab).join("h1/merged");
        std::fs::create_dir_all(&merged).unwrap();
        let mountinfo = lab.path().join("mountinfo");
        std::fs::write(&mountinfo, mountinfo_line(30, &merged)).unwrap();
        let runner = Arc::new(RecordingRunner::new());

        let result = manager(&runner)
            .with_mountinfo(&mountinfo)
            .hard_reset("h1", lab.path());

        assert!(matches!(result, Err(MountError::UnmountFailed { .. })));
        assert!(merged.exists());
    }

    #[tokio::test]
    async fn test_unmount_by_convention_resolves_indirect_lab_root() {
        let lab = TempDir::new().unwrap();
        std::fs::create_dir_all(lab.path().join("sub")).unwrap();
        let merged = canonical_root(&lab).join("h1/merged");
        let mountinfo = lab.path().join("mountinfo");
        std::fs::write(
            &mountinfo,
            format!(
                "{}{}{}",
                mountinfo_line(30, &merged),
                mountinfo_line(31, &merged.join("proc")),
                mountinfo_line(32, &merged.join("sys"))
            ),
        )
        .unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = manager(&runner).with_mountinfo(&mountinfo);
        let indirect = lab.path().join("sub/..");

        manager.unmount_by_convention("h1", &indirect).await.unwrap();

        assert_eq!(
            runner.calls_starting_with("umount"),
            vec![
                format!("umount {}", merged.join("sys").display()),
                format!("umount {}", merged.join("proc").display()),
                format!("umount {}", merged.display()),
            ]
        );
    }

    #[test]
    fn test_hard_reset_sees_mounts_through_symlinked_lab_root() {
        let lab = TempDir::new().unwrap();
        let real_root = canonical_root(&lab).join("real");
        std::fs::create_dir_all(real_root.join("h1/merged/proc")).unwrap();
        let link = lab.path().join("lab");
        std::os::unix::fs::symlink(&real_root, &link).unwrap();
        let mountinfo = lab.path().join("mountinfo");
        std::fs::write(&mountinfo, mountinfo_line(31, &real_root.join("h1/merged/proc"))).unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let manager = manager(&runner).with_mountinfo(&mountinfo);

        let result = manager.hard_reset("h1", &link.join("..").join("lab"));

        assert!(matches!(result, Err(MountError::UnmountFailed { ref target, .. })
            if *target == real_root.join("h1/merged/proc")));
        assert!(real_root.join("h1/merged").exists());
        assert!(manager.is_mounted(&link.join("h1/merged/proc")).unwrap());
    }

    #[test]
    fn test_mount_field_unescaping() {
        assert_eq!(unescape_mount_field("/lab/my\\040host"), "/lab/my host");
        assert_eq!(unescape_mount_field("/plain/path"), "/plain/path");
        assert_eq!(unescape_mount_field("/trailing\\04"), "/trailing\\04");
    }
}
