use log::{debug, error, info};
use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::template::SshdTemplate;
use crate::error_handling::types::ServiceError;
use crate::network_engine::{NetworkEngine, NodeHandle};
use crate::overlay_mount::LabHostState;

const SSHD_BINARY: &str = "/usr/sbin/sshd";

/// Starts and stops the per-host SSH daemon.
///
/// Each daemon runs inside the host's network namespace with a configuration
/// rendered into the host's merged root, and writes its pid to
/// `<lab_root>/<host>/sshd.pid`, outside the overlay.
pub struct ManagementServiceController {
    template: SshdTemplate,
    authorized_keys: Option<PathBuf>,
}

impl ManagementServiceController {
    pub fn new(template: SshdTemplate, authorized_keys: Option<PathBuf>) -> Self {
        ManagementServiceController {
            template,
            authorized_keys,
        }
    }

    /// Installs keys and configuration into the host root, then launches sshd.
    pub async fn start(
        &self,
        engine: &dyn NetworkEngine,
        state: &LabHostState,
    ) -> Result<(), ServiceError> {
        let merged = state.merged_dir();
        if !state.is_mounted() || !merged.is_dir() {
            return Err(ServiceError::RootNotMounted(state.name.clone()));
        }
        let node = host_node(state)?;

        if let Some(keys) = &self.authorized_keys {
            install_authorized_keys(keys, merged)?;
        }

        let config_path = merged.join("etc/ssh/sshd_config");
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut vars = HashMap::new();
        vars.insert("pid_file", state.pid_file().display().to_string());
        vars.insert("host_dir", merged.display().to_string());
        std::fs::write(&config_path, self.template.render(&vars))?;
        debug!("Wrote {}", config_path.display());

        info!("Starting ssh server on {}", state.name);
        let config_arg = config_path.display().to_string();
        let output = engine.exec(node, &[SSHD_BINARY, "-f", config_arg.as_str()]).await?;
        if !output.is_success() {
            error!("sshd failed on {}: {}", state.name, output.stderr.trim());
            return Err(ServiceError::StartFailed(format!(
                "{}: {}",
                state.name,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Kills the daemon whose pid is recorded in the host's pid file.
    pub async fn stop(
        &self,
        engine: &dyn NetworkEngine,
        state: &LabHostState,
    ) -> Result<(), ServiceError> {
        info!("Stopping ssh server on {}", state.name);
        let node = host_node(state)?;
        let pid = read_pid_file(state.pid_file())?;

        let pid_arg = pid.to_string();
        let output = engine.exec(node, &["kill", pid_arg.as_str()]).await?;
        if !output.is_success() {
            return Err(ServiceError::StopFailed(format!(
                "kill {} on {}: {}",
                pid,
                state.name,
                output.stderr.trim()
            )));
        }
        debug!("Sent SIGTERM to sshd {} on {}", pid, state.name);
        Ok(())
    }
}

fn host_node(state: &LabHostState) -> Result<&NodeHandle, ServiceError> {
    state
        .node
        .as_ref()
        .ok_or_else(|| ServiceError::StartFailed(format!("{} has no network node", state.name)))
}

fn install_authorized_keys(keys: &Path, merged: &Path) -> Result<(), ServiceError> {
    let ssh_dir = merged.join("root/.ssh");
    if !ssh_dir.exists() {
        if let Some(home) = ssh_dir.parent() {
            std::fs::create_dir_all(home)?;
        }
        std::fs::DirBuilder::new().mode(0o700).create(&ssh_dir)?;
    }
    std::fs::copy(keys, ssh_dir.join("authorized_keys"))?;
    debug!("Installed {} into {}", keys.display(), ssh_dir.display());
    Ok(())
}

fn read_pid_file(path: &Path) -> Result<u32, ServiceError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ServiceError::PidFileUnreadable(format!("{}: {}", path.display(), e)))?;
    content.trim().parse::<u32>().map_err(|_| {
        ServiceError::PidFileUnreadable(format!(
            "{}: invalid pid {:?}",
            path.display(),
            content.trim()
        ))
    })
}
