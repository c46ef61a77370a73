use super::types::*;
use crate::error_handling::types::ConfigError;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default location of the per-host overlay trees.
pub const DEFAULT_LAB_DIR: &str = "/var/minilab";

fn default_lab_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LAB_DIR)
}

/// Lab-wide settings, independent of any particular topology.
///
/// # Fields Overview
///
/// - `rootfs`: read-only base image used as the lower layer of every host overlay
/// - `lab_dir`: lab root directory holding `<host>/{work,upper,merged}`
/// - `ssh`: optional management service block; without it manageable hosts get an
///   isolated root but no sshd
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabConfig {
    pub rootfs: PathBuf,
    #[serde(default = "default_lab_dir")]
    pub lab_dir: PathBuf,
    #[serde(default)]
    pub ssh: Option<SshSettings>,
}

impl LabConfig {
    /// Reads and validates a lab configuration file.
    ///
    /// Files ending in `.yaml`/`.yml` are parsed as YAML, anything else as TOML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading lab configuration from {}", path.display());
        let config: LabConfig = parse_document(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a lab configuration for cleanup, which only needs `lab_dir`.
    ///
    /// The base image and the sshd templates may already be gone when a crashed
    /// lab is cleaned up, so they are not checked.
    pub fn from_file_for_cleanup(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading lab configuration from {} for cleanup", path.display());
        let config: LabConfig = parse_document(path)?;
        if config.lab_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("lab_dir".to_string()));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rootfs.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("rootfs".to_string()));
        }
        if !self.rootfs.is_dir() {
            return Err(ConfigError::DirectoryDoesNotExist(format!(
                "rootfs {} is not a directory",
                self.rootfs.display()
            )));
        }

        if let Some(ssh) = &self.ssh {
            if ssh.template.is_empty() {
                return Err(ConfigError::MissingField("ssh.template".to_string()));
            }
            if !ssh.tmpl_dir.is_dir() {
                return Err(ConfigError::DirectoryDoesNotExist(format!(
                    "ssh.tmpl_dir {} is not a directory",
                    ssh.tmpl_dir.display()
                )));
            }
        }

        debug!("Lab configuration validated: lab_dir={}", self.lab_dir.display());
        Ok(())
    }
}

/// Declarative description of the emulated network.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub controllers: Vec<ControllerSpec>,
    #[serde(default)]
    pub switches: Vec<SwitchSpec>,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub nat: Option<NatSpec>,
}

impl Topology {
    /// Reads and validates a topology file (YAML or TOML, by extension).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading topology from {}", path.display());
        let topology: Topology = parse_document(path)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Checks names and cross references before anything touches the kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut switches = HashSet::new();
        for switch in &self.switches {
            if switch.name.is_empty() {
                return Err(ConfigError::MissingField("switches[].name".to_string()));
            }
            if !switches.insert(switch.name.as_str()) {
                return Err(ConfigError::DuplicateName(format!("switch {}", switch.name)));
            }
        }

        for switch in &self.switches {
            for peer in &switch.links {
                if !switches.contains(peer.as_str()) {
                    return Err(ConfigError::UnknownSwitch(format!(
                        "{} (linked from switch {})",
                        peer, switch.name
                    )));
                }
            }
        }

        let mut hosts = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(ConfigError::MissingField("hosts[].name".to_string()));
            }
            if !hosts.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateName(format!("host {}", host.name)));
            }
            for link in &host.links {
                if !switches.contains(link.switch.as_str()) {
                    return Err(ConfigError::UnknownSwitch(format!(
                        "{} (linked from host {})",
                        link.switch, host.name
                    )));
                }
            }
        }

        if let Some(nat) = &self.nat {
            if !switches.contains(nat.switch.name.as_str()) {
                return Err(ConfigError::UnknownSwitch(format!(
                    "{} (nat gateway switch)",
                    nat.switch.name
                )));
            }
            if hosts.contains(nat.node.name.as_str()) {
                return Err(ConfigError::DuplicateName(format!(
                    "nat node {} clashes with a host",
                    nat.node.name
                )));
            }
            if nat.ext_iface.is_empty() {
                return Err(ConfigError::MissingField("nat.ext_iface".to_string()));
            }
        }

        debug!(
            "Topology validated: {} controllers, {} switches, {} hosts, nat={}",
            self.controllers.len(),
            self.switches.len(),
            self.hosts.len(),
            self.nat.is_some()
        );
        Ok(())
    }

    /// Hosts that receive an isolated root, in declaration order.
    pub fn manageable_hosts(&self) -> impl Iterator<Item = &HostSpec> {
        self.hosts.iter().filter(|h| h.is_manageable)
    }

    pub fn nat_config(&self) -> Option<NatConfig> {
        self.nat.as_ref().map(NatConfig::from)
    }
}

fn parse_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::YamlError(e.to_string()))
        }
        _ => toml::from_str(&contents).map_err(|e| ConfigError::TomlError(e.to_string())),
    }
}
