use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::lab_lock::LabLock;
use super::lab_state::LabState;
use crate::configuration::config::{LabConfig, Topology};
use crate::configuration::types::HostSpec;
use crate::error_handling::types::{EngineError, LabError};
use crate::management_service::{ManagementServiceController, SshdTemplate};
use crate::namespace_reaper::NamespaceProcessReaper;
use crate::nat_gateway::NatGateway;
use crate::network_engine::command::{command_line, CommandRunner};
use crate::network_engine::{NetworkEngine, NodeHandle};
use crate::overlay_mount::{LabHostState, OverlayMountManager};
use crate::session_management::InteractiveSession;

/// Pause between stopping a host's sshd and killing what is left in its namespace.
const SERVICE_STOP_PAUSE: Duration = Duration::from_secs(1);

/// Drives a lab through provisioning, the interactive session and teardown.
///
/// Every kernel resource the controller creates is recorded as it is created, so
/// that a failure at any point undoes exactly what exists: the hosts mounted so
/// far, the services started so far, and NAT if it was installed.
pub struct LabController<E: NetworkEngine> {
    config: LabConfig,
    topology: Topology,
    engine: E,
    runner: Arc<dyn CommandRunner>,
    mounts: OverlayMountManager,
    reaper: NamespaceProcessReaper,
    services: Option<ManagementServiceController>,
    nat: NatGateway,
    state: LabState,
    hosts: Vec<LabHostState>,
    started_services: HashSet<String>,
    nat_node: Option<NodeHandle>,
    lock: Option<LabLock>,
    service_stop_pause: Duration,
}

impl<E: NetworkEngine> LabController<E> {
    /// Builds a controller for an already validated configuration and topology.
    ///
    /// Loads the sshd template when the configuration has an `ssh` block.
    pub fn new(
        config: LabConfig,
        topology: Topology,
        engine: E,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, LabError> {
        let services = match &config.ssh {
            Some(ssh) => {
                let template = SshdTemplate::load(&ssh.tmpl_dir, &ssh.template)?;
                Some(ManagementServiceController::new(
                    template,
                    ssh.authorized_keys.clone(),
                ))
            }
            None => {
                info!("No ssh block configured, hosts will run without sshd");
                None
            }
        };

        Ok(Self::assemble(config, topology, engine, runner, services))
    }

    /// Builds a controller that can only clean up: the sshd template is not
    /// loaded, so a lab whose templates or base image are gone can still be
    /// unmounted and reset.
    pub fn for_cleanup(
        config: LabConfig,
        topology: Topology,
        engine: E,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::assemble(config, topology, engine, runner, None)
    }

    fn assemble(
        config: LabConfig,
        topology: Topology,
        engine: E,
        runner: Arc<dyn CommandRunner>,
        services: Option<ManagementServiceController>,
    ) -> Self {
        LabController {
            mounts: OverlayMountManager::new(runner.clone()),
            reaper: NamespaceProcessReaper::new(),
            nat: NatGateway::new(),
            config,
            topology,
            engine,
            runner,
            services,
            state: LabState::Idle,
            hosts: Vec::new(),
            started_services: HashSet::new(),
            nat_node: None,
            lock: None,
            service_stop_pause: SERVICE_STOP_PAUSE,
        }
    }

    pub fn with_mount_manager(mut self, mounts: OverlayMountManager) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_reaper(mut self, reaper: NamespaceProcessReaper) -> Self {
        self.reaper = reaper;
        self
    }

    pub fn with_service_stop_pause(mut self, pause: Duration) -> Self {
        self.service_stop_pause = pause;
        self
    }

    pub fn state(&self) -> LabState {
        self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Hosts whose root filesystem is currently mounted.
    pub fn mounted_hosts(&self) -> &[LabHostState] {
        &self.hosts
    }

    /// Provisions the lab, hands control to `session`, and tears everything down
    /// once the session ends.
    ///
    /// A failure before the session starts triggers a full cleanup and is returned
    /// as [`LabError::Provisioning`].
    pub async fn run(&mut self, session: &mut dyn InteractiveSession) -> Result<(), LabError> {
        self.lock = Some(LabLock::acquire(&self.config.lab_dir)?);
        self.transition(LabState::Provisioning);

        if let Err(e) = self.provision().await {
            return Err(self.abort(e).await);
        }

        self.transition(LabState::Running);
        if let Err(e) = self.start_lab().await {
            return Err(self.abort(e).await);
        }

        let session_result = session.run(&self.engine).await;
        if let Err(e) = &session_result {
            error!("Interactive session failed: {}", e);
        }

        self.teardown().await;
        session_result
    }

    async fn provision(&mut self) -> Result<(), LabError> {
        let topology = self.topology.clone();

        for controller in &topology.controllers {
            info!("Adding controller {}", controller.name);
            self.engine
                .add_controller(controller)
                .await
                .map_err(|e| LabError::provisioning(format!("controller {}", controller.name), e))?;
        }

        info!("Adding switches");
        for switch in &topology.switches {
            self.engine
                .add_switch(switch)
                .await
                .map_err(|e| LabError::provisioning(format!("switch {}", switch.name), e))?;
        }

        info!("Adding hosts");
        for host in &topology.hosts {
            self.provision_host(host).await?;
        }

        let mut wired = HashSet::new();
        for switch in &topology.switches {
            for peer in &switch.links {
                let pair = if switch.name <= *peer {
                    (switch.name.clone(), peer.clone())
                } else {
                    (peer.clone(), switch.name.clone())
                };
                if !wired.insert(pair) {
                    debug!("Link {} <-> {} already wired", switch.name, peer);
                    continue;
                }
                self.engine
                    .add_switch_link(&switch.name, peer)
                    .await
                    .map_err(|e| {
                        LabError::provisioning(format!("link {} <-> {}", switch.name, peer), e)
                    })?;
            }
        }

        if let Some(nat) = topology.nat_config() {
            info!("Setting up NAT gateway node {}", nat.node_name);
            let step = format!("nat gateway {}", nat.node_name);
            self.engine
                .add_gateway_node(&nat.node_name)
                .await
                .map_err(|e| LabError::provisioning(step.clone(), e))?;
            let interface = self
                .engine
                .add_link(&nat.node_name, &nat.switch_name)
                .await
                .map_err(|e| LabError::provisioning(step.clone(), e))?;
            self.engine
                .set_ip(&nat.node_name, &interface, &nat.gateway_ip)
                .await
                .map_err(|e| LabError::provisioning(step.clone(), e))?;

            let gateway = self
                .engine
                .node(&nat.node_name)
                .cloned()
                .ok_or_else(|| {
                    LabError::provisioning(
                        step.clone(),
                        EngineError::UnknownNode(nat.node_name.clone()),
                    )
                })?;
            // Recorded first so that a partial rule set is flushed on failure.
            self.nat_node = Some(gateway.clone());
            self.nat
                .start(&self.engine, &nat, &gateway)
                .await
                .map_err(|e| LabError::provisioning("start nat", e))?;
        }

        Ok(())
    }

    async fn provision_host(&mut self, host: &HostSpec) -> Result<(), LabError> {
        let node = self
            .engine
            .add_host(&host.name)
            .await
            .map_err(|e| LabError::provisioning(format!("host {}", host.name), e))?;

        if host.is_manageable {
            let mut state = self
                .mounts
                .mount(&host.name, &self.config.rootfs, &self.config.lab_dir)
                .await
                .map_err(|e| LabError::provisioning(format!("mount {}", host.name), e))?;
            state.node = Some(node.clone());
            self.hosts.push(state);
        }

        for link in &host.links {
            let step = format!("link {} <-> {}", host.name, link.switch);
            let interface = self
                .engine
                .add_link(&host.name, &link.switch)
                .await
                .map_err(|e| LabError::provisioning(step.clone(), e))?;
            if let Some(ip) = &link.ip {
                self.engine
                    .set_ip(&host.name, &interface, ip)
                    .await
                    .map_err(|e| LabError::provisioning(step.clone(), e))?;
            }
        }

        let node = self.engine.node(&host.name).cloned().unwrap_or(node);
        if let Some(state) = self.hosts.iter_mut().find(|s| s.name == host.name) {
            state.node = Some(node.clone());
        }

        if let Some(gw) = host.gw {
            let gw = gw.to_string();
            let argv = ["ip", "route", "add", "default", "via", gw.as_str()];
            let output = self
                .engine
                .exec(&node, &argv)
                .await
                .map_err(|e| LabError::provisioning(format!("route {}", host.name), e))?;
            if !output.is_success() {
                return Err(LabError::provisioning(
                    format!("route {}", host.name),
                    EngineError::CommandFailed {
                        command: argv.join(" "),
                        reason: output.stderr.trim().to_string(),
                    },
                ));
            }
        }
        Ok(())
    }

    async fn start_lab(&mut self) -> Result<(), LabError> {
        if let Some(services) = &self.services {
            for state in &self.hosts {
                services
                    .start(&self.engine, state)
                    .await
                    .map_err(|e| LabError::provisioning(format!("sshd {}", state.name), e))?;
                self.started_services.insert(state.name.clone());
            }
        }

        info!("Starting network");
        self.engine
            .start()
            .await
            .map_err(|e| LabError::provisioning("start network", e))?;

        self.fix_switch_protocols()
            .await
            .map_err(|e| LabError::provisioning("switch protocols", e))?;
        Ok(())
    }

    /// Forces the OpenFlow versions of every bridge after the engine started them.
    async fn fix_switch_protocols(&self) -> Result<(), EngineError> {
        for switch in &self.topology.switches {
            let args = vec![
                "set".to_string(),
                "Bridge".to_string(),
                switch.name.clone(),
                format!("protocols={}", switch.protocols()),
            ];
            let output = self.runner.run("ovs-vsctl", &args).await?;
            if !output.is_success() {
                return Err(EngineError::CommandFailed {
                    command: command_line("ovs-vsctl", &args),
                    reason: output.stderr.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Normal shutdown after the session. Every step is attempted.
    async fn teardown(&mut self) {
        self.transition(LabState::TearingDown);
        self.release_hosts(true).await;
        self.release_shared().await;
        self.transition(LabState::Idle);
        info!("Lab stopped");
    }

    /// Undoes whatever provisioning managed to create, then returns the
    /// originating error.
    async fn abort(&mut self, cause: LabError) -> LabError {
        error!("{}", cause);
        self.transition(LabState::Cleanup);
        warn!("Cleaning up after failure");
        self.release_hosts(false).await;
        self.release_shared().await;
        self.transition(LabState::Failed);
        cause
    }

    /// Stops services, optionally reaps namespaces, and unmounts, host by host in
    /// declaration order.
    async fn release_hosts(&mut self, reap: bool) {
        let mut hosts = std::mem::take(&mut self.hosts);
        for state in hosts.iter_mut() {
            if self.started_services.remove(&state.name) {
                if let Some(services) = &self.services {
                    if let Err(e) = services.stop(&self.engine, state).await {
                        error!("Failed to stop sshd on {}: {}", state.name, e);
                    }
                    if !self.service_stop_pause.is_zero() {
                        tokio::time::sleep(self.service_stop_pause).await;
                    }
                }
            }

            if reap {
                match state.node.as_ref().and_then(|n| n.pid) {
                    Some(pid) => match self.reaper.kill_all(pid) {
                        Ok(killed) if !killed.is_empty() => {
                            info!("Killed {} leftover processes on {}", killed.len(), state.name)
                        }
                        Ok(_) => {}
                        Err(e) => error!("Failed to reap processes of {}: {}", state.name, e),
                    },
                    None => debug!("{} has no namespace reference process", state.name),
                }
            }

            if let Err(e) = self.mounts.unmount(state).await {
                error!("Failed to unmount {}: {}", state.name, e);
            }
        }
    }

    /// Stops NAT and the network, and releases the lab lock.
    async fn release_shared(&mut self) {
        if let Some(gateway) = self.nat_node.take() {
            if let Err(e) = self.nat.stop(&self.engine, &gateway).await {
                error!("Failed to stop NAT: {}", e);
            }
        }

        info!("Stopping network");
        if let Err(e) = self.engine.stop().await {
            error!("Failed to stop network: {}", e);
        }

        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    /// Removes the leftovers of a previous run using only the naming convention:
    /// unmounts every manageable host, deletes its tree with `hard_reset`, and
    /// flushes NAT state when the topology has a gateway.
    pub async fn cleanup(&mut self, hard_reset: bool) -> Result<(), LabError> {
        let _lock = LabLock::acquire(&self.config.lab_dir)?;
        info!(
            "Cleaning up lab in {}{}",
            self.config.lab_dir.display(),
            if hard_reset { " (hard reset)" } else { "" }
        );

        let mut first_error: Option<LabError> = None;
        let hosts: Vec<String> = self
            .topology
            .manageable_hosts()
            .map(|h| h.name.clone())
            .collect();

        for host in &hosts {
            if let Err(e) = self
                .mounts
                .unmount_by_convention(host, &self.config.lab_dir)
                .await
            {
                error!("Failed to clean up mounts of {}: {}", host, e);
                first_error.get_or_insert(e.into());
                continue;
            }
            if hard_reset {
                if let Err(e) = self.mounts.hard_reset(host, &self.config.lab_dir) {
                    error!("Failed to reset {}: {}", host, e);
                    first_error.get_or_insert(e.into());
                }
            }
        }

        if let Some(nat) = self.topology.nat_config() {
            let gateway = NodeHandle::in_root_namespace(&nat.node_name);
            if let Err(e) = self.nat.stop(&self.engine, &gateway).await {
                error!("Failed to flush NAT state: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Cleanup complete");
                Ok(())
            }
        }
    }

    fn transition(&mut self, next: LabState) {
        if !self.state.can_transition_to(next) {
            warn!("Unexpected lab state change {} -> {}", self.state, next);
        }
        debug!("Lab state {} -> {}", self.state, next);
        self.state = next;
    }
}
