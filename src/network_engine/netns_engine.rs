use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::command::{command_line, to_args, CommandOutput, CommandRunner, SpawnedProcess};
use super::types::NodeHandle;
use super::NetworkEngine;
use crate::configuration::types::{ControllerSpec, SwitchSpec};
use crate::error_handling::types::EngineError;

/// Network engine backed by `ip netns`, veth pairs and Open vSwitch.
///
/// Design notes:
/// - Every host gets a named namespace held open by a `sleep infinity` process,
///   whose pid is the reference used when reaping the namespace.
/// - Host interfaces are named `<node>-eth<N>` from 0, switch ports `<switch>-eth<N>`
///   from 1.
/// - The gateway node lives in the root namespace, so its veth end has to be
///   deleted explicitly on stop.
pub struct NetnsEngine {
    runner: Arc<dyn CommandRunner>,
    nodes: Vec<NodeHandle>,
    holders: Mutex<HashMap<String, SpawnedProcess>>,
    switches: Vec<SwitchSpec>,
    switch_ports: HashMap<String, usize>,
    controllers: Vec<ControllerSpec>,
    root_interfaces: Vec<String>,
    started: bool,
}

impl NetnsEngine {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        NetnsEngine {
            runner,
            nodes: Vec::new(),
            holders: Mutex::new(HashMap::new()),
            switches: Vec::new(),
            switch_ports: HashMap::new(),
            controllers: Vec::new(),
            root_interfaces: Vec::new(),
            started: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Runs a command in the root namespace and fails on a non-zero exit.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput, EngineError> {
        let args = to_args(args);
        let output = self.runner.run(program, &args).await?;
        if !output.is_success() {
            return Err(EngineError::CommandFailed {
                command: command_line(program, &args),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut NodeHandle, EngineError> {
        self.nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| EngineError::UnknownNode(name.to_string()))
    }

    fn next_switch_port(&mut self, switch: &str) -> Result<String, EngineError> {
        let port = self
            .switch_ports
            .get_mut(switch)
            .ok_or_else(|| EngineError::UnknownNode(switch.to_string()))?;
        *port += 1;
        Ok(format!("{}-eth{}", switch, port))
    }

    async fn exec_checked(&self, node: &NodeHandle, argv: &[&str]) -> Result<(), EngineError> {
        let output = self.exec(node, argv).await?;
        if !output.is_success() {
            return Err(EngineError::CommandFailed {
                command: format!("[{}] {}", node.name, argv.join(" ")),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkEngine for NetnsEngine {
    async fn add_controller(&mut self, spec: &ControllerSpec) -> Result<(), EngineError> {
        info!("Adding controller {} at {}:{}", spec.name, spec.ip, spec.port);
        self.controllers.push(spec.clone());
        Ok(())
    }

    async fn add_switch(&mut self, spec: &SwitchSpec) -> Result<(), EngineError> {
        info!("Adding switch {} (dpid {})", spec.name, spec.dpid);
        let dpid = format!("other-config:datapath-id={:016x}", spec.dpid);
        let protocols = format!("protocols={}", spec.protocols());
        self.run_checked(
            "ovs-vsctl",
            &[
                "--may-exist",
                "add-br",
                &spec.name,
                "--",
                "set",
                "Bridge",
                &spec.name,
                &dpid,
                &protocols,
            ],
        )
        .await?;

        self.switch_ports.insert(spec.name.clone(), 0);
        self.switches.push(spec.clone());
        Ok(())
    }

    async fn add_host(&mut self, name: &str) -> Result<NodeHandle, EngineError> {
        info!("Adding host {}", name);
        let output = self.runner.run("ip", &to_args(&["netns", "add", name])).await?;
        if !output.is_success() {
            if output.stderr.contains("File exists") {
                warn!("Namespace {} already exists, reusing", name);
            } else {
                return Err(EngineError::CommandFailed {
                    command: format!("ip netns add {}", name),
                    reason: output.stderr.trim().to_string(),
                });
            }
        }

        let holder = self
            .runner
            .spawn("ip", &to_args(&["netns", "exec", name, "sleep", "infinity"]))
            .await?;
        debug!("Namespace {} held open by pid {}", name, holder.pid);

        let node = NodeHandle::in_namespace(name, name, Some(holder.pid));
        self.holders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), holder);
        self.exec_checked(&node, &["ip", "link", "set", "lo", "up"])
            .await?;

        self.nodes.push(node.clone());
        Ok(node)
    }

    async fn add_gateway_node(&mut self, name: &str) -> Result<NodeHandle, EngineError> {
        info!("Adding gateway node {} in the root namespace", name);
        let node = NodeHandle::in_root_namespace(name);
        self.nodes.push(node.clone());
        Ok(node)
    }

    async fn add_link(&mut self, node: &str, switch: &str) -> Result<String, EngineError> {
        let node_handle = self
            .node(node)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;
        let node_if = node_handle.next_interface_name();
        let switch_if = self.next_switch_port(switch)?;
        info!("Adding link {} <-> {}", node_if, switch_if);

        self.run_checked(
            "ip",
            &["link", "add", &node_if, "type", "veth", "peer", "name", &switch_if],
        )
        .await?;

        match &node_handle.namespace {
            Some(ns) => {
                self.run_checked("ip", &["link", "set", &node_if, "netns", ns])
                    .await?;
            }
            None => self.root_interfaces.push(node_if.clone()),
        }

        self.run_checked("ovs-vsctl", &["add-port", switch, &switch_if])
            .await?;
        self.run_checked("ip", &["link", "set", &switch_if, "up"])
            .await?;
        self.exec_checked(&node_handle, &["ip", "link", "set", &node_if, "up"])
            .await?;

        self.node_mut(node)?.interfaces.push(node_if.clone());
        Ok(node_if)
    }

    async fn add_switch_link(&mut self, left: &str, right: &str) -> Result<(), EngineError> {
        let left_if = self.next_switch_port(left)?;
        let right_if = self.next_switch_port(right)?;
        info!("Adding switch link {} <-> {}", left_if, right_if);

        self.run_checked(
            "ip",
            &["link", "add", &left_if, "type", "veth", "peer", "name", &right_if],
        )
        .await?;
        self.root_interfaces.push(left_if.clone());

        for (switch, port) in [(left, &left_if), (right, &right_if)] {
            self.run_checked("ovs-vsctl", &["add-port", switch, port])
                .await?;
            self.run_checked("ip", &["link", "set", port, "up"]).await?;
        }
        Ok(())
    }

    async fn set_ip(
        &mut self,
        node: &str,
        interface: &str,
        ip: &Ipv4Network,
    ) -> Result<(), EngineError> {
        let handle = self
            .node(node)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;
        debug!("Assigning {} to {} on {}", ip, interface, node);
        let cidr = ip.to_string();
        self.exec_checked(&handle, &["ip", "addr", "add", &cidr, "dev", interface])
            .await
    }

    async fn exec(&self, node: &NodeHandle, argv: &[&str]) -> Result<CommandOutput, EngineError> {
        let (program, rest) = argv.split_first().ok_or(EngineError::EmptyCommand)?;
        let output = match &node.namespace {
            Some(ns) => {
                let mut args = vec!["netns", "exec", ns.as_str(), *program];
                args.extend_from_slice(rest);
                self.runner.run("ip", &to_args(&args)).await?
            }
            None => self.runner.run(program, &to_args(rest)).await?,
        };
        Ok(output)
    }

    fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn nodes(&self) -> Vec<&NodeHandle> {
        self.nodes.iter().collect()
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        info!("Starting {} switches", self.switches.len());
        let targets: Vec<String> = self
            .controllers
            .iter()
            .map(|c| format!("tcp:{}:{}", c.ip, c.port))
            .collect();

        for switch in &self.switches {
            if !targets.is_empty() {
                let mut args = vec!["set-controller", switch.name.as_str()];
                args.extend(targets.iter().map(String::as_str));
                self.run_checked("ovs-vsctl", &args).await?;
            }
            self.run_checked("ip", &["link", "set", &switch.name, "up"])
                .await?;
        }

        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        info!("Stopping network");

        for switch in &self.switches {
            if let Err(e) = self
                .run_checked("ovs-vsctl", &["--if-exists", "del-br", &switch.name])
                .await
            {
                warn!("Failed to delete switch {}: {}", switch.name, e);
            }
        }

        for interface in &self.root_interfaces {
            // Already gone when the peer went away with its bridge or namespace.
            let _ = self.run_checked("ip", &["link", "del", interface]).await;
        }

        let holders: Vec<(String, SpawnedProcess)> = self
            .holders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();

        for (name, mut holder) in holders {
            if let Some(mut child) = holder.child.take() {
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop namespace holder of {}: {}", name, e);
                }
            }
            let output = self.runner.run("ip", &to_args(&["netns", "del", &name])).await;
            match output {
                Ok(out) if !out.is_success() => {
                    warn!("Failed to delete namespace {}: {}", name, out.stderr.trim())
                }
                Err(e) => warn!("Failed to delete namespace {}: {}", name, e),
                Ok(_) => debug!("Deleted namespace {}", name),
            }
        }

        self.nodes.clear();
        self.switches.clear();
        self.switch_ports.clear();
        self.root_interfaces.clear();
        self.started = false;
        Ok(())
    }
}
