//! Test doubles for the command runner and the network engine.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::command::{command_line, CommandOutput, CommandRunner, SpawnedProcess};
use super::types::NodeHandle;
use super::NetworkEngine;
use crate::configuration::types::{ControllerSpec, SwitchSpec};
use crate::error_handling::types::EngineError;

/// Timeline shared between test doubles, for asserting the order of actions
/// that go through different seams.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Option<Journal>, line: &str) {
    if let Some(journal) = journal {
        journal.lock().unwrap().push(line.to_string());
    }
}

/// Records every command line and answers with success, unless the line
/// contains one of the registered failure patterns.
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, String)>>,
    next_pid: AtomicU32,
    journal: Option<Journal>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        RecordingRunner {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(40_000),
            journal: None,
        }
    }

    /// Also appends every command line to `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Makes every command whose line contains `pattern` fail with `stderr`.
    pub fn fail_on(&self, pattern: &str, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), stderr.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn answer(&self, line: String) -> CommandOutput {
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, stderr)| stderr.clone());
        note(&self.journal, &line);
        self.calls.lock().unwrap().push(line);
        match failure {
            Some(stderr) => CommandOutput::failure(stderr),
            None => CommandOutput::success(),
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        Ok(self.answer(command_line(program, args)))
    }

    async fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<SpawnedProcess> {
        self.answer(command_line(program, args));
        Ok(SpawnedProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            child: None,
        })
    }
}

/// In-memory firewall of one node, enough to follow `iptables -F/-I/-A/-P`.
#[derive(Debug, Default, Clone)]
pub struct FakeFirewall {
    pub filter: Vec<String>,
    pub nat: Vec<String>,
    pub policies: Vec<(String, String)>,
    pub ip_forward: bool,
}

impl FakeFirewall {
    fn apply(&mut self, argv: &[&str]) {
        match argv {
            ["iptables", "-F"] => self.filter.clear(),
            ["iptables", "-t", "nat", "-F"] => self.nat.clear(),
            ["iptables", "-P", chain, policy] => {
                self.policies.retain(|(c, _)| c.as_str() != *chain);
                self.policies.push((chain.to_string(), policy.to_string()));
            }
            ["iptables", "-I", rest @ ..] => self.filter.insert(0, rest.join(" ")),
            ["iptables", "-A", rest @ ..] => self.filter.push(rest.join(" ")),
            ["iptables", "-t", "nat", "-A", rest @ ..] => self.nat.push(rest.join(" ")),
            ["sysctl", "-w", setting] => {
                if let Some(value) = setting.strip_prefix("net.ipv4.ip_forward=") {
                    self.ip_forward = value == "1";
                }
            }
            _ => {}
        }
    }

    pub fn rule_count(&self) -> usize {
        self.filter.len() + self.nat.len()
    }
}

/// Network engine that only records what it is asked to do.
pub struct FakeEngine {
    nodes: Vec<NodeHandle>,
    pub exec_calls: Mutex<Vec<(String, String)>>,
    pub firewall: Mutex<FakeFirewall>,
    pub events: Vec<String>,
    exec_failures: Mutex<Vec<String>>,
    next_pid: u32,
    pub started: bool,
    journal: Option<Journal>,
}

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine {
            nodes: Vec::new(),
            exec_calls: Mutex::new(Vec::new()),
            firewall: Mutex::new(FakeFirewall::default()),
            events: Vec::new(),
            exec_failures: Mutex::new(Vec::new()),
            next_pid: 50_000,
            started: false,
            journal: None,
        }
    }

    /// Also appends every exec, as `[node] command`, to `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Makes `exec` report a failure for command lines containing `pattern`.
    pub fn fail_exec_on(&self, pattern: &str) {
        self.exec_failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn exec_lines(&self) -> Vec<String> {
        self.exec_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(node, line)| format!("[{}] {}", node, line))
            .collect()
    }

    pub fn firewall(&self) -> FakeFirewall {
        self.firewall.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkEngine for FakeEngine {
    async fn add_controller(&mut self, spec: &ControllerSpec) -> Result<(), EngineError> {
        self.events.push(format!("controller {}", spec.name));
        Ok(())
    }

    async fn add_switch(&mut self, spec: &SwitchSpec) -> Result<(), EngineError> {
        self.events.push(format!("switch {}", spec.name));
        Ok(())
    }

    async fn add_host(&mut self, name: &str) -> Result<NodeHandle, EngineError> {
        self.next_pid += 1;
        let node = NodeHandle::in_namespace(name, name, Some(self.next_pid));
        self.nodes.push(node.clone());
        self.events.push(format!("host {}", name));
        Ok(node)
    }

    async fn add_gateway_node(&mut self, name: &str) -> Result<NodeHandle, EngineError> {
        let node = NodeHandle::in_root_namespace(name);
        self.nodes.push(node.clone());
        self.events.push(format!("gateway {}", name));
        Ok(node)
    }

    async fn add_link(&mut self, node: &str, switch: &str) -> Result<String, EngineError> {
        let handle = self
            .nodes
            .iter_mut()
            .find(|n| n.name == node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;
        let intf = handle.next_interface_name();
        handle.interfaces.push(intf.clone());
        self.events.push(format!("link {} {}", node, switch));
        Ok(intf)
    }

    async fn add_switch_link(&mut self, left: &str, right: &str) -> Result<(), EngineError> {
        self.events.push(format!("switch-link {} {}", left, right));
        Ok(())
    }

    async fn set_ip(
        &mut self,
        node: &str,
        interface: &str,
        ip: &Ipv4Network,
    ) -> Result<(), EngineError> {
        self.events.push(format!("ip {} {} {}", node, interface, ip));
        Ok(())
    }

    async fn exec(&self, node: &NodeHandle, argv: &[&str]) -> Result<CommandOutput, EngineError> {
        if argv.is_empty() {
            return Err(EngineError::EmptyCommand);
        }
        let line = argv.join(" ");
        note(&self.journal, &format!("[{}] {}", node.name, line));
        self.exec_calls
            .lock()
            .unwrap()
            .push((node.name.clone(), line.clone()));

        let failing = self
            .exec_failures
            .lock()
            .unwrap()
            .iter()
            .any(|p| line.contains(p.as_str()));
        if failing {
            return Ok(CommandOutput::failure(format!("{}: simulated failure", argv[0])));
        }

        self.firewall.lock().unwrap().apply(argv);
        Ok(CommandOutput::success())
    }

    fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn nodes(&self) -> Vec<&NodeHandle> {
        self.nodes.iter().collect()
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        self.started = true;
        self.events.push("start".to_string());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        self.started = false;
        self.events.push("stop".to_string());
        Ok(())
    }
}
