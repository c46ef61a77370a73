use log::{debug, error, info, warn};

use crate::configuration::types::NatConfig;
use crate::error_handling::types::NatError;
use crate::network_engine::{NetworkEngine, NodeHandle};

/// Forwarding and masquerading rules between the lab network and the outside.
///
/// Rules are installed from the gateway node. Every start begins by flushing
/// the filter and nat tables, so repeating it never accumulates rules.
#[derive(Debug, Default)]
pub struct NatGateway;

impl NatGateway {
    pub fn new() -> Self {
        NatGateway
    }

    /// Command lines installing NAT for `config` behind internal interface `internal`.
    pub fn start_commands(config: &NatConfig, internal: &str) -> Vec<Vec<String>> {
        let network = config.lab_subnet().to_string();
        let network = network.as_str();
        let external = config.external_interface.as_str();
        let lines: Vec<Vec<&str>> = vec![
            vec!["iptables", "-F"],
            vec!["iptables", "-t", "nat", "-F"],
            vec!["iptables", "-P", "INPUT", "ACCEPT"],
            vec!["iptables", "-P", "OUTPUT", "ACCEPT"],
            vec!["iptables", "-P", "FORWARD", "DROP"],
            vec!["iptables", "-I", "FORWARD", "-i", internal, "-d", network, "-j", "DROP"],
            vec!["iptables", "-A", "FORWARD", "-i", internal, "-s", network, "-j", "ACCEPT"],
            vec!["iptables", "-A", "FORWARD", "-i", external, "-d", network, "-j", "ACCEPT"],
            vec!["iptables", "-t", "nat", "-A", "POSTROUTING", "-o", external, "-j", "MASQUERADE"],
            vec!["sysctl", "-w", "net.ipv4.ip_forward=1"],
        ];
        to_owned(lines)
    }

    pub fn stop_commands() -> Vec<Vec<String>> {
        to_owned(vec![
            vec!["iptables", "-F"],
            vec!["iptables", "-t", "nat", "-F"],
            vec!["sysctl", "-w", "net.ipv4.ip_forward=0"],
        ])
    }

    /// Installs the rules on `gateway`. The first failing command aborts.
    pub async fn start(
        &self,
        engine: &dyn NetworkEngine,
        config: &NatConfig,
        gateway: &NodeHandle,
    ) -> Result<(), NatError> {
        let internal = gateway
            .default_interface()
            .ok_or_else(|| NatError::NoInternalInterface(gateway.name.clone()))?;
        info!(
            "Starting NAT on {}: {} via {} -> {}",
            gateway.name,
            config.lab_subnet(),
            internal,
            config.external_interface
        );

        for argv in Self::start_commands(config, internal) {
            run_rule(engine, gateway, &argv).await.map_err(|e| {
                error!("NAT setup failed on {}: {}", gateway.name, e);
                e
            })?;
        }
        Ok(())
    }

    /// Flushes the rules and disables forwarding. Every step is attempted; the
    /// first failure is returned.
    pub async fn stop(&self, engine: &dyn NetworkEngine, gateway: &NodeHandle) -> Result<(), NatError> {
        info!("Stopping NAT on {}", gateway.name);
        let mut first_error = None;
        for argv in Self::stop_commands() {
            if let Err(e) = run_rule(engine, gateway, &argv).await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_rule(
    engine: &dyn NetworkEngine,
    gateway: &NodeHandle,
    argv: &[String],
) -> Result<(), NatError> {
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    let command = argv.join(" ");
    debug!("[{}] {}", gateway.name, command);

    let output = engine.exec(gateway, &args).await?;
    if !output.is_success() {
        return Err(NatError::RuleFailed {
            command,
            reason: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}

fn to_owned(lines: Vec<Vec<&str>>) -> Vec<Vec<String>> {
    lines
        .into_iter()
        .map(|line| line.into_iter().map(str::to_string).collect())
        .collect()
}
