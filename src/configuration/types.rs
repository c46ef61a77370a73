use ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Protocol list applied to a switch that does not declare one.
pub const DEFAULT_SWITCH_PROTOCOL: &str = "OpenFlow13";

/// One attachment of a host to a switch.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct LinkSpec {
    /// Name of the switch on the other end.
    #[serde(rename = "sw")]
    pub switch: String,
    /// Address and prefix assigned to the host side of the link.
    #[serde(default)]
    pub ip: Option<Ipv4Network>,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub is_manageable: bool,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    /// Default gateway installed as the host's default route.
    #[serde(default)]
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct SwitchSpec {
    pub name: String,
    pub dpid: u64,
    #[serde(default)]
    pub protocols: Option<Vec<String>>,
    /// Peer switches this switch is cabled to.
    #[serde(default)]
    pub links: Vec<String>,
}

impl SwitchSpec {
    /// Comma separated OpenFlow versions, as `ovs-vsctl` expects them.
    pub fn protocols(&self) -> String {
        match &self.protocols {
            Some(protocols) if !protocols.is_empty() => protocols.join(","),
            _ => DEFAULT_SWITCH_PROTOCOL.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct ControllerSpec {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct NatSwitchRef {
    pub name: String,
}

#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct NatNodeSpec {
    pub name: String,
    pub ip: Ipv4Network,
}

/// `nat` block of a topology document.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct NatSpec {
    pub switch: NatSwitchRef,
    pub node: NatNodeSpec,
    pub ext_iface: String,
}

/// Everything the NAT gateway needs to install its rules.
#[derive(Debug, PartialEq, Clone)]
pub struct NatConfig {
    pub switch_name: String,
    pub node_name: String,
    /// Gateway address; its network is the lab subnet behind the NAT.
    pub gateway_ip: Ipv4Network,
    pub external_interface: String,
}

impl NatConfig {
    /// Lab subnet with host bits cleared, e.g. `192.168.100.0/24`.
    pub fn lab_subnet(&self) -> Ipv4Network {
        // The prefix comes from a parsed network, so it is always in range.
        Ipv4Network::new(self.gateway_ip.network(), self.gateway_ip.prefix())
            .unwrap_or(self.gateway_ip)
    }
}

impl From<&NatSpec> for NatConfig {
    fn from(spec: &NatSpec) -> Self {
        NatConfig {
            switch_name: spec.switch.name.clone(),
            node_name: spec.node.name.clone(),
            gateway_ip: spec.node.ip,
            external_interface: spec.ext_iface.clone(),
        }
    }
}

/// `ssh` block of the lab configuration.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct SshSettings {
    /// Template file name, looked up in `tmpl_dir`.
    pub template: String,
    pub tmpl_dir: PathBuf,
    #[serde(default)]
    pub authorized_keys: Option<PathBuf>,
}
