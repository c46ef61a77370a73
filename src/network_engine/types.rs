/// Handle to a node created by the network engine.
///
/// Manageable hosts carry one of these in their `LabHostState` so that commands
/// can be scoped to the host's network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    pub name: String,
    /// Named network namespace (`ip netns`), `None` for nodes in the root namespace.
    pub namespace: Option<String>,
    /// Pid of the process holding the namespace open.
    pub pid: Option<u32>,
    /// Node-side interface names in creation order.
    pub interfaces: Vec<String>,
}

impl NodeHandle {
    pub fn in_namespace(name: &str, namespace: &str, pid: Option<u32>) -> Self {
        NodeHandle {
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            pid,
            interfaces: Vec::new(),
        }
    }

    pub fn in_root_namespace(name: &str) -> Self {
        NodeHandle {
            name: name.to_string(),
            namespace: None,
            pid: None,
            interfaces: Vec::new(),
        }
    }

    /// First interface, the one facing the lab network.
    pub fn default_interface(&self) -> Option<&str> {
        self.interfaces.first().map(String::as_str)
    }

    /// Name for the next interface attached to this node (`<name>-eth<N>`).
    pub fn next_interface_name(&self) -> String {
        format!("{}-eth{}", self.name, self.interfaces.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_naming() {
        let mut node = NodeHandle::in_namespace("h1", "h1", Some(42));
        assert_eq!(node.default_interface(), None);
        assert_eq!(node.next_interface_name(), "h1-eth0");
        node.interfaces.push(node.next_interface_name());
        assert_eq!(node.next_interface_name(), "h1-eth1");
        assert_eq!(node.default_interface(), Some("h1-eth0"));
        assert_eq!(node.namespace.as_deref(), Some("h1"));
    }

    #[test]
    fn test_root_namespace_node() {
        let node = NodeHandle::in_root_namespace("natgw");
        assert!(node.namespace.is_none());
        assert!(node.pid.is_none());
    }
}
