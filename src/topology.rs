use crate::error::{DeployError, DeployResult};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Proxy,
    Storage,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Proxy => "proxy",
            NodeRole::Storage => "storage",
        }
    }

    /// Value of the `Name` tag put on instances of this role.
    pub fn tag_name(&self) -> &'static str {
        match self {
            NodeRole::Proxy => "proxy_node",
            NodeRole::Storage => "storage_node",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub instance_id: String,
    /// Address used to reach the node over ssh.
    pub public_address: String,
    /// Address used for cluster-internal traffic (ring entries, bind ips).
    pub private_address: String,
    pub role: NodeRole,
}

/// Accumulates nodes while the provisioner brings instances up.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    proxies: Vec<NodeDescriptor>,
    storage: Vec<NodeDescriptor>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: NodeDescriptor) {
        match node.role {
            NodeRole::Proxy => self.proxies.push(node),
            NodeRole::Storage => self.storage.push(node),
        }
    }

    /// Freeze the accumulated nodes into a read-only snapshot.
    pub fn finish(self) -> DeployResult<ClusterTopology> {
        if self.proxies.is_empty() {
            return Err(DeployError::Topology("no proxy nodes".into()));
        }
        if self.storage.is_empty() {
            return Err(DeployError::Topology("no storage nodes".into()));
        }

        let mut seen = HashSet::new();
        for node in self.proxies.iter().chain(&self.storage) {
            if node.public_address.is_empty() || node.private_address.is_empty() {
                return Err(DeployError::Topology(format!(
                    "{} node {} has no address",
                    node.role, node.instance_id
                )));
            }
            if !seen.insert(node.instance_id.as_str()) {
                return Err(DeployError::Topology(format!(
                    "instance {} listed twice",
                    node.instance_id
                )));
            }
        }

        Ok(ClusterTopology {
            proxies: self.proxies,
            storage: self.storage,
        })
    }
}

/// Immutable snapshot of the provisioned cluster. Phases only get shared
/// references to it; there is no way to change the node lists once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    proxies: Vec<NodeDescriptor>,
    storage: Vec<NodeDescriptor>,
}

impl ClusterTopology {
    pub fn proxies(&self) -> &[NodeDescriptor] {
        &self.proxies
    }

    pub fn storage(&self) -> &[NodeDescriptor] {
        &self.storage
    }

    pub fn nodes(&self, role: NodeRole) -> &[NodeDescriptor] {
        match role {
            NodeRole::Proxy => &self.proxies,
            NodeRole::Storage => &self.storage,
        }
    }

    /// The proxy the ring is built on.
    pub fn ring_builder_host(&self) -> &NodeDescriptor {
        &self.proxies[0]
    }

    pub fn storage_private_addresses(&self) -> Vec<&str> {
        self.storage
            .iter()
            .map(|n| n.private_address.as_str())
            .collect()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.proxies
            .iter()
            .chain(&self.storage)
            .map(|n| n.instance_id.clone())
            .collect()
    }
}
