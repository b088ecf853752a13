//! Node registry
//!
//! Registered worker nodes in registration order, each paired with the
//! handle used to drive its agent. Scheduling walks this order.

use std::sync::Arc;

use parking_lot::RwLock;

use super::node::{Node, NodeStatus};
use super::remote::WorkerControl;

/// Errors from the node registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Node already registered: {0}")]
    NodeExists(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),
}

/// A node and the handle to its agent
#[derive(Clone)]
pub struct RegisteredNode {
    pub node: Node,
    pub worker: Arc<dyn WorkerControl>,
}

impl std::fmt::Debug for RegisteredNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredNode")
            .field("node", &self.node.metadata.name)
            .finish_non_exhaustive()
    }
}

/// Registered nodes
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<Vec<RegisteredNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Fails if the name is taken.
    pub fn register(&self, node: Node, worker: Arc<dyn WorkerControl>) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.node.metadata.name == node.metadata.name) {
            return Err(RegistryError::NodeExists(node.metadata.name));
        }
        nodes.push(RegisteredNode { node, worker });
        Ok(())
    }

    /// Remove a node, returning it
    pub fn unregister(&self, name: &str) -> Option<Node> {
        let mut nodes = self.nodes.write();
        let index = nodes.iter().position(|n| n.node.metadata.name == name)?;
        Some(nodes.remove(index).node)
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.node.metadata.name == name)
            .map(|n| n.node.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Agent handle of a node
    pub fn worker(&self, name: &str) -> Option<Arc<dyn WorkerControl>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.node.metadata.name == name)
            .map(|n| Arc::clone(&n.worker))
    }

    /// The node whose address is `ip`
    pub fn node_by_ip(&self, ip: &str) -> Option<RegisteredNode> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.node.spec.address == ip)
            .cloned()
    }

    /// Nodes in registration order
    pub fn list(&self) -> Vec<Node> {
        self.nodes.read().iter().map(|n| n.node.clone()).collect()
    }

    /// Nodes with their handles, in registration order
    pub fn entries(&self) -> Vec<RegisteredNode> {
        self.nodes.read().clone()
    }

    pub fn update_status(&self, name: &str, status: NodeStatus) -> Result<Node, RegistryError> {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .iter_mut()
            .find(|n| n.node.metadata.name == name)
            .ok_or_else(|| RegistryError::NodeNotFound(name.to_string()))?;
        entry.node.status = status;
        Ok(entry.node.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
