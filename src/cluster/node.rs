//! Node resource - a worker machine that runs pods
//!
//! A Node:
//! - Joins the cluster through the registration handshake
//! - Exposes an agent that starts and stops pods on request
//! - Is removed only by explicit unregistration

use serde::{Deserialize, Serialize};

use super::resources::{ObjectMeta, API_VERSION};

/// A Node in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// API version
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Kind is always "Node"
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Metadata about the node
    pub metadata: ObjectMeta,

    /// Where the node's agent can be reached
    #[serde(default)]
    pub spec: NodeSpec,

    /// Current node status
    #[serde(default)]
    pub status: NodeStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Node".to_string()
}

/// Node specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// IP of the node. Overwritten with the peer address on registration.
    #[serde(default)]
    pub address: String,

    /// Port where the node's agent listens
    #[serde(default = "default_node_port")]
    pub port: u16,
}

impl Default for NodeSpec {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_node_port(),
        }
    }
}

fn default_node_port() -> u16 {
    super::WORKER_PORT
}

/// Current status of a Node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub phase: NodePhase,

    pub condition: NodeCondition,
}

/// Phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodePhase {
    /// Registered locally, waiting for the agent's acknowledgment
    #[default]
    Pending,
    /// Handshake completed
    Running,
    /// Node has left the cluster
    Terminated,
}

/// Whether a node can take pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeCondition {
    Ready,
    #[default]
    Unavailable,
}

impl Node {
    /// Create a new Node
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::new(name),
            spec: NodeSpec {
                address: address.into(),
                port: default_node_port(),
            },
            status: NodeStatus::default(),
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.spec.port = port;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the full address (address:port)
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.spec.address, self.spec.port)
    }

    /// Base URL of the node's agent
    pub fn base_url(&self) -> String {
        format!("http://{}", self.full_address())
    }

    /// Check if node is ready to take pods
    pub fn is_ready(&self) -> bool {
        self.status.condition == NodeCondition::Ready
    }

    /// Mark the handshake as complete
    pub fn mark_running(&mut self) {
        self.status.phase = NodePhase::Running;
        self.status.condition = NodeCondition::Ready;
    }
}
