//! Node registration controller
//!
//! Joining is a two-phase handshake. The node is first registered locally as
//! Pending/Unavailable, then the worker is told where the control plane
//! lives. Only a positive acknowledgment makes the node Running/Ready and
//! persists it; anything else removes it again.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use super::node::{Node, NodeStatus};
use super::registry::{NodeRegistry, RegistryError};
use super::remote::{RemoteError, WorkerConnector};
use super::resources::is_valid_name;
use super::store::{ClusterStore, StoreError};

/// Errors from node registration
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid node name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Cannot connect to node '{node}': {source}")]
    Connect {
        node: String,
        #[source]
        source: RemoteError,
    },

    #[error("Node '{node}' did not acknowledge registration: {source}")]
    Handshake {
        node: String,
        #[source]
        source: RemoteError,
    },

    #[error("Node '{node}' rejected registration: {message}")]
    Rejected { node: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Runs the join protocol for workers
pub struct RegistrationController {
    registry: Arc<NodeRegistry>,
    connector: Arc<dyn WorkerConnector>,
    store: ClusterStore,
    /// Address announced to workers
    advertise_address: String,
}

impl RegistrationController {
    pub fn new(
        registry: Arc<NodeRegistry>,
        connector: Arc<dyn WorkerConnector>,
        store: ClusterStore,
        advertise_address: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            connector,
            store,
            advertise_address: advertise_address.into(),
        }
    }

    pub fn advertise_address(&self) -> &str {
        &self.advertise_address
    }

    /// Register the worker that connected from `peer`
    pub async fn register_node(&self, peer: SocketAddr, mut node: Node) -> Result<Node, RegistrationError> {
        let name = node.metadata.name.clone();
        if !is_valid_name(&name) {
            return Err(RegistrationError::InvalidName(name));
        }

        node.spec.address = peer.ip().to_string();
        node.metadata.stamp();
        node.status = NodeStatus::default();

        let worker = self
            .connector
            .connect(&node)
            .map_err(|source| RegistrationError::Connect {
                node: name.clone(),
                source,
            })?;
        self.registry.register(node.clone(), Arc::clone(&worker))?;

        let ack = match worker.notify_registered(&self.advertise_address).await {
            Ok(ack) => ack,
            Err(source) => {
                self.registry.unregister(&name);
                warn!("Registration of node '{}' rolled back: {}", name, source);
                return Err(RegistrationError::Handshake { node: name, source });
            }
        };
        if !ack.success {
            self.registry.unregister(&name);
            warn!("Node '{}' refused registration: {}", name, ack.message);
            return Err(RegistrationError::Rejected {
                node: name,
                message: ack.message,
            });
        }

        node.mark_running();
        if let Err(e) = self.store.put_node(&node) {
            self.registry.unregister(&name);
            return Err(e.into());
        }
        let node = self.registry.update_status(&name, node.status)?;

        info!("Node '{}' registered at {}", name, node.full_address());
        Ok(node)
    }

    /// Remove a node from the cluster
    pub fn unregister_node(&self, name: &str) -> Result<Node, RegistrationError> {
        let node = self
            .registry
            .unregister(name)
            .ok_or_else(|| RegistryError::NodeNotFound(name.to_string()))?;
        self.store.delete_node(name)?;
        info!("Node '{}' unregistered", name);
        Ok(node)
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.registry.list()
    }
}
