//! Pod scheduler
//!
//! A pod with an affinity target lands on the node already running that
//! target. Everything else is spread round robin over the Ready nodes in
//! registration order. The cursor is not tied to node identity, so a node
//! joining or leaving shifts where the next pod goes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::cache::ResourceCache;
use super::node::Node;
use super::pod::Pod;
use super::registry::NodeRegistry;

/// Errors from pod scheduling
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("No available nodes")]
    NoAvailableNodes,

    #[error("Affinity target '{0}' does not exist")]
    AffinityTargetNotFound(String),

    #[error("Affinity target '{0}' is not scheduled yet")]
    AffinityTargetUnscheduled(String),

    #[error("No node at {ip} for affinity target '{target}'")]
    NodeNotFound { target: String, ip: String },
}

/// Picks a node for new pods
#[derive(Debug)]
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    cache: Arc<ResourceCache>,
    cursor: AtomicUsize,
}

impl Scheduler {
    pub fn new(registry: Arc<NodeRegistry>, cache: Arc<ResourceCache>) -> Self {
        Self {
            registry,
            cache,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Choose a node for `pod`
    pub fn schedule_pod(&self, pod: &Pod) -> Result<Node, SchedulerError> {
        match pod.spec.affinity.as_deref() {
            Some(target) => self.schedule_with_affinity(target),
            None => self.schedule_round_robin(),
        }
    }

    fn schedule_with_affinity(&self, target: &str) -> Result<Node, SchedulerError> {
        let target_pod = self
            .cache
            .get_pod(target)
            .ok_or_else(|| SchedulerError::AffinityTargetNotFound(target.to_string()))?;
        let ip = target_pod
            .status
            .host_ip
            .ok_or_else(|| SchedulerError::AffinityTargetUnscheduled(target.to_string()))?;

        self.registry
            .node_by_ip(&ip)
            .map(|entry| entry.node)
            .ok_or_else(|| SchedulerError::NodeNotFound {
                target: target.to_string(),
                ip,
            })
    }

    fn schedule_round_robin(&self) -> Result<Node, SchedulerError> {
        let nodes: Vec<Node> = self
            .registry
            .list()
            .into_iter()
            .filter(Node::is_ready)
            .collect();
        if nodes.is_empty() {
            return Err(SchedulerError::NoAvailableNodes);
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
        let node = nodes[index].clone();
        debug!("Round robin picked node '{}' ({}/{})", node.metadata.name, index + 1, nodes.len());
        Ok(node)
    }
}
