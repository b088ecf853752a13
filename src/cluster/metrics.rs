//! Pod resource usage for the autoscaler
//!
//! [`WorkerMetricsProvider`] asks the agent on the pod's node for a fresh
//! reading. Any failure aborts the caller's scaling decision for that tick.

use std::sync::Arc;

use async_trait::async_trait;

use super::pod::Pod;
use super::registry::NodeRegistry;
use super::remote::{PodMetrics, RemoteError};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Pod '{0}' is not scheduled")]
    Unscheduled(String),

    #[error("No node at {ip} for pod '{pod}'")]
    NodeNotFound { pod: String, ip: String },

    #[error("Metrics query failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Source of per-pod usage
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn pod_cpu_usage(&self, pod: &Pod) -> Result<f64, MetricsError>;

    async fn pod_memory_usage(&self, pod: &Pod) -> Result<u64, MetricsError>;
}

/// Reads usage from the worker running the pod
#[derive(Debug, Clone)]
pub struct WorkerMetricsProvider {
    registry: Arc<NodeRegistry>,
}

impl WorkerMetricsProvider {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    async fn fetch(&self, pod: &Pod) -> Result<PodMetrics, MetricsError> {
        let ip = pod
            .status
            .host_ip
            .as_deref()
            .ok_or_else(|| MetricsError::Unscheduled(pod.metadata.name.clone()))?;
        let entry = self
            .registry
            .node_by_ip(ip)
            .ok_or_else(|| MetricsError::NodeNotFound {
                pod: pod.metadata.name.clone(),
                ip: ip.to_string(),
            })?;
        Ok(entry.worker.pod_metrics(&pod.metadata.name).await?)
    }
}

#[async_trait]
impl MetricsProvider for WorkerMetricsProvider {
    async fn pod_cpu_usage(&self, pod: &Pod) -> Result<f64, MetricsError> {
        Ok(self.fetch(pod).await?.cpu_usage)
    }

    async fn pod_memory_usage(&self, pod: &Pod) -> Result<u64, MetricsError> {
        Ok(self.fetch(pod).await?.memory_usage)
    }
}
