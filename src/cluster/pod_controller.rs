//! Pod controller - places pods on nodes and tracks their phase
//!
//! [`PodManager`] is the in-process [`PodController`]:
//! - `create_pod` schedules, records and asks the chosen worker to start
//! - `delete_pod_by_name` asks the worker to stop, takes the pod out of its
//!   owner's persisted list, then drops the pod
//! - `report_phase` takes the worker's phase reports and publishes them
//!
//! Deletion events are published from a spawned task. Callers such as the
//! deployment controller delete pods while holding their own lock, and their
//! handlers need that same lock.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache::ResourceCache;
use super::events::{EventBus, PodEvent};
use super::pod::{Pod, PodPhase};
use super::registry::NodeRegistry;
use super::remote::RemoteError;
use super::resources::is_valid_name;
use super::scheduler::{Scheduler, SchedulerError};
use super::store::{ClusterStore, StoreError};

/// Errors from pod operations
#[derive(Debug, thiserror::Error)]
pub enum PodError {
    #[error("Invalid pod name: {0}")]
    InvalidName(String),

    #[error("Pod already exists: {0}")]
    AlreadyExists(String),

    #[error("Pod not found: {0}")]
    NotFound(String),

    #[error("Scheduling failed: {0}")]
    Scheduling(#[from] SchedulerError),

    #[error("No worker handle for node '{node}' (pod '{pod}')")]
    NoWorker { pod: String, node: String },

    #[error("Worker call for pod '{pod}' failed: {source}")]
    Remote {
        pod: String,
        #[source]
        source: RemoteError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Imperative pod operations used by the other controllers
#[async_trait]
pub trait PodController: Send + Sync {
    /// Schedule and start a pod. Returns the pod as recorded.
    async fn create_pod(&self, pod: Pod) -> Result<Pod, PodError>;

    /// Stop and forget a pod
    async fn delete_pod_by_name(&self, name: &str) -> Result<(), PodError>;
}

/// Result of describing pods by name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodDescription {
    pub pods: Vec<Pod>,

    /// Requested names that do not exist
    #[serde(default)]
    pub missing: Vec<String>,
}

/// In-process pod controller
pub struct PodManager {
    cache: Arc<ResourceCache>,
    registry: Arc<NodeRegistry>,
    scheduler: Arc<Scheduler>,
    store: ClusterStore,
    bus: Arc<EventBus>,
    lock: Mutex<()>,
}

impl PodManager {
    pub fn new(
        cache: Arc<ResourceCache>,
        registry: Arc<NodeRegistry>,
        scheduler: Arc<Scheduler>,
        store: ClusterStore,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            cache,
            registry,
            scheduler,
            store,
            bus,
            lock: Mutex::new(()),
        }
    }

    /// Create a standalone pod.
    ///
    /// Re-applying an identical spec is a no-op; a different spec under a
    /// taken name is rejected.
    pub async fn apply_pod(&self, pod: Pod) -> Result<Pod, PodError> {
        if let Some(existing) = self.cache.get_pod(pod.name()) {
            if existing.spec == pod.spec && existing.metadata.labels == pod.metadata.labels {
                return Ok(existing);
            }
            return Err(PodError::AlreadyExists(pod.metadata.name));
        }
        self.create_pod(pod).await
    }

    /// Record a phase reported by a worker.
    ///
    /// Transitions into Ready, Failed or Succeeded are published once the
    /// controller lock is released.
    pub async fn report_phase(
        &self,
        name: &str,
        phase: PodPhase,
        pod_ip: Option<String>,
    ) -> Result<Pod, PodError> {
        let (pod, previous) = {
            let _guard = self.lock.lock().await;
            let mut previous = None;
            let updated = self.cache.update_pod(name, |pod| {
                previous = Some(pod.status.phase);
                pod.status.phase = phase;
                if pod_ip.is_some() {
                    pod.status.pod_ip = pod_ip;
                }
            });
            if !updated {
                return Err(PodError::NotFound(name.to_string()));
            }
            let pod = self
                .cache
                .get_pod(name)
                .ok_or_else(|| PodError::NotFound(name.to_string()))?;
            if let Err(e) = self.store.put_pod(&pod) {
                warn!("Failed to persist phase of pod '{}': {}", name, e);
            }
            (pod, previous)
        };

        if previous == Some(phase) {
            return Ok(pod);
        }
        debug!("Pod '{}' moved {:?} -> {:?}", name, previous, phase);

        let event = match phase {
            PodPhase::Ready => Some(PodEvent::Ready { pod: pod.clone() }),
            PodPhase::Failed => Some(PodEvent::Failed { pod: pod.clone() }),
            PodPhase::Succeeded => Some(PodEvent::Succeeded { pod: pod.clone() }),
            PodPhase::Pending | PodPhase::Running => None,
        };
        if let Some(event) = event {
            self.bus.publish(event).await;
        }
        Ok(pod)
    }

    /// Look up pods by name; an empty list means every pod
    pub fn describe_pods(&self, names: &[String]) -> PodDescription {
        if names.is_empty() {
            return PodDescription {
                pods: self.cache.list_pods(),
                missing: vec![],
            };
        }

        let mut description = PodDescription::default();
        for name in names {
            match self.cache.get_pod(name) {
                Some(pod) => description.pods.push(pod),
                None => description.missing.push(name.clone()),
            }
        }
        description
    }

    /// Fetch a pod's log from its worker
    pub async fn get_pod_log(&self, name: &str) -> Result<String, PodError> {
        let pod = self
            .cache
            .get_pod(name)
            .ok_or_else(|| PodError::NotFound(name.to_string()))?;
        let ip = pod.status.host_ip.unwrap_or_default();
        let entry = self
            .registry
            .node_by_ip(&ip)
            .ok_or_else(|| PodError::NoWorker {
                pod: name.to_string(),
                node: ip.clone(),
            })?;

        entry
            .worker
            .get_pod_log(name)
            .await
            .map_err(|source| PodError::Remote {
                pod: name.to_string(),
                source,
            })
    }
}

#[async_trait]
impl PodController for PodManager {
    async fn create_pod(&self, mut pod: Pod) -> Result<Pod, PodError> {
        let _guard = self.lock.lock().await;
        let name = pod.metadata.name.clone();

        if !is_valid_name(&name) {
            return Err(PodError::InvalidName(name));
        }
        if self.cache.pod_exists(&name) {
            return Err(PodError::AlreadyExists(name));
        }

        let node = self.scheduler.schedule_pod(&pod)?;
        let worker = self
            .registry
            .worker(node.name())
            .ok_or_else(|| PodError::NoWorker {
                pod: name.clone(),
                node: node.metadata.name.clone(),
            })?;

        pod.metadata.stamp();
        pod.status.phase = PodPhase::Pending;
        pod.status.host_ip = Some(node.spec.address.clone());
        pod.status.pod_ip = None;

        self.cache.set_pod(pod.clone());
        if let Err(e) = self.store.put_pod(&pod) {
            self.cache.forget_pod(&name);
            return Err(e.into());
        }

        match worker.create_pod(&pod).await {
            Ok(ack) => {
                if let Some(ip) = ack.pod_ip {
                    pod.status.pod_ip = Some(ip.clone());
                    self.cache.update_pod(&name, |p| p.status.pod_ip = Some(ip));
                    if let Err(e) = self.store.put_pod(&pod) {
                        warn!("Failed to persist pod IP of '{}': {}", name, e);
                    }
                }
                info!("Pod '{}' scheduled to node '{}'", name, node.metadata.name);
                Ok(pod)
            }
            Err(source) => {
                self.cache.forget_pod(&name);
                if let Err(e) = self.store.delete_pod(&name) {
                    warn!("Failed to remove pod '{}' from store: {}", name, e);
                }
                Err(PodError::Remote { pod: name, source })
            }
        }
    }

    async fn delete_pod_by_name(&self, name: &str) -> Result<(), PodError> {
        let _guard = self.lock.lock().await;
        let pod = self
            .cache
            .get_pod(name)
            .ok_or_else(|| PodError::NotFound(name.to_string()))?;

        let entry = pod
            .status
            .host_ip
            .as_deref()
            .and_then(|ip| self.registry.node_by_ip(ip));
        match entry {
            Some(entry) => {
                entry
                    .worker
                    .delete_pod(name)
                    .await
                    .map_err(|source| PodError::Remote {
                        pod: name.to_string(),
                        source,
                    })?;
            }
            None => warn!(
                "Pod '{}' has no registered node; dropping it without a worker call",
                name
            ),
        }

        // A persisted owner list must never name a pod whose record is gone
        if let Some(owner) = self.cache.deployment_of_pod(name) {
            let remaining: Vec<String> = self
                .cache
                .pods_of_deployment(&owner)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| p != name)
                .collect();
            self.store.put_deployment_pods(&owner, &remaining)?;
        }

        self.cache.delete_pod(name);
        if let Err(e) = self.store.delete_pod(name) {
            warn!("Failed to remove pod '{}' from store: {}", name, e);
        }
        let legacy = self.cache.take_pod_legacy(name);
        info!("Pod '{}' deleted", name);

        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            bus.publish(PodEvent::Deletion { pod, legacy }).await;
        });
        Ok(())
    }
}
