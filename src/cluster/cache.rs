//! In-memory resource cache
//!
//! The authoritative index of pods, deployments, services and autoscalers,
//! plus the ownership links between deployments and their pods.
//!
//! Every namespace is a `DashMap`, so single calls are safe from any task.
//! The two ownership indices (deployment → ordered pod names, pod →
//! deployment) live behind one lock and are always updated together.
//! Controllers still hold their own locks for multi-step read/decide/write
//! sequences.
//!
//! Lock order: the ownership lock is taken before any map shard.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::autoscaler::Autoscaler;
use super::deployment::Deployment;
use super::pod::{Pod, PodPhase};
use super::resources::LabelSelector;
use super::service::Service;

/// Ownership facts captured when a pod leaves the cache
#[derive(Debug, Clone, PartialEq)]
pub struct PodLegacy {
    /// Last observed pod
    pub pod: Pod,
    /// Deployment that owned the pod at deletion time
    pub deployment: Option<String>,
}

#[derive(Debug, Default)]
struct Ownership {
    /// Pod names per deployment, in creation order
    pods_by_deployment: HashMap<String, Vec<String>>,
    /// Reverse index
    deployment_by_pod: HashMap<String, String>,
}

impl Ownership {
    fn unlink_pod(&mut self, pod: &str) -> Option<String> {
        let owner = self.deployment_by_pod.remove(pod)?;
        if let Some(pods) = self.pods_by_deployment.get_mut(&owner) {
            pods.retain(|p| p != pod);
        }
        Some(owner)
    }
}

/// Shared cache of cluster resources
#[derive(Debug, Default)]
pub struct ResourceCache {
    pods: DashMap<String, Pod>,
    deployments: DashMap<String, Deployment>,
    services: DashMap<String, Service>,
    autoscalers: DashMap<String, Autoscaler>,
    ownership: RwLock<Ownership>,
    legacy: DashMap<String, PodLegacy>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Pods
    // ========================================================================

    /// Insert or replace a pod
    pub fn set_pod(&self, pod: Pod) {
        self.pods.insert(pod.metadata.name.clone(), pod);
    }

    pub fn get_pod(&self, name: &str) -> Option<Pod> {
        self.pods.get(name).map(|p| p.value().clone())
    }

    pub fn pod_exists(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    /// All pods, sorted by name
    pub fn list_pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.pods.iter().map(|p| p.value().clone()).collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        pods
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Mutate a cached pod in place. Returns false if the pod is unknown.
    pub fn update_pod<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut Pod),
    {
        match self.pods.get_mut(name) {
            Some(mut pod) => {
                f(pod.value_mut());
                true
            }
            None => false,
        }
    }

    /// Remove a pod and its ownership link.
    ///
    /// A legacy record is kept so handlers running after the removal can
    /// still learn who owned the pod. See [`Self::take_pod_legacy`].
    pub fn delete_pod(&self, name: &str) -> Option<Pod> {
        let mut ownership = self.ownership.write();
        let (_, pod) = self.pods.remove(name)?;
        let deployment = ownership.unlink_pod(name);
        self.legacy.insert(
            name.to_string(),
            PodLegacy {
                pod: pod.clone(),
                deployment,
            },
        );
        Some(pod)
    }

    /// Remove a pod without leaving a legacy record (rollback path)
    pub fn forget_pod(&self, name: &str) -> Option<Pod> {
        let mut ownership = self.ownership.write();
        let (_, pod) = self.pods.remove(name)?;
        ownership.unlink_pod(name);
        Some(pod)
    }

    /// Consume the legacy record of a deleted pod
    pub fn take_pod_legacy(&self, name: &str) -> Option<PodLegacy> {
        self.legacy.remove(name).map(|(_, l)| l)
    }

    /// Pods in `phase` whose labels match `selector`, sorted by name
    pub fn pods_matching(&self, selector: &LabelSelector, phase: PodPhase) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .iter()
            .filter(|p| p.status.phase == phase && selector.matches(&p.metadata.labels))
            .map(|p| p.value().clone())
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        pods
    }

    /// Pods scheduled to the node at `host_ip`
    pub fn pods_on_host(&self, host_ip: &str) -> Vec<Pod> {
        self.pods
            .iter()
            .filter(|p| p.status.host_ip.as_deref() == Some(host_ip))
            .map(|p| p.value().clone())
            .collect()
    }

    // ========================================================================
    // Deployments
    // ========================================================================

    /// Add a deployment with an empty pod list.
    ///
    /// Replaces an existing entry but keeps its pod list.
    pub fn insert_deployment(&self, deployment: Deployment) {
        let mut ownership = self.ownership.write();
        let name = deployment.metadata.name.clone();
        ownership.pods_by_deployment.entry(name.clone()).or_default();
        self.deployments.insert(name, deployment);
    }

    pub fn get_deployment(&self, name: &str) -> Option<Deployment> {
        self.deployments.get(name).map(|d| d.value().clone())
    }

    pub fn deployment_exists(&self, name: &str) -> bool {
        self.deployments.contains_key(name)
    }

    /// All deployments, sorted by name
    pub fn list_deployments(&self) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> =
            self.deployments.iter().map(|d| d.value().clone()).collect();
        deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        deployments
    }

    /// Mutate a cached deployment in place. Returns the updated copy.
    pub fn update_deployment<F>(&self, name: &str, f: F) -> Option<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let mut deployment = self.deployments.get_mut(name)?;
        f(deployment.value_mut());
        Some(deployment.value().clone())
    }

    /// Remove a deployment, cascading to every pod in its list
    pub fn delete_deployment(&self, name: &str) -> Option<Deployment> {
        let mut ownership = self.ownership.write();
        let (_, deployment) = self.deployments.remove(name)?;
        for pod in ownership.pods_by_deployment.remove(name).unwrap_or_default() {
            ownership.deployment_by_pod.remove(&pod);
            self.pods.remove(&pod);
        }
        Some(deployment)
    }

    /// Append a pod to a deployment's list.
    ///
    /// Returns false if the deployment has no pod list or the pod is
    /// unknown or already owned.
    pub fn link_pod(&self, deployment: &str, pod: &str) -> bool {
        let mut ownership = self.ownership.write();
        if !self.pods.contains_key(pod) || ownership.deployment_by_pod.contains_key(pod) {
            return false;
        }
        let Some(pods) = ownership.pods_by_deployment.get_mut(deployment) else {
            return false;
        };
        pods.push(pod.to_string());
        ownership
            .deployment_by_pod
            .insert(pod.to_string(), deployment.to_string());
        true
    }

    /// Ordered pod names of a deployment; `None` if it has no pod list
    pub fn pods_of_deployment(&self, deployment: &str) -> Option<Vec<String>> {
        self.ownership
            .read()
            .pods_by_deployment
            .get(deployment)
            .cloned()
    }

    /// Deployment owning a pod
    pub fn deployment_of_pod(&self, pod: &str) -> Option<String> {
        self.ownership.read().deployment_by_pod.get(pod).cloned()
    }

    // ========================================================================
    // Autoscalers
    // ========================================================================

    pub fn set_autoscaler(&self, autoscaler: Autoscaler) {
        self.autoscalers
            .insert(autoscaler.metadata.name.clone(), autoscaler);
    }

    pub fn get_autoscaler(&self, name: &str) -> Option<Autoscaler> {
        self.autoscalers.get(name).map(|a| a.value().clone())
    }

    pub fn autoscaler_exists(&self, name: &str) -> bool {
        self.autoscalers.contains_key(name)
    }

    pub fn delete_autoscaler(&self, name: &str) -> Option<Autoscaler> {
        self.autoscalers.remove(name).map(|(_, a)| a)
    }

    /// All autoscalers, sorted by name
    pub fn list_autoscalers(&self) -> Vec<Autoscaler> {
        let mut autoscalers: Vec<Autoscaler> =
            self.autoscalers.iter().map(|a| a.value().clone()).collect();
        autoscalers.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        autoscalers
    }

    /// The autoscaler targeting a deployment, if any
    pub fn autoscaler_for_deployment(&self, deployment: &str) -> Option<Autoscaler> {
        self.autoscalers
            .iter()
            .find(|a| a.spec.deployment == deployment)
            .map(|a| a.value().clone())
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub fn set_service(&self, service: Service) {
        self.services.insert(service.metadata.name.clone(), service);
    }

    pub fn get_service(&self, name: &str) -> Option<Service> {
        self.services.get(name).map(|s| s.value().clone())
    }

    pub fn service_exists(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn delete_service(&self, name: &str) -> Option<Service> {
        self.services.remove(name).map(|(_, s)| s)
    }

    /// All services, sorted by name
    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        services
    }
}
