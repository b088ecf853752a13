//! Service controller - keeps service endpoints in step with Ready pods
//!
//! Every change to a service's endpoint set is persisted and pushed to all
//! registered workers. Pushes are best effort; a worker that misses one
//! catches up on the next change.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cache::ResourceCache;
use super::events::{EventHandler, PodEvent};
use super::pod::{Pod, PodPhase};
use super::registry::NodeRegistry;
use super::resources::is_valid_name;
use super::service::{Endpoint, Service};
use super::store::{ClusterStore, StoreError};

/// First address handed out as a cluster IP (10.96.0.1)
const CLUSTER_IP_BASE: u32 = 0x0A60_0001;

/// Number of addresses in the cluster IP range
const CLUSTER_IP_RANGE: u32 = 0xFFFE;

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid service name: {0}")]
    InvalidName(String),

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Service '{0}' has an empty selector")]
    EmptySelector(String),

    #[error("Cluster IP {ip} is already used by service '{owner}'")]
    ClusterIpTaken { ip: String, owner: String },

    #[error("No free cluster IP left")]
    ClusterIpExhausted,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Maintains services and their endpoints
pub struct ServiceController {
    cache: Arc<ResourceCache>,
    registry: Arc<NodeRegistry>,
    store: ClusterStore,
    lock: Mutex<()>,
}

impl ServiceController {
    pub fn new(cache: Arc<ResourceCache>, registry: Arc<NodeRegistry>, store: ClusterStore) -> Self {
        Self {
            cache,
            registry,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Create or replace a service and push it to every worker
    pub async fn apply_service(&self, mut service: Service) -> Result<Service, ServiceError> {
        let name = service.metadata.name.clone();
        if !is_valid_name(&name) {
            return Err(ServiceError::InvalidName(name));
        }
        if service.spec.selector.is_empty() {
            return Err(ServiceError::EmptySelector(name));
        }

        let service = {
            let _guard = self.lock.lock().await;

            match self.cache.get_service(&name) {
                Some(existing) => {
                    service.metadata.uid = existing.metadata.uid;
                    service.metadata.creation_timestamp = existing.metadata.creation_timestamp;
                    if service.spec.cluster_ip.is_none() {
                        service.spec.cluster_ip = existing.spec.cluster_ip;
                    }
                }
                None => service.metadata.stamp(),
            }

            match service.spec.cluster_ip.clone() {
                Some(ip) => {
                    if let Some(owner) = self
                        .cache
                        .list_services()
                        .into_iter()
                        .find(|s| {
                            s.metadata.name != name
                                && s.spec.cluster_ip.as_deref() == Some(ip.as_str())
                        })
                    {
                        return Err(ServiceError::ClusterIpTaken {
                            ip,
                            owner: owner.metadata.name,
                        });
                    }
                }
                None => service.spec.cluster_ip = Some(self.allocate_cluster_ip()?),
            }

            service.status.endpoints = self.resolve_endpoints(&service);
            self.persist(&service)?;
            self.cache.set_service(service.clone());
            service
        };

        info!(
            "Service '{}' applied at {} with {} endpoint(s)",
            name,
            service.spec.cluster_ip.as_deref().unwrap_or("-"),
            service.status.endpoints.len()
        );
        self.push(&service).await;
        Ok(service)
    }

    /// Remove a service from the cluster and from every worker
    pub async fn delete_service(&self, name: &str) -> Result<Service, ServiceError> {
        let service = {
            let _guard = self.lock.lock().await;
            let service = self
                .cache
                .get_service(name)
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;
            self.store.delete_service(name)?;
            self.cache.delete_service(name);
            service
        };

        let calls = self.registry.entries().into_iter().map(|entry| async move {
            if let Err(e) = entry.worker.delete_service(name).await {
                warn!(
                    "Failed to remove service '{}' from node '{}': {}",
                    name, entry.node.metadata.name, e
                );
            }
        });
        join_all(calls).await;

        info!("Service '{}' deleted", name);
        Ok(service)
    }

    pub fn list_services(&self) -> Vec<Service> {
        self.cache.list_services()
    }

    /// Recompute endpoints of every service selecting `pod`.
    ///
    /// Returns the names of the services whose endpoints changed.
    pub async fn refresh_for(&self, pod: &Pod) -> Vec<String> {
        let changed: Vec<Service> = {
            let _guard = self.lock.lock().await;
            let mut changed = vec![];
            for mut service in self.cache.list_services() {
                if !service.selects(pod) {
                    continue;
                }
                let endpoints = self.resolve_endpoints(&service);
                if endpoints == service.status.endpoints {
                    continue;
                }
                service.status.endpoints = endpoints;
                if let Err(e) = self.persist(&service) {
                    warn!("Failed to persist endpoints of service '{}': {}", service.metadata.name, e);
                }
                self.cache.set_service(service.clone());
                changed.push(service);
            }
            changed
        };

        for service in &changed {
            debug!(
                "Service '{}' now has endpoints {:?}",
                service.metadata.name,
                service.endpoint_names()
            );
            self.push(service).await;
        }
        changed.into_iter().map(|s| s.metadata.name).collect()
    }

    fn resolve_endpoints(&self, service: &Service) -> Vec<Endpoint> {
        self.cache
            .pods_matching(&service.spec.selector, PodPhase::Ready)
            .iter()
            .map(Endpoint::from)
            .collect()
    }

    fn persist(&self, service: &Service) -> Result<(), StoreError> {
        self.store.put_service(service)?;
        self.store
            .put_service_pods(&service.metadata.name, &service.endpoint_names())
    }

    fn allocate_cluster_ip(&self) -> Result<String, ServiceError> {
        let used: HashSet<String> = self
            .cache
            .list_services()
            .into_iter()
            .filter_map(|s| s.spec.cluster_ip)
            .collect();

        (0..CLUSTER_IP_RANGE)
            .map(|offset| Ipv4Addr::from(CLUSTER_IP_BASE + offset).to_string())
            .find(|ip| !used.contains(ip))
            .ok_or(ServiceError::ClusterIpExhausted)
    }

    async fn push(&self, service: &Service) {
        let calls = self.registry.entries().into_iter().map(|entry| async move {
            if let Err(e) = entry.worker.create_service(service).await {
                warn!(
                    "Failed to push service '{}' to node '{}': {}",
                    service.metadata.name, entry.node.metadata.name, e
                );
            }
        });
        join_all(calls).await;
    }
}

#[async_trait]
impl EventHandler for ServiceController {
    async fn handle(&self, event: &PodEvent) {
        // Every kind can add or drop an endpoint
        self.refresh_for(event.pod()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::Node;
    use crate::cluster::pod::Container;
    use crate::cluster::resources::LabelSelector;
    use crate::cluster::testing::FakeWorker;

    struct Fixture {
        controller: ServiceController,
        cache: Arc<ResourceCache>,
        store: ClusterStore,
        workers: Vec<Arc<FakeWorker>>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(ResourceCache::new());
        let registry = Arc::new(NodeRegistry::new());
        let store = ClusterStore::in_memory();
        let mut workers = vec![];
        for i in 0..2 {
            let worker = Arc::new(FakeWorker::new());
            let mut node = Node::new(format!("node-{}", i), format!("10.0.0.{}", i + 1));
            node.mark_running();
            registry.register(node, worker.clone()).unwrap();
            workers.push(worker);
        }
        let controller = ServiceController::new(Arc::clone(&cache), registry, store.clone());
        Fixture {
            controller,
            cache,
            store,
            workers,
        }
    }

    fn web_pod(name: &str, phase: PodPhase) -> Pod {
        let mut pod = Pod::new(name)
            .with_label("app", "web")
            .with_container(Container::new("app", "nginx"));
        pod.status.phase = phase;
        pod.status.pod_ip = Some(format!("172.17.0.{}", name.len()));
        pod
    }

    fn web_service() -> Service {
        Service::new("web", LabelSelector::matching("app", "web")).with_port(80, 8080)
    }

    #[tokio::test]
    async fn test_apply_service_resolves_ready_pods() {
        let f = fixture();
        f.cache.set_pod(web_pod("web-0", PodPhase::Ready));
        f.cache.set_pod(web_pod("web-1", PodPhase::Pending));

        let service = f.controller.apply_service(web_service()).await.unwrap();

        assert_eq!(service.spec.cluster_ip.as_deref(), Some("10.96.0.1"));
        assert_eq!(service.endpoint_names(), vec!["web-0".to_string()]);
        assert_eq!(
            f.store.service_pods("web").unwrap(),
            Some(vec!["web-0".to_string()])
        );
        for worker in &f.workers {
            assert_eq!(worker.services(), vec![service.clone()]);
        }
    }

    #[tokio::test]
    async fn test_cluster_ip_allocation() {
        let f = fixture();
        let first = f.controller.apply_service(web_service()).await.unwrap();
        let second = f
            .controller
            .apply_service(Service::new("db", LabelSelector::matching("app", "db")))
            .await
            .unwrap();
        assert_eq!(second.spec.cluster_ip.as_deref(), Some("10.96.0.2"));

        // Re-applying keeps the address
        let again = f.controller.apply_service(web_service()).await.unwrap();
        assert_eq!(again.spec.cluster_ip, first.spec.cluster_ip);
        assert_eq!(again.metadata.uid, first.metadata.uid);

        let mut clash = Service::new("cache", LabelSelector::matching("app", "cache"));
        clash.spec.cluster_ip = Some("10.96.0.2".to_string());
        assert!(matches!(
            f.controller.apply_service(clash).await,
            Err(ServiceError::ClusterIpTaken { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_rejects_bad_input() {
        let f = fixture();
        assert!(matches!(
            f.controller
                .apply_service(Service::new("Web", LabelSelector::matching("app", "web")))
                .await,
            Err(ServiceError::InvalidName(_))
        ));
        assert!(matches!(
            f.controller
                .apply_service(Service::new("web", LabelSelector::default()))
                .await,
            Err(ServiceError::EmptySelector(_))
        ));
        assert!(f.controller.list_services().is_empty());
    }

    #[tokio::test]
    async fn test_ready_and_deletion_events_refresh_endpoints() {
        let f = fixture();
        f.controller.apply_service(web_service()).await.unwrap();

        let pod = web_pod("web-0", PodPhase::Ready);
        f.cache.set_pod(pod.clone());
        f.controller
            .handle(&PodEvent::Ready { pod: pod.clone() })
            .await;
        assert_eq!(
            f.cache.get_service("web").unwrap().endpoint_names(),
            vec!["web-0".to_string()]
        );
        assert_eq!(f.workers[1].services()[0].endpoint_names(), vec!["web-0".to_string()]);

        f.cache.delete_pod("web-0");
        f.controller
            .handle(&PodEvent::Deletion { pod, legacy: None })
            .await;
        assert!(f.cache.get_service("web").unwrap().status.endpoints.is_empty());
        assert_eq!(f.store.service_pods("web").unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_failed_pod_leaves_endpoints() {
        let f = fixture();
        f.controller.apply_service(web_service()).await.unwrap();
        let pod = web_pod("web-0", PodPhase::Ready);
        f.cache.set_pod(pod.clone());
        f.controller.handle(&PodEvent::Ready { pod }).await;
        assert_eq!(
            f.cache.get_service("web").unwrap().endpoint_names(),
            vec!["web-0".to_string()]
        );

        let failed = web_pod("web-0", PodPhase::Failed);
        f.cache.set_pod(failed.clone());
        f.controller.handle(&PodEvent::Failed { pod: failed }).await;

        assert!(f.cache.get_service("web").unwrap().status.endpoints.is_empty());
        assert_eq!(f.store.service_pods("web").unwrap(), Some(vec![]));
        assert!(f.workers[0].services()[0].endpoint_names().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_ignores_unrelated_pods() {
        let f = fixture();
        f.controller.apply_service(web_service()).await.unwrap();

        let mut other = Pod::new("db-0").with_label("app", "db");
        other.status.phase = PodPhase::Ready;
        f.cache.set_pod(other.clone());

        assert!(f.controller.refresh_for(&other).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_service() {
        let f = fixture();
        f.controller.apply_service(web_service()).await.unwrap();

        f.controller.delete_service("web").await.unwrap();
        assert!(f.cache.get_service("web").is_none());
        assert!(f.store.list_services().unwrap().is_empty());
        assert_eq!(f.store.service_pods("web").unwrap(), None);
        for worker in &f.workers {
            assert_eq!(worker.deleted_services(), vec!["web".to_string()]);
            assert!(worker.services().is_empty());
        }

        assert!(matches!(
            f.controller.delete_service("web").await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
