//! Recovery loader - rebuilds in-memory state from the durable store
//!
//! Runs once before the API is served. Order matters: nodes first so pod
//! host IPs resolve, pods before deployments so ownership links can be
//! checked. Any failure here is fatal to startup.

use serde::Serialize;
use tracing::{info, warn};

use super::cache::ResourceCache;
use super::registry::{NodeRegistry, RegistryError};
use super::remote::{RemoteError, WorkerConnector};
use super::store::{ClusterStore, StoreError};

/// Errors that abort recovery
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot reconnect node '{node}': {source}")]
    Connect {
        node: String,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Deployment '{deployment}' references missing pod '{pod}'")]
    MissingPod { deployment: String, pod: String },

    #[error("Pod '{pod}' is listed by deployment '{deployment}' but already owned by '{owner}'")]
    PodAlreadyOwned {
        pod: String,
        deployment: String,
        owner: String,
    },
}

/// What was loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub nodes: usize,
    pub pods: usize,
    pub deployments: usize,
    pub autoscalers: usize,
    pub services: usize,
}

/// Load every persisted resource into the cache and registry
pub fn recover(
    store: &ClusterStore,
    cache: &ResourceCache,
    registry: &NodeRegistry,
    connector: &dyn WorkerConnector,
) -> Result<RecoveryReport, RecoveryError> {
    let mut report = RecoveryReport::default();

    for node in store.list_nodes()? {
        let worker = connector
            .connect(&node)
            .map_err(|source| RecoveryError::Connect {
                node: node.metadata.name.clone(),
                source,
            })?;
        registry.register(node, worker)?;
        report.nodes += 1;
    }

    for pod in store.list_pods()? {
        cache.set_pod(pod);
        report.pods += 1;
    }

    for deployment in store.list_deployments()? {
        let name = deployment.metadata.name.clone();
        let pods = match store.deployment_pods(&name)? {
            Some(pods) => pods,
            None => {
                warn!("Deployment '{}' has no persisted pod list; starting empty", name);
                vec![]
            }
        };
        cache.insert_deployment(deployment);

        for pod in pods {
            if !cache.pod_exists(&pod) {
                return Err(RecoveryError::MissingPod {
                    deployment: name,
                    pod,
                });
            }
            if !cache.link_pod(&name, &pod) {
                let owner = cache.deployment_of_pod(&pod).unwrap_or_default();
                return Err(RecoveryError::PodAlreadyOwned {
                    pod,
                    deployment: name,
                    owner,
                });
            }
        }
        report.deployments += 1;
    }

    for autoscaler in store.list_autoscalers()? {
        cache.set_autoscaler(autoscaler);
        report.autoscalers += 1;
    }

    for service in store.list_services()? {
        cache.set_service(service);
        report.services += 1;
    }

    info!(
        "Recovered {} node(s), {} pod(s), {} deployment(s), {} autoscaler(s), {} service(s)",
        report.nodes, report.pods, report.deployments, report.autoscalers, report.services
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::autoscaler::{Autoscaler, MetricTarget};
    use crate::cluster::deployment::{Deployment, PodTemplate};
    use crate::cluster::node::Node;
    use crate::cluster::pod::{Container, Pod, PodSpec};
    use crate::cluster::resources::LabelSelector;
    use crate::cluster::service::Service;
    use crate::cluster::store::FileStore;
    use crate::cluster::testing::FakeConnector;

    fn template() -> PodTemplate {
        PodTemplate {
            labels: [("app".to_string(), "web".to_string())].into(),
            spec: PodSpec {
                containers: vec![Container::new("app", "nginx")],
                ..Default::default()
            },
        }
    }

    fn seed(store: &ClusterStore) -> Vec<String> {
        let mut node = Node::new("node-0", "10.0.0.1");
        node.mark_running();
        store.put_node(&node).unwrap();

        let deployment = Deployment::new("web", template()).with_replicas(3);
        let mut names = vec![];
        for _ in 0..3 {
            let mut pod = deployment.new_replica();
            pod.status.host_ip = Some("10.0.0.1".to_string());
            store.put_pod(&pod).unwrap();
            names.push(pod.metadata.name);
        }
        store.put_pod(&Pod::new("standalone")).unwrap();
        store.put_deployment(&deployment).unwrap();
        store.put_deployment_pods("web", &names).unwrap();

        store
            .put_autoscaler(
                &Autoscaler::new("web-hpa", "web", 1, 5).with_metric(MetricTarget::Cpu {
                    target_utilization: 0.5,
                }),
            )
            .unwrap();
        store
            .put_service(&Service::new("web", LabelSelector::matching("app", "web")))
            .unwrap();
        names
    }

    #[test]
    fn test_recovery_rebuilds_indices_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let names = {
            let store = ClusterStore::new(Arc::new(FileStore::open(&path).unwrap()));
            seed(&store)
        };

        let store = ClusterStore::new(Arc::new(FileStore::open(&path).unwrap()));
        let cache = ResourceCache::new();
        let registry = NodeRegistry::new();
        let connector = FakeConnector::new();

        let report = recover(&store, &cache, &registry, &connector).unwrap();

        assert_eq!(
            report,
            RecoveryReport {
                nodes: 1,
                pods: 4,
                deployments: 1,
                autoscalers: 1,
                services: 1,
            }
        );
        assert!(registry.get("node-0").unwrap().is_ready());
        assert!(registry.worker("node-0").is_some());
        assert_eq!(cache.pods_of_deployment("web"), Some(names.clone()));
        for name in &names {
            assert_eq!(cache.deployment_of_pod(name).as_deref(), Some("web"));
        }
        assert_eq!(cache.deployment_of_pod("standalone"), None);
        assert_eq!(
            cache.autoscaler_for_deployment("web").unwrap().metadata.name,
            "web-hpa"
        );
        assert!(cache.service_exists("web"));
    }

    #[test]
    fn test_missing_pod_is_fatal() {
        let store = ClusterStore::in_memory();
        store
            .put_deployment(&Deployment::new("web", template()))
            .unwrap();
        store
            .put_deployment_pods("web", &["web-abc-12345".to_string()])
            .unwrap();

        let result = recover(
            &store,
            &ResourceCache::new(),
            &NodeRegistry::new(),
            &FakeConnector::new(),
        );
        assert!(matches!(
            result,
            Err(RecoveryError::MissingPod { ref deployment, ref pod })
                if deployment == "web" && pod == "web-abc-12345"
        ));
    }

    #[test]
    fn test_doubly_owned_pod_is_fatal() {
        let store = ClusterStore::in_memory();
        store.put_pod(&Pod::new("shared")).unwrap();
        for name in ["a", "b"] {
            store
                .put_deployment(&Deployment::new(name, template()))
                .unwrap();
            store
                .put_deployment_pods(name, &["shared".to_string()])
                .unwrap();
        }

        let result = recover(
            &store,
            &ResourceCache::new(),
            &NodeRegistry::new(),
            &FakeConnector::new(),
        );
        assert!(matches!(result, Err(RecoveryError::PodAlreadyOwned { .. })));
    }

    #[test]
    fn test_unreachable_node_is_fatal() {
        let store = ClusterStore::in_memory();
        store.put_node(&Node::new("node-0", "10.0.0.1")).unwrap();
        let connector = FakeConnector::new();
        connector.set_unreachable("node-0");

        let result = recover(&store, &ResourceCache::new(), &NodeRegistry::new(), &connector);
        assert!(matches!(result, Err(RecoveryError::Connect { .. })));
    }

    #[test]
    fn test_empty_store() {
        let report = recover(
            &ClusterStore::in_memory(),
            &ResourceCache::new(),
            &NodeRegistry::new(),
            &FakeConnector::new(),
        )
        .unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
