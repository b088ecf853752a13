//! Cluster Controller - wires the control plane together
//!
//! The controller owns:
//! - The resource cache, node registry and durable store
//! - The event bus and every subscriber on it
//! - The pod, deployment, autoscaler, service and registration controllers
//! - The background loops (deployment reconciler, autoscaler monitors)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use super::autoscaler_controller::AutoscalerController;
use super::cache::ResourceCache;
use super::deployment_controller::DeploymentController;
use super::events::{EventBus, EventKind};
use super::metrics::WorkerMetricsProvider;
use super::pod_controller::PodManager;
use super::recovery::{recover, RecoveryError, RecoveryReport};
use super::registration::RegistrationController;
use super::registry::NodeRegistry;
use super::remote::{HttpConnector, WorkerConnector};
use super::scheduler::Scheduler;
use super::service_controller::ServiceController;
use super::store::ClusterStore;
use super::{CONTROL_PLANE_PORT, RECONCILE_INTERVAL_SECS, REMOTE_CALL_TIMEOUT_MS};

/// Errors that can occur in the cluster controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Recovery must run before the controllers start")]
    AlreadyStarted,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Period of the deployment reconciliation loop
    pub reconcile_interval: Duration,

    /// Timeout of every call to a worker
    pub remote_timeout: Duration,

    /// Control plane address announced to registering workers
    pub advertise_address: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(RECONCILE_INTERVAL_SECS),
            remote_timeout: Duration::from_millis(REMOTE_CALL_TIMEOUT_MS),
            advertise_address: format!("http://127.0.0.1:{}", CONTROL_PLANE_PORT),
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    #[serde(rename = "totalNodes")]
    pub total_nodes: usize,

    #[serde(rename = "readyNodes")]
    pub ready_nodes: usize,

    pub pods: usize,

    #[serde(rename = "readyPods")]
    pub ready_pods: usize,

    pub deployments: usize,

    pub autoscalers: usize,

    pub services: usize,
}

/// The cluster controller owns every control plane component
#[derive(Clone)]
pub struct ClusterController {
    config: ControllerConfig,
    store: ClusterStore,
    connector: Arc<dyn WorkerConnector>,
    cache: Arc<ResourceCache>,
    bus: Arc<EventBus>,
    registry: Arc<NodeRegistry>,
    pods: Arc<PodManager>,
    deployments: Arc<DeploymentController>,
    autoscalers: Arc<AutoscalerController>,
    services: Arc<ServiceController>,
    registration: Arc<RegistrationController>,

    /// Shutdown handle of the running reconciler
    reconciler: Arc<Mutex<Option<watch::Sender<()>>>>,
}

impl ClusterController {
    /// Build the control plane and subscribe its event handlers
    pub fn new(
        config: ControllerConfig,
        store: ClusterStore,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        let cache = Arc::new(ResourceCache::new());
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(NodeRegistry::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), Arc::clone(&cache)));

        let pods = Arc::new(PodManager::new(
            Arc::clone(&cache),
            Arc::clone(&registry),
            scheduler,
            store.clone(),
            Arc::clone(&bus),
        ));
        let deployments = Arc::new(DeploymentController::new(
            Arc::clone(&cache),
            store.clone(),
            pods.clone(),
        ));
        let autoscalers = Arc::new(AutoscalerController::new(
            Arc::clone(&cache),
            store.clone(),
            Arc::new(WorkerMetricsProvider::new(Arc::clone(&registry))),
        ));
        let services = Arc::new(ServiceController::new(
            Arc::clone(&cache),
            Arc::clone(&registry),
            store.clone(),
        ));
        let registration = Arc::new(RegistrationController::new(
            Arc::clone(&registry),
            Arc::clone(&connector),
            store.clone(),
            config.advertise_address.clone(),
        ));

        // Deployment bookkeeping runs before endpoint pushes
        for kind in EventKind::ALL {
            bus.subscribe(deployments.clone(), kind);
        }
        for kind in EventKind::ALL {
            bus.subscribe(services.clone(), kind);
        }

        Self {
            config,
            store,
            connector,
            cache,
            bus,
            registry,
            pods,
            deployments,
            autoscalers,
            services,
            registration,
            reconciler: Arc::new(Mutex::new(None)),
        }
    }

    /// Control plane talking to workers over HTTP
    pub fn over_http(config: ControllerConfig, store: ClusterStore) -> Self {
        let connector = Arc::new(HttpConnector::new(config.remote_timeout));
        Self::new(config, store, connector)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted state. Must run before [`Self::start`].
    pub async fn recover(&self) -> Result<RecoveryReport, ControllerError> {
        if self.is_running() {
            return Err(ControllerError::AlreadyStarted);
        }
        let report = recover(
            &self.store,
            &self.cache,
            &self.registry,
            self.connector.as_ref(),
        )?;
        self.deployments.resync_ready().await;
        Ok(report)
    }

    /// Spawn the reconciler and resume persisted autoscalers
    pub fn start(&self) {
        let mut reconciler = self.reconciler.lock();
        if reconciler.is_some() {
            return;
        }
        *reconciler = Some(
            Arc::clone(&self.deployments).spawn_reconciler(self.config.reconcile_interval),
        );
        let resumed = self.autoscalers.resume_all();
        info!(
            "Control plane started (reconcile every {:?}, {} autoscaler(s) resumed)",
            self.config.reconcile_interval, resumed
        );
    }

    pub fn is_running(&self) -> bool {
        self.reconciler.lock().is_some()
    }

    /// Stop every background loop
    pub fn shutdown(&self) {
        if let Some(tx) = self.reconciler.lock().take() {
            let _ = tx.send(());
        }
        self.autoscalers.shutdown();
        info!("Control plane stopped");
    }

    // ========================================================================
    // Components
    // ========================================================================

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn pods(&self) -> &Arc<PodManager> {
        &self.pods
    }

    pub fn deployments(&self) -> &Arc<DeploymentController> {
        &self.deployments
    }

    pub fn autoscalers(&self) -> &Arc<AutoscalerController> {
        &self.autoscalers
    }

    pub fn services(&self) -> &Arc<ServiceController> {
        &self.services
    }

    pub fn registration(&self) -> &Arc<RegistrationController> {
        &self.registration
    }

    /// Get cluster statistics
    pub fn cluster_stats(&self) -> ClusterStats {
        let nodes = self.registry.list();
        let pods = self.cache.list_pods();
        ClusterStats {
            total_nodes: nodes.len(),
            ready_nodes: nodes.iter().filter(|n| n.is_ready()).count(),
            pods: pods.len(),
            ready_pods: pods.iter().filter(|p| p.is_ready()).count(),
            deployments: self.cache.list_deployments().len(),
            autoscalers: self.cache.list_autoscalers().len(),
            services: self.cache.list_services().len(),
        }
    }
}
