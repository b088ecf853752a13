//! Deployment controller - keeps each deployment at its desired replicas
//!
//! Two halves work together:
//! - A reconciliation loop on a fixed timer compares `spec.replicas` with
//!   `status.replicas` and creates or deletes pods through the pod controller
//! - Event handlers correct the status counters when pods become Ready,
//!   finish, or disappear on their own
//!
//! Pods deleted by the loop are remembered in an expected-deletion set so the
//! PodDeletion event that follows does not decrement a second time. Pods
//! counted in `ready_replicas` are remembered too, so a pod is counted at
//! most once and released exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::cache::ResourceCache;
use super::deployment::{Deployment, DeploymentStatus, MAX_DEPLOYMENT_NAME_LEN};
use super::events::{EventHandler, PodEvent};
use super::pod::Pod;
use super::pod_controller::PodController;
use super::resources::is_valid_name;
use super::store::{ClusterStore, StoreError};

/// Errors from deployment operations
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("Invalid deployment name: {0}")]
    InvalidName(String),

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Updating the pod template of deployment '{0}' is not supported")]
    UpdateNotSupported(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct DeploymentState {
    /// Pods this controller deleted whose deletion event is still pending
    expected_deletions: HashSet<String>,
    /// Pods counted in their deployment's ready counters
    ready_pods: HashSet<String>,
}

/// A deployment with its ordered pod names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentDetail {
    pub deployment: Deployment,
    pub pods: Vec<String>,
}

/// Result of describing deployments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentDescription {
    pub deployments: Vec<DeploymentDetail>,

    /// Requested names that do not exist
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Reconciles deployments against their pods
pub struct DeploymentController {
    cache: Arc<ResourceCache>,
    store: ClusterStore,
    pods: Arc<dyn PodController>,
    state: Mutex<DeploymentState>,
}

impl DeploymentController {
    pub fn new(cache: Arc<ResourceCache>, store: ClusterStore, pods: Arc<dyn PodController>) -> Self {
        Self {
            cache,
            store,
            pods,
            state: Mutex::new(DeploymentState::default()),
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Create a deployment or change its replica count.
    ///
    /// The pod template of an existing deployment cannot change.
    pub async fn apply_deployment(&self, mut deployment: Deployment) -> Result<Deployment, DeploymentError> {
        let _state = self.state.lock().await;
        let name = deployment.metadata.name.clone();
        if !is_valid_name(&name) || name.len() > MAX_DEPLOYMENT_NAME_LEN {
            return Err(DeploymentError::InvalidName(name));
        }

        if let Some(existing) = self.cache.get_deployment(&name) {
            if existing.template_hash() != deployment.template_hash() {
                return Err(DeploymentError::UpdateNotSupported(name));
            }
            if existing.spec.replicas == deployment.spec.replicas {
                return Ok(existing);
            }

            let mut updated = existing;
            updated.spec.replicas = deployment.spec.replicas;
            self.store.put_deployment(&updated)?;
            let replicas = updated.spec.replicas;
            self.cache
                .update_deployment(&name, |d| d.spec.replicas = replicas);
            info!("Deployment '{}' scaled to {} replicas", name, replicas);
            return Ok(updated);
        }

        deployment.metadata.stamp();
        deployment.status = DeploymentStatus::default();
        self.store.put_deployment(&deployment)?;
        self.store.put_deployment_pods(&name, &[])?;
        self.cache.insert_deployment(deployment.clone());
        info!(
            "Deployment '{}' created with {} replicas",
            name, deployment.spec.replicas
        );
        Ok(deployment)
    }

    /// Delete every pod of a deployment, then the deployment itself
    pub async fn delete_deployment_by_name(&self, name: &str) -> Result<Deployment, DeploymentError> {
        let mut state = self.state.lock().await;
        if !self.cache.deployment_exists(name) {
            return Err(DeploymentError::NotFound(name.to_string()));
        }

        let pods = self.cache.pods_of_deployment(name).unwrap_or_default();
        for pod in pods.iter().rev() {
            state.expected_deletions.insert(pod.clone());
            if let Err(e) = self.pods.delete_pod_by_name(pod).await {
                warn!("Failed to delete pod '{}' of deployment '{}': {}", pod, name, e);
                state.expected_deletions.remove(pod);
            }
        }
        for pod in &pods {
            state.ready_pods.remove(pod);
        }

        // Records go first; the store must never list a missing pod
        let leftovers = self.cache.pods_of_deployment(name).unwrap_or_default();
        self.store.delete_deployment(name)?;
        let deployment = self
            .cache
            .delete_deployment(name)
            .ok_or_else(|| DeploymentError::NotFound(name.to_string()))?;

        // Pods whose deletion failed still go with the deployment
        for pod in leftovers {
            error!(
                "Pod '{}' of deleted deployment '{}' could not be stopped and is now orphaned on its node",
                pod, name
            );
            if let Err(e) = self.store.delete_pod(&pod) {
                warn!("Failed to remove pod '{}' from store: {}", pod, e);
            }
        }

        info!("Deployment '{}' deleted", name);
        Ok(deployment)
    }

    /// Describe every deployment, or only the named ones
    pub fn describe_deployments(&self, all: bool, names: &[String]) -> DeploymentDescription {
        let detail = |deployment: Deployment| DeploymentDetail {
            pods: self
                .cache
                .pods_of_deployment(&deployment.metadata.name)
                .unwrap_or_default(),
            deployment,
        };

        if all {
            return DeploymentDescription {
                deployments: self.cache.list_deployments().into_iter().map(detail).collect(),
                missing: vec![],
            };
        }

        let mut description = DeploymentDescription::default();
        for name in names {
            match self.cache.get_deployment(name) {
                Some(deployment) => description.deployments.push(detail(deployment)),
                None => description.missing.push(name.clone()),
            }
        }
        description
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Run one reconciliation pass over every deployment
    pub async fn reconcile_once(&self) {
        let mut state = self.state.lock().await;

        for deployment in self.cache.list_deployments() {
            let name = deployment.metadata.name.clone();
            let Some(pods) = self.cache.pods_of_deployment(&name) else {
                error!("Deployment '{}' has no pod list; skipping reconciliation", name);
                continue;
            };

            let diff = i64::from(deployment.spec.replicas) - i64::from(deployment.status.replicas);
            if diff == 0 {
                continue;
            }
            debug!(
                "Deployment '{}': desired {}, tracked {}",
                name, deployment.spec.replicas, deployment.status.replicas
            );

            let changed = if diff > 0 {
                self.scale_up(&deployment, diff as u64).await
            } else {
                self.scale_down(&mut state, &deployment, &pods, diff.unsigned_abs())
                    .await
            };

            if changed {
                self.persist(&name);
            }
        }
    }

    async fn scale_up(&self, deployment: &Deployment, count: u64) -> bool {
        let name = deployment.name();
        let mut changed = false;

        for _ in 0..count {
            let pod = deployment.new_replica();
            let pod_name = pod.metadata.name.clone();
            match self.pods.create_pod(pod).await {
                Ok(_) => {
                    if !self.cache.link_pod(name, &pod_name) {
                        error!(
                            "Pod '{}' was created but could not be linked to deployment '{}'",
                            pod_name, name
                        );
                        continue;
                    }
                    self.cache
                        .update_deployment(name, |d| d.status.replicas += 1);
                    changed = true;
                }
                Err(e) => warn!("Failed to create pod for deployment '{}': {}", name, e),
            }
        }
        changed
    }

    async fn scale_down(
        &self,
        state: &mut DeploymentState,
        deployment: &Deployment,
        pods: &[String],
        count: u64,
    ) -> bool {
        let name = deployment.name();
        let mut changed = false;

        let victims = pods.iter().rev().take(count as usize);
        for victim in victims {
            let snapshot = self.cache.get_pod(victim);
            state.expected_deletions.insert(victim.clone());

            match self.pods.delete_pod_by_name(victim).await {
                Ok(()) => {
                    let was_ready = state.ready_pods.remove(victim);
                    self.cache.update_deployment(name, |d| {
                        d.status.replicas = d.status.replicas.saturating_sub(1);
                        if let Some(pod) = snapshot.as_ref().filter(|_| was_ready) {
                            release_ready(d, pod);
                        }
                    });
                    changed = true;
                }
                Err(e) => {
                    state.expected_deletions.remove(victim);
                    warn!("Failed to delete pod '{}' of deployment '{}': {}", victim, name, e);
                }
            }
        }
        changed
    }

    fn persist(&self, name: &str) {
        let Some(deployment) = self.cache.get_deployment(name) else {
            return;
        };
        let pods = self.cache.pods_of_deployment(name).unwrap_or_default();
        if let Err(e) = self
            .store
            .put_deployment(&deployment)
            .and_then(|_| self.store.put_deployment_pods(name, &pods))
        {
            warn!("Failed to persist deployment '{}': {}", name, e);
        }
    }

    /// Start the reconciliation loop.
    ///
    /// Ticks never overlap; a slow pass delays the next one.
    pub fn spawn_reconciler(self: Arc<Self>, period: Duration) -> watch::Sender<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Deployment reconciler started, every {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reconcile_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Deployment reconciler shutting down");
                        break;
                    }
                }
            }
        });

        shutdown_tx
    }

    // ========================================================================
    // Events
    // ========================================================================

    async fn on_deletion(&self, pod: &Pod, owner: Option<&str>) {
        let mut state = self.state.lock().await;
        let name = &pod.metadata.name;
        if state.expected_deletions.remove(name) {
            debug!("Deletion of pod '{}' was expected", name);
            return;
        }

        let was_ready = state.ready_pods.remove(name);
        let Some(owner) = owner else {
            return;
        };
        let updated = self.cache.update_deployment(owner, |d| {
            d.status.replicas = d.status.replicas.saturating_sub(1);
            if was_ready {
                release_ready(d, pod);
            }
        });
        if updated.is_some() {
            info!("Pod '{}' of deployment '{}' disappeared", name, owner);
            self.persist(owner);
        }
    }

    async fn on_ready(&self, pod: &Pod) {
        let mut state = self.state.lock().await;
        let name = &pod.metadata.name;
        let Some(owner) = self.cache.deployment_of_pod(name) else {
            return;
        };
        if !state.ready_pods.insert(name.clone()) {
            debug!("Pod '{}' is already counted as Ready", name);
            return;
        }

        let mut stale = false;
        let updated = self.cache.update_deployment(&owner, |d| {
            d.status.ready_replicas += 1;
            if d.matches_template(pod) {
                d.status.updated_replicas += 1;
            } else {
                stale = true;
            }
        });
        if updated.is_none() {
            state.ready_pods.remove(name);
            return;
        }
        if stale {
            error!(
                "Pod '{}' of deployment '{}' is Ready with a stale template",
                name, owner
            );
        }
        self.persist(&owner);
    }

    /// A Failed or Succeeded pod no longer counts as Ready
    async fn on_finished(&self, pod: &Pod) {
        let mut state = self.state.lock().await;
        let name = &pod.metadata.name;
        if !state.ready_pods.remove(name) {
            return;
        }
        let Some(owner) = self.cache.deployment_of_pod(name) else {
            return;
        };
        if self
            .cache
            .update_deployment(&owner, |d| release_ready(d, pod))
            .is_some()
        {
            info!(
                "Pod '{}' of deployment '{}' left Ready as {:?}",
                name, owner, pod.status.phase
            );
            self.persist(&owner);
        }
    }

    /// Rebuild the ready counters from the cached pod phases.
    ///
    /// Runs after recovery, before any event is handled.
    pub async fn resync_ready(&self) {
        let mut state = self.state.lock().await;
        state.ready_pods.clear();

        for deployment in self.cache.list_deployments() {
            let name = deployment.metadata.name.clone();
            let ready: Vec<Pod> = self
                .cache
                .pods_of_deployment(&name)
                .unwrap_or_default()
                .iter()
                .filter_map(|p| self.cache.get_pod(p))
                .filter(|p| p.is_ready())
                .collect();
            let updated = ready.iter().filter(|p| deployment.matches_template(p)).count();
            state
                .ready_pods
                .extend(ready.iter().map(|p| p.metadata.name.clone()));

            let ready_replicas = ready.len() as u32;
            let updated_replicas = updated as u32;
            if deployment.status.ready_replicas == ready_replicas
                && deployment.status.updated_replicas == updated_replicas
            {
                continue;
            }
            warn!(
                "Deployment '{}' had {} ready/{} updated persisted, found {}/{}",
                name,
                deployment.status.ready_replicas,
                deployment.status.updated_replicas,
                ready_replicas,
                updated_replicas
            );
            self.cache.update_deployment(&name, |d| {
                d.status.ready_replicas = ready_replicas;
                d.status.updated_replicas = updated_replicas;
            });
            self.persist(&name);
        }
    }
}

/// Take a pod out of a deployment's ready counters
fn release_ready(deployment: &mut Deployment, pod: &Pod) {
    deployment.status.ready_replicas = deployment.status.ready_replicas.saturating_sub(1);
    if deployment.matches_template(pod) {
        deployment.status.updated_replicas = deployment.status.updated_replicas.saturating_sub(1);
    }
}

#[async_trait]
impl EventHandler for DeploymentController {
    async fn handle(&self, event: &PodEvent) {
        match event {
            PodEvent::Deletion { pod, legacy } => {
                let owner = legacy.as_ref().and_then(|l| l.deployment.as_deref());
                self.on_deletion(pod, owner).await;
            }
            PodEvent::Ready { pod } => self.on_ready(pod).await,
            PodEvent::Failed { pod } | PodEvent::Succeeded { pod } => {
                self.on_finished(pod).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::deployment::PodTemplate;
    use crate::cluster::events::{EventBus, EventKind};
    use crate::cluster::node::Node;
    use crate::cluster::pod::{Container, PodPhase};
    use crate::cluster::pod_controller::PodManager;
    use crate::cluster::registry::NodeRegistry;
    use crate::cluster::scheduler::Scheduler;
    use crate::cluster::recovery::recover;
    use crate::cluster::testing::{settle, FakeConnector, FakeWorker};

    struct Fixture {
        controller: Arc<DeploymentController>,
        pods: Arc<PodManager>,
        cache: Arc<ResourceCache>,
        store: ClusterStore,
        worker: Arc<FakeWorker>,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(ResourceCache::new());
        let registry = Arc::new(NodeRegistry::new());
        let store = ClusterStore::in_memory();
        let bus = Arc::new(EventBus::new());

        let worker = Arc::new(FakeWorker::new());
        let mut node = Node::new("node-1", "10.0.0.1");
        node.mark_running();
        registry.register(node, worker.clone()).unwrap();

        let scheduler = Arc::new(Scheduler::new(Arc::clone(&registry), Arc::clone(&cache)));
        let pods = Arc::new(PodManager::new(
            Arc::clone(&cache),
            registry,
            scheduler,
            store.clone(),
            Arc::clone(&bus),
        ));
        let controller = Arc::new(DeploymentController::new(
            Arc::clone(&cache),
            store.clone(),
            pods.clone(),
        ));
        for kind in EventKind::ALL {
            bus.subscribe(controller.clone(), kind);
        }

        Fixture {
            controller,
            pods,
            cache,
            store,
            worker,
        }
    }

    fn make_template() -> PodTemplate {
        let mut template = PodTemplate::default();
        template.labels.insert("app".to_string(), "web".to_string());
        template
            .spec
            .containers
            .push(Container::new("nginx", "nginx:1.25"));
        template
    }

    fn make_deployment(replicas: u32) -> Deployment {
        Deployment::new("web", make_template()).with_replicas(replicas)
    }

    fn status(f: &Fixture) -> DeploymentStatus {
        f.cache.get_deployment("web").unwrap().status
    }

    fn pod_list(f: &Fixture) -> Vec<String> {
        f.cache.pods_of_deployment("web").unwrap()
    }

    #[tokio::test]
    async fn test_apply_creates_with_zero_status() {
        let f = fixture();
        let created = f.controller.apply_deployment(make_deployment(3)).await.unwrap();

        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.status, DeploymentStatus::default());
        assert_eq!(pod_list(&f), Vec::<String>::new());
        assert_eq!(f.store.list_deployments().unwrap().len(), 1);
        assert_eq!(f.store.deployment_pods("web").unwrap(), Some(vec![]));
    }

    #[tokio::test]
    async fn test_reconcile_converges() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(3)).await.unwrap();

        f.controller.reconcile_once().await;

        assert_eq!(status(&f).replicas, 3);
        let pods = pod_list(&f);
        assert_eq!(pods.len(), 3);
        let prefix = format!("web-{}-", make_template().hash());
        assert!(pods.iter().all(|p| p.starts_with(&prefix)));
        assert_eq!(f.worker.created_pods(), pods);
        assert_eq!(f.store.deployment_pods("web").unwrap(), Some(pods));

        // Already converged
        f.controller.reconcile_once().await;
        assert_eq!(f.worker.created_pods().len(), 3);
    }

    #[tokio::test]
    async fn test_create_failures_retry_next_tick() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.worker.set_fail_create(true);

        f.controller.reconcile_once().await;
        assert_eq!(status(&f).replicas, 0);
        assert!(pod_list(&f).is_empty());

        f.worker.set_fail_create(false);
        f.controller.reconcile_once().await;
        assert_eq!(status(&f).replicas, 2);
    }

    #[tokio::test]
    async fn test_scale_down_removes_tail_without_double_count() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(4)).await.unwrap();
        f.controller.reconcile_once().await;
        let before = pod_list(&f);

        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        assert_eq!(status(&f).replicas, 2);

        // Let the deletion events arrive
        settle().await;

        assert_eq!(status(&f).replicas, 2);
        assert_eq!(pod_list(&f), before[..2].to_vec());
        assert_eq!(
            f.worker.deleted_pods(),
            vec![before[3].clone(), before[2].clone()]
        );
        assert!(f.controller.state.lock().await.expected_deletions.is_empty());
    }

    #[tokio::test]
    async fn test_ready_events_update_status() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;

        for pod in pod_list(&f) {
            f.pods.report_phase(&pod, PodPhase::Ready, None).await.unwrap();
        }

        let status = status(&f);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.updated_replicas, 2);
        assert!(f.cache.get_deployment("web").unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_scale_down_releases_ready_counters() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        for pod in pod_list(&f) {
            f.pods.report_phase(&pod, PodPhase::Ready, None).await.unwrap();
        }

        f.controller.apply_deployment(make_deployment(1)).await.unwrap();
        f.controller.reconcile_once().await;
        settle().await;

        let status = status(&f);
        assert_eq!(status.replicas, 1);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.updated_replicas, 1);
    }

    #[tokio::test]
    async fn test_ready_counted_once_across_phase_flaps() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(1)).await.unwrap();
        f.controller.reconcile_once().await;
        let pod = pod_list(&f)[0].clone();

        for phase in [PodPhase::Ready, PodPhase::Running, PodPhase::Ready] {
            f.pods.report_phase(&pod, phase, None).await.unwrap();
        }

        let status = status(&f);
        assert_eq!(status.replicas, 1);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.updated_replicas, 1);
    }

    #[tokio::test]
    async fn test_failed_pod_leaves_ready_counters() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(1)).await.unwrap();
        f.controller.reconcile_once().await;
        let pod = pod_list(&f)[0].clone();

        f.pods.report_phase(&pod, PodPhase::Ready, None).await.unwrap();
        f.pods.report_phase(&pod, PodPhase::Failed, None).await.unwrap();
        assert_eq!(status(&f).ready_replicas, 0);
        assert_eq!(status(&f).updated_replicas, 0);

        f.controller.apply_deployment(make_deployment(0)).await.unwrap();
        f.controller.reconcile_once().await;
        settle().await;

        assert_eq!(status(&f), DeploymentStatus::default());
        assert!(pod_list(&f).is_empty());
        assert_eq!(
            f.store.list_deployments().unwrap()[0].status,
            DeploymentStatus::default()
        );
    }

    #[tokio::test]
    async fn test_resync_ready_rebuilds_counters() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let pods = pod_list(&f);
        f.pods.report_phase(&pods[0], PodPhase::Ready, None).await.unwrap();

        // Counters as a stale store could hand them back
        f.cache.update_deployment("web", |d| {
            d.status.ready_replicas = 5;
            d.status.updated_replicas = 5;
        });
        f.controller.resync_ready().await;
        assert_eq!(status(&f).ready_replicas, 1);
        assert_eq!(status(&f).updated_replicas, 1);
        assert_eq!(f.store.list_deployments().unwrap()[0].status.ready_replicas, 1);

        f.pods.delete_pod_by_name(&pods[0]).await.unwrap();
        settle().await;
        assert_eq!(status(&f).replicas, 1);
        assert_eq!(status(&f).ready_replicas, 0);
        assert_eq!(status(&f).updated_replicas, 0);
    }

    #[tokio::test]
    async fn test_store_recoverable_before_deletion_event() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let pods = pod_list(&f);

        // Keep the deletion event from being handled until recovery ran
        let state = f.controller.state.lock().await;
        f.pods.delete_pod_by_name(&pods[0]).await.unwrap();
        assert_eq!(
            f.store.deployment_pods("web").unwrap(),
            Some(vec![pods[1].clone()])
        );

        let cache = ResourceCache::new();
        let registry = NodeRegistry::new();
        let report = recover(&f.store, &cache, &registry, &FakeConnector::new()).unwrap();
        assert_eq!(report.pods, 1);
        assert_eq!(cache.pods_of_deployment("web"), Some(vec![pods[1].clone()]));
        assert_eq!(cache.deployment_of_pod(&pods[1]).as_deref(), Some("web"));

        drop(state);
        settle().await;
        assert_eq!(status(&f).replicas, 1);
    }

    #[tokio::test]
    async fn test_external_pod_deletion_is_replaced() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let victim = pod_list(&f)[0].clone();

        f.pods.delete_pod_by_name(&victim).await.unwrap();
        settle().await;
        assert_eq!(status(&f).replicas, 1);

        f.controller.reconcile_once().await;
        assert_eq!(status(&f).replicas, 2);
        assert_eq!(pod_list(&f).len(), 2);
        assert!(!pod_list(&f).contains(&victim));
    }

    #[tokio::test]
    async fn test_apply_identical_is_idempotent() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let before = pod_list(&f);

        let again = f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;

        assert_eq!(again.status.replicas, 2);
        assert_eq!(pod_list(&f), before);
    }

    #[tokio::test]
    async fn test_template_change_rejected() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let before = f.cache.get_deployment("web").unwrap();

        let mut changed = make_deployment(5);
        changed.spec.template.spec.containers[0].image = "nginx:1.26".to_string();
        let result = f.controller.apply_deployment(changed).await;

        assert!(matches!(result, Err(DeploymentError::UpdateNotSupported(_))));
        assert_eq!(f.cache.get_deployment("web").unwrap(), before);
        assert_eq!(pod_list(&f).len(), 2);
    }

    #[tokio::test]
    async fn test_delete_deployment_removes_pods() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(3)).await.unwrap();
        f.controller.reconcile_once().await;
        let pods = pod_list(&f);

        f.controller.delete_deployment_by_name("web").await.unwrap();
        settle().await;

        assert!(!f.cache.deployment_exists("web"));
        assert!(pods.iter().all(|p| !f.cache.pod_exists(p)));
        assert_eq!(f.worker.deleted_pods().len(), 3);
        assert!(f.store.list_deployments().unwrap().is_empty());
        assert!(f.store.list_pods().unwrap().is_empty());
        assert!(f.controller.state.lock().await.expected_deletions.is_empty());
    }

    #[tokio::test]
    async fn test_delete_deployment_drops_unstoppable_pods() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();
        f.controller.reconcile_once().await;
        let pods = pod_list(&f);
        f.worker.set_fail_delete(true);

        f.controller.delete_deployment_by_name("web").await.unwrap();
        settle().await;

        assert!(!f.cache.deployment_exists("web"));
        assert!(pods.iter().all(|p| !f.cache.pod_exists(p)));
        assert!(f.store.list_pods().unwrap().is_empty());
        assert_eq!(f.store.deployment_pods("web").unwrap(), None);
        let state = f.controller.state.lock().await;
        assert!(state.expected_deletions.is_empty());
        assert!(state.ready_pods.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_deployment() {
        let f = fixture();
        let result = f.controller.delete_deployment_by_name("ghost").await;
        assert!(matches!(result, Err(DeploymentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_describe_reports_missing() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(1)).await.unwrap();
        f.controller.reconcile_once().await;

        let description = f
            .controller
            .describe_deployments(false, &["web".to_string(), "api".to_string()]);
        assert_eq!(description.deployments.len(), 1);
        assert_eq!(description.deployments[0].pods.len(), 1);
        assert_eq!(description.missing, vec!["api".to_string()]);

        let all = f.controller.describe_deployments(true, &[]);
        assert_eq!(all.deployments.len(), 1);
        assert!(all.missing.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let f = fixture();
        let result = f
            .controller
            .apply_deployment(Deployment::new("Web App", make_template()))
            .await;
        assert!(matches!(result, Err(DeploymentError::InvalidName(_))));

        // Valid on its own, but replica names would overflow
        let long = "w".repeat(MAX_DEPLOYMENT_NAME_LEN + 1);
        let result = f
            .controller
            .apply_deployment(Deployment::new(long, make_template()))
            .await;
        assert!(matches!(result, Err(DeploymentError::InvalidName(_))));
        assert!(f.cache.list_deployments().is_empty());
    }

    #[tokio::test]
    async fn test_reconciler_loop_runs() {
        let f = fixture();
        f.controller.apply_deployment(make_deployment(2)).await.unwrap();

        let shutdown = Arc::clone(&f.controller).spawn_reconciler(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown.send(());

        assert_eq!(status(&f).replicas, 2);
    }
}
