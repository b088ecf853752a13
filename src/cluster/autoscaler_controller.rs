//! Autoscaler controller - one monitor loop per autoscaler
//!
//! Each tick snapshots the target deployment, and when every pod is Ready,
//! samples usage through the metrics provider and applies the decision from
//! [`evaluate_scaling`]. Only the deployment's desired replica count changes;
//! the deployment controller creates or removes the pods.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::autoscaler::{evaluate_scaling, Autoscaler, MetricSample, MetricTarget, ScalingDecision};
use super::cache::ResourceCache;
use super::metrics::{MetricsError, MetricsProvider};
use super::pod::Pod;
use super::resources::is_valid_name;
use super::store::{ClusterStore, StoreError};

/// Errors from autoscaler operations
#[derive(Debug, thiserror::Error)]
pub enum AutoscalerError {
    #[error("Invalid autoscaler name: {0}")]
    InvalidName(String),

    #[error("Invalid replica bounds: min {min} > max {max}")]
    InvalidBounds { min: u32, max: u32 },

    #[error("Invalid autoscaler spec: {0}")]
    InvalidSpec(String),

    #[error("Autoscaler already exists: {0}")]
    AlreadyExists(String),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("Deployment '{deployment}' is already scaled by '{autoscaler}'")]
    DeploymentAlreadyScaled {
        deployment: String,
        autoscaler: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What one monitor tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The autoscaler is gone; the loop ends
    Stopped,
    /// Nothing was evaluated
    Skipped(String),
    /// A decision was made (and applied if it changes anything)
    Decided(ScalingDecision),
}

/// Result of describing autoscalers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscalerDescription {
    pub autoscalers: Vec<Autoscaler>,

    /// Requested names that do not exist
    #[serde(default)]
    pub missing: Vec<String>,
}

/// Runs autoscaler monitor loops
pub struct AutoscalerController {
    cache: Arc<ResourceCache>,
    store: ClusterStore,
    metrics: Arc<dyn MetricsProvider>,
    lock: Mutex<()>,
    monitors: DashMap<String, JoinHandle<()>>,
}

impl AutoscalerController {
    pub fn new(
        cache: Arc<ResourceCache>,
        store: ClusterStore,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            cache,
            store,
            metrics,
            lock: Mutex::new(()),
            monitors: DashMap::new(),
        }
    }

    /// Create an autoscaler and start its monitor loop
    pub async fn create_autoscaler(
        self: &Arc<Self>,
        mut autoscaler: Autoscaler,
    ) -> Result<Autoscaler, AutoscalerError> {
        let _guard = self.lock.lock().await;
        let name = autoscaler.metadata.name.clone();
        validate(&autoscaler)?;

        if self.cache.autoscaler_exists(&name) {
            return Err(AutoscalerError::AlreadyExists(name));
        }
        let target = autoscaler.spec.deployment.clone();
        let deployment = self
            .cache
            .get_deployment(&target)
            .ok_or_else(|| AutoscalerError::DeploymentNotFound(target.clone()))?;
        if let Some(existing) = self.cache.autoscaler_for_deployment(&target) {
            return Err(AutoscalerError::DeploymentAlreadyScaled {
                deployment: target,
                autoscaler: existing.metadata.name,
            });
        }

        autoscaler.metadata.stamp();
        self.store.put_autoscaler(&autoscaler)?;
        self.cache.set_autoscaler(autoscaler.clone());

        let clamped = autoscaler.clamp(deployment.spec.replicas);
        if clamped != deployment.spec.replicas {
            if let Some(updated) = self
                .cache
                .update_deployment(&target, |d| d.spec.replicas = clamped)
            {
                if let Err(e) = self.store.put_deployment(&updated) {
                    warn!("Failed to persist clamped deployment '{}': {}", target, e);
                }
            }
            info!(
                "Deployment '{}' clamped from {} to {} replicas",
                target, deployment.spec.replicas, clamped
            );
        }

        self.start_monitor(&autoscaler);
        info!(
            "Autoscaler '{}' watching deployment '{}' ({}..={} replicas)",
            name, target, autoscaler.spec.min_replicas, autoscaler.spec.max_replicas
        );
        Ok(autoscaler)
    }

    /// Describe every autoscaler, or only the named ones
    pub fn describe_autoscalers(&self, all: bool, names: &[String]) -> AutoscalerDescription {
        if all {
            return AutoscalerDescription {
                autoscalers: self.cache.list_autoscalers(),
                missing: vec![],
            };
        }

        let mut description = AutoscalerDescription::default();
        for name in names {
            match self.cache.get_autoscaler(name) {
                Some(autoscaler) => description.autoscalers.push(autoscaler),
                None => description.missing.push(name.clone()),
            }
        }
        description
    }

    /// Start monitors for cached autoscalers that have none (after recovery)
    pub fn resume_all(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for autoscaler in self.cache.list_autoscalers() {
            if !self.monitors.contains_key(&autoscaler.metadata.name) {
                self.start_monitor(&autoscaler);
                started += 1;
            }
        }
        started
    }

    pub fn is_monitoring(&self, name: &str) -> bool {
        self.monitors.contains_key(name)
    }

    /// Abort every monitor loop
    pub fn shutdown(&self) {
        for entry in self.monitors.iter() {
            entry.value().abort();
        }
        self.monitors.clear();
    }

    fn start_monitor(self: &Arc<Self>, autoscaler: &Autoscaler) {
        let name = autoscaler.metadata.name.clone();
        let period = Duration::from_secs(autoscaler.spec.interval_secs.max(1));
        let controller = Arc::clone(self);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match controller.evaluate_once(&task_name).await {
                    TickOutcome::Stopped => {
                        controller.monitors.remove(&task_name);
                        info!("Autoscaler '{}' stopped", task_name);
                        break;
                    }
                    TickOutcome::Skipped(reason) => {
                        debug!("Autoscaler '{}' skipped tick: {}", task_name, reason);
                    }
                    TickOutcome::Decided(_) => {}
                }
            }
        });

        if let Some(previous) = self.monitors.insert(name, handle) {
            previous.abort();
        }
    }

    /// Run one monitor tick for the named autoscaler
    pub async fn evaluate_once(&self, name: &str) -> TickOutcome {
        let _guard = self.lock.lock().await;
        let Some(autoscaler) = self.cache.get_autoscaler(name) else {
            return TickOutcome::Stopped;
        };
        let target = &autoscaler.spec.deployment;

        let Some(deployment) = self.cache.get_deployment(target) else {
            self.cache.delete_autoscaler(name);
            if let Err(e) = self.store.delete_autoscaler(name) {
                warn!("Failed to remove autoscaler '{}' from store: {}", name, e);
            }
            info!(
                "Deployment '{}' is gone; deleting autoscaler '{}'",
                target, name
            );
            return TickOutcome::Stopped;
        };

        let pod_names = self.cache.pods_of_deployment(target).unwrap_or_default();
        if pod_names.is_empty() {
            return TickOutcome::Skipped("deployment has no pods".to_string());
        }
        if !autoscaler.in_bounds(deployment.status.ready_replicas) {
            return TickOutcome::Skipped(format!(
                "{} ready replicas outside bounds",
                deployment.status.ready_replicas
            ));
        }

        let mut pods = Vec::with_capacity(pod_names.len());
        for pod_name in &pod_names {
            match self.cache.get_pod(pod_name) {
                Some(pod) if pod.is_ready() => pods.push(pod),
                _ => return TickOutcome::Skipped(format!("pod '{}' is not ready", pod_name)),
            }
        }

        let mut samples = Vec::with_capacity(autoscaler.spec.metrics.len());
        for metric in &autoscaler.spec.metrics {
            match self.sample(metric, &pods).await {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    warn!("Autoscaler '{}' could not read metrics: {}", name, e);
                    return TickOutcome::Skipped(format!("metrics query failed: {}", e));
                }
            }
        }

        let decision = evaluate_scaling(
            &autoscaler.spec,
            deployment.spec.replicas,
            pods.len() as u32,
            &samples,
        );

        if let Some(replicas) = decision.target_replicas() {
            if let Some(updated) = self
                .cache
                .update_deployment(target, |d| d.spec.replicas = replicas)
            {
                if let Err(e) = self.store.put_deployment(&updated) {
                    warn!("Failed to persist deployment '{}': {}", target, e);
                }
            }
            match &decision {
                ScalingDecision::ScaleUp { reason, .. } => info!(
                    "Autoscaler '{}' scaling '{}' up to {}: {}",
                    name, target, replicas, reason
                ),
                ScalingDecision::ScaleDown { reason, .. } => info!(
                    "Autoscaler '{}' scaling '{}' down to {}: {}",
                    name, target, replicas, reason
                ),
                ScalingDecision::NoChange => {}
            }
        }

        TickOutcome::Decided(decision)
    }

    /// Aggregate one metric over the pods
    async fn sample(&self, metric: &MetricTarget, pods: &[Pod]) -> Result<MetricSample, MetricsError> {
        match *metric {
            MetricTarget::Cpu { target_utilization } => {
                let mut total = 0.0;
                for pod in pods {
                    total += self.metrics.pod_cpu_usage(pod).await?;
                }
                Ok(MetricSample::cpu(target_utilization, total))
            }
            MetricTarget::Memory { target_utilization } => {
                let mut total: u64 = 0;
                for pod in pods {
                    total = total.saturating_add(self.metrics.pod_memory_usage(pod).await?);
                }
                Ok(MetricSample::memory(target_utilization, total))
            }
        }
    }
}

fn validate(autoscaler: &Autoscaler) -> Result<(), AutoscalerError> {
    let spec = &autoscaler.spec;
    if !is_valid_name(&autoscaler.metadata.name) {
        return Err(AutoscalerError::InvalidName(autoscaler.metadata.name.clone()));
    }
    if spec.min_replicas > spec.max_replicas || spec.max_replicas == 0 {
        return Err(AutoscalerError::InvalidBounds {
            min: spec.min_replicas,
            max: spec.max_replicas,
        });
    }
    if spec.metrics.is_empty() {
        return Err(AutoscalerError::InvalidSpec(
            "at least one metric is required".to_string(),
        ));
    }
    if !spec.metrics.iter().all(MetricTarget::is_valid) {
        return Err(AutoscalerError::InvalidSpec(
            "metric targets must be positive".to_string(),
        ));
    }
    if spec.interval_secs == 0 {
        return Err(AutoscalerError::InvalidSpec(
            "interval must be at least one second".to_string(),
        ));
    }
    Ok(())
}
