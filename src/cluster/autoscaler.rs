//! Horizontal pod autoscaler for deployments
//!
//! An Autoscaler watches the resource usage of one deployment's pods and
//! nudges the deployment's desired replica count by one per tick. It never
//! touches pods; the deployment controller acts on the new count.
//!
//! The decision itself is a pure function, [`evaluate_scaling`], so the
//! thresholds can be tested without a running monitor loop.

use serde::{Deserialize, Serialize};

use super::resources::{ObjectMeta, API_VERSION};

/// Margin above the target utilization before scaling out.
///
/// Usage has to exceed `target * SCALE_EXPANSION_FACTOR` per pod, which keeps
/// a deployment sitting right at its target from flapping.
pub const SCALE_EXPANSION_FACTOR: f64 = 1.05;

/// An Autoscaler bound to a single deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Autoscaler {
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ObjectMeta,

    pub spec: AutoscalerSpec,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Autoscaler".to_string()
}

/// Autoscaler specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerSpec {
    /// Name of the deployment to scale
    pub deployment: String,

    /// Minimum replicas
    #[serde(rename = "minReplicas")]
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,

    /// Maximum replicas
    #[serde(rename = "maxReplicas")]
    pub max_replicas: u32,

    /// Metrics to watch
    #[serde(default)]
    pub metrics: Vec<MetricTarget>,

    /// Seconds between two evaluations
    #[serde(rename = "intervalSeconds")]
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

fn default_min_replicas() -> u32 {
    1
}

fn default_interval() -> u64 {
    15
}

/// A watched metric and its per-pod target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "lowercase")]
pub enum MetricTarget {
    /// CPU usage per pod, in the unit the metrics provider reports
    Cpu {
        #[serde(rename = "targetUtilization")]
        target_utilization: f64,
    },
    /// Memory usage per pod in bytes
    Memory {
        #[serde(rename = "targetUtilization")]
        target_utilization: u64,
    },
}

impl MetricTarget {
    /// Whether the target can ever be met
    pub fn is_valid(&self) -> bool {
        match *self {
            MetricTarget::Cpu { target_utilization } => {
                target_utilization.is_finite() && target_utilization > 0.0
            }
            MetricTarget::Memory { target_utilization } => target_utilization > 0,
        }
    }
}

impl Autoscaler {
    pub fn new(name: impl Into<String>, deployment: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::new(name),
            spec: AutoscalerSpec {
                deployment: deployment.into(),
                min_replicas: min,
                max_replicas: max,
                metrics: vec![],
                interval_secs: default_interval(),
            },
        }
    }

    /// Watch a metric
    pub fn with_metric(mut self, metric: MetricTarget) -> Self {
        self.spec.metrics.push(metric);
        self
    }

    /// Set the evaluation interval
    pub fn with_interval(mut self, secs: u64) -> Self {
        self.spec.interval_secs = secs;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Clamp a replica count into `[min, max]`
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.spec.min_replicas, self.spec.max_replicas)
    }

    pub fn in_bounds(&self, replicas: u32) -> bool {
        (self.spec.min_replicas..=self.spec.max_replicas).contains(&replicas)
    }
}

/// Aggregate usage of one metric across a deployment's pods
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricSample {
    Cpu { target: f64, total: f64 },
    Memory { target: u64, total: u64 },
}

impl MetricSample {
    /// Attach an aggregate reading to its target
    pub fn cpu(target: f64, total: f64) -> Self {
        MetricSample::Cpu { target, total }
    }

    pub fn memory(target: u64, total: u64) -> Self {
        MetricSample::Memory { target, total }
    }

    fn label(&self) -> &'static str {
        match self {
            MetricSample::Cpu { .. } => "cpu",
            MetricSample::Memory { .. } => "memory",
        }
    }

    /// Per-pod usage and target, as floats
    fn per_pod(&self, pods: u32) -> (f64, f64) {
        let pods = f64::from(pods.max(1));
        match *self {
            MetricSample::Cpu { target, total } => (total / pods, target),
            MetricSample::Memory { target, total } => (total as f64 / pods, target as f64),
        }
    }

    /// Per-pod usage is above the target plus the expansion margin
    pub fn exceeds_target(&self, pods: u32) -> bool {
        let (usage, target) = self.per_pod(pods);
        usage > target * SCALE_EXPANSION_FACTOR
    }

    /// Fewest pods that keep per-pod usage at or under the target
    pub fn required_pods(&self) -> u64 {
        match *self {
            MetricSample::Cpu { target, total } => {
                if target <= 0.0 {
                    return u64::MAX;
                }
                (total / target).ceil() as u64
            }
            MetricSample::Memory { target, total } => {
                if target == 0 {
                    return u64::MAX;
                }
                total.div_ceil(target)
            }
        }
    }
}

/// Scaling decision from the autoscaler
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingDecision {
    /// No change needed
    NoChange,
    /// Scale up to the target number of replicas
    ScaleUp {
        target_replicas: u32,
        reason: String,
    },
    /// Scale down to the target number of replicas
    ScaleDown {
        target_replicas: u32,
        reason: String,
    },
}

impl ScalingDecision {
    /// New desired replica count, if any
    pub fn target_replicas(&self) -> Option<u32> {
        match self {
            ScalingDecision::NoChange => None,
            ScalingDecision::ScaleUp {
                target_replicas, ..
            }
            | ScalingDecision::ScaleDown {
                target_replicas, ..
            } => Some(*target_replicas),
        }
    }
}

/// Evaluate one autoscaler tick
///
/// `current_replicas` is the deployment's desired count and is what the
/// bounds apply to; `pod_count` is the number of pods the samples were
/// aggregated over.
///
/// Scale-out fires as soon as any metric is hot. Scale-in needs every metric
/// to agree that fewer pods would do.
pub fn evaluate_scaling(
    spec: &AutoscalerSpec,
    current_replicas: u32,
    pod_count: u32,
    samples: &[MetricSample],
) -> ScalingDecision {
    if pod_count == 0 || samples.is_empty() {
        return ScalingDecision::NoChange;
    }

    if current_replicas < spec.max_replicas {
        if let Some(hot) = samples.iter().find(|s| s.exceeds_target(pod_count)) {
            let (usage, target) = hot.per_pod(pod_count);
            return ScalingDecision::ScaleUp {
                target_replicas: current_replicas + 1,
                reason: format!(
                    "{} usage {:.1} per pod exceeds target {:.1}",
                    hot.label(),
                    usage,
                    target
                ),
            };
        }
    }

    if current_replicas > spec.min_replicas {
        let fewer_suffice = samples
            .iter()
            .all(|s| s.required_pods() < u64::from(pod_count));
        if fewer_suffice {
            return ScalingDecision::ScaleDown {
                target_replicas: current_replicas - 1,
                reason: format!(
                    "all {} metrics fit in fewer than {} pods",
                    samples.len(),
                    pod_count
                ),
            };
        }
    }

    ScalingDecision::NoChange
}
