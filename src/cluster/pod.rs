//! Pod resource - the smallest schedulable unit
//!
//! A Pod groups containers and volumes that run together on one node.
//! Once scheduled it is owned by exactly one node; its phase is reported
//! back by that node's agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resources::{ObjectMeta, API_VERSION};

/// A Pod in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// API version
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Kind is always "Pod"
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Metadata about the pod
    pub metadata: ObjectMeta,

    /// Desired state
    pub spec: PodSpec,

    /// Observed state (populated by the control plane and the worker)
    #[serde(default)]
    pub status: PodStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Pod".to_string()
}

/// Pod specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Containers run by this pod
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Volumes shared by the containers
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Name of another pod this pod must share a node with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
}

/// A container inside a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,

    #[serde(rename = "volumeMounts")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default)]
    pub resources: ResourceLimits,
}

impl Container {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: vec![],
            args: vec![],
            env: BTreeMap::new(),
            ports: vec![],
            volume_mounts: vec![],
            resources: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(rename = "containerPort")]
    pub container_port: u16,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Resource limits for a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit (e.g., "500m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit (e.g., "128Mi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,

    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

/// A volume; an empty directory unless a host path is given
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,

    #[serde(rename = "hostPath")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// Observed pod state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,

    /// IP of the node the pod was scheduled to
    #[serde(rename = "hostIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// IP assigned to the pod by its node
    #[serde(rename = "podIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    /// Accepted but not yet running
    #[default]
    Pending,
    /// Containers have been started
    Running,
    /// Running and passing readiness checks
    Ready,
    /// All containers exited successfully
    Succeeded,
    /// At least one container failed
    Failed,
}

impl Pod {
    /// Create a new Pod with an empty spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::new(name),
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }

    /// Add a container
    pub fn with_container(mut self, container: Container) -> Self {
        self.spec.containers.push(container);
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Require co-location with another pod
    pub fn with_affinity(mut self, target: impl Into<String>) -> Self {
        self.spec.affinity = Some(target.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn phase(&self) -> PodPhase {
        self.status.phase
    }

    pub fn is_ready(&self) -> bool {
        self.status.phase == PodPhase::Ready
    }

    /// Whether the pod has been placed on a node
    pub fn is_scheduled(&self) -> bool {
        self.status.host_ip.is_some()
    }
}
