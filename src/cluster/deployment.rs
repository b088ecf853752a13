//! Deployment resource - a replicated set of identical pods
//!
//! A Deployment declares:
//! - The desired number of replicas
//! - A pod template (labels + pod spec) every replica is stamped from
//!
//! Changing the template of an existing deployment is not supported; only
//! the replica count may change once a deployment exists.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::pod::{Pod, PodSpec};
use super::resources::{Labels, ObjectMeta, API_VERSION, MAX_NAME_LEN};

/// Length of the template hash embedded in pod names
const TEMPLATE_HASH_LEN: usize = 10;

/// Length of the random suffix embedded in pod names
const POD_SUFFIX_LEN: usize = 5;

/// Longest deployment name whose replica names still fit in [`MAX_NAME_LEN`]
pub const MAX_DEPLOYMENT_NAME_LEN: usize = MAX_NAME_LEN - TEMPLATE_HASH_LEN - POD_SUFFIX_LEN - 2;

/// A Deployment keeps a number of pod replicas running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// API version
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Kind is always "Deployment"
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Metadata about the deployment
    pub metadata: ObjectMeta,

    /// Desired state specification
    pub spec: DeploymentSpec,

    /// Current observed status (maintained by the deployment controller)
    #[serde(default)]
    pub status: DeploymentStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Deployment".to_string()
}

/// Specification of desired Deployment state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Number of desired replicas (default: 1)
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Template every replica is created from
    pub template: PodTemplate,
}

fn default_replicas() -> u32 {
    1
}

/// Pod template: the labels and spec stamped onto every replica
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: Labels,

    pub spec: PodSpec,
}

impl PodTemplate {
    /// Structural hash of the template.
    ///
    /// Computed over canonical JSON; labels are ordered, so equal templates
    /// always hash equally.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let hex = format!("{:x}", digest);
        hex[..TEMPLATE_HASH_LEN].to_string()
    }

    /// The template a pod was stamped from
    pub fn of_pod(pod: &Pod) -> Self {
        Self {
            labels: pod.metadata.labels.clone(),
            spec: pod.spec.clone(),
        }
    }
}

/// Observed state of a Deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    /// Live pods tracked for the deployment
    pub replicas: u32,

    /// Ready pods running the current template
    #[serde(rename = "updatedReplicas")]
    pub updated_replicas: u32,

    /// Ready pods
    #[serde(rename = "readyReplicas")]
    pub ready_replicas: u32,
}

impl Deployment {
    /// Create a new Deployment with one replica
    pub fn new(name: impl Into<String>, template: PodTemplate) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::new(name),
            spec: DeploymentSpec {
                replicas: default_replicas(),
                template,
            },
            status: DeploymentStatus::default(),
        }
    }

    /// Set the number of replicas
    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.spec.replicas = replicas;
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn template_hash(&self) -> String {
        self.spec.template.hash()
    }

    /// Whether a pod was created from the current template
    pub fn matches_template(&self, pod: &Pod) -> bool {
        PodTemplate::of_pod(pod).hash() == self.template_hash()
    }

    /// Stamp a new replica from the template.
    ///
    /// Names are `<deployment>-<template hash>-<random>`, so they never
    /// collide across deployments and still identify their template.
    pub fn new_replica(&self) -> Pod {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}-{}-{}",
            self.metadata.name,
            self.template_hash(),
            &suffix[..POD_SUFFIX_LEN]
        );

        let mut pod = Pod::new(name);
        pod.metadata.labels = self.spec.template.labels.clone();
        pod.spec = self.spec.template.spec.clone();
        pod
    }

    /// Whether all desired replicas are ready
    pub fn is_ready(&self) -> bool {
        self.status.ready_replicas >= self.spec.replicas
    }
}
