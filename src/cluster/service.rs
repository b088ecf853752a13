//! Service resource - a stable virtual address in front of a set of pods
//!
//! The control plane only tracks which Ready pods back a service and tells
//! every worker about it. Programming the packet filter is the worker's job.

use serde::{Deserialize, Serialize};

use super::pod::Pod;
use super::resources::{LabelSelector, ObjectMeta, API_VERSION};

/// A Service in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "apiVersion")]
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ObjectMeta,

    pub spec: ServiceSpec,

    #[serde(default)]
    pub status: ServiceStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Service".to_string()
}

/// Service specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Pods backing the service
    pub selector: LabelSelector,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Virtual IP, allocated by the control plane when absent
    #[serde(rename = "clusterIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,

    #[serde(rename = "targetPort")]
    pub target_port: u16,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Observed service state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// A Ready pod backing a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "podName")]
    pub pod_name: String,

    #[serde(rename = "podIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    #[serde(rename = "hostIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

impl From<&Pod> for Endpoint {
    fn from(pod: &Pod) -> Self {
        Self {
            pod_name: pod.metadata.name.clone(),
            pod_ip: pod.status.pod_ip.clone(),
            host_ip: pod.status.host_ip.clone(),
        }
    }
}

impl Service {
    pub fn new(name: impl Into<String>, selector: LabelSelector) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta::new(name),
            spec: ServiceSpec {
                selector,
                ports: vec![],
                cluster_ip: None,
            },
            status: ServiceStatus::default(),
        }
    }

    /// Expose a port
    pub fn with_port(mut self, port: u16, target_port: u16) -> Self {
        self.spec.ports.push(ServicePort {
            port,
            target_port,
            protocol: default_protocol(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Whether a pod's labels fall under this service
    pub fn selects(&self, pod: &Pod) -> bool {
        self.spec.selector.matches(&pod.metadata.labels)
    }

    /// Names of the pods currently backing the service
    pub fn endpoint_names(&self) -> Vec<String> {
        self.status
            .endpoints
            .iter()
            .map(|e| e.pod_name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_selects_pods() {
        let service = Service::new("web", LabelSelector::matching("app", "web")).with_port(80, 8080);

        let web = Pod::new("web-0").with_label("app", "web");
        let db = Pod::new("db-0").with_label("app", "db");

        assert!(service.selects(&web));
        assert!(!service.selects(&db));
        assert_eq!(service.spec.ports[0].target_port, 8080);
    }

    #[test]
    fn test_endpoint_from_pod() {
        let mut pod = Pod::new("web-0");
        pod.status.pod_ip = Some("172.17.0.4".to_string());
        pod.status.host_ip = Some("10.0.0.1".to_string());

        let endpoint = Endpoint::from(&pod);
        assert_eq!(endpoint.pod_name, "web-0");
        assert_eq!(endpoint.pod_ip.as_deref(), Some("172.17.0.4"));
    }

    #[test]
    fn test_deserialize_service() {
        let json = r#"{
            "metadata": {"name": "web"},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "ports": [{"port": 80, "targetPort": 8080}]
            }
        }"#;

        let service: Service = serde_json::from_str(json).unwrap();
        assert_eq!(service.spec.ports[0].protocol, "TCP");
        assert!(service.spec.cluster_ip.is_none());
        assert!(service.endpoint_names().is_empty());
    }
}
