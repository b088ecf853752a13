//! Remote control of worker agents
//!
//! The control plane drives each worker through the [`WorkerControl`] trait.
//! [`HttpWorkerClient`] speaks JSON over HTTP to the agent:
//!
//! | Operation          | Route                           |
//! |--------------------|---------------------------------|
//! | notify_registered  | `POST /v1/registered`           |
//! | create_pod         | `POST /v1/pods`                 |
//! | delete_pod         | `DELETE /v1/pods/{name}`        |
//! | get_pod_log        | `GET /v1/pods/{name}/logs`      |
//! | pod_metrics        | `GET /v1/pods/{name}/metrics`   |
//! | create_service     | `POST /v1/services`             |
//! | delete_service     | `DELETE /v1/services/{name}`    |
//!
//! Every call carries the client's timeout and is never retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use super::node::Node;
use super::pod::Pod;
use super::service::Service;

/// Errors talking to a worker agent
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Worker error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Worker rejected request: {0}")]
    Rejected(String),
}

/// Acknowledgment returned by a worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerAck {
    pub success: bool,

    #[serde(default)]
    pub message: String,

    /// IP assigned by the worker to a newly created pod
    #[serde(rename = "podIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

impl WorkerAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Turn a negative acknowledgment into an error
    pub fn into_result(self) -> Result<Self, RemoteError> {
        if self.success {
            Ok(self)
        } else {
            Err(RemoteError::Rejected(self.message))
        }
    }
}

/// Body of the registration announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredNotice {
    /// Where the worker should reach the control plane
    #[serde(rename = "controlPlane")]
    pub control_plane: String,
}

/// Resource usage of one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetrics {
    #[serde(rename = "cpuUsage")]
    pub cpu_usage: f64,

    /// Bytes
    #[serde(rename = "memoryUsage")]
    pub memory_usage: u64,

    #[serde(rename = "collectedAt")]
    #[serde(default = "Utc::now")]
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodLog {
    pub log: String,
}

/// Operations the control plane can ask a worker to perform
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Tell the worker where the control plane lives
    async fn notify_registered(&self, control_plane: &str) -> Result<WorkerAck, RemoteError>;

    /// Start a pod
    async fn create_pod(&self, pod: &Pod) -> Result<WorkerAck, RemoteError>;

    /// Stop a pod
    async fn delete_pod(&self, name: &str) -> Result<(), RemoteError>;

    async fn create_service(&self, service: &Service) -> Result<(), RemoteError>;

    async fn delete_service(&self, name: &str) -> Result<(), RemoteError>;

    async fn get_pod_log(&self, name: &str) -> Result<String, RemoteError>;

    async fn pod_metrics(&self, name: &str) -> Result<PodMetrics, RemoteError>;
}

/// Builds worker handles from node records
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn WorkerControl>, RemoteError>;
}

/// JSON/HTTP client for one worker agent
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    base_url: String,
    http_client: Client,
}

impl HttpWorkerClient {
    /// Create a client for the agent at `base_url` (e.g. "http://10.0.0.5:8080")
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, RemoteError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status { status, message });
        }
        Ok(response)
    }

    async fn ack(response: Response) -> Result<WorkerAck, RemoteError> {
        let response = Self::check(response).await?;
        Ok(response.json::<WorkerAck>().await?)
    }
}

#[async_trait]
impl WorkerControl for HttpWorkerClient {
    async fn notify_registered(&self, control_plane: &str) -> Result<WorkerAck, RemoteError> {
        let notice = RegisteredNotice {
            control_plane: control_plane.to_string(),
        };
        let response = self
            .http_client
            .post(self.url("/v1/registered"))
            .json(&notice)
            .send()
            .await?;
        Self::ack(response).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<WorkerAck, RemoteError> {
        let response = self
            .http_client
            .post(self.url("/v1/pods"))
            .json(pod)
            .send()
            .await?;
        Self::ack(response).await?.into_result()
    }

    async fn delete_pod(&self, name: &str) -> Result<(), RemoteError> {
        let response = self
            .http_client
            .delete(self.url(&format!("/v1/pods/{}", name)))
            .send()
            .await?;
        Self::ack(response).await?.into_result().map(|_| ())
    }

    async fn create_service(&self, service: &Service) -> Result<(), RemoteError> {
        let response = self
            .http_client
            .post(self.url("/v1/services"))
            .json(service)
            .send()
            .await?;
        Self::ack(response).await?.into_result().map(|_| ())
    }

    async fn delete_service(&self, name: &str) -> Result<(), RemoteError> {
        let response = self
            .http_client
            .delete(self.url(&format!("/v1/services/{}", name)))
            .send()
            .await?;
        Self::ack(response).await?.into_result().map(|_| ())
    }

    async fn get_pod_log(&self, name: &str) -> Result<String, RemoteError> {
        let response = self
            .http_client
            .get(self.url(&format!("/v1/pods/{}/logs", name)))
            .send()
            .await?;
        let log: PodLog = Self::check(response).await?.json().await?;
        Ok(log.log)
    }

    async fn pod_metrics(&self, name: &str) -> Result<PodMetrics, RemoteError> {
        let response = self
            .http_client
            .get(self.url(&format!("/v1/pods/{}/metrics", name)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

/// Connects to workers over HTTP
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl WorkerConnector for HttpConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn WorkerControl>, RemoteError> {
        let client = HttpWorkerClient::new(node.base_url(), self.timeout)?;
        Ok(Arc::new(client))
    }
}
