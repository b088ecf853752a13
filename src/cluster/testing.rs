//! In-process fakes shared by the unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::metrics::{MetricsError, MetricsProvider};
use super::node::Node;
use super::pod::Pod;
use super::remote::{PodMetrics, RemoteError, WorkerAck, WorkerConnector, WorkerControl};
use super::service::Service;
use super::store::{MemoryStore, Store, StoreError};

/// Give spawned event publications a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Worker agent that records calls instead of running containers
#[derive(Debug, Default)]
pub struct FakeWorker {
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
    fail_registration: AtomicBool,
    reject_registration: AtomicBool,
    pod_ip: Mutex<Option<String>>,
    registered_with: Mutex<Option<String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    services: Mutex<Vec<Service>>,
    deleted_services: Mutex<Vec<String>>,
    metrics: Mutex<HashMap<String, (f64, u64)>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Make the registration call itself fail
    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Answer registration with a negative acknowledgment
    pub fn set_reject_registration(&self, reject: bool) {
        self.reject_registration.store(reject, Ordering::SeqCst);
    }

    pub fn assign_pod_ip(&self, ip: &str) {
        *self.pod_ip.lock() = Some(ip.to_string());
    }

    pub fn set_metrics(&self, pod: &str, cpu: f64, memory: u64) {
        self.metrics.lock().insert(pod.to_string(), (cpu, memory));
    }

    pub fn registered_with(&self) -> Option<String> {
        self.registered_with.lock().clone()
    }

    pub fn created_pods(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Last pushed version of every service
    pub fn services(&self) -> Vec<Service> {
        self.services.lock().clone()
    }

    pub fn deleted_services(&self) -> Vec<String> {
        self.deleted_services.lock().clone()
    }
}

#[async_trait]
impl WorkerControl for FakeWorker {
    async fn notify_registered(&self, control_plane: &str) -> Result<WorkerAck, RemoteError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 503,
                message: "agent unavailable".to_string(),
            });
        }
        if self.reject_registration.load(Ordering::SeqCst) {
            return Ok(WorkerAck {
                success: false,
                message: "already joined another cluster".to_string(),
                pod_ip: None,
            });
        }
        *self.registered_with.lock() = Some(control_plane.to_string());
        Ok(WorkerAck::ok())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<WorkerAck, RemoteError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("image pull failed".to_string()));
        }
        self.created.lock().push(pod.metadata.name.clone());
        Ok(WorkerAck {
            pod_ip: self.pod_ip.lock().clone(),
            ..WorkerAck::ok()
        })
    }

    async fn delete_pod(&self, name: &str) -> Result<(), RemoteError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("container stuck".to_string()));
        }
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<(), RemoteError> {
        let mut services = self.services.lock();
        services.retain(|s| s.metadata.name != service.metadata.name);
        services.push(service.clone());
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), RemoteError> {
        self.services.lock().retain(|s| s.metadata.name != name);
        self.deleted_services.lock().push(name.to_string());
        Ok(())
    }

    async fn get_pod_log(&self, name: &str) -> Result<String, RemoteError> {
        Ok(format!("log of {}", name))
    }

    async fn pod_metrics(&self, name: &str) -> Result<PodMetrics, RemoteError> {
        let (cpu_usage, memory_usage) = self
            .metrics
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| RemoteError::Rejected(format!("no metrics for {}", name)))?;
        Ok(PodMetrics {
            cpu_usage,
            memory_usage,
            collected_at: Utc::now(),
        })
    }
}

/// Hands out one [`FakeWorker`] per node name
#[derive(Debug, Default)]
pub struct FakeConnector {
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The worker that will back (or backs) `node`
    pub fn worker(&self, node: &str) -> Arc<FakeWorker> {
        Arc::clone(
            self.workers
                .lock()
                .entry(node.to_string())
                .or_insert_with(|| Arc::new(FakeWorker::new())),
        )
    }

    /// Refuse to build a handle for `node`
    pub fn set_unreachable(&self, node: &str) {
        self.unreachable.lock().insert(node.to_string());
    }
}

impl WorkerConnector for FakeConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn WorkerControl>, RemoteError> {
        if self.unreachable.lock().contains(&node.metadata.name) {
            return Err(RemoteError::Rejected(format!(
                "cannot reach {}",
                node.metadata.name
            )));
        }
        Ok(self.worker(&node.metadata.name))
    }
}

/// Metrics provider fed directly by the test
#[derive(Debug, Default)]
pub struct FakeMetrics {
    usage: Mutex<HashMap<String, (f64, u64)>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pod: &str, cpu: f64, memory: u64) {
        self.usage.lock().insert(pod.to_string(), (cpu, memory));
    }

    pub fn fail(&self, pod: &str) {
        self.failing.lock().insert(pod.to_string());
    }

    fn lookup(&self, pod: &Pod) -> Result<(f64, u64), MetricsError> {
        let name = &pod.metadata.name;
        if self.failing.lock().contains(name) {
            return Err(MetricsError::Remote(RemoteError::Rejected(format!(
                "metrics for {} unavailable",
                name
            ))));
        }
        Ok(self.usage.lock().get(name).copied().unwrap_or((0.0, 0)))
    }
}

#[async_trait]
impl MetricsProvider for FakeMetrics {
    async fn pod_cpu_usage(&self, pod: &Pod) -> Result<f64, MetricsError> {
        self.lookup(pod).map(|(cpu, _)| cpu)
    }

    async fn pod_memory_usage(&self, pod: &Pod) -> Result<u64, MetricsError> {
        self.lookup(pod).map(|(_, memory)| memory)
    }
}

/// Memory store whose writes under one key prefix can be made to fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_prefix: Mutex<Option<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every put under `prefix`; `None` heals the store
    pub fn fail_puts_under(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock() = prefix.map(str::to_string);
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        match self.failing_prefix.lock().as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(StoreError::Io {
                path: key.into(),
                source: std::io::Error::other("disk full"),
            }),
            _ => Ok(()),
        }
    }
}

impl Store for FlakyStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.put(key, value)
    }

    fn get(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.get(prefix)
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get_raw(key)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }
}
