//! Durable store for crash recovery
//!
//! [`Store`] is a plain key/value contract. Two backends:
//! - [`MemoryStore`]: ordered in-memory map, for tests and throwaway clusters
//! - [`FileStore`]: the same map mirrored to a JSON file after every write
//!
//! [`ClusterStore`] layers one typed accessor per resource kind on top.
//!
//! Key layout:
//!
//! ```text
//! /nodes/<name>             Node
//! /pods/<name>              Pod
//! /deployments/<name>       Deployment
//! /autoscalers/<name>       Autoscaler
//! /services/<name>          Service
//! /deployment-pods/<name>   ordered pod names of a deployment
//! /service-pods/<name>      pod names backing a service
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::autoscaler::Autoscaler;
use super::deployment::Deployment;
use super::node::Node;
use super::pod::Pod;
use super::service::Service;

const NODES: &str = "/nodes/";
const PODS: &str = "/pods/";
const DEPLOYMENTS: &str = "/deployments/";
const AUTOSCALERS: &str = "/autoscalers/";
const SERVICES: &str = "/services/";
const DEPLOYMENT_PODS: &str = "/deployment-pods/";
const SERVICE_PODS: &str = "/service-pods/";

/// Errors from the durable store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error for key {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Value for key {0} is not UTF-8")]
    Encoding(String),
}

/// Key/value contract of the durable store
pub trait Store: Send + Sync {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Values of every key starting with `prefix`, in key order
    fn get(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

fn scan_prefix<V: Clone>(map: &BTreeMap<String, V>, prefix: &str) -> Vec<V> {
    map.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v.clone())
        .collect()
}

// ============================================================================
// Backends
// ============================================================================

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Store for MemoryStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(scan_prefix(&*self.entries.read(), prefix))
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
///
/// Values must be UTF-8. Every mutation rewrites the file through a temp
/// file and a rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let entries = if path.exists() {
            let content = fs::read_to_string(&path).map_err(io_err)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).map_err(|source| StoreError::Serialization {
                    key: path.display().to_string(),
                    source,
                })?
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened store {} with {} keys", path.display(), entries.len());
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entries).map_err(|source| {
            StoreError::Serialization {
                key: self.path.display().to_string(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, content).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl Store for FileStore {
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let value = String::from_utf8(value).map_err(|_| StoreError::Encoding(key.to_string()))?;
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn get(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(scan_prefix(&*self.entries.read(), prefix)
            .into_iter()
            .map(String::into_bytes)
            .collect())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .get(key)
            .map(|v| v.clone().into_bytes()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

// ============================================================================
// Typed access
// ============================================================================

/// Typed view of a [`Store`]
#[derive(Clone)]
pub struct ClusterStore {
    inner: Arc<dyn Store>,
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore").finish_non_exhaustive()
    }
}

impl ClusterStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }

    /// Store backed by a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn put_json<T: Serialize>(&self, key: String, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Serialization {
            key: key.clone(),
            source,
        })?;
        self.inner.put(&key, bytes)
    }

    fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        self.inner
            .get(prefix)?
            .iter()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|source| StoreError::Serialization {
                    key: prefix.to_string(),
                    source,
                })
            })
            .collect()
    }

    fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, StoreError> {
        match self.inner.get_raw(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Serialization { key, source }),
            None => Ok(None),
        }
    }

    // Nodes

    pub fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", NODES, node.metadata.name), node)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.list_json(NODES)
    }

    pub fn delete_node(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(&format!("{}{}", NODES, name))
    }

    // Pods

    pub fn put_pod(&self, pod: &Pod) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", PODS, pod.metadata.name), pod)
    }

    pub fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        self.list_json(PODS)
    }

    pub fn delete_pod(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(&format!("{}{}", PODS, name))
    }

    // Deployments

    pub fn put_deployment(&self, deployment: &Deployment) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", DEPLOYMENTS, deployment.metadata.name), deployment)
    }

    pub fn list_deployments(&self) -> Result<Vec<Deployment>, StoreError> {
        self.list_json(DEPLOYMENTS)
    }

    pub fn delete_deployment(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(&format!("{}{}", DEPLOYMENTS, name))?;
        self.inner.delete(&format!("{}{}", DEPLOYMENT_PODS, name))
    }

    pub fn put_deployment_pods(&self, name: &str, pods: &[String]) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", DEPLOYMENT_PODS, name), &pods)
    }

    pub fn deployment_pods(&self, name: &str) -> Result<Option<Vec<String>>, StoreError> {
        self.get_json(format!("{}{}", DEPLOYMENT_PODS, name))
    }

    // Autoscalers

    pub fn put_autoscaler(&self, autoscaler: &Autoscaler) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", AUTOSCALERS, autoscaler.metadata.name), autoscaler)
    }

    pub fn list_autoscalers(&self) -> Result<Vec<Autoscaler>, StoreError> {
        self.list_json(AUTOSCALERS)
    }

    pub fn delete_autoscaler(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(&format!("{}{}", AUTOSCALERS, name))
    }

    // Services

    pub fn put_service(&self, service: &Service) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", SERVICES, service.metadata.name), service)
    }

    pub fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        self.list_json(SERVICES)
    }

    pub fn delete_service(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(&format!("{}{}", SERVICES, name))?;
        self.inner.delete(&format!("{}{}", SERVICE_PODS, name))
    }

    pub fn put_service_pods(&self, name: &str, pods: &[String]) -> Result<(), StoreError> {
        self.put_json(format!("{}{}", SERVICE_PODS, name), &pods)
    }

    pub fn service_pods(&self, name: &str) -> Result<Option<Vec<String>>, StoreError> {
        self.get_json(format!("{}{}", SERVICE_PODS, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::deployment::PodTemplate;

    #[test]
    fn test_memory_store_prefix_scan() {
        let store = MemoryStore::new();
        store.put("/pods/a", b"1".to_vec()).unwrap();
        store.put("/pods/b", b"2".to_vec()).unwrap();
        store.put("/podsx/c", b"3".to_vec()).unwrap();
        store.put("/nodes/a", b"4".to_vec()).unwrap();

        let values = store.get("/pods/").unwrap();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(store.get_raw("/nodes/a").unwrap(), Some(b"4".to_vec()));

        store.delete("/pods/a").unwrap();
        assert_eq!(store.get("/pods/").unwrap().len(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.put("/pods/web-0", b"{}".to_vec()).unwrap();
            store.put("/pods/web-1", b"{}".to_vec()).unwrap();
            store.delete("/pods/web-0").unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("/pods/").unwrap().len(), 1);
        assert!(reopened.get_raw("/pods/web-0").unwrap().is_none());
        assert!(reopened.get_raw("/pods/web-1").unwrap().is_some());
    }

    #[test]
    fn test_file_store_rejects_non_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store.json")).unwrap();

        let result = store.put("/pods/bad", vec![0xff, 0xfe]);
        assert!(matches!(result, Err(StoreError::Encoding(_))));
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization { .. })
        ));
    }

    #[test]
    fn test_typed_roundtrip() {
        let store = ClusterStore::in_memory();
        let deployment = Deployment::new("web", PodTemplate::default()).with_replicas(2);

        store.put_deployment(&deployment).unwrap();
        store
            .put_deployment_pods("web", &["web-a".to_string(), "web-b".to_string()])
            .unwrap();

        assert_eq!(store.list_deployments().unwrap(), vec![deployment]);
        assert_eq!(
            store.deployment_pods("web").unwrap(),
            Some(vec!["web-a".to_string(), "web-b".to_string()])
        );

        store.delete_deployment("web").unwrap();
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.deployment_pods("web").unwrap().is_none());
    }

    #[test]
    fn test_kinds_do_not_overlap() {
        let store = ClusterStore::in_memory();
        store.put_pod(&Pod::new("web")).unwrap();
        store.put_node(&Node::new("web", "10.0.0.1")).unwrap();

        assert_eq!(store.list_pods().unwrap().len(), 1);
        assert_eq!(store.list_nodes().unwrap().len(), 1);
        assert!(store.list_services().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_value_is_an_error() {
        let inner = Arc::new(MemoryStore::new());
        inner.put("/pods/web-0", b"garbage".to_vec()).unwrap();
        let store = ClusterStore::new(inner);

        assert!(store.list_pods().is_err());
    }
}
