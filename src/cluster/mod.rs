//! # minik8s Cluster Management
//!
//! The control plane of a small container orchestrator. Workers join through
//! the registration handshake; the control plane then places pods on them,
//! keeps deployments at their replica count, scales deployments from pod
//! metrics, and tracks which Ready pods back each service.
//!
//! ## Core Resources
//!
//! - **Pod**: One or more containers placed together on a node
//! - **Deployment**: A pod template kept at a desired replica count
//! - **Autoscaler**: Bounds and metric targets that drive a deployment's count
//! - **Service**: A stable cluster IP in front of the pods matching a selector
//! - **Node**: A machine running the worker agent
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    minik8s Control Plane                      │
//! │  ┌────────────┐  ┌──────────────┐  ┌────────────────────┐   │
//! │  │ API Server │  │ Controllers  │──│ Event Bus          │   │
//! │  │ :8181      │  │ pod/deploy/  │  └────────────────────┘   │
//! │  └────────────┘  │ scale/svc    │  ┌────────────────────┐   │
//! │                  └──────────────┘──│ Cache + Store      │   │
//! │                                    └────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//!   ┌───────────┐        ┌───────────┐        ┌───────────┐
//!   │  Node 1   │        │  Node 2   │        │  Node 3   │
//!   │ (worker)  │        │ (worker)  │        │ (worker)  │
//!   │ :8080     │        │ :8080     │        │ :8080     │
//!   └───────────┘        └───────────┘        └───────────┘
//! ```

pub mod api;
pub mod autoscaler;
pub mod autoscaler_controller;
pub mod cache;
pub mod controller;
pub mod deployment;
pub mod deployment_controller;
pub mod events;
pub mod metrics;
pub mod node;
pub mod pod;
pub mod pod_controller;
pub mod recovery;
pub mod registration;
pub mod registry;
pub mod remote;
pub mod resources;
pub mod scheduler;
pub mod service;
pub mod service_controller;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{create_control_plane_router, ControlPlaneState};
pub use autoscaler::{evaluate_scaling, Autoscaler, MetricSample, MetricTarget, ScalingDecision};
pub use cache::{PodLegacy, ResourceCache};
pub use controller::{ClusterController, ClusterStats, ControllerConfig, ControllerError};
pub use deployment::{Deployment, DeploymentStatus, PodTemplate};
pub use events::{EventBus, EventHandler, EventKind, PodEvent};
pub use node::{Node, NodeCondition, NodePhase, NodeStatus};
pub use pod::{Container, Pod, PodPhase, PodSpec};
pub use pod_controller::{PodController, PodManager};
pub use recovery::{recover, RecoveryError, RecoveryReport};
pub use registry::NodeRegistry;
pub use remote::{HttpConnector, HttpWorkerClient, WorkerConnector, WorkerControl};
pub use resources::*;
pub use scheduler::Scheduler;
pub use service::Service;
pub use store::{ClusterStore, FileStore, MemoryStore, Store};

/// Default control plane API port
pub const CONTROL_PLANE_PORT: u16 = 8181;

/// Default worker node API port
pub const WORKER_PORT: u16 = 8080;

/// Default deployment reconciliation period in seconds
pub const RECONCILE_INTERVAL_SECS: u64 = 3;

/// Default timeout of a call to a worker in milliseconds
pub const REMOTE_CALL_TIMEOUT_MS: u64 = 1000;
