//! Control Plane API Server
//!
//! Provides REST endpoints for managing the minik8s cluster:
//! - Deployments: apply, list, describe, delete
//! - Autoscalers: create, list
//! - Nodes: register, list, unregister
//! - Pods: create, list, delete, phase reports, logs
//! - Services: apply, list, delete
//! - Status: cluster health

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::{
    autoscaler::Autoscaler,
    autoscaler_controller::AutoscalerError,
    controller::{ClusterController, ClusterStats},
    deployment::Deployment,
    deployment_controller::DeploymentError,
    node::Node,
    pod::{Pod, PodPhase},
    pod_controller::{PodController, PodError},
    registration::RegistrationError,
    registry::RegistryError,
    remote::PodLog,
    resources::{OperationStatus, ResourceList},
    service::Service,
    service_controller::ServiceError,
};

/// Shared state for the control plane API
#[derive(Clone)]
pub struct ControlPlaneState {
    pub controller: Arc<ClusterController>,
}

impl ControlPlaneState {
    pub fn with_controller(controller: ClusterController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }
}

/// Create the control plane router
pub fn create_control_plane_router(state: ControlPlaneState) -> Router {
    Router::new()
        // Cluster status
        .route("/v1/status", get(cluster_status))
        // Deployments
        .route(
            "/v1/deployments",
            get(list_deployments).post(apply_deployment),
        )
        .route(
            "/v1/deployments/{name}",
            get(describe_deployment).delete(delete_deployment),
        )
        // Autoscalers
        .route(
            "/v1/autoscalers",
            get(list_autoscalers).post(create_autoscaler),
        )
        // Nodes
        .route("/v1/nodes", get(list_nodes).post(register_node))
        .route("/v1/nodes/{name}", delete(unregister_node))
        // Pods
        .route("/v1/pods", get(list_pods).post(create_pod))
        .route("/v1/pods/{name}", delete(delete_pod))
        .route("/v1/pods/{name}/status", post(report_pod_status))
        .route("/v1/pods/{name}/logs", get(pod_logs))
        // Services
        .route("/v1/services", get(list_services).post(apply_service))
        .route("/v1/services/{name}", delete(delete_service))
        // Health check
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error mapping
// ============================================================================

/// HTTP status for a request-scoped error
trait ApiError: std::fmt::Display {
    fn status_code(&self) -> StatusCode;

    fn into_failure(self) -> Response
    where
        Self: Sized,
    {
        (
            self.status_code(),
            Json(OperationStatus::failure(self.to_string())),
        )
            .into_response()
    }
}

impl ApiError for DeploymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            DeploymentError::InvalidName(_) => StatusCode::BAD_REQUEST,
            DeploymentError::NotFound(_) => StatusCode::NOT_FOUND,
            DeploymentError::UpdateNotSupported(_) => StatusCode::CONFLICT,
            DeploymentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError for AutoscalerError {
    fn status_code(&self) -> StatusCode {
        match self {
            AutoscalerError::AlreadyExists(_) | AutoscalerError::DeploymentAlreadyScaled { .. } => {
                StatusCode::CONFLICT
            }
            AutoscalerError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
            AutoscalerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl ApiError for RegistrationError {
    fn status_code(&self) -> StatusCode {
        match self {
            RegistrationError::InvalidName(_) => StatusCode::BAD_REQUEST,
            RegistrationError::Registry(RegistryError::NodeExists(_)) => StatusCode::CONFLICT,
            RegistrationError::Registry(RegistryError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
            RegistrationError::Connect { .. }
            | RegistrationError::Handshake { .. }
            | RegistrationError::Rejected { .. } => StatusCode::BAD_GATEWAY,
            RegistrationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError for PodError {
    fn status_code(&self) -> StatusCode {
        match self {
            PodError::InvalidName(_) | PodError::Scheduling(_) => StatusCode::BAD_REQUEST,
            PodError::AlreadyExists(_) => StatusCode::CONFLICT,
            PodError::NotFound(_) => StatusCode::NOT_FOUND,
            PodError::NoWorker { .. } | PodError::Remote { .. } => StatusCode::BAD_GATEWAY,
            PodError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ClusterIpTaken { .. } => StatusCode::CONFLICT,
            ServiceError::ClusterIpExhausted | ServiceError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::InvalidName(_) | ServiceError::EmptySelector(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

/// Envelope for endpoints that return the stored resource
#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyResponse<T> {
    pub success: bool,
    pub resource: T,
}

fn applied<T: Serialize>(status: StatusCode, resource: T) -> Response {
    (
        status,
        Json(ApplyResponse {
            success: true,
            resource,
        }),
    )
        .into_response()
}

// ============================================================================
// Health & Status
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn cluster_status(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let stats = state.controller.cluster_stats();
    Json(ClusterStatusResponse {
        status: "ok".to_string(),
        stats,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterStatusResponse {
    pub status: String,
    pub stats: ClusterStats,
}

// ============================================================================
// Deployment Endpoints
// ============================================================================

async fn apply_deployment(
    State(state): State<ControlPlaneState>,
    Json(deployment): Json<Deployment>,
) -> Response {
    match state.controller.deployments().apply_deployment(deployment).await {
        Ok(applied_deployment) => applied(StatusCode::CREATED, applied_deployment),
        Err(e) => e.into_failure(),
    }
}

async fn list_deployments(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let deployments = state.controller.cache().list_deployments();
    Json(ResourceList::new("DeploymentList", deployments))
}

async fn describe_deployment(
    State(state): State<ControlPlaneState>,
    Path(name): Path<String>,
) -> Response {
    let description = state
        .controller
        .deployments()
        .describe_deployments(false, std::slice::from_ref(&name));
    match description.deployments.into_iter().next() {
        Some(detail) => (StatusCode::OK, Json(detail)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(OperationStatus::failure(format!("Deployment not found: {}", name))),
        )
            .into_response(),
    }
}

async fn delete_deployment(
    State(state): State<ControlPlaneState>,
    Path(name): Path<String>,
) -> Response {
    match state.controller.deployments().delete_deployment_by_name(&name).await {
        Ok(_) => (
            StatusCode::OK,
            Json(OperationStatus::success("Deployment deleted")),
        )
            .into_response(),
        Err(e) => e.into_failure(),
    }
}

// ============================================================================
// Autoscaler Endpoints
// ============================================================================

async fn create_autoscaler(
    State(state): State<ControlPlaneState>,
    Json(autoscaler): Json<Autoscaler>,
) -> Response {
    match state.controller.autoscalers().create_autoscaler(autoscaler).await {
        Ok(created) => applied(StatusCode::CREATED, created),
        Err(e) => e.into_failure(),
    }
}

async fn list_autoscalers(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let autoscalers = state.controller.cache().list_autoscalers();
    Json(ResourceList::new("AutoscalerList", autoscalers))
}

// ============================================================================
// Node Endpoints
// ============================================================================

async fn list_nodes(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let nodes = state.controller.registration().list_nodes();
    Json(ResourceList::new("NodeList", nodes))
}

async fn register_node(
    State(state): State<ControlPlaneState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(node): Json<Node>,
) -> Response {
    match state.controller.registration().register_node(peer, node).await {
        Ok(registered) => applied(StatusCode::CREATED, registered),
        Err(e) => e.into_failure(),
    }
}

async fn unregister_node(
    State(state): State<ControlPlaneState>,
    Path(name): Path<String>,
) -> Response {
    match state.controller.registration().unregister_node(&name) {
        Ok(_) => (
            StatusCode::OK,
            Json(OperationStatus::success("Node unregistered")),
        )
            .into_response(),
        Err(e) => e.into_failure(),
    }
}

// ============================================================================
// Pod Endpoints
// ============================================================================

async fn create_pod(State(state): State<ControlPlaneState>, Json(pod): Json<Pod>) -> Response {
    match state.controller.pods().apply_pod(pod).await {
        Ok(created) => applied(StatusCode::CREATED, created),
        Err(e) => e.into_failure(),
    }
}

async fn list_pods(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let pods = state.controller.pods().describe_pods(&[]).pods;
    Json(ResourceList::new("PodList", pods))
}

async fn delete_pod(State(state): State<ControlPlaneState>, Path(name): Path<String>) -> Response {
    match state.controller.pods().delete_pod_by_name(&name).await {
        Ok(()) => (StatusCode::OK, Json(OperationStatus::success("Pod deleted"))).into_response(),
        Err(e) => e.into_failure(),
    }
}

/// Phase report sent by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodStatusReport {
    pub phase: PodPhase,

    #[serde(rename = "podIP")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

async fn report_pod_status(
    State(state): State<ControlPlaneState>,
    Path(name): Path<String>,
    Json(report): Json<PodStatusReport>,
) -> Response {
    match state
        .controller
        .pods()
        .report_phase(&name, report.phase, report.pod_ip)
        .await
    {
        Ok(pod) => applied(StatusCode::OK, pod),
        Err(e) => e.into_failure(),
    }
}

async fn pod_logs(State(state): State<ControlPlaneState>, Path(name): Path<String>) -> Response {
    match state.controller.pods().get_pod_log(&name).await {
        Ok(log) => (StatusCode::OK, Json(PodLog { log })).into_response(),
        Err(e) => e.into_failure(),
    }
}

// ============================================================================
// Service Endpoints
// ============================================================================

async fn apply_service(
    State(state): State<ControlPlaneState>,
    Json(service): Json<Service>,
) -> Response {
    match state.controller.services().apply_service(service).await {
        Ok(applied_service) => applied(StatusCode::CREATED, applied_service),
        Err(e) => e.into_failure(),
    }
}

async fn list_services(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    let services = state.controller.services().list_services();
    Json(ResourceList::new("ServiceList", services))
}

async fn delete_service(
    State(state): State<ControlPlaneState>,
    Path(name): Path<String>,
) -> Response {
    match state.controller.services().delete_service(&name).await {
        Ok(_) => (
            StatusCode::OK,
            Json(OperationStatus::success("Service deleted")),
        )
            .into_response(),
        Err(e) => e.into_failure(),
    }
}
