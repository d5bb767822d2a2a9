//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Project, environment and variable management
//! - Deployment creation, queries, promotion and rollback
//! - VM pool registration and listing
//! - Health and readiness checks
//! - Prometheus metrics

mod deployments;
mod projects;
mod vms;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::deployment::{DeploymentManager, PromotionGate, RollbackController};
use crate::dispatch::{DispatchQueue, DispatchStats};
use crate::error::{ControlError, ErrorKind, RejectReason};
use crate::pool::VmPool;
use crate::store::{DeploymentFilter, Store};
use crate::types::DeploymentStatus;

pub use deployments::{CreateDeploymentRequest, DeploymentResponse, ListDeploymentsQuery};
pub use projects::{CreateProjectRequest, SetVariableRequest};
pub use vms::RegisterVmRequest;

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Project, environment and variable management.
    pub catalog: Catalog,
    /// Deployment acceptance and queries.
    pub deployments: Arc<DeploymentManager>,
    /// Production promotion.
    pub promotion: Arc<PromotionGate>,
    /// Rollbacks.
    pub rollback: Arc<RollbackController>,
    /// VM pool.
    pub pool: Arc<VmPool>,
    /// Dispatch queue, for metrics.
    pub queue: Arc<DispatchQueue>,
    /// Dispatch counters, for metrics.
    pub stats: Arc<DispatchStats>,
    /// Store for direct queries.
    pub store: Arc<dyn Store>,
}

impl AppState {
    /// Build the request-side components over shared infrastructure.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DispatchQueue>,
        pool: Arc<VmPool>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            catalog: Catalog::new(Arc::clone(&store)),
            deployments: Arc::new(DeploymentManager::new(
                Arc::clone(&store),
                Arc::clone(&queue),
            )),
            promotion: Arc::new(PromotionGate::new(Arc::clone(&store), Arc::clone(&queue))),
            rollback: Arc::new(RollbackController::new(
                Arc::clone(&store),
                Arc::clone(&queue),
            )),
            pool,
            queue,
            stats,
            store,
        }
    }
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Projects
        .route(
            "/api/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/api/projects/{project_id}",
            get(projects::get_project).delete(projects::delete_project),
        )
        // Environments
        .route(
            "/api/projects/{project_id}/environments",
            get(projects::list_environments).post(projects::create_environment),
        )
        .route(
            "/api/projects/{project_id}/environments/{environment_id}",
            delete(projects::delete_environment),
        )
        .route(
            "/api/projects/{project_id}/environments/{environment_id}/live",
            get(deployments::get_live),
        )
        .route(
            "/api/projects/{project_id}/environments/{environment_id}/variables",
            get(projects::list_variables).post(projects::set_variable),
        )
        .route(
            "/api/projects/{project_id}/environments/{environment_id}/variables/{key}",
            delete(projects::delete_variable),
        )
        // Deployments
        .route(
            "/api/projects/{project_id}/deployments",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route(
            "/api/projects/{project_id}/deployments/{deployment_id}",
            get(deployments::get_project_deployment),
        )
        .route(
            "/api/projects/{project_id}/deployments/{deployment_id}/promote",
            post(deployments::promote_deployment),
        )
        .route(
            "/api/projects/{project_id}/deployments/{deployment_id}/approve",
            post(deployments::promote_deployment),
        )
        .route(
            "/api/projects/{project_id}/deployments/{deployment_id}/rollback",
            post(deployments::rollback_deployment),
        )
        .route("/api/deployments/{deployment_id}", get(deployments::get_deployment))
        // VM pool
        .route("/api/vms", get(vms::list_vms).post(vms::register_vm))
        .route("/api/vms/{vm_id}", delete(vms::unregister_vm))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
    /// Error class.
    pub kind: ErrorKind,
    /// Rejection reason, for refused promotions and rollbacks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// Error half of every handler's result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

const fn error_to_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::PreconditionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: ControlError) -> ApiError {
    let kind = error.kind();
    if kind == ErrorKind::Internal {
        tracing::error!(error = %error, "request failed");
    }
    (
        error_to_status(kind),
        Json(ErrorResponse {
            error: error.to_string(),
            kind,
            reason: error.reject_reason(),
        }),
    )
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let filter = DeploymentFilter::new()
        .with_status(DeploymentStatus::Queued)
        .with_status(DeploymentStatus::Running);

    match state.store.list(&filter).await {
        Ok(deployments) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                in_flight_deployments: deployments.len(),
                available_vms: state.pool.counts().await.available,
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                in_flight_deployments: 0,
                available_vms: 0,
            }),
        ),
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();

    output.push_str("# HELP hermes_deployments_total Number of deployments by status\n");
    output.push_str("# TYPE hermes_deployments_total gauge\n");
    for status in DeploymentStatus::ALL {
        let filter = DeploymentFilter::new().with_status(status);
        let count = state
            .store
            .list(&filter)
            .await
            .map(|d| d.len())
            .unwrap_or(0);
        let _ = writeln!(
            output,
            "hermes_deployments_total{{status=\"{status}\"}} {count}"
        );
    }

    let vms = state.pool.counts().await;
    output.push_str("# HELP hermes_vms Number of pooled VMs by status\n");
    output.push_str("# TYPE hermes_vms gauge\n");
    for (label, count) in [
        ("available", vms.available),
        ("busy", vms.busy),
        ("unreachable", vms.unreachable),
    ] {
        let _ = writeln!(output, "hermes_vms{{status=\"{label}\"}} {count}");
    }

    output.push_str("# HELP hermes_dispatch_jobs Jobs in the dispatch queue\n");
    output.push_str("# TYPE hermes_dispatch_jobs gauge\n");
    let pending = state.queue.pending_count().await;
    let _ = writeln!(output, "hermes_dispatch_jobs{{state=\"pending\"}} {pending}");
    let _ = writeln!(
        output,
        "hermes_dispatch_jobs{{state=\"in_flight\"}} {}",
        state.queue.in_flight_count()
    );

    let stats = state.stats.snapshot();
    output.push_str("# HELP hermes_dispatch_events_total Dispatch outcomes since start\n");
    output.push_str("# TYPE hermes_dispatch_events_total counter\n");
    for (label, count) in [
        ("started", stats.started),
        ("succeeded", stats.succeeded),
        ("failed", stats.failed),
        ("promoted", stats.promoted),
        ("promotion_failed", stats.promotions_failed),
        ("requeued", stats.requeued),
        ("retried", stats.retried),
    ] {
        let _ = writeln!(
            output,
            "hermes_dispatch_events_total{{event=\"{label}\"}} {count}"
        );
    }

    output
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    in_flight_deployments: usize,
    available_vms: usize,
}
