//! Deployment endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{api_error, ApiError, AppState};
use crate::deployment::DeploymentRequest;
use crate::error::ControlError;
use crate::store::DeploymentFilter;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, EnvironmentId, ProjectId};

/// Maximum page size for deployment listings.
const MAX_LIMIT: u32 = 500;

/// Request to create a new deployment.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Branch to deploy.
    pub branch: String,
    /// Commit to deploy.
    #[serde(alias = "commit")]
    pub commit_hash: String,
}

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by branch.
    pub branch: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Response for a deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    /// Deployment ID.
    pub id: String,
    /// Project ID.
    pub project_id: String,
    /// Environment ID.
    pub environment_id: String,
    /// Branch.
    pub branch: String,
    /// Commit hash.
    pub commit_hash: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// Public URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// VM executing the deployment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    /// Deployment this one rolls back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution output. Only included for single deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last change timestamp.
    pub updated_at: String,
    /// Completion timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Response for accepted asynchronous operations.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    /// Deployment the operation acts on.
    pub id: String,
    /// Its status at acceptance.
    pub status: DeploymentStatus,
    /// Deployment being rolled back, for rollbacks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
}

/// Create a new deployment.
pub async fn create_deployment(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    info!(
        project_id = %project_id,
        branch = %request.branch,
        "creating deployment via API"
    );

    let record = state
        .deployments
        .create(DeploymentRequest {
            project_id: ProjectId::new(project_id),
            branch: request.branch,
            commit_hash: request.commit_hash,
        })
        .await
        .map_err(api_error)?;

    Ok((StatusCode::ACCEPTED, Json(accepted(&record))))
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(deployment_id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let record = state
        .deployments
        .get(&DeploymentId::new(deployment_id))
        .await
        .map_err(api_error)?;
    Ok(Json(record_to_response(record, true)))
}

/// Get a deployment of a project.
pub async fn get_project_deployment(
    State(state): State<AppState>,
    Path((project_id, deployment_id)): Path<(String, String)>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let record = state
        .deployments
        .get_in_project(&ProjectId::new(project_id), &DeploymentId::new(deployment_id))
        .await
        .map_err(api_error)?;
    Ok(Json(record_to_response(record, true)))
}

/// List a project's deployments, newest first.
pub async fn list_deployments(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentResponse>>, ApiError> {
    let mut filter = DeploymentFilter::new();

    if let Some(branch) = query.branch {
        filter = filter.with_branch(branch);
    }
    if let Some(status) = query.status {
        let parsed: DeploymentStatus = status
            .to_lowercase()
            .parse()
            .map_err(|e: String| api_error(ControlError::invalid(e)))?;
        filter = filter.with_status(parsed);
    }
    filter = filter.with_limit(query.limit.unwrap_or(50).min(MAX_LIMIT));
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    let records = state
        .deployments
        .list(&ProjectId::new(project_id), filter)
        .await
        .map_err(api_error)?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| record_to_response(r, false))
            .collect(),
    ))
}

/// Request promotion of a production deployment.
pub async fn promote_deployment(
    State(state): State<AppState>,
    Path((project_id, deployment_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let record = state
        .promotion
        .promote(&ProjectId::new(project_id), &DeploymentId::new(deployment_id))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(accepted(&record))))
}

/// Roll back a deployment to the previous good one.
pub async fn rollback_deployment(
    State(state): State<AppState>,
    Path((project_id, deployment_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let record = state
        .rollback
        .rollback(&ProjectId::new(project_id), &DeploymentId::new(deployment_id))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(accepted(&record))))
}

/// Get the deployment serving an environment.
pub async fn get_live(
    State(state): State<AppState>,
    Path((project_id, environment_id)): Path<(String, String)>,
) -> Result<Json<Option<DeploymentResponse>>, ApiError> {
    let environment = state
        .catalog
        .get_environment(
            &ProjectId::new(project_id),
            &EnvironmentId::new(environment_id),
        )
        .await
        .map_err(api_error)?;
    let live = state
        .deployments
        .live(&environment.id)
        .await
        .map_err(api_error)?;
    Ok(Json(live.map(|r| record_to_response(r, false))))
}

fn accepted(record: &DeploymentRecord) -> AcceptedResponse {
    AcceptedResponse {
        id: record.data.id.to_string(),
        status: record.status,
        rollback_of: record.data.rollback_of.as_ref().map(ToString::to_string),
    }
}

fn record_to_response(record: DeploymentRecord, with_logs: bool) -> DeploymentResponse {
    let data = record.data;
    DeploymentResponse {
        id: data.id.to_string(),
        project_id: data.project_id.to_string(),
        environment_id: data.environment_id.to_string(),
        branch: data.branch,
        commit_hash: data.commit_hash,
        status: record.status,
        url: data.url,
        vm_id: data.vm_id.map(|v| v.to_string()),
        rollback_of: data.rollback_of.map(|d| d.to_string()),
        error: data.error,
        logs: with_logs.then_some(data.logs),
        created_at: data.created_at.to_rfc3339(),
        updated_at: data.updated_at.to_rfc3339(),
        completed_at: data.completed_at.map(|t| t.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::api::router;
    use crate::api::tests::{body_json, make_app_state};
    use crate::error::RejectReason;
    use crate::types::EnvironmentSpec;

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn seeded() -> (axum::Router, ProjectId) {
        let (state, _) = make_app_state().await;
        let project = state
            .catalog
            .create_project("site", "https://git.example.com/site.git")
            .await
            .unwrap();
        for (name, branch, prod) in [("production", "main", true), ("staging", "develop", false)] {
            state
                .catalog
                .create_environment(
                    &project.id,
                    EnvironmentSpec {
                        name: name.to_owned(),
                        branch: branch.to_owned(),
                        is_production: prod,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        (router(state), project.id)
    }

    #[tokio::test]
    async fn create_returns_accepted_and_queued() {
        let (app, project_id) = seeded().await;

        let response = app
            .clone()
            .oneshot(post(
                &format!("/api/projects/{project_id}/deployments"),
                serde_json::json!({"branch": "develop", "commit": "abc1234"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "queued");
        let id = body["id"].as_str().unwrap().to_owned();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/deployments/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["commit_hash"], "abc1234");
        assert_eq!(body["logs"], "");

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/projects/{project_id}/deployments?status=queued"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let list = body_json(response).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert!(list[0].get("logs").is_none());
    }

    #[tokio::test]
    async fn unbound_branch_is_404() {
        let (app, project_id) = seeded().await;

        let response = app
            .oneshot(post(
                &format!("/api/projects/{project_id}/deployments"),
                serde_json::json!({"branch": "feature/x", "commit_hash": "abc1234"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn busy_environment_is_409() {
        let (app, project_id) = seeded().await;
        let uri = format!("/api/projects/{project_id}/deployments");

        let first = app
            .clone()
            .oneshot(post(&uri, serde_json::json!({"branch": "main", "commit_hash": "abc1234"})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(post(&uri, serde_json::json!({"branch": "main", "commit_hash": "def5678"})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn promote_queued_deployment_is_rejected() {
        let (app, project_id) = seeded().await;

        let response = app
            .clone()
            .oneshot(post(
                &format!("/api/projects/{project_id}/deployments"),
                serde_json::json!({"branch": "main", "commit_hash": "abc1234"}),
            ))
            .await
            .unwrap();
        let id = body_json(response).await["id"].as_str().unwrap().to_owned();

        let response = app
            .clone()
            .oneshot(post(
                &format!("/api/projects/{project_id}/deployments/{id}/promote"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["reason"], RejectReason::NotEligible.as_str());

        let response = app
            .oneshot(post(
                &format!("/api/projects/{project_id}/deployments/{id}/rollback"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn bad_status_filter_is_400() {
        let (app, project_id) = seeded().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/projects/{project_id}/deployments?status=exploded"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
