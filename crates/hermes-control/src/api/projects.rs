//! Project, environment and variable endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{api_error, ApiError, AppState};
use crate::types::{EnvVariable, Environment, EnvironmentId, EnvironmentSpec, Project, ProjectId};

/// Request to register a project.
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    /// Display name.
    pub name: String,
    /// Repository to deploy from.
    pub repo_url: String,
}

/// Request to set an environment variable.
#[derive(Debug, Deserialize)]
pub struct SetVariableRequest {
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

/// Register a project.
pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state
        .catalog
        .create_project(&request.name, &request.repo_url)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// List all projects.
pub async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    state
        .catalog
        .list_projects()
        .await
        .map(Json)
        .map_err(api_error)
}

/// Get a project.
pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state
        .catalog
        .get_project(&ProjectId::new(project_id))
        .await
        .map(Json)
        .map_err(api_error)
}

/// Delete a project with everything it owns.
pub async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .catalog
        .delete_project(&ProjectId::new(project_id))
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Define an environment.
pub async fn create_environment(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(spec): Json<EnvironmentSpec>,
) -> Result<(StatusCode, Json<Environment>), ApiError> {
    let environment = state
        .catalog
        .create_environment(&ProjectId::new(project_id), spec)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(environment)))
}

/// List a project's environments.
pub async fn list_environments(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Environment>>, ApiError> {
    state
        .catalog
        .list_environments(&ProjectId::new(project_id))
        .await
        .map(Json)
        .map_err(api_error)
}

/// Delete an environment without deployments.
pub async fn delete_environment(
    State(state): State<AppState>,
    Path((project_id, environment_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .catalog
        .delete_environment(
            &ProjectId::new(project_id),
            &EnvironmentId::new(environment_id),
        )
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Set a variable.
pub async fn set_variable(
    State(state): State<AppState>,
    Path((project_id, environment_id)): Path<(String, String)>,
    Json(request): Json<SetVariableRequest>,
) -> Result<Json<EnvVariable>, ApiError> {
    state
        .catalog
        .set_variable(
            &ProjectId::new(project_id),
            &EnvironmentId::new(environment_id),
            &request.key,
            &request.value,
        )
        .await
        .map(Json)
        .map_err(api_error)
}

/// List an environment's variables.
pub async fn list_variables(
    State(state): State<AppState>,
    Path((project_id, environment_id)): Path<(String, String)>,
) -> Result<Json<Vec<EnvVariable>>, ApiError> {
    state
        .catalog
        .list_variables(
            &ProjectId::new(project_id),
            &EnvironmentId::new(environment_id),
        )
        .await
        .map(Json)
        .map_err(api_error)
}

/// Delete a variable.
pub async fn delete_variable(
    State(state): State<AppState>,
    Path((project_id, environment_id, key)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .catalog
        .delete_variable(
            &ProjectId::new(project_id),
            &EnvironmentId::new(environment_id),
            &key,
        )
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
