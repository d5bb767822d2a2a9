//! VM pool endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::info;

use super::{api_error, ApiError, AppState};
use crate::types::{VmId, VmRecord};

/// Request to add a cloud instance to the pool.
#[derive(Debug, Deserialize)]
pub struct RegisterVmRequest {
    /// Cloud instance identifier.
    pub instance_id: String,
    /// Region the instance lives in.
    pub region: String,
}

/// List every pooled VM.
pub async fn list_vms(State(state): State<AppState>) -> Json<Vec<VmRecord>> {
    Json(state.pool.list().await)
}

/// Register a VM.
pub async fn register_vm(
    State(state): State<AppState>,
    Json(request): Json<RegisterVmRequest>,
) -> Result<(StatusCode, Json<VmRecord>), ApiError> {
    info!(instance_id = %request.instance_id, region = %request.region, "registering VM via API");
    let record = state
        .pool
        .register(&request.instance_id, &request.region)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Remove an idle VM from the pool.
pub async fn unregister_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .pool
        .unregister(&VmId::new(vm_id))
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
