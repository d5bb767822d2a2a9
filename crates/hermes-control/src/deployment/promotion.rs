//! Promotion gate for production environments.

use std::sync::Arc;

use tracing::{info, warn};

use super::ensure_capacity;
use crate::dispatch::{DispatchQueue, Job};
use crate::error::{ControlError, ControlResult, RejectReason};
use crate::store::Store;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, JobKind, ProjectId};

/// Guards the step that makes a deployment live in production.
///
/// Acceptance only submits a promotion job; the deployment becomes
/// `promoted` when that job completes.
pub struct PromotionGate {
    store: Arc<dyn Store>,
    queue: Arc<DispatchQueue>,
}

impl PromotionGate {
    /// Create a new promotion gate.
    pub fn new(store: Arc<dyn Store>, queue: Arc<DispatchQueue>) -> Self {
        Self { store, queue }
    }

    /// Request promotion of a deployment.
    ///
    /// Rejected with `NotFound` if the deployment does not exist in the
    /// project, `NotProduction` if its environment is not production, and
    /// `NotEligible` unless its status is `success`. A rejection changes
    /// nothing.
    pub async fn promote(
        &self,
        project_id: &ProjectId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let result = self.check(project_id, deployment_id).await;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                if let Some(reason) = e.reject_reason() {
                    warn!(deployment_id = %deployment_id, %reason, "promotion rejected");
                }
                return Err(e);
            }
        };

        ensure_capacity(&self.queue)?;
        self.queue
            .submit(Job::new(
                deployment_id.clone(),
                JobKind::Promote,
                record.data.environment_id.clone(),
            ))
            .await?;

        info!(deployment_id = %deployment_id, "promotion accepted");
        Ok(record)
    }

    async fn check(
        &self,
        project_id: &ProjectId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let record = self
            .store
            .get(deployment_id)
            .await?
            .filter(|r| &r.data.project_id == project_id)
            .ok_or_else(|| {
                ControlError::rejected(
                    RejectReason::NotFound,
                    format!("deployment {deployment_id} not found in project {project_id}"),
                )
            })?;

        let environment = self
            .store
            .get_environment(&record.data.environment_id)
            .await?
            .ok_or_else(|| {
                ControlError::rejected(
                    RejectReason::NotFound,
                    format!("environment {} not found", record.data.environment_id),
                )
            })?;

        if !environment.is_production {
            return Err(ControlError::rejected(
                RejectReason::NotProduction,
                format!("environment '{}' is not a production environment", environment.name),
            ));
        }

        if record.status != DeploymentStatus::Success {
            return Err(ControlError::rejected(
                RejectReason::NotEligible,
                format!(
                    "deployment {deployment_id} is {}; only successful deployments can be promoted",
                    record.status
                ),
            ));
        }

        Ok(record)
    }
}

impl std::fmt::Debug for PromotionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionGate").finish_non_exhaustive()
    }
}
