//! Rollback controller.

use std::sync::Arc;

use tracing::{info, warn};

use super::ensure_capacity;
use crate::dispatch::{DispatchQueue, Job};
use crate::error::{ControlError, ControlResult, RejectReason};
use crate::state::{Deployment, Queued};
use crate::store::{DeploymentFilter, Store};
use crate::types::{DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, ProjectId};

/// Restores the last known-good commit of an environment.
///
/// A rollback never rewrites history: it creates a new deployment of the
/// prior commit, and the target is marked `rolled_back` only once that new
/// deployment succeeds.
pub struct RollbackController {
    store: Arc<dyn Store>,
    queue: Arc<DispatchQueue>,
}

impl RollbackController {
    /// Create a new rollback controller.
    pub fn new(store: Arc<dyn Store>, queue: Arc<DispatchQueue>) -> Self {
        Self { store, queue }
    }

    /// Roll back a deployment.
    ///
    /// Selects the newest `success` or `promoted` deployment of the same
    /// environment created strictly before the target, and queues a new
    /// deployment of its branch and commit. Rejected with `NotFound`,
    /// `NotEligible` when the target is not `success` or `promoted`, or
    /// `NoPriorSuccess` when nothing older qualifies.
    pub async fn rollback(
        &self,
        project_id: &ProjectId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let result = self.plan(project_id, deployment_id).await;
        let (target, prior) = match result {
            Ok(plan) => plan,
            Err(e) => {
                if let Some(reason) = e.reject_reason() {
                    warn!(deployment_id = %deployment_id, %reason, "rollback rejected");
                }
                return Err(e);
            }
        };

        ensure_capacity(&self.queue)?;

        let mut data = DeploymentData::new(
            target.data.project_id.clone(),
            target.data.environment_id.clone(),
            prior.data.branch.clone(),
            prior.data.commit_hash.clone(),
        );
        data.rollback_of = Some(target.data.id.clone());
        let record = Deployment::<Queued>::create(data).record();
        self.store.insert(&record).await?;

        info!(
            deployment_id = %record.data.id,
            rollback_of = %target.data.id,
            restoring = %prior.data.id,
            commit = %prior.data.short_commit(),
            "rollback queued"
        );

        self.queue
            .submit(Job::new(
                record.data.id.clone(),
                record.job_kind(),
                record.data.environment_id.clone(),
            ))
            .await?;
        Ok(record)
    }

    /// Find the target and the deployment to restore.
    async fn plan(
        &self,
        project_id: &ProjectId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<(DeploymentRecord, DeploymentRecord)> {
        let target = self
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

        if !target.status.is_good() {
            return Err(ControlError::rejected(
                RejectReason::NotEligible,
                format!(
                    "deployment {deployment_id} is {}; only successful or promoted deployments can be rolled back",
                    target.status
                ),
            ));
        }

        let filter = DeploymentFilter::new()
            .with_environment(target.data.environment_id.clone())
            .with_status(DeploymentStatus::Success)
            .with_status(DeploymentStatus::Promoted);
        let prior = self
            .store
            .list(&filter)
            .await?
            .into_iter()
            .find(|candidate| {
                candidate.data.id != target.data.id && candidate.data.is_older_than(&target.data)
            })
            .ok_or_else(|| {
                ControlError::rejected(
                    RejectReason::NoPriorSuccess,
                    format!("no successful deployment older than {deployment_id}"),
                )
            })?;

        Ok((target, prior))
    }
}

impl std::fmt::Debug for RollbackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackController").finish_non_exhaustive()
    }
}
