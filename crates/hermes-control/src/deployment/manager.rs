//! Deployment acceptance, queries and crash recovery.

use std::sync::Arc;

use tracing::{info, warn};

use super::ensure_capacity;
use crate::dispatch::{DispatchQueue, Job};
use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::resolver::EnvironmentResolver;
use crate::state::{AnyDeployment, Deployment, Queued};
use crate::store::{DeploymentFilter, Store};
use crate::types::{
    validate_commit_hash, DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus,
    EnvironmentId, ProjectId,
};

/// Request to deploy a commit of a branch.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    /// Project identifier.
    pub project_id: ProjectId,
    /// Branch to deploy; selects the environment.
    pub branch: String,
    /// Commit to deploy.
    pub commit_hash: String,
}

impl DeploymentRequest {
    fn validate(&self) -> ControlResult<()> {
        if self.branch.trim().is_empty() {
            return Err(ControlError::invalid("branch must not be empty"));
        }
        validate_commit_hash(self.commit_hash.trim())
    }
}

/// What startup recovery found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Queued deployments submitted again.
    pub requeued: usize,
    /// Running deployments failed because their worker is gone.
    pub failed: usize,
}

/// Accepts deployments and answers queries about them.
pub struct DeploymentManager {
    store: Arc<dyn Store>,
    resolver: EnvironmentResolver,
    queue: Arc<DispatchQueue>,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(store: Arc<dyn Store>, queue: Arc<DispatchQueue>) -> Self {
        Self {
            resolver: EnvironmentResolver::new(Arc::clone(&store)),
            store,
            queue,
        }
    }

    /// Accept a deployment request.
    ///
    /// Resolves the environment bound to the branch, records a `queued`
    /// deployment and submits it for execution. Nothing is written when the
    /// request is rejected: `NotFound` for an unknown project or unbound
    /// branch, `Conflict` while the environment has a queued or running
    /// deployment.
    pub async fn create(&self, request: DeploymentRequest) -> ControlResult<DeploymentRecord> {
        request.validate()?;
        let environment = self
            .resolver
            .resolve(&request.project_id, &request.branch)
            .await?;
        ensure_capacity(&self.queue)?;

        let data = DeploymentData::new(
            request.project_id,
            environment.id.clone(),
            request.branch,
            request.commit_hash.trim().to_owned(),
        );
        let queued = Deployment::<Queued>::create(data);
        let record = queued.record();
        self.store.insert(&record).await?;

        info!(
            deployment_id = %record.data.id,
            project_id = %record.data.project_id,
            environment = %environment.name,
            branch = %record.data.branch,
            commit = %record.data.short_commit(),
            "deployment queued"
        );

        self.queue
            .submit(Job::new(
                record.data.id.clone(),
                record.job_kind(),
                environment.id,
            ))
            .await?;
        Ok(record)
    }

    /// Get a deployment by ID.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::not_found(ResourceKind::Deployment, id))
    }

    /// Get a deployment, requiring it to belong to a project.
    pub async fn get_in_project(
        &self,
        project_id: &ProjectId,
        id: &DeploymentId,
    ) -> ControlResult<DeploymentRecord> {
        let record = self.get(id).await?;
        if &record.data.project_id != project_id {
            return Err(ControlError::not_found(ResourceKind::Deployment, id));
        }
        Ok(record)
    }

    /// List a project's deployments, newest first.
    pub async fn list(
        &self,
        project_id: &ProjectId,
        filter: DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(ControlError::not_found(ResourceKind::Project, project_id));
        }
        self.store
            .list(&filter.with_project(project_id.clone()))
            .await
    }

    /// The deployment currently serving an environment.
    pub async fn live(&self, environment_id: &EnvironmentId) -> ControlResult<Option<DeploymentRecord>> {
        self.store.get_live(environment_id).await
    }

    /// Reconcile deployments left behind by a previous process.
    ///
    /// Queued deployments are submitted again. Running deployments lost
    /// their worker and are failed with a log line saying so.
    pub async fn recover(&self) -> ControlResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let queued = self
            .store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Queued))
            .await?;
        for record in queued.into_iter().rev() {
            let job = Job::new(
                record.data.id.clone(),
                record.job_kind(),
                record.data.environment_id.clone(),
            );
            match self.queue.submit(job).await {
                Ok(()) => report.requeued += 1,
                Err(e) => warn!(deployment_id = %record.data.id, error = %e, "could not requeue"),
            }
        }

        let running = self
            .store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Running))
            .await?;
        for record in running {
            let id = record.data.id.clone();
            let running = AnyDeployment::from_record(record).try_into_running()?;
            let message = "interrupted: the control plane restarted while this deployment was running";
            self.store.append_log(&id, &format!("{message}\n")).await?;

            let failed = running.fail(message.to_owned());
            if self
                .store
                .transition(&failed.record(), DeploymentStatus::Running)
                .await?
            {
                warn!(deployment_id = %id, "failed deployment interrupted by restart");
                report.failed += 1;
            }
        }

        if report != RecoveryReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "recovered deployments from previous run"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{CatalogStore, DeploymentStore, MemoryStore};
    use crate::types::{Environment, EnvironmentSpec, JobKind, Project, VmId};

    async fn setup() -> (Arc<MemoryStore>, Arc<DispatchQueue>, DeploymentManager, Environment) {
        let store = Arc::new(MemoryStore::new());
        let project = Project::new("site", "https://git.example.com/site.git").unwrap();
        store.insert_project(&project).await.unwrap();
        let env = Environment::new(
            project.id.clone(),
            EnvironmentSpec {
                name: "production".to_owned(),
                branch: "main".to_owned(),
                is_production: true,
                ..Default::default()
            },
        )
        .unwrap();
        store.insert_environment(&env).await.unwrap();

        let queue = Arc::new(DispatchQueue::new(8));
        let manager = DeploymentManager::new(store.clone(), Arc::clone(&queue));
        (store, queue, manager, env)
    }

    fn request(project_id: &ProjectId, branch: &str, commit: &str) -> DeploymentRequest {
        DeploymentRequest {
            project_id: project_id.clone(),
            branch: branch.to_owned(),
            commit_hash: commit.to_owned(),
        }
    }

    #[tokio::test]
    async fn create_records_and_submits() {
        let (_store, queue, manager, env) = setup().await;

        let record = manager
            .create(request(&env.project_id, "main", "abc123"))
            .await
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Queued);
        assert_eq!(record.data.environment_id, env.id);
        assert!(record.data.completed_at.is_none());
        assert!(queue.contains(&record.data.id, JobKind::Deploy));

        let fetched = manager.get(&record.data.id).await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn unbound_branch_writes_nothing() {
        let (store, queue, manager, env) = setup().await;

        let err = manager
            .create(request(&env.project_id, "feature/x", "abc123"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(store.list(&DeploymentFilter::new()).await.unwrap().is_empty());
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn second_request_for_busy_environment_conflicts() {
        let (store, _queue, manager, env) = setup().await;
        manager
            .create(request(&env.project_id, "main", "abc123"))
            .await
            .unwrap();

        let err = manager
            .create(request(&env.project_id, "main", "def456"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.list(&DeploymentFilter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_commit_is_invalid() {
        let (_store, _queue, manager, env) = setup().await;
        let err = manager
            .create(request(&env.project_id, "main", " "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn short_hex_commit_is_accepted() {
        let (store, queue, manager, env) = setup().await;
        let record = manager
            .create(request(&env.project_id, "main", "abc123"))
            .await
            .unwrap();

        assert_eq!(record.status, DeploymentStatus::Queued);
        assert_eq!(record.data.commit_hash, "abc123");
        assert_eq!(store.list(&DeploymentFilter::new()).await.unwrap().len(), 1);
        assert_eq!(queue.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn non_hex_commit_writes_nothing() {
        let (store, queue, manager, env) = setup().await;
        for commit in ["main", "abc", "abc123; rm -rf /"] {
            let err = manager
                .create(request(&env.project_id, "main", commit))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{commit}");
        }
        assert!(store.list(&DeploymentFilter::new()).await.unwrap().is_empty());
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_is_transient() {
        let (store, _queue, _manager, env) = setup().await;
        let queue = Arc::new(DispatchQueue::new(0));
        let manager = DeploymentManager::new(store.clone(), queue);

        let err = manager
            .create(request(&env.project_id, "main", "abc123"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.list(&DeploymentFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_requires_project() {
        let (_store, _queue, manager, _env) = setup().await;
        let err = manager
            .list(&ProjectId::new("missing"), DeploymentFilter::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn recover_requeues_queued_and_fails_running() {
        let (store, queue, manager, env) = setup().await;

        let record = DeploymentRecord::new(DeploymentData::new(
            env.project_id.clone(),
            env.id.clone(),
            "main".to_owned(),
            "abc123".to_owned(),
        ));
        store.insert(&record).await.unwrap();

        let report = manager.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, failed: 0 });
        assert!(queue.contains(&record.data.id, JobKind::Deploy));

        let job = queue.next().await;
        queue.complete(&job);
        let running = Deployment::<Queued>::create(record.data.clone()).start(VmId::new("vm-1"));
        assert!(store
            .transition(&running.record(), DeploymentStatus::Queued)
            .await
            .unwrap());

        let report = manager.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { requeued: 0, failed: 1 });

        let failed = store.get(&record.data.id).await.unwrap().unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert!(failed.data.completed_at.is_some());
        assert!(failed.data.logs.contains("control plane restarted"));
    }
}
