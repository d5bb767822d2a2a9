//! Dispatch workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{Backoff, DispatchQueue, Job};
use crate::config::DispatchConfig;
use crate::error::{ControlError, ControlResult, ErrorKind, ResourceKind};
use crate::pool::VmPool;
use crate::runner::{ExecutionOutcome, ExecutionRequest, ExecutionRunner, LogWriter};
use crate::state::{AnyDeployment, Deployment, Running};
use crate::store::Store;
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, EnvVariable, Environment, JobKind, Project,
    VmLease, VmRecord,
};

/// Counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct DispatchStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    promoted: AtomicU64,
    promotions_failed: AtomicU64,
    requeued: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Deployments moved to running.
    pub started: u64,
    /// Deployments that reached success.
    pub succeeded: u64,
    /// Deployments that failed.
    pub failed: u64,
    /// Promotions completed.
    pub promoted: u64,
    /// Promotion jobs that failed.
    pub promotions_failed: u64,
    /// Jobs put back because no VM was free.
    pub requeued: u64,
    /// Runner attempts retried after a transient error.
    pub retried: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            promotions_failed: self.promotions_failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

enum Step {
    Done,
    NoVm,
}

/// Everything a job needs besides its VM.
struct JobContext {
    record: DeploymentRecord,
    project: Project,
    environment: Environment,
    variables: Vec<EnvVariable>,
}

/// Drives jobs from the dispatch queue through the deployment state machine.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<DispatchQueue>,
    pool: Arc<VmPool>,
    runner: Arc<dyn ExecutionRunner>,
    backoff: Backoff,
    max_attempts: u32,
    default_region: String,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DispatchQueue>,
        pool: Arc<VmPool>,
        runner: Arc<dyn ExecutionRunner>,
        config: &DispatchConfig,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            runner,
            backoff: config.backoff(),
            max_attempts: config.max_attempts.max(1),
            default_region: default_region.into(),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Start `count` workers that stop when `cancel` fires.
    ///
    /// A worker finishes the job it holds before observing cancellation.
    pub fn spawn(self: &Arc<Self>, count: usize, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "dispatch worker started");
        loop {
            let job = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                job = self.queue.next() => job,
            };
            self.process(job).await;
        }
        debug!(worker, "dispatch worker stopped");
    }

    /// Run one claimed job to completion and settle it with the queue.
    pub async fn process(&self, job: Job) {
        let span = info_span!("job", deployment_id = %job.deployment_id, kind = %job.kind);
        let result = match job.kind {
            JobKind::Deploy | JobKind::Rollback => self.execute(&job).instrument(span).await,
            JobKind::Promote => self.promote(&job).instrument(span).await,
        };

        match result {
            Ok(Step::Done) => self.queue.complete(&job),
            Ok(Step::NoVm) => {
                DispatchStats::bump(&self.stats.requeued);
                let delay = self.backoff.delay(job.requeues);
                self.queue.requeue(job, delay).await;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                error!(deployment_id = %job.deployment_id, error = %e, "dropping job");
                self.queue.complete(&job);
            }
            Err(e) => {
                warn!(
                    deployment_id = %job.deployment_id,
                    error = %e,
                    "job failed before execution, requeueing"
                );
                let delay = self.backoff.delay(job.requeues);
                self.queue.requeue(job, delay).await;
            }
        }
    }

    async fn context(&self, record: DeploymentRecord) -> ControlResult<JobContext> {
        let environment = self
            .store
            .get_environment(&record.data.environment_id)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(ResourceKind::Environment, &record.data.environment_id)
            })?;
        let project = self
            .store
            .get_project(&record.data.project_id)
            .await?
            .ok_or_else(|| ControlError::not_found(ResourceKind::Project, &record.data.project_id))?;
        let variables = self.store.list_variables(&environment.id).await?;

        Ok(JobContext {
            record,
            project,
            environment,
            variables,
        })
    }

    async fn acquire(&self, job: &Job, ctx: &JobContext) -> ControlResult<Option<VmRecord>> {
        let region = ctx.environment.region_or(&self.default_region);
        let lease = VmLease {
            deployment_id: job.deployment_id.clone(),
            kind: job.kind,
        };
        let vm = self.pool.acquire(region, lease).await?;
        if vm.is_none() {
            info!(
                deployment_id = %job.deployment_id,
                region,
                requeues = job.requeues,
                "no VM available, job stays queued"
            );
        }
        Ok(vm)
    }

    async fn release(&self, vm: &VmRecord, deployment_id: &DeploymentId) {
        if let Err(e) = self.pool.release(&vm.id, deployment_id).await {
            error!(vm_id = %vm.id, deployment_id = %deployment_id, error = %e, "failed to release VM");
        }
    }

    fn request(&self, job: &Job, ctx: &JobContext, vm: &VmRecord) -> ExecutionRequest {
        ExecutionRequest {
            deployment_id: job.deployment_id.clone(),
            kind: job.kind,
            project: ctx.project.clone(),
            environment: ctx.environment.clone(),
            vm: vm.clone(),
            branch: ctx.record.data.branch.clone(),
            commit_hash: ctx.record.data.commit_hash.clone(),
            variables: ctx.variables.clone(),
        }
    }

    /// Call the runner, retrying transient errors in place.
    async fn run_with_retries(
        &self,
        request: &ExecutionRequest,
        logs: &LogWriter,
    ) -> ControlResult<ExecutionOutcome> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.runner.run(request, logs).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    DispatchStats::bump(&self.stats.retried);
                    warn!(
                        deployment_id = %request.deployment_id,
                        attempt,
                        error = %e,
                        "transient execution error, retrying"
                    );
                    logs.line(format!(
                        "attempt {attempt} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    ))
                    .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ControlError::fatal(format!(
                        "giving up after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deploy and rollback jobs: `queued → running → success | failed`.
    async fn execute(&self, job: &Job) -> ControlResult<Step> {
        let Some(record) = self.store.get(&job.deployment_id).await? else {
            return Err(ControlError::not_found(
                ResourceKind::Deployment,
                &job.deployment_id,
            ));
        };
        if record.status != DeploymentStatus::Queued {
            debug!(status = %record.status, "deployment already dispatched");
            return Ok(Step::Done);
        }

        let ctx = self.context(record).await?;
        let Some(vm) = self.acquire(job, &ctx).await? else {
            return Ok(Step::NoVm);
        };

        let running = match AnyDeployment::from_record(ctx.record.clone()).try_into_queued() {
            Ok(queued) => queued.start(vm.id.clone()),
            Err(e) => {
                self.release(&vm, &job.deployment_id).await;
                return Err(e);
            }
        };
        match self
            .store
            .transition(&running.record(), DeploymentStatus::Queued)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("deployment left the queued state before it could start");
                self.release(&vm, &job.deployment_id).await;
                return Ok(Step::Done);
            }
            Err(e) => {
                self.release(&vm, &job.deployment_id).await;
                return Err(e);
            }
        }

        DispatchStats::bump(&self.stats.started);
        info!(
            deployment_id = %job.deployment_id,
            environment = %ctx.environment.name,
            commit = %running.data().short_commit(),
            vm_id = %vm.id,
            "deployment running"
        );

        let logs = LogWriter::new(Arc::clone(&self.store), job.deployment_id.clone());
        logs.line(format!(
            "==> {} {} ({}) to {} on VM {} in {}",
            job.kind,
            running.data().short_commit(),
            running.data().branch,
            ctx.environment.name,
            vm.id,
            vm.region
        ))
        .await;

        let request = self.request(job, &ctx, &vm);
        let result = self.run_with_retries(&request, &logs).await;

        let settled = match result {
            Ok(outcome) => self.finish_success(running, &ctx.environment, outcome, &logs).await,
            Err(e) => self.finish_failure(running, &e, &logs).await,
        };
        if let Err(e) = settled {
            error!(deployment_id = %job.deployment_id, error = %e, "failed to record outcome");
        }

        self.release(&vm, &job.deployment_id).await;
        Ok(Step::Done)
    }

    async fn finish_success(
        &self,
        running: Deployment<Running>,
        environment: &Environment,
        outcome: ExecutionOutcome,
        logs: &LogWriter,
    ) -> ControlResult<()> {
        let success = running.succeed(outcome.url);
        if !self
            .store
            .transition(&success.record(), DeploymentStatus::Running)
            .await?
        {
            warn!(deployment_id = %success.id(), "deployment changed while running");
            return Ok(());
        }

        DispatchStats::bump(&self.stats.succeeded);
        let url = success.data().url.clone();
        info!(
            deployment_id = %success.id(),
            url = url.as_deref().unwrap_or(""),
            "deployment succeeded"
        );
        logs.line(match url.as_deref() {
            Some(url) => format!("deployment succeeded: {url}"),
            None => "deployment succeeded".to_owned(),
        })
        .await;

        if let Some(target) = success.data().rollback_of.clone() {
            self.store.set_live(&environment.id, success.id()).await?;
            if let Err(e) = self.supersede(&target, logs).await {
                warn!(target = %target, error = %e, "failed to mark rollback target");
            }
        } else if !environment.is_production {
            self.store.set_live(&environment.id, success.id()).await?;
        } else {
            logs.line("awaiting promotion").await;
        }
        Ok(())
    }

    /// Mark the deployment a successful rollback replaced.
    async fn supersede(&self, target_id: &DeploymentId, logs: &LogWriter) -> ControlResult<()> {
        let Some(target) = self.store.get(target_id).await? else {
            warn!(target = %target_id, "rollback target no longer exists");
            return Ok(());
        };

        let from = target.status;
        match AnyDeployment::from_record(target).roll_back() {
            Ok(rolled_back) => {
                if self.store.transition(&rolled_back.record(), from).await? {
                    info!(target = %target_id, "deployment rolled back");
                    logs.line(format!("marked {target_id} as rolled back")).await;
                }
            }
            Err(e) => {
                warn!(target = %target_id, error = %e, "rollback target cannot be marked rolled back");
            }
        }
        Ok(())
    }

    async fn finish_failure(
        &self,
        running: Deployment<Running>,
        error: &ControlError,
        logs: &LogWriter,
    ) -> ControlResult<()> {
        logs.line(format!("deployment failed: {error}")).await;
        let failed = running.fail(error.to_string());
        if self
            .store
            .transition(&failed.record(), DeploymentStatus::Running)
            .await?
        {
            DispatchStats::bump(&self.stats.failed);
            error!(deployment_id = %failed.id(), error = %error, "deployment failed");
        }
        Ok(())
    }

    /// Promotion jobs: `success → promoted` once the runner completes.
    async fn promote(&self, job: &Job) -> ControlResult<Step> {
        let Some(record) = self.store.get(&job.deployment_id).await? else {
            return Err(ControlError::not_found(
                ResourceKind::Deployment,
                &job.deployment_id,
            ));
        };
        if record.status != DeploymentStatus::Success {
            warn!(status = %record.status, "deployment no longer eligible for promotion");
            return Ok(Step::Done);
        }

        let ctx = self.context(record).await?;
        let Some(vm) = self.acquire(job, &ctx).await? else {
            return Ok(Step::NoVm);
        };

        info!(
            deployment_id = %job.deployment_id,
            environment = %ctx.environment.name,
            vm_id = %vm.id,
            "promotion running"
        );
        let logs = LogWriter::new(Arc::clone(&self.store), job.deployment_id.clone());
        logs.line(format!(
            "==> promote {} to {} on VM {}",
            ctx.record.data.short_commit(),
            ctx.environment.name,
            vm.id
        ))
        .await;

        let request = self.request(job, &ctx, &vm);
        let result = self.run_with_retries(&request, &logs).await;

        if let Err(e) = self.finish_promotion(&ctx.environment, result, &logs, job).await {
            error!(deployment_id = %job.deployment_id, error = %e, "failed to record promotion");
        }

        self.release(&vm, &job.deployment_id).await;
        Ok(Step::Done)
    }

    async fn finish_promotion(
        &self,
        environment: &Environment,
        result: ControlResult<ExecutionOutcome>,
        logs: &LogWriter,
        job: &Job,
    ) -> ControlResult<()> {
        let Some(current) = self.store.get(&job.deployment_id).await? else {
            return Ok(());
        };

        match result {
            Ok(outcome) => {
                let success = match AnyDeployment::from_record(current).try_into_success() {
                    Ok(success) => success,
                    Err(e) => {
                        warn!(error = %e, "deployment changed during promotion");
                        logs.line("promotion finished but the deployment is no longer successful")
                            .await;
                        return Ok(());
                    }
                };

                let promoted = success.promote(outcome.url);
                if self
                    .store
                    .transition(&promoted.record(), DeploymentStatus::Success)
                    .await?
                {
                    self.store.set_live(&environment.id, promoted.id()).await?;
                    DispatchStats::bump(&self.stats.promoted);
                    info!(deployment_id = %promoted.id(), environment = %environment.name, "deployment promoted");
                    logs.line("promoted to live").await;
                }
            }
            Err(e) => {
                DispatchStats::bump(&self.stats.promotions_failed);
                error!(deployment_id = %job.deployment_id, error = %e, "promotion failed");
                logs.line(format!("promotion failed: {e}")).await;

                if current.status == DeploymentStatus::Success {
                    let mut record = current;
                    record.data.error = Some(format!("promotion failed: {e}"));
                    record.data.updated_at = Utc::now();
                    self.store
                        .transition(&record, DeploymentStatus::Success)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backoff", &self.backoff)
            .field("max_attempts", &self.max_attempts)
            .field("default_region", &self.default_region)
            .finish_non_exhaustive()
    }
}
