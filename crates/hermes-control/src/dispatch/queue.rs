//! In-process job queue with per-environment exclusion.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, EnvironmentId, JobKind};

/// A unit of work for a dispatch worker.
#[derive(Debug, Clone)]
pub struct Job {
    /// Deployment the job acts on.
    pub deployment_id: DeploymentId,
    /// What to do with it.
    pub kind: JobKind,
    /// Environment the deployment is bound to.
    pub environment_id: EnvironmentId,
    /// Times the job went back to the queue because no VM was free.
    pub requeues: u32,
    ready_at: Instant,
}

impl Job {
    /// Create a job that is ready immediately.
    #[must_use]
    pub fn new(deployment_id: DeploymentId, kind: JobKind, environment_id: EnvironmentId) -> Self {
        Self {
            deployment_id,
            kind,
            environment_id,
            requeues: 0,
            ready_at: Instant::now(),
        }
    }

    fn key(&self) -> (DeploymentId, JobKind) {
        (self.deployment_id.clone(), self.kind)
    }
}

/// FIFO queue shared by every dispatch worker.
///
/// A job is in flight from [`submit`](Self::submit) until
/// [`complete`](Self::complete); submitting the same `(deployment, kind)`
/// while it is in flight is a `Conflict`. [`next`](Self::next) hands out at
/// most one job per environment at a time and skips jobs whose backoff has
/// not elapsed.
#[derive(Debug)]
pub struct DispatchQueue {
    pending: Mutex<VecDeque<Job>>,
    in_flight: DashSet<(DeploymentId, JobKind)>,
    claimed: DashMap<EnvironmentId, DeploymentId>,
    notify: Notify,
    capacity: usize,
}

impl DispatchQueue {
    /// Create a queue that reports full at `capacity` in-flight jobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            in_flight: DashSet::new(),
            claimed: DashMap::new(),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Add a job to the back of the queue.
    pub async fn submit(&self, job: Job) -> ControlResult<()> {
        if !self.in_flight.insert(job.key()) {
            return Err(ControlError::conflict(format!(
                "{} job for deployment {} is already queued",
                job.kind, job.deployment_id
            )));
        }

        debug!(deployment_id = %job.deployment_id, kind = %job.kind, "job submitted");
        self.pending.lock().await.push_back(job);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next runnable job and claim its environment.
    ///
    /// The claim is held until the job is completed or requeued.
    pub async fn next(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut pending = self.pending.lock().await;
                let now = Instant::now();
                let mut blocked: Vec<&EnvironmentId> = Vec::new();
                let mut earliest: Option<Instant> = None;
                let mut found = None;

                for (index, job) in pending.iter().enumerate() {
                    if blocked.contains(&&job.environment_id)
                        || self.claimed.contains_key(&job.environment_id)
                    {
                        continue;
                    }
                    if job.ready_at > now {
                        earliest = Some(earliest.map_or(job.ready_at, |e| e.min(job.ready_at)));
                        blocked.push(&job.environment_id);
                        continue;
                    }
                    found = Some(index);
                    break;
                }

                if let Some(job) = found.and_then(|index| pending.remove(index)) {
                    self.claimed
                        .insert(job.environment_id.clone(), job.deployment_id.clone());
                    return job;
                }
                earliest
            };

            match wake_at {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Finish a job: release its environment and its in-flight key.
    pub fn complete(&self, job: &Job) {
        self.release_claim(job);
        self.in_flight.remove(&job.key());
        self.notify.notify_waiters();
    }

    /// Put a claimed job back, runnable after `delay`.
    ///
    /// The job keeps its in-flight key; its requeue counter is incremented.
    pub async fn requeue(&self, mut job: Job, delay: Duration) {
        job.requeues = job.requeues.saturating_add(1);
        job.ready_at = Instant::now() + delay;
        self.release_claim(&job);
        debug!(
            deployment_id = %job.deployment_id,
            kind = %job.kind,
            requeues = job.requeues,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "job requeued"
        );
        self.pending.lock().await.push_back(job);
        self.notify.notify_waiters();
    }

    fn release_claim(&self, job: &Job) {
        self.claimed
            .remove_if(&job.environment_id, |_, holder| holder == &job.deployment_id);
    }

    /// Whether the job is submitted and not yet completed.
    #[must_use]
    pub fn contains(&self, deployment_id: &DeploymentId, kind: JobKind) -> bool {
        self.in_flight.contains(&(deployment_id.clone(), kind))
    }

    /// Whether new work should be turned away.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.in_flight.len() >= self.capacity
    }

    /// Jobs submitted and not yet completed.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Jobs waiting for a worker.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Environments currently claimed by a worker.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.claimed.len()
    }
}
