//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hermes_control::config::DispatchConfig;
use hermes_control::runner::MockRunner;
use hermes_control::store::DeploymentStore;
use hermes_control::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, Environment, EnvironmentSpec, Project,
};
use hermes_control::{
    Catalog, DeploymentManager, DeploymentRequest, DispatchQueue, Dispatcher, MemoryStore,
    PromotionGate, RollbackController, StaticInventory, Store, VmPool,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const REGION: &str = "us-east-1";

/// Complete control plane wired over in-memory components.
pub struct TestControlPlane {
    pub store: Arc<MemoryStore>,
    pub inventory: Arc<StaticInventory>,
    pub pool: Arc<VmPool>,
    pub queue: Arc<DispatchQueue>,
    pub runner: Arc<MockRunner>,
    pub dispatcher: Arc<Dispatcher>,
    pub catalog: Catalog,
    pub deployments: DeploymentManager,
    pub promotion: PromotionGate,
    pub rollback: RollbackController,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl TestControlPlane {
    /// Creates a control plane with `workers` dispatch workers and a runner
    /// that succeeds immediately.
    pub async fn new(workers: usize) -> Self {
        Self::with_runner(workers, MockRunner::new()).await
    }

    /// Creates a control plane around a prepared runner.
    pub async fn with_runner(workers: usize, runner: MockRunner) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let inventory = Arc::new(StaticInventory::new());
        let pool = Arc::new(
            VmPool::load(Arc::clone(&dyn_store), inventory.clone())
                .await
                .unwrap(),
        );
        let queue = Arc::new(DispatchQueue::new(64));
        let runner = Arc::new(runner);

        let config = DispatchConfig {
            backoff_base_ms: 5,
            backoff_max_ms: 20,
            ..DispatchConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&dyn_store),
            Arc::clone(&queue),
            Arc::clone(&pool),
            runner.clone(),
            &config,
            REGION,
        ));

        let cancel = CancellationToken::new();
        let workers = dispatcher.spawn(workers, &cancel);

        Self {
            catalog: Catalog::new(Arc::clone(&dyn_store)),
            deployments: DeploymentManager::new(Arc::clone(&dyn_store), Arc::clone(&queue)),
            promotion: PromotionGate::new(Arc::clone(&dyn_store), Arc::clone(&queue)),
            rollback: RollbackController::new(Arc::clone(&dyn_store), Arc::clone(&queue)),
            store,
            inventory,
            pool,
            queue,
            runner,
            dispatcher,
            cancel,
            workers,
        }
    }

    /// Adds a running instance to the inventory and registers it as a VM.
    pub async fn add_vm(&self, instance_id: &str) {
        self.inventory.add_running(instance_id, REGION, None);
        self.pool.register(instance_id, REGION).await.unwrap();
    }

    /// Registers a project.
    pub async fn project(&self, name: &str) -> Project {
        self.catalog
            .create_project(name, &format!("https://git.example.com/{name}.git"))
            .await
            .unwrap()
    }

    /// Creates an environment bound to `branch`.
    pub async fn environment(
        &self,
        project: &Project,
        name: &str,
        branch: &str,
        is_production: bool,
    ) -> Environment {
        self.catalog
            .create_environment(
                &project.id,
                EnvironmentSpec {
                    name: name.to_owned(),
                    branch: branch.to_owned(),
                    is_production,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    /// Accepts a deployment of `commit` on `branch`.
    pub async fn deploy(&self, project: &Project, branch: &str, commit: &str) -> DeploymentRecord {
        self.deployments
            .create(DeploymentRequest {
                project_id: project.id.clone(),
                branch: branch.to_owned(),
                commit_hash: commit.to_owned(),
            })
            .await
            .unwrap()
    }

    /// Waits until the deployment reaches `status`.
    pub async fn wait_for(&self, id: &DeploymentId, status: DeploymentStatus) -> DeploymentRecord {
        let store = Arc::clone(&self.store);
        let wait = async {
            loop {
                if let Some(record) = store.get(id).await.unwrap() {
                    if record.status == status {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("deployment {id} never reached {status}"))
    }

    /// Waits until no job is left in the queue.
    pub async fn wait_idle(&self) {
        let wait = async {
            while self.queue.in_flight_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("queue never drained");
    }

    /// Current status of a deployment.
    pub async fn status(&self, id: &DeploymentId) -> DeploymentStatus {
        self.store.get(id).await.unwrap().unwrap().status
    }

    /// Stops the workers.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            worker.await.unwrap();
        }
    }
}
