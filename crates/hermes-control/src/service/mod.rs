//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{ControlConfig, InventoryKind, RunnerKind, SourceKind};
use crate::deployment::DeploymentManager;
use crate::dispatch::{DispatchQueue, Dispatcher};
use crate::error::{ControlError, ControlResult};
use crate::inventory::{CloudInventory, HttpInventory, StaticInventory};
use crate::pool::VmPool;
use crate::runner::{ExecutionRunner, MockRunner, ScriptRunner};
use crate::source::{EmptySource, GitSource, SourceProvider};
use crate::store::{MemoryStore, PostgresStore, Store};

/// How long workers get to finish their current job after shutdown.
const WORKER_GRACE: Duration = Duration::from_secs(30);

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Database connections
/// - VM pool and inventory sweeps
/// - Dispatch workers
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Load the VM pool and free leases left by a previous process
    /// 3. Start the dispatch workers and the inventory sweep
    /// 4. Recover deployments left queued or running
    /// 5. Serve the HTTP API until a shutdown signal
    /// 6. Let workers finish their current job
    pub async fn run(&self) -> ControlResult<()> {
        let store = self.create_store().await?;
        let inventory = self.create_inventory()?;

        let pool = Arc::new(VmPool::load(Arc::clone(&store), inventory).await?);
        let freed = pool.release_stale_leases().await?;
        if freed > 0 {
            info!(freed, "stale VM leases released");
        }

        let runner = self.create_runner();
        let queue = Arc::new(DispatchQueue::new(self.config.dispatch.queue_capacity));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&pool),
            runner,
            &self.config.dispatch,
            self.config.pool.default_region.clone(),
        ));

        let mut tasks = dispatcher.spawn(self.config.dispatch.workers, &self.cancel);
        info!(workers = self.config.dispatch.workers, "dispatch workers started");
        tasks.push(spawn_health_loop(
            Arc::clone(&pool),
            self.config.pool.health_check_interval(),
            self.cancel.clone(),
        ));

        let manager = DeploymentManager::new(Arc::clone(&store), Arc::clone(&queue));
        let report = manager.recover().await?;
        if report.requeued > 0 || report.failed > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "recovered deployments from previous run"
            );
        }

        let state = api::AppState::new(store, queue, pool, dispatcher.stats());
        let app = api::router(state).layer(middleware::from_fn_with_state(
            Duration::from_secs(self.config.server.request_timeout_secs),
            request_timeout,
        ));

        info!(listen = %self.config.server.listen, "control service listening");

        let served = serve(self.config.server.listen, app, self.cancel.clone()).await;

        // Stop workers even when the server failed.
        self.cancel.cancel();
        join_workers(tasks).await;

        served?;
        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> ControlResult<Arc<dyn Store>> {
        let database = &self.config.database;
        if database.url.is_empty() {
            info!("no database configured, using in-memory store");
            return Ok(Arc::new(MemoryStore::new()));
        }

        let connect = PostgresStore::new(&database.url, database.max_connections);
        let result = match tokio::time::timeout(database.connect_timeout(), connect).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::transient(format!(
                "timed out after {}s",
                database.connect_timeout_secs
            ))),
        };

        match result {
            Ok(store) => {
                info!(url = %database.url, "connected to PostgreSQL");
                Ok(Arc::new(store))
            }
            Err(e) if database.required => Err(ControlError::Config(format!(
                "failed to connect to PostgreSQL: {e}"
            ))),
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    fn create_inventory(&self) -> ControlResult<Arc<dyn CloudInventory>> {
        let config = &self.config.inventory;
        match config.kind {
            InventoryKind::Static => {
                let inventory = StaticInventory::new();
                for instance in &config.instances {
                    inventory.add_running(
                        &instance.instance_id,
                        &instance.region,
                        instance.address.as_deref(),
                    );
                }
                info!(instances = config.instances.len(), "static inventory configured");
                Ok(Arc::new(inventory))
            }
            InventoryKind::Http => {
                let inventory = HttpInventory::new(config)?;
                info!(url = %config.url, "HTTP inventory configured");
                Ok(Arc::new(inventory))
            }
        }
    }

    fn create_runner(&self) -> Arc<dyn ExecutionRunner> {
        let config = &self.config.execution;
        match config.runner {
            RunnerKind::Script => {
                let source: Arc<dyn SourceProvider> = match config.source {
                    SourceKind::Git => Arc::new(GitSource::new(&config.workspace_root)),
                    SourceKind::None => Arc::new(EmptySource::new(&config.workspace_root)),
                };
                info!(
                    script = %config.script,
                    source = ?config.source,
                    timeout_secs = config.timeout_secs,
                    "script runner configured"
                );
                Arc::new(ScriptRunner::new(
                    source,
                    config.script.clone(),
                    config.timeout(),
                    config.url_template.clone(),
                ))
            }
            RunnerKind::Mock => {
                warn!("mock runner configured, deployments will not execute anything");
                Arc::new(MockRunner::new())
            }
        }
    }
}

fn spawn_health_loop(
    pool: Arc<VmPool>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = pool.health_check().await;
                    if report.marked_unreachable > 0 || report.errors > 0 {
                        warn!(
                            checked = report.checked,
                            marked_unreachable = report.marked_unreachable,
                            errors = report.errors,
                            "VM health sweep found problems"
                        );
                    }
                }
            }
        }
    })
}

async fn join_workers(tasks: Vec<JoinHandle<()>>) {
    let all = join_tasks(tasks);
    if tokio::time::timeout(WORKER_GRACE, all).await.is_err() {
        warn!(
            grace_secs = WORKER_GRACE.as_secs(),
            "workers still busy after grace period, abandoning their jobs"
        );
    }
}

async fn join_tasks(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task panicked");
        }
    }
}

async fn request_timeout(
    State(timeout): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response(),
    }
}

/// Serve an axum router on a TCP address with graceful shutdown.
async fn serve(addr: SocketAddr, app: axum::Router, cancel: CancellationToken) -> ControlResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .map_err(|e| ControlError::Config(format!("server error: {e}")))?;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CatalogStore;

    #[test]
    fn service_creation() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        assert!(!service.cancel.is_cancelled());
    }

    #[test]
    fn service_shutdown() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn empty_database_url_uses_memory_store() {
        let mut config = ControlConfig::default();
        config.database.url = String::new();
        config.database.required = true;
        let service = ControlService::new(config);

        let store = service.create_store().await.unwrap();
        assert!(store.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_inventory_is_seeded_from_config() {
        let mut config = ControlConfig::default();
        config.inventory.instances.push(crate::config::StaticInstance {
            instance_id: "i-0abc".to_owned(),
            region: "eu-west-1".to_owned(),
            address: None,
        });
        let service = ControlService::new(config);

        let inventory = service.create_inventory().unwrap();
        let details = inventory
            .describe_instance("i-0abc", "eu-west-1")
            .await
            .unwrap();
        assert!(details.is_some());
    }

    #[tokio::test]
    async fn shutdown_before_run_stops_immediately() {
        let mut config = ControlConfig::default();
        config.database.url = String::new();
        config.server.listen = "127.0.0.1:0".parse().unwrap();
        config.execution.runner = RunnerKind::Mock;
        let service = ControlService::new(config);
        service.shutdown();

        tokio::time::timeout(Duration::from_secs(5), service.run())
            .await
            .unwrap()
            .unwrap();
    }
}
