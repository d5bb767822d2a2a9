//! Configuration for hermes-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

const ENV_PREFIX: &str = "HERMES_CONTROL_";

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Dispatch queue and worker configuration.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Execution runner configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// VM pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cloud inventory configuration.
    #[serde(default)]
    pub inventory: InventoryConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `HERMES_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file("control.toml"))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8084)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Empty selects the in-memory store.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Refuse to start when the database is unreachable instead of falling
    /// back to the in-memory store.
    #[serde(default)]
    pub required: bool,
}

fn default_database_url() -> String {
    "postgres://localhost/hermes".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl DatabaseConfig {
    /// Connection timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            required: false,
        }
    }
}

/// Dispatch queue and worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Number of dispatch workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Jobs accepted before new deployments are turned away.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any backoff delay in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Runner attempts before a transient failure becomes fatal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

const fn default_workers() -> usize {
    4
}

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_backoff_base_ms() -> u64 {
    500
}

const fn default_backoff_max_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    3
}

impl DispatchConfig {
    /// Backoff policy built from this configuration.
    #[must_use]
    pub const fn backoff(&self) -> crate::dispatch::Backoff {
        crate::dispatch::Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Which runner executes jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// Run a shell script against a fetched checkout.
    #[default]
    Script,

    /// Succeed immediately without touching any VM.
    Mock,
}

/// Where the script runner gets source code from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Check the commit out of a cached clone of the project repository.
    #[default]
    Git,

    /// Hand the script an empty workspace.
    None,
}

/// Execution runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Runner implementation.
    #[serde(default)]
    pub runner: RunnerKind,

    /// Source provider used by the script runner.
    #[serde(default)]
    pub source: SourceKind,

    /// Shell command run inside the workspace.
    #[serde(default = "default_script")]
    pub script: String,

    /// Timeout for one runner attempt in seconds.
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,

    /// Template for the public URL of a successful deployment.
    ///
    /// Supports `{deployment_id}`, `{commit}`, `{short_commit}`, `{branch}`,
    /// `{environment}` and `{domain}`.
    #[serde(default)]
    pub url_template: Option<String>,

    /// Directory workspaces are created under.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
}

fn default_script() -> String {
    "./deploy.sh".to_owned()
}

const fn default_execution_timeout_secs() -> u64 {
    900 // 15 minutes
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/hermes/workspaces")
}

impl ExecutionConfig {
    /// Timeout for one runner attempt.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            runner: RunnerKind::default(),
            source: SourceKind::default(),
            script: default_script(),
            timeout_secs: default_execution_timeout_secs(),
            url_template: None,
            workspace_root: default_workspace_root(),
        }
    }
}

/// VM pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Region used by environments without their own.
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Seconds between inventory sweeps.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

const fn default_health_check_interval_secs() -> u64 {
    60
}

impl PoolConfig {
    /// Interval between inventory sweeps.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

/// Type of cloud inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryKind {
    /// Fixed table of instances from configuration.
    #[default]
    Static,

    /// HTTP inventory API.
    Http,
}

/// An instance listed in a static inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticInstance {
    /// Cloud instance identifier.
    pub instance_id: String,
    /// Region the instance lives in.
    pub region: String,
    /// Reachable address.
    #[serde(default)]
    pub address: Option<String>,
}

/// Cloud inventory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    /// Inventory implementation.
    #[serde(default)]
    pub kind: InventoryKind,

    /// Base URL of the HTTP inventory API.
    #[serde(default = "default_inventory_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_inventory_timeout_secs")]
    pub timeout_secs: u64,

    /// Instances known to a static inventory.
    #[serde(default)]
    pub instances: Vec<StaticInstance>,
}

fn default_inventory_url() -> String {
    "http://localhost:8090".to_owned()
}

const fn default_inventory_timeout_secs() -> u64 {
    10
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            kind: InventoryKind::default(),
            url: default_inventory_url(),
            timeout_secs: default_inventory_timeout_secs(),
            instances: Vec::new(),
        }
    }
}
