//! Hermes Control Plane
//!
//! This crate provides the deployment orchestration engine for Hermes. It
//! turns "deploy commit C of branch B of project P" into an executed
//! deployment on a pooled VM, and tracks what is live in every environment.
//!
//! # Architecture
//!
//! The control plane is responsible for:
//!
//! - **Environment resolution**: mapping a pushed branch to the environment
//!   bound to it
//! - **VM pooling**: handing each job exclusive use of a registered executor
//!   and sweeping the cloud inventory for instances that went away
//! - **Dispatch**: running queued jobs on a worker pool, one job per
//!   environment at a time, with backoff when no VM is free
//! - **Promotion and rollback**: gating what becomes live in production and
//!   re-deploying an earlier good commit
//! - **API surface**: HTTP endpoints for the catalog, deployments and pool
//!
//! # State Machine
//!
//! Deployments follow a strict state machine enforced at compile time using
//! the typestate pattern:
//!
//! ```text
//! Queued ──▶ Running ──▶ Success ──▶ Promoted
//!               │           │           │
//!               ▼           └─────┬─────┘
//!             Failed              ▼
//!                            RolledBack
//! ```
//!
//! Invalid state transitions are caught at compile time, not runtime.
//!
//! # Example
//!
//! ```
//! use hermes_control::{
//!     Deployment, Queued,
//!     types::{DeploymentData, EnvironmentId, ProjectId, VmId},
//! };
//!
//! let data = DeploymentData::new(
//!     ProjectId::new("site"),
//!     EnvironmentId::new("staging"),
//!     "develop".to_owned(),
//!     "abc1234".to_owned(),
//! );
//!
//! let queued = Deployment::<Queued>::create(data);
//! let running = queued.start(VmId::new("vm-1"));
//! let success = running.succeed(Some("https://abc1234.staging.example.com".to_owned()));
//!
//! // This would not compile:
//! // let invalid = success.start(VmId::new("vm-2")); // Error!
//! # let _ = success;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod deployment;
pub mod dispatch;
pub mod error;
pub mod inventory;
pub mod pool;
pub mod resolver;
pub mod runner;
pub mod service;
pub mod source;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use catalog::Catalog;
pub use config::ControlConfig;
pub use deployment::{DeploymentManager, DeploymentRequest, PromotionGate, RollbackController};
pub use dispatch::{DispatchQueue, Dispatcher, Job};
pub use error::{ControlError, ControlResult, ErrorKind, RejectReason};
pub use inventory::{CloudInventory, HttpInventory, StaticInventory};
pub use pool::VmPool;
pub use resolver::EnvironmentResolver;
pub use runner::{ExecutionRunner, MockRunner, ScriptRunner};
pub use service::ControlService;
pub use source::{GitSource, SourceProvider};
pub use state::{
    AnyDeployment, Deployment, DeploymentState, Failed, Promoted, Queued, RolledBack, Running,
    Success,
};
pub use store::{DeploymentFilter, MemoryStore, PostgresStore, Store};
pub use types::{
    DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, EnvironmentId, ProjectId,
    VmId, VmRecord,
};
