//! Typestate pattern for the deployment state machine.
//!
//! This module encodes deployment states in the type system, making invalid
//! state transitions a compile-time error rather than a runtime error.
//!
//! ```text
//! Queued ──▶ Running ──▶ Success ──▶ Promoted
//!               │           │           │
//!               ▼           ▼           ▼
//!             Failed     RolledBack ◀───┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let queued = Deployment::<Queued>::create(data);
//! let running = queued.start(vm_id);
//! let success = running.succeed(Some(url));
//! // success.start(vm_id) would not compile - invalid transition
//! ```

use std::marker::PhantomData;

use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, VmId};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Accepted, waiting for a worker and a VM.
#[derive(Debug, Clone, Copy)]
pub struct Queued;

/// Executing on a VM.
#[derive(Debug, Clone, Copy)]
pub struct Running;

/// Executed successfully.
#[derive(Debug, Clone, Copy)]
pub struct Success;

/// Execution failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

/// Live release of a production environment.
#[derive(Debug, Clone, Copy)]
pub struct Promoted;

/// Superseded by a rollback.
#[derive(Debug, Clone, Copy)]
pub struct RolledBack;

macro_rules! impl_state {
    ($($marker:ident => $status:ident),* $(,)?) => {
        $(
            impl private::Sealed for $marker {}

            impl DeploymentState for $marker {
                fn status() -> DeploymentStatus {
                    DeploymentStatus::$status
                }
            }
        )*
    };
}

impl_state!(
    Queued => Queued,
    Running => Running,
    Success => Success,
    Failed => Failed,
    Promoted => Promoted,
    RolledBack => RolledBack,
);

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
///
/// The state parameter `S` determines which transitions are available.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Snapshot this deployment as a storable record.
    #[must_use]
    pub fn record(&self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data.clone(),
            status: S::status(),
        }
    }

    /// Convert into the underlying data (consuming the deployment).
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }

    fn assume<T: DeploymentState>(data: DeploymentData) -> Deployment<T> {
        Deployment {
            data,
            _state: PhantomData,
        }
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Queued> {
    /// Create a new deployment in the queued state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Bind the deployment to a VM and start executing.
    #[must_use]
    pub fn start(self, vm_id: VmId) -> Deployment<Running> {
        self.transition_with(|data| {
            data.vm_id = Some(vm_id);
        })
    }
}

impl Deployment<Running> {
    /// Record successful completion. Releases the VM binding.
    #[must_use]
    pub fn succeed(self, url: Option<String>) -> Deployment<Success> {
        self.transition_with(|data| {
            data.completed_at = Some(Utc::now());
            data.url = url;
            data.vm_id = None;
        })
    }

    /// Record failure. Releases the VM binding and keeps the logs.
    #[must_use]
    pub fn fail(self, error: String) -> Deployment<Failed> {
        self.transition_with(|data| {
            data.completed_at = Some(Utc::now());
            data.error = Some(error);
            data.vm_id = None;
        })
    }
}

impl Deployment<Success> {
    /// Mark this deployment as the live production release.
    ///
    /// A URL reported by the promotion job replaces the one recorded at
    /// success.
    #[must_use]
    pub fn promote(self, url: Option<String>) -> Deployment<Promoted> {
        self.transition_with(|data| {
            if url.is_some() {
                data.url = url;
            }
            data.error = None;
        })
    }

    /// Mark this deployment as superseded by a rollback.
    #[must_use]
    pub fn roll_back(self) -> Deployment<RolledBack> {
        self.transition_with(|_| {})
    }
}

impl Deployment<Promoted> {
    /// Mark this deployment as superseded by a rollback.
    #[must_use]
    pub fn roll_back(self) -> Deployment<RolledBack> {
        self.transition_with(|_| {})
    }
}

// =============================================================================
// Loading from persisted state
// =============================================================================

/// A type-erased deployment that can be in any state.
///
/// This is used when loading from storage where the state is not known at
/// compile time.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in queued state.
    Queued(Deployment<Queued>),
    /// Deployment in running state.
    Running(Deployment<Running>),
    /// Deployment in success state.
    Success(Deployment<Success>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
    /// Deployment in promoted state.
    Promoted(Deployment<Promoted>),
    /// Deployment in rolled-back state.
    RolledBack(Deployment<RolledBack>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from a stored record.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        let data = record.data;
        match record.status {
            DeploymentStatus::Queued => Self::Queued(Deployment::<Queued>::assume(data)),
            DeploymentStatus::Running => Self::Running(Deployment::<Running>::assume(data)),
            DeploymentStatus::Success => Self::Success(Deployment::<Success>::assume(data)),
            DeploymentStatus::Failed => Self::Failed(Deployment::<Failed>::assume(data)),
            DeploymentStatus::Promoted => Self::Promoted(Deployment::<Promoted>::assume(data)),
            DeploymentStatus::RolledBack => {
                Self::RolledBack(Deployment::<RolledBack>::assume(data))
            }
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Queued(d) => d.data(),
            Self::Running(d) => d.data(),
            Self::Success(d) => d.data(),
            Self::Failed(d) => d.data(),
            Self::Promoted(d) => d.data(),
            Self::RolledBack(d) => d.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Queued(_) => DeploymentStatus::Queued,
            Self::Running(_) => DeploymentStatus::Running,
            Self::Success(_) => DeploymentStatus::Success,
            Self::Failed(_) => DeploymentStatus::Failed,
            Self::Promoted(_) => DeploymentStatus::Promoted,
            Self::RolledBack(_) => DeploymentStatus::RolledBack,
        }
    }

    fn mismatch(&self, to: &'static str) -> ControlError {
        ControlError::InvalidStateTransition {
            from: self.status().as_str(),
            to,
        }
    }

    /// Try to extract a queued deployment.
    pub fn try_into_queued(self) -> ControlResult<Deployment<Queued>> {
        match self {
            Self::Queued(d) => Ok(d),
            other => Err(other.mismatch("running")),
        }
    }

    /// Try to extract a running deployment.
    pub fn try_into_running(self) -> ControlResult<Deployment<Running>> {
        match self {
            Self::Running(d) => Ok(d),
            other => Err(other.mismatch("success")),
        }
    }

    /// Try to extract a successful deployment.
    pub fn try_into_success(self) -> ControlResult<Deployment<Success>> {
        match self {
            Self::Success(d) => Ok(d),
            other => Err(other.mismatch("promoted")),
        }
    }

    /// Transition a successful or promoted deployment to rolled back.
    pub fn roll_back(self) -> ControlResult<Deployment<RolledBack>> {
        match self {
            Self::Success(d) => Ok(d.roll_back()),
            Self::Promoted(d) => Ok(d.roll_back()),
            other => Err(other.mismatch("rolled_back")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnvironmentId, ProjectId};

    fn test_data() -> DeploymentData {
        DeploymentData::new(
            ProjectId::new("test-project"),
            EnvironmentId::new("env-main"),
            "main".to_owned(),
            "abc123".to_owned(),
        )
    }

    #[test]
    fn happy_path_transitions() {
        let queued = Deployment::<Queued>::create(test_data());
        assert_eq!(queued.status(), DeploymentStatus::Queued);
        assert!(queued.data().completed_at.is_none());

        let running = queued.start(VmId::new("vm-1"));
        assert_eq!(running.status(), DeploymentStatus::Running);
        assert_eq!(running.data().vm_id, Some(VmId::new("vm-1")));
        assert!(running.data().completed_at.is_none());

        let success = running.succeed(Some("https://abc.example.com".to_owned()));
        assert_eq!(success.status(), DeploymentStatus::Success);
        assert!(success.data().completed_at.is_some());
        assert!(success.data().vm_id.is_none());

        let promoted = success.promote(None);
        assert_eq!(promoted.status(), DeploymentStatus::Promoted);
        assert_eq!(promoted.data().url.as_deref(), Some("https://abc.example.com"));

        let rolled_back = promoted.roll_back();
        assert_eq!(rolled_back.status(), DeploymentStatus::RolledBack);
    }

    #[test]
    fn failure_keeps_logs() {
        let mut data = test_data();
        data.logs = "step 1 ok\nstep 2: exit code 2\n".to_owned();
        let running = Deployment::<Queued>::create(data).start(VmId::new("vm-1"));

        let failed = running.fail("script exited with 2".to_owned());
        assert_eq!(failed.status(), DeploymentStatus::Failed);
        assert_eq!(failed.data().logs, "step 1 ok\nstep 2: exit code 2\n");
        assert_eq!(failed.data().error.as_deref(), Some("script exited with 2"));
        assert!(failed.data().completed_at.is_some());
        assert!(failed.data().vm_id.is_none());
    }

    #[test]
    fn record_roundtrip() {
        let data = test_data();
        let id = data.id.clone();

        let record = Deployment::<Queued>::create(data).start(VmId::new("vm-1")).record();
        assert_eq!(record.status, DeploymentStatus::Running);

        let any = AnyDeployment::from_record(record);
        assert_eq!(any.status(), DeploymentStatus::Running);
        assert_eq!(&any.data().id, &id);
        assert!(any.try_into_running().is_ok());
    }

    #[test]
    fn wrong_state_is_rejected() {
        let record = DeploymentRecord::new(test_data());
        let any = AnyDeployment::from_record(record);

        let err = any.try_into_success().unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "queued",
                to: "promoted"
            }
        ));
    }

    #[test]
    fn failed_cannot_roll_back() {
        let failed = Deployment::<Queued>::create(test_data())
            .start(VmId::new("vm-1"))
            .fail("boom".to_owned());
        let any = AnyDeployment::from_record(failed.record());
        assert!(any.roll_back().is_err());
    }
}
