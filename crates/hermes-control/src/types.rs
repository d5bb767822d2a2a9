//! Core types for hermes-control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a project.
    ProjectId
);
string_id!(
    /// Unique identifier for an environment.
    EnvironmentId
);
string_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);
string_id!(
    /// Unique identifier for a pooled VM.
    VmId
);

fn require(field: &str, value: &str) -> ControlResult<()> {
    if value.trim().is_empty() {
        return Err(ControlError::invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

/// A project linked to a source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project identifier.
    pub id: ProjectId,
    /// Display name.
    pub name: String,
    /// Repository the project deploys from.
    pub repo_url: String,
    /// When the project was registered.
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project, validating its fields.
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>) -> ControlResult<Self> {
        let name = name.into();
        let repo_url = repo_url.into();
        require("project name", &name)?;
        require("repository URL", &repo_url)?;

        Ok(Self {
            id: ProjectId::generate(),
            name,
            repo_url,
            created_at: Utc::now(),
        })
    }
}

/// Fields supplied when defining an environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment name (e.g. "production", "staging").
    pub name: String,
    /// Branch bound to this environment.
    pub branch: String,
    /// Whether releases need promotion before going live.
    #[serde(default)]
    pub is_production: bool,
    /// Public domain served by this environment.
    #[serde(default)]
    pub domain: Option<String>,
    /// Region whose VMs execute deployments; falls back to the pool default.
    #[serde(default)]
    pub region: Option<String>,
}

/// A branch-bound deployment target within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Unique environment identifier.
    pub id: EnvironmentId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Environment name.
    pub name: String,
    /// Branch bound to this environment (unique within the project).
    pub branch: String,
    /// Production flag. Fixed at creation.
    pub is_production: bool,
    /// Public domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Execution region override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// When the environment was created.
    pub created_at: DateTime<Utc>,
}

impl Environment {
    /// Create a new environment for a project, validating its fields.
    pub fn new(project_id: ProjectId, spec: EnvironmentSpec) -> ControlResult<Self> {
        require("environment name", &spec.name)?;
        require("branch", &spec.branch)?;

        Ok(Self {
            id: EnvironmentId::generate(),
            project_id,
            name: spec.name,
            branch: spec.branch,
            is_production: spec.is_production,
            domain: spec.domain.filter(|d| !d.trim().is_empty()),
            region: spec.region.filter(|r| !r.trim().is_empty()),
            created_at: Utc::now(),
        })
    }

    /// The region deployments to this environment execute in.
    #[must_use]
    pub fn region_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.region.as_deref().unwrap_or(default)
    }
}

/// A configuration value scoped to one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    /// Owning environment.
    pub environment_id: EnvironmentId,
    /// Variable name (unique within the environment).
    pub key: String,
    /// Variable value.
    pub value: String,
}

impl EnvVariable {
    /// Create a new variable, validating the key.
    pub fn new(
        environment_id: EnvironmentId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> ControlResult<Self> {
        let key = key.into();
        require("variable key", &key)?;
        if key.contains('=') || key.chars().any(char::is_whitespace) {
            return Err(ControlError::invalid(format!(
                "variable key '{key}' must not contain '=' or whitespace"
            )));
        }

        Ok(Self {
            environment_id,
            key,
            value: value.into(),
        })
    }
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Executing on a VM.
    Running,
    /// Executed successfully.
    Success,
    /// Execution failed.
    Failed,
    /// Promoted to be the live release of a production environment.
    Promoted,
    /// Superseded by a rollback.
    RolledBack,
}

impl DeploymentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Running,
        Self::Success,
        Self::Failed,
        Self::Promoted,
        Self::RolledBack,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Queued or running.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Execution has finished; `completed_at` is set.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        !self.is_in_flight()
    }

    /// No further transition is possible for this record.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Promoted | Self::RolledBack)
    }

    /// A known-good state that a rollback may restore.
    #[must_use]
    pub const fn is_good(&self) -> bool {
        matches!(self, Self::Success | Self::Promoted)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "promoted" => Ok(Self::Promoted),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Shortest abbreviated commit hash accepted.
pub const MIN_COMMIT_HASH_LEN: usize = 4;

/// Full length of a SHA-1 commit hash in hex.
pub const MAX_COMMIT_HASH_LEN: usize = 40;

/// Check that `commit` is a full or abbreviated hex commit hash.
///
/// Abbreviations down to [`MIN_COMMIT_HASH_LEN`] digits are accepted; they
/// are resolved against the repository when the job runs.
pub fn validate_commit_hash(commit: &str) -> ControlResult<()> {
    if commit.is_empty() {
        return Err(ControlError::invalid("commit hash must not be empty"));
    }
    if !(MIN_COMMIT_HASH_LEN..=MAX_COMMIT_HASH_LEN).contains(&commit.len())
        || !commit.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ControlError::invalid(format!(
            "'{commit}' is not a commit hash \
             (need {MIN_COMMIT_HASH_LEN} to {MAX_COMMIT_HASH_LEN} hex digits)"
        )));
    }
    Ok(())
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Project this deployment belongs to.
    pub project_id: ProjectId,
    /// Environment resolved from the branch at creation.
    pub environment_id: EnvironmentId,
    /// Branch being deployed.
    pub branch: String,
    /// Commit being deployed.
    pub commit_hash: String,
    /// Append-only execution output.
    pub logs: String,
    /// When the deployment was accepted.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// When execution finished. Unset while queued or running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Public URL reported on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// VM executing this deployment while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    /// Deployment this one rolls back, if it was created by a rollback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<DeploymentId>,
    /// Failure summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentData {
    /// Create new deployment data bound to a resolved environment.
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        environment_id: EnvironmentId,
        branch: String,
        commit_hash: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            project_id,
            environment_id,
            branch,
            commit_hash,
            logs: String::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            url: None,
            vm_id: None,
            rollback_of: None,
            error: None,
        }
    }

    /// Short form of the commit hash for log output.
    #[must_use]
    pub fn short_commit(&self) -> &str {
        let end = self
            .commit_hash
            .char_indices()
            .nth(7)
            .map_or(self.commit_hash.len(), |(i, _)| i);
        &self.commit_hash[..end]
    }

    /// Whether `self` was created strictly before `other`.
    ///
    /// Ties on the timestamp are broken by identifier order.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        (self.created_at, &self.id) < (other.created_at, &other.id)
    }
}

/// A deployment as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new deployment record in the queued state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Queued,
        }
    }

    /// The kind of job that executes this deployment.
    #[must_use]
    pub fn job_kind(&self) -> JobKind {
        if self.data.rollback_of.is_some() {
            JobKind::Rollback
        } else {
            JobKind::Deploy
        }
    }
}

/// Kind of work carried by a dispatch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Ship a commit to an environment.
    Deploy,
    /// Make a successful production deployment live.
    Promote,
    /// Re-apply an earlier commit, superseding a later deployment.
    Rollback,
}

impl JobKind {
    /// Get the kind as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Promote => "promote",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Availability of a pooled VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Free to be acquired.
    Available,
    /// Bound to exactly one job.
    Busy,
    /// Instance reported gone; excluded until re-registered.
    Unreachable,
}

impl VmStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "unreachable" => Ok(Self::Unreachable),
            _ => Err(format!("unknown VM status: {s}")),
        }
    }
}

/// Lifecycle state of a cloud instance as reported by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped but recoverable.
    Stopped,
    /// Being terminated.
    ShuttingDown,
    /// Gone.
    Terminated,
    /// Any state this service does not recognise.
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// Whether a VM backed by this instance can take work.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Instance details cached from the last inventory check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    /// Instance state.
    pub state: InstanceState,
    /// Reachable address, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Instance type (e.g. "t3.medium").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// When these details were fetched.
    pub checked_at: DateTime<Utc>,
}

/// The job currently holding a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLease {
    /// Deployment the job executes. Weak reference.
    pub deployment_id: DeploymentId,
    /// Kind of job.
    pub kind: JobKind,
}

/// A reusable executor registered with the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Pool identifier.
    pub id: VmId,
    /// Cloud instance identifier.
    pub instance_id: String,
    /// Region the instance lives in.
    pub region: String,
    /// Availability.
    pub status: VmStatus,
    /// Job occupying this VM. Set iff `status` is busy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<VmLease>,
    /// Cached inventory details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceDetails>,
    /// When the VM was registered.
    pub registered_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    /// Create a new available VM record.
    pub fn new(
        instance_id: impl Into<String>,
        region: impl Into<String>,
        instance: Option<InstanceDetails>,
    ) -> ControlResult<Self> {
        let instance_id = instance_id.into();
        let region = region.into();
        require("instance id", &instance_id)?;
        require("region", &region)?;

        let now = Utc::now();
        Ok(Self {
            id: VmId::generate(),
            instance_id,
            region,
            status: VmStatus::Available,
            lease: None,
            instance,
            registered_at: now,
            updated_at: now,
        })
    }

    /// The deployment currently occupying this VM.
    #[must_use]
    pub fn current_deployment_id(&self) -> Option<&DeploymentId> {
        self.lease.as_ref().map(|l| &l.deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_strings() {
        for status in DeploymentStatus::ALL {
            let parsed: DeploymentStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("superseded".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn status_classes() {
        assert!(DeploymentStatus::Queued.is_in_flight());
        assert!(DeploymentStatus::Running.is_in_flight());
        assert!(!DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Success.is_completed());
        assert!(DeploymentStatus::RolledBack.is_terminal());
        assert!(DeploymentStatus::Promoted.is_good());
        assert!(!DeploymentStatus::Failed.is_good());
    }

    #[test]
    fn commit_hash_forms() {
        assert!(validate_commit_hash("abc123").is_ok());
        assert!(validate_commit_hash("ABC1").is_ok());
        assert!(validate_commit_hash("0123456789abcdef0123456789abcdef01234567").is_ok());

        for bad in ["", "abc", "main", "abc123 ", "main; rm -rf /", &"a".repeat(41)] {
            let err = validate_commit_hash(bad).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput, "{bad:?}");
        }
    }

    #[test]
    fn project_rejects_blank_fields() {
        assert!(Project::new("", "https://example.com/repo.git").is_err());
        assert!(Project::new("site", "  ").is_err());
        let project = Project::new("site", "https://example.com/repo.git").unwrap();
        assert_eq!(project.name, "site");
    }

    #[test]
    fn environment_normalises_optional_fields() {
        let env = Environment::new(
            ProjectId::new("p1"),
            EnvironmentSpec {
                name: "production".to_owned(),
                branch: "main".to_owned(),
                is_production: true,
                domain: Some(String::new()),
                region: Some("eu-west-1".to_owned()),
            },
        )
        .unwrap();

        assert!(env.domain.is_none());
        assert_eq!(env.region_or("us-east-1"), "eu-west-1");
    }

    #[test]
    fn variable_key_validation() {
        let env = EnvironmentId::new("e1");
        assert!(EnvVariable::new(env.clone(), "DATABASE_URL", "postgres://").is_ok());
        assert!(EnvVariable::new(env.clone(), "BAD KEY", "x").is_err());
        assert!(EnvVariable::new(env, "A=B", "x").is_err());
    }

    #[test]
    fn short_commit_truncates() {
        let data = DeploymentData::new(
            ProjectId::new("p1"),
            EnvironmentId::new("e1"),
            "main".to_owned(),
            "abc123def456".to_owned(),
        );
        assert_eq!(data.short_commit(), "abc123d");
    }

    #[test]
    fn older_than_breaks_ties_by_id() {
        let mut a = DeploymentData::new(
            ProjectId::new("p1"),
            EnvironmentId::new("e1"),
            "main".to_owned(),
            "a".to_owned(),
        );
        let mut b = a.clone();
        a.id = DeploymentId::new("01a");
        b.id = DeploymentId::new("01b");
        assert!(a.is_older_than(&b));
        assert!(!b.is_older_than(&a));
        assert!(!a.is_older_than(&a));
    }

    #[test]
    fn unknown_instance_state_deserialises() {
        let state: InstanceState = serde_json::from_str("\"hibernating\"").unwrap();
        assert_eq!(state, InstanceState::Unknown);
        assert!(!state.is_usable());
    }
}
