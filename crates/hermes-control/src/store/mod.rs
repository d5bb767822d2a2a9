//! Storage backends.
//!
//! This module provides traits and implementations for persisting projects,
//! environments, deployments and pooled VMs. The primary implementation uses
//! PostgreSQL, but an in-memory implementation is provided for testing and
//! for running without a database.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, EnvVariable, Environment, EnvironmentId,
    Project, ProjectId, VmId, VmRecord,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by project ID.
    pub project_id: Option<ProjectId>,
    /// Filter by environment ID.
    pub environment_id: Option<EnvironmentId>,
    /// Filter by branch.
    pub branch: Option<String>,
    /// Match any of these statuses. Empty matches all.
    pub statuses: Vec<DeploymentStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            project_id: None,
            environment_id: None,
            branch: None,
            statuses: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Filter by project ID.
    #[must_use]
    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Filter by environment.
    #[must_use]
    pub fn with_environment(mut self, environment_id: EnvironmentId) -> Self {
        self.environment_id = Some(environment_id);
        self
    }

    /// Filter by branch.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Add a status to match.
    #[must_use]
    pub fn with_status(mut self, status: DeploymentStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether a record passes this filter, ignoring limit and offset.
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.project_id
            .as_ref()
            .is_none_or(|p| p == &record.data.project_id)
            && self
                .environment_id
                .as_ref()
                .is_none_or(|e| e == &record.data.environment_id)
            && self.branch.as_ref().is_none_or(|b| b == &record.data.branch)
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
    }
}

/// Backend for projects, environments and environment variables.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a new project.
    async fn insert_project(&self, project: &Project) -> ControlResult<()>;

    /// Get a project by ID.
    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>>;

    /// List all projects, oldest first.
    async fn list_projects(&self) -> ControlResult<Vec<Project>>;

    /// Delete a project and everything it owns.
    ///
    /// Environments, variables, deployments and live pointers are removed with
    /// it. Fails with `Conflict` while any of its deployments is queued or
    /// running, and with `NotFound` if the project does not exist.
    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()>;

    /// Insert a new environment.
    ///
    /// Fails with `NotFound` if the project does not exist and with
    /// `Conflict` if another environment already binds the same branch.
    async fn insert_environment(&self, environment: &Environment) -> ControlResult<()>;

    /// Get an environment by ID.
    async fn get_environment(&self, id: &EnvironmentId) -> ControlResult<Option<Environment>>;

    /// Find the environment bound to a branch of a project.
    async fn find_environment(
        &self,
        project_id: &ProjectId,
        branch: &str,
    ) -> ControlResult<Option<Environment>>;

    /// List the environments of a project, oldest first.
    async fn list_environments(&self, project_id: &ProjectId) -> ControlResult<Vec<Environment>>;

    /// Delete an environment and its variables.
    ///
    /// Fails with `Conflict` if any deployment still references it.
    async fn delete_environment(&self, id: &EnvironmentId) -> ControlResult<()>;

    /// Insert or replace a variable.
    async fn set_variable(&self, variable: &EnvVariable) -> ControlResult<()>;

    /// List the variables of an environment, ordered by key.
    async fn list_variables(&self, environment_id: &EnvironmentId)
        -> ControlResult<Vec<EnvVariable>>;

    /// Delete a variable.
    async fn delete_variable(&self, environment_id: &EnvironmentId, key: &str)
        -> ControlResult<()>;
}

/// Backend for storing deployment records.
///
/// Implementations must ensure that all operations are atomic and durable.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record.
    ///
    /// Fails with `Conflict` if the environment already has a queued or
    /// running deployment, and with `NotFound` if the environment does not
    /// exist. Nothing is written on failure.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Compare-and-set a deployment's status.
    ///
    /// Writes the record's status, timestamps, URL, VM binding and error only
    /// if the stored status equals `from`. Logs are not touched; use
    /// [`DeploymentStore::append_log`]. Returns `false` when the stored status
    /// differs.
    async fn transition(
        &self,
        record: &DeploymentRecord,
        from: DeploymentStatus,
    ) -> ControlResult<bool>;

    /// Append execution output to a deployment's logs.
    async fn append_log(&self, id: &DeploymentId, chunk: &str) -> ControlResult<()>;

    /// List deployments matching the filter criteria.
    ///
    /// Results are ordered by `created_at` descending (newest first).
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Get the deployment currently serving an environment.
    async fn get_live(&self, environment_id: &EnvironmentId)
        -> ControlResult<Option<DeploymentRecord>>;

    /// Point an environment at the deployment now serving it.
    async fn set_live(
        &self,
        environment_id: &EnvironmentId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<()>;

    /// Clear the live pointer of an environment.
    async fn clear_live(&self, environment_id: &EnvironmentId) -> ControlResult<()>;
}

/// Backend for pooled VM records.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Insert or replace a VM record.
    async fn upsert_vm(&self, vm: &VmRecord) -> ControlResult<()>;

    /// List all VM records, oldest registration first.
    async fn list_vms(&self) -> ControlResult<Vec<VmRecord>>;

    /// Delete a VM record.
    async fn delete_vm(&self, id: &VmId) -> ControlResult<()>;
}

/// Everything the control plane persists.
pub trait Store: CatalogStore + DeploymentStore + VmStore {}

impl<T: CatalogStore + DeploymentStore + VmStore> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentData;

    #[test]
    fn filter_matches_any_listed_status() {
        let mut record = DeploymentRecord::new(DeploymentData::new(
            ProjectId::new("p1"),
            EnvironmentId::new("e1"),
            "main".to_owned(),
            "abc".to_owned(),
        ));

        let good = DeploymentFilter::new()
            .with_environment(EnvironmentId::new("e1"))
            .with_status(DeploymentStatus::Success)
            .with_status(DeploymentStatus::Promoted);
        assert!(!good.matches(&record));

        record.status = DeploymentStatus::Promoted;
        assert!(good.matches(&record));

        let other_branch = DeploymentFilter::new().with_branch("develop");
        assert!(!other_branch.matches(&record));
        assert!(DeploymentFilter::new().matches(&record));
    }
}
