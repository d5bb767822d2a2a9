//! Projects, environments and environment variables.

use std::sync::Arc;

use tracing::info;

use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::store::Store;
use crate::types::{
    EnvVariable, Environment, EnvironmentId, EnvironmentSpec, Project, ProjectId,
};

/// CRUD over the configuration the orchestration core reads.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<dyn Store>,
}

impl Catalog {
    /// Create a catalog over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register a project.
    pub async fn create_project(&self, name: &str, repo_url: &str) -> ControlResult<Project> {
        let project = Project::new(name.trim(), repo_url.trim())?;
        self.store.insert_project(&project).await?;
        info!(project_id = %project.id, name = %project.name, "project created");
        Ok(project)
    }

    /// List all projects.
    pub async fn list_projects(&self) -> ControlResult<Vec<Project>> {
        self.store.list_projects().await
    }

    /// Get a project.
    pub async fn get_project(&self, id: &ProjectId) -> ControlResult<Project> {
        self.store
            .get_project(id)
            .await?
            .ok_or_else(|| ControlError::not_found(ResourceKind::Project, id))
    }

    /// Delete a project with its environments and deployments.
    pub async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        self.store.delete_project(id).await?;
        info!(project_id = %id, "project deleted");
        Ok(())
    }

    /// Define an environment for a project.
    pub async fn create_environment(
        &self,
        project_id: &ProjectId,
        spec: EnvironmentSpec,
    ) -> ControlResult<Environment> {
        let environment = Environment::new(project_id.clone(), spec)?;
        self.store.insert_environment(&environment).await?;
        info!(
            project_id = %project_id,
            environment_id = %environment.id,
            name = %environment.name,
            branch = %environment.branch,
            production = environment.is_production,
            "environment created"
        );
        Ok(environment)
    }

    /// List a project's environments.
    pub async fn list_environments(&self, project_id: &ProjectId) -> ControlResult<Vec<Environment>> {
        self.get_project(project_id).await?;
        self.store.list_environments(project_id).await
    }

    /// Get an environment, requiring it to belong to the project.
    pub async fn get_environment(
        &self,
        project_id: &ProjectId,
        id: &EnvironmentId,
    ) -> ControlResult<Environment> {
        self.store
            .get_environment(id)
            .await?
            .filter(|e| &e.project_id == project_id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Environment, id))
    }

    /// Delete an environment that has no deployments.
    pub async fn delete_environment(
        &self,
        project_id: &ProjectId,
        id: &EnvironmentId,
    ) -> ControlResult<()> {
        self.get_environment(project_id, id).await?;
        self.store.delete_environment(id).await?;
        info!(project_id = %project_id, environment_id = %id, "environment deleted");
        Ok(())
    }

    /// Set a variable, replacing any existing value for the key.
    pub async fn set_variable(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        key: &str,
        value: &str,
    ) -> ControlResult<EnvVariable> {
        self.get_environment(project_id, environment_id).await?;
        let variable = EnvVariable::new(environment_id.clone(), key.trim(), value)?;
        self.store.set_variable(&variable).await?;
        info!(environment_id = %environment_id, key = %variable.key, "variable set");
        Ok(variable)
    }

    /// List an environment's variables, ordered by key.
    pub async fn list_variables(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> ControlResult<Vec<EnvVariable>> {
        self.get_environment(project_id, environment_id).await?;
        self.store.list_variables(environment_id).await
    }

    /// Delete a variable.
    pub async fn delete_variable(
        &self,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        key: &str,
    ) -> ControlResult<()> {
        self.get_environment(project_id, environment_id).await?;
        self.store.delete_variable(environment_id, key).await
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}
