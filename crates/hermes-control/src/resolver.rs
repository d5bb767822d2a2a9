//! Branch to environment resolution.

use std::sync::Arc;

use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::store::Store;
use crate::types::{Environment, ProjectId};

/// Maps a `(project, branch)` pair to the one environment bound to it.
#[derive(Clone)]
pub struct EnvironmentResolver {
    store: Arc<dyn Store>,
}

impl EnvironmentResolver {
    /// Create a resolver over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the environment a branch deploys to.
    ///
    /// Fails with `NotFound` when the project does not exist or no
    /// environment is bound to the branch.
    pub async fn resolve(&self, project_id: &ProjectId, branch: &str) -> ControlResult<Environment> {
        if self.store.get_project(project_id).await?.is_none() {
            return Err(ControlError::not_found(ResourceKind::Project, project_id));
        }

        self.store
            .find_environment(project_id, branch)
            .await?
            .ok_or_else(|| {
                ControlError::not_found(ResourceKind::Environment, format!("{project_id}/{branch}"))
            })
    }
}

impl std::fmt::Debug for EnvironmentResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentResolver").finish_non_exhaustive()
    }
}
