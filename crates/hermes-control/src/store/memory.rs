//! In-memory store for tests and database-less runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, EnvVariable, Environment, EnvironmentId,
    Project, ProjectId, VmId, VmRecord,
};

use super::{CatalogStore, DeploymentFilter, DeploymentStore, VmStore};

#[derive(Debug, Default)]
struct State {
    projects: HashMap<ProjectId, Project>,
    environments: HashMap<EnvironmentId, Environment>,
    variables: HashMap<EnvironmentId, BTreeMap<String, String>>,
    deployments: HashMap<DeploymentId, DeploymentRecord>,
    live: HashMap<EnvironmentId, DeploymentId>,
    vms: HashMap<VmId, VmRecord>,
}

/// In-memory store.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits. All tables sit behind one lock so cascades and
/// uniqueness checks are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

fn sorted_by_creation<T>(mut items: Vec<T>, key: impl Fn(&T) -> chrono::DateTime<Utc>) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn insert_project(&self, project: &Project) -> ControlResult<()> {
        let mut state = self.write()?;
        if state.projects.contains_key(&project.id) {
            return Err(ControlError::conflict(format!(
                "project {} already exists",
                project.id
            )));
        }
        state.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>> {
        Ok(self.read()?.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> ControlResult<Vec<Project>> {
        let projects: Vec<Project> = self.read()?.projects.values().cloned().collect();
        Ok(sorted_by_creation(projects, |p: &Project| p.created_at))
    }

    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.projects.contains_key(id) {
            return Err(ControlError::not_found(ResourceKind::Project, id));
        }

        let busy = state
            .deployments
            .values()
            .any(|d| &d.data.project_id == id && d.status.is_in_flight());
        if busy {
            return Err(ControlError::conflict(format!(
                "project {id} has deployments in flight"
            )));
        }

        let environments: Vec<EnvironmentId> = state
            .environments
            .values()
            .filter(|e| &e.project_id == id)
            .map(|e| e.id.clone())
            .collect();
        for env_id in &environments {
            state.environments.remove(env_id);
            state.variables.remove(env_id);
            state.live.remove(env_id);
        }
        state.deployments.retain(|_, d| &d.data.project_id != id);
        state.projects.remove(id);

        Ok(())
    }

    async fn insert_environment(&self, environment: &Environment) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.projects.contains_key(&environment.project_id) {
            return Err(ControlError::not_found(
                ResourceKind::Project,
                &environment.project_id,
            ));
        }

        let taken = state.environments.values().any(|e| {
            e.project_id == environment.project_id && e.branch == environment.branch
        });
        if taken {
            return Err(ControlError::conflict(format!(
                "branch '{}' is already bound to an environment of project {}",
                environment.branch, environment.project_id
            )));
        }

        state
            .environments
            .insert(environment.id.clone(), environment.clone());
        Ok(())
    }

    async fn get_environment(&self, id: &EnvironmentId) -> ControlResult<Option<Environment>> {
        Ok(self.read()?.environments.get(id).cloned())
    }

    async fn find_environment(
        &self,
        project_id: &ProjectId,
        branch: &str,
    ) -> ControlResult<Option<Environment>> {
        Ok(self
            .read()?
            .environments
            .values()
            .find(|e| &e.project_id == project_id && e.branch == branch)
            .cloned())
    }

    async fn list_environments(&self, project_id: &ProjectId) -> ControlResult<Vec<Environment>> {
        let environments: Vec<Environment> = self
            .read()?
            .environments
            .values()
            .filter(|e| &e.project_id == project_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(environments, |e: &Environment| {
            e.created_at
        }))
    }

    async fn delete_environment(&self, id: &EnvironmentId) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.environments.contains_key(id) {
            return Err(ControlError::not_found(ResourceKind::Environment, id));
        }

        if state
            .deployments
            .values()
            .any(|d| &d.data.environment_id == id)
        {
            return Err(ControlError::conflict(format!(
                "environment {id} still has deployments"
            )));
        }

        state.environments.remove(id);
        state.variables.remove(id);
        state.live.remove(id);
        Ok(())
    }

    async fn set_variable(&self, variable: &EnvVariable) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.environments.contains_key(&variable.environment_id) {
            return Err(ControlError::not_found(
                ResourceKind::Environment,
                &variable.environment_id,
            ));
        }

        state
            .variables
            .entry(variable.environment_id.clone())
            .or_default()
            .insert(variable.key.clone(), variable.value.clone());
        Ok(())
    }

    async fn list_variables(
        &self,
        environment_id: &EnvironmentId,
    ) -> ControlResult<Vec<EnvVariable>> {
        let state = self.read()?;
        Ok(state
            .variables
            .get(environment_id)
            .map(|vars| {
                vars.iter()
                    .map(|(key, value)| EnvVariable {
                        environment_id: environment_id.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_variable(
        &self,
        environment_id: &EnvironmentId,
        key: &str,
    ) -> ControlResult<()> {
        let mut state = self.write()?;
        let removed = state
            .variables
            .get_mut(environment_id)
            .and_then(|vars| vars.remove(key));

        match removed {
            Some(_) => Ok(()),
            None => Err(ControlError::not_found(
                ResourceKind::Variable,
                format!("{environment_id}/{key}"),
            )),
        }
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut state = self.write()?;

        if state.deployments.contains_key(&record.data.id) {
            return Err(ControlError::conflict(format!(
                "deployment {} already exists",
                record.data.id
            )));
        }

        if !state.environments.contains_key(&record.data.environment_id) {
            return Err(ControlError::not_found(
                ResourceKind::Environment,
                &record.data.environment_id,
            ));
        }

        let in_flight = state.deployments.values().find(|d| {
            d.data.environment_id == record.data.environment_id && d.status.is_in_flight()
        });
        if let Some(existing) = in_flight {
            return Err(ControlError::conflict(format!(
                "environment {} already has deployment {} {}",
                record.data.environment_id, existing.data.id, existing.status
            )));
        }

        state
            .deployments
            .insert(record.data.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id).cloned())
    }

    async fn transition(
        &self,
        record: &DeploymentRecord,
        from: DeploymentStatus,
    ) -> ControlResult<bool> {
        let mut state = self.write()?;

        let stored = state
            .deployments
            .get_mut(&record.data.id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Deployment, &record.data.id))?;

        if stored.status != from {
            return Ok(false);
        }

        stored.status = record.status;
        stored.data.completed_at = record.data.completed_at;
        stored.data.url.clone_from(&record.data.url);
        stored.data.vm_id.clone_from(&record.data.vm_id);
        stored.data.error.clone_from(&record.data.error);
        stored.data.updated_at = record.data.updated_at;

        Ok(true)
    }

    async fn append_log(&self, id: &DeploymentId, chunk: &str) -> ControlResult<()> {
        let mut state = self.write()?;

        let stored = state
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found(ResourceKind::Deployment, id))?;

        stored.data.logs.push_str(chunk);
        stored.data.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let state = self.read()?;

        let mut results: Vec<_> = state
            .deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            (b.data.created_at, &b.data.id).cmp(&(a.data.created_at, &a.data.id))
        });

        #[allow(clippy::as_conversions)]
        let offset = filter.offset.unwrap_or(0) as usize;
        let results = results.into_iter().skip(offset);

        if let Some(limit) = filter.limit {
            #[allow(clippy::as_conversions)]
            Ok(results.take(limit as usize).collect())
        } else {
            Ok(results.collect())
        }
    }

    async fn get_live(
        &self,
        environment_id: &EnvironmentId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let state = self.read()?;
        Ok(state
            .live
            .get(environment_id)
            .and_then(|id| state.deployments.get(id))
            .cloned())
    }

    async fn set_live(
        &self,
        environment_id: &EnvironmentId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<()> {
        let mut state = self.write()?;
        if !state.deployments.contains_key(deployment_id) {
            return Err(ControlError::not_found(
                ResourceKind::Deployment,
                deployment_id,
            ));
        }
        state
            .live
            .insert(environment_id.clone(), deployment_id.clone());
        Ok(())
    }

    async fn clear_live(&self, environment_id: &EnvironmentId) -> ControlResult<()> {
        self.write()?.live.remove(environment_id);
        Ok(())
    }
}

#[async_trait]
impl VmStore for MemoryStore {
    async fn upsert_vm(&self, vm: &VmRecord) -> ControlResult<()> {
        self.write()?.vms.insert(vm.id.clone(), vm.clone());
        Ok(())
    }

    async fn list_vms(&self) -> ControlResult<Vec<VmRecord>> {
        let vms: Vec<VmRecord> = self.read()?.vms.values().cloned().collect();
        Ok(sorted_by_creation(vms, |vm: &VmRecord| vm.registered_at))
    }

    async fn delete_vm(&self, id: &VmId) -> ControlResult<()> {
        match self.write()?.vms.remove(id) {
            Some(_) => Ok(()),
            None => Err(ControlError::not_found(ResourceKind::Vm, id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{DeploymentData, EnvironmentSpec, VmId};

    async fn seeded() -> (MemoryStore, Project, Environment) {
        let store = MemoryStore::new();
        let project = Project::new("site", "https://git.example.com/site.git").unwrap();
        store.insert_project(&project).await.unwrap();

        let env = Environment::new(
            project.id.clone(),
            EnvironmentSpec {
                name: "production".to_owned(),
                branch: "main".to_owned(),
                is_production: true,
                ..Default::default()
            },
        )
        .unwrap();
        store.insert_environment(&env).await.unwrap();

        (store, project, env)
    }

    fn deployment(project: &Project, env: &Environment, commit: &str) -> DeploymentRecord {
        DeploymentRecord::new(DeploymentData::new(
            project.id.clone(),
            env.id.clone(),
            env.branch.clone(),
            commit.to_owned(),
        ))
    }

    #[tokio::test]
    async fn insert_and_get() {
        let (store, project, env) = seeded().await;

        let record = deployment(&project, &env, "abc123");
        let id = record.data.id.clone();
        store.insert(&record).await.expect("insert failed");

        let retrieved = store
            .get(&id)
            .await
            .expect("get failed")
            .expect("deployment not found");
        assert_eq!(retrieved.data.environment_id, env.id);
        assert_eq!(retrieved.status, DeploymentStatus::Queued);
    }

    #[tokio::test]
    async fn second_in_flight_deployment_conflicts() {
        let (store, project, env) = seeded().await;

        store
            .insert(&deployment(&project, &env, "abc123"))
            .await
            .expect("first insert failed");

        let err = store
            .insert(&deployment(&project, &env, "def456"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let all = store.list(&DeploymentFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn insert_for_unknown_environment_fails() {
        let (store, project, _) = seeded().await;
        let record = DeploymentRecord::new(DeploymentData::new(
            project.id.clone(),
            EnvironmentId::new("missing"),
            "main".to_owned(),
            "abc".to_owned(),
        ));

        let err = store.insert(&record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let (store, project, env) = seeded().await;
        let mut record = deployment(&project, &env, "abc123");
        store.insert(&record).await.unwrap();

        record.status = DeploymentStatus::Running;
        record.data.vm_id = Some(VmId::new("vm-1"));
        assert!(store
            .transition(&record, DeploymentStatus::Queued)
            .await
            .unwrap());

        // A second claim from the stale status must lose.
        assert!(!store
            .transition(&record, DeploymentStatus::Queued)
            .await
            .unwrap());

        let stored = store.get(&record.data.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Running);
        assert_eq!(stored.data.vm_id, Some(VmId::new("vm-1")));
    }

    #[tokio::test]
    async fn append_log_accumulates() {
        let (store, project, env) = seeded().await;
        let record = deployment(&project, &env, "abc123");
        store.insert(&record).await.unwrap();

        store.append_log(&record.data.id, "one\n").await.unwrap();
        store.append_log(&record.data.id, "two\n").await.unwrap();

        let stored = store.get(&record.data.id).await.unwrap().unwrap();
        assert_eq!(stored.data.logs, "one\ntwo\n");
    }

    #[tokio::test]
    async fn list_with_filters() {
        let (store, project, env) = seeded().await;

        let mut first = deployment(&project, &env, "abc123");
        first.status = DeploymentStatus::Success;
        store.insert(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut second = deployment(&project, &env, "def456");
        second.status = DeploymentStatus::Failed;
        store.insert(&second).await.unwrap();

        let all = store
            .list(&DeploymentFilter::new().with_project(project.id.clone()))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].data.id, second.data.id);

        let good = store
            .list(&DeploymentFilter::new().with_status(DeploymentStatus::Success))
            .await
            .unwrap();
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].data.id, first.data.id);

        let page = store
            .list(&DeploymentFilter::new().with_limit(1).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].data.id, first.data.id);
    }

    #[tokio::test]
    async fn duplicate_branch_conflicts() {
        let (store, project, _) = seeded().await;
        let dup = Environment::new(
            project.id.clone(),
            EnvironmentSpec {
                name: "prod-2".to_owned(),
                branch: "main".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();

        let err = store.insert_environment(&dup).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn delete_project_cascades() {
        let (store, project, env) = seeded().await;
        store
            .set_variable(&EnvVariable::new(env.id.clone(), "KEY", "v").unwrap())
            .await
            .unwrap();

        let mut record = deployment(&project, &env, "abc123");
        record.status = DeploymentStatus::Success;
        store.insert(&record).await.unwrap();
        store.set_live(&env.id, &record.data.id).await.unwrap();

        store.delete_project(&project.id).await.unwrap();

        assert!(store.get_project(&project.id).await.unwrap().is_none());
        assert!(store.get_environment(&env.id).await.unwrap().is_none());
        assert!(store.list_variables(&env.id).await.unwrap().is_empty());
        assert!(store.get(&record.data.id).await.unwrap().is_none());
        assert!(store.get_live(&env.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_project_with_in_flight_deployment_conflicts() {
        let (store, project, env) = seeded().await;
        store
            .insert(&deployment(&project, &env, "abc123"))
            .await
            .unwrap();

        let err = store.delete_project(&project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(store.get_project(&project.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_environment_with_deployments_conflicts() {
        let (store, project, env) = seeded().await;
        let mut record = deployment(&project, &env, "abc123");
        record.status = DeploymentStatus::Failed;
        store.insert(&record).await.unwrap();

        let err = store.delete_environment(&env.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn variables_upsert_by_key() {
        let (store, _, env) = seeded().await;
        store
            .set_variable(&EnvVariable::new(env.id.clone(), "B", "1").unwrap())
            .await
            .unwrap();
        store
            .set_variable(&EnvVariable::new(env.id.clone(), "A", "1").unwrap())
            .await
            .unwrap();
        store
            .set_variable(&EnvVariable::new(env.id.clone(), "B", "2").unwrap())
            .await
            .unwrap();

        let vars = store.list_variables(&env.id).await.unwrap();
        let pairs: Vec<_> = vars
            .iter()
            .map(|v| (v.key.as_str(), v.value.as_str()))
            .collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "2")]);

        store.delete_variable(&env.id, "A").await.unwrap();
        assert!(store.delete_variable(&env.id, "A").await.is_err());
    }

    #[tokio::test]
    async fn vm_records() {
        let store = MemoryStore::new();
        let vm = VmRecord::new("i-0abc", "us-east-1", None).unwrap();
        store.upsert_vm(&vm).await.unwrap();
        store.upsert_vm(&vm).await.unwrap();
        assert_eq!(store.list_vms().await.unwrap().len(), 1);

        store.delete_vm(&vm.id).await.unwrap();
        assert!(store.delete_vm(&vm.id).await.is_err());
    }
}
