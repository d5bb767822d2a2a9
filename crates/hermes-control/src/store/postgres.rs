//! PostgreSQL store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{ControlError, ControlResult, ResourceKind};
use crate::types::{
    DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, EnvVariable, Environment,
    EnvironmentId, InstanceDetails, JobKind, Project, ProjectId, VmId, VmLease, VmRecord, VmStatus,
};

use super::{CatalogStore, DeploymentFilter, DeploymentStore, VmStore};

const DEPLOYMENT_COLUMNS: &str = "id, project_id, environment_id, branch, commit_hash, status, \
     logs, url, vm_id, rollback_of, error, created_at, updated_at, completed_at";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Check the database answers.
    pub async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS environments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                branch TEXT NOT NULL,
                is_production BOOLEAN NOT NULL DEFAULT FALSE,
                domain TEXT,
                region TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (project_id, branch)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS env_variables (
                environment_id TEXT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (environment_id, key)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                environment_id TEXT NOT NULL REFERENCES environments(id),
                branch TEXT NOT NULL,
                commit_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                logs TEXT NOT NULL DEFAULT '',
                url TEXT,
                vm_id TEXT,
                rollback_of TEXT,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_in_flight
            ON deployments (environment_id)
            WHERE status IN ('queued', 'running')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project_created
            ON deployments (project_id, created_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_status
            ON deployments (status)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS live_deployments (
                environment_id TEXT PRIMARY KEY REFERENCES environments(id) ON DELETE CASCADE,
                deployment_id TEXT NOT NULL REFERENCES deployments(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                region TEXT NOT NULL,
                status TEXT NOT NULL,
                lease_deployment_id TEXT,
                lease_kind TEXT,
                instance JSONB,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_project(row: &PgRow) -> Project {
        Project {
            id: ProjectId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            repo_url: row.get("repo_url"),
            created_at: row.get("created_at"),
        }
    }

    fn row_to_environment(row: &PgRow) -> Environment {
        Environment {
            id: EnvironmentId::new(row.get::<String, _>("id")),
            project_id: ProjectId::new(row.get::<String, _>("project_id")),
            name: row.get("name"),
            branch: row.get("branch"),
            is_production: row.get("is_production"),
            domain: row.get("domain"),
            region: row.get("region"),
            created_at: row.get("created_at"),
        }
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let status_str: String = row.get("status");
        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(row.get::<String, _>("id")),
                project_id: ProjectId::new(row.get::<String, _>("project_id")),
                environment_id: EnvironmentId::new(row.get::<String, _>("environment_id")),
                branch: row.get("branch"),
                commit_hash: row.get("commit_hash"),
                logs: row.get("logs"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                completed_at: row.get("completed_at"),
                url: row.get("url"),
                vm_id: row.get::<Option<String>, _>("vm_id").map(VmId::new),
                rollback_of: row
                    .get::<Option<String>, _>("rollback_of")
                    .map(DeploymentId::new),
                error: row.get("error"),
            },
            status,
        })
    }

    fn row_to_vm(row: &PgRow) -> ControlResult<VmRecord> {
        let status_str: String = row.get("status");
        let status: VmStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse VM status '{status_str}': {e}"))
        })?;

        let lease_id: Option<String> = row.get("lease_deployment_id");
        let lease_kind: Option<String> = row.get("lease_kind");
        let lease = match (lease_id, lease_kind) {
            (Some(id), Some(kind)) => Some(VmLease {
                deployment_id: DeploymentId::new(id),
                kind: parse_job_kind(&kind)?,
            }),
            _ => None,
        };

        let instance: Option<serde_json::Value> = row.get("instance");
        let instance = instance
            .map(serde_json::from_value::<InstanceDetails>)
            .transpose()
            .map_err(|e| {
                ControlError::Serialisation(format!("failed to deserialise instance: {e}"))
            })?;

        let registered_at: DateTime<Utc> = row.get("registered_at");
        let updated_at: DateTime<Utc> = row.get("updated_at");

        Ok(VmRecord {
            id: VmId::new(row.get::<String, _>("id")),
            instance_id: row.get("instance_id"),
            region: row.get("region"),
            status,
            lease,
            instance,
            registered_at,
            updated_at,
        })
    }
}

fn parse_job_kind(s: &str) -> ControlResult<JobKind> {
    match s {
        "deploy" => Ok(JobKind::Deploy),
        "promote" => Ok(JobKind::Promote),
        "rollback" => Ok(JobKind::Rollback),
        other => Err(ControlError::Serialisation(format!(
            "unknown job kind: {other}"
        ))),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn insert_project(&self, project: &Project) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, repo_url, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(project.id.as_str())
        .bind(&project.name)
        .bind(&project.repo_url)
        .bind(project.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::conflict(format!("project {} already exists", project.id))
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>> {
        let row = sqlx::query("SELECT id, name, repo_url, created_at FROM projects WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn list_projects(&self) -> ControlResult<Vec<Project>> {
        let rows =
            sqlx::query("SELECT id, name, repo_url, created_at FROM projects ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().map(Self::row_to_project).collect())
    }

    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM projects WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(ControlError::not_found(ResourceKind::Project, id));
        }

        let busy = sqlx::query(
            r#"
            SELECT 1 FROM deployments
            WHERE project_id = $1 AND status IN ('queued', 'running')
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if busy.is_some() {
            return Err(ControlError::conflict(format!(
                "project {id} has deployments in flight"
            )));
        }

        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_environment(&self, environment: &Environment) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO environments (
                id, project_id, name, branch, is_production, domain, region, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(environment.id.as_str())
        .bind(environment.project_id.as_str())
        .bind(&environment.name)
        .bind(&environment.branch)
        .bind(environment.is_production)
        .bind(&environment.domain)
        .bind(&environment.region)
        .bind(environment.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::conflict(format!(
                    "branch '{}' is already bound to an environment of project {}",
                    environment.branch, environment.project_id
                ))
            } else if is_foreign_key_violation(&e) {
                ControlError::not_found(ResourceKind::Project, &environment.project_id)
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_environment(&self, id: &EnvironmentId) -> ControlResult<Option<Environment>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, branch, is_production, domain, region, created_at
            FROM environments
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_environment))
    }

    async fn find_environment(
        &self,
        project_id: &ProjectId,
        branch: &str,
    ) -> ControlResult<Option<Environment>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, branch, is_production, domain, region, created_at
            FROM environments
            WHERE project_id = $1 AND branch = $2
            "#,
        )
        .bind(project_id.as_str())
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_environment))
    }

    async fn list_environments(&self, project_id: &ProjectId) -> ControlResult<Vec<Environment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, name, branch, is_production, domain, region, created_at
            FROM environments
            WHERE project_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(project_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_environment).collect())
    }

    async fn delete_environment(&self, id: &EnvironmentId) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM environments WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(ControlError::not_found(ResourceKind::Environment, id));
        }

        let referenced = sqlx::query("SELECT 1 FROM deployments WHERE environment_id = $1 LIMIT 1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if referenced.is_some() {
            return Err(ControlError::conflict(format!(
                "environment {id} still has deployments"
            )));
        }

        sqlx::query("DELETE FROM environments WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_variable(&self, variable: &EnvVariable) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO env_variables (environment_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (environment_id, key) DO UPDATE
            SET value = EXCLUDED.value
            "#,
        )
        .bind(variable.environment_id.as_str())
        .bind(&variable.key)
        .bind(&variable.value)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                ControlError::not_found(ResourceKind::Environment, &variable.environment_id)
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn list_variables(
        &self,
        environment_id: &EnvironmentId,
    ) -> ControlResult<Vec<EnvVariable>> {
        let rows = sqlx::query(
            "SELECT key, value FROM env_variables WHERE environment_id = $1 ORDER BY key",
        )
        .bind(environment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EnvVariable {
                environment_id: environment_id.clone(),
                key: row.get("key"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn delete_variable(
        &self,
        environment_id: &EnvironmentId,
        key: &str,
    ) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM env_variables WHERE environment_id = $1 AND key = $2")
            .bind(environment_id.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(
                ResourceKind::Variable,
                format!("{environment_id}/{key}"),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let data = &record.data;
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, project_id, environment_id, branch, commit_hash, status, logs,
                url, vm_id, rollback_of, error, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(data.id.as_str())
        .bind(data.project_id.as_str())
        .bind(data.environment_id.as_str())
        .bind(&data.branch)
        .bind(&data.commit_hash)
        .bind(record.status.as_str())
        .bind(&data.logs)
        .bind(&data.url)
        .bind(data.vm_id.as_ref().map(VmId::as_str))
        .bind(data.rollback_of.as_ref().map(DeploymentId::as_str))
        .bind(&data.error)
        .bind(data.created_at)
        .bind(data.updated_at)
        .bind(data.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::conflict(format!(
                    "environment {} already has a deployment in flight",
                    data.environment_id
                ))
            } else if is_foreign_key_violation(&e) {
                ControlError::not_found(ResourceKind::Environment, &data.environment_id)
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        record: &DeploymentRecord,
        from: DeploymentStatus,
    ) -> ControlResult<bool> {
        let data = &record.data;
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, completed_at = $2, url = $3, vm_id = $4, error = $5,
                updated_at = $6
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(record.status.as_str())
        .bind(data.completed_at)
        .bind(&data.url)
        .bind(data.vm_id.as_ref().map(VmId::as_str))
        .bind(&data.error)
        .bind(data.updated_at)
        .bind(data.id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.get(&data.id).await? {
            Some(_) => Ok(false),
            None => Err(ControlError::not_found(ResourceKind::Deployment, &data.id)),
        }
    }

    async fn append_log(&self, id: &DeploymentId, chunk: &str) -> ControlResult<()> {
        let result = sqlx::query(
            "UPDATE deployments SET logs = logs || $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(chunk)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(ResourceKind::Deployment, id));
        }

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref project_id) = filter.project_id {
            params.push(project_id.as_str().to_owned());
            query.push_str(&format!(" AND project_id = ${}", params.len()));
        }

        if let Some(ref environment_id) = filter.environment_id {
            params.push(environment_id.as_str().to_owned());
            query.push_str(&format!(" AND environment_id = ${}", params.len()));
        }

        if let Some(ref branch) = filter.branch {
            params.push(branch.clone());
            query.push_str(&format!(" AND branch = ${}", params.len()));
        }

        if !filter.statuses.is_empty() {
            let mut placeholders = Vec::with_capacity(filter.statuses.len());
            for status in &filter.statuses {
                params.push(status.as_str().to_owned());
                placeholders.push(format!("${}", params.len()));
            }
            query.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
        }

        query.push_str(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get_live(
        &self,
        environment_id: &EnvironmentId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT d.id, d.project_id, d.environment_id, d.branch, d.commit_hash, d.status,
                   d.logs, d.url, d.vm_id, d.rollback_of, d.error, d.created_at,
                   d.updated_at, d.completed_at
            FROM deployments d
            INNER JOIN live_deployments l ON d.id = l.deployment_id
            WHERE l.environment_id = $1
            "#,
        )
        .bind(environment_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn set_live(
        &self,
        environment_id: &EnvironmentId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO live_deployments (environment_id, deployment_id)
            VALUES ($1, $2)
            ON CONFLICT (environment_id) DO UPDATE
            SET deployment_id = EXCLUDED.deployment_id
            "#,
        )
        .bind(environment_id.as_str())
        .bind(deployment_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                ControlError::not_found(ResourceKind::Deployment, deployment_id)
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn clear_live(&self, environment_id: &EnvironmentId) -> ControlResult<()> {
        sqlx::query("DELETE FROM live_deployments WHERE environment_id = $1")
            .bind(environment_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl VmStore for PostgresStore {
    async fn upsert_vm(&self, vm: &VmRecord) -> ControlResult<()> {
        let instance = vm
            .instance
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise instance: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO vms (
                id, instance_id, region, status, lease_deployment_id, lease_kind,
                instance, registered_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET instance_id = EXCLUDED.instance_id,
                region = EXCLUDED.region,
                status = EXCLUDED.status,
                lease_deployment_id = EXCLUDED.lease_deployment_id,
                lease_kind = EXCLUDED.lease_kind,
                instance = EXCLUDED.instance,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(vm.id.as_str())
        .bind(&vm.instance_id)
        .bind(&vm.region)
        .bind(vm.status.as_str())
        .bind(vm.lease.as_ref().map(|l| l.deployment_id.as_str()))
        .bind(vm.lease.as_ref().map(|l| l.kind.as_str()))
        .bind(instance)
        .bind(vm.registered_at)
        .bind(vm.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_vms(&self) -> ControlResult<Vec<VmRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, region, status, lease_deployment_id, lease_kind,
                   instance, registered_at, updated_at
            FROM vms
            ORDER BY registered_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_vm).collect()
    }

    async fn delete_vm(&self, id: &VmId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM vms WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found(ResourceKind::Vm, id));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::EnvironmentSpec;

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    async fn connect() -> PostgresStore {
        let url = get_database_url().expect("DATABASE_URL not set");
        PostgresStore::new(&url, 5).await.expect("failed to connect")
    }

    async fn seeded(store: &PostgresStore) -> (Project, Environment) {
        let project = Project::new("pg-test", "https://git.example.com/pg.git").unwrap();
        store.insert_project(&project).await.expect("insert project");

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
        store.insert_environment(&env).await.expect("insert env");

        (project, env)
    }

    fn deployment(project: &Project, env: &Environment) -> DeploymentRecord {
        DeploymentRecord::new(DeploymentData::new(
            project.id.clone(),
            env.id.clone(),
            env.branch.clone(),
            "abc123def456".to_owned(),
        ))
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn insert_and_get() {
        let store = connect().await;
        let (project, env) = seeded(&store).await;

        let record = deployment(&project, &env);
        let id = record.data.id.clone();
        store.insert(&record).await.expect("insert failed");

        let retrieved = store
            .get(&id)
            .await
            .expect("get failed")
            .expect("deployment not found");
        assert_eq!(retrieved.data.id, id);
        assert_eq!(retrieved.data.environment_id, env.id);
        assert_eq!(retrieved.status, DeploymentStatus::Queued);

        let mut done = retrieved.clone();
        done.status = DeploymentStatus::Failed;
        done.data.completed_at = Some(Utc::now());
        assert!(store
            .transition(&done, DeploymentStatus::Queued)
            .await
            .unwrap());

        store.delete_project(&project.id).await.expect("delete failed");
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn in_flight_uniqueness() {
        let store = connect().await;
        let (project, env) = seeded(&store).await;

        let first = deployment(&project, &env);
        store.insert(&first).await.expect("insert failed");

        let err = store.insert(&deployment(&project, &env)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = store.delete_project(&project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let mut done = first.clone();
        done.status = DeploymentStatus::Failed;
        done.data.completed_at = Some(Utc::now());
        store
            .transition(&done, DeploymentStatus::Queued)
            .await
            .unwrap();
        store.delete_project(&project.id).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn live_pointer_and_logs() {
        let store = connect().await;
        let (project, env) = seeded(&store).await;

        let record = deployment(&project, &env);
        store.insert(&record).await.unwrap();
        store.append_log(&record.data.id, "hello\n").await.unwrap();
        store.set_live(&env.id, &record.data.id).await.unwrap();

        let live = store.get_live(&env.id).await.unwrap().expect("live set");
        assert_eq!(live.data.id, record.data.id);
        assert_eq!(live.data.logs, "hello\n");

        store.clear_live(&env.id).await.unwrap();
        assert!(store.get_live(&env.id).await.unwrap().is_none());

        let mut done = record.clone();
        done.status = DeploymentStatus::Failed;
        done.data.completed_at = Some(Utc::now());
        store
            .transition(&done, DeploymentStatus::Queued)
            .await
            .unwrap();
        store.delete_project(&project.id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn vm_roundtrip() {
        let store = connect().await;
        let mut vm = VmRecord::new("i-pgtest", "us-east-1", None).unwrap();
        vm.status = VmStatus::Busy;
        vm.lease = Some(VmLease {
            deployment_id: DeploymentId::new("d1"),
            kind: JobKind::Promote,
        });
        store.upsert_vm(&vm).await.unwrap();

        let listed = store.list_vms().await.unwrap();
        let found = listed.iter().find(|v| v.id == vm.id).expect("vm listed");
        assert_eq!(found.lease, vm.lease);

        store.delete_vm(&vm.id).await.unwrap();
    }
}
