//! Execution runners.
//!
//! A runner performs the actual work of a job on the VM it was given: fetch
//! the source, build, ship. The orchestration core treats it as an opaque,
//! possibly slow, possibly failing call. Errors classified `Transient` may be
//! retried by the dispatcher; anything else fails the deployment.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::source::SourceProvider;
use crate::store::Store;
use crate::types::{
    DeploymentId, EnvVariable, Environment, EnvironmentId, JobKind, Project, VmId, VmRecord,
};

/// Exit code a script uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Line prefix a script prints to report the public URL.
pub const URL_MARKER: &str = "HERMES_URL=";

/// Everything a runner needs to execute one job.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Deployment being executed.
    pub deployment_id: DeploymentId,
    /// Kind of job.
    pub kind: JobKind,
    /// Owning project.
    pub project: Project,
    /// Target environment.
    pub environment: Environment,
    /// VM the job holds.
    pub vm: VmRecord,
    /// Branch being shipped.
    pub branch: String,
    /// Commit being shipped.
    pub commit_hash: String,
    /// Environment variables, ordered by key.
    pub variables: Vec<EnvVariable>,
}

impl ExecutionRequest {
    fn short_commit(&self) -> &str {
        self.commit_hash.get(..7).unwrap_or(&self.commit_hash)
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Public URL, if the run produced one.
    pub url: Option<String>,
}

/// Appends execution output to a deployment's logs.
///
/// Store failures are logged and swallowed; losing a log line must not fail
/// the deployment.
#[derive(Clone)]
pub struct LogWriter {
    store: Arc<dyn Store>,
    deployment_id: DeploymentId,
}

impl LogWriter {
    /// Create a writer for one deployment.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, deployment_id: DeploymentId) -> Self {
        Self {
            store,
            deployment_id,
        }
    }

    /// Append one line.
    pub async fn line(&self, line: impl AsRef<str>) {
        let mut chunk = line.as_ref().to_owned();
        if !chunk.ends_with('\n') {
            chunk.push('\n');
        }
        if let Err(e) = self.store.append_log(&self.deployment_id, &chunk).await {
            warn!(deployment_id = %self.deployment_id, error = %e, "failed to append log");
        }
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("deployment_id", &self.deployment_id)
            .finish_non_exhaustive()
    }
}

/// Performs the work of a job on a VM.
#[async_trait]
pub trait ExecutionRunner: Send + Sync {
    /// Run a job, streaming output into `logs`.
    ///
    /// Invoked once per attempt. Errors whose kind is `Transient` may be
    /// retried; all others are final.
    async fn run(&self, request: &ExecutionRequest, logs: &LogWriter)
        -> ControlResult<ExecutionOutcome>;
}

/// Fill in a URL template for a request.
fn render_url(template: &str, request: &ExecutionRequest) -> String {
    template
        .replace("{deployment_id}", request.deployment_id.as_str())
        .replace("{commit}", &request.commit_hash)
        .replace("{short_commit}", request.short_commit())
        .replace("{branch}", &request.branch)
        .replace("{environment}", &request.environment.name)
        .replace("{domain}", request.environment.domain.as_deref().unwrap_or(""))
}

/// Runs a shell script inside a fresh checkout of the commit.
///
/// The script sees the job through `HERMES_*` variables plus every variable
/// of the target environment. Output lines go to the deployment logs; a line
/// of the form `HERMES_URL=<url>` sets the public URL. Exit code 75 asks for
/// a retry, any other non-zero exit fails the deployment.
pub struct ScriptRunner {
    source: Arc<dyn SourceProvider>,
    script: String,
    timeout: Duration,
    url_template: Option<String>,
}

impl ScriptRunner {
    /// Create a new script runner.
    pub fn new(
        source: Arc<dyn SourceProvider>,
        script: impl Into<String>,
        timeout: Duration,
        url_template: Option<String>,
    ) -> Self {
        Self {
            source,
            script: script.into(),
            timeout,
            url_template,
        }
    }

    fn environment(request: &ExecutionRequest) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = request
            .variables
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();

        let mut set = |key: &str, value: &str| {
            env.insert(key.to_owned(), value.to_owned());
        };
        set("HERMES_DEPLOYMENT_ID", request.deployment_id.as_str());
        set("HERMES_JOB_KIND", request.kind.as_str());
        set("HERMES_PROJECT_ID", request.project.id.as_str());
        set("HERMES_REPO_URL", &request.project.repo_url);
        set("HERMES_ENVIRONMENT", &request.environment.name);
        set(
            "HERMES_PRODUCTION",
            if request.environment.is_production { "1" } else { "0" },
        );
        set("HERMES_BRANCH", &request.branch);
        set("HERMES_COMMIT", &request.commit_hash);
        set("HERMES_VM_ID", request.vm.id.as_str());
        set("HERMES_VM_INSTANCE_ID", &request.vm.instance_id);
        set("HERMES_VM_REGION", &request.vm.region);
        if let Some(address) = request.vm.instance.as_ref().and_then(|i| i.address.as_deref()) {
            set("HERMES_VM_ADDRESS", address);
        }
        if let Some(domain) = request.environment.domain.as_deref() {
            set("HERMES_DOMAIN", domain);
        }
        env
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        dir: &std::path::Path,
        logs: &LogWriter,
    ) -> ControlResult<ExecutionOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.script)
            .current_dir(dir)
            .envs(Self::environment(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ControlError::fatal(format!("failed to start script: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ControlError::internal("script stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ControlError::internal("script stderr not captured"))?;

        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut url = None;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(reported) = line.strip_prefix(URL_MARKER) {
                            url = Some(reported.trim().to_owned());
                        }
                        logs.line(&line).await;
                    }
                    Ok(None) | Err(_) => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => logs.line(&line).await,
                    Ok(None) | Err(_) => stderr_open = false,
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ControlError::internal(format!("failed to wait for script: {e}")))?;

        match status.code() {
            Some(0) => {
                let url = url.or_else(|| {
                    self.url_template
                        .as_deref()
                        .map(|template| render_url(template, request))
                });
                Ok(ExecutionOutcome { url })
            }
            Some(EXIT_TEMPFAIL) => Err(ControlError::transient(format!(
                "script asked for a retry (exit {EXIT_TEMPFAIL})"
            ))),
            Some(code) => Err(ControlError::fatal(format!("script exited with {code}"))),
            None => Err(ControlError::fatal("script terminated by a signal")),
        }
    }
}

#[async_trait]
impl ExecutionRunner for ScriptRunner {
    async fn run(
        &self,
        request: &ExecutionRequest,
        logs: &LogWriter,
    ) -> ControlResult<ExecutionOutcome> {
        let workspace = self
            .source
            .fetch(
                &request.project.repo_url,
                &request.commit_hash,
                &format!("{}-{}", request.deployment_id, request.kind),
            )
            .await?;
        logs.line(format!(
            "checked out {} into {}",
            request.short_commit(),
            workspace.path.display()
        ))
        .await;

        let result =
            match tokio::time::timeout(self.timeout, self.execute(request, &workspace.path, logs))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ControlError::transient(format!(
                    "script timed out after {}s",
                    self.timeout.as_secs()
                ))),
            };

        self.source.cleanup(&workspace).await;

        if result.is_ok() {
            info!(deployment_id = %request.deployment_id, kind = %request.kind, "script finished");
        }
        result
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("script", &self.script)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Scripted result for a commit run through [`MockRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Succeed.
    Succeed,
    /// Fail with a fatal error.
    Fail(String),
    /// Fail transiently on the first `n` attempts, then succeed.
    TransientTimes(u32),
    /// Always fail transiently.
    AlwaysTransient,
}

/// A call observed by [`MockRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Deployment executed.
    pub deployment_id: DeploymentId,
    /// Kind of job.
    pub kind: JobKind,
    /// Environment targeted.
    pub environment_id: EnvironmentId,
    /// VM the job ran on.
    pub vm_id: VmId,
    /// Commit shipped.
    pub commit_hash: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Concurrency {
    current: usize,
    peak: usize,
}

/// Runner that never touches a VM.
///
/// Outcomes are scripted per commit (unscripted commits succeed). It records
/// every call and the peak number of concurrent runs per environment and per
/// VM, which is what the orchestration tests assert on.
#[derive(Debug, Default)]
pub struct MockRunner {
    outcomes: DashMap<String, MockOutcome>,
    attempts: DashMap<(DeploymentId, JobKind), u32>,
    delay: Duration,
    calls: Mutex<Vec<MockCall>>,
    per_environment: DashMap<EnvironmentId, Concurrency>,
    per_vm: DashMap<VmId, Concurrency>,
}

impl MockRunner {
    /// Create a runner that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runner that takes `delay` per run.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Script the outcome for a commit.
    pub fn set_outcome(&self, commit_hash: &str, outcome: MockOutcome) {
        self.outcomes.insert(commit_hash.to_owned(), outcome);
    }

    /// Calls observed so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Highest number of simultaneous runs seen for one environment.
    #[must_use]
    pub fn peak_per_environment(&self) -> usize {
        self.per_environment
            .iter()
            .map(|c| c.peak)
            .max()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous runs seen on one VM.
    #[must_use]
    pub fn peak_per_vm(&self) -> usize {
        self.per_vm.iter().map(|c| c.peak).max().unwrap_or(0)
    }

    fn enter<K: std::hash::Hash + Eq>(map: &DashMap<K, Concurrency>, key: K) {
        let mut entry = map.entry(key).or_default();
        entry.current += 1;
        entry.peak = entry.peak.max(entry.current);
    }

    fn leave<K: std::hash::Hash + Eq>(map: &DashMap<K, Concurrency>, key: &K) {
        if let Some(mut entry) = map.get_mut(key) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ExecutionRunner for MockRunner {
    async fn run(
        &self,
        request: &ExecutionRequest,
        logs: &LogWriter,
    ) -> ControlResult<ExecutionOutcome> {
        self.calls.lock().await.push(MockCall {
            deployment_id: request.deployment_id.clone(),
            kind: request.kind,
            environment_id: request.environment.id.clone(),
            vm_id: request.vm.id.clone(),
            commit_hash: request.commit_hash.clone(),
        });

        let attempt = {
            let mut entry = self
                .attempts
                .entry((request.deployment_id.clone(), request.kind))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        Self::enter(&self.per_environment, request.environment.id.clone());
        Self::enter(&self.per_vm, request.vm.id.clone());

        logs.line(format!(
            "mock {} of {} on {} (attempt {attempt})",
            request.kind,
            request.short_commit(),
            request.vm.id
        ))
        .await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Self::leave(&self.per_environment, &request.environment.id);
        Self::leave(&self.per_vm, &request.vm.id);

        let outcome = self
            .outcomes
            .get(&request.commit_hash)
            .map_or(MockOutcome::Succeed, |o| o.value().clone());
        debug!(deployment_id = %request.deployment_id, ?outcome, attempt, "mock run");

        match outcome {
            MockOutcome::Succeed => {}
            MockOutcome::Fail(message) => {
                logs.line(format!("error: {message}")).await;
                return Err(ControlError::fatal(message));
            }
            MockOutcome::TransientTimes(n) if attempt <= n => {
                return Err(ControlError::transient(format!(
                    "mock transient failure {attempt}/{n}"
                )));
            }
            MockOutcome::TransientTimes(_) => {}
            MockOutcome::AlwaysTransient => {
                return Err(ControlError::transient("mock transient failure"));
            }
        }

        let host = request
            .environment
            .domain
            .clone()
            .unwrap_or_else(|| format!("{}.hermes.local", request.environment.name));
        Ok(ExecutionOutcome {
            url: Some(format!("https://{}.{host}", request.short_commit())),
        })
    }
}
