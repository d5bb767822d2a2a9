//! Source checkout for the execution step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use gix::progress::Discard;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, instrument, warn};

use crate::error::{ControlError, ControlResult};
use crate::types::validate_commit_hash;

/// A directory holding the code a job runs against.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Path to the checkout.
    pub path: PathBuf,
    /// Commit checked out.
    pub commit_hash: String,
}

/// Fetches a commit of a repository into a fresh workspace.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch `commit_hash` of `repo_url` into a workspace named `name`.
    ///
    /// Network failures are `Transient`; a commit that cannot be found is
    /// `Fatal`.
    async fn fetch(&self, repo_url: &str, commit_hash: &str, name: &str)
        -> ControlResult<Workspace>;

    /// Remove a workspace once the job is done with it.
    async fn cleanup(&self, workspace: &Workspace) {
        if let Err(e) = tokio::fs::remove_dir_all(&workspace.path).await {
            warn!(path = %workspace.path.display(), error = %e, "failed to remove workspace");
        }
    }
}

/// Make a string safe to use as a directory name.
fn sanitise_for_path(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_error(path: &Path, action: &str, e: std::io::Error) -> ControlError {
    ControlError::internal(format!("failed to {action} {}: {e}", path.display()))
}

async fn fresh_dir(root: &Path, name: &str) -> ControlResult<PathBuf> {
    let path = root.join(sanitise_for_path(name));
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| io_error(&path, "clear", e))?;
    }
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|e| io_error(&path, "create", e))?;
    Ok(path)
}

/// Source provider backed by a cached bare clone per repository.
///
/// The first fetch of a repository clones it under `<root>/.cache`; later
/// fetches update the cache. The requested commit's tree is then written
/// into a fresh workspace. Full history is kept so older commits stay
/// resolvable for rollbacks.
#[derive(Debug, Clone)]
pub struct GitSource {
    root: PathBuf,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitSource {
    /// Create a provider placing workspaces under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    fn cache_path(&self, repo_url: &str) -> PathBuf {
        self.root.join(".cache").join(sanitise_for_path(repo_url))
    }

    fn lock_for(&self, cache_path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(cache_path.to_path_buf())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    #[instrument(skip(self), fields(commit = %commit_hash))]
    async fn fetch(
        &self,
        repo_url: &str,
        commit_hash: &str,
        name: &str,
    ) -> ControlResult<Workspace> {
        validate_commit_hash(commit_hash).map_err(|e| ControlError::fatal(e.to_string()))?;
        let work_dir = fresh_dir(&self.root, name).await?;
        let cache_path = self.cache_path(repo_url);

        let lock = self.lock_for(&cache_path);
        let _guard = lock.lock().await;

        let repo_url = repo_url.to_owned();
        let commit = commit_hash.to_owned();
        let dest = work_dir.clone();
        let resolved =
            task::spawn_blocking(move || checkout_sync(&repo_url, &commit, &cache_path, &dest))
                .await
                .map_err(|e| ControlError::internal(format!("checkout task failed: {e}")))??;

        info!(path = %work_dir.display(), resolved = %resolved, "source checked out");

        Ok(Workspace {
            path: work_dir,
            commit_hash: resolved,
        })
    }
}

/// Bring the cache up to date and write the commit's tree into `dest`.
///
/// Returns the full hex id of the commit checked out.
fn checkout_sync(
    repo_url: &str,
    commit: &str,
    cache_path: &Path,
    dest: &Path,
) -> ControlResult<String> {
    let (repo, fetch_error) = if cache_path.exists() {
        match update_cache(cache_path, repo_url) {
            Ok(repo) => (repo, None),
            Err(e) => {
                warn!(error = %e, "fetch failed, trying cached objects");
                let repo = gix::open(cache_path).map_err(|open| {
                    ControlError::transient(format!("cache at {} unusable: {open}", cache_path.display()))
                })?;
                (repo, Some(e))
            }
        }
    } else {
        let parent = cache_path.parent().unwrap_or(cache_path);
        std::fs::create_dir_all(parent).map_err(|e| io_error(parent, "create", e))?;
        (clone_cache(repo_url, cache_path)?, None)
    };

    let commit_id = match resolve_commit(&repo, commit) {
        Ok(id) => id,
        Err(e) => {
            return Err(match fetch_error {
                Some(fetch) => ControlError::transient(format!("{e}; last fetch failed: {fetch}")),
                None => e,
            });
        }
    };

    let unreadable =
        |e: &dyn std::fmt::Display| ControlError::fatal(format!("commit {commit_id} unreadable: {e}"));
    let tree = repo
        .find_commit(commit_id)
        .map_err(|e| unreadable(&e))?
        .tree()
        .map_err(|e| unreadable(&e))?;
    extract_tree(&repo, &tree, dest)?;

    Ok(commit_id.to_string())
}

fn clone_cache(url: &str, path: &Path) -> ControlResult<gix::Repository> {
    info!(url = %url, path = %path.display(), "cloning repository");

    let clone_error = |e: &dyn std::fmt::Display| {
        ControlError::transient(format!("clone of {url} failed: {e}"))
    };
    let mut prepare = gix::prepare_clone_bare(url, path).map_err(|e| clone_error(&e))?;
    let (repo, _outcome) = prepare
        .fetch_only(Discard, &gix::interrupt::IS_INTERRUPTED)
        .map_err(|e| clone_error(&e))?;
    Ok(repo)
}

fn update_cache(path: &Path, url: &str) -> ControlResult<gix::Repository> {
    debug!(path = %path.display(), "fetching updates");

    let fetch_error =
        |e: &dyn std::fmt::Display| ControlError::transient(format!("fetch from {url} failed: {e}"));
    let repo = gix::open(path).map_err(|e| fetch_error(&e))?;
    let remote = repo
        .find_remote("origin")
        .or_else(|_| repo.remote_at(url))
        .map_err(|e| fetch_error(&e))?;
    let _outcome = remote
        .connect(gix::remote::Direction::Fetch)
        .map_err(|e| fetch_error(&e))?
        .prepare_fetch(Discard, Default::default())
        .map_err(|e| fetch_error(&e))?
        .receive(Discard, &gix::interrupt::IS_INTERRUPTED)
        .map_err(|e| fetch_error(&e))?;
    Ok(repo)
}

/// Resolve a full or abbreviated hex id to a commit in the cache.
fn resolve_commit(repo: &gix::Repository, commit: &str) -> ControlResult<gix::ObjectId> {
    let id = repo
        .rev_parse_single(commit)
        .map_err(|e| ControlError::fatal(format!("commit {commit} not found: {e}")))?;
    Ok(id.detach())
}

/// Write a tree into `dest`, recursing into subtrees.
///
/// Symlinks and submodules are skipped.
fn extract_tree(repo: &gix::Repository, tree: &gix::Tree<'_>, dest: &Path) -> ControlResult<()> {
    use gix::object::tree::EntryKind;

    for entry in tree.iter() {
        let entry =
            entry.map_err(|e| ControlError::fatal(format!("failed to read tree entry: {e}")))?;
        let name = std::str::from_utf8(entry.filename())
            .map_err(|_| ControlError::fatal("tree entry name is not UTF-8"))?;
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(ControlError::fatal(format!("refusing tree entry named {name:?}")));
        }
        let path = dest.join(name);

        match entry.mode().kind() {
            EntryKind::Tree => {
                std::fs::create_dir_all(&path).map_err(|e| io_error(&path, "create", e))?;
                let subtree = repo
                    .find_tree(entry.oid())
                    .map_err(|e| ControlError::fatal(format!("failed to find subtree: {e}")))?;
                extract_tree(repo, &subtree, &path)?;
            }
            EntryKind::Blob | EntryKind::BlobExecutable => {
                let object = repo
                    .find_object(entry.oid())
                    .map_err(|e| ControlError::fatal(format!("failed to find blob: {e}")))?;
                std::fs::write(&path, object.data.as_slice())
                    .map_err(|e| io_error(&path, "write", e))?;

                #[cfg(unix)]
                if matches!(entry.mode().kind(), EntryKind::BlobExecutable) {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                        .map_err(|e| io_error(&path, "chmod", e))?;
                }
            }
            EntryKind::Link => warn!(path = %path.display(), "skipping symlink"),
            EntryKind::Commit => warn!(path = %path.display(), "skipping submodule"),
        }
    }
    Ok(())
}

/// Source provider that hands out empty workspaces.
///
/// For scripts that fetch their own code.
#[derive(Debug, Clone)]
pub struct EmptySource {
    root: PathBuf,
}

impl EmptySource {
    /// Create a provider placing workspaces under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceProvider for EmptySource {
    async fn fetch(
        &self,
        _repo_url: &str,
        commit_hash: &str,
        name: &str,
    ) -> ControlResult<Workspace> {
        let path = fresh_dir(&self.root, name).await?;
        Ok(Workspace {
            path,
            commit_hash: commit_hash.to_owned(),
        })
    }
}
