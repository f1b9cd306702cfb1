//! Git worktree management for workflow isolation.
//!
//! Mutations (`worktree add/remove`, `branch -D`) shell out to `git`, which
//! handles hooks and config the same way a developer's checkout does.
//! Read-only inspection for health probes goes through `git2`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Convert a title to a branch-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Branch name for a workflow: `adw-<adw_id>-issue-<issue>`.
pub fn branch_name_for(issue_ref: &str, adw_id: &str) -> String {
    format!("adw-{}-issue-{}", adw_id, slugify(issue_ref, 40))
}

/// Isolation operations the orchestrator needs from version control.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create a worktree at `path` on a new (or existing) `branch`.
    async fn create(&self, path: &Path, branch: &str) -> Result<()>;

    /// Remove the worktree at `path`. Missing worktrees are not an error.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Delete a local branch.
    async fn delete_branch(&self, branch: &str) -> Result<()>;
}

/// [`Workspace`] backed by the `git` CLI in the main repository.
pub struct GitWorkspace {
    repo_root: PathBuf,
    base_ref: String,
}

impl GitWorkspace {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            base_ref: "HEAD".to_string(),
        }
    }

    pub fn with_base_ref(mut self, base_ref: &str) -> Self {
        self.base_ref = base_ref.to_string();
        self
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "running git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let output = self
            .git(&["rev-parse", "--verify", "--quiet", &refname])
            .await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn create(&self, path: &Path, branch: &str) -> Result<()> {
        if path.exists() {
            debug!(path = %path.display(), "worktree already present");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create worktree parent directory")?;
        }
        let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;

        let output = if self.branch_exists(branch).await? {
            self.git(&["worktree", "add", path_str, branch]).await?
        } else {
            self.git(&["worktree", "add", "-b", branch, path_str, &self.base_ref])
                .await?
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git worktree add failed: {}", stderr.trim());
        }
        info!(path = %path.display(), branch, "created worktree");
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        if path.exists() {
            let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
            let output = self
                .git(&["worktree", "remove", "--force", path_str])
                .await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(path = %path.display(), stderr = %stderr.trim(), "git worktree remove failed, deleting directory");
                tokio::fs::remove_dir_all(path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        let prune = self.git(&["worktree", "prune"]).await?;
        if !prune.status.success() {
            warn!("git worktree prune failed");
        }
        info!(path = %path.display(), "removed worktree");
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        if !self.branch_exists(branch).await? {
            return Ok(());
        }
        let output = self.git(&["branch", "-D", branch]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git branch -D {} failed: {}", branch, stderr.trim());
        }
        info!(branch, "deleted branch");
        Ok(())
    }
}

/// Snapshot of a worktree's on-disk and VCS state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub exists: bool,
    /// Listed in the main repository's `git worktree` registry.
    pub registered: bool,
    /// Modified, staged or untracked files.
    pub uncommitted_changes: usize,
}

/// Inspect a worktree with libgit2. Blocking; run it off the async runtime.
pub fn inspect_worktree(repo_root: &Path, worktree_path: &Path) -> Result<WorktreeInfo> {
    if !worktree_path.is_dir() {
        return Ok(WorktreeInfo::default());
    }

    let repo = git2::Repository::open(repo_root).context("Failed to open main repository")?;
    let wanted = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());
    let names = repo.worktrees().context("Failed to list worktrees")?;
    let registered = names.iter().flatten().any(|name| {
        repo.find_worktree(name)
            .ok()
            .and_then(|wt| wt.path().canonicalize().ok())
            .is_some_and(|p| p == wanted)
    });

    let uncommitted_changes = match git2::Repository::open(worktree_path) {
        Ok(wt_repo) => {
            let mut opts = git2::StatusOptions::new();
            opts.include_untracked(true).include_ignored(false);
            wt_repo
                .statuses(Some(&mut opts))
                .map(|s| s.len())
                .unwrap_or(0)
        }
        Err(_) => 0,
    };

    Ok(WorktreeInfo {
        exists: true,
        registered,
        uncommitted_changes,
    })
}
