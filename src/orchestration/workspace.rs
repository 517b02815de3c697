//! Per-task branch isolation.
//!
//! Every task attempt works on its own branch, checked out as a git worktree.
//! Executions run in parallel but branch and worktree creation are serialized
//! behind one lock, since git's ref and worktree admin files are shared.

use crate::core::task::TaskId;
use crate::git::GitOps;
use crate::util::{blocking, sanitize_ref_component};
use crate::{hlog_debug, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Branch a task's work lands on.
pub fn branch_name(prefix: &str, task_id: &TaskId) -> String {
    format!("{}/{}", prefix, sanitize_ref_component(task_id.as_str()))
}

pub struct Workspace {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    base_branch: Option<String>,
    create_lock: Mutex<()>,
}

impl Workspace {
    /// # Errors
    ///
    /// Fails when `repo_path` is not inside a git repository.
    pub fn new(repo_path: &Path, worktrees_dir: &Path) -> Result<Self> {
        GitOps::new(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            base_branch: None,
            create_lock: Mutex::new(()),
        })
    }

    /// Cut task branches from `branch` instead of HEAD.
    pub fn with_base_branch(mut self, branch: Option<String>) -> Self {
        self.base_branch = branch;
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        let repo_name = self
            .repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        self.worktrees_dir
            .join(format!("{}-{}", repo_name, branch.replace('/', "-")))
    }

    /// Check out `branch` in a fresh worktree, creating the branch if needed.
    ///
    /// An existing branch (a retry, or a re-run) is reused so earlier commits
    /// are kept. A stale worktree at the target path is removed first.
    pub async fn prepare(&self, branch: &str) -> Result<PathBuf> {
        let _guard = self.create_lock.lock().await;
        let repo_path = self.repo_path.clone();
        let worktree = self.worktree_path(branch);
        let base = self.base_branch.clone();
        let branch = branch.to_string();
        let worktrees_dir = self.worktrees_dir.clone();

        blocking(move || {
            std::fs::create_dir_all(&worktrees_dir)?;
            let git = GitOps::new(&repo_path)?;
            if worktree.exists() || git.list_worktrees()?.iter().any(|w| worktree.ends_with(w)) {
                git.remove_worktree(&worktree)?;
            }
            if git.branch_exists(&branch)? {
                hlog_debug!("Workspace::prepare reusing branch {}", branch);
                git.create_worktree_from_branch(&branch, &worktree)?;
            } else {
                git.create_worktree(&branch, base.as_deref(), &worktree)?;
            }
            Ok(worktree)
        })
        .await
    }

    /// Remove the worktree, keeping the branch and its commits.
    pub async fn release(&self, worktree: &Path) -> Result<()> {
        let _guard = self.create_lock.lock().await;
        let repo_path = self.repo_path.clone();
        let worktree = worktree.to_path_buf();
        blocking(move || GitOps::new(&repo_path)?.remove_worktree(&worktree)).await
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("repo_path", &self.repo_path)
            .field("worktrees_dir", &self.worktrees_dir)
            .field("base_branch", &self.base_branch)
            .finish()
    }
}
