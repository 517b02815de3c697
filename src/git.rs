use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature, StatusOptions};

use crate::{hlog_debug, hlog_warn, Result};

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        hlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Create `branch` from `base` (or HEAD) and check it out at `worktree_path`.
    pub fn create_worktree(
        &self,
        branch: &str,
        base: Option<&str>,
        worktree_path: &Path,
    ) -> Result<()> {
        hlog_debug!(
            "GitOps::create_worktree branch={} base={:?} path={}",
            branch,
            base,
            worktree_path.display()
        );
        {
            let repo = self.repo()?;
            let commit = match base {
                Some(base) => repo
                    .find_branch(base, BranchType::Local)?
                    .get()
                    .peel_to_commit()?,
                None => repo.head()?.peel_to_commit()?,
            };
            hlog_debug!("Creating branch {} from commit {}", branch, commit.id());
            repo.branch(branch, &commit, false)?;
        }
        self.create_worktree_from_branch(branch, worktree_path)
    }

    /// Check out an existing branch at `worktree_path`.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        // Branch names contain slashes; the folder name is a valid worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);

        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        hlog_debug!("Worktree {} created at {}", worktree_name, worktree_path.display());
        Ok(())
    }

    /// Remove a worktree directory and its admin entry. The branch is kept.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        hlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        if let Some(name) = folder_name.as_deref() {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    hlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch marked as checked out.
        if let Some(name) = folder_name {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Paths with uncommitted changes in a worktree, sorted.
    pub fn changed_files(&self, worktree_path: &Path) -> Result<Vec<String>> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut files: Vec<String> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(String::from))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<()> {
        hlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Hive", "hive@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        hlog_debug!("Commit created: {}", commit_id);
        Ok(())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }
}
