use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::{clog_debug, clog_warn, Result};

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    pub fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("convoy", "convoy@localhost"))?)
    }

    /// Make sure `branch` exists, creating it from HEAD when missing.
    /// Returns the commit the branch points at.
    pub fn ensure_branch(&self, branch: &str) -> Result<Oid> {
        let repo = self.repo()?;
        let commit = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing.get().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let head = repo.head()?.peel_to_commit()?;
                clog_debug!("Creating branch {} from HEAD {}", branch, head.id());
                repo.branch(branch, &head, false)?;
                head
            }
            Err(e) => return Err(e.into()),
        };
        Ok(commit.id())
    }

    /// Commit the tip of a local branch.
    pub fn branch_commit(&self, branch: &str) -> Result<Oid> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, BranchType::Local)?;
        let id = found.get().peel_to_commit()?.id();
        Ok(id)
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

    /// Create `branch` at `base` and check it out in a new worktree.
    pub fn create_worktree(&self, branch: &str, base: Oid, worktree_path: &Path) -> Result<()> {
        clog_debug!(
            "GitOps::create_worktree branch={} base={} path={}",
            branch,
            base,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let commit = repo.find_commit(base)?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a valid worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and its admin directory.
    ///
    /// Cleanup continues past individual failures: the branch cannot be
    /// deleted while git still believes it is checked out.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        clog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    clog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                clog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Prune worktree records whose directories no longer exist.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists()
                    && wt
                        .prune(Some(
                            git2::WorktreePruneOptions::new()
                                .valid(true)
                                .working_tree(true)
                                .locked(true),
                        ))
                        .is_ok()
                {
                    pruned += 1;
                }
            }
        }
        clog_debug!("prune_worktrees: pruned {} worktrees", pruned);
        Ok(pruned)
    }

    /// Check if a worktree has uncommitted changes (staged or unstaged).
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything in the worktree and commit it on its branch.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Oid> {
        clog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        clog_debug!("Commit created: {}", commit_id);
        Ok(commit_id)
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        clog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    clog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                clog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                clog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// Read a file as it exists at the tip of `branch`.
    pub fn read_file_at(&self, branch: &str, path: &Path) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tree = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .tree()?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = repo.find_blob(entry.id())?;
        let content = String::from_utf8_lossy(blob.content()).into_owned();
        Ok(Some(content))
    }
}
