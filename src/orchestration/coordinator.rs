//! Execution contexts and baseline integration.
//!
//! Every dispatched task gets its own git worktree on a fresh branch cut
//! from the baseline branch. When the task is done its branch is merged into
//! the baseline in memory: the baseline ref only moves once a complete,
//! conflict-free merge commit exists, so a conflict never leaves a partially
//! merged baseline behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use git2::{BranchType, Index, Oid, Repository};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::{ContextId, ExecutionContext, Task, TaskId};
use crate::git::GitOps;
use crate::util::sanitize_name;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Prefix of every task branch.
pub const TASK_BRANCH_PREFIX: &str = "convoy/task/";

/// 1-based inclusive line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A file that could not be merged, with the regions where the baseline
/// and the task disagree (line numbers in the baseline version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFile {
    pub path: PathBuf,
    pub regions: Vec<LineRange>,
}

impl ConflictFile {
    pub fn new(path: impl Into<PathBuf>, regions: Vec<LineRange>) -> Self {
        Self {
            path: path.into(),
            regions,
        }
    }
}

/// How a context's branch landed on the baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge.
    UpToDate { commit: String },
    FastForward { commit: String },
    /// A merge commit was created.
    Merged { commit: String },
}

impl MergeOutcome {
    pub fn commit(&self) -> &str {
        match self {
            MergeOutcome::UpToDate { commit }
            | MergeOutcome::FastForward { commit }
            | MergeOutcome::Merged { commit } => commit,
        }
    }
}

pub struct WorktreeCoordinator {
    git: GitOps,
    baseline: String,
    worktrees_dir: PathBuf,
    keep_failed_branches: bool,
}

impl WorktreeCoordinator {
    /// Open the repository and make sure the baseline branch exists.
    pub fn new(
        repo_path: &Path,
        baseline: &str,
        worktrees_dir: PathBuf,
        keep_failed_branches: bool,
    ) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        let tip = git.ensure_branch(baseline)?;
        clog_debug!("Baseline {} at {}", baseline, tip);
        Ok(Self {
            git,
            baseline: baseline.to_string(),
            worktrees_dir,
            keep_failed_branches,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.repo_path()?,
            &config.baseline_branch,
            config.worktrees_dir()?,
            config.coordinator.keep_failed_branches,
        )
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    /// Current tip of the baseline branch.
    pub fn baseline_revision(&self) -> Result<Oid> {
        self.git.branch_commit(&self.baseline)
    }

    /// Branch a new worktree for `task` from the current baseline.
    pub fn create_context(&self, task: &Task) -> Result<ExecutionContext> {
        let id = ContextId::new();
        let name = format!("{}-{}", sanitize_name(task.id.as_str()), id.short());
        let path = self.worktrees_dir.join(&name);
        let branch = format!("{}{}", TASK_BRANCH_PREFIX, name);
        let base = self.baseline_revision()?;

        self.git.create_worktree(&branch, base, &path)?;
        clog!(
            "Context {} for task {} at {} (base {})",
            id.short(),
            task.id,
            path.display(),
            base
        );
        Ok(ExecutionContext {
            id,
            task_id: task.id.clone(),
            path,
            branch,
            base_revision: base.to_string(),
            dirty: false,
            created_at: Utc::now(),
        })
    }

    /// Refresh the dirty flag from the worktree.
    pub fn inspect(&self, context: &mut ExecutionContext) -> Result<bool> {
        context.dirty = self.git.is_dirty(&context.path)?;
        Ok(context.dirty)
    }

    /// Merge the context's branch into the baseline.
    ///
    /// Uncommitted work in the worktree is committed first. On conflict the
    /// baseline is left untouched and `MergeConflict` lists the files.
    pub fn integrate(&self, context: &ExecutionContext, task: &Task) -> Result<MergeOutcome> {
        if context.task_id != task.id {
            return Err(Error::Validation(format!(
                "context {} belongs to task {}, not {}",
                context.id.short(),
                context.task_id,
                task.id
            )));
        }
        if self.git.is_dirty(&context.path)? {
            self.git
                .commit_all(&context.path, &format!("{}: {}", task.id, task.title))?;
        }

        let repo = self.git.repo()?;
        let baseline_ref = format!("refs/heads/{}", self.baseline);
        let ours = repo.find_reference(&baseline_ref)?.peel_to_commit()?;
        let theirs = repo
            .find_branch(&context.branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            clog_debug!("Task {} has nothing to merge", task.id);
            return Ok(MergeOutcome::UpToDate {
                commit: ours.id().to_string(),
            });
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(
                &baseline_ref,
                theirs.id(),
                true,
                &format!("convoy: fast-forward {}", task.id),
            )?;
            clog!("Task {} fast-forwarded {} to {}", task.id, self.baseline, theirs.id());
            return Ok(MergeOutcome::FastForward {
                commit: theirs.id().to_string(),
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let conflicts = extract_conflicts(&repo, &index)?;
            clog_warn!(
                "Task {} conflicts with {} in {} file(s)",
                task.id,
                self.baseline,
                conflicts.len()
            );
            return Err(Error::MergeConflict {
                task: task.id.clone(),
                conflicts,
            });
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = GitOps::signature(&repo)?;
        let message = format!("Merge task {}: {}", task.id, task.title);
        let commit = repo.commit(
            Some(&baseline_ref),
            &sig,
            &sig,
            &message,
            &tree,
            &[&ours, &theirs],
        )?;
        clog!("Task {} merged into {} as {}", task.id, self.baseline, commit);
        Ok(MergeOutcome::Merged {
            commit: commit.to_string(),
        })
    }

    /// Release a context's worktree. The branch is deleted once merged, and
    /// also after a failure unless failed branches are kept.
    pub fn teardown(&self, context: &ExecutionContext, merged: bool) -> Result<()> {
        self.git.remove_worktree(&context.path)?;
        if merged || !self.keep_failed_branches {
            self.git.delete_branch(&context.branch)?;
        } else {
            clog_debug!("Keeping branch {} for inspection", context.branch);
        }
        Ok(())
    }

    /// Throw a context away without merging it.
    pub fn discard(&self, context: &ExecutionContext) -> Result<()> {
        clog_debug!("Discarding context {} of task {}", context.id.short(), context.task_id);
        self.teardown(context, false)
    }

    /// Merge several contexts in priority order, then insertion order,
    /// tearing each down after its attempt.
    ///
    /// A conflict fails only its own task; later contexts still merge
    /// against the baseline as left by the earlier ones.
    pub fn merge_all(
        &self,
        mut items: Vec<(Task, ExecutionContext)>,
    ) -> Vec<(TaskId, Result<MergeOutcome>)> {
        items.sort_by_key(|(task, _)| (task.priority, task.seq));
        items
            .into_iter()
            .map(|(task, context)| {
                let result = self.integrate(&context, &task);
                if let Err(e) = self.teardown(&context, result.is_ok()) {
                    clog_warn!("Teardown of context for {} failed: {}", task.id, e);
                }
                (task.id, result)
            })
            .collect()
    }

    /// Remove task worktrees under the worktree directory that no live
    /// context refers to. Returns how many were removed.
    pub fn cleanup_orphans(&self, live: &HashSet<PathBuf>) -> Result<usize> {
        let repo = self.git.repo()?;
        let mut removed = 0;
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            let path = worktree.path().to_path_buf();
            if !path.starts_with(&self.worktrees_dir) || live.contains(&path) {
                continue;
            }
            let branch = Repository::open(&path)
                .ok()
                .and_then(|r| r.head().ok().and_then(|h| h.shorthand().map(String::from)));
            clog_warn!("Removing orphaned context {}", path.display());
            self.git.remove_worktree(&path)?;
            if let Some(branch) = branch {
                if branch.starts_with(TASK_BRANCH_PREFIX) && !self.keep_failed_branches {
                    self.git.delete_branch(&branch)?;
                }
            }
            removed += 1;
        }
        self.git.prune_worktrees()?;
        Ok(removed)
    }
}

fn extract_conflicts(repo: &Repository, index: &Index) -> Result<Vec<ConflictFile>> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let path = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|e| PathBuf::from(String::from_utf8_lossy(&e.path).to_string()))
            .unwrap_or_default();
        let ours = read_blob(repo, conflict.our.as_ref().map(|e| e.id))?;
        let theirs = read_blob(repo, conflict.their.as_ref().map(|e| e.id))?;
        files.push(ConflictFile::new(path, differing_region(&ours, &theirs)));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn read_blob(repo: &Repository, oid: Option<Oid>) -> Result<String> {
    match oid {
        Some(id) if !id.is_zero() => {
            let blob = repo.find_blob(id)?;
            Ok(String::from_utf8_lossy(blob.content()).to_string())
        }
        _ => Ok(String::new()),
    }
}

/// The span of `ours` outside the common leading and trailing lines.
fn differing_region(ours: &str, theirs: &str) -> Vec<LineRange> {
    let a: Vec<&str> = ours.lines().collect();
    let b: Vec<&str> = theirs.lines().collect();
    if a == b {
        return Vec::new();
    }
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let start = prefix + 1;
    let end = (a.len() - suffix).max(start);
    vec![LineRange { start, end }]
}
