//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Supervisor configurations with scripted workers
//! - Waiting on ledger conditions

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use convoy::config::{Config, RoleConfig};
use convoy::core::{Task, TaskId, TaskStatus};
use convoy::git::GitOps;
use convoy::{LedgerSnapshot, SupervisorHandle};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init", "-q"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-q", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open test repository")
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(output.status.success(), "git {:?} failed", args);
}

/// A repository plus scratch state and worktree directories, with a
/// configuration whose `default` role runs `script` under `sh -c`.
pub struct TestEnv {
    pub repo: TestRepo,
    pub scratch: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new(script: &str) -> Self {
        let repo = TestRepo::new();
        let scratch = TempDir::new().expect("Failed to create scratch directory");

        let mut config = Config::default();
        config.repo = Some(repo.path.display().to_string());
        config.state_dir = Some(scratch.path().join("state").display().to_string());
        config.worktree_dir = Some(scratch.path().join("worktrees").display().to_string());
        config.supervisor.poll_interval_ms = 20;
        config.supervisor.drain_timeout_secs = 2;
        config.health.poll_interval_ms = 50;
        config.health.backoff_base_ms = 10;
        config.health.backoff_max_ms = 50;
        config.health.grace_period_ms = 200;
        config
            .roles
            .insert("default".to_string(), script_role(script));

        Self {
            repo,
            scratch,
            config,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config.state_dir().expect("state dir")
    }

    /// A path outside every worktree, for scripts to leave evidence in.
    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    /// Content of `path` at the tip of the baseline branch.
    pub fn baseline_file(&self, path: &str) -> Option<String> {
        self.repo
            .git_ops()
            .read_file_at(&self.config.baseline_branch, Path::new(path))
            .expect("Failed to read baseline")
    }
}

pub fn script_role(script: &str) -> RoleConfig {
    RoleConfig {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        append_prompt: false,
        stdin_messages: false,
    }
}

/// A task owning exactly `resources`.
pub fn task(id: &str, priority: u32, resources: &[&str]) -> Task {
    Task::new(id, id, priority).with_resources(resources.iter().copied())
}

pub fn status_of(snapshot: &LedgerSnapshot, id: &str) -> Option<TaskStatus> {
    snapshot.get(&TaskId::from(id)).map(|t| t.status)
}

/// Poll the supervisor until `done` holds, failing after `limit`.
pub async fn wait_until<F>(handle: &SupervisorHandle, limit: Duration, mut done: F) -> LedgerSnapshot
where
    F: FnMut(&LedgerSnapshot) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        let snapshot = handle.snapshot().await.expect("supervisor stopped");
        if done(&snapshot) {
            return snapshot;
        }
        if Instant::now() > deadline {
            panic!("condition not reached within {:?}: {:#?}", limit, snapshot.tasks());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
