//! File-drop inbox for requests from other processes.
//!
//! The supervisor is the ledger's only writer. Planning tools and the CLI
//! therefore never open the ledger for writing; they drop a JSON request
//! into `<state_dir>/inbox/` and the supervisor applies it on its next poll.
//! A file watcher wakes the supervisor as soon as a request lands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use notify::{Config as WatchConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::{Task, TaskId};
use crate::{clog_debug, clog_warn, Result};

pub const INBOX_DIR: &str = "inbox";

/// A request for the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboxRequest {
    AddTasks { tasks: Vec<Task> },
    Retry { task: TaskId },
    Cancel {
        task: TaskId,
        /// Return the task to `Ready` instead of failing it.
        #[serde(default)]
        requeue: bool,
    },
}

pub struct Inbox {
    dir: PathBuf,
    wake: Arc<Notify>,
    _watcher: Option<RecommendedWatcher>,
}

impl Inbox {
    pub fn dir_for(state_dir: &Path) -> PathBuf {
        state_dir.join(INBOX_DIR)
    }

    /// Create the inbox directory and start watching it.
    ///
    /// Without a watcher the inbox still works; requests are then only
    /// picked up on the supervisor's regular poll.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = Self::dir_for(state_dir);
        std::fs::create_dir_all(&dir)?;
        let wake = Arc::new(Notify::new());
        let watcher = match watch(&dir, Arc::clone(&wake)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                clog_warn!("Inbox watcher unavailable, polling only: {}", e);
                None
            }
        };
        Ok(Self {
            dir,
            wake,
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves when a new request file appears.
    pub async fn changed(&self) {
        self.wake.notified().await
    }

    /// Drop a request into the inbox of the ledger at `state_dir`.
    pub fn submit(state_dir: &Path, request: &InboxRequest) -> Result<PathBuf> {
        let dir = Self::dir_for(state_dir);
        std::fs::create_dir_all(&dir)?;
        let name = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            Uuid::new_v4().simple()
        );
        let temp = dir.join(format!(".{}.tmp", name));
        let path = dir.join(format!("{}.json", name));
        std::fs::write(&temp, serde_json::to_string_pretty(request)?)?;
        std::fs::rename(&temp, &path)?;
        clog_debug!("Submitted inbox request {}", path.display());
        Ok(path)
    }

    /// Take every pending request, oldest first.
    ///
    /// Taken files are deleted. Files that do not parse are renamed to
    /// `*.rejected` and skipped.
    pub fn take(&self) -> Vec<InboxRequest> {
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect(),
            Err(e) => {
                clog_warn!("Cannot read inbox {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };
        paths.sort();

        let mut requests = Vec::new();
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(crate::Error::from)
                .and_then(|text| Ok(serde_json::from_str::<InboxRequest>(&text)?));
            match parsed {
                Ok(request) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        clog_warn!("Cannot remove inbox file {}: {}", path.display(), e);
                        continue;
                    }
                    requests.push(request);
                }
                Err(e) => {
                    clog_warn!("Rejecting inbox file {}: {}", path.display(), e);
                    let _ = std::fs::rename(&path, path.with_extension("rejected"));
                }
            }
        }
        requests
    }
}

fn watch(dir: &Path, wake: Arc<Notify>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    wake.notify_one();
                }
            }
        },
        WatchConfig::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
