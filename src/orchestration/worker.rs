//! Supervised worker processes.
//!
//! A [`WorkerHandle`] owns one child process executing one task inside its
//! execution context. Workers talk to the supervisor only through the bus:
//! every stdout line is parsed as a [`WorkerReport`] and forwarded to the
//! supervisor's mailbox. Roles with `stdin_messages` also get a bus endpoint
//! whose messages are written to the worker's stdin as JSON lines.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{Category, Message, MessageBus, Priority, SUPERVISOR};
use crate::core::{ExecutionContext, Task, TaskId};
use crate::orchestration::WorkerCommand;
use crate::{clog, clog_debug, clog_trace, clog_warn, Error, Result};

/// Delay between delivery attempts while the supervisor mailbox is full.
const QUEUE_RETRY: Duration = Duration::from_millis(50);

/// How long the stdin pump waits on the bus before re-checking cancellation.
const PUMP_WAIT: Duration = Duration::from_millis(500);

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for logs and file names.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }

    /// Bus endpoint this worker receives on.
    pub fn endpoint(&self) -> String {
        format!("worker:{}", self.0)
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, no report seen yet.
    Starting,
    /// Process alive, task reported finished.
    Idle,
    /// Executing its task.
    Busy,
    /// No activity seen for longer than the unresponsive timeout.
    Unresponsive,
    /// Process has exited or was stopped.
    Stopped,
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Heartbeat,
    Progress {
        #[serde(default)]
        message: String,
    },
    Completed {
        #[serde(default)]
        summary: Option<String>,
    },
    Failed {
        #[serde(default)]
        reason: String,
    },
    /// Message for another endpoint, routed by the bus.
    Send {
        to: String,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl WorkerReport {
    /// Parse a stdout line. Anything that is not a report counts as progress.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.starts_with('{') {
            if let Ok(report) = serde_json::from_str(line) {
                return Some(report);
            }
        }
        Some(WorkerReport::Progress {
            message: line.to_string(),
        })
    }

    pub fn priority(&self) -> Priority {
        match self {
            WorkerReport::Completed { .. } | WorkerReport::Failed { .. } => Priority::High,
            WorkerReport::Progress { .. } => Priority::Normal,
            WorkerReport::Heartbeat => Priority::Low,
            WorkerReport::Send { priority, .. } => *priority,
        }
    }
}

/// Payload of a `worker_report` message sent to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub worker: WorkerId,
    pub task: TaskId,
    pub report: WorkerReport,
}

/// Lifecycle wrapper around one worker process.
pub struct WorkerHandle {
    id: WorkerId,
    role: String,
    task_id: TaskId,
    context: ExecutionContext,
    state: WorkerState,
    child: Option<Child>,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    last_activity: Arc<Mutex<Instant>>,
    started_at: Instant,
    log_path: PathBuf,
    bus: Arc<MessageBus>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Launch a worker for `task` inside `context`.
    ///
    /// stderr goes to `<log_dir>/<worker>.log`.
    pub fn start(
        id: WorkerId,
        command: &WorkerCommand,
        task: &Task,
        context: &ExecutionContext,
        bus: Arc<MessageBus>,
        log_dir: &Path,
    ) -> Result<Self> {
        let start_error = |reason: String| Error::WorkerStart {
            role: command.role().to_string(),
            reason,
        };
        if !command.is_available() {
            return Err(start_error(format!(
                "command '{}' not found",
                command.binary()
            )));
        }
        let argv = command.command(task.prompt());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| start_error("empty command".to_string()))?;

        std::fs::create_dir_all(log_dir)?;
        let log_path = log_dir.join(format!("{}.log", id.0));
        let stderr = std::fs::File::create(&log_path)?;

        let mut process = Command::new(program);
        process
            .args(args)
            .current_dir(&context.path)
            .env("CONVOY_TASK_ID", task.id.as_str())
            .env("CONVOY_TASK_TITLE", &task.title)
            .env("CONVOY_WORKER_ID", id.0.to_string())
            .env("CONVOY_ROLE", command.role())
            .env("CONVOY_CONTEXT", &context.path)
            .env("CONVOY_BASE_REVISION", &context.base_revision)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        let endpoint = id.endpoint();
        if command.stdin_messages() {
            process.env("CONVOY_ENDPOINT", &endpoint).stdin(Stdio::piped());
        }
        let mut child = process.spawn().map_err(|e| start_error(e.to_string()))?;

        let pid = child.id();
        if command.stdin_messages() {
            bus.register(&endpoint);
        }

        let cancel = CancellationToken::new();
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let forwarder = child.stdout.take().map(|stdout| {
            tokio::spawn(forward_reports(
                stdout,
                id,
                task.id.clone(),
                Arc::clone(&bus),
                Arc::clone(&last_activity),
                cancel.child_token(),
            ))
        });
        let pump = child.stdin.take().map(|stdin| {
            tokio::spawn(pump_inbox(
                stdin,
                endpoint,
                Arc::clone(&bus),
                cancel.child_token(),
            ))
        });

        clog!(
            "Worker {} started for task {} (role={}, pid={:?}, cwd={})",
            id,
            task.id,
            command.role(),
            pid,
            context.path.display()
        );

        Ok(Self {
            id,
            role: command.role().to_string(),
            task_id: task.id.clone(),
            context: context.clone(),
            state: WorkerState::Starting,
            child: Some(child),
            pid,
            exit: None,
            last_activity,
            started_at: Instant::now(),
            log_path,
            bus,
            cancel,
            forwarder,
            pump,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// A first report arrived: the worker is executing its task.
    pub fn mark_busy(&mut self) {
        if self.state == WorkerState::Starting {
            self.state = WorkerState::Busy;
        }
    }

    /// The task was reported finished; the process may still be winding down.
    pub fn mark_idle(&mut self) {
        if self.state != WorkerState::Stopped {
            self.state = WorkerState::Idle;
        }
    }

    pub fn mark_unresponsive(&mut self) {
        if self.state != WorkerState::Stopped {
            self.state = WorkerState::Unresponsive;
        }
    }

    /// Time since the worker last produced any output.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Check whether the process is still running, recording its exit.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                clog_debug!("Worker {} exited with {}", self.id, status);
                self.exit = Some(status);
                self.child = None;
                self.state = WorkerState::Stopped;
                false
            }
            Err(e) => {
                clog_warn!("Worker {} status check failed: {}", self.id, e);
                false
            }
        }
    }

    /// Exit code, once the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|s| s.code())
    }

    pub fn exited_successfully(&self) -> bool {
        self.exit.map(|s| s.success()).unwrap_or(false)
    }

    /// Wait for the stdout forwarder to deliver everything the process wrote.
    pub async fn flush_output(&mut self, limit: Duration) {
        if let Some(forwarder) = self.forwarder.take() {
            if tokio::time::timeout(limit, forwarder).await.is_err() {
                clog_warn!("Worker {} output not drained within {:?}", self.id, limit);
            }
        }
    }

    /// Ask the process to terminate without waiting for it.
    pub async fn request_stop(&mut self) {
        if self.is_alive() {
            if let Some(pid) = self.pid {
                send_signal(pid, "TERM").await;
            }
        }
    }

    /// Wait for the process to exit, at most until `deadline`.
    pub async fn wait_until(&mut self, deadline: tokio::time::Instant) -> bool {
        let Some(child) = self.child.as_mut() else {
            return true;
        };
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                self.exit = Some(status);
                self.child = None;
                true
            }
            Ok(Err(e)) => {
                clog_warn!("Worker {} wait failed: {}", self.id, e);
                false
            }
            Err(_) => false,
        }
    }

    /// Stop the worker. Stopping a stopped worker is a no-op.
    ///
    /// With `graceful`, the process gets SIGTERM and up to `grace` to exit
    /// before it is killed.
    pub async fn stop(&mut self, graceful: bool, grace: Duration) -> Result<()> {
        if self.child.is_some() && self.is_alive() {
            if graceful {
                self.request_stop().await;
                let deadline = tokio::time::Instant::now() + grace;
                if !self.wait_until(deadline).await {
                    clog_warn!(
                        "Worker {} ignored SIGTERM for {:?}, killing",
                        self.id,
                        grace
                    );
                }
            }
            if let Some(mut child) = self.child.take() {
                child.kill().await?;
                self.exit = child.try_wait()?;
            }
        }
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.bus.unregister(&self.id.endpoint());
        if self.state != WorkerState::Stopped {
            clog_debug!("Worker {} stopped (task {})", self.id, self.task_id);
        }
        self.state = WorkerState::Stopped;
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.bus.unregister(&self.id.endpoint());
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("task", &self.task_id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}

async fn forward_reports(
    stdout: ChildStdout,
    worker: WorkerId,
    task: TaskId,
    bus: Arc<MessageBus>,
    last_activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
) {
    let endpoint = worker.endpoint();
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                clog_warn!("Worker {} stdout read failed: {}", worker, e);
                break;
            }
        };
        if let Ok(mut t) = last_activity.lock() {
            *t = Instant::now();
        }
        let Some(report) = WorkerReport::parse(&line) else {
            continue;
        };
        clog_trace!("Worker {} report: {:?}", worker, report);

        let message = match report {
            WorkerReport::Send {
                to,
                priority,
                payload,
            } => Message::new(&endpoint, &to, Category::WorkerReport, payload)
                .with_priority(priority),
            report => {
                let priority = report.priority();
                let envelope = WorkerEnvelope {
                    worker,
                    task: task.clone(),
                    report,
                };
                let payload = match serde_json::to_value(&envelope) {
                    Ok(payload) => payload,
                    Err(e) => {
                        clog_warn!("Worker {} report not encodable: {}", worker, e);
                        continue;
                    }
                };
                Message::new(&endpoint, SUPERVISOR, Category::WorkerReport, payload)
                    .with_priority(priority)
            }
        };
        deliver(&bus, message, &cancel).await;
    }
}

/// Send with retry while the recipient's mailbox is full.
async fn deliver(bus: &MessageBus, message: Message, cancel: &CancellationToken) {
    let mut warned = false;
    loop {
        match bus.send(message.clone()) {
            Ok(()) => return,
            Err(Error::QueueFull {
                recipient,
                capacity,
            }) => {
                if !warned {
                    clog_warn!(
                        "Mailbox {} full ({} messages), holding report from {}",
                        recipient,
                        capacity,
                        message.sender
                    );
                    warned = true;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        clog_warn!("Report from {} abandoned: worker stopped", message.sender);
                        return;
                    }
                    _ = tokio::time::sleep(QUEUE_RETRY) => {}
                }
            }
            Err(e) => {
                clog_warn!("Report from {} not delivered: {}", message.sender, e);
                return;
            }
        }
    }
}

async fn pump_inbox(
    mut stdin: ChildStdin,
    endpoint: String,
    bus: Arc<MessageBus>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = bus.receive(&endpoint, PUMP_WAIT) => message,
        };
        let Some(message) = message else {
            if !bus.is_registered(&endpoint) {
                break;
            }
            continue;
        };
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                clog_warn!("Message for {} not encodable: {}", endpoint, e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            clog_debug!("stdin of {} closed: {}", endpoint, e);
            break;
        }
        let _ = stdin.flush().await;
    }
}

async fn send_signal(pid: u32, signal: &str) -> bool {
    Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Whether a process with `pid` exists.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Terminate a process this supervisor does not own (left over from a
/// previous run): SIGTERM, then SIGKILL after `grace`.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    if !process_alive(pid) {
        return;
    }
    clog_warn!("Terminating stale worker process {}", pid);
    send_signal(pid, "TERM").await;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    send_signal(pid, "KILL").await;
}
