//! The supervisor daemon.
//!
//! One control loop composes everything else. Each cycle it polls for new
//! requests and worker reports, dispatches a batch, checks worker health and
//! merges finished work:
//!
//! ```text
//! Idle -> Polling -> Dispatching -> Monitoring -> Reconciling -> Polling ...
//!                          any state -> ShuttingDown
//! ```
//!
//! The supervisor is the ledger's only writer. Workers report through the
//! bus; other processes go through the inbox; in-process callers use a
//! [`SupervisorHandle`].

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::{Category, Message, MessageBus, Priority, SUPERVISOR};
use crate::config::Config;
use crate::core::{ExecutionContext, Task, TaskId, TaskStatus};
use crate::ledger::{LedgerOptions, LedgerSnapshot, TaskLedger};
use crate::orchestration::{
    process_alive, terminate_pid, HealthConfig, HealthEvent, HealthMonitor, Inbox, InboxRequest,
    RecoveryAction, TaskScheduler, WorkerCommand, WorkerEnvelope, WorkerId, WorkerPool,
    WorkerReport, WorktreeCoordinator,
};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_error, clog_trace, clog_warn, Error, Result};

const LOCK_FILE: &str = "supervisor.lock";

/// How long an exited worker's remaining output may take to arrive.
const OUTPUT_FLUSH: Duration = Duration::from_secs(1);

/// Daemon state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Polling,
    Dispatching,
    Monitoring,
    Reconciling,
    ShuttingDown,
}

enum ControlCommand {
    AddTasks(Vec<Task>, oneshot::Sender<Result<Vec<TaskId>>>),
    Retry(TaskId, oneshot::Sender<Result<()>>),
    Cancel {
        task: TaskId,
        requeue: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<LedgerSnapshot>),
}

/// In-process access to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<ControlCommand>,
    shutdown: CancellationToken,
    bus: Arc<MessageBus>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::SupervisorStopped)?;
        rx.await.map_err(|_| Error::SupervisorStopped)
    }

    /// Add tasks in order. Stops at the first rejected task.
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        self.request(|reply| ControlCommand::AddTasks(tasks, reply))
            .await?
    }

    pub async fn add_task(&self, task: Task) -> Result<TaskId> {
        let mut ids = self.add_tasks(vec![task]).await?;
        ids.pop()
            .ok_or_else(|| Error::Validation("no task was added".to_string()))
    }

    /// Explicit retry of a failed task.
    pub async fn retry(&self, task: TaskId) -> Result<()> {
        self.request(|reply| ControlCommand::Retry(task, reply))
            .await?
    }

    /// Stop the task's worker, discard its context and mark it `Ready`
    /// (`requeue`) or `Failed`.
    pub async fn cancel(&self, task: TaskId, requeue: bool) -> Result<()> {
        self.request(|reply| ControlCommand::Cancel {
            task,
            requeue,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.request(ControlCommand::Snapshot).await
    }

    /// Subscribe to broadcasts (status changes and health alerts).
    pub fn subscribe(&self, name: &str) -> Subscription {
        self.bus.register(name);
        Subscription {
            bus: Arc::clone(&self.bus),
            endpoint: name.to_string(),
        }
    }

    /// Ask the supervisor to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A read-only bus endpoint for broadcasts. Unregisters on drop.
pub struct Subscription {
    bus: Arc<MessageBus>,
    endpoint: String,
}

impl Subscription {
    pub async fn next(&self, timeout: Duration) -> Option<Message> {
        self.bus.receive(&self.endpoint, timeout).await
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(&self.endpoint);
    }
}

/// Pid lock file keeping two supervisors off the same ledger.
struct SupervisorLock {
    path: PathBuf,
}

impl SupervisorLock {
    fn acquire(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                if process_alive(pid) {
                    return Err(Error::SupervisorLocked(path));
                }
            }
            clog_warn!("Removing stale supervisor lock {}", path.display());
            std::fs::remove_file(&path)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::SupervisorLocked(path.clone()),
                _ => Error::Io(e),
            })?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

enum Wake {
    Shutdown,
    Control(Option<ControlCommand>),
    Message(Option<Message>),
    Inbox,
}

pub struct Supervisor {
    config: Config,
    state: SupervisorState,
    ledger: TaskLedger,
    bus: Arc<MessageBus>,
    pool: WorkerPool,
    health: HealthMonitor,
    scheduler: TaskScheduler,
    coordinator: Arc<WorktreeCoordinator>,
    inbox: Inbox,
    control_rx: mpsc::Receiver<ControlCommand>,
    handle: SupervisorHandle,
    _lock: SupervisorLock,
}

impl Supervisor {
    /// Open the ledger and repository described by `config`.
    ///
    /// Fails with `SupervisorLocked` if another supervisor owns the state
    /// directory.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        let state_dir = config.state_dir()?;
        let lock = SupervisorLock::acquire(&state_dir)?;

        let ledger = TaskLedger::open(
            &state_dir,
            LedgerOptions {
                max_restarts: config.health.max_restarts,
                snapshot_every: config.supervisor.snapshot_every,
            },
        )?;
        let bus = Arc::new(MessageBus::new(config.bus.queue_capacity));
        bus.register(SUPERVISOR);

        let health = HealthMonitor::new(HealthConfig::from(&config.health));
        let pool = WorkerPool::new(
            config.scheduler.parallelism,
            Arc::clone(&bus),
            state_dir.join("logs"),
            health.config().grace_period,
        );
        let scheduler = TaskScheduler::new(config.scheduler.parallelism);
        let coordinator = Arc::new(WorktreeCoordinator::from_config(&config)?);
        let inbox = Inbox::open(&state_dir)?;

        let (tx, control_rx) = mpsc::channel(64);
        let handle = SupervisorHandle {
            tx,
            shutdown: CancellationToken::new(),
            bus: Arc::clone(&bus),
        };

        clog!(
            "Supervisor ready: repo={}, baseline={}, state={}, parallelism={}",
            coordinator.git().repo_path().display(),
            coordinator.baseline(),
            state_dir.display(),
            config.scheduler.parallelism
        );
        Ok(Self {
            config,
            state: SupervisorState::Idle,
            ledger,
            bus,
            pool,
            health,
            scheduler,
            coordinator,
            inbox,
            control_rx,
            handle,
            _lock: lock,
        })
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Run until shut down through the handle.
    pub async fn run(mut self) -> Result<()> {
        self.recover().await;
        self.publish_changes();

        let poll = self.config.supervisor.poll_interval();
        loop {
            if self.handle.is_shutting_down() {
                break;
            }
            self.cycle().await;

            let wake = tokio::select! {
                _ = self.handle.shutdown.cancelled() => Wake::Shutdown,
                command = self.control_rx.recv() => Wake::Control(command),
                message = self.bus.receive(SUPERVISOR, poll) => Wake::Message(message),
                _ = self.inbox.changed() => Wake::Inbox,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Control(Some(command)) => self.handle_control(command).await,
                Wake::Message(Some(message)) => self.handle_message(message).await,
                Wake::Control(None) | Wake::Message(None) | Wake::Inbox => {}
            }
        }

        self.shutdown().await
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            clog_trace!("Supervisor {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// One pass through the control loop.
    async fn cycle(&mut self) {
        self.set_state(SupervisorState::Polling);
        self.poll_inbox().await;
        self.drain_messages().await;

        self.set_state(SupervisorState::Dispatching);
        self.dispatch().await;

        self.set_state(SupervisorState::Monitoring);
        self.monitor().await;

        self.set_state(SupervisorState::Reconciling);
        self.reconcile().await;

        self.publish_changes();
    }

    /// Settle tasks left in flight by a previous run.
    async fn recover(&mut self) {
        let snapshot = self.ledger.snapshot();
        let grace = self.health.config().grace_period;
        for task in snapshot.with_status(TaskStatus::Running) {
            clog_warn!(
                "Task {} was running when the last supervisor stopped; re-checking",
                task.id
            );
            if let Some(pid) = task.worker_pid {
                terminate_pid(pid, grace).await;
            }
            // Not counted against the restart budget.
            if let Err(e) = self.ledger.update_status_with_reason(
                &task.id,
                TaskStatus::Ready,
                "worker lost: supervisor restarted",
            ) {
                clog_error!("Recovery of task {} failed: {}", task.id, e);
                continue;
            }
            if let Some(context) = task.context.clone() {
                self.discard_context(context).await;
            }
        }

        let live: HashSet<PathBuf> = self
            .ledger
            .tasks()
            .into_iter()
            .filter_map(|t| t.context.as_ref().map(|c| c.path.clone()))
            .collect();
        let coordinator = Arc::clone(&self.coordinator);
        match blocking(move || coordinator.cleanup_orphans(&live)).await {
            Ok(0) => {}
            Ok(n) => clog!("Removed {} orphaned context(s)", n),
            Err(e) => clog_warn!("Orphaned context cleanup failed: {}", e),
        }
    }

    async fn poll_inbox(&mut self) {
        for request in self.inbox.take() {
            let outcome = match request {
                InboxRequest::AddTasks { tasks } => self.add_tasks(tasks).map(|ids| {
                    clog!("Inbox: added {} task(s)", ids.len());
                }),
                InboxRequest::Retry { task } => self.ledger.retry(&task),
                InboxRequest::Cancel { task, requeue } => self.cancel(&task, requeue).await,
            };
            if let Err(e) = outcome {
                clog_error!("Inbox request failed: {}", e);
            }
        }
    }

    async fn handle_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::AddTasks(tasks, reply) => {
                let _ = reply.send(self.add_tasks(tasks));
            }
            ControlCommand::Retry(task, reply) => {
                let _ = reply.send(self.ledger.retry(&task));
            }
            ControlCommand::Cancel {
                task,
                requeue,
                reply,
            } => {
                let result = self.cancel(&task, requeue).await;
                let _ = reply.send(result);
            }
            ControlCommand::Snapshot(reply) => {
                let _ = reply.send(self.ledger.snapshot());
            }
        }
        self.publish_changes();
    }

    fn add_tasks(&mut self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        tasks
            .into_iter()
            .map(|task| self.ledger.add_task(task))
            .collect()
    }

    async fn drain_messages(&mut self) {
        let limit = self.bus.capacity();
        for _ in 0..limit {
            let Some(message) = self.bus.try_receive(SUPERVISOR) else {
                break;
            };
            self.handle_message(message).await;
        }
    }

    async fn handle_message(&mut self, message: Message) {
        if message.category != Category::WorkerReport {
            clog_debug!(
                "Message from {} ({:?}) ignored",
                message.sender,
                message.category
            );
            return;
        }
        let envelope: WorkerEnvelope = match message.payload_as() {
            Ok(envelope) => envelope,
            Err(_) => {
                clog_debug!("Message from {}: {}", message.sender, message.payload);
                return;
            }
        };
        let current = self
            .pool
            .get(&envelope.worker)
            .map(|w| w.task_id() == &envelope.task)
            .unwrap_or(false);
        if !current {
            clog_trace!("Stale report from worker {} ignored", envelope.worker);
            return;
        }
        if let Some(handle) = self.pool.get_mut(&envelope.worker) {
            handle.mark_busy();
        }

        match envelope.report {
            WorkerReport::Heartbeat => {}
            WorkerReport::Progress { message } => {
                clog_debug!("[{}] {}", envelope.task, message);
            }
            WorkerReport::Completed { summary } => {
                self.complete(envelope.worker, &envelope.task, summary).await;
            }
            WorkerReport::Failed { reason } => {
                self.fail_worker(envelope.worker, &envelope.task, &reason)
                    .await;
            }
            WorkerReport::Send { .. } => {}
        }
    }

    async fn dispatch(&mut self) {
        if !self.pool.has_capacity() {
            return;
        }
        let snapshot = self.ledger.snapshot();
        let batch = self.scheduler.plan(&snapshot);
        for id in &batch.tasks {
            if let Err(e) = self.dispatch_task(id).await {
                clog_error!("Dispatch of task {} failed: {}", id, e);
            }
        }
    }

    async fn dispatch_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .ledger
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        for step in task.status.path_to_ready() {
            self.ledger.update_status(id, *step)?;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let for_context = task.clone();
        let context = match blocking(move || coordinator.create_context(&for_context)).await {
            Ok(context) => context,
            Err(e) => {
                self.handle_task_failure(id, &format!("context creation failed: {}", e))
                    .await?;
                return Err(e);
            }
        };

        let worker = WorkerId::new();
        if let Err(e) = self.ledger.start_task(id, worker, context.clone()) {
            self.discard_context(context).await;
            return Err(e);
        }

        let command = WorkerCommand::from_config(&self.config, &task.role);
        match self.pool.spawn(worker, &command, &task, &context) {
            Ok(_) => {
                if let Some(pid) = self.pool.get(&worker).and_then(|w| w.pid()) {
                    self.ledger.record_worker_pid(id, pid)?;
                }
                clog!("Task {} dispatched to worker {} ({})", id, worker, task.role);
                Ok(())
            }
            Err(e) => {
                clog_error!("Worker for task {} did not start: {}", id, e);
                self.ledger.record_role_outcome(&task.role, false)?;
                self.handle_task_failure(id, &e.to_string()).await
            }
        }
    }

    async fn monitor(&mut self) {
        if !self.health.due() {
            return;
        }
        for event in self.health.check(&mut self.pool) {
            match event {
                HealthEvent::Unresponsive { worker, task, idle } => {
                    let reason = Error::WorkerUnresponsive { worker, idle }.to_string();
                    self.alert(&task, &reason, json!({ "idle_secs": idle.as_secs() }));
                    self.fail_worker(worker, &task, &reason).await;
                }
                HealthEvent::Exited { worker, task, code } => {
                    if let Some(handle) = self.pool.get_mut(&worker) {
                        handle.flush_output(OUTPUT_FLUSH).await;
                    }
                    self.drain_messages().await;
                    if !self.pool.contains(&worker) {
                        continue;
                    }
                    if code == Some(0) {
                        self.complete(worker, &task, None).await;
                    } else {
                        let reason = match code {
                            Some(code) => format!("worker exited with code {}", code),
                            None => "worker killed by signal".to_string(),
                        };
                        self.fail_worker(worker, &task, &reason).await;
                    }
                }
            }
        }
    }

    /// The worker finished its task: `Running -> AwaitingMerge`.
    async fn complete(&mut self, worker: WorkerId, task: &TaskId, summary: Option<String>) {
        if let Some(handle) = self.pool.get_mut(&worker) {
            handle.mark_idle();
        }
        match self.pool.stop(&worker, true).await {
            Ok(handle) => clog_debug!("Worker {} ran for {:?}", worker, handle.uptime()),
            Err(e) => clog_warn!("Stopping worker {} failed: {}", worker, e),
        }
        let Some(current) = self.ledger.get(task).cloned() else {
            return;
        };
        if current.status != TaskStatus::Running || current.worker_id != Some(worker) {
            return;
        }
        let reason = summary.unwrap_or_else(|| "completed".to_string());
        let result = self
            .ledger
            .update_status_with_reason(task, TaskStatus::AwaitingMerge, &reason)
            .and_then(|_| self.ledger.record_role_outcome(&current.role, true));
        match result {
            Ok(_) => clog!("Task {} completed by worker {}", task, worker),
            Err(e) => clog_error!("Recording completion of {} failed: {}", task, e),
        }
    }

    /// The worker failed or hung: stop it and apply the restart policy.
    async fn fail_worker(&mut self, worker: WorkerId, task: &TaskId, reason: &str) {
        clog_warn!("Worker {} failed on task {}: {}", worker, task, reason);
        if self.pool.contains(&worker) {
            if let Err(e) = self.pool.stop(&worker, true).await {
                clog_warn!("Stopping worker {} failed: {}", worker, e);
            }
        }
        let Some(current) = self.ledger.get(task).cloned() else {
            return;
        };
        if current.status != TaskStatus::Running || current.worker_id != Some(worker) {
            return;
        }
        let result = match self.ledger.record_role_outcome(&current.role, false) {
            Ok(_) => self.handle_task_failure(task, reason).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            clog_error!("Recording failure of {} failed: {}", task, e);
        }
    }

    /// Count a failure against a running or ready task, then requeue it with
    /// backoff or give up once the restart budget is spent. Its context is
    /// discarded.
    async fn handle_task_failure(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let task = self
            .ledger
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        let failures = task.failures + 1;
        let max = self.health.config().max_restarts;
        let action = self.health.decide(failures);
        let backoff = match action {
            RecoveryAction::Restart { backoff } => backoff,
            RecoveryAction::GiveUp => Duration::ZERO,
        };
        self.ledger.record_failure(id, reason, backoff)?;

        match action {
            RecoveryAction::Restart { backoff } => {
                clog!(
                    "Task {} requeued (restart {}/{}, backoff {:?})",
                    id,
                    failures,
                    max,
                    backoff
                );
                if task.status == TaskStatus::Running {
                    self.ledger.update_status_with_reason(
                        id,
                        TaskStatus::Ready,
                        &format!("restart {}/{}: {}", failures, max, reason),
                    )?;
                }
            }
            RecoveryAction::GiveUp => {
                let reason = format!("restart budget of {} exhausted: {}", max, reason);
                clog_error!("Task {} failed: {}", id, reason);
                self.ledger
                    .update_status_with_reason(id, TaskStatus::Failed, &reason)?;
                self.alert(id, &reason, json!({ "failures": failures }));
            }
        }
        if let Some(context) = task.context {
            self.discard_context(context).await;
        }
        Ok(())
    }

    async fn cancel(&mut self, id: &TaskId, requeue: bool) -> Result<()> {
        let task = self
            .ledger
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        if task.status == TaskStatus::Running {
            if let Some(worker) = task.worker_id.filter(|w| self.pool.contains(w)) {
                self.pool.stop(&worker, true).await?;
            }
        }
        let target = if requeue {
            TaskStatus::Ready
        } else {
            TaskStatus::Failed
        };
        self.ledger
            .update_status_with_reason(id, target, "cancelled")?;
        clog!("Task {} cancelled ({})", id, target);
        if task.status.is_in_flight() {
            if let Some(context) = task.context {
                self.discard_context(context).await;
            }
        }
        Ok(())
    }

    /// Merge every task awaiting merge, in priority order.
    async fn reconcile(&mut self) {
        let snapshot = self.ledger.snapshot();
        let mut items = Vec::new();
        for task in snapshot.with_status(TaskStatus::AwaitingMerge) {
            match &task.context {
                Some(context) => items.push((task.clone(), context.clone())),
                None => {
                    if let Err(e) = self.ledger.update_status_with_reason(
                        &task.id,
                        TaskStatus::Failed,
                        "no execution context to merge",
                    ) {
                        clog_error!("Failing task {} failed: {}", task.id, e);
                    }
                }
            }
        }
        if items.is_empty() {
            return;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let results = match blocking(move || Ok(coordinator.merge_all(items))).await {
            Ok(results) => results,
            Err(e) => {
                clog_error!("Merge pass aborted: {}", e);
                return;
            }
        };

        for (id, result) in results {
            let update = match result {
                Ok(outcome) => {
                    let commit = outcome.commit();
                    let short = &commit[..commit.len().min(12)];
                    self.ledger.update_status_with_reason(
                        &id,
                        TaskStatus::Done,
                        &format!("merged as {}", short),
                    )
                }
                Err(e) => {
                    let detail = match &e {
                        Error::MergeConflict { conflicts, .. } => {
                            json!({ "conflicts": conflicts })
                        }
                        _ => json!({}),
                    };
                    let reason = e.to_string();
                    self.alert(&id, &reason, detail);
                    self.ledger
                        .update_status_with_reason(&id, TaskStatus::Failed, &reason)
                }
            };
            if let Err(e) = update {
                clog_error!("Recording merge result for {} failed: {}", id, e);
            }
        }
    }

    async fn discard_context(&self, context: ExecutionContext) {
        let coordinator = Arc::clone(&self.coordinator);
        let task = context.task_id.clone();
        if let Err(e) = blocking(move || coordinator.discard(&context)).await {
            clog_warn!("Discarding context of {} failed: {}", task, e);
        }
    }

    /// Broadcast every status change recorded since the last call.
    fn publish_changes(&mut self) {
        for change in self.ledger.take_changes() {
            let payload = match serde_json::to_value(&change) {
                Ok(payload) => payload,
                Err(e) => {
                    clog_warn!("Status change not encodable: {}", e);
                    continue;
                }
            };
            if let Err(e) = self
                .bus
                .broadcast(Message::broadcast(SUPERVISOR, Category::StatusChange, payload))
            {
                clog_warn!("Status change for {} not delivered: {}", change.task, e);
            }
        }
    }

    fn alert(&self, task: &TaskId, reason: &str, detail: serde_json::Value) {
        let payload = json!({ "task": task, "reason": reason, "detail": detail });
        let message = Message::broadcast(SUPERVISOR, Category::HealthAlert, payload)
            .with_priority(Priority::High);
        if let Err(e) = self.bus.broadcast(message) {
            clog_warn!("Health alert for {} not delivered: {}", task, e);
        }
    }

    async fn shutdown(mut self) -> Result<()> {
        self.set_state(SupervisorState::ShuttingDown);
        clog!("Supervisor shutting down");
        self.drain_messages().await;

        let forced = self
            .pool
            .shutdown(self.config.supervisor.drain_timeout())
            .await;
        if forced > 0 {
            clog_warn!("{} worker(s) force-stopped", forced);
        }

        let snapshot = self.ledger.snapshot();
        for task in snapshot.with_status(TaskStatus::Running) {
            if let Err(e) = self.ledger.update_status_with_reason(
                &task.id,
                TaskStatus::Ready,
                "supervisor shutdown",
            ) {
                clog_error!("Requeueing task {} failed: {}", task.id, e);
                continue;
            }
            if let Some(context) = task.context.clone() {
                self.discard_context(context).await;
            }
        }
        self.reconcile().await;
        self.publish_changes();

        self.ledger.checkpoint()?;
        self.bus.unregister(SUPERVISOR);
        clog!("Supervisor stopped");
        Ok(())
    }
}
