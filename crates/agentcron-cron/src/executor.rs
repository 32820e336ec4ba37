//! Executor: admission, bounded concurrency, FIFO queueing and stop
//! handling for agent runs.
//!
//! All bookkeeping lives in one [`State`] behind a std mutex that is never
//! held across an `.await`. Persistence and registry updates happen after
//! the lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentcron_config::ExecutorSettings;
use agentcron_types::{
    ActiveExecution, ExecutionRecord, ExecutionStatus, ExecutorConfig, ExecutorStats,
    ScheduledTask, TriggerKind,
};

use crate::clock::Clock;
use crate::error::{CronError, Result};
use crate::history::ExecutionHistory;
use crate::invoker::{AgentInvoker, InvocationOutcome, InvocationRequest};
use crate::registry::TaskRegistry;

const EVENT_CAPACITY: usize = 256;

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: String,
    pub agent_id: String,
    pub project_path: Option<String>,
    pub trigger: TriggerKind,
}

impl RunRequest {
    pub fn for_task(task: &ScheduledTask, trigger: TriggerKind) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            project_path: task.project_path.clone(),
            trigger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Removed from the queue before it ever started.
    Dequeued,
    /// Cancellation was requested from the running invocation.
    Signalled,
    /// No queued or running execution has that id.
    NotFound,
}

/// Broadcast when an execution reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_concurrent: u32,
    pub stop_grace: Duration,
    pub error_message_limit: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorOptions {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            stop_grace: Duration::from_secs(settings.stop_grace_secs),
            error_message_limit: settings.error_message_limit,
        }
    }
}

struct Pending {
    execution_id: String,
    request: RunRequest,
    submitted_at: DateTime<Utc>,
    /// The record is in storage; only persisted entries may be promoted.
    persisted: bool,
    stop_requested: bool,
}

struct Running {
    request: RunRequest,
    submitted_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    stop_requested: bool,
}

/// A run that has just taken a slot and must be launched.
struct Launch {
    execution_id: String,
    request: RunRequest,
    submitted_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    running: HashMap<String, Running>,
    queue: VecDeque<Pending>,
    /// taskId -> executionId for every queued or running execution.
    by_task: HashMap<String, String>,
}

impl State {
    fn release_task(&mut self, task_id: &str, execution_id: &str) {
        if self.by_task.get(task_id).is_some_and(|id| id == execution_id) {
            self.by_task.remove(task_id);
        }
    }
}

struct Inner {
    invoker: Arc<dyn AgentInvoker>,
    history: ExecutionHistory,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    max_concurrent: AtomicU32,
    stop_grace: Duration,
    error_message_limit: usize,
    completed: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicU64,
    events: broadcast::Sender<ExecutionEvent>,
}

#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        history: ExecutionHistory,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        options: ExecutorOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                invoker,
                history,
                registry,
                clock,
                state: Mutex::new(State::default()),
                max_concurrent: AtomicU32::new(options.max_concurrent),
                stop_grace: options.stop_grace,
                error_message_limit: options.error_message_limit,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                stopped: AtomicU64::new(0),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("executor state lock poisoned")
    }

    fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::SeqCst) as usize
    }

    // ─── Admission ───────────────────────────────────

    /// Admit a run. It starts at once when a slot is free, otherwise it
    /// waits in the FIFO queue.
    ///
    /// Fails with [`CronError::AlreadyRunning`] while the task has another
    /// execution queued or running.
    pub async fn submit(&self, request: RunRequest) -> Result<String> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let submitted_at = self.inner.clock.now();

        let cancel = {
            let mut state = self.state();
            if let Some(existing) = state.by_task.get(&request.task_id) {
                return Err(CronError::AlreadyRunning {
                    task_id: request.task_id.clone(),
                    execution_id: existing.clone(),
                });
            }
            state
                .by_task
                .insert(request.task_id.clone(), execution_id.clone());

            if state.running.len() < self.max_concurrent() {
                let cancel = CancellationToken::new();
                state.running.insert(
                    execution_id.clone(),
                    Running {
                        request: request.clone(),
                        submitted_at,
                        started_at: submitted_at,
                        cancel: cancel.clone(),
                        stop_requested: false,
                    },
                );
                Some(cancel)
            } else {
                state.queue.push_back(Pending {
                    execution_id: execution_id.clone(),
                    request: request.clone(),
                    submitted_at,
                    persisted: false,
                    stop_requested: false,
                });
                None
            }
        };

        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            task_id: request.task_id.clone(),
            agent_id: request.agent_id.clone(),
            trigger: request.trigger,
            status: if cancel.is_some() {
                ExecutionStatus::Running
            } else {
                ExecutionStatus::Queued
            },
            submitted_at,
            started_at: cancel.is_some().then_some(submitted_at),
            finished_at: None,
            error_message: None,
        };
        if let Err(e) = self.inner.history.record_submitted(&record).await {
            self.rollback(&execution_id, &request.task_id).await;
            return Err(e);
        }

        match cancel {
            Some(cancel) => {
                info!(
                    execution_id = %execution_id,
                    task_id = %request.task_id,
                    trigger = request.trigger.as_str(),
                    "Execution started"
                );
                self.begin(Launch {
                    execution_id: execution_id.clone(),
                    request,
                    submitted_at,
                    started_at: submitted_at,
                    cancel,
                })
                .await;
            }
            None => {
                info!(
                    execution_id = %execution_id,
                    task_id = %request.task_id,
                    trigger = request.trigger.as_str(),
                    "Execution queued"
                );
                self.mark_persisted(&execution_id).await;
            }
        }
        Ok(execution_id)
    }

    /// Undo a reservation whose record could not be stored.
    async fn rollback(&self, execution_id: &str, task_id: &str) {
        let launches = {
            let mut state = self.state();
            if let Some(entry) = state.running.remove(execution_id) {
                entry.cancel.cancel();
            }
            if let Some(pos) = state
                .queue
                .iter()
                .position(|p| p.execution_id == execution_id)
            {
                // A stop was already reported as a dequeue.
                if state.queue.remove(pos).is_some_and(|p| p.stop_requested) {
                    self.inner.stopped.fetch_add(1, Ordering::SeqCst);
                    info!(execution_id, task_id, "Queued execution stopped before it was stored");
                }
            }
            state.release_task(task_id, execution_id);
            self.promote_locked(&mut state)
        };
        for launch in launches {
            self.start_promoted(launch).await;
        }
    }

    async fn mark_persisted(&self, execution_id: &str) {
        let (stopped, launches) = {
            let mut state = self.state();
            let mut stopped = None;
            if let Some(pos) = state
                .queue
                .iter()
                .position(|p| p.execution_id == execution_id)
            {
                if state.queue[pos].stop_requested {
                    if let Some(pending) = state.queue.remove(pos) {
                        state.release_task(&pending.request.task_id, execution_id);
                        self.inner.stopped.fetch_add(1, Ordering::SeqCst);
                        stopped = Some(pending);
                    }
                } else {
                    state.queue[pos].persisted = true;
                }
            }
            (stopped, self.promote_locked(&mut state))
        };

        if let Some(pending) = stopped {
            self.complete(self.unstarted_record(&pending), false).await;
        }
        for launch in launches {
            self.start_promoted(launch).await;
        }
    }

    /// Move queued work into free slots, oldest first.
    fn promote_locked(&self, state: &mut State) -> Vec<Launch> {
        let max = self.max_concurrent();
        let now = self.inner.clock.now();
        let mut launches = Vec::new();
        while state.running.len() < max {
            if !state.queue.front().is_some_and(|p| p.persisted) {
                break;
            }
            let Some(pending) = state.queue.pop_front() else {
                break;
            };
            let cancel = CancellationToken::new();
            state.running.insert(
                pending.execution_id.clone(),
                Running {
                    request: pending.request.clone(),
                    submitted_at: pending.submitted_at,
                    started_at: now,
                    cancel: cancel.clone(),
                    stop_requested: false,
                },
            );
            launches.push(Launch {
                execution_id: pending.execution_id,
                request: pending.request,
                submitted_at: pending.submitted_at,
                started_at: now,
                cancel,
            });
        }
        launches
    }

    async fn start_promoted(&self, launch: Launch) {
        let record = ExecutionRecord {
            execution_id: launch.execution_id.clone(),
            task_id: launch.request.task_id.clone(),
            agent_id: launch.request.agent_id.clone(),
            trigger: launch.request.trigger,
            status: ExecutionStatus::Running,
            submitted_at: launch.submitted_at,
            started_at: Some(launch.started_at),
            finished_at: None,
            error_message: None,
        };
        if let Err(e) = self.inner.history.record_started(&record).await {
            warn!(execution_id = %launch.execution_id, error = %e, "Failed to persist execution start");
        }
        info!(
            execution_id = %launch.execution_id,
            task_id = %launch.request.task_id,
            "Queued execution started"
        );
        self.begin(launch).await;
    }

    async fn begin(&self, launch: Launch) {
        if let Err(e) = self
            .inner
            .registry
            .mark_running(&launch.request.task_id, launch.started_at)
            .await
        {
            warn!(task_id = %launch.request.task_id, error = %e, "Failed to mark task running");
        }
        self.spawn_run(launch);
    }

    fn spawn_run(&self, launch: Launch) {
        let this = self.clone();
        tokio::spawn(async move {
            let request = InvocationRequest {
                execution_id: launch.execution_id.clone(),
                task_id: launch.request.task_id.clone(),
                agent_id: launch.request.agent_id.clone(),
                project_path: launch.request.project_path.clone(),
                trigger: launch.request.trigger,
            };
            let invoker = this.inner.invoker.clone();
            let cancel = launch.cancel.clone();
            // Run on its own task so a panicking invoker still frees its slot.
            let outcome =
                tokio::spawn(async move { invoker.invoke(&request, cancel).await }).await;

            let stop_requested = launch.cancel.is_cancelled();
            let (status, error) = match outcome {
                Ok(Ok(InvocationOutcome::Completed { summary })) => {
                    if let Some(summary) = summary {
                        debug!(execution_id = %launch.execution_id, summary = %summary, "Agent output");
                    }
                    if stop_requested {
                        (ExecutionStatus::Stopped, None)
                    } else {
                        (ExecutionStatus::Success, None)
                    }
                }
                Ok(Ok(InvocationOutcome::Cancelled)) => (ExecutionStatus::Stopped, None),
                Ok(Err(_)) if stop_requested => (ExecutionStatus::Stopped, None),
                Ok(Err(e)) => (
                    ExecutionStatus::Error,
                    Some(truncate_message(format!("{e:#}"), this.inner.error_message_limit)),
                ),
                Err(join) => (
                    ExecutionStatus::Error,
                    Some(truncate_message(
                        format!("agent invocation panicked: {join}"),
                        this.inner.error_message_limit,
                    )),
                ),
            };
            this.finish(&launch.execution_id, status, error).await;
        });
    }

    async fn finish(&self, execution_id: &str, status: ExecutionStatus, error: Option<String>) {
        let finished_at = self.inner.clock.now();
        let (entry, launches) = {
            let mut state = self.state();
            let Some(entry) = state.running.remove(execution_id) else {
                debug!(execution_id, "Result of detached execution ignored");
                return;
            };
            state.release_task(&entry.request.task_id, execution_id);
            self.count(status);
            (entry, self.promote_locked(&mut state))
        };

        match (status, &error) {
            (ExecutionStatus::Error, Some(message)) => {
                let err = CronError::ExecutionFailed {
                    execution_id: execution_id.to_string(),
                    message: message.clone(),
                };
                warn!(task_id = %entry.request.task_id, error = %err, "Execution failed");
            }
            _ => info!(
                execution_id,
                task_id = %entry.request.task_id,
                status = %status,
                "Execution finished"
            ),
        }

        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            task_id: entry.request.task_id.clone(),
            agent_id: entry.request.agent_id.clone(),
            trigger: entry.request.trigger,
            status,
            submitted_at: entry.submitted_at,
            started_at: Some(entry.started_at),
            finished_at: Some(finished_at),
            error_message: error,
        };
        self.complete(record, true).await;

        for launch in launches {
            self.start_promoted(launch).await;
        }
    }

    /// Persist a terminal record, update the owning task and notify
    /// subscribers.
    async fn complete(&self, record: ExecutionRecord, ran: bool) {
        let finished_at = record.finished_at.unwrap_or_else(|| self.inner.clock.now());
        if let Err(e) = self.inner.history.record_finished(&record).await {
            warn!(execution_id = %record.execution_id, error = %e, "Failed to persist execution result");
        }
        if let Err(e) = self
            .inner
            .registry
            .record_completion(
                &record.task_id,
                record.status,
                finished_at,
                record.error_message.as_deref(),
                ran,
            )
            .await
        {
            warn!(task_id = %record.task_id, error = %e, "Failed to update task after execution");
        }
        let _ = self.inner.events.send(ExecutionEvent {
            execution_id: record.execution_id,
            task_id: record.task_id,
            status: record.status,
            finished_at,
            error_message: record.error_message,
        });
    }

    fn count(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Success => &self.inner.completed,
            ExecutionStatus::Error => &self.inner.failed,
            ExecutionStatus::Stopped => &self.inner.stopped,
            ExecutionStatus::Queued | ExecutionStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn unstarted_record(&self, pending: &Pending) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: pending.execution_id.clone(),
            task_id: pending.request.task_id.clone(),
            agent_id: pending.request.agent_id.clone(),
            trigger: pending.request.trigger,
            status: ExecutionStatus::Stopped,
            submitted_at: pending.submitted_at,
            started_at: None,
            finished_at: Some(self.inner.clock.now()),
            error_message: None,
        }
    }

    // ─── Stop ───────────────────────────────────

    /// Stop a queued or running execution.
    ///
    /// Queued executions are dropped without ever reaching the invoker.
    /// Running ones are cancelled; if the invoker has not returned within
    /// the stop grace period the execution is detached and its slot freed.
    pub async fn stop(&self, execution_id: &str) -> StopOutcome {
        enum Action {
            Dequeued(Pending, Vec<Launch>),
            Deferred,
            Signalled,
            AlreadySignalled,
            NotFound,
        }

        let action = {
            let mut state = self.state();
            if let Some(pos) = state
                .queue
                .iter()
                .position(|p| p.execution_id == execution_id)
            {
                if !state.queue[pos].persisted {
                    state.queue[pos].stop_requested = true;
                    Action::Deferred
                } else if let Some(pending) = state.queue.remove(pos) {
                    state.release_task(&pending.request.task_id, execution_id);
                    self.inner.stopped.fetch_add(1, Ordering::SeqCst);
                    let launches = self.promote_locked(&mut state);
                    Action::Dequeued(pending, launches)
                } else {
                    Action::NotFound
                }
            } else if let Some(entry) = state.running.get_mut(execution_id) {
                if entry.stop_requested {
                    Action::AlreadySignalled
                } else {
                    entry.stop_requested = true;
                    entry.cancel.cancel();
                    Action::Signalled
                }
            } else {
                Action::NotFound
            }
        };

        match action {
            Action::Dequeued(pending, launches) => {
                info!(execution_id, task_id = %pending.request.task_id, "Queued execution stopped");
                self.complete(self.unstarted_record(&pending), false).await;
                for launch in launches {
                    self.start_promoted(launch).await;
                }
                StopOutcome::Dequeued
            }
            Action::Deferred => StopOutcome::Dequeued,
            Action::Signalled => {
                info!(execution_id, "Stop requested for running execution");
                self.spawn_reaper(execution_id.to_string());
                StopOutcome::Signalled
            }
            Action::AlreadySignalled => StopOutcome::Signalled,
            Action::NotFound => StopOutcome::NotFound,
        }
    }

    fn spawn_reaper(&self, execution_id: String) {
        let this = self.clone();
        let grace = self.inner.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.detach(&execution_id).await;
        });
    }

    /// Give up on a stopped execution whose invoker ignored cancellation.
    async fn detach(&self, execution_id: &str) {
        let (entry, launches) = {
            let mut state = self.state();
            if !state
                .running
                .get(execution_id)
                .is_some_and(|e| e.stop_requested)
            {
                return;
            }
            let Some(entry) = state.running.remove(execution_id) else {
                return;
            };
            state.release_task(&entry.request.task_id, execution_id);
            self.inner.stopped.fetch_add(1, Ordering::SeqCst);
            (entry, self.promote_locked(&mut state))
        };

        let err = CronError::CancellationTimeout {
            execution_id: execution_id.to_string(),
            grace_secs: self.inner.stop_grace.as_secs(),
        };
        warn!(task_id = %entry.request.task_id, error = %err, "Execution detached");

        let record = ExecutionRecord {
            execution_id: execution_id.to_string(),
            task_id: entry.request.task_id.clone(),
            agent_id: entry.request.agent_id.clone(),
            trigger: entry.request.trigger,
            status: ExecutionStatus::Stopped,
            submitted_at: entry.submitted_at,
            started_at: Some(entry.started_at),
            finished_at: Some(self.inner.clock.now()),
            error_message: Some(truncate_message(
                err.to_string(),
                self.inner.error_message_limit,
            )),
        };
        self.complete(record, true).await;

        for launch in launches {
            self.start_promoted(launch).await;
        }
    }

    /// Stop all queued work and cancel all running work, waiting up to the
    /// stop grace period for running invocations to return.
    pub async fn shutdown(&self) {
        let queued: Vec<Pending> = {
            let mut state = self.state();
            let queued: Vec<Pending> = state.queue.drain(..).collect();
            for pending in &queued {
                state.release_task(&pending.request.task_id, &pending.execution_id);
            }
            self.inner
                .stopped
                .fetch_add(queued.len() as u64, Ordering::SeqCst);
            for entry in state.running.values_mut() {
                entry.stop_requested = true;
                entry.cancel.cancel();
            }
            queued
        };
        for pending in &queued {
            self.complete(self.unstarted_record(pending), false).await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.stop_grace;
        while self.running_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.running_count();
        if remaining > 0 {
            warn!(remaining, "Executor shut down with executions still running");
        } else {
            info!("Executor shut down");
        }
    }

    // ─── Introspection / config ───────────────────────────────────

    fn running_count(&self) -> usize {
        self.state().running.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        let state = self.state();
        ExecutorStats {
            running_tasks: state.running.len() as u64,
            queued_tasks: state.queue.len() as u64,
            completed_tasks: self.inner.completed.load(Ordering::SeqCst),
            failed_tasks: self.inner.failed.load(Ordering::SeqCst),
            stopped_tasks: self.inner.stopped.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.inner.max_concurrent.load(Ordering::SeqCst),
        }
    }

    /// Change the concurrency limit for future admissions.
    ///
    /// Running work is never evicted; a raised limit promotes queued work
    /// straight away.
    pub async fn set_max_concurrent(&self, max_concurrent: u32) -> Result<ExecutorConfig> {
        ExecutorConfig { max_concurrent }
            .validate()
            .map_err(CronError::Validation)?;
        let previous = self
            .inner
            .max_concurrent
            .swap(max_concurrent, Ordering::SeqCst);
        if previous != max_concurrent {
            info!(previous, max_concurrent, "Executor concurrency changed");
        }

        if max_concurrent > previous {
            let launches = {
                let mut state = self.state();
                self.promote_locked(&mut state)
            };
            for launch in launches {
                self.start_promoted(launch).await;
            }
        }
        Ok(self.config())
    }

    /// Running executions (oldest start first) followed by the queue in
    /// admission order.
    pub fn active(&self) -> Vec<ActiveExecution> {
        let state = self.state();
        let mut running: Vec<ActiveExecution> = state
            .running
            .iter()
            .map(|(id, entry)| ActiveExecution {
                execution_id: id.clone(),
                task_id: entry.request.task_id.clone(),
                status: ExecutionStatus::Running,
                trigger: entry.request.trigger,
                submitted_at: entry.submitted_at,
                started_at: Some(entry.started_at),
            })
            .collect();
        running.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        });
        running.extend(state.queue.iter().map(|pending| ActiveExecution {
            execution_id: pending.execution_id.clone(),
            task_id: pending.request.task_id.clone(),
            status: ExecutionStatus::Queued,
            trigger: pending.request.trigger,
            submitted_at: pending.submitted_at,
            started_at: None,
        }));
        running
    }

    /// The queued or running execution of a task, if any.
    pub fn execution_for_task(&self, task_id: &str) -> Option<String> {
        self.state().by_task.get(task_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }
}

/// Cut `message` to at most `limit` characters.
fn truncate_message(message: String, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message;
    }
    let keep = limit.saturating_sub(3);
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, Mode, next_event};
    use agentcron_types::{RunStatus, ScheduleSpec};

    fn manual(task: &ScheduledTask) -> RunRequest {
        RunRequest::for_task(task, TriggerKind::Manual)
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short".into(), 10), "short");
        let long = truncate_message("x".repeat(100), 10);
        assert_eq!(long.chars().count(), 10);
        assert!(long.ends_with("..."));
    }

    #[tokio::test]
    async fn test_successful_run_is_recorded() {
        let h = Harness::new(Mode::Succeed, 3).await;
        let task = h.interval_task("report", 60).await;
        let mut events = h.executor.subscribe();

        let execution_id = h.executor.submit(manual(&task)).await.unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.execution_id, execution_id);
        assert_eq!(event.status, ExecutionStatus::Success);

        let stats = h.executor.stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.running_tasks, 0);
        assert!(h.executor.execution_for_task(&task.id).is_none());

        let record = h.history.get(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.trigger, TriggerKind::Manual);
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());

        let task = h.registry.get(&task.id).await.unwrap();
        assert_eq!(task.last_run_status, RunStatus::Success);
        assert!(task.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_second_submission_rejected_while_in_flight() {
        let h = Harness::new(Mode::Block, 3).await;
        let task = h.interval_task("report", 60).await;
        let mut events = h.executor.subscribe();

        let first = h.executor.submit(manual(&task)).await.unwrap();
        let err = h.executor.submit(manual(&task)).await.unwrap_err();
        match err {
            CronError::AlreadyRunning { execution_id, .. } => assert_eq!(execution_id, first),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(h.executor.execution_for_task(&task.id), Some(first.clone()));

        h.invoker.release(1);
        assert_eq!(next_event(&mut events).await.execution_id, first);
        assert!(h.executor.submit(manual(&task)).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_admit_exactly_one() {
        let h = Harness::new(Mode::Block, 3).await;
        let task = h.interval_task("report", 60).await;

        let attempts = (0..16).map(|_| {
            let executor = h.executor.clone();
            let request = manual(&task);
            tokio::spawn(async move { executor.submit(request).await })
        });
        let results = futures::future::join_all(attempts).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(h.executor.stats().running_tasks, 1);
    }

    #[tokio::test]
    async fn test_limit_and_fifo_promotion() {
        let h = Harness::new(Mode::Block, 1).await;
        let mut tasks = Vec::new();
        for name in ["a", "b", "c", "d"] {
            tasks.push(h.interval_task(name, 60).await);
        }
        let mut events = h.executor.subscribe();
        for task in &tasks {
            h.executor.submit(manual(task)).await.unwrap();
        }

        let stats = h.executor.stats();
        assert_eq!(stats.running_tasks, 1);
        assert_eq!(stats.queued_tasks, 3);
        let active = h.executor.active();
        assert_eq!(active[0].status, ExecutionStatus::Running);
        assert_eq!(active[0].task_id, tasks[0].id);
        let queued: Vec<_> = active[1..].iter().map(|a| a.task_id.clone()).collect();
        assert_eq!(queued, vec![tasks[1].id.clone(), tasks[2].id.clone(), tasks[3].id.clone()]);

        for _ in 0..4 {
            h.invoker.release(1);
            next_event(&mut events).await;
        }

        let expected: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(h.invoker.calls(), expected);
        assert_eq!(h.executor.stats().completed_tasks, 4);
    }

    #[tokio::test]
    async fn test_running_never_exceeds_limit() {
        let h = Harness::new(Mode::Block, 2).await;
        let mut events = h.executor.subscribe();
        for i in 0..5 {
            let task = h.interval_task(&format!("t{i}"), 60).await;
            h.executor.submit(manual(&task)).await.unwrap();
            assert!(h.executor.stats().running_tasks <= 2);
        }
        assert_eq!(h.executor.stats().queued_tasks, 3);

        for _ in 0..5 {
            h.invoker.release(1);
            next_event(&mut events).await;
            assert!(h.executor.stats().running_tasks <= 2);
        }
        assert_eq!(h.executor.stats().completed_tasks, 5);
    }

    #[tokio::test]
    async fn test_stop_queued_never_invokes() {
        let h = Harness::new(Mode::Block, 1).await;
        let a = h.interval_task("a", 60).await;
        let b = h.interval_task("b", 60).await;
        let mut events = h.executor.subscribe();

        h.executor.submit(manual(&a)).await.unwrap();
        let queued = h.executor.submit(manual(&b)).await.unwrap();

        assert_eq!(h.executor.stop(&queued).await, StopOutcome::Dequeued);
        let event = next_event(&mut events).await;
        assert_eq!(event.execution_id, queued);
        assert_eq!(event.status, ExecutionStatus::Stopped);

        let stats = h.executor.stats();
        assert_eq!(stats.stopped_tasks, 1);
        assert_eq!(stats.completed_tasks, 0);
        assert_eq!(stats.failed_tasks, 0);
        assert_eq!(stats.queued_tasks, 0);

        h.invoker.release(1);
        next_event(&mut events).await;
        assert_eq!(h.invoker.calls(), vec![a.id.clone()]);

        let record = h.history.get(&queued).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Stopped);
        assert!(record.started_at.is_none());
        let b = h.registry.get(&b.id).await.unwrap();
        assert_eq!(b.last_run_status, RunStatus::Idle);
        assert_eq!(b.next_run_at, Some(h.start + chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_stop_before_store_counts_when_store_fails() {
        let h = Harness::new(Mode::Block, 1).await;
        let task = h.interval_task("a", 60).await;
        let execution_id = "exec-unstored".to_string();
        {
            let mut state = h.executor.state();
            state.by_task.insert(task.id.clone(), execution_id.clone());
            state.queue.push_back(Pending {
                execution_id: execution_id.clone(),
                request: manual(&task),
                submitted_at: h.start,
                persisted: false,
                stop_requested: false,
            });
        }

        assert_eq!(h.executor.stop(&execution_id).await, StopOutcome::Dequeued);
        h.executor.rollback(&execution_id, &task.id).await;

        let stats = h.executor.stats();
        assert_eq!(stats.stopped_tasks, 1);
        assert_eq!(stats.queued_tasks, 0);
        assert!(h.executor.execution_for_task(&task.id).is_none());
        assert!(h.executor.submit(manual(&task)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_running_cooperative() {
        let h = Harness::new(Mode::Block, 1).await;
        let task = h.interval_task("a", 60).await;
        let mut events = h.executor.subscribe();

        let execution_id = h.executor.submit(manual(&task)).await.unwrap();
        assert_eq!(h.executor.stop(&execution_id).await, StopOutcome::Signalled);
        assert_eq!(h.executor.stop(&execution_id).await, StopOutcome::Signalled);

        let event = next_event(&mut events).await;
        assert_eq!(event.status, ExecutionStatus::Stopped);
        assert!(event.error_message.is_none());
        assert_eq!(h.executor.stats().stopped_tasks, 1);
        assert_eq!(
            h.registry.get(&task.id).await.unwrap().last_run_status,
            RunStatus::Idle
        );
        assert_eq!(h.executor.stop(&execution_id).await, StopOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_stop_grace_timeout_detaches() {
        let h = Harness::with_grace(Mode::IgnoreCancel, 1, Duration::from_millis(100)).await;
        let a = h.interval_task("a", 60).await;
        let b = h.interval_task("b", 60).await;
        let mut events = h.executor.subscribe();

        let stuck = h.executor.submit(manual(&a)).await.unwrap();
        let waiting = h.executor.submit(manual(&b)).await.unwrap();
        assert_eq!(h.executor.stop(&stuck).await, StopOutcome::Signalled);

        let event = next_event(&mut events).await;
        assert_eq!(event.execution_id, stuck);
        assert_eq!(event.status, ExecutionStatus::Stopped);
        assert!(
            event
                .error_message
                .as_deref()
                .is_some_and(|m| m.contains("did not acknowledge cancellation"))
        );

        // The freed slot went to the queued execution.
        let stats = h.executor.stats();
        assert_eq!(stats.stopped_tasks, 1);
        assert_eq!(stats.running_tasks, 1);
        assert_eq!(h.executor.execution_for_task(&b.id), Some(waiting));
        assert!(h.executor.execution_for_task(&a.id).is_none());
    }

    #[tokio::test]
    async fn test_failure_message_is_truncated() {
        let h = Harness::with_options(
            Mode::Fail("x".repeat(1000)),
            ExecutorOptions {
                max_concurrent: 1,
                stop_grace: Duration::from_secs(1),
                error_message_limit: 64,
            },
        )
        .await;
        let task = h.interval_task("a", 60).await;
        let mut events = h.executor.subscribe();

        let execution_id = h.executor.submit(manual(&task)).await.unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.status, ExecutionStatus::Error);

        let record = h.history.get(&execution_id).await.unwrap();
        assert_eq!(record.error_message.as_ref().map(|m| m.chars().count()), Some(64));
        assert_eq!(h.executor.stats().failed_tasks, 1);

        let task = h.registry.get(&task.id).await.unwrap();
        assert_eq!(task.last_run_status, RunStatus::Error);
        assert!(task.last_error.is_some());
    }

    #[tokio::test]
    async fn test_raising_limit_promotes_queue() {
        let h = Harness::new(Mode::Block, 1).await;
        let a = h.interval_task("a", 60).await;
        let b = h.interval_task("b", 60).await;
        h.executor.submit(manual(&a)).await.unwrap();
        h.executor.submit(manual(&b)).await.unwrap();
        assert_eq!(h.executor.stats().queued_tasks, 1);

        let config = h.executor.set_max_concurrent(2).await.unwrap();
        assert_eq!(config.max_concurrent, 2);
        let stats = h.executor.stats();
        assert_eq!(stats.running_tasks, 2);
        assert_eq!(stats.queued_tasks, 0);

        // Lowering never evicts running work.
        h.executor.set_max_concurrent(1).await.unwrap();
        assert_eq!(h.executor.stats().running_tasks, 2);
    }

    #[tokio::test]
    async fn test_limit_out_of_range_rejected() {
        let h = Harness::new(Mode::Succeed, 3).await;
        for bad in [0, 11] {
            assert!(matches!(
                h.executor.set_max_concurrent(bad).await,
                Err(CronError::Validation(_))
            ));
        }
        assert_eq!(h.executor.config().max_concurrent, 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let h = Harness::new(Mode::Block, 1).await;
        let a = h.interval_task("a", 60).await;
        let b = h.interval_task("b", 60).await;
        h.executor.submit(manual(&a)).await.unwrap();
        let queued = h.executor.submit(manual(&b)).await.unwrap();

        h.executor.shutdown().await;

        let stats = h.executor.stats();
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.queued_tasks, 0);
        assert_eq!(stats.stopped_tasks, 2);
        assert_eq!(
            h.history.get(&queued).await.unwrap().status,
            ExecutionStatus::Stopped
        );
        assert_eq!(h.invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_once_task_runs_without_rescheduling() {
        let h = Harness::new(Mode::Succeed, 1).await;
        let task = h
            .task(
                "once",
                ScheduleSpec::Once {
                    execute_at: h.start + chrono::Duration::hours(2),
                },
            )
            .await;
        let mut events = h.executor.subscribe();
        h.executor.submit(manual(&task)).await.unwrap();
        next_event(&mut events).await;

        let task = h.registry.get(&task.id).await.unwrap();
        assert_eq!(task.next_run_at, Some(h.start + chrono::Duration::hours(2)));
    }
}
