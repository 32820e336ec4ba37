//! Task registry: the cached, authoritative view of scheduled tasks.
//!
//! Every mutation is persisted before it becomes visible in the cache.
//! Multi-step sequences on one task (due check, submit, reschedule) run
//! under that task's [`TaskGuard`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

use agentcron_storage::AgentCronStorage;
use agentcron_types::{
    ExecutionStatus, NewTask, RunStatus, ScheduledTask, TaskUpdate,
};

use crate::clock::Clock;
use crate::error::{CronError, Result};
use crate::history::INTERRUPTED_MESSAGE;
use crate::schedule;

/// Exclusive access to one task's multi-step sequences.
pub struct TaskGuard {
    task_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl TaskGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

pub struct TaskRegistry {
    storage: AgentCronStorage,
    clock: Arc<dyn Clock>,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    changed: Notify,
}

impl TaskRegistry {
    pub fn new(storage: AgentCronStorage, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            tasks: RwLock::new(HashMap::new()),
            locks: std::sync::Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Load tasks from storage into the cache.
    pub async fn load(&self) -> Result<usize> {
        let tasks = self.storage.list_tasks().await?;
        let count = tasks.len();
        *self.tasks.write().await = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        info!("Loaded {count} scheduled tasks");
        self.changed.notify_one();
        Ok(count)
    }

    /// Resolves once a task changed in a way that may move the next wakeup.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub async fn lock_task(&self, task_id: &str) -> TaskGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(task_id.to_string()).or_default().clone()
        };
        TaskGuard {
            task_id: task_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    // ─── API operations ───────────────────────────────────

    pub async fn create(&self, new: NewTask) -> Result<ScheduledTask> {
        check_required("name", &new.name)?;
        check_required("agentId", &new.agent_id)?;
        schedule::validate(&new.schedule)?;

        let now = self.clock.now();
        let next_run_at = if new.enabled {
            schedule::initial_next_run(&new.schedule, now)?
        } else {
            None
        };
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            description: new.description.filter(|d| !d.trim().is_empty()),
            agent_id: new.agent_id.trim().to_string(),
            project_path: new.project_path.filter(|p| !p.trim().is_empty()),
            schedule: new.schedule,
            enabled: new.enabled,
            last_run_at: None,
            last_run_status: RunStatus::Idle,
            last_error: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        };

        let mut tasks = self.tasks.write().await;
        let task = self.commit(&mut tasks, task).await?;
        drop(tasks);

        info!(task_id = %task.id, name = %task.name, schedule = %task.schedule, "Scheduled task created");
        self.changed.notify_one();
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<ScheduledTask> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| CronError::TaskNotFound(task_id.to_string()))
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub async fn update(&self, task_id: &str, update: TaskUpdate) -> Result<ScheduledTask> {
        let guard = self.lock_task(task_id).await;
        self.update_locked(&guard, update).await
    }

    /// Flip `enabled`, recomputing or clearing `nextRunAt`.
    pub async fn toggle(&self, task_id: &str) -> Result<ScheduledTask> {
        let guard = self.lock_task(task_id).await;
        let enabled = self.get(task_id).await?.enabled;
        self.update_locked(
            &guard,
            TaskUpdate {
                enabled: Some(!enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a task and its execution history.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let guard = self.lock_task(task_id).await;
        self.delete_locked(&guard).await
    }

    pub async fn delete_locked(&self, guard: &TaskGuard) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(guard.task_id()) {
            return Err(CronError::TaskNotFound(guard.task_id().to_string()));
        }
        self.storage.delete_task(guard.task_id()).await?;
        tasks.remove(guard.task_id());
        drop(tasks);

        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(guard.task_id());
        info!(task_id = %guard.task_id(), "Scheduled task deleted");
        self.changed.notify_one();
        Ok(())
    }

    pub async fn update_locked(
        &self,
        guard: &TaskGuard,
        update: TaskUpdate,
    ) -> Result<ScheduledTask> {
        let mut tasks = self.tasks.write().await;
        let current = tasks
            .get(guard.task_id())
            .ok_or_else(|| CronError::TaskNotFound(guard.task_id().to_string()))?;
        let mut task = current.clone();
        let was_enabled = task.enabled;

        if let Some(name) = update.name {
            check_required("name", &name)?;
            task.name = name.trim().to_string();
        }
        if let Some(agent_id) = update.agent_id {
            check_required("agentId", &agent_id)?;
            task.agent_id = agent_id.trim().to_string();
        }
        if let Some(description) = update.description {
            task.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(project_path) = update.project_path {
            task.project_path = Some(project_path).filter(|p| !p.trim().is_empty());
        }
        let mut schedule_changed = false;
        if let Some(spec) = update.schedule {
            schedule::validate(&spec)?;
            schedule_changed = spec != task.schedule;
            task.schedule = spec;
        }
        if let Some(enabled) = update.enabled {
            task.enabled = enabled;
        }

        let now = self.clock.now();
        if !task.enabled {
            task.next_run_at = None;
        } else if schedule_changed || !was_enabled || task.next_run_at.is_none() {
            task.next_run_at = schedule::initial_next_run(&task.schedule, now)?;
        }
        task.updated_at = now;

        let task = self.commit(&mut tasks, task).await?;
        drop(tasks);

        debug!(task_id = %task.id, enabled = task.enabled, next_run_at = ?task.next_run_at, "Scheduled task updated");
        self.changed.notify_one();
        Ok(task)
    }

    // ─── Scheduler / executor bookkeeping ───────────────────────────────────

    /// Enabled tasks with `nextRunAt <= now`, by `nextRunAt` then id.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let mut due: Vec<_> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| is_due(t, now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        due
    }

    /// Earliest `nextRunAt` among enabled tasks.
    pub async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.enabled)
            .filter_map(|t| t.next_run_at)
            .min()
    }

    /// Whether the guarded task is still enabled and due at `now`.
    pub async fn still_due(&self, guard: &TaskGuard, now: DateTime<Utc>) -> Option<ScheduledTask> {
        self.tasks
            .read()
            .await
            .get(guard.task_id())
            .filter(|t| is_due(t, now))
            .cloned()
    }

    /// Advance the schedule after a fire at `now`.
    ///
    /// Recurring tasks move to their next trigger after `now`, so missed
    /// occurrences collapse into the one that just fired. One-shot tasks
    /// are disabled.
    pub async fn record_fired(&self, guard: &TaskGuard, now: DateTime<Utc>) -> Result<ScheduledTask> {
        let mut tasks = self.tasks.write().await;
        let mut task = tasks
            .get(guard.task_id())
            .cloned()
            .ok_or_else(|| CronError::TaskNotFound(guard.task_id().to_string()))?;

        if task.schedule.is_recurring() {
            // A run that already finished has rescheduled from its finish time.
            if task.next_run_at.is_none_or(|next| next <= now) {
                task.next_run_at = schedule::next_trigger(&task.schedule, now)?;
            }
        } else {
            task.enabled = false;
            task.next_run_at = None;
        }
        task.updated_at = now;

        let task = self.commit(&mut tasks, task).await?;
        drop(tasks);
        self.changed.notify_one();
        Ok(task)
    }

    /// Record a schedule that can no longer be evaluated.
    pub async fn mark_schedule_error(&self, guard: &TaskGuard, message: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let Some(mut task) = tasks.get(guard.task_id()).cloned() else {
            return Ok(());
        };
        task.last_run_status = RunStatus::Error;
        task.last_error = Some(message.to_string());
        task.next_run_at = None;
        task.updated_at = self.clock.now();
        self.commit(&mut tasks, task).await?;
        Ok(())
    }

    /// Mark a task as running an execution that started at `started_at`.
    pub async fn mark_running(&self, task_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let Some(mut task) = tasks.get(task_id).cloned() else {
            return Ok(());
        };
        task.last_run_status = RunStatus::Running;
        task.last_run_at = Some(started_at);
        task.updated_at = started_at;
        self.commit(&mut tasks, task).await?;
        Ok(())
    }

    /// Apply the terminal state of an execution to its task.
    ///
    /// When the execution actually ran and the task is an enabled recurring
    /// one, `nextRunAt` is measured from `finished_at`.
    pub async fn record_completion(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        finished_at: DateTime<Utc>,
        error_message: Option<&str>,
        ran: bool,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let Some(mut task) = tasks.get(task_id).cloned() else {
            debug!(task_id, "completion for deleted task ignored");
            return Ok(());
        };

        task.last_run_status = status.run_status();
        match status {
            ExecutionStatus::Success => task.last_error = None,
            ExecutionStatus::Error => task.last_error = error_message.map(String::from),
            _ => {}
        }
        if ran && task.enabled && task.schedule.is_recurring() {
            match schedule::next_trigger(&task.schedule, finished_at) {
                Ok(next) => task.next_run_at = next,
                Err(e) => {
                    warn!(task_id, error = %e, "Failed to reschedule task");
                    task.last_run_status = RunStatus::Error;
                    task.last_error = Some(e.to_string());
                    task.next_run_at = None;
                }
            }
        }
        task.updated_at = self.clock.now();

        self.commit(&mut tasks, task).await?;
        drop(tasks);
        self.changed.notify_one();
        Ok(())
    }

    /// Repair task state left behind by a previous process.
    ///
    /// Tasks stuck in `running` are failed, disabled tasks lose any
    /// `nextRunAt`, and enabled tasks without one get it recomputed.
    /// Overdue values are kept so each such task fires once.
    pub async fn repair_after_restart(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut tasks = self.tasks.write().await;
        let ids: Vec<String> = tasks.keys().cloned().collect();
        let mut repaired = 0;

        for id in ids {
            let Some(mut task) = tasks.get(&id).cloned() else {
                continue;
            };
            let mut changed = false;

            if task.last_run_status == RunStatus::Running {
                task.last_run_status = RunStatus::Error;
                task.last_error = Some(INTERRUPTED_MESSAGE.to_string());
                changed = true;
            }
            if !task.enabled && task.next_run_at.is_some() {
                task.next_run_at = None;
                changed = true;
            }
            if task.enabled && task.next_run_at.is_none() {
                match schedule::initial_next_run(&task.schedule, now) {
                    Ok(next) => task.next_run_at = next,
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Task has an invalid schedule");
                        task.last_run_status = RunStatus::Error;
                        task.last_error = Some(e.to_string());
                    }
                }
                changed = true;
            }

            if changed {
                task.updated_at = now;
                self.commit(&mut tasks, task).await?;
                repaired += 1;
            }
        }
        drop(tasks);

        if repaired > 0 {
            info!("Repaired {repaired} scheduled tasks after restart");
        }
        self.changed.notify_one();
        Ok(repaired)
    }

    async fn commit(
        &self,
        tasks: &mut HashMap<String, ScheduledTask>,
        task: ScheduledTask,
    ) -> Result<ScheduledTask> {
        self.storage.save_task(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }
}

fn is_due(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    task.enabled && task.next_run_at.is_some_and(|next| next <= now)
}

fn check_required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CronError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use agentcron_types::ScheduleSpec;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, AgentCronStorage, TaskRegistry) {
        let clock = Arc::new(ManualClock::new(t0()));
        let storage = AgentCronStorage::open_in_memory().unwrap();
        let registry = TaskRegistry::new(storage.clone(), clock.clone());
        (clock, storage, registry)
    }

    fn new_task(name: &str, schedule: ScheduleSpec) -> NewTask {
        NewTask {
            name: name.into(),
            description: None,
            agent_id: "coder".into(),
            project_path: None,
            schedule,
            enabled: true,
        }
    }

    fn hourly(name: &str) -> NewTask {
        new_task(name, ScheduleSpec::Interval { minutes: 60 })
    }

    #[tokio::test]
    async fn test_create_computes_next_run_and_persists() {
        let (_clock, storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();

        assert_eq!(task.next_run_at, Some(t0() + Duration::hours(1)));
        assert_eq!(task.last_run_status, RunStatus::Idle);
        assert_eq!(storage.get_task(&task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_schedule() {
        let (_clock, storage, registry) = setup();
        let err = registry
            .create(new_task(
                "bad",
                ScheduleSpec::Cron {
                    expression: "not a cron".into(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule(_)));
        assert!(storage.list_tasks().await.unwrap().is_empty());

        let err = registry.create(new_task(" ", ScheduleSpec::Interval { minutes: 1 })).await;
        assert!(matches!(err, Err(CronError::Validation(_))));
    }

    #[tokio::test]
    async fn test_disabled_task_has_no_next_run() {
        let (_clock, _storage, registry) = setup();
        let mut new = hourly("paused");
        new.enabled = false;
        let task = registry.create(new).await.unwrap();
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_toggle_clears_and_recomputes() {
        let (clock, _storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();

        let off = registry.toggle(&task.id).await.unwrap();
        assert!(!off.enabled);
        assert!(off.next_run_at.is_none());

        clock.advance(Duration::minutes(10));
        let on = registry.toggle(&task.id).await.unwrap();
        assert!(on.enabled);
        assert_eq!(on.next_run_at, Some(t0() + Duration::minutes(70)));
    }

    #[tokio::test]
    async fn test_schedule_update_recomputes_next_run() {
        let (_clock, _storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();

        let updated = registry
            .update(
                &task.id,
                TaskUpdate {
                    schedule: Some(ScheduleSpec::Interval { minutes: 5 }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.next_run_at, Some(t0() + Duration::minutes(5)));

        let renamed = registry
            .update(
                &task.id,
                TaskUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "renamed");
        assert_eq!(renamed.next_run_at, updated.next_run_at);
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let (_clock, _storage, registry) = setup();
        let err = registry.update("missing", TaskUpdate::default()).await;
        assert!(matches!(err, Err(CronError::TaskNotFound(_))));
        assert!(matches!(
            registry.delete("missing").await,
            Err(CronError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_from_cache_and_storage() {
        let (_clock, storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();
        registry.delete(&task.id).await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(storage.get_task(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_tasks_ordered_by_next_run_then_id() {
        let (clock, _storage, registry) = setup();
        let a = registry
            .create(new_task("a", ScheduleSpec::Interval { minutes: 10 }))
            .await
            .unwrap();
        let b = registry
            .create(new_task("b", ScheduleSpec::Interval { minutes: 5 }))
            .await
            .unwrap();
        let c = registry
            .create(new_task("c", ScheduleSpec::Interval { minutes: 5 }))
            .await
            .unwrap();

        clock.advance(Duration::minutes(7));
        let due = registry.due_tasks(clock.now()).await;
        let mut expected = vec![b.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(
            due.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            expected
        );

        clock.advance(Duration::minutes(5));
        let due = registry.due_tasks(clock.now()).await;
        assert_eq!(due.len(), 3);
        assert_eq!(due[2].id, a.id);
        assert_eq!(registry.next_wakeup().await, Some(t0() + Duration::minutes(5)));
    }

    #[tokio::test]
    async fn test_record_fired_collapses_missed_runs() {
        let (clock, _storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();

        clock.set(t0() + Duration::minutes(330));
        let guard = registry.lock_task(&task.id).await;
        let fired = registry.record_fired(&guard, clock.now()).await.unwrap();
        assert_eq!(fired.next_run_at, Some(t0() + Duration::minutes(390)));
    }

    #[tokio::test]
    async fn test_record_fired_disables_once() {
        let (_clock, _storage, registry) = setup();
        let task = registry
            .create(new_task(
                "once",
                ScheduleSpec::Once {
                    execute_at: t0() + Duration::minutes(1),
                },
            ))
            .await
            .unwrap();
        let guard = registry.lock_task(&task.id).await;
        let fired = registry
            .record_fired(&guard, t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert!(!fired.enabled);
        assert!(fired.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_completion_reschedules_from_finish_time() {
        let (_clock, _storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();
        registry.mark_running(&task.id, t0()).await.unwrap();
        assert_eq!(registry.get(&task.id).await.unwrap().last_run_status, RunStatus::Running);

        let finished = t0() + Duration::minutes(45);
        registry
            .record_completion(&task.id, ExecutionStatus::Error, finished, Some("boom"), true)
            .await
            .unwrap();
        let task = registry.get(&task.id).await.unwrap();
        assert_eq!(task.last_run_status, RunStatus::Error);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        assert_eq!(task.last_run_at, Some(t0()));
        assert_eq!(task.next_run_at, Some(finished + Duration::hours(1)));

        registry
            .record_completion(&task.id, ExecutionStatus::Success, finished, None, true)
            .await
            .unwrap();
        assert!(registry.get(&task.id).await.unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_stopped_before_start_keeps_schedule() {
        let (_clock, _storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();
        registry
            .record_completion(
                &task.id,
                ExecutionStatus::Stopped,
                t0() + Duration::minutes(5),
                None,
                false,
            )
            .await
            .unwrap();
        let task = registry.get(&task.id).await.unwrap();
        assert_eq!(task.last_run_status, RunStatus::Idle);
        assert_eq!(task.next_run_at, Some(t0() + Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_load_and_repair_after_restart() {
        let (clock, storage, registry) = setup();
        let task = registry.create(hourly("report")).await.unwrap();
        registry.mark_running(&task.id, t0()).await.unwrap();

        clock.set(t0() + Duration::hours(5));
        let restarted = TaskRegistry::new(storage, clock.clone());
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.repair_after_restart().await.unwrap(), 1);

        let task = restarted.get(&task.id).await.unwrap();
        assert_eq!(task.last_run_status, RunStatus::Error);
        assert_eq!(task.last_error.as_deref(), Some(INTERRUPTED_MESSAGE));
        // Overdue, so it fires once on the next tick.
        assert_eq!(task.next_run_at, Some(t0() + Duration::hours(1)));
        assert_eq!(restarted.due_tasks(clock.now()).await.len(), 1);
    }
}
