//! Scheduler loop: finds due tasks and submits them to the executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentcron_types::{SchedulerStatus, TriggerKind};

use crate::clock::Clock;
use crate::error::CronError;
use crate::executor::{Executor, RunRequest};
use crate::registry::TaskRegistry;
use crate::schedule;

/// Shortest sleep between ticks, so overdue tasks that cannot be
/// submitted yet do not spin the loop.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Execution ids submitted this tick.
    pub submitted: Vec<String>,
    /// Task ids whose occurrence overlapped an in-flight run.
    pub skipped: Vec<String>,
    /// Task ids that failed to schedule.
    pub failed: Vec<String>,
}

pub struct Scheduler {
    registry: Arc<TaskRegistry>,
    executor: Executor,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    tick_interval: Duration,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        executor: Executor,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            registry,
            executor,
            clock,
            enabled: AtomicBool::new(enabled),
            tick_interval,
            wake: Notify::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            enabled: self.is_enabled(),
        }
    }

    pub fn enable(&self) -> SchedulerStatus {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("Scheduler enabled");
        }
        self.wake.notify_one();
        self.status()
    }

    /// Stop submitting scheduled runs. Manual runs are unaffected.
    pub fn disable(&self) -> SchedulerStatus {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!("Scheduler disabled");
        }
        self.status()
    }

    pub fn set_enabled(&self, enabled: bool) -> SchedulerStatus {
        if enabled { self.enable() } else { self.disable() }
    }

    /// Submit every task that is due now.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if !self.is_enabled() {
            return report;
        }

        let now = self.clock.now();
        for candidate in self.registry.due_tasks(now).await {
            let guard = self.registry.lock_task(&candidate.id).await;
            // Re-check under the lock: a toggle or update may have raced us.
            let Some(task) = self.registry.still_due(&guard, now).await else {
                continue;
            };

            if let Err(e) = schedule::validate(&task.schedule) {
                warn!(task_id = %task.id, error = %e, "Task has an invalid schedule");
                if let Err(e) = self.registry.mark_schedule_error(&guard, &e.to_string()).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record schedule error");
                }
                report.failed.push(task.id);
                continue;
            }

            let submitted = self
                .executor
                .submit(RunRequest::for_task(&task, TriggerKind::Scheduled))
                .await;
            let advance = match submitted {
                Ok(execution_id) => {
                    debug!(task_id = %task.id, execution_id = %execution_id, "Scheduled run submitted");
                    report.submitted.push(execution_id);
                    true
                }
                Err(CronError::AlreadyRunning { execution_id, .. }) => {
                    info!(
                        task_id = %task.id,
                        in_flight = %execution_id,
                        "Skipping occurrence; previous run still in flight"
                    );
                    report.skipped.push(task.id.clone());
                    // One-shot tasks stay due until they actually run.
                    task.schedule.is_recurring()
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to submit scheduled run");
                    report.failed.push(task.id.clone());
                    false
                }
            };

            if advance {
                if let Err(e) = self.registry.record_fired(&guard, now).await {
                    warn!(task_id = %task.id, error = %e, "Failed to advance schedule");
                    if matches!(e, CronError::InvalidSchedule(_)) {
                        let _ = self.registry.mark_schedule_error(&guard, &e.to_string()).await;
                    }
                }
            }
        }
        report
    }

    /// Run until `shutdown` fires.
    ///
    /// Sleeps until the nearest `nextRunAt` or the tick interval, whichever
    /// comes first, and wakes early on task changes or when re-enabled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            tick_secs = self.tick_interval.as_secs(),
            enabled = self.is_enabled(),
            "Scheduler started"
        );
        loop {
            let report = self.tick().await;
            if !report.submitted.is_empty() || !report.failed.is_empty() {
                debug!(
                    submitted = report.submitted.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "Scheduler tick"
                );
            }

            let sleep_for = self.sleep_duration().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.registry.changed() => {}
                _ = self.wake.notified() => {}
            }
        }
        info!("Scheduler stopped");
    }

    async fn sleep_duration(&self) -> Duration {
        let Some(next) = self.registry.next_wakeup().await else {
            return self.tick_interval;
        };
        let until = (next - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        until.clamp(MIN_SLEEP, self.tick_interval.max(MIN_SLEEP))
    }
}
