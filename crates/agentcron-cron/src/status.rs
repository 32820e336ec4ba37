use std::sync::Arc;

use agentcron_types::StatusSnapshot;

use crate::executor::Executor;
use crate::scheduler::Scheduler;

/// Read-only projection of scheduler and executor state for pollers.
///
/// Every read is computed from live counters; nothing scans history.
#[derive(Clone)]
pub struct StatusAggregator {
    scheduler: Arc<Scheduler>,
    executor: Executor,
}

impl StatusAggregator {
    pub fn new(scheduler: Arc<Scheduler>, executor: Executor) -> Self {
        Self {
            scheduler,
            executor,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            scheduler_enabled: self.scheduler.is_enabled(),
            max_concurrent: self.executor.config().max_concurrent,
            executor_stats: self.executor.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunRequest;
    use crate::testing::{Harness, Mode, next_event};
    use agentcron_types::TriggerKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_snapshot_tracks_live_state() {
        let h = Harness::new(Mode::Fail("nope".into()), 2).await;
        let scheduler = Arc::new(Scheduler::new(
            h.registry.clone(),
            h.executor.clone(),
            h.clock.clone(),
            Duration::from_secs(15),
            true,
        ));
        let status = StatusAggregator::new(scheduler.clone(), h.executor.clone());

        let snapshot = status.snapshot();
        assert!(snapshot.scheduler_enabled);
        assert_eq!(snapshot.max_concurrent, 2);
        assert_eq!(snapshot.executor_stats.failed_tasks, 0);

        let task = h.interval_task("report", 5).await;
        let mut events = h.executor.subscribe();
        h.executor
            .submit(RunRequest::for_task(&task, TriggerKind::Manual))
            .await
            .unwrap();
        next_event(&mut events).await;
        scheduler.disable();
        h.executor.set_max_concurrent(4).await.unwrap();

        let snapshot = status.snapshot();
        assert!(!snapshot.scheduler_enabled);
        assert_eq!(snapshot.max_concurrent, 4);
        assert_eq!(snapshot.executor_stats.failed_tasks, 1);
    }
}
