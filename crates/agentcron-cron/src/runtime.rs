//! Wiring of storage, registry, history, executor and scheduler into one
//! process-wide runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use agentcron_config::AgentCronConfig;
use agentcron_storage::AgentCronStorage;
use agentcron_types::TriggerKind;

use crate::clock::{Clock, SystemClock};
use crate::error::{CronError, Result};
use crate::executor::{Executor, ExecutorOptions, RunRequest, StopOutcome};
use crate::history::ExecutionHistory;
use crate::invoker::{self, AgentInvoker};
use crate::registry::TaskRegistry;
use crate::scheduler::Scheduler;
use crate::status::StatusAggregator;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub tasks: usize,
    pub recovered_executions: usize,
    pub repaired_tasks: usize,
}

pub struct CronRuntime {
    pub storage: AgentCronStorage,
    pub registry: Arc<TaskRegistry>,
    pub history: ExecutionHistory,
    pub executor: Executor,
    pub scheduler: Arc<Scheduler>,
    pub status: StatusAggregator,
    clock: Arc<dyn Clock>,
}

impl CronRuntime {
    pub fn new(
        storage: AgentCronStorage,
        invoker: Arc<dyn AgentInvoker>,
        clock: Arc<dyn Clock>,
        config: &AgentCronConfig,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(storage.clone(), clock.clone()));
        let history = ExecutionHistory::new(storage.clone(), config.history.max_records_per_task);
        let executor = Executor::new(
            invoker,
            history.clone(),
            registry.clone(),
            clock.clone(),
            ExecutorOptions::from(&config.executor),
        );
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            executor.clone(),
            clock.clone(),
            Duration::from_secs(config.scheduler.tick_secs),
            config.scheduler.enabled,
        ));
        let status = StatusAggregator::new(scheduler.clone(), executor.clone());
        Self {
            storage,
            registry,
            history,
            executor,
            scheduler,
            status,
            clock,
        }
    }

    /// Open the configured database and invoker on the system clock.
    pub fn from_config(config: &AgentCronConfig) -> anyhow::Result<Self> {
        let db_path = config.db_path()?;
        let storage = AgentCronStorage::open(&db_path)?;
        let invoker = invoker::from_config(&config.invoker)?;
        Ok(Self::new(storage, invoker, Arc::new(SystemClock), config))
    }

    /// Load tasks and clean up after a previous process.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let recovered = self.history.recover_interrupted(self.clock.now()).await?;
        let tasks = self.registry.load().await?;
        let repaired = self.registry.repair_after_restart().await?;
        let report = BootstrapReport {
            tasks,
            recovered_executions: recovered.len(),
            repaired_tasks: repaired,
        };
        info!(
            tasks = report.tasks,
            recovered = report.recovered_executions,
            repaired = report.repaired_tasks,
            "Cron runtime bootstrapped"
        );
        Ok(report)
    }

    /// Run a task now, regardless of its schedule or the scheduler state.
    pub async fn run_now(&self, task_id: &str) -> Result<String> {
        let _guard = self.registry.lock_task(task_id).await;
        let task = self.registry.get(task_id).await?;
        self.executor
            .submit(RunRequest::for_task(&task, TriggerKind::Manual))
            .await
    }

    /// Stop a queued or running execution.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<StopOutcome> {
        match self.executor.stop(execution_id).await {
            StopOutcome::NotFound => Err(CronError::ExecutionNotFound(execution_id.to_string())),
            outcome => Ok(outcome),
        }
    }

    /// Delete a task, stopping any execution it has in flight.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let guard = self.registry.lock_task(task_id).await;
        self.registry.get(task_id).await?;
        if let Some(execution_id) = self.executor.execution_for_task(task_id) {
            self.executor.stop(&execution_id).await;
        }
        self.registry.delete_locked(&guard).await
    }

    /// Apply the runtime-tunable parts of a (re)loaded configuration.
    pub async fn apply_config(&self, config: &AgentCronConfig) -> Result<()> {
        self.executor
            .set_max_concurrent(config.executor.max_concurrent)
            .await?;
        self.scheduler.set_enabled(config.scheduler.enabled);
        Ok(())
    }

    pub fn spawn_scheduler(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run(shutdown))
    }

    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}
