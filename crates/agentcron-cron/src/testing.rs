//! Shared fixtures for the scheduling tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use agentcron_storage::AgentCronStorage;
use agentcron_types::{NewTask, ScheduleSpec, ScheduledTask};

use crate::clock::ManualClock;
use crate::executor::{ExecutionEvent, Executor, ExecutorOptions};
use crate::history::ExecutionHistory;
use crate::invoker::{AgentInvoker, InvocationOutcome, InvocationRequest};
use crate::registry::TaskRegistry;

pub(crate) enum Mode {
    Succeed,
    Fail(String),
    /// Waits for [`ScriptedInvoker::release`] or cancellation.
    Block,
    /// Never returns, even when cancelled.
    IgnoreCancel,
}

pub(crate) struct ScriptedInvoker {
    mode: Mode,
    calls: Mutex<Vec<String>>,
    release: Semaphore,
}

impl ScriptedInvoker {
    pub(crate) fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: Mutex::new(Vec::new()),
            release: Semaphore::new(0),
        })
    }

    /// Task ids in invocation order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn release(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<InvocationOutcome> {
        self.calls.lock().unwrap().push(request.task_id.clone());
        match &self.mode {
            Mode::Succeed => Ok(InvocationOutcome::Completed { summary: None }),
            Mode::Fail(message) => Err(anyhow::anyhow!("{message}")),
            Mode::Block => tokio::select! {
                _ = cancel.cancelled() => Ok(InvocationOutcome::Cancelled),
                permit = self.release.acquire() => {
                    permit.unwrap().forget();
                    Ok(InvocationOutcome::Completed { summary: None })
                }
            },
            Mode::IgnoreCancel => std::future::pending().await,
        }
    }
}

pub(crate) struct Harness {
    pub start: DateTime<Utc>,
    pub clock: Arc<ManualClock>,
    pub storage: AgentCronStorage,
    pub registry: Arc<TaskRegistry>,
    pub history: ExecutionHistory,
    pub executor: Executor,
    pub invoker: Arc<ScriptedInvoker>,
}

impl Harness {
    pub(crate) async fn new(mode: Mode, max_concurrent: u32) -> Self {
        Self::with_grace(mode, max_concurrent, Duration::from_secs(2)).await
    }

    pub(crate) async fn with_grace(mode: Mode, max_concurrent: u32, grace: Duration) -> Self {
        Self::with_options(
            mode,
            ExecutorOptions {
                max_concurrent,
                stop_grace: grace,
                error_message_limit: 512,
            },
        )
        .await
    }

    pub(crate) async fn with_options(mode: Mode, options: ExecutorOptions) -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let storage = AgentCronStorage::open_in_memory().unwrap();
        let registry = Arc::new(TaskRegistry::new(storage.clone(), clock.clone()));
        let history = ExecutionHistory::new(storage.clone(), 200);
        let invoker = ScriptedInvoker::new(mode);
        let executor = Executor::new(
            invoker.clone(),
            history.clone(),
            registry.clone(),
            clock.clone(),
            options,
        );
        Self {
            start,
            clock,
            storage,
            registry,
            history,
            executor,
            invoker,
        }
    }

    pub(crate) async fn task(&self, name: &str, schedule: ScheduleSpec) -> ScheduledTask {
        self.registry
            .create(NewTask {
                name: name.into(),
                description: None,
                agent_id: format!("agent-{name}"),
                project_path: None,
                schedule,
                enabled: true,
            })
            .await
            .unwrap()
    }

    pub(crate) async fn interval_task(&self, name: &str, minutes: u32) -> ScheduledTask {
        self.task(name, ScheduleSpec::Interval { minutes }).await
    }
}

/// Next terminal execution event, failing the test after five seconds.
pub(crate) async fn next_event(rx: &mut broadcast::Receiver<ExecutionEvent>) -> ExecutionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for execution event")
        .expect("event channel closed")
}
