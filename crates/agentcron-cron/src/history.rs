//! Execution history: append-only records per run, paged newest first.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use agentcron_storage::AgentCronStorage;
use agentcron_types::{ExecutionPage, ExecutionRecord};

use crate::error::{CronError, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Message stored on executions a previous process left unfinished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE)
}

#[derive(Clone)]
pub struct ExecutionHistory {
    storage: AgentCronStorage,
    max_records_per_task: usize,
}

impl ExecutionHistory {
    pub fn new(storage: AgentCronStorage, max_records_per_task: usize) -> Self {
        Self {
            storage,
            max_records_per_task: max_records_per_task.max(1),
        }
    }

    /// Persist a freshly admitted execution.
    pub async fn record_submitted(&self, record: &ExecutionRecord) -> Result<()> {
        self.storage.insert_execution(record).await?;
        Ok(())
    }

    /// Persist a queued execution that has just started.
    pub async fn record_started(&self, record: &ExecutionRecord) -> Result<()> {
        if !self.storage.update_execution(record).await? {
            debug!(execution_id = %record.execution_id, "start of unknown or finished execution ignored");
        }
        Ok(())
    }

    /// Persist the terminal state of an execution and apply retention.
    pub async fn record_finished(&self, record: &ExecutionRecord) -> Result<()> {
        if !self.storage.update_execution(record).await? {
            debug!(execution_id = %record.execution_id, "execution already finalised; result ignored");
            return Ok(());
        }
        let pruned = self
            .storage
            .prune_executions(&record.task_id, self.max_records_per_task)
            .await?;
        if pruned > 0 {
            debug!(task_id = %record.task_id, pruned, "Pruned execution history");
        }
        Ok(())
    }

    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CronError::ExecutionNotFound(execution_id.to_string()))
    }

    /// One page of a task's executions, newest first.
    pub async fn page(
        &self,
        task_id: &str,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ExecutionPage> {
        let limit = clamp_limit(limit);
        let offset = offset.unwrap_or(0);
        let (executions, total) = self.storage.list_executions(task_id, limit, offset).await?;
        Ok(ExecutionPage {
            executions,
            total,
            limit,
            offset,
        })
    }

    /// Fail every execution a previous process left queued or running.
    pub async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let recovered = self
            .storage
            .recover_interrupted(now, INTERRUPTED_MESSAGE)
            .await?;
        for record in &recovered {
            warn!(
                execution_id = %record.execution_id,
                task_id = %record.task_id,
                "Execution interrupted by restart"
            );
        }
        Ok(recovered)
    }
}
