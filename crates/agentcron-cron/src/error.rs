use agentcron_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the scheduling core.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("task {task_id} already has an execution in flight ({execution_id})")]
    AlreadyRunning {
        task_id: String,
        execution_id: String,
    },
    #[error("scheduled task not found: {0}")]
    TaskNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("execution {execution_id} failed: {message}")]
    ExecutionFailed {
        execution_id: String,
        message: String,
    },
    #[error("execution {execution_id} did not acknowledge cancellation within {grace_secs}s")]
    CancellationTimeout {
        execution_id: String,
        grace_secs: u64,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, CronError>;
