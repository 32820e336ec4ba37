//! agentcron-cron: scheduling core for agent tasks.
//!
//! A [`Scheduler`] loop finds due [`ScheduledTask`](agentcron_types::ScheduledTask)s
//! and hands them to the [`Executor`], which bounds concurrency, queues
//! overflow in FIFO order and invokes agents through an [`AgentInvoker`].
//! [`CronRuntime`] wires the pieces together.

pub mod clock;
pub mod error;
pub mod executor;
pub mod history;
pub mod invoker;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CronError, Result};
pub use executor::{ExecutionEvent, Executor, ExecutorOptions, RunRequest, StopOutcome};
pub use history::ExecutionHistory;
pub use invoker::{AgentInvoker, InvocationOutcome, InvocationRequest};
pub use registry::{TaskGuard, TaskRegistry};
pub use runtime::{BootstrapReport, CronRuntime};
pub use scheduler::{Scheduler, TickReport};
pub use status::StatusAggregator;
