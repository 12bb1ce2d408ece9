//! Priority-based task scheduler for code-quality tool runs.
//!
//! Each task wraps one [`UnitOfWork`] (typically a single analysis tool
//! invocation). The [`Scheduler`] keeps a bounded priority queue, resolves
//! dependencies between tasks, runs eligible tasks on a fixed-size worker
//! pool with per-attempt timeouts, retries failures with exponential backoff
//! and publishes lifecycle events over a broadcast channel.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod resolver;
pub mod runner;
mod state;
pub mod store;
pub mod task;
pub mod work;

pub use config::{ConfigUpdate, RetryPolicy, SchedulerConfig};
pub use error::{ErrorKind, SchedulerError, TaskFailure};
pub use events::{EventBus, SchedulerEvent};
pub use metrics::{DurationSummary, SchedulerMetrics, TaskStatistics};
pub use pool::WorkerSnapshot;
pub use queue::{PriorityQueue, QueuedTask};
pub use resolver::{DependencyResolver, DependencyState};
pub use runner::Scheduler;
pub use state::{CancelOutcome, TaskLookup};
pub use task::{Priority, TaskId, TaskOptions, TaskResult, TaskSnapshot, TaskStatus};
pub use work::{work_fn, FnWork, UnitOfWork, WorkContext, WorkError, WorkOutput, WorkStatus};
