//! Recurring check scheduler.
//!
//! A leadership monitor decides whether this process may discover due work.
//! While it leads, the check-cycle engine repeatedly asks every registered
//! task type for due records, runs them under a concurrency ceiling and a
//! hard batch deadline, applies the failure policy and records counters and
//! events.

mod context;
mod engine;
mod failure_policy;
mod handle;
mod interval;
mod lease;
mod leadership;
mod registry;
mod runner;
mod task_type;

pub use context::ExecutionContext;
pub use engine::{
    ActiveExecution, CheckCycleEngine, CycleSummary, CyclePhase, EngineError, EngineSettings,
    SchedulerSnapshot,
};
pub use failure_policy::FailurePolicy;
pub use handle::{QueryError, ReconcileAction, ReconcileError, ReconcileOutcome, SchedulerHandle};
pub use interval::{AdaptiveInterval, IntervalChange};
pub use lease::{LeaseGuard, LeaseManager};
pub use leadership::{LeaderLock, LeadershipMonitor, StoreLeaderLock};
pub use registry::{RegistryError, TaskTypeRegistry};
pub use runner::{create_scheduler, create_scheduler_with_lock, SchedulerRunner};
pub use task_type::{TaskError, TaskType, DEFAULT_FAILURE_THRESHOLD};
