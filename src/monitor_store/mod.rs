mod models;
mod schema;
mod sqlite_monitor_store;

pub use models::*;
pub use schema::MONITOR_VERSIONED_SCHEMAS;
pub use sqlite_monitor_store::SqliteMonitorStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Persistence for everything the scheduler owns.
///
/// Mutations happen from the current leader's check cycle, or from the
/// operator reconcile path.
pub trait MonitorStore: Send + Sync {
    /// Cheap round-trip used at the start of each cycle. An error here aborts
    /// the cycle.
    fn check_connection(&self) -> Result<()>;

    // Task records
    fn create_task_record(&self, record: &NewTaskRecord) -> Result<TaskRecord>;
    fn get_task_record(&self, id: i64) -> Result<Option<TaskRecord>>;
    fn find_task_record(
        &self,
        tenant_id: &str,
        task_type: &str,
        subject_key: &str,
    ) -> Result<Option<TaskRecord>>;
    /// Active records of one type whose `next_due` has passed, oldest first.
    fn list_due_tasks(
        &self,
        task_type: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>>;
    fn list_tenant_tasks(&self, tenant_id: &str) -> Result<Vec<TaskRecord>>;
    /// Persist scheduling and failure fields of an existing record.
    fn update_task_record(&self, record: &TaskRecord) -> Result<()>;
    /// Read the stored record, let `apply` change it, and write it back
    /// atomically. Used for execution outcomes so that operator changes made
    /// while the task was running (pause, reset, new frequency) are kept.
    /// Returns `None` if no record with `id` exists.
    fn modify_task_record(
        &self,
        id: i64,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<Option<TaskRecord>>;
    /// Returns false if no record with `id` exists.
    fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<bool>;

    // Execution log
    fn append_execution_log(&self, entry: &ExecutionLogEntry) -> Result<i64>;
    /// Attempts of one task, newest first. Rows are additionally filtered by
    /// tenant so one tenant can never page through another's history.
    fn list_execution_log(
        &self,
        tenant_id: &str,
        task_id: i64,
        query: &LogQuery,
    ) -> Result<Vec<ExecutionLogEntry>>;

    // Scheduler event log
    fn append_scheduler_event(&self, event: &SchedulerEvent) -> Result<i64>;
    fn list_scheduler_events(
        &self,
        event_type: Option<SchedulerEventType>,
        query: &LogQuery,
    ) -> Result<Vec<SchedulerEvent>>;

    // Cumulative stats
    /// Insert the single stats row if it does not exist yet. Idempotent.
    fn ensure_cumulative_stats(&self) -> Result<()>;
    fn get_cumulative_stats(&self) -> Result<CumulativeStats>;
    fn add_cycle_to_cumulative_stats(&self, delta: &StatsDelta, cycle_id: &str) -> Result<()>;

    // Leader lease
    /// Non-blocking. Returns true if `holder_id` now holds the lease, either
    /// freshly acquired or renewed.
    fn try_acquire_leader_lease(
        &self,
        lock_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool>;
    fn release_leader_lease(&self, lock_name: &str, holder_id: &str) -> Result<()>;
}
