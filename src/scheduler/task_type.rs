use super::context::ExecutionContext;
use crate::monitor_store::TaskRecord;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

/// Consecutive failures after which a record needs operator intervention,
/// unless the task type overrides it.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Errors raised by a task type's loader or executor.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Loader failed: {0}")]
    Load(String),

    #[error("{0}")]
    Execution(String),

    /// The batch deadline passed before the execution finished. Displays as
    /// the bare failure reason stored on the record.
    #[error("timeout")]
    Timeout,

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// A category of recurring work.
///
/// Every task type shares the [`TaskRecord`] lifecycle; it only decides what
/// is due and how one record is executed. Scheduling fields and failure
/// tracking are updated by the engine after `execute` returns.
#[async_trait]
pub trait TaskType: Send + Sync {
    /// Registry key, also stored in `TaskRecord::task_type`.
    fn name(&self) -> &str;

    fn failure_threshold(&self) -> u32 {
        DEFAULT_FAILURE_THRESHOLD
    }

    /// Due records of this type, in dispatch order.
    ///
    /// The default reads active records whose `next_due` has passed, which
    /// already excludes paused and `needs_intervention` records.
    async fn load_due(&self, ctx: &ExecutionContext) -> Result<Vec<TaskRecord>, TaskError> {
        let records = ctx
            .store
            .list_due_tasks(self.name(), Utc::now(), ctx.due_batch_limit)?;
        Ok(records)
    }

    /// Perform the check for one record. The returned value is stored as the
    /// execution log's result payload.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &TaskRecord,
    ) -> Result<JsonValue, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_displays_as_bare_reason() {
        assert_eq!(TaskError::Timeout.to_string(), "timeout");
        assert_eq!(
            TaskError::Execution("token revoked".to_string()).to_string(),
            "token revoked"
        );
    }

    #[test]
    fn test_store_error_converts_from_anyhow() {
        let err: TaskError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, TaskError::Store(_)));
        assert_eq!(err.to_string(), "Store error: disk full");
    }
}
