use super::engine::{CheckCycleEngine, EngineError, SchedulerSnapshot};
use super::failure_policy::FailurePolicy;
use crate::monitor_store::{
    CumulativeStats, ExecutionLogEntry, ExecutionStatus, LogQuery, MonitorStore, NewTaskRecord,
    SchedulerEvent, SchedulerEventType, TaskRecord, TaskStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Errors on the read-only boundary.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Task not found")]
    NotFound,

    /// The task exists but belongs to another tenant.
    #[error("Access denied")]
    AccessDenied,

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Frequency must be at least one second")]
    InvalidFrequency,
}

impl From<anyhow::Error> for ReconcileError {
    fn from(e: anyhow::Error) -> Self {
        ReconcileError::Query(QueryError::Store(e))
    }
}

/// Operator override for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Execute now, outside the schedule.
    ForceRun,
    /// Clear failures and make the task active and due now.
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub record: TaskRecord,
    pub execution: Option<ExecutionLogEntry>,
}

/// Handle given to the serving layer and the CLI.
///
/// Reads are always scoped to the calling tenant. The only writes are the
/// lifecycle operations and the reconcile path, which are allowed on any
/// instance, leader or not.
#[derive(Clone)]
pub struct SchedulerHandle {
    engine: Arc<CheckCycleEngine>,
    store: Arc<dyn MonitorStore>,
}

impl SchedulerHandle {
    pub fn new(engine: Arc<CheckCycleEngine>) -> Self {
        let store = Arc::clone(engine.store());
        Self { engine, store }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.engine.snapshot()
    }

    pub fn cumulative_stats(&self) -> Result<CumulativeStats, QueryError> {
        Ok(self.store.get_cumulative_stats()?)
    }

    pub fn list_tenant_tasks(&self, tenant_id: &str) -> Result<Vec<TaskRecord>, QueryError> {
        Ok(self.store.list_tenant_tasks(tenant_id)?)
    }

    /// Fetch a task owned by `tenant_id`.
    pub fn get_task(&self, tenant_id: &str, task_id: i64) -> Result<TaskRecord, QueryError> {
        let record = self
            .store
            .get_task_record(task_id)?
            .ok_or(QueryError::NotFound)?;
        if record.tenant_id != tenant_id {
            return Err(QueryError::AccessDenied);
        }
        Ok(record)
    }

    pub fn list_execution_log(
        &self,
        tenant_id: &str,
        task_id: i64,
        query: &LogQuery,
    ) -> Result<Vec<ExecutionLogEntry>, QueryError> {
        self.get_task(tenant_id, task_id)?;
        Ok(self.store.list_execution_log(tenant_id, task_id, query)?)
    }

    pub fn list_scheduler_events(
        &self,
        event_type: Option<SchedulerEventType>,
        query: &LogQuery,
    ) -> Result<Vec<SchedulerEvent>, QueryError> {
        Ok(self.store.list_scheduler_events(event_type, query)?)
    }

    /// Start monitoring a subject. A paused record for the same subject is
    /// re-activated instead of duplicated.
    pub fn enable_monitoring(
        &self,
        tenant_id: &str,
        task_type: &str,
        subject_key: &str,
        frequency: Duration,
    ) -> Result<TaskRecord, ReconcileError> {
        if self.engine.registry().get(task_type).is_none() {
            return Err(EngineError::UnknownTaskType(task_type.to_string()).into());
        }
        let frequency_secs = frequency.as_secs() as i64;
        if frequency_secs < 1 {
            return Err(ReconcileError::InvalidFrequency);
        }

        let now = Utc::now();
        if let Some(mut record) = self
            .store
            .find_task_record(tenant_id, task_type, subject_key)?
        {
            record.frequency_secs = frequency_secs;
            if record.status == TaskStatus::Paused {
                record.status = TaskStatus::Active;
                record.next_due = now;
            }
            self.store.update_task_record(&record)?;
            info!("Re-enabled monitoring of {}", record.task_key());
            return Ok(record);
        }

        let record = self.store.create_task_record(&NewTaskRecord {
            task_type: task_type.to_string(),
            tenant_id: tenant_id.to_string(),
            subject_key: subject_key.to_string(),
            frequency_secs,
            next_due: now,
        })?;
        info!("Enabled monitoring of {}", record.task_key());
        Ok(record)
    }

    /// Stop scheduling a task. The record and its history are kept.
    pub fn disable_monitoring(
        &self,
        tenant_id: &str,
        task_id: i64,
    ) -> Result<TaskRecord, QueryError> {
        let mut record = self.get_task(tenant_id, task_id)?;
        self.store.set_task_status(task_id, TaskStatus::Paused)?;
        record.status = TaskStatus::Paused;
        info!("Disabled monitoring of {}", record.task_key());
        Ok(record)
    }

    pub async fn reconcile(
        &self,
        tenant_id: &str,
        task_id: i64,
        action: ReconcileAction,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut record = self.get_task(tenant_id, task_id)?;

        match action {
            ReconcileAction::Reset => {
                FailurePolicy::reset(&mut record, Utc::now());
                self.store.update_task_record(&record)?;
                info!("Reset {} by operator request", record.task_key());
                Ok(ReconcileOutcome {
                    record,
                    execution: None,
                })
            }
            ReconcileAction::ForceRun => {
                info!("Force-running {} by operator request", record.task_key());
                let (entry, record) = self.engine.execute_now(record).await?;

                let event_type = if entry.status == ExecutionStatus::Success {
                    SchedulerEventType::JobCompleted
                } else {
                    SchedulerEventType::JobFailed
                };
                let event = SchedulerEvent::transition(
                    event_type,
                    json!({
                        "trigger": "reconcile",
                        "task_id": record.id,
                        "tenant_id": record.tenant_id,
                        "task_type": record.task_type,
                        "error": entry.error_message,
                    }),
                );
                if let Err(e) = self.store.append_scheduler_event(&event) {
                    error!("Failed to append reconcile event: {}", e);
                }

                Ok(ReconcileOutcome {
                    record,
                    execution: Some(entry),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::{
        create_test_store, engine_with, fast_settings, seed_task, Behavior, ScriptedTaskType,
    };

    #[tokio::test]
    async fn test_execution_log_is_isolated_per_tenant() {
        let (store, _dir) = create_test_store();
        let audit = ScriptedTaskType::new("audit", Behavior::Succeed);
        let a = seed_task(&store, "audit", "tenant-a", "shared.example", 3600, -60);
        let b = seed_task(&store, "audit", "tenant-b", "shared.example", 3600, -60);

        let engine = engine_with(&store, vec![audit], fast_settings());
        engine.set_leadership(true);
        engine.run_cycle().await.unwrap();
        let handle = SchedulerHandle::new(engine);

        let rows = handle
            .list_execution_log("tenant-a", a.id, &LogQuery::default())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(|r| r.tenant_id == "tenant-a"));

        let denied = handle.list_execution_log("tenant-a", b.id, &LogQuery::default());
        assert!(matches!(denied, Err(QueryError::AccessDenied)));

        let missing = handle.list_execution_log("tenant-a", 9999, &LogQuery::default());
        assert!(matches!(missing, Err(QueryError::NotFound)));
    }

    #[tokio::test]
    async fn test_reset_restores_needs_intervention_task() {
        let (store, _dir) = create_test_store();
        let audit = ScriptedTaskType::new("audit", Behavior::Succeed);
        let mut record = seed_task(&store, "audit", "t1", "x", 3600, 3600);
        record.status = TaskStatus::NeedsIntervention;
        record.consecutive_failures = 5;
        record.failure_reason = Some("boom".to_string());
        store.update_task_record(&record).unwrap();

        let handle = SchedulerHandle::new(engine_with(&store, vec![audit], fast_settings()));
        let outcome = handle
            .reconcile("t1", record.id, ReconcileAction::Reset)
            .await
            .unwrap();
        assert!(outcome.execution.is_none());

        let stored = store.get_task_record(record.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Active);
        assert_eq!(stored.consecutive_failures, 0);
        assert!(stored.failure_reason.is_none());
        assert!(store.list_due_tasks("audit", Utc::now(), 10).unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_force_run_records_execution_and_event() {
        let (store, _dir) = create_test_store();
        let flaky = ScriptedTaskType::new("flaky", Behavior::Fail("still broken"));
        let record = seed_task(&store, "flaky", "t1", "x", 3600, 3600);

        let handle = SchedulerHandle::new(engine_with(&store, vec![flaky.clone()], fast_settings()));
        let outcome = handle
            .reconcile("t1", record.id, ReconcileAction::ForceRun)
            .await
            .unwrap();

        let execution = outcome.execution.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(outcome.record.consecutive_failures, 1);
        assert_eq!(flaky.executions(), 1);

        let events = handle
            .list_scheduler_events(Some(SchedulerEventType::JobFailed), &LogQuery::default())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details.as_ref().unwrap()["trigger"], "reconcile");
    }

    #[tokio::test]
    async fn test_reconcile_requires_ownership() {
        let (store, _dir) = create_test_store();
        let audit = ScriptedTaskType::new("audit", Behavior::Succeed);
        let record = seed_task(&store, "audit", "owner", "x", 3600, 0);

        let handle = SchedulerHandle::new(engine_with(&store, vec![audit.clone()], fast_settings()));
        let result = handle
            .reconcile("intruder", record.id, ReconcileAction::ForceRun)
            .await;
        assert!(matches!(
            result,
            Err(ReconcileError::Query(QueryError::AccessDenied))
        ));
        assert_eq!(audit.executions(), 0);
    }

    #[test]
    fn test_enable_disable_lifecycle() {
        let (store, _dir) = create_test_store();
        let audit = ScriptedTaskType::new("audit", Behavior::Succeed);
        let handle = SchedulerHandle::new(engine_with(&store, vec![audit], fast_settings()));

        let created = handle
            .enable_monitoring("t1", "audit", "site", Duration::from_secs(600))
            .unwrap();
        assert_eq!(created.status, TaskStatus::Active);
        assert_eq!(created.frequency_secs, 600);

        let paused = handle.disable_monitoring("t1", created.id).unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        // Disabled, never deleted.
        assert_eq!(handle.list_tenant_tasks("t1").unwrap().len(), 1);

        let again = handle
            .enable_monitoring("t1", "audit", "site", Duration::from_secs(300))
            .unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(again.status, TaskStatus::Active);
        assert_eq!(again.frequency_secs, 300);
    }

    #[test]
    fn test_enable_rejects_unknown_type_and_zero_frequency() {
        let (store, _dir) = create_test_store();
        let audit = ScriptedTaskType::new("audit", Behavior::Succeed);
        let handle = SchedulerHandle::new(engine_with(&store, vec![audit], fast_settings()));

        assert!(matches!(
            handle.enable_monitoring("t1", "nope", "site", Duration::from_secs(60)),
            Err(ReconcileError::Engine(EngineError::UnknownTaskType(_)))
        ));
        assert!(matches!(
            handle.enable_monitoring("t1", "audit", "site", Duration::ZERO),
            Err(ReconcileError::InvalidFrequency)
        ));
    }

    #[test]
    fn test_disable_other_tenant_denied() {
        let (store, _dir) = create_test_store();
        let record = seed_task(&store, "audit", "owner", "x", 3600, 0);
        let handle = SchedulerHandle::new(engine_with(&store, vec![], fast_settings()));

        assert!(matches!(
            handle.disable_monitoring("intruder", record.id),
            Err(QueryError::AccessDenied)
        ));
        let stored = store.get_task_record(record.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Active);
    }
}
