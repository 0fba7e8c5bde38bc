//! Task types with scripted behavior

use async_trait::async_trait;
use recheck_scheduler::monitor_store::TaskRecord;
use recheck_scheduler::scheduler::{ExecutionContext, TaskError, TaskType};
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(dead_code)]
pub enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Sleeps, then succeeds.
    Hang(Duration),
}

/// Records which subjects it executed, in order.
pub struct RecordingTaskType {
    name: &'static str,
    behavior: Behavior,
    executed: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingTaskType {
    pub fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior,
            executed: Mutex::new(Vec::new()),
        })
    }

    pub fn executions(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn executed_subjects(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskType for RecordingTaskType {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        record: &TaskRecord,
    ) -> Result<JsonValue, TaskError> {
        self.executed
            .lock()
            .unwrap()
            .push(format!("{}/{}", record.tenant_id, record.subject_key));

        match &self.behavior {
            Behavior::Succeed => Ok(json!({ "subject": record.subject_key })),
            Behavior::Fail(reason) => Err(TaskError::Execution(reason.to_string())),
            Behavior::Hang(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(json!({}))
            }
        }
    }
}
