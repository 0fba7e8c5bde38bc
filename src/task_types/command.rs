//! Task type that runs an external program per due record.

use crate::config::TaskTypeSettings;
use crate::monitor_store::TaskRecord;
use crate::scheduler::{ExecutionContext, TaskError, TaskType};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured stdout and stderr are truncated to this many bytes.
const MAX_OUTPUT_BYTES: usize = 4096;

/// Runs `command args... <subject_key>` for each record.
///
/// The tenant, subject and type are also exported as `RECHECK_TENANT_ID`,
/// `RECHECK_SUBJECT_KEY` and `RECHECK_TASK_TYPE`. Exit status 0 is success;
/// stdout is stored as the result, parsed as JSON when it is JSON.
pub struct CommandTaskType {
    name: String,
    command: String,
    args: Vec<String>,
    failure_threshold: u32,
}

impl CommandTaskType {
    pub fn new(settings: &TaskTypeSettings) -> Self {
        Self {
            name: settings.name.clone(),
            command: settings.command.clone(),
            args: settings.args.clone(),
            failure_threshold: settings.failure_threshold,
        }
    }
}

#[async_trait]
impl TaskType for CommandTaskType {
    fn name(&self) -> &str {
        &self.name
    }

    fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        record: &TaskRecord,
    ) -> Result<JsonValue, TaskError> {
        debug!("Running {} for {}", self.command, record.task_key());

        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(&record.subject_key)
            .env("RECHECK_TENANT_ID", &record.tenant_id)
            .env("RECHECK_SUBJECT_KEY", &record.subject_key)
            .env("RECHECK_TASK_TYPE", &record.task_type)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::Execution(format!("failed to start {}: {}", self.command, e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| TaskError::Execution(format!("failed to wait for {}: {}", self.command, e)))?,
            _ = ctx.cancellation_token.cancelled() => return Err(TaskError::Cancelled),
        };

        if !output.status.success() {
            let stderr = truncate_utf8(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_BYTES)
                .trim()
                .to_string();
            let status = match output.status.code() {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            return Err(TaskError::Execution(if stderr.is_empty() {
                status
            } else {
                format!("{}: {}", status, stderr)
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = truncate_utf8(stdout.trim(), MAX_OUTPUT_BYTES);
        Ok(match serde_json::from_str::<JsonValue>(stdout) {
            Ok(value) => value,
            Err(_) if stdout.is_empty() => json!({ "exit_code": 0 }),
            Err(_) => json!({ "exit_code": 0, "output": stdout }),
        })
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
