use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Task records
// =============================================================================

/// Lifecycle status of a monitored subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Failed,
    /// Too many consecutive failures; excluded from the due set until an
    /// operator resets it.
    NeedsIntervention,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Failed => "failed",
            TaskStatus::NeedsIntervention => "needs_intervention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "failed" => Some(TaskStatus::Failed),
            "needs_intervention" => Some(TaskStatus::NeedsIntervention),
            _ => None,
        }
    }
}

/// Structured summary of recent failures, stored as JSON on the task row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Newest last, capped at [`FailurePattern::MAX_RECENT_ERRORS`].
    pub recent_errors: Vec<String>,
    pub timeouts: u32,
}

impl FailurePattern {
    pub const MAX_RECENT_ERRORS: usize = 5;
}

/// One monitored subject of one task type, e.g. a tenant's credential for a
/// platform or a tenant's tracked URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub task_type: String,
    pub tenant_id: String,
    pub subject_key: String,
    pub next_due: DateTime<Utc>,
    /// Recurrence period, in seconds.
    pub frequency_secs: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub consecutive_failures: u32,
    pub failure_pattern: Option<FailurePattern>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Key used for in-process leasing. Built from the row id, since tenant
    /// and subject are free-form and may contain the separator.
    pub fn task_key(&self) -> String {
        format!("{}:{}", self.task_type, self.id)
    }

    pub fn frequency(&self) -> Duration {
        Duration::seconds(self.frequency_secs)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Active && self.next_due <= now
    }
}

/// Input for creating a task record when a tenant enables a capability.
#[derive(Debug, Clone)]
pub struct NewTaskRecord {
    pub task_type: String,
    pub tenant_id: String,
    pub subject_key: String,
    pub frequency_secs: i64,
    pub next_due: DateTime<Utc>,
}

// =============================================================================
// Execution log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
    Running,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Running => "running",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            "skipped" => Some(ExecutionStatus::Skipped),
            "running" => Some(ExecutionStatus::Running),
            _ => None,
        }
    }
}

/// One attempt at executing a task. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub task_type: String,
    pub tenant_id: String,
    pub execution_date: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

// =============================================================================
// Scheduler event log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerEventType {
    CheckCycle,
    IntervalAdjustment,
    Start,
    Stop,
    JobScheduled,
    JobCancelled,
    JobCompleted,
    JobFailed,
}

impl SchedulerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerEventType::CheckCycle => "check_cycle",
            SchedulerEventType::IntervalAdjustment => "interval_adjustment",
            SchedulerEventType::Start => "start",
            SchedulerEventType::Stop => "stop",
            SchedulerEventType::JobScheduled => "job_scheduled",
            SchedulerEventType::JobCancelled => "job_cancelled",
            SchedulerEventType::JobCompleted => "job_completed",
            SchedulerEventType::JobFailed => "job_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_cycle" => Some(SchedulerEventType::CheckCycle),
            "interval_adjustment" => Some(SchedulerEventType::IntervalAdjustment),
            "start" => Some(SchedulerEventType::Start),
            "stop" => Some(SchedulerEventType::Stop),
            "job_scheduled" => Some(SchedulerEventType::JobScheduled),
            "job_cancelled" => Some(SchedulerEventType::JobCancelled),
            "job_completed" => Some(SchedulerEventType::JobCompleted),
            "job_failed" => Some(SchedulerEventType::JobFailed),
            _ => None,
        }
    }
}

/// Per-cycle counters, also used as the delta applied to [`CumulativeStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounts {
    pub tasks_found: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub by_type: std::collections::BTreeMap<String, TypeCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub found: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// A row in the scheduler event log. Check-cycle events carry the cycle's
/// counts; transitions carry free-form details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub id: i64,
    pub event_type: SchedulerEventType,
    pub created_at: DateTime<Utc>,
    pub cycle_id: Option<String>,
    pub counts: Option<CycleCounts>,
    pub duration_ms: Option<i64>,
    pub active_strategies_count: Option<u32>,
    pub active_executions: Option<u32>,
    pub details: Option<serde_json::Value>,
}

impl SchedulerEvent {
    /// Build a transition event (start/stop/job_*/interval_adjustment).
    pub fn transition(event_type: SchedulerEventType, details: serde_json::Value) -> Self {
        Self {
            id: 0,
            event_type,
            created_at: Utc::now(),
            cycle_id: None,
            counts: None,
            duration_ms: None,
            active_strategies_count: None,
            active_executions: None,
            details: Some(details),
        }
    }
}

// =============================================================================
// Cumulative stats
// =============================================================================

/// Restart-proof counters. Exactly one logical row exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeStats {
    pub total_check_cycles: u64,
    pub cumulative_tasks_found: u64,
    pub cumulative_tasks_executed: u64,
    pub cumulative_tasks_failed: u64,
    pub cumulative_tasks_skipped: u64,
    pub cumulative_job_completed: u64,
    pub cumulative_job_failed: u64,
    pub last_check_cycle_id: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Amount added to [`CumulativeStats`] for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub check_cycles: u64,
    pub tasks_found: u64,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub job_completed: u64,
    pub job_failed: u64,
}

impl StatsDelta {
    pub fn for_completed_cycle(counts: &CycleCounts) -> Self {
        Self {
            check_cycles: 1,
            tasks_found: counts.tasks_found,
            tasks_executed: counts.tasks_executed,
            tasks_failed: counts.tasks_failed,
            tasks_skipped: counts.tasks_skipped,
            job_completed: 1,
            job_failed: 0,
        }
    }

    pub fn for_failed_cycle() -> Self {
        Self {
            check_cycles: 1,
            job_failed: 1,
            ..Default::default()
        }
    }
}

// =============================================================================
// Queries
// =============================================================================

/// Date range + pagination shared by log queries.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: 50,
            offset: 0,
        }
    }
}
