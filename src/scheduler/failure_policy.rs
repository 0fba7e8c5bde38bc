//! Scheduling and failure bookkeeping applied after every attempt.
//!
//! Retries are absorbed by the regular recurrence: a failed record is due
//! again one `frequency` later, and repeated failures escalate the record to
//! `needs_intervention` instead of retrying forever.

use super::task_type::DEFAULT_FAILURE_THRESHOLD;
use crate::monitor_store::{FailurePattern, TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Consecutive failures at which the record stops being scheduled.
    pub threshold: u32,
}

impl FailurePolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&self, record: &mut TaskRecord, now: DateTime<Utc>) {
        record.last_check = Some(now);
        record.last_success = Some(now);
        record.next_due = now + record.frequency();
        record.consecutive_failures = 0;
        record.failure_reason = None;
        record.failure_pattern = None;
        // A paused record stays paused even when forced through.
        if record.status != TaskStatus::Paused {
            record.status = TaskStatus::Active;
        }
    }

    pub fn record_failure(
        &self,
        record: &mut TaskRecord,
        reason: &str,
        timed_out: bool,
        now: DateTime<Utc>,
    ) {
        record.last_check = Some(now);
        record.last_failure = Some(now);
        record.next_due = now + record.frequency();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.failure_reason = Some(reason.to_string());

        let pattern = record.failure_pattern.get_or_insert_with(FailurePattern::default);
        if pattern.first_failure_at.is_none() {
            pattern.first_failure_at = Some(now);
        }
        pattern.last_failure_at = Some(now);
        pattern.recent_errors.push(reason.to_string());
        if pattern.recent_errors.len() > FailurePattern::MAX_RECENT_ERRORS {
            let excess = pattern.recent_errors.len() - FailurePattern::MAX_RECENT_ERRORS;
            pattern.recent_errors.drain(..excess);
        }
        if timed_out {
            pattern.timeouts = pattern.timeouts.saturating_add(1);
        }

        if record.status != TaskStatus::Paused && self.needs_intervention(record) {
            record.status = TaskStatus::NeedsIntervention;
        }
    }

    pub fn needs_intervention(&self, record: &TaskRecord) -> bool {
        record.consecutive_failures >= self.threshold
    }

    /// Operator reset: the record becomes active and due immediately.
    pub fn reset(record: &mut TaskRecord, now: DateTime<Utc>) {
        record.status = TaskStatus::Active;
        record.consecutive_failures = 0;
        record.failure_reason = None;
        record.failure_pattern = None;
        record.next_due = now;
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}
