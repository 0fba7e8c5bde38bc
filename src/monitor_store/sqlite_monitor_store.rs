use super::models::{
    CumulativeStats, ExecutionLogEntry, ExecutionStatus, LogQuery, NewTaskRecord, SchedulerEvent,
    SchedulerEventType, StatsDelta, TaskRecord, TaskStatus,
};
use super::schema::MONITOR_VERSIONED_SCHEMAS;
use super::MonitorStore;
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const TASK_COLUMNS: &str = "id, task_type, tenant_id, subject_key, next_due, frequency_secs,
    last_check, last_success, last_failure, status, consecutive_failures, failure_pattern,
    failure_reason, created_at";

const EXECUTION_COLUMNS: &str =
    "id, task_id, task_type, tenant_id, execution_date, status, result, error_message, duration_ms";

const EVENT_COLUMNS: &str = "id, event_type, created_at, cycle_id, counts, duration_ms,
    active_strategies_count, active_executions, details";

pub struct SqliteMonitorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMonitorStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open monitor database")?;
        // Several scheduler processes may share this file.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;

        if is_new_db {
            info!("Creating new monitor database at {:?}", path);
        }
        open_versioned(&mut conn, MONITOR_VERSIONED_SCHEMAS, is_new_db)
            .with_context(|| format!("Failed to prepare monitor database at {:?}", path))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_default()
    }

    fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
        ms.map(Self::from_millis)
    }

    fn write_task_record(conn: &Connection, record: &TaskRecord) -> Result<usize> {
        let pattern = record
            .failure_pattern
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated = conn.execute(
            "UPDATE task_records SET
                next_due = ?1, frequency_secs = ?2, last_check = ?3, last_success = ?4,
                last_failure = ?5, status = ?6, consecutive_failures = ?7,
                failure_pattern = ?8, failure_reason = ?9
             WHERE id = ?10",
            params![
                Self::to_millis(&record.next_due),
                record.frequency_secs,
                record.last_check.as_ref().map(Self::to_millis),
                record.last_success.as_ref().map(Self::to_millis),
                record.last_failure.as_ref().map(Self::to_millis),
                record.status.as_str(),
                record.consecutive_failures as i64,
                pattern,
                record.failure_reason,
                record.id
            ],
        )?;
        Ok(updated)
    }

    fn row_to_task_record(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
        let status_str: String = row.get("status")?;
        let pattern_str: Option<String> = row.get("failure_pattern")?;
        let consecutive: i64 = row.get("consecutive_failures")?;

        Ok(TaskRecord {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            tenant_id: row.get("tenant_id")?,
            subject_key: row.get("subject_key")?,
            next_due: Self::from_millis(row.get("next_due")?),
            frequency_secs: row.get("frequency_secs")?,
            last_check: Self::opt_from_millis(row.get("last_check")?),
            last_success: Self::opt_from_millis(row.get("last_success")?),
            last_failure: Self::opt_from_millis(row.get("last_failure")?),
            // Unknown status strings stay out of the due set.
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
            consecutive_failures: consecutive.max(0) as u32,
            failure_pattern: pattern_str.and_then(|s| serde_json::from_str(&s).ok()),
            failure_reason: row.get("failure_reason")?,
            created_at: Self::from_millis(row.get("created_at")?),
        })
    }

    fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<ExecutionLogEntry> {
        let status_str: String = row.get("status")?;
        let result_str: Option<String> = row.get("result")?;

        Ok(ExecutionLogEntry {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            task_type: row.get("task_type")?,
            tenant_id: row.get("tenant_id")?,
            execution_date: Self::from_millis(row.get("execution_date")?),
            status: ExecutionStatus::parse(&status_str).unwrap_or(ExecutionStatus::Failed),
            result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
            error_message: row.get("error_message")?,
            duration_ms: row.get("duration_ms")?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<SchedulerEvent> {
        let event_type_str: String = row.get("event_type")?;
        let counts_str: Option<String> = row.get("counts")?;
        let details_str: Option<String> = row.get("details")?;
        let strategies: Option<i64> = row.get("active_strategies_count")?;
        let executions: Option<i64> = row.get("active_executions")?;

        Ok(SchedulerEvent {
            id: row.get("id")?,
            event_type: SchedulerEventType::parse(&event_type_str)
                .unwrap_or(SchedulerEventType::CheckCycle),
            created_at: Self::from_millis(row.get("created_at")?),
            cycle_id: row.get("cycle_id")?,
            counts: counts_str.and_then(|s| serde_json::from_str(&s).ok()),
            duration_ms: row.get("duration_ms")?,
            active_strategies_count: strategies.map(|v| v as u32),
            active_executions: executions.map(|v| v as u32),
            details: details_str.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

impl MonitorStore for SqliteMonitorStore {
    fn check_connection(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Monitor database is not reachable")?;
        Ok(())
    }

    fn create_task_record(&self, record: &NewTaskRecord) -> Result<TaskRecord> {
        let conn = self.conn.lock().unwrap();
        let now = Self::to_millis(&Utc::now());

        conn.execute(
            "INSERT INTO task_records
                (task_type, tenant_id, subject_key, next_due, frequency_secs, status,
                 consecutive_failures, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                record.task_type,
                record.tenant_id,
                record.subject_key,
                Self::to_millis(&record.next_due),
                record.frequency_secs,
                TaskStatus::Active.as_str(),
                now
            ],
        )
        .with_context(|| {
            format!(
                "Failed to create task record {}/{}/{}",
                record.tenant_id, record.task_type, record.subject_key
            )
        })?;

        let id = conn.last_insert_rowid();
        let created = conn.query_row(
            &format!("SELECT {} FROM task_records WHERE id = ?1", TASK_COLUMNS),
            params![id],
            Self::row_to_task_record,
        )?;
        Ok(created)
    }

    fn get_task_record(&self, id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM task_records WHERE id = ?1", TASK_COLUMNS),
                params![id],
                Self::row_to_task_record,
            )
            .optional()?;
        Ok(record)
    }

    fn find_task_record(
        &self,
        tenant_id: &str,
        task_type: &str,
        subject_key: &str,
    ) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM task_records
                     WHERE tenant_id = ?1 AND task_type = ?2 AND subject_key = ?3",
                    TASK_COLUMNS
                ),
                params![tenant_id, task_type, subject_key],
                Self::row_to_task_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list_due_tasks(
        &self,
        task_type: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_records
             WHERE task_type = ?1 AND status = ?2 AND next_due <= ?3
             ORDER BY next_due ASC, tenant_id ASC, id ASC
             LIMIT ?4",
            TASK_COLUMNS
        ))?;

        let records = stmt
            .query_map(
                params![
                    task_type,
                    TaskStatus::Active.as_str(),
                    Self::to_millis(&now),
                    limit as i64
                ],
                Self::row_to_task_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn list_tenant_tasks(&self, tenant_id: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM task_records WHERE tenant_id = ?1
             ORDER BY task_type ASC, next_due ASC",
            TASK_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![tenant_id], Self::row_to_task_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn update_task_record(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if Self::write_task_record(&conn, record)? == 0 {
            anyhow::bail!("Task record {} does not exist", record.id);
        }
        Ok(())
    }

    fn modify_task_record(
        &self,
        id: i64,
        apply: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn.lock().unwrap();
        // Immediate so another process cannot write between our read and write.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                &format!("SELECT {} FROM task_records WHERE id = ?1", TASK_COLUMNS),
                params![id],
                Self::row_to_task_record,
            )
            .optional()?;
        let Some(mut record) = current else {
            return Ok(None);
        };

        apply(&mut record);
        Self::write_task_record(&tx, &record)?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE task_records SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(updated > 0)
    }

    fn append_execution_log(&self, entry: &ExecutionLogEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let result = entry.result.as_ref().map(|v| v.to_string());

        conn.execute(
            "INSERT INTO execution_log
                (task_id, task_type, tenant_id, execution_date, status, result, error_message, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.task_id,
                entry.task_type,
                entry.tenant_id,
                Self::to_millis(&entry.execution_date),
                entry.status.as_str(),
                result,
                entry.error_message,
                entry.duration_ms
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_execution_log(
        &self,
        tenant_id: &str,
        task_id: i64,
        query: &LogQuery,
    ) -> Result<Vec<ExecutionLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM execution_log
             WHERE tenant_id = ?1 AND task_id = ?2
               AND (?3 IS NULL OR execution_date >= ?3)
               AND (?4 IS NULL OR execution_date <= ?4)
             ORDER BY execution_date DESC, id DESC
             LIMIT ?5 OFFSET ?6",
            EXECUTION_COLUMNS
        ))?;

        let entries = stmt
            .query_map(
                params![
                    tenant_id,
                    task_id,
                    query.from.as_ref().map(Self::to_millis),
                    query.to.as_ref().map(Self::to_millis),
                    query.limit as i64,
                    query.offset as i64
                ],
                Self::row_to_execution,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn append_scheduler_event(&self, event: &SchedulerEvent) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let counts = event.counts.as_ref().map(serde_json::to_string).transpose()?;
        let details = event.details.as_ref().map(|d| d.to_string());

        conn.execute(
            "INSERT INTO scheduler_event_log
                (event_type, created_at, cycle_id, counts, duration_ms,
                 active_strategies_count, active_executions, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_type.as_str(),
                Self::to_millis(&event.created_at),
                event.cycle_id,
                counts,
                event.duration_ms,
                event.active_strategies_count.map(|v| v as i64),
                event.active_executions.map(|v| v as i64),
                details
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_scheduler_events(
        &self,
        event_type: Option<SchedulerEventType>,
        query: &LogQuery,
    ) -> Result<Vec<SchedulerEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM scheduler_event_log
             WHERE (?1 IS NULL OR event_type = ?1)
               AND (?2 IS NULL OR created_at >= ?2)
               AND (?3 IS NULL OR created_at <= ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4 OFFSET ?5",
            EVENT_COLUMNS
        ))?;

        let events = stmt
            .query_map(
                params![
                    event_type.map(|t| t.as_str()),
                    query.from.as_ref().map(Self::to_millis),
                    query.to.as_ref().map(Self::to_millis),
                    query.limit as i64,
                    query.offset as i64
                ],
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn ensure_cumulative_stats(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT OR IGNORE INTO cumulative_stats (id) VALUES (1)", [])?;
        Ok(())
    }

    fn get_cumulative_stats(&self) -> Result<CumulativeStats> {
        let conn = self.conn.lock().unwrap();
        let stats = conn
            .query_row(
                "SELECT total_check_cycles, cumulative_tasks_found, cumulative_tasks_executed,
                        cumulative_tasks_failed, cumulative_tasks_skipped,
                        cumulative_job_completed, cumulative_job_failed,
                        last_check_cycle_id, last_updated
                 FROM cumulative_stats WHERE id = 1",
                [],
                |row| {
                    Ok(CumulativeStats {
                        total_check_cycles: row.get::<_, i64>(0)? as u64,
                        cumulative_tasks_found: row.get::<_, i64>(1)? as u64,
                        cumulative_tasks_executed: row.get::<_, i64>(2)? as u64,
                        cumulative_tasks_failed: row.get::<_, i64>(3)? as u64,
                        cumulative_tasks_skipped: row.get::<_, i64>(4)? as u64,
                        cumulative_job_completed: row.get::<_, i64>(5)? as u64,
                        cumulative_job_failed: row.get::<_, i64>(6)? as u64,
                        last_check_cycle_id: row.get(7)?,
                        last_updated: Self::opt_from_millis(row.get(8)?),
                    })
                },
            )
            .optional()?;
        Ok(stats.unwrap_or_default())
    }

    fn add_cycle_to_cumulative_stats(&self, delta: &StatsDelta, cycle_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Self::to_millis(&Utc::now());

        conn.execute("INSERT OR IGNORE INTO cumulative_stats (id) VALUES (1)", [])?;
        conn.execute(
            "UPDATE cumulative_stats SET
                total_check_cycles = total_check_cycles + ?1,
                cumulative_tasks_found = cumulative_tasks_found + ?2,
                cumulative_tasks_executed = cumulative_tasks_executed + ?3,
                cumulative_tasks_failed = cumulative_tasks_failed + ?4,
                cumulative_tasks_skipped = cumulative_tasks_skipped + ?5,
                cumulative_job_completed = cumulative_job_completed + ?6,
                cumulative_job_failed = cumulative_job_failed + ?7,
                last_check_cycle_id = ?8,
                last_updated = ?9
             WHERE id = 1",
            params![
                delta.check_cycles as i64,
                delta.tasks_found as i64,
                delta.tasks_executed as i64,
                delta.tasks_failed as i64,
                delta.tasks_skipped as i64,
                delta.job_completed as i64,
                delta.job_failed as i64,
                cycle_id,
                now
            ],
        )?;
        Ok(())
    }

    fn try_acquire_leader_lease(
        &self,
        lock_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        // Takes the row if it is free, expired, or already ours (renewal).
        let changed = conn.execute(
            "INSERT INTO leader_lease (lock_name, holder_id, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_name) DO UPDATE
                SET holder_id = excluded.holder_id, expires_at = excluded.expires_at
                WHERE leader_lease.holder_id = excluded.holder_id
                   OR leader_lease.expires_at <= ?4",
            params![lock_name, holder_id, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    fn release_leader_lease(&self, lock_name: &str, holder_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM leader_lease WHERE lock_name = ?1 AND holder_id = ?2",
            params![lock_name, holder_id],
        )?;
        Ok(())
    }
}
