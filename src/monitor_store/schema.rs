//! SQLite schema definitions for the monitor database.
//!
//! Holds the monitored task records, the append-only execution and scheduler
//! event logs, the single-row cumulative counters and the leader lease.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Task records, logs and counters
// =============================================================================

const TASK_RECORDS_TABLE_V1: Table = Table {
    name: "task_records",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_type", SqlType::Text, non_null = true),
        sqlite_column!("tenant_id", SqlType::Text, non_null = true),
        sqlite_column!("subject_key", SqlType::Text, non_null = true),
        sqlite_column!("next_due", SqlType::Integer, non_null = true), // unix millis
        sqlite_column!("frequency_secs", SqlType::Integer, non_null = true),
        sqlite_column!("last_check", SqlType::Integer),
        sqlite_column!("last_success", SqlType::Integer),
        sqlite_column!("last_failure", SqlType::Integer),
        sqlite_column!("status", SqlType::Text, non_null = true),
        sqlite_column!(
            "consecutive_failures",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("failure_pattern", SqlType::Text), // JSON
        sqlite_column!("failure_reason", SqlType::Text),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_task_records_due", "task_type, status, next_due"),
        ("idx_task_records_tenant", "tenant_id"),
    ],
    unique_constraints: &[&["tenant_id", "task_type", "subject_key"]],
};

const EXECUTION_LOG_TABLE_V1: Table = Table {
    name: "execution_log",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("task_id", SqlType::Integer, non_null = true),
        sqlite_column!("task_type", SqlType::Text, non_null = true),
        sqlite_column!("tenant_id", SqlType::Text, non_null = true),
        sqlite_column!("execution_date", SqlType::Integer, non_null = true),
        sqlite_column!("status", SqlType::Text, non_null = true),
        sqlite_column!("result", SqlType::Text), // JSON
        sqlite_column!("error_message", SqlType::Text),
        sqlite_column!("duration_ms", SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_execution_log_task_date", "task_id, execution_date DESC"),
        ("idx_execution_log_tenant", "tenant_id"),
    ],
    unique_constraints: &[],
};

const SCHEDULER_EVENT_LOG_TABLE_V1: Table = Table {
    name: "scheduler_event_log",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("event_type", SqlType::Text, non_null = true),
        sqlite_column!("created_at", SqlType::Integer, non_null = true),
        sqlite_column!("cycle_id", SqlType::Text),
        sqlite_column!("counts", SqlType::Text), // JSON
        sqlite_column!("duration_ms", SqlType::Integer),
        sqlite_column!("active_strategies_count", SqlType::Integer),
        sqlite_column!("active_executions", SqlType::Integer),
        sqlite_column!("details", SqlType::Text), // JSON
    ],
    indices: &[
        ("idx_scheduler_event_log_type_date", "event_type, created_at DESC"),
        ("idx_scheduler_event_log_date", "created_at DESC"),
    ],
    unique_constraints: &[],
};

const CUMULATIVE_STATS_TABLE_V1: Table = Table {
    name: "cumulative_stats",
    columns: &[
        // Always 1; the primary key keeps the table at a single row.
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("total_check_cycles", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_tasks_found", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_tasks_executed", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_tasks_failed", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_tasks_skipped", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_job_completed", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("cumulative_job_failed", SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("last_check_cycle_id", SqlType::Text),
        sqlite_column!("last_updated", SqlType::Integer),
    ],
    indices: &[],
    unique_constraints: &[],
};

// =============================================================================
// Version 2 - Leader lease
// =============================================================================

const LEADER_LEASE_TABLE_V2: Table = Table {
    name: "leader_lease",
    columns: &[
        sqlite_column!("lock_name", SqlType::Text, is_primary_key = true),
        sqlite_column!("holder_id", SqlType::Text, non_null = true),
        sqlite_column!("expires_at", SqlType::Integer, non_null = true), // unix millis
    ],
    indices: &[],
    unique_constraints: &[],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE leader_lease (
            lock_name TEXT PRIMARY KEY,
            holder_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

// =============================================================================
// Versioned Schema Definition
// =============================================================================

/// Version 1: task records, execution log, event log, cumulative stats
/// Version 2: leader lease table
pub const MONITOR_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            TASK_RECORDS_TABLE_V1,
            EXECUTION_LOG_TABLE_V1,
            SCHEDULER_EVENT_LOG_TABLE_V1,
            CUMULATIVE_STATS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            TASK_RECORDS_TABLE_V1,
            EXECUTION_LOG_TABLE_V1,
            SCHEDULER_EVENT_LOG_TABLE_V1,
            CUMULATIVE_STATS_TABLE_V1,
            LEADER_LEASE_TABLE_V2,
        ],
        migration: Some(migrate_v1_to_v2),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_persistence::{open_versioned, BASE_DB_VERSION};
    use rusqlite::Connection;

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let latest = MONITOR_VERSIONED_SCHEMAS.last().unwrap();
        latest.create(&conn).unwrap();
        latest.validate(&conn).unwrap();
    }

    #[test]
    fn test_migration_v1_to_v2_adds_leader_lease() {
        let mut conn = Connection::open_in_memory().unwrap();
        MONITOR_VERSIONED_SCHEMAS[0].create(&conn).unwrap();

        open_versioned(&mut conn, MONITOR_VERSIONED_SCHEMAS, false).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, BASE_DB_VERSION as i64 + 2);
        MONITOR_VERSIONED_SCHEMAS[1].validate(&conn).unwrap();
    }

    #[test]
    fn test_task_records_unique_per_subject() {
        let conn = Connection::open_in_memory().unwrap();
        MONITOR_VERSIONED_SCHEMAS.last().unwrap().create(&conn).unwrap();

        let insert = "INSERT INTO task_records
            (task_type, tenant_id, subject_key, next_due, frequency_secs, status, created_at)
            VALUES ('audit', 't1', 'site', 0, 60, 'active', 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
