//! Recheck Scheduler Library
//!
//! Leader-elected scheduler for recurring per-tenant verification tasks.

pub mod config;
pub mod metrics;
pub mod monitor_store;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod task_types;

// Re-export commonly used types for convenience
pub use monitor_store::{MonitorStore, SqliteMonitorStore};
pub use scheduler::{create_scheduler, SchedulerHandle, SchedulerRunner, TaskType, TaskTypeRegistry};
