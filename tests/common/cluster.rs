//! Scheduler processes sharing one monitor database
//!
//! Each node opens its own connection to the same SQLite file and competes
//! for the same leader lock, like separate processes would.

use super::fixtures::RecordingTaskType;
use chrono::{Duration as ChronoDuration, Utc};
use recheck_scheduler::monitor_store::{
    MonitorStore, NewTaskRecord, SqliteMonitorStore, TaskRecord,
};
use recheck_scheduler::scheduler::{
    create_scheduler_with_lock, EngineSettings, SchedulerHandle, SchedulerRunner,
    StoreLeaderLock, TaskTypeRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const LOCK_NAME: &str = "check_due_tasks";

/// Shared database for a group of nodes. Removed when dropped.
pub struct TestCluster {
    pub db_path: PathBuf,
    store: Arc<SqliteMonitorStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("monitor.db");
        let store = Arc::new(SqliteMonitorStore::new(&db_path).expect("Failed to open store"));
        Self {
            db_path,
            store,
            _temp_dir: temp_dir,
        }
    }

    /// A connection independent of any node.
    pub fn store(&self) -> Arc<SqliteMonitorStore> {
        Arc::clone(&self.store)
    }

    /// Insert an active record that is already due.
    pub fn seed_task(
        &self,
        task_type: &str,
        tenant_id: &str,
        subject_key: &str,
        frequency_secs: i64,
    ) -> TaskRecord {
        self.store
            .create_task_record(&NewTaskRecord {
                task_type: task_type.to_string(),
                tenant_id: tenant_id.to_string(),
                subject_key: subject_key.to_string(),
                frequency_secs,
                next_due: Utc::now() - ChronoDuration::seconds(1),
            })
            .expect("Failed to seed task")
    }

    pub fn default_settings() -> EngineSettings {
        EngineSettings {
            max_concurrent_executions: 4,
            batch_timeout: Duration::from_secs(5),
            cancel_grace: Duration::from_millis(200),
            due_batch_limit: 100,
            min_check_interval: Duration::from_millis(20),
            max_check_interval: Duration::from_millis(50),
            interval_hysteresis: Duration::ZERO,
        }
    }

    pub async fn spawn_node(&self, instance_id: &str, types: Vec<Arc<RecordingTaskType>>) -> TestNode {
        self.spawn_node_with(instance_id, types, Self::default_settings())
            .await
    }

    pub async fn spawn_node_with(
        &self,
        instance_id: &str,
        types: Vec<Arc<RecordingTaskType>>,
        settings: EngineSettings,
    ) -> TestNode {
        let store: Arc<dyn MonitorStore> =
            Arc::new(SqliteMonitorStore::new(&self.db_path).expect("Failed to open store"));

        let mut registry = TaskTypeRegistry::new();
        for task_type in types {
            registry.register(task_type).expect("Failed to register task type");
        }

        let lock = Arc::new(StoreLeaderLock::new(
            Arc::clone(&store),
            LOCK_NAME,
            instance_id,
            Duration::from_secs(2),
        ));
        let (runner, handle) = create_scheduler_with_lock(
            store,
            registry,
            settings,
            lock,
            Duration::from_millis(20),
        );

        let runner = Arc::new(runner);
        let shutdown = CancellationToken::new();
        let task = {
            let runner = Arc::clone(&runner);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                runner.run(shutdown).await.expect("Scheduler run failed");
            })
        };

        TestNode {
            instance_id: instance_id.to_string(),
            handle,
            runner,
            shutdown,
            task: Some(task),
        }
    }
}

/// One running scheduler. Shuts down when dropped.
pub struct TestNode {
    pub instance_id: String,
    pub handle: SchedulerHandle,
    runner: Arc<SchedulerRunner>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn is_leader(&self) -> bool {
        self.handle.snapshot().is_leader
    }

    pub fn runner(&self) -> &Arc<SchedulerRunner> {
        &self.runner
    }

    /// Graceful shutdown: steps down and releases the lock.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
