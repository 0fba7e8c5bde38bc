use super::engine::{CheckCycleEngine, EngineSettings};
use super::handle::SchedulerHandle;
use super::leadership::{LeaderLock, LeadershipMonitor, StoreLeaderLock};
use super::registry::TaskTypeRegistry;
use crate::config::SchedulerSettings;
use crate::monitor_store::{MonitorStore, SchedulerEvent, SchedulerEventType};
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Top-level scheduler process: re-checks leadership on a fixed cadence
/// until shut down.
pub struct SchedulerRunner {
    engine: Arc<CheckCycleEngine>,
    monitor: Arc<LeadershipMonitor>,
    leader_check_interval: Duration,
}

impl SchedulerRunner {
    pub fn monitor(&self) -> &Arc<LeadershipMonitor> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<CheckCycleEngine> {
        &self.engine
    }

    /// Main loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let store = self.engine.store();
        store.ensure_cumulative_stats()?;

        info!(
            "Starting scheduler {} with {} task types",
            self.monitor.instance_id(),
            self.engine.registry().len()
        );
        append_event(
            store,
            SchedulerEventType::Start,
            json!({
                "instance_id": self.monitor.instance_id(),
                "task_types": self.engine.registry().registered_types(),
            }),
        );

        loop {
            self.monitor.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.leader_check_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.monitor.step_down(SHUTDOWN_WAIT).await;
        append_event(
            store,
            SchedulerEventType::Stop,
            json!({ "instance_id": self.monitor.instance_id() }),
        );
        info!("Scheduler stopped");
        Ok(())
    }
}

fn append_event(store: &Arc<dyn MonitorStore>, event_type: SchedulerEventType, details: serde_json::Value) {
    let event = SchedulerEvent::transition(event_type, details);
    if let Err(e) = store.append_scheduler_event(&event) {
        error!("Failed to append {} event: {}", event_type.as_str(), e);
    }
}

/// Create a scheduler backed by the store's leader lease, and its handle.
pub fn create_scheduler(
    store: Arc<dyn MonitorStore>,
    registry: TaskTypeRegistry,
    settings: &SchedulerSettings,
) -> (SchedulerRunner, SchedulerHandle) {
    let lock = Arc::new(StoreLeaderLock::new(
        Arc::clone(&store),
        settings.leader_lock_name.clone(),
        settings.instance_id.clone(),
        settings.leader_lease_ttl(),
    ));
    create_scheduler_with_lock(
        store,
        registry,
        EngineSettings::from(settings),
        lock,
        settings.leader_check_interval(),
    )
}

/// Like [`create_scheduler`] with an explicit lock and engine settings.
pub fn create_scheduler_with_lock(
    store: Arc<dyn MonitorStore>,
    registry: TaskTypeRegistry,
    engine_settings: EngineSettings,
    lock: Arc<dyn LeaderLock>,
    leader_check_interval: Duration,
) -> (SchedulerRunner, SchedulerHandle) {
    let engine = Arc::new(CheckCycleEngine::new(
        store,
        Arc::new(registry),
        engine_settings,
    ));
    let monitor = Arc::new(LeadershipMonitor::new(lock, Arc::clone(&engine)));
    let handle = SchedulerHandle::new(Arc::clone(&engine));

    let runner = SchedulerRunner {
        engine,
        monitor,
        leader_check_interval,
    };
    (runner, handle)
}
