use super::engine::CheckCycleEngine;
use crate::monitor_store::{MonitorStore, SchedulerEvent, SchedulerEventType};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cluster-wide exclusive lock deciding which process discovers due work.
///
/// `try_acquire` never blocks. It returns `Ok(false)` while another process
/// holds the lock; that is the normal state for followers.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    fn holder_id(&self) -> &str;

    /// Acquire or renew the lock.
    async fn try_acquire(&self) -> Result<bool>;

    async fn release(&self) -> Result<()>;
}

/// Leader lock backed by a TTL lease row in the shared monitor database.
///
/// The holder renews on every leadership tick. If it crashes or loses the
/// database, the lease lapses after `ttl` and another process takes over.
pub struct StoreLeaderLock {
    store: Arc<dyn MonitorStore>,
    lock_name: String,
    holder_id: String,
    ttl: Duration,
}

impl StoreLeaderLock {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        lock_name: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            lock_name: lock_name.into(),
            holder_id: holder_id.into(),
            ttl,
        }
    }
}

#[async_trait]
impl LeaderLock for StoreLeaderLock {
    fn holder_id(&self) -> &str {
        &self.holder_id
    }

    async fn try_acquire(&self) -> Result<bool> {
        self.store
            .try_acquire_leader_lease(&self.lock_name, &self.holder_id, self.ttl)
    }

    async fn release(&self) -> Result<()> {
        self.store
            .release_leader_lease(&self.lock_name, &self.holder_id)
    }
}

struct CheckJob {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the recurring check job and creates or removes it as leadership
/// changes. The job exists exactly while this process is leader.
pub struct LeadershipMonitor {
    lock: Arc<dyn LeaderLock>,
    engine: Arc<CheckCycleEngine>,
    check_job: Mutex<Option<CheckJob>>,
}

impl LeadershipMonitor {
    pub fn new(lock: Arc<dyn LeaderLock>, engine: Arc<CheckCycleEngine>) -> Self {
        Self {
            lock,
            engine,
            check_job: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.lock.holder_id()
    }

    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    pub async fn has_check_job(&self) -> bool {
        self.check_job.lock().await.is_some()
    }

    /// Try to take or keep the lock and reconcile the check job with the
    /// result. Returns whether this process is leader after the tick.
    pub async fn tick(&self) -> bool {
        let acquired = match self.lock.try_acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Leader lock check failed, treating as not leader: {}", e);
                false
            }
        };

        let mut job = self.check_job.lock().await;
        if acquired {
            if job.is_none() {
                *job = Some(self.become_leader());
            } else {
                debug!("Leadership renewed by {}", self.instance_id());
            }
        } else if job.is_some() || self.engine.is_leader() {
            self.lose_leadership(job.take(), "lock lost").await;
        }
        acquired
    }

    /// Drop leadership voluntarily, e.g. at shutdown. Waits up to `wait`
    /// for an in-progress cycle to finish.
    pub async fn step_down(&self, wait: Duration) {
        let mut job = self.check_job.lock().await;
        let handle = self.lose_leadership(job.take(), "shutdown").await;

        if let Some(handle) = handle {
            if tokio::time::timeout(wait, handle).await.is_err() {
                warn!("Check job did not stop within {:?}", wait);
            }
        }
    }

    fn become_leader(&self) -> CheckJob {
        info!("Instance {} became leader", self.instance_id());
        self.engine.set_leadership(true);

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.engine).run_loop(token.clone()));

        self.append_event(
            SchedulerEventType::JobScheduled,
            json!({ "instance_id": self.instance_id() }),
        );
        CheckJob { token, handle }
    }

    async fn lose_leadership(
        &self,
        job: Option<CheckJob>,
        reason: &str,
    ) -> Option<JoinHandle<()>> {
        self.engine.set_leadership(false);

        let handle = job.map(|job| {
            info!("Instance {} lost leadership: {}", self.instance_id(), reason);
            // An in-progress cycle finishes locally, bounded by its deadline.
            job.token.cancel();
            self.append_event(
                SchedulerEventType::JobCancelled,
                json!({ "instance_id": self.instance_id(), "reason": reason }),
            );
            job.handle
        });

        if let Err(e) = self.lock.release().await {
            warn!("Failed to release leader lock: {}", e);
        }
        handle
    }

    fn append_event(&self, event_type: SchedulerEventType, details: serde_json::Value) {
        let event = SchedulerEvent::transition(event_type, details);
        if let Err(e) = self.engine.store().append_scheduler_event(&event) {
            error!("Failed to append {} event: {}", event_type.as_str(), e);
        }
    }
}
