use super::context::ExecutionContext;
use super::failure_policy::FailurePolicy;
use super::interval::AdaptiveInterval;
use super::lease::{LeaseGuard, LeaseManager};
use super::registry::TaskTypeRegistry;
use super::task_type::{TaskError, TaskType};
use crate::config::SchedulerSettings;
use crate::metrics;
use crate::monitor_store::{
    CycleCounts, ExecutionLogEntry, ExecutionStatus, MonitorStore, SchedulerEvent,
    SchedulerEventType, StatsDelta, TaskRecord,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine-level faults. Each aborts at most one cycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("This process is not the leader")]
    NotLeader,

    #[error("A check cycle is already in progress")]
    CycleInProgress,

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Task {0} is already being executed")]
    AlreadyLeased(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrent_executions: usize,
    pub batch_timeout: Duration,
    pub cancel_grace: Duration,
    pub due_batch_limit: usize,
    pub min_check_interval: Duration,
    pub max_check_interval: Duration,
    pub interval_hysteresis: Duration,
}

impl From<&SchedulerSettings> for EngineSettings {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_concurrent_executions: settings.max_concurrent_executions,
            batch_timeout: settings.batch_timeout(),
            cancel_grace: settings.cancel_grace(),
            due_batch_limit: settings.due_batch_limit,
            min_check_interval: settings.min_check_interval(),
            max_check_interval: settings.max_check_interval(),
            interval_hysteresis: settings.interval_hysteresis(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Checking,
    Dispatching,
    Awaiting,
    Summarizing,
}

/// An execution currently holding a permit.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveExecution {
    pub task_id: i64,
    pub task_type: String,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveExecution>>>;

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub counts: CycleCounts,
    pub duration: Duration,
    pub active_strategies_count: usize,
    pub dispatched: usize,
    pub timed_out: bool,
    pub next_interval: Duration,
}

/// Point-in-time view of the engine for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub running: bool,
    pub phase: CyclePhase,
    pub is_leader: bool,
    pub execution_enabled: bool,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub current_interval_secs: u64,
    pub active_executions: usize,
    pub registered_types: Vec<String>,
}

/// Drives check cycles: load due work per task type, dispatch it under a
/// concurrency ceiling, bound the batch with a hard deadline, then summarize.
pub struct CheckCycleEngine {
    store: Arc<dyn MonitorStore>,
    registry: Arc<TaskTypeRegistry>,
    leases: Arc<LeaseManager>,
    semaphore: Arc<Semaphore>,
    settings: EngineSettings,
    interval: Mutex<AdaptiveInterval>,
    phase: Mutex<CyclePhase>,
    cycle_lock: tokio::sync::Mutex<()>,
    is_leader: AtomicBool,
    execution_enabled: AtomicBool,
    active: ActiveMap,
}

impl CheckCycleEngine {
    pub fn new(
        store: Arc<dyn MonitorStore>,
        registry: Arc<TaskTypeRegistry>,
        settings: EngineSettings,
    ) -> Self {
        let interval = AdaptiveInterval::new(
            settings.min_check_interval,
            settings.max_check_interval,
            settings.interval_hysteresis,
        );
        metrics::set_check_interval(interval.current());

        Self {
            store,
            registry,
            leases: Arc::new(LeaseManager::new()),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_executions.max(1))),
            settings,
            interval: Mutex::new(interval),
            phase: Mutex::new(CyclePhase::Idle),
            cycle_lock: tokio::sync::Mutex::new(()),
            is_leader: AtomicBool::new(false),
            execution_enabled: AtomicBool::new(false),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn MonitorStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskTypeRegistry> {
        &self.registry
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Called by the leadership monitor on every transition.
    pub fn set_leadership(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
        self.execution_enabled.store(is_leader, Ordering::SeqCst);
        metrics::set_is_leader(is_leader);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn is_execution_enabled(&self) -> bool {
        self.is_leader() && self.execution_enabled.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap()
    }

    pub fn current_interval(&self) -> Duration {
        self.interval.lock().unwrap().current()
    }

    pub fn active_executions(&self) -> Vec<(String, ActiveExecution)> {
        let active = self.active.lock().unwrap();
        let mut entries: Vec<_> = active.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let phase = self.phase();
        let interval = self.interval.lock().unwrap().clone();
        let (min, max) = interval.bounds();
        SchedulerSnapshot {
            running: phase != CyclePhase::Idle,
            phase,
            is_leader: self.is_leader(),
            execution_enabled: self.is_execution_enabled(),
            min_interval_secs: min.as_secs(),
            max_interval_secs: max.as_secs(),
            current_interval_secs: interval.current().as_secs(),
            active_executions: self.active.lock().unwrap().len(),
            registered_types: self.registry.registered_types(),
        }
    }

    /// The recurring check job. Runs a cycle, sleeps for the adaptive
    /// interval, repeats until `shutdown` fires. An in-progress cycle always
    /// runs to completion, bounded by the batch deadline.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Check job started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(summary) => debug!(
                    "Cycle {} done, next in {:?}",
                    summary.cycle_id, summary.next_interval
                ),
                Err(EngineError::NotLeader) => debug!("Skipping check cycle: not leader"),
                Err(e) => warn!("Check cycle failed: {}", e),
            }

            let delay = self.current_interval();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Check job stopped");
    }

    /// Run one full check cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary, EngineError> {
        if !self.is_execution_enabled() {
            return Err(EngineError::NotLeader);
        }
        let _cycle = self
            .cycle_lock
            .try_lock()
            .map_err(|_| EngineError::CycleInProgress)?;
        let phase = PhaseGuard::new(&self.phase);
        phase.enter(CyclePhase::Checking);

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        debug!("Starting check cycle {}", cycle_id);

        if let Err(e) = self.store.check_connection() {
            error!("Check cycle {} aborted, store unavailable: {}", cycle_id, e);
            self.record_aborted_cycle(&cycle_id, started.elapsed(), &e);
            return Err(EngineError::Store(e));
        }

        let batch_token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            batch_token.clone(),
            Arc::clone(&self.store),
            self.settings.due_batch_limit,
        );
        let mut counts = CycleCounts::default();

        // Checking: ask every type for due work, in registration order.
        let mut due_by_type = Vec::with_capacity(self.registry.len());
        for task_type in self.registry.iter() {
            let name = task_type.name().to_string();
            counts.by_type.entry(name.clone()).or_default();

            if !self.is_execution_enabled() {
                warn!("Leadership lost during cycle {}, not loading {}", cycle_id, name);
                continue;
            }

            let loaded = AssertUnwindSafe(task_type.load_due(&ctx)).catch_unwind().await;
            let records = match loaded {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    error!("Loader for task type {} failed: {}", name, e);
                    continue;
                }
                Err(_) => {
                    error!("Loader for task type {} panicked", name);
                    continue;
                }
            };
            if !records.is_empty() {
                debug!("Task type {} has {} due records", name, records.len());
            }
            due_by_type.push((Arc::clone(task_type), records));
        }

        // Dispatching
        phase.enter(CyclePhase::Dispatching);
        let mut active_strategies = 0;
        let mut dispatched: HashMap<String, (Arc<dyn TaskType>, TaskRecord)> = HashMap::new();
        let mut join_set = JoinSet::new();

        for (task_type, records) in due_by_type {
            let name = task_type.name().to_string();
            if !records.is_empty() {
                active_strategies += 1;
            }

            for record in records {
                let type_counts = counts.by_type.entry(name.clone()).or_default();
                type_counts.found += 1;
                counts.tasks_found += 1;

                let task_key = record.task_key();
                let lease = if self.leases.is_leased(&task_key) {
                    None
                } else {
                    self.leases.try_lease(&task_key)
                };
                let Some(lease) = lease else {
                    warn!("Skipping {}: already leased", task_key);
                    type_counts.skipped += 1;
                    counts.tasks_skipped += 1;
                    metrics::record_task_skipped(&name);
                    continue;
                };

                debug!("Dispatching {}", task_key);
                dispatched.insert(task_key, (Arc::clone(&task_type), record.clone()));
                join_set.spawn(run_unit(
                    DispatchUnit {
                        task_type: Arc::clone(&task_type),
                        record,
                        lease,
                    },
                    ctx.clone(),
                    Arc::clone(&self.semaphore),
                    Arc::clone(&self.active),
                ));
            }
        }

        // Awaiting
        phase.enter(CyclePhase::Awaiting);
        let dispatched_count = dispatched.len();
        let (reports, stage) = self.await_batch(&mut join_set, &batch_token, &cycle_id).await;

        for report in &reports {
            dispatched.remove(&report.task_key);
            tally(&mut counts, &report.entry);
        }
        // Units that never reported were aborted after the grace period, or
        // panicked. Their leases went with them; record the failure here.
        for (task_key, (task_type, record)) in dispatched {
            let error = if stage == AwaitStage::Running {
                TaskError::Execution("executor panicked".to_string())
            } else {
                TaskError::Timeout
            };
            let (entry, _) = record_attempt(
                &self.store,
                task_type.as_ref(),
                record,
                Err(error),
                self.settings.batch_timeout,
            );
            tally(&mut counts, &entry);
            let mut active = self.active.lock().unwrap();
            active.remove(&task_key);
            metrics::set_active_executions(active.len());
        }

        // Summarizing
        phase.enter(CyclePhase::Summarizing);
        let duration = started.elapsed();
        let timed_out = stage != AwaitStage::Running;
        self.record_completed_cycle(
            &cycle_id,
            &counts,
            duration,
            active_strategies,
            dispatched_count,
        );

        let next_interval = self.adjust_interval(active_strategies, dispatched_count);

        info!(
            "Check cycle {} finished in {:?}: {} found, {} succeeded, {} failed, {} skipped",
            cycle_id,
            duration,
            counts.tasks_found,
            counts.tasks_executed,
            counts.tasks_failed,
            counts.tasks_skipped
        );

        Ok(CycleSummary {
            cycle_id,
            counts,
            duration,
            active_strategies_count: active_strategies,
            dispatched: dispatched_count,
            timed_out,
            next_interval,
        })
    }

    /// Run one record right away through the same lease and failure-policy
    /// path as scheduled work. Not gated on leadership.
    pub async fn execute_now(
        &self,
        record: TaskRecord,
    ) -> Result<(ExecutionLogEntry, TaskRecord), EngineError> {
        let task_type = self
            .registry
            .get(&record.task_type)
            .ok_or_else(|| EngineError::UnknownTaskType(record.task_type.clone()))?;
        let task_key = record.task_key();
        let lease = self
            .leases
            .try_lease(&task_key)
            .ok_or(EngineError::AlreadyLeased(task_key))?;

        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            token.clone(),
            Arc::clone(&self.store),
            self.settings.due_batch_limit,
        );
        let deadline = self.settings.batch_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            token.cancel();
        });

        let report = run_unit(
            DispatchUnit {
                task_type,
                record,
                lease,
            },
            ctx,
            Arc::clone(&self.semaphore),
            Arc::clone(&self.active),
        )
        .await;
        timer.abort();

        Ok((report.entry, report.record))
    }

    async fn await_batch(
        &self,
        join_set: &mut JoinSet<UnitReport>,
        batch_token: &CancellationToken,
        cycle_id: &str,
    ) -> (Vec<UnitReport>, AwaitStage) {
        let mut reports = Vec::with_capacity(join_set.len());
        let mut stage = AwaitStage::Running;
        let deadline = tokio::time::sleep(self.settings.batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    None => break,
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => error!("Execution in cycle {} panicked: {}", cycle_id, e),
                },
                _ = &mut deadline, if stage != AwaitStage::Aborted => match stage {
                    AwaitStage::Running => {
                        warn!(
                            "Cycle {} hit the {:?} batch deadline with {} executions pending, cancelling",
                            cycle_id,
                            self.settings.batch_timeout,
                            join_set.len()
                        );
                        batch_token.cancel();
                        stage = AwaitStage::Cancelling;
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.settings.cancel_grace);
                    }
                    AwaitStage::Cancelling => {
                        warn!(
                            "Aborting {} executions in cycle {} that ignored cancellation",
                            join_set.len(),
                            cycle_id
                        );
                        join_set.abort_all();
                        stage = AwaitStage::Aborted;
                    }
                    AwaitStage::Aborted => {}
                },
            }
        }

        (reports, stage)
    }

    fn record_completed_cycle(
        &self,
        cycle_id: &str,
        counts: &CycleCounts,
        duration: Duration,
        active_strategies: usize,
        dispatched: usize,
    ) {
        let event = SchedulerEvent {
            id: 0,
            event_type: SchedulerEventType::CheckCycle,
            created_at: Utc::now(),
            cycle_id: Some(cycle_id.to_string()),
            counts: Some(counts.clone()),
            duration_ms: Some(duration.as_millis() as i64),
            active_strategies_count: Some(active_strategies as u32),
            active_executions: Some(dispatched as u32),
            details: None,
        };
        if let Err(e) = self.store.append_scheduler_event(&event) {
            error!("Failed to append check_cycle event for {}: {}", cycle_id, e);
        }

        let delta = StatsDelta::for_completed_cycle(counts);
        if let Err(e) = self.store.add_cycle_to_cumulative_stats(&delta, cycle_id) {
            error!("Failed to update cumulative stats for {}: {}", cycle_id, e);
        }
        metrics::record_check_cycle("completed");
    }

    fn record_aborted_cycle(&self, cycle_id: &str, duration: Duration, cause: &anyhow::Error) {
        let mut event = SchedulerEvent::transition(
            SchedulerEventType::JobFailed,
            json!({ "error": cause.to_string() }),
        );
        event.cycle_id = Some(cycle_id.to_string());
        event.duration_ms = Some(duration.as_millis() as i64);
        if let Err(e) = self.store.append_scheduler_event(&event) {
            error!("Failed to append job_failed event for {}: {}", cycle_id, e);
        }
        if let Err(e) = self
            .store
            .add_cycle_to_cumulative_stats(&StatsDelta::for_failed_cycle(), cycle_id)
        {
            error!("Failed to update cumulative stats for {}: {}", cycle_id, e);
        }
        metrics::record_check_cycle("aborted");
    }

    fn adjust_interval(&self, active_strategies: usize, active_executions: usize) -> Duration {
        let change = {
            let mut interval = self.interval.lock().unwrap();
            interval.observe(
                active_strategies,
                active_executions,
                self.settings.max_concurrent_executions,
            )
        };

        if let Some(change) = change {
            info!(
                "Check interval {}s -> {}s ({} active types, {} executions)",
                change.previous_secs,
                change.current_secs,
                change.active_strategies,
                change.active_executions
            );
            let details = serde_json::to_value(&change).unwrap_or(JsonValue::Null);
            let mut event =
                SchedulerEvent::transition(SchedulerEventType::IntervalAdjustment, details);
            event.active_strategies_count = Some(change.active_strategies as u32);
            event.active_executions = Some(change.active_executions as u32);
            if let Err(e) = self.store.append_scheduler_event(&event) {
                error!("Failed to append interval_adjustment event: {}", e);
            }
        }

        let current = self.current_interval();
        metrics::set_check_interval(current);
        current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitStage {
    Running,
    Cancelling,
    Aborted,
}

/// Resets the phase to Idle on every exit from a cycle.
struct PhaseGuard<'a> {
    phase: &'a Mutex<CyclePhase>,
}

impl<'a> PhaseGuard<'a> {
    fn new(phase: &'a Mutex<CyclePhase>) -> Self {
        Self { phase }
    }

    fn enter(&self, next: CyclePhase) {
        *self.phase.lock().unwrap() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap() = CyclePhase::Idle;
    }
}

struct DispatchUnit {
    task_type: Arc<dyn TaskType>,
    record: TaskRecord,
    lease: LeaseGuard,
}

struct UnitReport {
    task_key: String,
    entry: ExecutionLogEntry,
    record: TaskRecord,
}

/// One dispatched execution. Completion and cancellation both end in
/// `finish_unit`, which records the attempt and releases the lease.
async fn run_unit(
    unit: DispatchUnit,
    ctx: ExecutionContext,
    semaphore: Arc<Semaphore>,
    active: ActiveMap,
) -> UnitReport {
    let started = Instant::now();
    let token = ctx.cancellation_token.clone();

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(TaskError::Timeout),
        result = execute_with_permit(&unit, &ctx, &semaphore, &active) => result,
    };

    finish_unit(unit, &ctx.store, &active, outcome, started.elapsed())
}

async fn execute_with_permit(
    unit: &DispatchUnit,
    ctx: &ExecutionContext,
    semaphore: &Semaphore,
    active: &ActiveMap,
) -> Result<JsonValue, TaskError> {
    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| TaskError::Execution("executor pool closed".to_string()))?;

    {
        let mut active = active.lock().unwrap();
        active.insert(
            unit.lease.task_key().to_string(),
            ActiveExecution {
                task_id: unit.record.id,
                task_type: unit.record.task_type.clone(),
                tenant_id: unit.record.tenant_id.clone(),
                started_at: Utc::now(),
            },
        );
        metrics::set_active_executions(active.len());
    }

    unit.task_type.execute(ctx, &unit.record).await
}

fn finish_unit(
    unit: DispatchUnit,
    store: &Arc<dyn MonitorStore>,
    active: &ActiveMap,
    outcome: Result<JsonValue, TaskError>,
    elapsed: Duration,
) -> UnitReport {
    let DispatchUnit {
        task_type,
        record,
        lease,
    } = unit;
    let task_key = lease.task_key().to_string();

    let (entry, record) = record_attempt(store, task_type.as_ref(), record, outcome, elapsed);

    {
        let mut active = active.lock().unwrap();
        active.remove(&task_key);
        metrics::set_active_executions(active.len());
    }
    drop(lease);

    UnitReport {
        task_key,
        entry,
        record,
    }
}
/// Apply the failure policy to the stored record, persist it and append the log row.
/// Apply the failure policy to `record`, persist it and append the log row.
/// Persistence failures are logged; the attempt still counts.
fn record_attempt(
    store: &Arc<dyn MonitorStore>,
    task_type: &dyn TaskType,
    mut record: TaskRecord,
    outcome: Result<JsonValue, TaskError>,
    elapsed: Duration,
) -> (ExecutionLogEntry, TaskRecord) {
    let now = Utc::now();
    let policy = FailurePolicy::new(task_type.failure_threshold());
    let task_key = record.task_key();

    let (status, result, failure) = match outcome {
        Ok(value) => {
            debug!("{} succeeded in {:?}", task_key, elapsed);
            (ExecutionStatus::Success, Some(value), None)
        }
        Err(e) => {
            let reason = e.to_string();
            let timed_out = matches!(e, TaskError::Timeout);
            if timed_out {
                warn!("{} timed out after {:?}", task_key, elapsed);
            } else {
                error!("{} failed after {:?}: {}", task_key, elapsed, reason);
            }
            (ExecutionStatus::Failed, None, Some((reason, timed_out)))
        }
    };

    // Applied to the stored row, not to the copy taken at dispatch.
    let mut apply = |r: &mut TaskRecord| match &failure {
        None => policy.record_success(r, now),
        Some((reason, timed_out)) => policy.record_failure(r, reason, *timed_out, now),
    };
    match store.modify_task_record(record.id, &mut apply) {
        Ok(Some(stored)) => record = stored,
        Ok(None) => {
            warn!("Task record {} was removed while executing", task_key);
            apply(&mut record);
        }
        Err(e) => {
            error!("Failed to persist task record {}: {}", task_key, e);
            apply(&mut record);
        }
    }
    if failure.is_some() && policy.needs_intervention(&record) {
        warn!(
            "{} needs intervention after {} consecutive failures",
            task_key, record.consecutive_failures
        );
    }
    let error_message = failure.map(|(reason, _)| reason);

    let mut entry = ExecutionLogEntry {
        id: 0,
        task_id: record.id,
        task_type: record.task_type.clone(),
        tenant_id: record.tenant_id.clone(),
        execution_date: now,
        status,
        result,
        error_message,
        duration_ms: elapsed.as_millis() as i64,
    };
    match store.append_execution_log(&entry) {
        Ok(id) => entry.id = id,
        Err(e) => error!("Failed to append execution log for {}: {}", task_key, e),
    }

    metrics::record_task_execution(&record.task_type, status.as_str(), elapsed);
    (entry, record)
}

fn tally(counts: &mut CycleCounts, entry: &ExecutionLogEntry) {
    let type_counts = counts.by_type.entry(entry.task_type.clone()).or_default();
    match entry.status {
        ExecutionStatus::Success => {
            type_counts.executed += 1;
            counts.tasks_executed += 1;
        }
        _ => {
            type_counts.failed += 1;
            counts.tasks_failed += 1;
        }
    }
}
