//! End-to-end tests for leader-elected check cycles
//!
//! Every node in a test shares one SQLite file and competes for the same
//! leader lock. Nodes run the real runner loop with millisecond intervals.

mod common;

use common::{wait_until, Behavior, RecordingTaskType, TestCluster};
use recheck_scheduler::monitor_store::{
    LogQuery, MonitorStore, SchedulerEventType, TaskStatus,
};
use recheck_scheduler::scheduler::{QueryError, ReconcileAction, ReconcileError};
use std::time::Duration;

#[tokio::test]
async fn test_only_one_node_executes_due_work() {
    let cluster = TestCluster::new();
    let audit_a = RecordingTaskType::new("audit", Behavior::Succeed);
    let audit_b = RecordingTaskType::new("audit", Behavior::Succeed);
    for i in 0..5 {
        cluster.seed_task("audit", "tenant-a", &format!("site-{}", i), 3600);
    }

    let a = cluster.spawn_node("node-a", vec![audit_a.clone()]).await;
    assert!(wait_until(|| a.is_leader()).await);
    let b = cluster.spawn_node("node-b", vec![audit_b.clone()]).await;

    assert!(wait_until(|| audit_a.executions() == 5).await);
    // Give the follower several leadership ticks.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(a.is_leader());
    assert!(!b.is_leader());
    assert_eq!(audit_b.executions(), 0);
    assert_eq!(audit_a.executions(), 5);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_follower_takes_over_after_leader_stops() {
    let cluster = TestCluster::new();
    let audit_a = RecordingTaskType::new("audit", Behavior::Succeed);
    let audit_b = RecordingTaskType::new("audit", Behavior::Succeed);

    let a = cluster.spawn_node("node-a", vec![audit_a.clone()]).await;
    assert!(wait_until(|| a.is_leader()).await);
    let b = cluster.spawn_node("node-b", vec![audit_b.clone()]).await;

    a.stop().await;
    assert!(wait_until(|| b.is_leader()).await);

    cluster.seed_task("audit", "tenant-a", "late-arrival", 3600);
    assert!(wait_until(|| audit_b.executions() == 1).await);
    assert_eq!(audit_a.executions(), 0);

    let store = cluster.store();
    let scheduled = store
        .list_scheduler_events(Some(SchedulerEventType::JobScheduled), &LogQuery::default())
        .unwrap();
    let cancelled = store
        .list_scheduler_events(Some(SchedulerEventType::JobCancelled), &LogQuery::default())
        .unwrap();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(cancelled.len(), 1);

    b.stop().await;
}

#[tokio::test]
async fn test_cycle_updates_records_counters_and_events() {
    let cluster = TestCluster::new();
    let audit = RecordingTaskType::new("audit", Behavior::Succeed);
    let broken = RecordingTaskType::new("broken", Behavior::Fail("dns lookup failed"));
    let ok = cluster.seed_task("audit", "tenant-a", "example.org", 3600);
    let bad = cluster.seed_task("broken", "tenant-a", "example.net", 3600);

    let node = cluster
        .spawn_node("node-a", vec![audit.clone(), broken.clone()])
        .await;
    assert!(wait_until(|| audit.executions() == 1 && broken.executions() == 1).await);
    node.stop().await;

    let store = cluster.store();
    let ok = store.get_task_record(ok.id).unwrap().unwrap();
    assert_eq!(ok.status, TaskStatus::Active);
    assert!(ok.last_success.is_some());
    assert!(ok.next_due > ok.last_check.unwrap());

    let bad = store.get_task_record(bad.id).unwrap().unwrap();
    assert_eq!(bad.consecutive_failures, 1);
    assert_eq!(bad.failure_reason.as_deref(), Some("dns lookup failed"));

    let stats = store.get_cumulative_stats().unwrap();
    assert!(stats.total_check_cycles >= 1);
    assert_eq!(stats.cumulative_tasks_found, 2);
    assert_eq!(stats.cumulative_tasks_executed, 1);
    assert_eq!(stats.cumulative_tasks_failed, 1);

    let all = LogQuery {
        limit: 100_000,
        ..Default::default()
    };
    let cycles = store
        .list_scheduler_events(Some(SchedulerEventType::CheckCycle), &all)
        .unwrap();
    assert_eq!(cycles.len() as u64, stats.total_check_cycles);
    for event_type in [SchedulerEventType::Start, SchedulerEventType::Stop] {
        let events = store
            .list_scheduler_events(Some(event_type), &LogQuery::default())
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}

#[tokio::test]
async fn test_batch_deadline_fails_slow_tasks() {
    let cluster = TestCluster::new();
    let slow = RecordingTaskType::new("slow", Behavior::Hang(Duration::from_secs(30)));
    let record = cluster.seed_task("slow", "tenant-a", "tarpit.example", 3600);

    let mut settings = TestCluster::default_settings();
    settings.batch_timeout = Duration::from_millis(50);
    let node = cluster
        .spawn_node_with("node-a", vec![slow.clone()], settings)
        .await;

    let store = cluster.store();
    assert!(
        wait_until(|| {
            store
                .get_task_record(record.id)
                .unwrap()
                .is_some_and(|r| r.consecutive_failures == 1)
        })
        .await
    );
    node.stop().await;

    let record = store.get_task_record(record.id).unwrap().unwrap();
    assert_eq!(record.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(record.failure_pattern.unwrap().timeouts, 1);
}

#[tokio::test]
async fn test_tenant_isolation_and_reconcile_from_follower() {
    let cluster = TestCluster::new();
    let audit_a = RecordingTaskType::new("audit", Behavior::Succeed);
    let audit_b = RecordingTaskType::new("audit", Behavior::Succeed);
    let mine = cluster.seed_task("audit", "tenant-a", "shared.example", 3600);
    let theirs = cluster.seed_task("audit", "tenant-b", "shared.example", 3600);

    let leader = cluster.spawn_node("node-a", vec![audit_a.clone()]).await;
    let store = cluster.store();
    assert!(
        wait_until(|| {
            [(&mine, "tenant-a"), (&theirs, "tenant-b")].iter().all(|(task, tenant)| {
                store
                    .list_execution_log(tenant, task.id, &LogQuery::default())
                    .is_ok_and(|rows| rows.len() == 1)
            })
        })
        .await
    );
    let follower = cluster.spawn_node("node-b", vec![audit_b.clone()]).await;
    assert!(!follower.is_leader());

    let handle = &follower.handle;
    let history = handle
        .list_execution_log("tenant-a", mine.id, &LogQuery::default())
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(matches!(
        handle.list_execution_log("tenant-a", theirs.id, &LogQuery::default()),
        Err(QueryError::AccessDenied)
    ));
    assert_eq!(handle.list_tenant_tasks("tenant-a").unwrap().len(), 1);

    // A follower may force-run; it does not need the leader lock.
    let outcome = handle
        .reconcile("tenant-a", mine.id, ReconcileAction::ForceRun)
        .await
        .unwrap();
    assert!(outcome.execution.is_some());
    assert_eq!(audit_b.executed_subjects(), vec!["tenant-a/shared.example"]);

    let history = handle
        .list_execution_log("tenant-a", mine.id, &LogQuery::default())
        .unwrap();
    assert_eq!(history.len(), 2);

    assert!(matches!(
        handle
            .reconcile("tenant-a", theirs.id, ReconcileAction::Reset)
            .await,
        Err(ReconcileError::Query(QueryError::AccessDenied))
    ));

    leader.stop().await;
    follower.stop().await;
}

#[tokio::test]
async fn test_disabled_task_is_not_scheduled() {
    let cluster = TestCluster::new();
    let audit = RecordingTaskType::new("audit", Behavior::Succeed);
    let paused = cluster.seed_task("audit", "tenant-a", "paused.example", 3600);
    cluster
        .store()
        .set_task_status(paused.id, TaskStatus::Paused)
        .unwrap();
    cluster.seed_task("audit", "tenant-a", "live.example", 3600);

    let node = cluster.spawn_node("node-a", vec![audit.clone()]).await;
    assert!(wait_until(|| audit.executions() == 1).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(audit.executed_subjects(), vec!["tenant-a/live.example"]);

    node.stop().await;
}
