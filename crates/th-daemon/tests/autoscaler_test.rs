use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use th_agents::agent_loop::LoopSettings;
use th_core::board::TaskBoard;
use th_core::config::RoleDirectory;
use th_core::event_bus::EventBus;
use th_core::instances::InstanceManager;
use th_core::store::Store;
use th_core::types::*;
use th_daemon::autoscaler::{plan, AutoScaler, RoleSnapshot, ScaleAction, ScalePolicy, WorkerView};
use th_daemon::pool::{PoolError, WorkerPool};
use th_harness::executor::{Executor, ExecutorError};
use th_harness::routing::NoRouting;
use th_telemetry::metrics::{MetricsCollector, INSTANCES, PENDING_TASKS};

// ---------------------------------------------------------------------------
// plan()
// ---------------------------------------------------------------------------

fn policy(min: usize, max: usize, threshold: usize) -> ScalePolicy {
    ScalePolicy {
        min_instances: min,
        max_instances: max,
        scale_up_threshold: threshold,
        idle_window: Duration::from_secs(600),
    }
}

fn snapshot(pending: usize, idle_secs: &[Option<u64>]) -> RoleSnapshot {
    RoleSnapshot {
        role: "coder".into(),
        pending,
        workers: idle_secs
            .iter()
            .enumerate()
            .map(|(i, idle)| WorkerView {
                instance_id: format!("coder-{}", i + 1),
                idle_for: idle.map(Duration::from_secs),
            })
            .collect(),
    }
}

fn starts(actions: &[ScaleAction]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, ScaleAction::Start { .. }))
        .count()
}

#[test]
fn brings_role_up_to_minimum() {
    let actions = plan(&policy(2, 4, 3), &snapshot(0, &[]));
    assert_eq!(starts(&actions), 2);
}

#[test]
fn scales_up_one_at_a_time_when_backlog_reaches_threshold() {
    assert!(plan(&policy(1, 3, 3), &snapshot(2, &[None])).is_empty());
    assert_eq!(starts(&plan(&policy(1, 3, 3), &snapshot(3, &[None]))), 1);
    assert_eq!(starts(&plan(&policy(1, 3, 3), &snapshot(50, &[None, None]))), 1);
}

#[test]
fn never_exceeds_maximum() {
    assert!(plan(&policy(1, 3, 3), &snapshot(50, &[None, None, None])).is_empty());
}

#[test]
fn never_scales_below_minimum() {
    let actions = plan(&policy(2, 4, 3), &snapshot(0, &[Some(3600), Some(3600), Some(3600)]));
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], ScaleAction::Stop { .. }));

    assert!(plan(&policy(2, 4, 3), &snapshot(0, &[Some(3600), Some(3600)])).is_empty());
}

#[test]
fn idle_shorter_than_window_is_kept() {
    assert!(plan(&policy(1, 4, 3), &snapshot(0, &[Some(30), Some(599)])).is_empty());
}

#[test]
fn longest_idle_stops_first() {
    let actions = plan(&policy(1, 4, 3), &snapshot(0, &[Some(700), Some(1200), Some(900)]));
    assert_eq!(
        actions,
        vec![
            ScaleAction::Stop {
                role: "coder".into(),
                instance_id: "coder-2".into()
            },
            ScaleAction::Stop {
                role: "coder".into(),
                instance_id: "coder-3".into()
            },
        ]
    );
}

// ---------------------------------------------------------------------------
// AutoScaler over a real pool
// ---------------------------------------------------------------------------

/// Holds every task for an hour.
struct Busy;

#[async_trait]
impl Executor for Busy {
    async fn execute(&self, _task: &Task) -> Result<String, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

struct Fixture {
    board: TaskBoard,
    instances: InstanceManager,
    group: Group,
}

async fn fixture() -> Fixture {
    let store = Store::new_in_memory().await.unwrap();
    let roles = RoleDirectory::new()
        .with_role("planner", "PL", Some("FEAT"))
        .with_role("coder", "CD", None);
    let board = TaskBoard::new(store.clone(), roles, EventBus::new());
    let instances = InstanceManager::new(store, Duration::from_secs(90));
    let group = board.create_group("feature", "planner", "cli").await.unwrap();
    Fixture {
        board,
        instances,
        group,
    }
}

impl Fixture {
    fn pool(&self) -> WorkerPool {
        let settings = LoopSettings {
            poll_interval: Duration::from_secs(3600),
            ..LoopSettings::default()
        };
        WorkerPool::new(
            self.board.clone(),
            self.instances.clone(),
            Arc::new(NoRouting),
            settings,
        )
        .with_executor("coder", Arc::new(Busy))
    }
}

#[tokio::test]
async fn tick_scales_up_with_backlog_and_stops_at_max() {
    let fx = fixture().await;
    for _ in 0..6 {
        fx.board
            .create_task(NewTask::new(&fx.group.id, "t", "implementation", "coder", "cli"))
            .await
            .unwrap();
    }
    let metrics = Arc::new(MetricsCollector::new());
    let scaler = AutoScaler::new(fx.board.clone(), fx.instances.clone())
        .with_policy("coder", policy(1, 3, 2))
        .with_metrics(metrics.clone());
    let mut pool = fx.pool();

    let first = scaler.tick(&mut pool).await.unwrap();
    assert_eq!(starts(&first), 1);
    assert_eq!(pool.count("coder"), 1);

    assert_eq!(starts(&scaler.tick(&mut pool).await.unwrap()), 1);
    assert_eq!(starts(&scaler.tick(&mut pool).await.unwrap()), 1);
    assert_eq!(pool.count("coder"), 3);
    assert!(scaler.tick(&mut pool).await.unwrap().is_empty());
    assert_eq!(pool.count("coder"), 3);

    assert_eq!(metrics.get_gauge(INSTANCES, &[("role", "coder")]), 3);
    assert!(metrics.get_gauge(PENDING_TASKS, &[("role", "coder")]) >= 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fx.board.list_in_progress().await.unwrap().len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "workers never claimed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Busy workers never finish inside the grace period.
    let unfinished = pool.shutdown(Duration::from_millis(50)).await;
    assert_eq!(unfinished, 3);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn tick_stops_long_idle_workers_down_to_min() {
    let fx = fixture().await;
    let scaler = AutoScaler::new(fx.board.clone(), fx.instances.clone())
        .with_policy("coder", policy(1, 3, 2));
    let mut pool = fx.pool();
    for _ in 0..3 {
        pool.spawn("coder").await.unwrap();
    }

    // Nothing is idle long enough yet.
    assert!(scaler.tick(&mut pool).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::minutes(11);
    let actions = scaler.tick_at(&mut pool, later).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(pool.count("coder"), 1);
    assert_eq!(pool.instance_ids("coder"), vec!["coder-3".to_string()]);

    // Stopped loops exit on their own and deregister.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut reaped = Vec::new();
    while reaped.len() < 2 && tokio::time::Instant::now() < deadline {
        reaped.extend(pool.reap().await);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    reaped.sort();
    assert_eq!(reaped, vec!["coder-1".to_string(), "coder-2".to_string()]);
    assert_eq!(fx.instances.get_instances_by_role("coder").await.unwrap().len(), 1);

    assert_eq!(pool.shutdown(Duration::from_secs(2)).await, 0);
}

#[tokio::test]
async fn role_without_executor_cannot_spawn() {
    let fx = fixture().await;
    let mut pool = fx.pool();
    let err = pool.spawn("reviewer").await.unwrap_err();
    assert!(matches!(err, PoolError::NoExecutor(role) if role == "reviewer"));
    assert!(pool.is_empty());
}
