//! Per-role elastic scaling.
//!
//! Decisions come from the pure [`plan`] function over a [`RoleSnapshot`];
//! [`AutoScaler::tick`] gathers snapshots from the board and instance table
//! and applies the plan to a [`WorkerPool`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use th_core::board::{BoardError, TaskBoard};
use th_core::config::RoleConfig;
use th_core::instances::{InstanceError, InstanceManager};
use th_core::types::InstanceStatus;
use th_telemetry::metrics::{MetricsCollector, INSTANCES, PENDING_TASKS};
use tracing::{debug, error, info};

use crate::pool::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error("board: {0}")]
    Board(#[from] BoardError),
    #[error("instances: {0}")]
    Instance(#[from] InstanceError),
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    pub min_instances: usize,
    pub max_instances: usize,
    pub scale_up_threshold: usize,
    pub idle_window: Duration,
}

impl From<&RoleConfig> for ScalePolicy {
    fn from(role: &RoleConfig) -> Self {
        Self {
            min_instances: role.min_instances,
            max_instances: role.max_instances,
            scale_up_threshold: role.scale_up_threshold,
            idle_window: role.scale_down_idle(),
        }
    }
}

/// One running instance as the scaler sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerView {
    pub instance_id: String,
    /// How long the instance has been continuously idle; `None` if it is
    /// not idle.
    pub idle_for: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub role: String,
    pub pending: usize,
    pub workers: Vec<WorkerView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Start { role: String },
    Stop { role: String, instance_id: String },
}

/// Decide what to start or stop for one role.
///
/// - below `min_instances`: start enough to reach it
/// - backlog at or above the threshold and below `max_instances`: start one
/// - otherwise stop instances idle longer than the window, longest idle
///   first, never going below `min_instances`
pub fn plan(policy: &ScalePolicy, snapshot: &RoleSnapshot) -> Vec<ScaleAction> {
    let count = snapshot.workers.len();
    let start = |n: usize| {
        (0..n)
            .map(|_| ScaleAction::Start {
                role: snapshot.role.clone(),
            })
            .collect::<Vec<_>>()
    };

    if count < policy.min_instances {
        return start(policy.min_instances - count);
    }
    if snapshot.pending >= policy.scale_up_threshold && count < policy.max_instances {
        return start(1);
    }

    let mut idle: Vec<(&WorkerView, Duration)> = snapshot
        .workers
        .iter()
        .filter_map(|w| w.idle_for.filter(|d| *d > policy.idle_window).map(|d| (w, d)))
        .collect();
    idle.sort_by(|a, b| b.1.cmp(&a.1));

    let removable = count.saturating_sub(policy.min_instances);
    idle.into_iter()
        .take(removable)
        .map(|(w, _)| ScaleAction::Stop {
            role: snapshot.role.clone(),
            instance_id: w.instance_id.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// AutoScaler
// ---------------------------------------------------------------------------

pub struct AutoScaler {
    board: TaskBoard,
    instances: InstanceManager,
    policies: BTreeMap<String, ScalePolicy>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AutoScaler {
    pub fn new(board: TaskBoard, instances: InstanceManager) -> Self {
        Self {
            board,
            instances,
            policies: BTreeMap::new(),
            metrics: None,
        }
    }

    pub fn with_policy(mut self, role: impl Into<String>, policy: ScalePolicy) -> Self {
        self.policies.insert(role.into(), policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Current state of `role`'s backlog and running workers.
    pub async fn snapshot(
        &self,
        role: &str,
        pool: &WorkerPool,
        now: DateTime<Utc>,
    ) -> Result<RoleSnapshot, ScaleError> {
        let pending = self.board.pending_count(role).await?;
        let rows = self.instances.get_instances_by_role(role).await?;

        let workers = pool
            .instance_ids(role)
            .into_iter()
            .map(|instance_id| {
                let idle_for = rows
                    .iter()
                    .find(|r| r.id == instance_id)
                    .filter(|r| r.status == InstanceStatus::Idle)
                    .map(|r| {
                        now.signed_duration_since(r.status_changed_at)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                    });
                WorkerView {
                    instance_id,
                    idle_for,
                }
            })
            .collect();

        Ok(RoleSnapshot {
            role: role.to_string(),
            pending,
            workers,
        })
    }

    /// Plan and apply one round for every role. Returns the actions taken.
    pub async fn tick(&self, pool: &mut WorkerPool) -> Result<Vec<ScaleAction>, ScaleError> {
        self.tick_at(pool, Utc::now()).await
    }

    pub async fn tick_at(
        &self,
        pool: &mut WorkerPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScaleAction>, ScaleError> {
        let mut applied = Vec::new();
        for (role, policy) in &self.policies {
            let snapshot = self.snapshot(role, pool, now).await?;
            let actions = plan(policy, &snapshot);
            debug!(role, pending = snapshot.pending, workers = snapshot.workers.len(), ?actions, "scale plan");

            for action in actions {
                match &action {
                    ScaleAction::Start { role } => match pool.spawn(role).await {
                        Ok(instance_id) => info!(role, %instance_id, pending = snapshot.pending, "scaled up"),
                        Err(e) => {
                            error!(role, error = %e, "scale up failed");
                            continue;
                        }
                    },
                    ScaleAction::Stop { role, instance_id } => {
                        if !pool.stop(instance_id) {
                            continue;
                        }
                        info!(role, %instance_id, "scaled down idle instance");
                    }
                }
                applied.push(action);
            }

            if let Some(metrics) = &self.metrics {
                let labels = [("role", role.as_str())];
                metrics.set_gauge(PENDING_TASKS, &labels, snapshot.pending as i64);
                metrics.set_gauge(INSTANCES, &labels, pool.count(role) as i64);
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalePolicy {
        ScalePolicy {
            min_instances: 1,
            max_instances: 3,
            scale_up_threshold: 3,
            idle_window: Duration::from_secs(600),
        }
    }

    fn worker(id: &str, idle_secs: Option<u64>) -> WorkerView {
        WorkerView {
            instance_id: id.to_string(),
            idle_for: idle_secs.map(Duration::from_secs),
        }
    }

    fn snapshot(pending: usize, workers: Vec<WorkerView>) -> RoleSnapshot {
        RoleSnapshot {
            role: "coder".to_string(),
            pending,
            workers,
        }
    }

    #[test]
    fn long_idle_worker_above_min_is_stopped() {
        let snap = snapshot(0, vec![worker("coder-1", Some(30)), worker("coder-2", Some(900))]);
        assert_eq!(
            plan(&policy(), &snap),
            vec![ScaleAction::Stop {
                role: "coder".into(),
                instance_id: "coder-2".into()
            }]
        );
    }

    #[test]
    fn working_workers_are_never_stopped() {
        let snap = snapshot(0, vec![worker("coder-1", None), worker("coder-2", None)]);
        assert!(plan(&policy(), &snap).is_empty());
    }
}
