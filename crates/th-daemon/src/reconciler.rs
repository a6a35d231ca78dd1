use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use th_core::board::{BoardError, TaskBoard};
use th_core::instances::{InstanceError, InstanceManager};
use th_core::types::{AgentInstance, Task};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("board: {0}")]
    Board(#[from] BoardError),
    #[error("instances: {0}")]
    Instance(#[from] InstanceError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Result of a single reconcile sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// `in_progress` tasks put back to `pending`.
    pub orphans_reset: Vec<String>,
    /// `blocked` tasks with only terminal dependencies moved to `pending`.
    pub unblocked: Vec<String>,
    /// Instances whose heartbeat is older than the staleness window.
    pub stale_instances: Vec<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReconcileReport {
    /// True when the sweep changed nothing.
    pub fn is_clean(&self) -> bool {
        self.orphans_reset.is_empty() && self.unblocked.is_empty()
    }
}

/// Repairs board state left behind by dead workers.
#[derive(Clone)]
pub struct Reconciler {
    board: TaskBoard,
    instances: InstanceManager,
}

impl Reconciler {
    pub fn new(board: TaskBoard, instances: InstanceManager) -> Self {
        Self { board, instances }
    }

    /// Run every recovery pass once.
    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        debug!("reconcile sweep starting");

        let stale_instances = self
            .instances
            .stale_instances_at(now)
            .await?
            .into_iter()
            .map(|s| {
                warn!(
                    instance_id = %s.instance.id,
                    silent_for_secs = s.silent_for.as_secs(),
                    "instance is stale"
                );
                s.instance.id
            })
            .collect();

        let report = ReconcileReport {
            orphans_reset: self.recover_orphans_at(now).await?,
            unblocked: self.recover_stuck_blocked().await?,
            stale_instances,
            timestamp: Some(now),
        };

        debug!(
            orphans = report.orphans_reset.len(),
            unblocked = report.unblocked.len(),
            "reconcile sweep completed"
        );
        Ok(report)
    }

    /// Reset `in_progress` tasks whose claimant is stale or gone.
    pub async fn recover_orphans(&self) -> Result<Vec<String>> {
        self.recover_orphans_at(Utc::now()).await
    }

    /// [`recover_orphans`](Self::recover_orphans) with liveness judged at `now`.
    pub async fn recover_orphans_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut reset = Vec::new();
        for task in self.board.list_in_progress().await? {
            let Some(reason) = self.orphan_reason(&task, now).await? else {
                continue;
            };
            if let Some(task) = self.board.reset_task(&task.id).await? {
                warn!(task_id = %task.id, reason, "orphaned task reset to pending");
                reset.push(task.id);
            }
        }
        Ok(reset)
    }

    /// Reset every `in_progress` task. Used once at startup, when no
    /// claimant from a previous process can still be alive.
    pub async fn recover_all_in_progress(&self) -> Result<Vec<String>> {
        let mut reset = Vec::new();
        for task in self.board.list_in_progress().await? {
            if let Some(task) = self.board.reset_task(&task.id).await? {
                reset.push(task.id);
            }
        }
        if !reset.is_empty() {
            info!(count = reset.len(), "requeued tasks left in progress by a previous run");
        }
        Ok(reset)
    }

    /// Move `blocked` tasks whose dependencies are all terminal to `pending`.
    pub async fn recover_stuck_blocked(&self) -> Result<Vec<String>> {
        let mut unblocked = Vec::new();
        for task in self.board.list_stuck_blocked().await? {
            if let Some(task) = self.board.unblock_task(&task.id).await? {
                warn!(task_id = %task.id, "stuck blocked task moved to pending");
                unblocked.push(task.id);
            }
        }
        Ok(unblocked)
    }

    async fn orphan_reason(&self, task: &Task, now: DateTime<Utc>) -> Result<Option<&'static str>> {
        let Some(claimant) = &task.claimed_by else {
            return Ok(Some("no claimant"));
        };
        Ok(match self.instances.get_instance(claimant).await? {
            None => Some("claimant not registered"),
            Some(instance) if self.instances.is_stale(&instance, now) => Some("claimant stale"),
            Some(instance) if abandoned(task, &instance) => Some("claimant moved on"),
            Some(_) => None,
        })
    }
}

/// The claimant changed status after claiming `task` and is no longer
/// working on it. A claim not yet reflected on the instance row (status
/// unchanged since the claim) does not count.
fn abandoned(task: &Task, instance: &AgentInstance) -> bool {
    let Some(started_at) = task.started_at else {
        return false;
    };
    instance.current_task.as_deref() != Some(task.id.as_str())
        && instance.status_changed_at > started_at
}
