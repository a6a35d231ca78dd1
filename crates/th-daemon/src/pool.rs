use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use th_agents::agent_loop::{AgentLoop, AgentLoopError, LoopSettings};
use th_core::board::TaskBoard;
use th_core::instances::InstanceManager;
use th_harness::executor::Executor;
use th_harness::routing::Router;
use th_harness::shutdown::StopToken;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no executor configured for role {0}")]
    NoExecutor(String),
    #[error("failed to start worker: {0}")]
    Start(#[from] AgentLoopError),
}

struct Worker {
    role: String,
    stop: StopToken,
    handle: JoinHandle<Result<(), AgentLoopError>>,
}

/// The running agent loops, keyed by instance id.
///
/// Stopped workers stay in the pool until their loop has exited and
/// [`reap`](Self::reap) collects them.
pub struct WorkerPool {
    board: TaskBoard,
    instances: InstanceManager,
    router: Arc<dyn Router>,
    executors: HashMap<String, Arc<dyn Executor>>,
    settings: LoopSettings,
    running: BTreeMap<String, Worker>,
    stopping: Vec<(String, Worker)>,
}

impl WorkerPool {
    pub fn new(
        board: TaskBoard,
        instances: InstanceManager,
        router: Arc<dyn Router>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            board,
            instances,
            router,
            executors: HashMap::new(),
            settings,
            running: BTreeMap::new(),
            stopping: Vec::new(),
        }
    }

    pub fn with_executor(mut self, role: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(role.into(), executor);
        self
    }

    pub fn has_executor(&self, role: &str) -> bool {
        self.executors.contains_key(role)
    }

    /// Register a new instance of `role` and start its loop.
    pub async fn spawn(&mut self, role: &str) -> Result<String, PoolError> {
        let executor = self
            .executors
            .get(role)
            .cloned()
            .ok_or_else(|| PoolError::NoExecutor(role.to_string()))?;

        let agent = AgentLoop::register(
            role,
            self.board.clone(),
            self.instances.clone(),
            executor,
            self.router.clone(),
            self.settings,
        )
        .await?;
        let instance_id = agent.instance_id().to_string();
        let stop = agent.stop_token();
        let handle = tokio::spawn(agent.run());

        info!(%instance_id, role, "worker started");
        self.running.insert(
            instance_id.clone(),
            Worker {
                role: role.to_string(),
                stop,
                handle,
            },
        );
        Ok(instance_id)
    }

    /// Ask a worker to stop after its current iteration. Returns `false`
    /// for an unknown instance.
    pub fn stop(&mut self, instance_id: &str) -> bool {
        let Some(worker) = self.running.remove(instance_id) else {
            return false;
        };
        info!(%instance_id, role = %worker.role, "stopping worker");
        worker.stop.stop();
        self.stopping.push((instance_id.to_string(), worker));
        true
    }

    /// Collect workers whose loop has exited, including ones that died
    /// without being asked to stop. Returns their instance ids.
    pub async fn reap(&mut self) -> Vec<String> {
        let mut finished = Vec::new();

        let dead: Vec<String> = self
            .running
            .iter()
            .filter(|(_, w)| w.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(worker) = self.running.remove(&id) {
                self.stopping.push((id, worker));
            }
        }

        let mut pending = Vec::new();
        for (id, worker) in self.stopping.drain(..) {
            if worker.handle.is_finished() {
                log_exit(&id, worker.handle.await);
                finished.push(id);
            } else {
                pending.push((id, worker));
            }
        }
        self.stopping = pending;
        finished
    }

    /// Running instance ids for `role`, oldest first.
    pub fn instance_ids(&self, role: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .running
            .iter()
            .filter(|(_, w)| w.role == role)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by_key(|id| instance_seq(id));
        ids
    }

    pub fn count(&self, role: &str) -> usize {
        self.running.values().filter(|w| w.role == role).count()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Stop every worker and wait up to `grace` for their loops to exit.
    /// Returns how many were still running when the grace period ran out;
    /// those are aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> usize {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        for id in ids {
            self.stop(&id);
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut unfinished = 0;
        for (id, worker) in self.stopping.drain(..) {
            let abort = worker.handle.abort_handle();
            match tokio::time::timeout_at(deadline, worker.handle).await {
                Ok(result) => log_exit(&id, result),
                Err(_) => {
                    warn!(instance_id = %id, "worker did not stop within grace period");
                    abort.abort();
                    unfinished += 1;
                }
            }
        }
        unfinished
    }
}

fn log_exit(
    instance_id: &str,
    result: std::result::Result<Result<(), AgentLoopError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => info!(%instance_id, "worker exited"),
        Ok(Err(e)) => error!(%instance_id, error = %e, "worker exited with error"),
        Err(e) if e.is_panic() => error!(%instance_id, "worker panicked"),
        Err(_) => warn!(%instance_id, "worker cancelled"),
    }
}

/// `coder-12` -> 12, so `coder-10` sorts after `coder-9`.
fn instance_seq(instance_id: &str) -> u64 {
    instance_id
        .rsplit_once('-')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(u64::MAX)
}
