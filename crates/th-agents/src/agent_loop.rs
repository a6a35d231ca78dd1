//! The per-instance control loop: poll, claim, execute, hand off.
//!
//! One [`AgentLoop`] runs per worker instance. Each iteration claims at most
//! one task for the loop's role, runs it through the [`Executor`] under a
//! timeout while heartbeating, and settles it on the board:
//!
//! - success completes the task and creates the [`Router`]'s handoffs
//! - a rejection rejects the task and creates the router's revisions
//! - a transient failure is retried with exponential backoff, then fails
//! - a timeout fails the task immediately
//!
//! Sleeps and backoffs are cut short by the loop's [`StopToken`]. A loop
//! stopped during a backoff hands its task back to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use th_core::board::{BoardError, TaskBoard};
use th_core::config::AgentsConfig;
use th_core::instances::{InstanceError, InstanceManager};
use th_core::types::{Event, EventType, NewTask, Task};
use th_harness::executor::{Executor, ExecutorError};
use th_harness::routing::{DependencyRef, Handoff, Router};
use th_harness::shutdown::StopToken;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::state_machine::{LoopEvent, LoopState, LoopStateMachine, StateMachineError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentLoopError {
    #[error("board: {0}")]
    Board(#[from] BoardError),
    #[error("instance: {0}")]
    Instance(#[from] InstanceError),
    #[error("state: {0}")]
    State(#[from] StateMachineError),
}

pub type Result<T> = std::result::Result<T, AgentLoopError>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Attempt budget and exponential backoff (`base * multiplier^n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1);
        self.base
            .saturating_mul(self.multiplier.saturating_pow(exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(5),
            multiplier: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl LoopSettings {
    pub fn from_config(cfg: &AgentsConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            heartbeat_interval: cfg.heartbeat_interval(),
            task_timeout: cfg.task_timeout(),
            retry: RetryPolicy {
                max_attempts: cfg.max_attempts,
                base: Duration::from_secs(cfg.backoff_base_secs),
                multiplier: cfg.backoff_multiplier,
            },
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&AgentsConfig::default())
    }
}

/// What a single [`AgentLoop::run_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was claimable.
    Idle,
    Completed {
        task_id: String,
        handoffs: Vec<String>,
    },
    Rejected {
        task_id: String,
        revisions: Vec<String>,
    },
    Failed {
        task_id: String,
        error: String,
    },
    TimedOut {
        task_id: String,
    },
    /// Stopped during a retry backoff; the task went back to `pending`.
    Released {
        task_id: String,
    },
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

pub struct AgentLoop {
    role: String,
    instance_id: String,
    board: TaskBoard,
    instances: InstanceManager,
    executor: Arc<dyn Executor>,
    router: Arc<dyn Router>,
    settings: LoopSettings,
    state: LoopStateMachine,
    stop: StopToken,
    last_heartbeat: Instant,
}

impl AgentLoop {
    /// Register a fresh instance of `role` and build its loop.
    pub async fn register(
        role: &str,
        board: TaskBoard,
        instances: InstanceManager,
        executor: Arc<dyn Executor>,
        router: Arc<dyn Router>,
        settings: LoopSettings,
    ) -> Result<Self> {
        let instance = instances.register_instance(role).await?;
        Ok(Self {
            role: role.to_string(),
            instance_id: instance.id,
            board,
            instances,
            executor,
            router,
            settings,
            state: LoopStateMachine::new(),
            stop: StopToken::new(),
            last_heartbeat: Instant::now(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> LoopState {
        self.state.state()
    }

    /// Handle for stopping this loop from elsewhere.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Loop until stopped, then mark the instance stopped and deregister it.
    pub async fn run(mut self) -> Result<()> {
        info!(instance_id = %self.instance_id, role = %self.role, "agent loop started");

        while !self.stop.is_stopped() {
            match self.run_once().await {
                Ok(RunOutcome::Idle) => {
                    if !self.stop.sleep(self.settings.poll_interval).await {
                        break;
                    }
                }
                Ok(outcome) => debug!(instance_id = %self.instance_id, ?outcome, "iteration done"),
                Err(e) => {
                    error!(instance_id = %self.instance_id, error = %e, "agent loop iteration failed");
                    if self.state.state() != LoopState::Error {
                        self.transition(LoopEvent::Fault, None).await?;
                    }
                    let slept = self.stop.sleep(self.settings.retry.delay(1)).await;
                    self.transition(LoopEvent::Recover, None).await?;
                    if !slept {
                        break;
                    }
                }
            }
        }

        self.transition(LoopEvent::Stop, None).await?;
        self.instances.remove_instance(&self.instance_id).await?;
        info!(instance_id = %self.instance_id, "agent loop stopped");
        Ok(())
    }

    /// Claim and process at most one task.
    pub async fn run_once(&mut self) -> Result<RunOutcome> {
        let Some(task) = self.board.claim_task(&self.role, &self.instance_id).await? else {
            self.heartbeat_if_due().await;
            return Ok(RunOutcome::Idle);
        };

        info!(instance_id = %self.instance_id, task_id = %task.id, title = %task.title, "working on task");
        self.transition(LoopEvent::Claim, Some(&task.id)).await?;

        match self.work(&task).await {
            Ok(outcome) => {
                self.transition(LoopEvent::Finish, None).await?;
                Ok(outcome)
            }
            Err(e) => {
                self.abandon(&task).await;
                self.transition(LoopEvent::Fault, None).await?;
                Err(e)
            }
        }
    }

    /// Hand a task this loop could not settle back to the queue. If even
    /// that fails, the reconciler requeues it once this instance has moved
    /// on to another status.
    async fn abandon(&self, task: &Task) {
        match self.board.release_task(&task.id, &self.instance_id).await {
            Ok(Some(_)) => warn!(instance_id = %self.instance_id, task_id = %task.id, "task released after failed iteration"),
            Ok(None) => {}
            Err(e) => error!(instance_id = %self.instance_id, task_id = %task.id, error = %e, "failed to release task"),
        }
    }

    async fn work(&self, task: &Task) -> Result<RunOutcome> {
        let retry = self.settings.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let Some(result) = self.execute_with_heartbeat(task).await else {
                let error = format!(
                    "timed out after {}s",
                    self.settings.task_timeout.as_secs_f64()
                );
                warn!(task_id = %task.id, %error, "task timed out");
                self.fail(task, error).await?;
                return Ok(RunOutcome::TimedOut {
                    task_id: task.id.clone(),
                });
            };

            match result {
                Ok(output) => return self.succeed(task, output).await,
                Err(ExecutorError::Rejected(reason)) => return self.reject(task, reason).await,
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay(attempt);
                    warn!(
                        task_id = %task.id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    if !self.backoff(Some(&task.id), delay).await {
                        self.board.release_task(&task.id, &self.instance_id).await?;
                        info!(task_id = %task.id, "stopped during backoff, task released");
                        return Ok(RunOutcome::Released {
                            task_id: task.id.clone(),
                        });
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    self.fail(task, error.clone()).await?;
                    return Ok(RunOutcome::Failed {
                        task_id: task.id.clone(),
                        error,
                    });
                }
            }
        }
    }

    /// Run the executor under the task timeout, heartbeating meanwhile.
    /// `None` means the timeout expired.
    async fn execute_with_heartbeat(
        &self,
        task: &Task,
    ) -> Option<std::result::Result<String, ExecutorError>> {
        let execution = tokio::time::timeout(self.settings.task_timeout, self.executor.execute(task));
        tokio::pin!(execution);

        let mut beat = tokio::time::interval(self.settings.heartbeat_interval);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;

        loop {
            tokio::select! {
                result = &mut execution => return result.ok(),
                _ = beat.tick() => self.heartbeat(Some(&task.id)).await,
            }
        }
    }

    /// Sleep `delay` unless stopped, heartbeating every
    /// `heartbeat_interval` so a long backoff does not look like a dead
    /// claimant. Returns `false` if stopped.
    async fn backoff(&self, task_id: Option<&str>, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        let step = self.settings.heartbeat_interval.max(Duration::from_millis(1));
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }
            if !self.stop.sleep(remaining.min(step)).await {
                return false;
            }
            if remaining > step {
                self.heartbeat(task_id).await;
            }
        }
    }

    async fn succeed(&self, task: &Task, output: String) -> Result<RunOutcome> {
        let (board, id) = (&self.board, task.id.as_str());
        let completed = self.retry_store(|| board.complete_task(id)).await?;
        let handoffs = self.router.route(&self.role, &completed, &output);
        let created = self.create_handoffs(&completed, handoffs).await;
        Ok(RunOutcome::Completed {
            task_id: completed.id,
            handoffs: created,
        })
    }

    async fn reject(&self, task: &Task, reason: String) -> Result<RunOutcome> {
        let (board, id) = (&self.board, task.id.as_str());
        let rejected = self
            .retry_store(|| board.reject_task(id, reason.clone()))
            .await?;
        let revisions = self.router.on_rejected(&self.role, &rejected, &reason);
        let created = self.create_handoffs(&rejected, revisions).await;
        Ok(RunOutcome::Rejected {
            task_id: rejected.id,
            revisions: created,
        })
    }

    async fn fail(&self, task: &Task, error: String) -> Result<()> {
        let (board, id) = (&self.board, task.id.as_str());
        self.retry_store(|| board.fail_task(id, Some(error.clone())))
            .await?;
        Ok(())
    }

    /// Create follow-on tasks under `parent`. A handoff that cannot be
    /// created is logged and skipped; siblings that depended on it lose
    /// that dependency.
    async fn create_handoffs(&self, parent: &Task, handoffs: Vec<Handoff>) -> Vec<String> {
        let mut created: Vec<Option<String>> = Vec::with_capacity(handoffs.len());

        for handoff in handoffs {
            let mut blocked_by = Vec::new();
            for dep in &handoff.blocked_by {
                match dep {
                    DependencyRef::Task(id) => blocked_by.push(id.clone()),
                    DependencyRef::Sibling(idx) => match created.get(*idx) {
                        Some(Some(id)) => blocked_by.push(id.clone()),
                        _ => warn!(parent = %parent.id, sibling = idx, "handoff sibling missing"),
                    },
                }
            }

            let mut new = NewTask::new(
                &parent.group_id,
                handoff.title,
                handoff.task_type,
                handoff.assigned_to,
                &self.instance_id,
            )
            .priority(handoff.priority.unwrap_or(parent.priority))
            .parent(&parent.id)
            .blocked_by(blocked_by);
            new.description = handoff.description;
            new.revision_of = handoff.revision_of;

            let board = &self.board;
            match self.retry_store(|| board.create_task(new.clone())).await {
                Ok(task) => {
                    debug!(parent = %parent.id, task_id = %task.id, "handoff created");
                    created.push(Some(task.id));
                }
                Err(e) => {
                    error!(parent = %parent.id, error = %e, "failed to create handoff");
                    created.push(None);
                }
            }
        }

        created.into_iter().flatten().collect()
    }

    /// Retry `op` on store errors with the loop's backoff policy. Domain
    /// errors are returned immediately.
    async fn retry_store<T, F, Fut>(&self, mut op: F) -> std::result::Result<T, BoardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoardError>>,
    {
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Err(BoardError::Store(e)) if attempt < retry.max_attempts => {
                    let delay = retry.delay(attempt);
                    warn!(instance_id = %self.instance_id, attempt, error = %e, "store error, retrying");
                    if !self.backoff(None, delay).await {
                        return Err(BoardError::Store(e));
                    }
                }
                other => return other,
            }
        }
    }

    async fn transition(&mut self, event: LoopEvent, current_task: Option<&str>) -> Result<()> {
        let from = self.state.state();
        let to = self.state.transition(event)?;

        if let Err(e) = self
            .instances
            .update_status(&self.instance_id, to.instance_status(), current_task)
            .await
        {
            warn!(instance_id = %self.instance_id, error = %e, "failed to record instance status");
        }
        self.last_heartbeat = Instant::now();

        let mut event = Event::new(EventType::AgentStatusChanged)
            .with_agent(&self.instance_id)
            .with_fields(json!({
                "role": self.role,
                "from": from.to_string(),
                "to": to.to_string(),
            }));
        event.task_id = current_task.map(str::to_string);
        self.publish(event).await;
        Ok(())
    }

    async fn heartbeat_if_due(&mut self) {
        if self.last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
            self.heartbeat(None).await;
            self.last_heartbeat = Instant::now();
        }
    }

    async fn heartbeat(&self, task_id: Option<&str>) {
        if let Err(e) = self.instances.heartbeat(&self.instance_id).await {
            warn!(instance_id = %self.instance_id, error = %e, "heartbeat failed");
            return;
        }
        let mut event = Event::new(EventType::AgentHeartbeat)
            .with_agent(&self.instance_id)
            .with_fields(json!({ "role": self.role, "status": self.state.state().to_string() }));
        event.task_id = task_id.map(str::to_string);
        self.publish(event).await;
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.board.store().append_event(&event).await {
            warn!(event_type = %event.event_type, error = %e, "failed to persist event");
        }
        self.board.bus().emit(event);
    }
}
