use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use th_agents::agent_loop::LoopSettings;
use th_core::board::TaskBoard;
use th_core::config::Config;
use th_core::event_bus::EventBus;
use th_core::instances::InstanceManager;
use th_core::store::Store;
use th_harness::executor::{CommandExecutor, Executor};
use th_harness::routing::{ConfigRouter, Router};
use th_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use th_telemetry::metrics::MetricsCollector;
use tracing::{debug, error, info, warn};

use crate::autoscaler::{AutoScaler, ScalePolicy};
use crate::pool::WorkerPool;
use crate::reconciler::Reconciler;

/// Loop intervals, taken from config.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub reconcile: Duration,
    pub autoscale: Duration,
    /// `None` disables the periodic metrics log line.
    pub metrics_log: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconcile: Duration::from_secs(config.reconciler.interval_secs.max(1)),
            autoscale: Duration::from_secs(config.autoscaler.interval_secs.max(1)),
            metrics_log: (config.daemon.metrics_log_secs > 0)
                .then(|| Duration::from_secs(config.daemon.metrics_log_secs)),
            shutdown_grace: Duration::from_secs(config.daemon.shutdown_grace_secs),
        }
    }
}

/// The taskhive daemon.
///
/// On start it clears instance rows and requeues every `in_progress` task
/// left by a previous process, brings each role up to its minimum, then
/// runs the reconcile and autoscale loops until the [`ShutdownSignal`]
/// fires. Shutdown stops every worker and waits up to the grace period.
pub struct Daemon {
    config: Config,
    board: TaskBoard,
    instances: InstanceManager,
    router: Arc<dyn Router>,
    executors: HashMap<String, Arc<dyn Executor>>,
    metrics: Arc<MetricsCollector>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the configured store and build the daemon around it.
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.store_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Store::new(&path)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        Ok(Self::with_store(config, store))
    }

    /// Build the daemon on an already-open store. Roles with a `command`
    /// get a [`CommandExecutor`].
    pub fn with_store(config: Config, store: Store) -> Self {
        let bus = EventBus::with_capacity(config.daemon.event_history);
        let board = TaskBoard::new(store.clone(), config.role_directory(), bus);
        let instances = InstanceManager::new(store, config.reconciler.stale_after());
        let router: Arc<dyn Router> = Arc::new(ConfigRouter::new(&config.roles));

        let executors = config
            .roles
            .iter()
            .filter_map(|(name, role)| {
                CommandExecutor::from_role(role)
                    .map(|exec| (name.clone(), Arc::new(exec) as Arc<dyn Executor>))
            })
            .collect();

        let metrics = Arc::new(MetricsCollector::new());
        crate::metrics::attach(board.bus(), metrics.clone());

        Self {
            intervals: DaemonIntervals::from_config(&config),
            config,
            board,
            instances,
            router,
            executors,
            metrics,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Use `executor` for `role` instead of its configured command.
    pub fn with_executor(mut self, role: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(role.into(), executor);
        self
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run until shutdown is triggered.
    pub async fn run(&self) -> Result<()> {
        self.instances
            .purge_all()
            .await
            .context("failed to clear instance table")?;
        let reconciler = Reconciler::new(self.board.clone(), self.instances.clone());
        reconciler
            .recover_all_in_progress()
            .await
            .context("startup recovery failed")?;

        let mut pool = self.build_pool();
        let scaler = self.build_autoscaler(&pool);

        // Bring every role up to its minimum. With the autoscaler disabled
        // later ticks only replace workers that died.
        scaler
            .tick(&mut pool)
            .await
            .context("failed to start initial workers")?;

        let background = self.spawn_background_loops(reconciler);

        info!(
            workers = pool.len(),
            reconcile_secs = self.intervals.reconcile.as_secs(),
            autoscale_secs = self.intervals.autoscale.as_secs(),
            "daemon running"
        );

        let stop = self.shutdown.subscribe();
        let mut autoscale = tokio::time::interval(self.intervals.autoscale);
        autoscale.tick().await;

        loop {
            tokio::select! {
                _ = autoscale.tick() => {
                    for id in pool.reap().await {
                        debug!(instance_id = %id, "worker reaped");
                    }
                    if let Err(e) = scaler.tick(&mut pool).await {
                        error!(error = %e, "autoscale tick failed");
                    }
                }
                _ = stop.stopped() => {
                    info!("shutdown signal received, stopping workers");
                    break;
                }
            }
        }

        let unfinished = pool.shutdown(self.intervals.shutdown_grace).await;
        if unfinished > 0 {
            warn!(unfinished, "some workers were still busy at the end of the grace period");
        }
        let drained = self
            .shutdown
            .wait_for_drain(background, self.intervals.shutdown_grace)
            .await;
        if !drained.is_complete() {
            warn!(?drained, "background loops did not drain");
        }
        info!("daemon stopped");
        Ok(())
    }

    fn build_pool(&self) -> WorkerPool {
        let settings = LoopSettings::from_config(&self.config.agents);
        let mut pool = WorkerPool::new(
            self.board.clone(),
            self.instances.clone(),
            self.router.clone(),
            settings,
        );
        for (role, executor) in &self.executors {
            pool = pool.with_executor(role.clone(), executor.clone());
        }
        pool
    }

    fn build_autoscaler(&self, pool: &WorkerPool) -> AutoScaler {
        let mut scaler = AutoScaler::new(self.board.clone(), self.instances.clone())
            .with_metrics(self.metrics.clone());
        for (name, role) in &self.config.roles {
            if !pool.has_executor(name) {
                warn!(role = %name, "role has no command configured; no workers will run for it");
                continue;
            }
            let mut policy = ScalePolicy::from(role);
            if !self.config.autoscaler.enabled {
                policy.max_instances = policy.min_instances;
            }
            scaler = scaler.with_policy(name.clone(), policy);
        }
        scaler
    }

    /// Spawn the reconcile and metrics-log loops. Returns how many loops
    /// will confirm drain on shutdown.
    fn spawn_background_loops(&self, reconciler: Reconciler) -> usize {
        let mut spawned = 0;

        let stop = self.shutdown.subscribe();
        let guard = ShutdownGuard::new(self.shutdown.clone());
        let period = self.intervals.reconcile;
        tokio::spawn(async move {
            let _guard = guard;
            while stop.sleep(period).await {
                match reconciler.sweep().await {
                    Ok(report) if !report.is_clean() => info!(
                        orphans = report.orphans_reset.len(),
                        unblocked = report.unblocked.len(),
                        stale_instances = report.stale_instances.len(),
                        "reconcile sweep repaired board"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reconcile sweep failed"),
                }
            }
        });
        spawned += 1;

        if let Some(period) = self.intervals.metrics_log {
            let stop = self.shutdown.subscribe();
            let guard = ShutdownGuard::new(self.shutdown.clone());
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let _guard = guard;
                while stop.sleep(period).await {
                    info!(metrics = %metrics.export_json(), "metrics snapshot");
                }
            });
            spawned += 1;
        }

        spawned
    }
}
