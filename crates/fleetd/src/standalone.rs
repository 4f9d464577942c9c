//! Standalone mode — scheduler, reconciler and executor for a single node.
//!
//! The node offers its own capacity to the scheduler on a fixed interval.
//! Launches go straight to the local [`ExecutorMonitor`]; executor status
//! changes flow back through a channel into `Scheduler::status_update`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use fleet_executor::{
    ExecutorMonitor, ExecutorStatus, StatusReporter, TaskCollaborators, TaskDefinition,
};
use fleet_reconcile::{Reconciler, TaskLiveness, TaskObserver};
use fleet_scheduler::{Offer, Scheduler, SchedulerDriver, TaskStatusUpdate};
use fleet_state::{ActiveTask, Deploy, Resources, StateResult, StateStore, epoch_millis};

use crate::config::FleetConfig;

// ── Driver ─────────────────────────────────────────────────────

/// Hands launches and kills to the local executor.
pub struct LocalDriver {
    monitor: ExecutorMonitor,
}

impl LocalDriver {
    pub fn new(monitor: ExecutorMonitor) -> Self {
        Self { monitor }
    }
}

impl SchedulerDriver for LocalDriver {
    fn launch_task(&self, offer: &Offer, task: &ActiveTask, deploy: &Deploy) -> anyhow::Result<()> {
        self.monitor
            .launch(TaskDefinition::from_deploy(task, deploy))?;
        debug!(task_id = %task.task_id, host = %offer.host, "launched locally");
        Ok(())
    }

    fn decline_offer(&self, offer: &Offer) -> anyhow::Result<()> {
        debug!(offer_id = %offer.id, "offer declined");
        Ok(())
    }

    fn kill_task(&self, task_id: &str) -> anyhow::Result<()> {
        let Some(task) = self.monitor.get(task_id) else {
            debug!(%task_id, "kill for task not running here");
            return Ok(());
        };
        let handle = tokio::runtime::Handle::try_current()?;
        handle.spawn(async move {
            if let Err(e) = task.kill().await {
                warn!(task_id = %task.task_id(), error = %e, "kill failed");
            }
        });
        Ok(())
    }
}

// ── Status channel ─────────────────────────────────────────────

/// Queues executor status changes for the scheduler.
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ExecutorStatus>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutorStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusReporter for ChannelReporter {
    fn report(&self, status: ExecutorStatus) {
        if self.tx.send(status).is_err() {
            debug!("status channel closed, update dropped");
        }
    }
}

/// Apply status changes until every reporter is gone.
pub async fn apply_status_updates(
    scheduler: Scheduler,
    mut rx: mpsc::UnboundedReceiver<ExecutorStatus>,
) {
    while let Some(status) = rx.recv().await {
        let update = TaskStatusUpdate {
            task_id: status.task_id,
            state: status.state,
            exit_code: status.exit_code,
            message: status.message,
        };
        match scheduler.status_update(&update, epoch_millis()) {
            Ok(outcome) => {
                debug!(task_id = %update.task_id, state = %update.state, ?outcome, "status applied")
            }
            Err(e) => {
                warn!(task_id = %update.task_id, error = %e, "failed to apply status update")
            }
        }
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// Answers liveness from the local process table.
pub struct MonitorObserver {
    monitor: ExecutorMonitor,
    host: String,
}

impl MonitorObserver {
    pub fn new(monitor: ExecutorMonitor, host: impl Into<String>) -> Self {
        Self {
            monitor,
            host: host.into(),
        }
    }
}

impl TaskObserver for MonitorObserver {
    fn liveness(&self, task: &ActiveTask) -> TaskLiveness {
        if task.host != self.host {
            TaskLiveness::Unknown
        } else if self.monitor.contains(&task.task_id) {
            TaskLiveness::Alive
        } else {
            TaskLiveness::Gone
        }
    }
}

// ── Offers ─────────────────────────────────────────────────────

/// This node as an offer: its capacity minus what its active tasks use.
pub fn local_offer(
    state: &StateStore,
    config: &FleetConfig,
    round: u64,
) -> StateResult<Offer> {
    let mut available = config.node_resources();
    for task in state.list_active_tasks()? {
        if task.host != config.node.host {
            continue;
        }
        let used = state
            .get_deploy(&task.request_id, &task.deploy_id)?
            .map(|d| d.resources)
            .unwrap_or_default();
        available.subtract(&used);
    }
    Ok(Offer {
        id: format!("{}-{round}", config.node.host),
        host: config.node.host.clone(),
        rack: config.node.rack.clone(),
        resources: available,
    })
}

async fn offer_loop(
    scheduler: Scheduler,
    driver: Arc<LocalDriver>,
    config: FleetConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.offer_interval();
    debug!(?interval, "offer loop starting");
    let mut round: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!("offer loop shutting down");
                break;
            }
        }
        round += 1;

        let offer = match local_offer(scheduler.state(), &config, round) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(error = %e, "failed to build local offer");
                continue;
            }
        };
        if offer.resources == Resources::default() {
            continue;
        }
        match scheduler.resource_offers(&[offer], driver.as_ref(), epoch_millis()) {
            Ok(result) if !result.launched.is_empty() => {
                info!(round, launched = result.launched.len(), "offer round");
            }
            Ok(_) => {}
            Err(e) => warn!(round, error = %e, "offer round failed"),
        }
    }
}

// ── Entry point ────────────────────────────────────────────────

pub async fn run_standalone(config: FleetConfig) -> anyhow::Result<()> {
    info!("fleet daemon starting in standalone mode");

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let executor_config = config.executor_config();
    std::fs::create_dir_all(&executor_config.task_root)?;

    // ── Executor ───────────────────────────────────────────────
    let (reporter, status_rx) = ChannelReporter::new();
    let collaborators =
        TaskCollaborators::local(&executor_config.task_root, Arc::new(reporter));
    let monitor = ExecutorMonitor::new(executor_config, collaborators);
    let driver = Arc::new(LocalDriver::new(monitor.clone()));
    info!(host = %config.node.host, resources = ?config.node_resources(), "local executor initialized");

    // ── Scheduler + reconciler ─────────────────────────────────
    let scheduler = Scheduler::new(state.clone(), config.scheduler_config());
    let reconciler = Reconciler::new(
        state.clone(),
        Arc::new(MonitorObserver::new(monitor.clone(), config.node.host.clone())),
        driver.clone(),
    );

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────
    let status_handle = tokio::spawn(apply_status_updates(scheduler.clone(), status_rx));

    // The first pass runs before any offer is made.
    let reconcile_interval = config.reconcile_interval();
    let reconcile_handle = tokio::spawn(reconciler.run(reconcile_interval, shutdown_rx.clone()));

    let offer_handle = tokio::spawn(offer_loop(
        scheduler,
        driver.clone(),
        config.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = offer_handle.await;
    let _ = reconcile_handle.await;

    let stopped = monitor.shutdown(config.shutdown_timeout()).await;
    info!(stopped, "local tasks stopped");

    // Dropping the last reporters closes the status channel.
    drop(driver);
    drop(monitor);
    if tokio::time::timeout(Duration::from_secs(5), status_handle)
        .await
        .is_err()
    {
        warn!("status updates still pending at exit");
    }

    info!("fleet daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fleet_executor::ExecutorConfig;
    use fleet_scheduler::{DeployTracker, RequestManager, SchedulerConfig};
    use fleet_state::{Request, TaskState};

    struct Node {
        _dir: tempfile::TempDir,
        config: FleetConfig,
        state: StateStore,
        monitor: ExecutorMonitor,
        driver: Arc<LocalDriver>,
        status_rx: mpsc::UnboundedReceiver<ExecutorStatus>,
    }

    impl Node {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = FleetConfig::default();
            config.data_dir = dir.path().to_path_buf();
            config.node.host = "node-1".into();

            let state = StateStore::open_in_memory().unwrap();
            let (reporter, status_rx) = ChannelReporter::new();
            let executor_config = ExecutorConfig {
                task_root: dir.path().join("tasks"),
                kill_grace_period: Duration::from_secs(2),
                ..ExecutorConfig::default()
            };
            let collaborators =
                TaskCollaborators::local(&executor_config.task_root, Arc::new(reporter));
            let monitor = ExecutorMonitor::new(executor_config, collaborators);
            Self {
                driver: Arc::new(LocalDriver::new(monitor.clone())),
                _dir: dir,
                config,
                state,
                monitor,
                status_rx,
            }
        }

        fn deploy(&self, request: Request, command: &[&str]) {
            let request_id = request.id().to_string();
            RequestManager::new(self.state.clone(), self.driver.clone())
                .save_request(request, 1)
                .unwrap();
            let tracker = DeployTracker::new(self.state.clone(), self.driver.clone());
            tracker
                .deploy_started(&Deploy {
                    request_id: request_id.clone(),
                    id: "d1".into(),
                    command: command.iter().map(|s| s.to_string()).collect(),
                    env: BTreeMap::new(),
                    resources: Resources::new(1.0, 256.0),
                    successful_exit_codes: Vec::new(),
                    artifacts: Vec::new(),
                    created_at: 1,
                })
                .unwrap();
            tracker.deploy_activated(&request_id, "d1", 1).unwrap();
        }

        async fn next_status(&mut self) -> ExecutorStatus {
            tokio::time::timeout(Duration::from_secs(10), self.status_rx.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn offer_subtracts_local_tasks() {
        let node = Node::new();
        node.deploy(Request::builder("web").instances(2).build(), &["sleep", "30"]);
        let scheduler = Scheduler::new(node.state.clone(), SchedulerConfig::default());

        let offer = local_offer(&node.state, &node.config, 1).unwrap();
        assert_eq!(offer.resources, node.config.node_resources());

        let result = scheduler
            .resource_offers(&[offer], node.driver.as_ref(), epoch_millis())
            .unwrap();
        assert_eq!(result.launched.len(), 2);
        assert_eq!(node.monitor.running_tasks().len(), 2);

        let offer = local_offer(&node.state, &node.config, 2).unwrap();
        assert_eq!(offer.id, "node-1-2");
        assert_eq!(offer.resources, Resources::new(2.0, 3584.0));

        node.monitor.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn finished_run_flows_back_to_scheduler() {
        let mut node = Node::new();
        node.deploy(Request::builder("once").daemon(false).build(), &["true"]);
        RequestManager::new(node.state.clone(), node.driver.clone())
            .schedule_immediately("once", None, Vec::new(), 2)
            .unwrap();
        let scheduler = Scheduler::new(node.state.clone(), SchedulerConfig::default());

        let offer = local_offer(&node.state, &node.config, 1).unwrap();
        let launched = scheduler
            .resource_offers(&[offer], node.driver.as_ref(), epoch_millis())
            .unwrap()
            .launched;
        assert_eq!(launched.len(), 1);
        let task_id = launched[0].task_id.clone();

        loop {
            let status = node.next_status().await;
            assert_eq!(status.task_id, task_id);
            let update = TaskStatusUpdate {
                task_id: status.task_id,
                state: status.state,
                exit_code: status.exit_code,
                message: status.message,
            };
            scheduler.status_update(&update, epoch_millis()).unwrap();
            if status.state.is_terminal() {
                assert_eq!(status.state, TaskState::Finished);
                break;
            }
        }

        assert!(node.state.get_active_task(&task_id).unwrap().is_none());
        let history = node.state.last_task_history("once").unwrap().unwrap();
        assert_eq!(history.final_state, TaskState::Finished);
    }

    #[tokio::test]
    async fn observer_reports_local_liveness() {
        let node = Node::new();
        node.deploy(Request::builder("web").build(), &["sleep", "30"]);
        let scheduler = Scheduler::new(node.state.clone(), SchedulerConfig::default());
        let offer = local_offer(&node.state, &node.config, 1).unwrap();
        let task = scheduler
            .resource_offers(&[offer], node.driver.as_ref(), epoch_millis())
            .unwrap()
            .launched
            .remove(0);

        let observer = MonitorObserver::new(node.monitor.clone(), "node-1");
        assert_eq!(observer.liveness(&task), TaskLiveness::Alive);

        let elsewhere = ActiveTask {
            host: "node-2".into(),
            ..task.clone()
        };
        assert_eq!(observer.liveness(&elsewhere), TaskLiveness::Unknown);

        node.driver.kill_task(&task.task_id).unwrap();
        let handle = node.monitor.get(&task.task_id).unwrap();
        handle.wait().await;
        for _ in 0..100 {
            if !node.monitor.contains(&task.task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(observer.liveness(&task), TaskLiveness::Gone);
    }
}
