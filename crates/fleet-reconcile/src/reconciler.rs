//! Reconciler — audits the state store and repairs drift.
//!
//! Each pass loads the full desired and actual state, then applies the
//! repair rules in a fixed order: orphaned pending work, vanished tasks,
//! missing work per request type, superseded-deploy kills, and overdue
//! scheduled runs. Every repair goes through the store's atomic operations,
//! so a pass racing with offer rounds or status updates converges instead
//! of double-counting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_scheduler::{SchedulerDriver, schedule};
use fleet_state::*;

use crate::error::ReconcileResult;
use crate::observer::{TaskLiveness, TaskObserver};

/// What one reconciliation pass found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active tasks the execution layer no longer knows, now LOST in history.
    pub stale_tasks_removed: Vec<TaskId>,
    /// Requests that received STARTUP work.
    pub pending_requests_added: Vec<String>,
    pub orphaned_pending_requests_removed: usize,
    pub orphaned_pending_tasks_removed: usize,
    /// Tasks of superseded deploys that were sent a kill.
    pub overdue_tasks_killed: Vec<TaskId>,
    /// Scheduled tasks running past their expected runtime. Reported only.
    pub overdue_scheduled_tasks: Vec<TaskId>,
}

impl ReconcileReport {
    /// Whether the pass made no repairs.
    pub fn is_consistent(&self) -> bool {
        self.stale_tasks_removed.is_empty()
            && self.pending_requests_added.is_empty()
            && self.orphaned_pending_requests_removed == 0
            && self.orphaned_pending_tasks_removed == 0
            && self.overdue_tasks_killed.is_empty()
    }
}

/// Snapshot of the store taken at the start of a pass.
struct Snapshot {
    requests: Vec<Request>,
    deploy_states: HashMap<String, RequestDeployState>,
    pending_requests: Vec<PendingRequest>,
    pending_tasks: Vec<PendingTask>,
    active: Vec<ActiveTask>,
    decommissioned: HashSet<String>,
}

/// The reconciliation engine.
#[derive(Clone)]
pub struct Reconciler {
    state: StateStore,
    observer: Arc<dyn TaskObserver>,
    driver: Arc<dyn SchedulerDriver>,
}

impl Reconciler {
    pub fn new(
        state: StateStore,
        observer: Arc<dyn TaskObserver>,
        driver: Arc<dyn SchedulerDriver>,
    ) -> Self {
        Self {
            state,
            observer,
            driver,
        }
    }

    /// Run one reconciliation pass.
    pub fn check_scheduler_for_inconsistent_state(&self, now: u64) -> ReconcileResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut snapshot = self.snapshot()?;

        self.remove_orphans(&mut snapshot, &mut report)?;
        self.remove_stale_tasks(&mut snapshot, &mut report, now)?;
        for request in &snapshot.requests {
            let Some(deploy_state) = snapshot.deploy_states.get(request.id()) else {
                continue;
            };
            if self.needs_startup_work(request, deploy_state, &snapshot, now)? {
                if let Some(deploy_id) = &deploy_state.active_deploy_id {
                    let pending = PendingRequest::new(request.id(), deploy_id, now, PendingType::Startup);
                    if self.state.insert_pending_request(&pending)?.was_written() {
                        info!(request_id = %request.id(), %deploy_id, "queued startup work for request with no active or pending tasks");
                        report.pending_requests_added.push(request.id().to_string());
                    }
                }
            }
        }
        self.kill_overdue_tasks(&snapshot, &mut report, now)?;
        self.report_overdue_scheduled(&snapshot, &mut report, now);

        if report.is_consistent() {
            debug!("state consistent");
        } else {
            info!(
                stale = report.stale_tasks_removed.len(),
                added = report.pending_requests_added.len(),
                orphaned_requests = report.orphaned_pending_requests_removed,
                orphaned_tasks = report.orphaned_pending_tasks_removed,
                killed = report.overdue_tasks_killed.len(),
                "inconsistent state repaired"
            );
        }
        Ok(report)
    }

    fn snapshot(&self) -> ReconcileResult<Snapshot> {
        let requests = self.state.list_requests()?;
        let mut deploy_states = HashMap::new();
        for request in &requests {
            if let Some(deploy_state) = self.state.get_deploy_state(request.id())? {
                deploy_states.insert(request.id().to_string(), deploy_state);
            }
        }
        Ok(Snapshot {
            requests,
            deploy_states,
            pending_requests: self.state.list_pending_requests()?,
            pending_tasks: self.state.list_pending_tasks()?,
            active: self.state.list_active_tasks()?,
            decommissioned: self
                .state
                .list_decommissions()?
                .into_iter()
                .map(|d| d.host)
                .collect(),
        })
    }

    /// Pending work is orphaned when its request is gone or its deploy is
    /// no longer the active one.
    fn remove_orphans(&self, snapshot: &mut Snapshot, report: &mut ReconcileReport) -> ReconcileResult<()> {
        let deploy_states = &snapshot.deploy_states;
        let is_live = |request_id: &str, deploy_id: &str| {
            deploy_states
                .get(request_id)
                .is_some_and(|s| s.is_active(deploy_id))
        };

        let mut kept = Vec::new();
        for pending in std::mem::take(&mut snapshot.pending_requests) {
            if is_live(&pending.request_id, &pending.deploy_id) {
                kept.push(pending);
            } else if self.state.delete_pending_request_if(&pending)? {
                info!(request_id = %pending.request_id, deploy_id = %pending.deploy_id, "removed orphaned pending request");
                report.orphaned_pending_requests_removed += 1;
            }
        }
        snapshot.pending_requests = kept;

        let mut kept = Vec::new();
        for task in std::mem::take(&mut snapshot.pending_tasks) {
            if is_live(&task.id.request_id, &task.id.deploy_id) {
                kept.push(task);
            } else if self.state.delete_pending_task(&task.id)? {
                info!(pending_task = %task.id, "removed orphaned pending task");
                report.orphaned_pending_tasks_removed += 1;
            }
        }
        snapshot.pending_tasks = kept;
        Ok(())
    }

    fn remove_stale_tasks(
        &self,
        snapshot: &mut Snapshot,
        report: &mut ReconcileReport,
        now: u64,
    ) -> ReconcileResult<()> {
        let mut alive = Vec::new();
        for task in std::mem::take(&mut snapshot.active) {
            match self.observer.liveness(&task) {
                TaskLiveness::Gone => {
                    if self
                        .state
                        .finish_task(&task.task_id, TaskState::Lost, None, now)?
                        .is_some()
                    {
                        info!(task_id = %task.task_id, host = %task.host, "active task vanished, marked lost");
                        report.stale_tasks_removed.push(task.task_id);
                    }
                }
                TaskLiveness::Alive | TaskLiveness::Unknown => alive.push(task),
            }
        }
        snapshot.active = alive;
        Ok(())
    }

    /// Whether `request` should have work but has none active or pending.
    fn needs_startup_work(
        &self,
        request: &Request,
        deploy_state: &RequestDeployState,
        snapshot: &Snapshot,
        now: u64,
    ) -> ReconcileResult<bool> {
        let Some(deploy_id) = deploy_state.active_deploy_id.as_deref() else {
            return Ok(false);
        };
        let request_id = request.id();
        let has_pending_request = snapshot
            .pending_requests
            .iter()
            .any(|p| p.request_id == request_id && p.deploy_id == deploy_id);
        if has_pending_request {
            return Ok(false);
        }
        let pending_tasks = snapshot
            .pending_tasks
            .iter()
            .filter(|t| t.id.request_id == request_id)
            .count();
        let active: Vec<&ActiveTask> = snapshot
            .active
            .iter()
            .filter(|t| t.request_id == request_id)
            .collect();

        Ok(match request.request_type() {
            RequestType::Service | RequestType::Worker => {
                let counted = active
                    .iter()
                    .filter(|t| t.deploy_id == deploy_id)
                    .filter(|t| !snapshot.decommissioned.contains(&t.host))
                    .count();
                !deploy_state.has_deploy_in_progress()
                    && ((counted + pending_tasks) as u32) < request.instances()
            }
            RequestType::Scheduled => {
                active.is_empty()
                    && pending_tasks == 0
                    && schedule::next_fire(request, now).is_some()
            }
            RequestType::OnDemand => false,
            RequestType::RunOnce => {
                active.is_empty()
                    && pending_tasks == 0
                    && !self
                        .state
                        .list_task_history(request_id)?
                        .iter()
                        .any(|h| h.task.deploy_id == deploy_id)
            }
        })
    }

    /// Kill non-long-running tasks of superseded deploys past their limit.
    /// Each task is sent one kill; later passes skip it while it winds down.
    fn kill_overdue_tasks(
        &self,
        snapshot: &Snapshot,
        report: &mut ReconcileReport,
        now: u64,
    ) -> ReconcileResult<()> {
        let requests: HashMap<&str, &Request> =
            snapshot.requests.iter().map(|r| (r.id(), r)).collect();
        for task in &snapshot.active {
            let Some(request) = requests.get(task.request_id.as_str()) else {
                continue;
            };
            let Some(limit) = request.kill_old_non_long_running_tasks_after_millis() else {
                continue;
            };
            if request.is_long_running() {
                continue;
            }
            let Some(deploy_state) = snapshot.deploy_states.get(request.id()) else {
                continue;
            };
            if deploy_state.is_active(&task.deploy_id) {
                continue;
            }
            let Some(activated_at) = deploy_state.activated_at else {
                continue;
            };
            if now < activated_at.saturating_add(limit) {
                continue;
            }
            if !self.state.request_kill(&task.task_id, now)? {
                debug!(task_id = %task.task_id, "kill already sent");
                continue;
            }
            match self.driver.kill_task(&task.task_id) {
                Ok(()) => {
                    info!(task_id = %task.task_id, deploy_id = %task.deploy_id, "killed task of superseded deploy");
                    report.overdue_tasks_killed.push(task.task_id.clone());
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "kill failed");
                    self.state.cancel_kill_request(&task.task_id)?;
                }
            }
        }
        Ok(())
    }

    fn report_overdue_scheduled(&self, snapshot: &Snapshot, report: &mut ReconcileReport, now: u64) {
        let requests: HashMap<&str, &Request> =
            snapshot.requests.iter().map(|r| (r.id(), r)).collect();
        for task in &snapshot.active {
            let Some(request) = requests.get(task.request_id.as_str()) else {
                continue;
            };
            let Some(expected) = request.scheduled_expected_runtime_millis() else {
                continue;
            };
            if !request.is_scheduled() {
                continue;
            }
            let running_for = now.saturating_sub(task.launched_at);
            if running_for > expected {
                warn!(
                    task_id = %task.task_id,
                    running_for_ms = running_for,
                    expected_ms = expected,
                    "scheduled task is overdue"
                );
                report.overdue_scheduled_tasks.push(task.task_id.clone());
            }
        }
    }

    /// Run one pass and log the outcome. Store errors are logged and the
    /// pass is abandoned until the next call.
    pub fn run_pass(&self) -> Option<ReconcileReport> {
        match self.check_scheduler_for_inconsistent_state(epoch_millis()) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "reconciliation pass failed");
                None
            }
        }
    }

    /// Reconcile immediately, then every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(?interval, "reconcile loop starting");
        loop {
            self.run_pass();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("reconcile loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::AssumeAlive;
    use fleet_scheduler::RecordingDriver;

    const NOW: u64 = 1_700_000_000_000;

    struct AllGone;

    impl TaskObserver for AllGone {
        fn liveness(&self, _task: &ActiveTask) -> TaskLiveness {
            TaskLiveness::Gone
        }
    }

    fn reconciler(state: &StateStore, observer: Arc<dyn TaskObserver>) -> (Reconciler, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::new());
        (Reconciler::new(state.clone(), observer, driver.clone()), driver)
    }

    fn deployed(state: &StateStore, request: Request, deploy_id: &str, activated_at: u64) {
        state.put_request(&request).unwrap();
        let mut deploy_state = RequestDeployState::new(request.id());
        deploy_state.active_deploy_id = Some(deploy_id.into());
        deploy_state.activated_at = Some(activated_at);
        state.put_deploy_state(&deploy_state).unwrap();
    }

    fn running(state: &StateStore, request_id: &str, deploy_id: &str, launched_at: u64) -> ActiveTask {
        let pending = PendingTask {
            id: PendingTaskId::new(request_id, deploy_id, 1),
            pending_type: PendingType::NewDeploy,
            next_run_at: 0,
            created_from: 0,
            user: None,
            cmd_line_args: Vec::new(),
        };
        state.create_pending_task(&pending).unwrap();
        let task = ActiveTask::from_pending(&pending, "host-1", "rack-1", launched_at);
        state.launch_task(&task).unwrap();
        task
    }

    #[test]
    fn empty_store_is_consistent() {
        let state = StateStore::open_in_memory().unwrap();
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));

        assert!(reconciler.check_scheduler_for_inconsistent_state(NOW).unwrap().is_consistent());
    }

    #[test]
    fn orphaned_pending_work_is_removed() {
        let state = StateStore::open_in_memory().unwrap();
        deployed(&state, Request::builder("web").build(), "d2", NOW);
        state
            .insert_pending_request(&PendingRequest::new("web", "d1", NOW, PendingType::Updated))
            .unwrap();
        state
            .insert_pending_request(&PendingRequest::new("gone", "d1", NOW, PendingType::Oneoff))
            .unwrap();
        state
            .create_pending_task(&PendingTask {
                id: PendingTaskId::new("web", "d1", 1),
                pending_type: PendingType::Updated,
                next_run_at: NOW,
                created_from: NOW,
                user: None,
                cmd_line_args: Vec::new(),
            })
            .unwrap();
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));

        let report = reconciler.check_scheduler_for_inconsistent_state(NOW).unwrap();

        assert_eq!(report.orphaned_pending_requests_removed, 2);
        assert_eq!(report.orphaned_pending_tasks_removed, 1);
        // The service then needs fresh work on its active deploy.
        assert_eq!(report.pending_requests_added, vec!["web".to_string()]);
        let pending = state.list_pending_requests().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deploy_id, "d2");
        assert_eq!(pending[0].pending_type, PendingType::Startup);
    }

    #[test]
    fn vanished_tasks_become_lost() {
        let state = StateStore::open_in_memory().unwrap();
        deployed(&state, Request::builder("web").build(), "d1", NOW);
        let task = running(&state, "web", "d1", NOW);
        let (reconciler, _) = reconciler(&state, Arc::new(AllGone));

        let report = reconciler.check_scheduler_for_inconsistent_state(NOW + 5).unwrap();

        assert_eq!(report.stale_tasks_removed, vec![task.task_id]);
        let history = state.list_task_history("web").unwrap();
        assert_eq!(history[0].final_state, TaskState::Lost);
        assert_eq!(report.pending_requests_added, vec!["web".to_string()]);
    }

    #[test]
    fn deploy_in_progress_defers_startup_work() {
        let state = StateStore::open_in_memory().unwrap();
        deployed(&state, Request::builder("web").build(), "d1", NOW);
        let mut deploy_state = state.get_deploy_state("web").unwrap().unwrap();
        deploy_state.pending_deploy_id = Some("d2".into());
        state.put_deploy_state(&deploy_state).unwrap();
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));

        assert!(reconciler.check_scheduler_for_inconsistent_state(NOW).unwrap().is_consistent());
    }

    #[test]
    fn run_once_starts_only_if_it_never_ran() {
        let state = StateStore::open_in_memory().unwrap();
        let request = Request::builder("migrate").request_type(RequestType::RunOnce).build();
        deployed(&state, request, "d1", NOW);
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));

        let report = reconciler.check_scheduler_for_inconsistent_state(NOW).unwrap();
        assert_eq!(report.pending_requests_added, vec!["migrate".to_string()]);

        state.delete_pending_request("migrate", "d1").unwrap();
        let task = running(&state, "migrate", "d1", NOW);
        state.finish_task(&task.task_id, TaskState::Finished, Some(0), NOW + 1).unwrap();
        assert!(reconciler.check_scheduler_for_inconsistent_state(NOW + 2).unwrap().is_consistent());
    }

    #[test]
    fn superseded_tasks_are_killed_after_limit() {
        let state = StateStore::open_in_memory().unwrap();
        let request = Request::builder("job")
            .request_type(RequestType::Scheduled)
            .schedule("0 * * * *")
            .kill_old_non_long_running_tasks_after_millis(1_000)
            .build();
        deployed(&state, request, "d1", NOW);
        let old = running(&state, "job", "d1", NOW);
        deployed(
            &state,
            state.get_request("job").unwrap().unwrap(),
            "d2",
            NOW + 10,
        );
        let (reconciler, driver) = reconciler(&state, Arc::new(AssumeAlive));

        let early = reconciler.check_scheduler_for_inconsistent_state(NOW + 500).unwrap();
        assert!(early.overdue_tasks_killed.is_empty());

        let late = reconciler.check_scheduler_for_inconsistent_state(NOW + 2_000).unwrap();
        assert_eq!(late.overdue_tasks_killed, vec![old.task_id.clone()]);
        assert_eq!(driver.killed(), vec![old.task_id]);
    }

    #[test]
    fn superseded_task_is_sent_one_kill() {
        let state = StateStore::open_in_memory().unwrap();
        let request = Request::builder("job")
            .request_type(RequestType::OnDemand)
            .kill_old_non_long_running_tasks_after_millis(1_000)
            .build();
        deployed(&state, request, "d1", NOW);
        let old = running(&state, "job", "d1", NOW);
        deployed(
            &state,
            state.get_request("job").unwrap().unwrap(),
            "d2",
            NOW + 10,
        );
        let (reconciler, driver) = reconciler(&state, Arc::new(AssumeAlive));

        let first = reconciler.check_scheduler_for_inconsistent_state(NOW + 2_000).unwrap();
        assert_eq!(first.overdue_tasks_killed, vec![old.task_id.clone()]);

        // The task is still winding down; the next pass leaves it alone.
        let second = reconciler.check_scheduler_for_inconsistent_state(NOW + 3_000).unwrap();
        assert!(second.overdue_tasks_killed.is_empty());
        assert!(second.is_consistent());
        assert_eq!(driver.killed(), vec![old.task_id.clone()]);

        let task = state.get_active_task(&old.task_id).unwrap().unwrap();
        assert_eq!(task.kill_requested_at, Some(NOW + 2_000));
    }

    #[test]
    fn long_scheduled_runs_are_reported() {
        let state = StateStore::open_in_memory().unwrap();
        let request = Request::builder("job")
            .request_type(RequestType::Scheduled)
            .schedule("0 * * * *")
            .scheduled_expected_runtime_millis(60_000)
            .build();
        deployed(&state, request, "d1", NOW);
        let task = running(&state, "job", "d1", NOW);
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));

        let report = reconciler.check_scheduler_for_inconsistent_state(NOW + 120_000).unwrap();

        assert_eq!(report.overdue_scheduled_tasks, vec![task.task_id]);
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let state = StateStore::open_in_memory().unwrap();
        let (reconciler, _) = reconciler(&state, Arc::new(AssumeAlive));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconciler.run(Duration::from_secs(3600), rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
