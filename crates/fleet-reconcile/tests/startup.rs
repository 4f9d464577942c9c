//! End-to-end startup reconciliation scenarios across the scheduler and the
//! reconciler, run against a real on-disk store.

use std::sync::Arc;

use fleet_reconcile::{AssumeAlive, Reconciler};
use fleet_scheduler::{
    DeployTracker, Offer, RecordingDriver, RequestManager, Scheduler, SchedulerConfig,
    SchedulerError, StatusOutcome, TaskStatusUpdate,
};
use fleet_state::*;

const NOW: u64 = 1_700_000_000_000;

struct Fixture {
    _dir: tempfile::TempDir,
    state: StateStore,
    driver: Arc<RecordingDriver>,
    scheduler: Scheduler,
    requests: RequestManager,
    deploys: DeployTracker,
    reconciler: Reconciler,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::open(&dir.path().join("fleet.redb")).unwrap();
        let driver = Arc::new(RecordingDriver::new());
        Self {
            scheduler: Scheduler::new(state.clone(), SchedulerConfig::default()),
            requests: RequestManager::new(state.clone(), driver.clone()),
            deploys: DeployTracker::new(state.clone(), driver.clone()),
            reconciler: Reconciler::new(state.clone(), Arc::new(AssumeAlive), driver.clone()),
            driver,
            state,
            _dir: dir,
        }
    }

    fn deploy(&self, request: Request) {
        let request_id = request.id().to_string();
        self.requests.save_request(request, NOW).unwrap();
        self.activate(&request_id, "d1", NOW);
    }

    fn activate(&self, request_id: &str, deploy_id: &str, at: u64) {
        self.deploys
            .deploy_started(&Deploy {
                request_id: request_id.into(),
                id: deploy_id.into(),
                command: vec!["/bin/true".into()],
                env: Default::default(),
                resources: Resources::new(1.0, 64.0),
                successful_exit_codes: Vec::new(),
                artifacts: Vec::new(),
                created_at: at,
            })
            .unwrap();
        self.deploys.deploy_activated(request_id, deploy_id, at).unwrap();
    }

    fn finish(&self, task_id: &str, at: u64) -> StatusOutcome {
        let update = TaskStatusUpdate {
            task_id: task_id.into(),
            state: TaskState::Finished,
            exit_code: Some(0),
            message: None,
        };
        self.scheduler.status_update(&update, at).unwrap()
    }

    fn offer(&self, at: u64) {
        let offer = Offer {
            id: format!("offer-{at}"),
            host: "host-1".into(),
            rack: "rack-1".into(),
            resources: Resources::new(8.0, 8192.0),
        };
        self.scheduler
            .resource_offers(&[offer], self.driver.as_ref(), at)
            .unwrap();
    }

    fn reconcile(&self, at: u64) -> fleet_reconcile::ReconcileReport {
        self.reconciler
            .check_scheduler_for_inconsistent_state(at)
            .unwrap()
    }

    fn active(&self) -> Vec<ActiveTask> {
        self.state.list_active_tasks().unwrap()
    }

    fn pending_tasks(&self) -> Vec<PendingTask> {
        self.state.list_pending_tasks().unwrap()
    }
}

fn scheduled_request() -> Request {
    Request::builder("nightly").schedule("0 3 * * *").build()
}

#[test]
fn service_survives_restart_and_recovers_lost_instance() {
    let fx = Fixture::new();
    fx.deploy(Request::builder("web").build());
    fx.offer(NOW);
    assert_eq!(fx.active().len(), 1);

    fx.reconcile(NOW + 1);
    fx.offer(NOW + 1);
    assert_eq!(fx.active().len(), 1);

    // The task disappears from the store without any queued work.
    let task = fx.active().remove(0);
    fx.state.delete_active_task(&task.task_id).unwrap();
    fx.offer(NOW + 2);
    assert!(fx.active().is_empty());

    let report = fx.reconcile(NOW + 3);
    assert_eq!(report.pending_requests_added, vec!["web".to_string()]);
    fx.offer(NOW + 3);
    assert_eq!(fx.active().len(), 1);
}

#[test]
fn scheduled_request_keeps_exactly_one_pending_task() {
    let fx = Fixture::new();
    fx.deploy(scheduled_request());

    let pending = fx.state.list_pending_requests().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].pending_type, PendingType::NewDeploy);

    let report = fx.reconcile(NOW);
    assert!(report.pending_requests_added.is_empty());
    assert_eq!(fx.state.list_pending_requests().unwrap().len(), 1);

    fx.scheduler.drain_pending_queue(NOW).unwrap();
    let tasks = fx.pending_tasks();
    assert_eq!(tasks.len(), 1);

    assert!(fx.reconcile(NOW + 1).is_consistent());
    assert!(fx.scheduler.drain_pending_queue(NOW + 1).unwrap().is_empty());
    assert!(fx.active().is_empty());
    assert_eq!(fx.pending_tasks(), tasks);

    fx.state.delete_pending_task(&tasks[0].id).unwrap();
    let report = fx.reconcile(NOW + 2);
    assert_eq!(report.pending_requests_added, vec!["nightly".to_string()]);
    assert_eq!(fx.state.list_pending_requests().unwrap().len(), 1);
}

#[test]
fn running_scheduled_request_rejects_manual_trigger() {
    let fx = Fixture::new();
    fx.deploy(scheduled_request());
    fx.scheduler.drain_pending_queue(NOW).unwrap();
    let next_run_at = fx.pending_tasks()[0].next_run_at;
    fx.offer(next_run_at);
    assert_eq!(fx.active().len(), 1);

    let err = fx
        .requests
        .schedule_immediately("nightly", None, Vec::new(), next_run_at + 1)
        .unwrap_err();

    assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
    assert!(fx.state.list_pending_requests().unwrap().is_empty());
    assert!(fx.reconcile(next_run_at + 2).is_consistent());
}

#[test]
fn on_demand_oneoff_survives_reconciliation() {
    let fx = Fixture::new();
    fx.deploy(Request::builder("adhoc").daemon(false).build());
    assert!(fx.state.list_pending_requests().unwrap().is_empty());

    fx.requests
        .schedule_immediately("adhoc", Some("ops".into()), vec!["--all".into()], NOW)
        .unwrap();
    let before = fx.state.list_pending_requests().unwrap();

    assert!(fx.reconcile(NOW + 1).is_consistent());
    assert_eq!(fx.state.list_pending_requests().unwrap(), before);

    fx.offer(NOW + 2);
    let active = fx.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].cmd_line_args, vec!["--all".to_string()]);
}

#[test]
fn reconciliation_is_idempotent() {
    let fx = Fixture::new();
    fx.deploy(Request::builder("web").instances(2).build());
    fx.deploy(scheduled_request());
    fx.deploy(Request::builder("adhoc").daemon(false).build());
    fx.offer(NOW);
    fx.state
        .delete_active_task(&fx.active()[0].task_id)
        .unwrap();

    let first = fx.reconcile(NOW + 1);
    let pending_after_first = fx.state.list_pending_requests().unwrap();
    let second = fx.reconcile(NOW + 2);

    assert!(!first.is_consistent());
    assert!(second.is_consistent());
    assert_eq!(fx.state.list_pending_requests().unwrap(), pending_after_first);
}

#[test]
fn scheduled_redeploy_mid_run_keeps_schedule() {
    let fx = Fixture::new();
    fx.deploy(scheduled_request());
    fx.scheduler.drain_pending_queue(NOW).unwrap();
    let next_run_at = fx.pending_tasks()[0].next_run_at;
    fx.offer(next_run_at);
    let old = fx.active().remove(0);
    assert_eq!(old.deploy_id, "d1");

    fx.activate("nightly", "d2", next_run_at + 1);
    // The d1 run holds the request; the new deploy waits for it.
    assert!(fx.scheduler.drain_pending_queue(next_run_at + 2).unwrap().is_empty());

    assert_eq!(
        fx.finish(&old.task_id, next_run_at + 3),
        StatusOutcome::Finished {
            requeued: Some(PendingType::TaskDone)
        }
    );
    let pending = fx.state.list_pending_requests().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].deploy_id, "d2");

    fx.scheduler.drain_pending_queue(next_run_at + 4).unwrap();
    let tasks = fx.pending_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id.deploy_id, "d2");
    assert!(tasks[0].next_run_at > next_run_at);
    assert!(fx.reconcile(next_run_at + 5).is_consistent());
}

#[test]
fn killing_overdue_tasks_is_idempotent() {
    let fx = Fixture::new();
    fx.deploy(
        Request::builder("adhoc")
            .daemon(false)
            .kill_old_non_long_running_tasks_after_millis(1_000)
            .build(),
    );
    fx.requests
        .schedule_immediately("adhoc", None, Vec::new(), NOW)
        .unwrap();
    fx.offer(NOW + 1);
    let old = fx.active().remove(0);

    fx.activate("adhoc", "d2", NOW + 10);
    assert!(fx.driver.killed().is_empty());

    let first = fx.reconcile(NOW + 5_000);
    assert_eq!(first.overdue_tasks_killed, vec![old.task_id.clone()]);

    let second = fx.reconcile(NOW + 5_001);
    assert!(second.is_consistent());
    assert_eq!(fx.driver.killed(), vec![old.task_id]);
}
