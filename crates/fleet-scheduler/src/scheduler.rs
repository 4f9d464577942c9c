//! Scheduler — turns pending requests into pending tasks, and pending tasks
//! into launches against resource offers.
//!
//! The `Scheduler` holds no in-memory queue. Every step reads the state
//! store and writes back through its atomic operations, so concurrent
//! offer rounds, status updates and reconciliation passes converge:
//! - `drain_pending_queue` expands each pending request into pending tasks
//!   (create-if-absent) and then removes the request with compare-and-delete
//! - `resource_offers` launches due pending tasks where placement allows
//! - `status_update` records task state and regenerates work after a task ends

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleet_state::*;

use crate::driver::SchedulerDriver;
use crate::error::SchedulerResult;
use crate::offers::{Offer, PlacementView};
use crate::schedule;

/// Tunables for offer rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on launches against a single offer.
    pub max_tasks_per_offer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_offer: 10,
        }
    }
}

/// What one offer round did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct OfferResult {
    pub launched: Vec<ActiveTask>,
    /// Ids of offers that launched nothing.
    pub declined: Vec<String>,
}

/// A task state change reported by the execution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub message: Option<String>,
}

/// How a status update was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// A non-terminal state was recorded.
    Updated,
    /// The task moved to history; `requeued` names the work it regenerated.
    Finished { requeued: Option<PendingType> },
    /// No active task has this id.
    Unknown,
}

/// The pending-queue scheduler.
#[derive(Clone)]
pub struct Scheduler {
    state: StateStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(state: StateStore, config: SchedulerConfig) -> Self {
        Self { state, config }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    // ── Draining ───────────────────────────────────────────────────

    /// Expand every pending request into pending tasks.
    ///
    /// Returns only the pending tasks this call wrote; a second drain with
    /// no new pending requests returns an empty list.
    pub fn drain_pending_queue(&self, now: u64) -> SchedulerResult<Vec<PendingTask>> {
        let mut pending = self.state.list_pending_requests()?;
        pending.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.table_key().cmp(&b.table_key()))
        });
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let decommissioned = self.decommissioned_hosts()?;
        let mut created = Vec::new();
        for request in &pending {
            created.extend(self.drain_one(request, &decommissioned, now)?);
        }
        if !created.is_empty() {
            info!(
                pending_requests = pending.len(),
                pending_tasks = created.len(),
                "pending queue drained"
            );
        }
        Ok(created)
    }

    fn drain_one(
        &self,
        pending: &PendingRequest,
        decommissioned: &HashSet<String>,
        now: u64,
    ) -> SchedulerResult<Vec<PendingTask>> {
        let request_id = pending.request_id.as_str();
        let Some(request) = self.state.get_request(request_id)? else {
            warn!(%request_id, "dropping pending request for unknown request");
            self.state.delete_pending_request_if(pending)?;
            return Ok(Vec::new());
        };
        if self.state.active_deploy_id(request_id)?.as_deref() != Some(pending.deploy_id.as_str()) {
            debug!(
                %request_id,
                deploy_id = %pending.deploy_id,
                "dropping pending request for inactive deploy"
            );
            self.state.delete_pending_request_if(pending)?;
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for task in self.tasks_for(&request, pending, decommissioned, now)? {
            if self.state.create_pending_task(&task)?.was_written() {
                created.push(task);
            }
        }
        self.state.delete_pending_request_if(pending)?;
        debug!(
            %request_id,
            pending_type = %pending.pending_type,
            created = created.len(),
            "pending request drained"
        );
        Ok(created)
    }

    /// The pending tasks one pending request asks for, per request type.
    fn tasks_for(
        &self,
        request: &Request,
        pending: &PendingRequest,
        decommissioned: &HashSet<String>,
        now: u64,
    ) -> SchedulerResult<Vec<PendingTask>> {
        let active = self.state.list_active_tasks_for_request(request.id())?;
        let not_before = self.not_before(request, pending.pending_type, now)?;
        let make = |instance_no: u32, next_run_at: u64| PendingTask {
            id: PendingTaskId::new(request.id(), &pending.deploy_id, instance_no),
            pending_type: pending.pending_type,
            next_run_at,
            created_from: pending.timestamp,
            user: pending.user.clone(),
            cmd_line_args: pending.cmd_line_args.clone(),
        };

        let tasks = match request.request_type() {
            RequestType::Service | RequestType::Worker => {
                let held: HashSet<u32> = active
                    .iter()
                    .filter(|t| t.deploy_id == pending.deploy_id)
                    .filter(|t| !decommissioned.contains(&t.host))
                    .map(|t| t.instance_no)
                    .collect();
                (1..=request.instances())
                    .filter(|n| !held.contains(n))
                    .map(|n| make(n, not_before))
                    .collect()
            }
            RequestType::Scheduled => {
                if let Some(running) = active.first() {
                    debug!(request_id = %request.id(), task_id = %running.task_id, "scheduled request still running");
                    return Ok(Vec::new());
                }
                let next_run_at = match pending.pending_type {
                    PendingType::Oneoff | PendingType::Immediate | PendingType::Retry => not_before,
                    _ => match schedule::next_fire(request, now) {
                        Some(fire) => fire.max(not_before),
                        None => {
                            warn!(request_id = %request.id(), "schedule has no future fire time");
                            return Ok(Vec::new());
                        }
                    },
                };
                (1..=request.instances())
                    .map(|n| make(n, next_run_at))
                    .collect()
            }
            RequestType::OnDemand => {
                if !matches!(
                    pending.pending_type,
                    PendingType::Oneoff | PendingType::Immediate | PendingType::Retry
                ) {
                    return Ok(Vec::new());
                }
                let queued = self.state.list_pending_tasks_for_request(request.id())?;
                if queued
                    .iter()
                    .any(|t| t.created_from == pending.timestamp && t.id.deploy_id == pending.deploy_id)
                {
                    return Ok(Vec::new());
                }
                let highest = active
                    .iter()
                    .map(|t| t.instance_no)
                    .chain(queued.iter().map(|t| t.id.instance_no))
                    .max()
                    .unwrap_or(0);
                vec![make(highest + 1, not_before)]
            }
            RequestType::RunOnce => {
                if active.iter().any(|t| t.deploy_id == pending.deploy_id) {
                    return Ok(Vec::new());
                }
                (1..=request.instances())
                    .map(|n| make(n, not_before))
                    .collect()
            }
        };
        Ok(tasks)
    }

    /// Earliest launch time honouring the reschedule wait after the last finish.
    fn not_before(&self, request: &Request, pending_type: PendingType, now: u64) -> SchedulerResult<u64> {
        if pending_type.is_manual() {
            return Ok(now);
        }
        let Some(wait) = request.wait_at_least_millis_after_task_finishes_for_reschedule() else {
            return Ok(now);
        };
        Ok(match self.state.last_task_history(request.id())? {
            Some(last) => now.max(last.finished_at.saturating_add(wait)),
            None => now,
        })
    }

    fn decommissioned_hosts(&self) -> SchedulerResult<HashSet<String>> {
        Ok(self
            .state
            .list_decommissions()?
            .into_iter()
            .map(|d| d.host)
            .collect())
    }

    // ── Offers ─────────────────────────────────────────────────────

    /// Match due pending tasks against a batch of offers.
    pub fn resource_offers(
        &self,
        offers: &[Offer],
        driver: &dyn SchedulerDriver,
        now: u64,
    ) -> SchedulerResult<OfferResult> {
        self.drain_pending_queue(now)?;

        let mut due: Vec<PendingTask> = self
            .state
            .list_pending_tasks()?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| b.pending_type.precedence().cmp(&a.pending_type.precedence()))
                .then_with(|| a.id.cmp(&b.id))
        });

        let decommissioned = self.decommissioned_hosts()?;
        let active = self.state.list_active_tasks()?;
        let mut view = PlacementView::new(&active, offers);
        let mut requests: HashMap<String, Option<(Request, Option<DeployId>)>> = HashMap::new();
        let mut deploys: HashMap<String, Option<Deploy>> = HashMap::new();
        let mut taken: HashSet<PendingTaskId> = HashSet::new();
        let mut result = OfferResult::default();

        for offer in offers {
            let mut remaining = offer.resources;
            let mut launched_here = 0;

            if !decommissioned.contains(&offer.host) {
                for pending in &due {
                    if launched_here >= self.config.max_tasks_per_offer {
                        break;
                    }
                    if taken.contains(&pending.id) {
                        continue;
                    }
                    let request_id = &pending.id.request_id;
                    if !requests.contains_key(request_id) {
                        let entry = match self.state.get_request(request_id)? {
                            Some(r) => Some((r, self.state.active_deploy_id(request_id)?)),
                            None => None,
                        };
                        requests.insert(request_id.clone(), entry);
                    }
                    let Some(Some((request, active_deploy))) = requests.get(request_id) else {
                        continue;
                    };
                    if active_deploy.as_deref() != Some(pending.id.deploy_id.as_str()) {
                        continue;
                    }
                    let deploy_key = deploy_key(request_id, &pending.id.deploy_id);
                    if !deploys.contains_key(&deploy_key) {
                        let deploy = self.state.get_deploy(request_id, &pending.id.deploy_id)?;
                        deploys.insert(deploy_key.clone(), deploy);
                    }
                    let Some(Some(deploy)) = deploys.get(&deploy_key) else {
                        continue;
                    };
                    if !view.allows(request, offer) || !remaining.fits(&deploy.resources) {
                        continue;
                    }

                    taken.insert(pending.id.clone());
                    let task = ActiveTask::from_pending(pending, &offer.host, &offer.rack, now);
                    let Some(consumed) = self.state.launch_task(&task)? else {
                        debug!(pending_task = %pending.id, "pending task already consumed");
                        continue;
                    };
                    if let Err(e) = driver.launch_task(offer, &task, deploy) {
                        warn!(task_id = %task.task_id, host = %offer.host, error = %e, "launch failed, reverting");
                        self.state.revert_launch(&task.task_id, &consumed)?;
                        continue;
                    }

                    remaining.subtract(&deploy.resources);
                    view.record(&task);
                    launched_here += 1;
                    info!(
                        task_id = %task.task_id,
                        host = %offer.host,
                        pending_type = %task.pending_type,
                        "task launched"
                    );
                    result.launched.push(task);
                }
            }

            if launched_here == 0 {
                if let Err(e) = driver.decline_offer(offer) {
                    warn!(offer_id = %offer.id, error = %e, "failed to decline offer");
                }
                result.declined.push(offer.id.clone());
            }
        }
        Ok(result)
    }

    // ── Status updates ─────────────────────────────────────────────

    /// Apply a task status reported by the execution layer.
    pub fn status_update(&self, update: &TaskStatusUpdate, now: u64) -> SchedulerResult<StatusOutcome> {
        let task_id = update.task_id.as_str();
        if !update.state.is_terminal() {
            return Ok(
                match self.state.update_active_task_state(task_id, update.state, now)? {
                    Some(_) => StatusOutcome::Updated,
                    None => {
                        debug!(%task_id, state = %update.state, "status for unknown task");
                        StatusOutcome::Unknown
                    }
                },
            );
        }

        let Some(history) = self
            .state
            .finish_task(task_id, update.state, update.exit_code, now)?
        else {
            debug!(%task_id, state = %update.state, "terminal status for unknown task");
            return Ok(StatusOutcome::Unknown);
        };
        info!(
            %task_id,
            state = %update.state,
            exit_code = ?update.exit_code,
            message = update.message.as_deref().unwrap_or(""),
            "task finished"
        );

        let request_id = history.task.request_id.as_str();
        let Some(request) = self.state.get_request(request_id)? else {
            return Ok(StatusOutcome::Finished { requeued: None });
        };
        let active_deploy = self.state.active_deploy_id(request_id)?;
        if active_deploy.as_deref() != Some(history.task.deploy_id.as_str()) {
            debug!(%task_id, "task belonged to a superseded deploy");
            let requeued = match active_deploy {
                Some(deploy_id) if request.is_scheduled() => {
                    self.resume_schedule(request_id, &deploy_id, now)?
                }
                _ => None,
            };
            return Ok(StatusOutcome::Finished { requeued });
        }

        let retry = update.state.is_failure()
            && self.trailing_failures(request_id)? <= request.num_retries_on_failure();
        let requeue = match request.request_type() {
            RequestType::Service | RequestType::Worker => Some(PendingType::TaskDone),
            RequestType::Scheduled if retry => Some(PendingType::Retry),
            RequestType::Scheduled => Some(PendingType::TaskDone),
            RequestType::OnDemand | RequestType::RunOnce if retry => Some(PendingType::Retry),
            RequestType::OnDemand | RequestType::RunOnce => None,
        };

        if let Some(pending_type) = requeue {
            let mut pending =
                PendingRequest::new(request_id, &history.task.deploy_id, now, pending_type);
            if pending_type == PendingType::Retry {
                pending = pending.with_cmd_line_args(history.task.cmd_line_args.clone());
            }
            self.state.insert_pending_request(&pending)?;
            debug!(%request_id, %pending_type, "work regenerated");
        }
        Ok(StatusOutcome::Finished { requeued: requeue })
    }

    /// A scheduled run of an old deploy holds back the new deploy's work
    /// while it is active; once the last such run ends the schedule resumes
    /// on the active deploy.
    fn resume_schedule(
        &self,
        request_id: &str,
        deploy_id: &str,
        now: u64,
    ) -> SchedulerResult<Option<PendingType>> {
        if !self.state.list_active_tasks_for_request(request_id)?.is_empty() {
            return Ok(None);
        }
        if !self.state.list_pending_tasks_for_request(request_id)?.is_empty() {
            return Ok(None);
        }
        let pending = PendingRequest::new(request_id, deploy_id, now, PendingType::TaskDone);
        self.state.insert_pending_request(&pending)?;
        info!(%request_id, %deploy_id, "schedule resumed on active deploy");
        Ok(Some(PendingType::TaskDone))
    }

    /// Consecutive failed or lost tasks at the end of the request's history.
    fn trailing_failures(&self, request_id: &str) -> SchedulerResult<u32> {
        Ok(self
            .state
            .list_task_history(request_id)?
            .iter()
            .rev()
            .take_while(|h| h.final_state.is_failure())
            .count() as u32)
    }

    // ── Decommissioning ────────────────────────────────────────────

    /// Start draining `host`: its tasks stop counting toward desired
    /// instances, and long-running requests with tasks there get
    /// replacement work queued. Returns the number of requests requeued.
    pub fn decommission_node(&self, host: &str, now: u64) -> SchedulerResult<usize> {
        self.state.put_decommission(&Decommission {
            host: host.to_string(),
            started_at: now,
        })?;

        let mut affected: Vec<(String, DeployId)> = self
            .state
            .list_active_tasks()?
            .into_iter()
            .filter(|t| t.host == host)
            .map(|t| (t.request_id, t.deploy_id))
            .collect();
        affected.sort();
        affected.dedup();

        let mut requeued = 0;
        for (request_id, deploy_id) in affected {
            let long_running = self
                .state
                .get_request(&request_id)?
                .is_some_and(|r| r.is_long_running());
            if !long_running {
                continue;
            }
            let pending =
                PendingRequest::new(&request_id, &deploy_id, now, PendingType::DecommissionedSlave);
            self.state.insert_pending_request(&pending)?;
            requeued += 1;
        }
        info!(%host, requeued, "host decommissioned");
        Ok(requeued)
    }

    /// Put a decommissioned host back into service.
    pub fn recommission_node(&self, host: &str) -> SchedulerResult<bool> {
        let existed = self.state.delete_decommission(host)?;
        if existed {
            info!(%host, "host recommissioned");
        }
        Ok(existed)
    }
}
