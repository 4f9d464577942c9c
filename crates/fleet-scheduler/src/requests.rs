//! Admin operations on requests.
//!
//! `RequestManager` validates requests before they reach the store, turns
//! request edits into pending-queue work, and handles manual triggers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleet_state::*;

use crate::driver::SchedulerDriver;
use crate::error::{SchedulerError, SchedulerResult};
use crate::schedule;

/// Result of saving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Updated,
    /// Structurally equal to the stored request; nothing was written.
    Unchanged,
}

/// Request registry operations.
#[derive(Clone)]
pub struct RequestManager {
    state: StateStore,
    driver: Arc<dyn SchedulerDriver>,
}

impl RequestManager {
    pub fn new(state: StateStore, driver: Arc<dyn SchedulerDriver>) -> Self {
        Self { state, driver }
    }

    /// Validate and persist a request.
    ///
    /// Scaling a long-running request down kills its highest instances.
    /// Scaling up, or changing a schedule, queues UPDATED work for the
    /// active deploy.
    pub fn save_request(&self, request: Request, now: u64) -> SchedulerResult<SaveOutcome> {
        schedule::validate_request(&request)?;
        let request_id = request.id().to_string();

        let existing = match self.state.save_request(&request)? {
            RequestSave::Created => {
                info!(%request_id, request_type = %request.request_type(), "request created");
                return Ok(SaveOutcome::Created);
            }
            RequestSave::Unchanged => return Ok(SaveOutcome::Unchanged),
            RequestSave::TypeMismatch { existing } => {
                return Err(SchedulerError::InvalidOperation {
                    request_id,
                    reason: format!(
                        "request type cannot change from {} to {}",
                        existing.request_type(),
                        request.request_type()
                    ),
                });
            }
            RequestSave::Replaced { previous } => previous,
        };

        if let Some(deploy_id) = self.state.active_deploy_id(&request_id)? {
            if request.is_long_running() && request.instances() < existing.instances() {
                self.kill_excess_instances(&request, &deploy_id)?;
            }
            let schedule_changed = existing.effective_schedule() != request.effective_schedule();
            if schedule_changed {
                self.drop_scheduled_pending_tasks(&request_id)?;
            }
            let scaled_up = request.instances() > existing.instances();
            if (scaled_up || schedule_changed) && !request.is_one_off() {
                let pending = PendingRequest::new(&request_id, &deploy_id, now, PendingType::Updated);
                self.state.insert_pending_request(&pending)?;
            }
        }
        info!(%request_id, instances = request.instances(), "request updated");
        Ok(SaveOutcome::Updated)
    }

    fn kill_excess_instances(&self, request: &Request, deploy_id: &str) -> SchedulerResult<()> {
        for task in self.state.list_active_tasks_for_request(request.id())? {
            if task.deploy_id == deploy_id && task.instance_no > request.instances() {
                info!(task_id = %task.task_id, "killing instance above new scale");
                if let Err(e) = self.driver.kill_task(&task.task_id) {
                    warn!(task_id = %task.task_id, error = %e, "kill failed");
                }
            }
        }
        let instances = request.instances();
        self.state
            .remove_pending_tasks(request.id(), |pending| pending.id.instance_no > instances)?;
        Ok(())
    }

    /// Pending tasks waiting on the old schedule are recomputed from UPDATED work.
    fn drop_scheduled_pending_tasks(&self, request_id: &str) -> SchedulerResult<()> {
        let dropped = self.state.remove_pending_tasks(request_id, |pending| {
            !pending.pending_type.is_manual() && pending.pending_type != PendingType::Retry
        })?;
        if dropped > 0 {
            debug!(%request_id, dropped, "dropped pending tasks on the old schedule");
        }
        Ok(())
    }

    /// Delete a request and everything derived from it, killing its tasks.
    pub fn delete_request(&self, request_id: &str) -> SchedulerResult<RequestDeletion> {
        let deletion = self
            .state
            .delete_request(request_id)?
            .ok_or_else(|| SchedulerError::RequestNotFound(request_id.to_string()))?;
        for task in &deletion.active_tasks {
            if let Err(e) = self.driver.kill_task(&task.task_id) {
                warn!(task_id = %task.task_id, error = %e, "kill failed");
            }
        }
        info!(
            %request_id,
            killed = deletion.active_tasks.len(),
            "request deleted"
        );
        Ok(deletion)
    }

    /// Run a request now, outside its normal cadence.
    ///
    /// ON_DEMAND requests get ONEOFF work; SCHEDULED and RUN_ONCE requests
    /// get IMMEDIATE work. A SCHEDULED request with a running task is
    /// rejected, and always-running types cannot be triggered at all.
    pub fn schedule_immediately(
        &self,
        request_id: &str,
        user: Option<String>,
        cmd_line_args: Vec<String>,
        now: u64,
    ) -> SchedulerResult<PendingInsert<PendingRequest>> {
        let request = self
            .state
            .get_request(request_id)?
            .ok_or_else(|| SchedulerError::RequestNotFound(request_id.to_string()))?;

        let pending_type = match request.request_type() {
            RequestType::OnDemand => PendingType::Oneoff,
            RequestType::RunOnce => PendingType::Immediate,
            RequestType::Scheduled => {
                if let Some(task) = self.state.list_active_tasks_for_request(request_id)?.first() {
                    return Err(SchedulerError::AlreadyRunning {
                        request_id: request_id.to_string(),
                        task_id: task.task_id.clone(),
                    });
                }
                PendingType::Immediate
            }
            RequestType::Service | RequestType::Worker => {
                return Err(SchedulerError::InvalidOperation {
                    request_id: request_id.to_string(),
                    reason: format!(
                        "{} requests are always running and cannot be triggered",
                        request.request_type()
                    ),
                });
            }
        };

        let deploy_id = self
            .state
            .active_deploy_id(request_id)?
            .ok_or_else(|| SchedulerError::NoActiveDeploy(request_id.to_string()))?;
        let pending = PendingRequest::new(request_id, deploy_id, now, pending_type)
            .with_user(user)
            .with_cmd_line_args(cmd_line_args);
        let outcome = self.state.insert_pending_request(&pending)?;
        info!(%request_id, %pending_type, written = outcome.was_written(), "manual run queued");
        Ok(outcome)
    }

    // ── Listings ───────────────────────────────────────────────────

    pub fn get_request(&self, request_id: &str) -> SchedulerResult<Request> {
        self.state
            .get_request(request_id)?
            .ok_or_else(|| SchedulerError::RequestNotFound(request_id.to_string()))
    }

    pub fn list_requests(&self) -> SchedulerResult<Vec<Request>> {
        Ok(self.state.list_requests()?)
    }

    pub fn list_pending_requests(&self) -> SchedulerResult<Vec<PendingRequest>> {
        Ok(self.state.list_pending_requests()?)
    }

    pub fn list_pending_tasks(&self) -> SchedulerResult<Vec<PendingTask>> {
        Ok(self.state.list_pending_tasks()?)
    }

    pub fn list_active_tasks(&self) -> SchedulerResult<Vec<ActiveTask>> {
        Ok(self.state.list_active_tasks()?)
    }
}
