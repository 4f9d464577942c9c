//! Deploy lifecycle callbacks.
//!
//! The deploy checker reports when a deploy starts, becomes active, or is
//! abandoned. Activation is what puts new work on the pending queue.

use std::sync::Arc;

use tracing::{info, warn};

use fleet_state::*;

use crate::driver::SchedulerDriver;
use crate::error::{SchedulerError, SchedulerResult};

/// Applies deploy lifecycle events to the state store.
#[derive(Clone)]
pub struct DeployTracker {
    state: StateStore,
    driver: Arc<dyn SchedulerDriver>,
}

impl DeployTracker {
    pub fn new(state: StateStore, driver: Arc<dyn SchedulerDriver>) -> Self {
        Self { state, driver }
    }

    /// Record a new deploy as in progress.
    pub fn deploy_started(&self, deploy: &Deploy) -> SchedulerResult<()> {
        if !is_valid_id(&deploy.id) {
            return Err(ValidationError::InvalidId(deploy.id.clone()).into());
        }
        if deploy.command.is_empty() {
            return Err(SchedulerError::InvalidOperation {
                request_id: deploy.request_id.clone(),
                reason: format!("deploy {} has an empty command", deploy.id),
            });
        }
        self.require_request(&deploy.request_id)?;

        self.state.start_deploy(deploy)?;
        info!(request_id = %deploy.request_id, deploy_id = %deploy.id, "deploy started");
        Ok(())
    }

    /// Make `deploy_id` the active deploy and queue NEW_DEPLOY work.
    ///
    /// Pending work for other deploys is discarded and long-running tasks
    /// of the superseded deploy are killed. ON_DEMAND requests get no work;
    /// they only run when triggered.
    pub fn deploy_activated(
        &self,
        request_id: &str,
        deploy_id: &str,
        now: u64,
    ) -> SchedulerResult<Option<PendingInsert<PendingRequest>>> {
        let request = self.require_request(request_id)?;
        let activation = self
            .state
            .activate_deploy(request_id, deploy_id, now)?
            .ok_or_else(|| SchedulerError::DeployNotFound {
                request_id: request_id.to_string(),
                deploy_id: deploy_id.to_string(),
            })?;

        if request.is_long_running() {
            for task in self.state.list_active_tasks_for_request(request_id)? {
                if task.deploy_id != deploy_id {
                    info!(task_id = %task.task_id, "killing task of superseded deploy");
                    if let Err(e) = self.driver.kill_task(&task.task_id) {
                        warn!(task_id = %task.task_id, error = %e, "kill failed");
                    }
                }
            }
        }

        info!(
            %request_id,
            %deploy_id,
            previous = ?activation.previous,
            discarded_tasks = activation.pending_tasks_removed,
            "deploy activated"
        );
        if request.is_one_off() {
            return Ok(None);
        }
        let pending = PendingRequest::new(request_id, deploy_id, now, PendingType::NewDeploy);
        Ok(Some(self.state.insert_pending_request(&pending)?))
    }

    /// Forget a failed or cancelled deploy.
    pub fn deploy_terminated(&self, request_id: &str, deploy_id: &str) -> SchedulerResult<()> {
        self.state.terminate_deploy(request_id, deploy_id)?;
        info!(%request_id, %deploy_id, "deploy terminated");
        Ok(())
    }

    fn require_request(&self, request_id: &str) -> SchedulerResult<Request> {
        self.state
            .get_request(request_id)?
            .ok_or_else(|| SchedulerError::RequestNotFound(request_id.to_string()))
    }
}
