//! The command channel to the cluster resource manager.
//!
//! Every component that launches, declines or kills receives a driver
//! explicitly; there is no process-wide handle.

use std::sync::Mutex;

use fleet_state::{ActiveTask, Deploy};
use tracing::{debug, info};

use crate::offers::Offer;

/// Commands the orchestrator sends to the resource manager.
///
/// Calls are synchronous hand-offs; outcomes come back later as
/// [`TaskStatusUpdate`](crate::scheduler::TaskStatusUpdate)s.
pub trait SchedulerDriver: Send + Sync {
    /// Start `task` on the offer's host.
    fn launch_task(&self, offer: &Offer, task: &ActiveTask, deploy: &Deploy) -> anyhow::Result<()>;

    /// Return an unused offer.
    fn decline_offer(&self, offer: &Offer) -> anyhow::Result<()>;

    /// Ask the execution layer to kill a running task.
    fn kill_task(&self, task_id: &str) -> anyhow::Result<()>;
}

/// Driver for offline tooling: accepts every command and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl SchedulerDriver for NullDriver {
    fn launch_task(&self, offer: &Offer, task: &ActiveTask, _deploy: &Deploy) -> anyhow::Result<()> {
        debug!(task_id = %task.task_id, host = %offer.host, "null driver: launch ignored");
        Ok(())
    }

    fn decline_offer(&self, offer: &Offer) -> anyhow::Result<()> {
        debug!(offer_id = %offer.id, "null driver: decline ignored");
        Ok(())
    }

    fn kill_task(&self, task_id: &str) -> anyhow::Result<()> {
        debug!(%task_id, "null driver: kill ignored");
        Ok(())
    }
}

/// A command captured by [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    Launch { task_id: String, host: String },
    Decline { offer_id: String },
    Kill { task_id: String },
}

/// Driver that records commands instead of sending them.
///
/// Used for dry runs, where the daemon reports what it would have done.
#[derive(Debug, Default)]
pub struct RecordingDriver {
    commands: Mutex<Vec<DriverCommand>>,
    fail_launches: bool,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver whose launches all fail.
    pub fn failing_launches() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_launches: true,
        }
    }

    pub fn commands(&self) -> Vec<DriverCommand> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Task ids of every kill command sent so far.
    pub fn killed(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                DriverCommand::Kill { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, command: DriverCommand) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

impl SchedulerDriver for RecordingDriver {
    fn launch_task(&self, offer: &Offer, task: &ActiveTask, _deploy: &Deploy) -> anyhow::Result<()> {
        if self.fail_launches {
            anyhow::bail!("launch of {} refused", task.task_id);
        }
        self.record(DriverCommand::Launch {
            task_id: task.task_id.clone(),
            host: offer.host.clone(),
        });
        Ok(())
    }

    fn decline_offer(&self, offer: &Offer) -> anyhow::Result<()> {
        self.record(DriverCommand::Decline {
            offer_id: offer.id.clone(),
        });
        Ok(())
    }

    fn kill_task(&self, task_id: &str) -> anyhow::Result<()> {
        info!(%task_id, "kill recorded");
        self.record(DriverCommand::Kill {
            task_id: task_id.to_string(),
        });
        Ok(())
    }
}
