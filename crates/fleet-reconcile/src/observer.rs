//! The reconciler's view of the execution layer.

use fleet_state::ActiveTask;

/// What the execution layer knows about an active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLiveness {
    Alive,
    /// The execution layer has no record of the task.
    Gone,
    /// The task's host cannot be asked right now.
    Unknown,
}

/// Answers liveness questions during a reconciliation pass.
pub trait TaskObserver: Send + Sync {
    fn liveness(&self, task: &ActiveTask) -> TaskLiveness;
}

/// Observer for deployments without a liveness source.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAlive;

impl TaskObserver for AssumeAlive {
    fn liveness(&self, _task: &ActiveTask) -> TaskLiveness {
        TaskLiveness::Alive
    }
}
