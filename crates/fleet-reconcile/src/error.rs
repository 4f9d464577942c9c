//! Reconciliation error types.

use thiserror::Error;

/// Errors that abort a reconciliation pass.
///
/// A failed pass leaves the store consistent; the next pass retries.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] fleet_scheduler::SchedulerError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
