//! Scheduler error types.

use thiserror::Error;

use fleet_state::ValidationError;

/// Errors that can occur during scheduling and admin operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("deploy not found: {request_id}:{deploy_id}")]
    DeployNotFound {
        request_id: String,
        deploy_id: String,
    },

    #[error("request {0} has no active deploy")]
    NoActiveDeploy(String),

    #[error("request {request_id} is already running task {task_id}")]
    AlreadyRunning { request_id: String, task_id: String },

    #[error("invalid operation on request {request_id}: {reason}")]
    InvalidOperation { request_id: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] fleet_state::StateError),

    #[error("driver error: {0}")]
    Driver(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
