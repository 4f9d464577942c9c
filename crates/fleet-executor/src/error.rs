//! Executor error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while driving a task through its lifecycle.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("task {0} is already running on this node")]
    AlreadyRunning(String),

    #[error("task {0} is not running on this node")]
    NotFound(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("artifact fetch failed: {0}")]
    Fetch(String),

    #[error("artifact {name} checksum mismatch: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("template rendering failed: {0}")]
    Template(String),

    #[error("log setup failed: {0}")]
    Logs(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
