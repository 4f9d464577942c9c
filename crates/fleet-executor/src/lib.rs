//! fleet-executor — per-node task process lifecycle.
//!
//! Each launched task gets an [`ExecutorTask`] that builds a sandbox, fetches
//! artifacts, renders templates, spawns the process and supervises it until
//! it exits or is killed. [`ExecutorMonitor`] is the node's table of those
//! tasks.
//!
//! Node-specific work goes through the traits in [`collaborators`]; the
//! [`local`] module has file-based implementations.

pub mod collaborators;
pub mod definition;
pub mod error;
pub mod local;
pub mod monitor;
pub mod task;

pub use collaborators::{
    ArtifactFetcher, ExecutorStatus, StatusReporter, TaskCollaborators, TaskLogManager, TaskLogs,
    TaskSandbox, TemplateRenderer,
};
pub use definition::{ExecutorConfig, TaskDefinition};
pub use error::{ExecutorError, ExecutorResult};
pub use monitor::ExecutorMonitor;
pub use task::{ExecutorTask, TaskPhase};
