//! Seams between the task lifecycle and the node it runs on.
//!
//! The lifecycle controller only sequences these calls; how artifacts are
//! downloaded, how templates look and where logs go is up to the
//! implementation. [`TaskCollaborators::local`] wires the file-based
//! implementations from [`crate::local`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleet_state::{Artifact, TaskState};

use crate::definition::TaskDefinition;
use crate::error::ExecutorResult;
use crate::local::{DirSandbox, EnvFileRenderer, FileLogManager, LocalArtifactFetcher};
use crate::task::TaskPhase;

/// Puts an artifact into the task sandbox.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Returns the path the artifact was written to.
    async fn fetch(&self, artifact: &Artifact, sandbox: &Path) -> ExecutorResult<PathBuf>;
}

/// Renders configuration files into the sandbox before launch.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, task: &TaskDefinition, sandbox: &Path) -> ExecutorResult<()>;
}

/// Where a task's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

#[async_trait]
pub trait TaskLogManager: Send + Sync {
    async fn prepare(&self, task: &TaskDefinition) -> ExecutorResult<TaskLogs>;

    /// Record the final phase once the task is done.
    async fn finalize(&self, task: &TaskDefinition, phase: &TaskPhase) -> ExecutorResult<()>;
}

/// The task's working directory.
#[async_trait]
pub trait TaskSandbox: Send + Sync {
    async fn create(&self, task: &TaskDefinition) -> ExecutorResult<PathBuf>;

    async fn cleanup(&self, task: &TaskDefinition) -> ExecutorResult<()>;
}

/// A status change sent back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub task_id: String,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Delivers status changes. Must not block.
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: ExecutorStatus);
}

/// Everything a task needs from its node.
#[derive(Clone)]
pub struct TaskCollaborators {
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub logs: Arc<dyn TaskLogManager>,
    pub sandbox: Arc<dyn TaskSandbox>,
    pub reporter: Arc<dyn StatusReporter>,
}

impl TaskCollaborators {
    /// File-based collaborators rooted at `task_root`.
    pub fn local(task_root: &Path, reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            fetcher: Arc::new(LocalArtifactFetcher),
            renderer: Arc::new(EnvFileRenderer),
            logs: Arc::new(FileLogManager::new(task_root.join("logs"))),
            sandbox: Arc::new(DirSandbox::new(task_root.join("sandboxes"))),
            reporter,
        }
    }
}
