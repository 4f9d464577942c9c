//! Lifecycle of one task process on this node.
//!
//! ```text
//! BUILDING ──► RUNNING ──► FINISHED
//!    │            │
//!    ├────────────┴──► KILLED
//!    └──► FAILED (sandbox, fetch, template, spawn or timeout errors)
//! ```
//!
//! Kill may arrive at any point. The process slot mutex serialises log
//! setup, spawning, signal delivery and cleanup; the killed flag is set once
//! and read without the lock. A kill that lands before the spawn is seen by
//! the check made under the lock, so the process never starts.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info, warn};

use fleet_state::TaskState;

use crate::collaborators::{ExecutorStatus, TaskCollaborators, TaskLogs};
use crate::definition::{ExecutorConfig, TaskDefinition};
use crate::error::{ExecutorError, ExecutorResult};

// ── Phases ─────────────────────────────────────────────────────

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    Building,
    Running,
    /// The process exited on its own.
    Finished {
        exit_code: Option<i32>,
        success: bool,
    },
    Killed,
    Failed {
        reason: String,
    },
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskPhase::Building | TaskPhase::Running)
    }

    /// The state reported to the scheduler for this phase.
    pub fn task_state(&self) -> TaskState {
        match self {
            TaskPhase::Building => TaskState::Starting,
            TaskPhase::Running => TaskState::Running,
            TaskPhase::Finished { success: true, .. } => TaskState::Finished,
            TaskPhase::Finished { success: false, .. } => TaskState::Failed,
            TaskPhase::Killed => TaskState::Killed,
            TaskPhase::Failed { .. } => TaskState::Failed,
        }
    }
}

// ── Task ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProcessSlot {
    pid: Option<u32>,
    exited: bool,
}

/// Supervises one task from build to cleanup.
pub struct ExecutorTask {
    definition: TaskDefinition,
    config: ExecutorConfig,
    collaborators: TaskCollaborators,
    process: Mutex<ProcessSlot>,
    killed: AtomicBool,
    cleaned_up: AtomicBool,
    kill_requested: Notify,
    phase: watch::Sender<TaskPhase>,
}

impl ExecutorTask {
    pub fn new(
        definition: TaskDefinition,
        config: ExecutorConfig,
        collaborators: TaskCollaborators,
    ) -> Self {
        let (phase, _) = watch::channel(TaskPhase::Building);
        Self {
            definition,
            config,
            collaborators,
            process: Mutex::new(ProcessSlot::default()),
            killed: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            kill_requested: Notify::new(),
            phase,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.definition.task_id
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskPhase> {
        self.phase.subscribe()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Resolves once the task has reached a terminal phase and cleaned up.
    pub async fn wait(&self) -> TaskPhase {
        let mut rx = self.phase.subscribe();
        match rx.wait_for(TaskPhase::is_terminal).await {
            Ok(phase) => phase.clone(),
            Err(_) => self.phase(),
        }
    }

    /// Drive the task to completion. Cleanup runs on every path.
    pub async fn run(&self) -> TaskPhase {
        let outcome = match self.execute().await {
            Ok(phase) => phase,
            Err(e) if self.was_killed() => {
                debug!(task_id = %self.task_id(), error = %e, "error after kill");
                TaskPhase::Killed
            }
            Err(e) => {
                warn!(task_id = %self.task_id(), error = %e, "task failed");
                TaskPhase::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.cleanup(&outcome).await;
        self.phase.send_replace(outcome.clone());
        self.report(&outcome);
        info!(task_id = %self.task_id(), state = %outcome.task_state(), "task done");
        outcome
    }

    /// Request the task stop. Only the first call has any effect; later
    /// calls return `Ok` without signalling again.
    ///
    /// Sends SIGTERM if the process is up; the supervisor escalates to
    /// SIGKILL after the grace period.
    pub async fn kill(&self) -> ExecutorResult<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            debug!(task_id = %self.task_id(), "kill already requested");
            return Ok(());
        }
        info!(task_id = %self.task_id(), "kill requested");

        let signalled = self.signal_process().await;
        self.kill_requested.notify_one();
        signalled
    }

    async fn signal_process(&self) -> ExecutorResult<()> {
        let slot = tokio::time::timeout(self.config.kill_timeout, self.process.lock())
            .await
            .map_err(|_| ExecutorError::Timeout {
                stage: "kill lock",
                after: self.config.kill_timeout,
            })?;
        match (slot.pid, slot.exited) {
            (Some(pid), false) => send_sigterm(pid),
            _ => Ok(()),
        }
    }

    /// Finalize logs and tear down the sandbox. Returns false if cleanup had
    /// already run.
    pub async fn cleanup(&self, phase: &TaskPhase) -> bool {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }

        let work = async {
            let _slot = self.process.lock().await;
            if let Err(e) = self
                .collaborators
                .logs
                .finalize(&self.definition, phase)
                .await
            {
                warn!(task_id = %self.task_id(), error = %e, "failed to finalize logs");
            }
            if let Err(e) = self.collaborators.sandbox.cleanup(&self.definition).await {
                warn!(task_id = %self.task_id(), error = %e, "failed to clean up sandbox");
            }
        };
        if tokio::time::timeout(self.config.cleanup_timeout, work)
            .await
            .is_err()
        {
            warn!(
                task_id = %self.task_id(),
                after = ?self.config.cleanup_timeout,
                "cleanup timed out"
            );
        }
        true
    }

    // ── Internals ──────────────────────────────────────────────

    async fn execute(&self) -> ExecutorResult<TaskPhase> {
        if self.was_killed() {
            return Ok(TaskPhase::Killed);
        }
        self.report(&TaskPhase::Building);

        let (sandbox, logs) =
            bounded(self.config.build_timeout, "build", self.build()).await??;

        let mut child = {
            let mut slot = self.process.lock().await;
            if self.was_killed() {
                debug!(task_id = %self.task_id(), "killed before spawn");
                return Ok(TaskPhase::Killed);
            }
            let child = self.spawn(&sandbox, &logs)?;
            slot.pid = child.id();
            child
        };
        info!(task_id = %self.task_id(), pid = ?child.id(), "process started");
        self.phase.send_replace(TaskPhase::Running);
        self.report(&TaskPhase::Running);

        self.supervise(&mut child).await
    }

    async fn build(&self) -> ExecutorResult<(std::path::PathBuf, TaskLogs)> {
        let sandbox = self.collaborators.sandbox.create(&self.definition).await?;
        let logs = {
            let _slot = self.process.lock().await;
            self.collaborators.logs.prepare(&self.definition).await?
        };

        for artifact in &self.definition.artifacts {
            if self.was_killed() {
                break;
            }
            self.collaborators.fetcher.fetch(artifact, &sandbox).await?;
        }
        if !self.was_killed() {
            self.collaborators
                .renderer
                .render(&self.definition, &sandbox)
                .await?;
        }
        Ok((sandbox, logs))
    }

    fn spawn(&self, sandbox: &Path, logs: &TaskLogs) -> ExecutorResult<Child> {
        let Some((program, args)) = self.definition.command.split_first() else {
            return Err(ExecutorError::Spawn("empty command".into()));
        };
        let stdout = open_log(&logs.stdout)?;
        let stderr = open_log(&logs.stderr)?;

        Command::new(program)
            .args(args)
            .args(&self.definition.cmd_line_args)
            .envs(self.definition.task_env())
            .current_dir(sandbox)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{program}: {e}")))
    }

    async fn supervise(&self, child: &mut Child) -> ExecutorResult<TaskPhase> {
        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = self.kill_requested.notified() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => self.stop_process(child).await?,
        };
        self.process.lock().await.exited = true;

        if self.was_killed() {
            return Ok(TaskPhase::Killed);
        }
        let exit_code = status.code();
        let success = exit_code.is_some_and(|code| self.definition.is_success_exit_code(code));
        debug!(task_id = %self.task_id(), ?exit_code, success, "process exited");
        Ok(TaskPhase::Finished { exit_code, success })
    }

    async fn stop_process(&self, child: &mut Child) -> ExecutorResult<ExitStatus> {
        if let Ok(status) = tokio::time::timeout(self.config.kill_grace_period, child.wait()).await
        {
            return Ok(status?);
        }
        warn!(
            task_id = %self.task_id(),
            grace = ?self.config.kill_grace_period,
            "process ignored SIGTERM, sending SIGKILL"
        );
        child.start_kill()?;
        Ok(bounded(self.config.kill_timeout, "wait after SIGKILL", child.wait()).await??)
    }

    fn report(&self, phase: &TaskPhase) {
        let (exit_code, message) = match phase {
            TaskPhase::Finished { exit_code, .. } => (*exit_code, None),
            TaskPhase::Failed { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        self.collaborators.reporter.report(ExecutorStatus {
            task_id: self.task_id().to_string(),
            state: phase.task_state(),
            exit_code,
            message,
        });
    }
}

async fn bounded<F: std::future::Future>(
    after: Duration,
    stage: &'static str,
    fut: F,
) -> ExecutorResult<F::Output> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ExecutorError::Timeout { stage, after })
}

fn open_log(path: &Path) -> ExecutorResult<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ExecutorError::Logs(format!("{}: {e}", path.display())))
}

fn send_sigterm(pid: u32) -> ExecutorResult<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Already gone.
        return Ok(());
    }
    Err(ExecutorError::Signal { pid, source: err })
}
