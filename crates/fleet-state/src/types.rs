//! Domain types for the fleet state store.
//!
//! These types represent deploys, the pending queue, active tasks and task
//! history. All types are serializable to/from JSON for storage in redb
//! tables.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a deploy (scoped to its request).
pub type DeployId = String;

/// Unique identifier for a launched task.
pub type TaskId = String;

// ── Deploy ─────────────────────────────────────────────────────────

/// Resources a task needs, or an offer provides.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub memory_mb: f64,
}

impl Resources {
    pub fn new(cpus: f64, memory_mb: f64) -> Self {
        Self { cpus, memory_mb }
    }

    /// Whether `needed` fits into these resources.
    pub fn fits(&self, needed: &Resources) -> bool {
        needed.cpus <= self.cpus && needed.memory_mb <= self.memory_mb
    }

    pub fn subtract(&mut self, used: &Resources) {
        self.cpus = (self.cpus - used.cpus).max(0.0);
        self.memory_mb = (self.memory_mb - used.memory_mb).max(0.0);
    }

    pub fn add(&mut self, other: &Resources) {
        self.cpus += other.cpus;
        self.memory_mb += other.memory_mb;
    }
}

/// An artifact fetched into the task sandbox before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name inside the sandbox.
    pub name: String,
    /// Source URI (`file://` or a plain local path).
    pub uri: String,
    /// Expected hex-encoded sha256 of the content.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// One versioned release of a request's runnable artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deploy {
    pub request_id: String,
    pub id: DeployId,
    /// Program and arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    /// Exit codes counted as success. Empty means only `0`.
    #[serde(default)]
    pub successful_exit_codes: Vec<i32>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub created_at: u64,
}

impl Deploy {
    /// Build the composite key for the deploys table.
    pub fn table_key(&self) -> String {
        deploy_key(&self.request_id, &self.id)
    }
}

/// Which deploy of a request is active, and which one is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestDeployState {
    pub request_id: String,
    pub active_deploy_id: Option<DeployId>,
    /// A deploy that has started but not yet become active.
    pub pending_deploy_id: Option<DeployId>,
    /// Unix millis when the active deploy became active.
    pub activated_at: Option<u64>,
}

impl RequestDeployState {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    pub fn is_active(&self, deploy_id: &str) -> bool {
        self.active_deploy_id.as_deref() == Some(deploy_id)
    }

    pub fn has_deploy_in_progress(&self) -> bool {
        self.pending_deploy_id.is_some()
    }
}

// ── Pending queue ──────────────────────────────────────────────────

/// Why new task instances were asked for.
///
/// Two intents for the same `(request, deploy)` pair collapse into one
/// pending row. The survivor is decided by [`PendingType::precedence`], a
/// total order, highest first:
///
/// `ONEOFF > IMMEDIATE > RETRY > NEW_DEPLOY > DECOMMISSIONED_SLAVE > UPDATED > TASK_DONE > STARTUP`
///
/// Operator triggers outrank everything, so a scheduled tick can never
/// swallow them. Intents synthesized by reconciliation rank lowest, so a
/// reconciliation pass never rewrites an existing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingType {
    Oneoff,
    Immediate,
    Retry,
    NewDeploy,
    DecommissionedSlave,
    Updated,
    TaskDone,
    Startup,
}

impl PendingType {
    pub fn precedence(self) -> u8 {
        match self {
            PendingType::Oneoff => 7,
            PendingType::Immediate => 6,
            PendingType::Retry => 5,
            PendingType::NewDeploy => 4,
            PendingType::DecommissionedSlave => 3,
            PendingType::Updated => 2,
            PendingType::TaskDone => 1,
            PendingType::Startup => 0,
        }
    }

    /// Whether an intent of this type replaces an existing `other`.
    pub fn supersedes(self, other: PendingType) -> bool {
        self.precedence() > other.precedence()
    }

    /// Operator-issued intents that run now regardless of schedules.
    pub fn is_manual(self) -> bool {
        matches!(self, PendingType::Oneoff | PendingType::Immediate)
    }
}

impl std::fmt::Display for PendingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PendingType::Oneoff => "ONEOFF",
            PendingType::Immediate => "IMMEDIATE",
            PendingType::Retry => "RETRY",
            PendingType::NewDeploy => "NEW_DEPLOY",
            PendingType::DecommissionedSlave => "DECOMMISSIONED_SLAVE",
            PendingType::Updated => "UPDATED",
            PendingType::TaskDone => "TASK_DONE",
            PendingType::Startup => "STARTUP",
        };
        f.write_str(s)
    }
}

/// A queued intent: request X on deploy Y needs new task instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub deploy_id: DeployId,
    /// Unix millis of insertion; drain order.
    pub timestamp: u64,
    pub pending_type: PendingType,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cmd_line_args: Vec<String>,
}

impl PendingRequest {
    pub fn new(
        request_id: impl Into<String>,
        deploy_id: impl Into<String>,
        timestamp: u64,
        pending_type: PendingType,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            deploy_id: deploy_id.into(),
            timestamp,
            pending_type,
            user: None,
            cmd_line_args: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_cmd_line_args(mut self, args: Vec<String>) -> Self {
        self.cmd_line_args = args;
        self
    }

    /// Build the composite key for the pending requests table.
    pub fn table_key(&self) -> String {
        deploy_key(&self.request_id, &self.deploy_id)
    }
}

/// Identity of a not-yet-launched task instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingTaskId {
    pub request_id: String,
    pub deploy_id: DeployId,
    pub instance_no: u32,
}

impl PendingTaskId {
    pub fn new(request_id: impl Into<String>, deploy_id: impl Into<String>, instance_no: u32) -> Self {
        Self {
            request_id: request_id.into(),
            deploy_id: deploy_id.into(),
            instance_no,
        }
    }

    /// Build the composite key for the pending tasks table.
    pub fn table_key(&self) -> String {
        format!("{}:{}:{}", self.request_id, self.deploy_id, self.instance_no)
    }
}

impl std::fmt::Display for PendingTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.table_key())
    }
}

/// A concrete task instance waiting for a matching resource offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: PendingTaskId,
    pub pending_type: PendingType,
    /// Unix millis before which the task must not launch.
    pub next_run_at: u64,
    /// Timestamp of the pending request this task was drained from.
    pub created_from: u64,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub cmd_line_args: Vec<String>,
}

impl PendingTask {
    pub fn is_due(&self, now: u64) -> bool {
        self.next_run_at <= now
    }
}

// ── Active tasks ───────────────────────────────────────────────────

/// Task state as reported by the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Launched,
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Terminal states that count against the retry budget.
    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Lost)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Launched => "LAUNCHED",
            TaskState::Staging => "STAGING",
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Failed => "FAILED",
            TaskState::Killed => "KILLED",
            TaskState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

/// A launched task instance with an assigned node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub request_id: String,
    pub deploy_id: DeployId,
    pub instance_no: u32,
    pub host: String,
    pub rack: String,
    pub state: TaskState,
    pub pending_type: PendingType,
    #[serde(default)]
    pub cmd_line_args: Vec<String>,
    pub launched_at: u64,
    pub updated_at: u64,
    /// Set once a kill has been sent so later passes do not resend it.
    #[serde(default)]
    pub kill_requested_at: Option<u64>,
}

impl ActiveTask {
    /// Build the active task that a pending task becomes on `host`.
    pub fn from_pending(pending: &PendingTask, host: &str, rack: &str, now: u64) -> Self {
        Self {
            task_id: task_id_for(&pending.id, now),
            request_id: pending.id.request_id.clone(),
            deploy_id: pending.id.deploy_id.clone(),
            instance_no: pending.id.instance_no,
            host: host.to_string(),
            rack: rack.to_string(),
            state: TaskState::Launched,
            pending_type: pending.pending_type,
            cmd_line_args: pending.cmd_line_args.clone(),
            launched_at: now,
            updated_at: now,
            kill_requested_at: None,
        }
    }

    /// The pending task this active task was launched from.
    pub fn pending_task_id(&self) -> PendingTaskId {
        PendingTaskId::new(&self.request_id, &self.deploy_id, self.instance_no)
    }
}

/// Task ids start with the request id so active tasks scan by request prefix.
pub fn task_id_for(pending: &PendingTaskId, launched_at: u64) -> TaskId {
    format!("{}:{launched_at}", pending.table_key())
}

/// A task that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHistory {
    pub task: ActiveTask,
    pub final_state: TaskState,
    pub exit_code: Option<i32>,
    pub finished_at: u64,
}

impl TaskHistory {
    /// Build the composite key for the task history table.
    ///
    /// The zero-padded finish time keeps one request's history in order.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{:020}:{}",
            self.task.request_id, self.finished_at, self.task.task_id
        )
    }
}

/// A host being drained of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decommission {
    pub host: String,
    pub started_at: u64,
}

/// Current wall-clock time in Unix millis.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Composite `{request_id}:{deploy_id}` key.
pub fn deploy_key(request_id: &str, deploy_id: &str) -> String {
    format!("{request_id}:{deploy_id}")
}

/// Prefix matching every composite key derived from `request_id`.
pub fn request_prefix(request_id: &str) -> String {
    format!("{request_id}:")
}
