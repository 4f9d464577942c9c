//! What the executor needs to know to run one task.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_state::{ActiveTask, Artifact, Deploy};

/// A launched task resolved against its deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub request_id: String,
    pub deploy_id: String,
    /// Program and arguments from the deploy.
    pub command: Vec<String>,
    /// Extra arguments supplied when the run was triggered.
    pub cmd_line_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub successful_exit_codes: Vec<i32>,
    pub artifacts: Vec<Artifact>,
}

impl TaskDefinition {
    pub fn from_deploy(task: &ActiveTask, deploy: &Deploy) -> Self {
        Self {
            task_id: task.task_id.clone(),
            request_id: task.request_id.clone(),
            deploy_id: task.deploy_id.clone(),
            command: deploy.command.clone(),
            cmd_line_args: task.cmd_line_args.clone(),
            env: deploy.env.clone(),
            successful_exit_codes: deploy.successful_exit_codes.clone(),
            artifacts: deploy.artifacts.clone(),
        }
    }

    /// With no explicit allow-list only `0` is a success.
    pub fn is_success_exit_code(&self, code: i32) -> bool {
        if self.successful_exit_codes.is_empty() {
            code == 0
        } else {
            self.successful_exit_codes.contains(&code)
        }
    }

    /// Variables every task sees in addition to the deploy's env.
    pub fn task_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("FLEET_TASK_ID".into(), self.task_id.clone());
        env.insert("FLEET_REQUEST_ID".into(), self.request_id.clone());
        env.insert("FLEET_DEPLOY_ID".into(), self.deploy_id.clone());
        env
    }
}

/// Timeouts and paths for the node's executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Root for per-task sandboxes and logs.
    pub task_root: PathBuf,
    /// Bound on sandbox creation, log setup, artifact fetch and templating.
    pub build_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace_period: Duration,
    /// Bound on acquiring the process lock to kill, and on the wait after SIGKILL.
    pub kill_timeout: Duration,
    pub cleanup_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_root: PathBuf::from("/var/lib/fleet/tasks"),
            build_timeout: Duration::from_secs(300),
            kill_grace_period: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(codes: Vec<i32>) -> TaskDefinition {
        TaskDefinition {
            task_id: "web:d1:1:5".into(),
            request_id: "web".into(),
            deploy_id: "d1".into(),
            command: vec!["true".into()],
            cmd_line_args: Vec::new(),
            env: BTreeMap::new(),
            successful_exit_codes: codes,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn empty_allow_list_means_zero_only() {
        let def = definition(Vec::new());
        assert!(def.is_success_exit_code(0));
        assert!(!def.is_success_exit_code(1));
    }

    #[test]
    fn allow_list_is_exclusive() {
        let def = definition(vec![0, 3]);
        assert!(def.is_success_exit_code(3));
        assert!(!def.is_success_exit_code(1));

        let def = definition(vec![2]);
        assert!(!def.is_success_exit_code(0));
        assert!(def.is_success_exit_code(2));
    }

    #[test]
    fn task_env_adds_identity() {
        let mut def = definition(Vec::new());
        def.env.insert("MODE".into(), "batch".into());
        let env = def.task_env();
        assert_eq!(env["MODE"], "batch");
        assert_eq!(env["FLEET_TASK_ID"], "web:d1:1:5");
    }
}
