//! The node's table of running tasks.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collaborators::TaskCollaborators;
use crate::definition::{ExecutorConfig, TaskDefinition};
use crate::error::{ExecutorError, ExecutorResult};
use crate::task::ExecutorTask;

type TaskTable = Arc<RwLock<HashMap<String, Arc<ExecutorTask>>>>;

/// Launches tasks in the background and tracks them until they finish.
#[derive(Clone)]
pub struct ExecutorMonitor {
    config: ExecutorConfig,
    collaborators: TaskCollaborators,
    tasks: TaskTable,
}

impl ExecutorMonitor {
    pub fn new(config: ExecutorConfig, collaborators: TaskCollaborators) -> Self {
        Self {
            config,
            collaborators,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a task. Must be called from within a tokio runtime.
    pub fn launch(&self, definition: TaskDefinition) -> ExecutorResult<Arc<ExecutorTask>> {
        let task_id = definition.task_id.clone();
        let task = Arc::new(ExecutorTask::new(
            definition,
            self.config.clone(),
            self.collaborators.clone(),
        ));

        {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            if tasks.contains_key(&task_id) {
                return Err(ExecutorError::AlreadyRunning(task_id));
            }
            tasks.insert(task_id.clone(), task.clone());
        }
        info!(%task_id, "task launched");

        let table = self.tasks.clone();
        let runner = task.clone();
        tokio::spawn(async move {
            let outcome = runner.run().await;
            table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            debug!(%task_id, ?outcome, "task removed from monitor");
        });
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<ExecutorTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.get(task_id).is_some()
    }

    /// Ids of tasks that have not finished yet, sorted.
    pub fn running_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub async fn kill(&self, task_id: &str) -> ExecutorResult<()> {
        let task = self
            .get(task_id)
            .ok_or_else(|| ExecutorError::NotFound(task_id.to_string()))?;
        task.kill().await
    }

    /// Kill every task and wait up to `timeout` for them to finish.
    /// Returns how many tasks were still running.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let tasks: Vec<Arc<ExecutorTask>> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if tasks.is_empty() {
            return 0;
        }
        info!(count = tasks.len(), "stopping tasks");

        for task in &tasks {
            match task.kill().await {
                Ok(()) => {}
                Err(e) => warn!(task_id = %task.task_id(), error = %e, "kill failed"),
            }
        }
        let all_done = async {
            for task in &tasks {
                task.wait().await;
            }
        };
        if tokio::time::timeout(timeout, all_done).await.is_err() {
            warn!(?timeout, "tasks still running at shutdown");
        }
        tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::collaborators::{ExecutorStatus, StatusReporter};
    use crate::task::TaskPhase;

    struct Discard;

    impl StatusReporter for Discard {
        fn report(&self, _status: ExecutorStatus) {}
    }

    fn monitor(dir: &tempfile::TempDir) -> ExecutorMonitor {
        let config = ExecutorConfig {
            task_root: dir.path().to_path_buf(),
            build_timeout: Duration::from_secs(5),
            kill_grace_period: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
        };
        let collaborators = TaskCollaborators::local(dir.path(), Arc::new(Discard));
        ExecutorMonitor::new(config, collaborators)
    }

    fn definition(task_id: &str, command: &[&str]) -> TaskDefinition {
        TaskDefinition {
            task_id: task_id.into(),
            request_id: "job".into(),
            deploy_id: "d1".into(),
            command: command.iter().map(|s| s.to_string()).collect(),
            cmd_line_args: Vec::new(),
            env: BTreeMap::new(),
            successful_exit_codes: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    async fn wait_until_removed(monitor: &ExecutorMonitor, task_id: &str) {
        for _ in 0..100 {
            if !monitor.contains(task_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{task_id} was never removed");
    }

    #[tokio::test]
    async fn rejects_duplicate_task_ids() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);

        let task = monitor.launch(definition("t1", &["sleep", "30"])).unwrap();
        assert!(matches!(
            monitor.launch(definition("t1", &["true"])),
            Err(ExecutorError::AlreadyRunning(_))
        ));
        assert_eq!(monitor.running_tasks(), vec!["t1".to_string()]);

        monitor.kill("t1").await.unwrap();
        assert_eq!(task.wait().await, TaskPhase::Killed);
        wait_until_removed(&monitor, "t1").await;
    }

    #[tokio::test]
    async fn repeated_kills_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        let task = monitor.launch(definition("t1", &["sleep", "30"])).unwrap();

        monitor.kill("t1").await.unwrap();
        monitor.kill("t1").await.unwrap();
        assert_eq!(task.wait().await, TaskPhase::Killed);
        wait_until_removed(&monitor, "t1").await;
    }

    #[tokio::test]
    async fn finished_tasks_leave_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);

        let task = monitor.launch(definition("t1", &["true"])).unwrap();
        assert!(task.wait().await.is_terminal());
        wait_until_removed(&monitor, "t1").await;

        assert!(matches!(
            monitor.kill("t1").await,
            Err(ExecutorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(&dir);
        let a = monitor.launch(definition("a", &["sleep", "30"])).unwrap();
        let b = monitor.launch(definition("b", &["sleep", "30"])).unwrap();

        assert_eq!(monitor.shutdown(Duration::from_secs(10)).await, 2);
        assert_eq!(a.phase(), TaskPhase::Killed);
        assert_eq!(b.phase(), TaskPhase::Killed);
    }
}
