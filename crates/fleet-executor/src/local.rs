//! File-based collaborators for a single node.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use fleet_state::Artifact;

use crate::collaborators::{ArtifactFetcher, TaskLogManager, TaskLogs, TaskSandbox, TemplateRenderer};
use crate::definition::TaskDefinition;
use crate::error::{ExecutorError, ExecutorResult};
use crate::task::TaskPhase;

/// Copies `file://` (or bare path) artifacts, verifying sha256 when given.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalArtifactFetcher;

#[async_trait]
impl ArtifactFetcher for LocalArtifactFetcher {
    async fn fetch(&self, artifact: &Artifact, sandbox: &Path) -> ExecutorResult<PathBuf> {
        if artifact.name.is_empty() || artifact.name.contains('/') || artifact.name == ".." {
            return Err(ExecutorError::Fetch(format!(
                "invalid artifact name {:?}",
                artifact.name
            )));
        }
        let source = match artifact.uri.strip_prefix("file://") {
            Some(path) => path,
            None if artifact.uri.contains("://") => {
                return Err(ExecutorError::Fetch(format!(
                    "unsupported artifact uri {}",
                    artifact.uri
                )));
            }
            None => artifact.uri.as_str(),
        };

        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| ExecutorError::Fetch(format!("{source}: {e}")))?;
        if let Some(expected) = &artifact.sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ExecutorError::Checksum {
                    name: artifact.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let dest = sandbox.join(&artifact.name);
        tokio::fs::write(&dest, &bytes).await?;
        debug!(name = %artifact.name, size = bytes.len(), "artifact fetched");
        Ok(dest)
    }
}

/// Writes the task environment to `task.env` in the sandbox.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvFileRenderer;

#[async_trait]
impl TemplateRenderer for EnvFileRenderer {
    async fn render(&self, task: &TaskDefinition, sandbox: &Path) -> ExecutorResult<()> {
        let mut contents = String::new();
        for (key, value) in task.task_env() {
            if key.contains('=') || key.contains('\n') || value.contains('\n') {
                return Err(ExecutorError::Template(format!(
                    "environment entry {key:?} cannot be written to an env file"
                )));
            }
            contents.push_str(&format!("{key}={value}\n"));
        }
        tokio::fs::write(sandbox.join("task.env"), contents).await?;
        Ok(())
    }
}

/// Per-task stdout/stderr files plus a final `status.json`.
#[derive(Debug, Clone)]
pub struct FileLogManager {
    root: PathBuf,
}

impl FileLogManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }
}

#[async_trait]
impl TaskLogManager for FileLogManager {
    async fn prepare(&self, task: &TaskDefinition) -> ExecutorResult<TaskLogs> {
        let dir = self.task_dir(&task.task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecutorError::Logs(format!("{}: {e}", dir.display())))?;
        let logs = TaskLogs {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        };
        for path in [&logs.stdout, &logs.stderr] {
            tokio::fs::File::create(path)
                .await
                .map_err(|e| ExecutorError::Logs(format!("{}: {e}", path.display())))?;
        }
        Ok(logs)
    }

    async fn finalize(&self, task: &TaskDefinition, phase: &TaskPhase) -> ExecutorResult<()> {
        let dir = self.task_dir(&task.task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let record = serde_json::json!({
            "task_id": task.task_id,
            "phase": phase,
        });
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| ExecutorError::Logs(e.to_string()))?;
        tokio::fs::write(dir.join("status.json"), bytes).await?;
        Ok(())
    }
}

/// One directory per task under a sandbox root.
#[derive(Debug, Clone)]
pub struct DirSandbox {
    root: PathBuf,
}

impl DirSandbox {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }
}

#[async_trait]
impl TaskSandbox for DirSandbox {
    async fn create(&self, task: &TaskDefinition) -> ExecutorResult<PathBuf> {
        let path = self.path_for(&task.task_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn cleanup(&self, task: &TaskDefinition) -> ExecutorResult<()> {
        let path = self.path_for(&task.task_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            // Nothing was built before the task ended.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn definition() -> TaskDefinition {
        TaskDefinition {
            task_id: "job:d1:1:5".into(),
            request_id: "job".into(),
            deploy_id: "d1".into(),
            command: vec!["true".into()],
            cmd_line_args: Vec::new(),
            env: BTreeMap::from([("MODE".to_string(), "batch".to_string())]),
            successful_exit_codes: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fetch_verifies_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.txt");
        std::fs::write(&source, b"hello").unwrap();
        let sandbox = dir.path().join("sandbox");
        std::fs::create_dir_all(&sandbox).unwrap();

        let good = Artifact {
            name: "payload.txt".into(),
            uri: format!("file://{}", source.display()),
            sha256: Some(hex::encode(Sha256::digest(b"hello"))),
        };
        let path = LocalArtifactFetcher.fetch(&good, &sandbox).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello");

        let bad = Artifact {
            sha256: Some("00".repeat(32)),
            ..good.clone()
        };
        assert!(matches!(
            LocalArtifactFetcher.fetch(&bad, &sandbox).await,
            Err(ExecutorError::Checksum { .. })
        ));

        let remote = Artifact {
            uri: "https://example.invalid/payload".into(),
            ..good
        };
        assert!(matches!(
            LocalArtifactFetcher.fetch(&remote, &sandbox).await,
            Err(ExecutorError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn env_file_contains_task_identity() {
        let dir = tempfile::tempdir().unwrap();
        EnvFileRenderer.render(&definition(), dir.path()).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("task.env")).unwrap();
        assert!(contents.contains("MODE=batch\n"));
        assert!(contents.contains("FLEET_TASK_ID=job:d1:1:5\n"));
    }

    #[tokio::test]
    async fn sandbox_cleanup_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = DirSandbox::new(dir.path().to_path_buf());
        let task = definition();

        let path = sandbox.create(&task).await.unwrap();
        assert!(path.is_dir());
        sandbox.cleanup(&task).await.unwrap();
        assert!(!path.exists());
        sandbox.cleanup(&task).await.unwrap();
    }

    #[tokio::test]
    async fn logs_record_final_phase() {
        let dir = tempfile::tempdir().unwrap();
        let logs = FileLogManager::new(dir.path().to_path_buf());
        let task = definition();

        let paths = logs.prepare(&task).await.unwrap();
        assert!(paths.stdout.exists() && paths.stderr.exists());
        logs.finalize(&task, &TaskPhase::Killed).await.unwrap();

        let status = std::fs::read_to_string(logs.task_dir(&task.task_id).join("status.json")).unwrap();
        assert!(status.contains("KILLED"));
    }
}
