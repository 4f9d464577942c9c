//! fleet.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_executor::ExecutorConfig;
use fleet_scheduler::SchedulerConfig;
use fleet_state::Resources;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    pub node: NodeConfig,
    pub scheduler: SchedulerSection,
    pub reconcile: ReconcileSection,
    pub executor: ExecutorSection,
}

/// The node this daemon offers to the scheduler in standalone mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub rack: String,
    pub cpus: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// How often the local node is offered.
    pub offer_interval_ms: u64,
    pub max_tasks_per_offer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Defaults to `<data_dir>/tasks`.
    pub task_root: Option<PathBuf>,
    pub build_timeout_secs: u64,
    pub kill_grace_period_secs: u64,
    pub kill_timeout_secs: u64,
    pub cleanup_timeout_secs: u64,
    /// How long shutdown waits for killed tasks.
    pub shutdown_timeout_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleet"),
            node: NodeConfig::default(),
            scheduler: SchedulerSection::default(),
            reconcile: ReconcileSection::default(),
            executor: ExecutorSection::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            rack: "default".to_string(),
            cpus: 4.0,
            memory_mb: 4096.0,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            offer_interval_ms: 1000,
            max_tasks_per_offer: SchedulerConfig::default().max_tasks_per_offer,
        }
    }
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            task_root: None,
            build_timeout_secs: defaults.build_timeout.as_secs(),
            kill_grace_period_secs: defaults.kill_grace_period.as_secs(),
            kill_timeout_secs: defaults.kill_timeout.as_secs(),
            cleanup_timeout_secs: defaults.cleanup_timeout.as_secs(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.redb")
    }

    pub fn node_resources(&self) -> Resources {
        Resources::new(self.node.cpus, self.node.memory_mb)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_tasks_per_offer: self.scheduler.max_tasks_per_offer,
        }
    }

    pub fn offer_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.offer_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.shutdown_timeout_secs)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let e = &self.executor;
        ExecutorConfig {
            task_root: e
                .task_root
                .clone()
                .unwrap_or_else(|| self.data_dir.join("tasks")),
            build_timeout: Duration::from_secs(e.build_timeout_secs),
            kill_grace_period: Duration::from_secs(e.kill_grace_period_secs),
            kill_timeout: Duration::from_secs(e.kill_timeout_secs),
            cleanup_timeout: Duration::from_secs(e.cleanup_timeout_secs),
        }
    }
}
