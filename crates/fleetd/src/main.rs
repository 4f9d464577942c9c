//! fleetd — the fleet daemon.
//!
//! Single binary that assembles the fleet subsystems:
//! - State store (redb)
//! - Pending queue scheduler
//! - Reconciler
//! - Local executor
//!
//! The admin subcommands open the store directly, so they run while the
//! daemon is stopped.
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --config /etc/fleet/fleet.toml
//! fleetd submit request.json
//! fleetd deploy deploy.json
//! fleetd trigger nightly-report -- --full
//! ```

mod config;
mod standalone;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing::info;

use fleet_reconcile::{AssumeAlive, Reconciler};
use fleet_scheduler::{DeployTracker, NullDriver, RecordingDriver, RequestManager, Scheduler};
use fleet_state::{Deploy, Request, StateStore, epoch_millis};

use crate::config::FleetConfig;

const DEFAULT_LOG_FILTER: &str =
    "info,fleetd=debug,fleet_scheduler=debug,fleet_reconcile=debug,fleet_executor=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet workload orchestrator daemon")]
struct Cli {
    /// Path to fleet.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, reconciler and executor for this node.
    Standalone,

    /// Run one reconciliation pass against the store and print the repairs.
    Check,

    /// Create or update a request from a JSON file.
    Submit {
        file: PathBuf,
    },

    /// Register a deploy from a JSON file and make it active.
    Deploy {
        file: PathBuf,
    },

    /// Queue an immediate run of an on-demand, run-once or scheduled request.
    Trigger {
        request_id: String,

        /// Recorded as the user who asked for the run.
        #[arg(long)]
        user: Option<String>,

        /// Extra arguments appended to the deploy command.
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Delete a request with its pending work and deploys. History is kept.
    Delete {
        request_id: String,
    },

    /// Stop placing work on a host and move its tasks elsewhere.
    Decommission {
        host: String,
    },

    /// Allow a decommissioned host to receive work again.
    Recommission {
        host: String,
    },

    /// Print requests, pending work and active tasks as JSON.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => FleetConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::Standalone => standalone::run_standalone(config).await,
        Command::Check => check(&config),
        Command::Submit { file } => submit(&config, &file),
        Command::Deploy { file } => deploy(&config, &file),
        Command::Trigger {
            request_id,
            user,
            args,
        } => trigger(&config, &request_id, user, args),
        Command::Delete { request_id } => delete(&config, &request_id),
        Command::Decommission { host } => {
            let scheduler = Scheduler::new(open_store(&config)?, config.scheduler_config());
            let moved = scheduler.decommission_node(&host, epoch_millis())?;
            println!("{host}: decommissioned, {moved} request(s) requeued");
            Ok(())
        }
        Command::Recommission { host } => {
            let scheduler = Scheduler::new(open_store(&config)?, config.scheduler_config());
            if scheduler.recommission_node(&host)? {
                println!("{host}: recommissioned");
            } else {
                println!("{host}: was not decommissioned");
            }
            Ok(())
        }
        Command::Status => status(&config),
    }
}

fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.data_dir)?;
    let path = config.db_path();
    StateStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn check(config: &FleetConfig) -> anyhow::Result<()> {
    let state = open_store(config)?;
    // No executor is attached; kills are collected and printed instead.
    let driver = Arc::new(RecordingDriver::new());
    let reconciler = Reconciler::new(state.clone(), Arc::new(AssumeAlive), driver.clone());

    let report = reconciler.check_scheduler_for_inconsistent_state(epoch_millis())?;
    if report.is_consistent() {
        println!("state is consistent");
    } else {
        println!("{report:#?}");
    }
    for task_id in driver.killed() {
        // Leave the kill for the daemon's next pass.
        state.cancel_kill_request(&task_id)?;
        println!("kill not delivered: {task_id}");
    }
    for task_id in &report.overdue_scheduled_tasks {
        println!("overdue scheduled task: {task_id}");
    }
    Ok(())
}

fn submit(config: &FleetConfig, file: &Path) -> anyhow::Result<()> {
    let request: Request = read_json(file)?;
    let state = open_store(config)?;
    let request_id = request.id().to_string();
    let outcome = RequestManager::new(state, Arc::new(NullDriver))
        .save_request(request, epoch_millis())?;
    info!(%request_id, ?outcome, "request saved");
    println!("{request_id}: {outcome:?}");
    Ok(())
}

fn deploy(config: &FleetConfig, file: &Path) -> anyhow::Result<()> {
    let deploy: Deploy = read_json(file)?;
    let state = open_store(config)?;
    let tracker = DeployTracker::new(state, Arc::new(NullDriver));

    tracker.deploy_started(&deploy)?;
    let queued = tracker.deploy_activated(&deploy.request_id, &deploy.id, epoch_millis())?;
    println!(
        "{}: deploy {} active{}",
        deploy.request_id,
        deploy.id,
        if queued.is_some() { ", work queued" } else { "" }
    );
    Ok(())
}

fn trigger(
    config: &FleetConfig,
    request_id: &str,
    user: Option<String>,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let state = open_store(config)?;
    let outcome = RequestManager::new(state, Arc::new(NullDriver)).schedule_immediately(
        request_id,
        user,
        args,
        epoch_millis(),
    )?;
    if outcome.was_written() {
        println!("{request_id}: run queued");
    } else {
        println!("{request_id}: a run is already queued");
    }
    Ok(())
}

fn delete(config: &FleetConfig, request_id: &str) -> anyhow::Result<()> {
    let state = open_store(config)?;
    let deletion = RequestManager::new(state, Arc::new(NullDriver)).delete_request(request_id)?;
    println!(
        "{request_id}: deleted ({} pending request(s), {} pending task(s), {} deploy(s) removed)",
        deletion.pending_requests_removed,
        deletion.pending_tasks_removed,
        deletion.deploys_removed,
    );
    for task in &deletion.active_tasks {
        println!("kill not delivered: {}", task.task_id);
    }
    Ok(())
}

fn status(config: &FleetConfig) -> anyhow::Result<()> {
    let state = open_store(config)?;
    let report = serde_json::json!({
        "requests": state.list_requests()?,
        "pending_requests": state.list_pending_requests()?,
        "pending_tasks": state.list_pending_tasks()?,
        "active_tasks": state.list_active_tasks()?,
        "decommissioned_hosts": state.list_decommissions()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
