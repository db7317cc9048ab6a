//! Command-line interface for filament.
//!
//! Provides commands for submitting work items, inspecting runs, listing and
//! resolving approval tickets, and recovering state after a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config;
use crate::core::{
    default_filing_graph, ApprovalError, ApprovalService, LedgerError, Orchestrator, Resolution,
    RunStore, RunSupervisor, StageGraph, StateLock, WorkLedger,
};
use crate::domain::{Decision, PipelineRun, RunStatus, StageStatus, WorkItem, WorkItemKey};
use crate::protocol::{Executor, HttpExecutor, ProtocolClient};

/// filament - durable pipeline orchestrator for regulatory-filing workflows
#[derive(Parser, Debug)]
#[command(name = "filament")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a work item and run the pipeline for it
    Submit {
        /// Work item key as SOURCE:ITEM (e.g. BHP:2024-FY-results)
        key: String,

        /// JSON payload file for the work item (empty object if omitted)
        #[arg(short, long)]
        payload: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List open approval tickets
    Pending,

    /// Decide an approval ticket and resume its run
    Resolve {
        /// Ticket ID (tkt-...)
        ticket_id: String,

        /// Approve the proposed action
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the proposed action
        #[arg(long)]
        reject: bool,

        /// Who is deciding
        #[arg(long, env = "FILAMENT_ACTOR", default_value = "operator")]
        actor: String,

        /// Optional decision notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Recover in-flight and suspended runs after a restart
    Recover,

    /// Show resolved configuration (debug)
    Config,
}

/// Everything a command needs, built from the resolved configuration
struct App {
    supervisor: Arc<RunSupervisor>,
    store: Arc<RunStore>,
    approvals: Arc<ApprovalService>,
    /// Held alive so resolutions published during this invocation are not
    /// treated as dropped-channel sends
    _resolutions: mpsc::UnboundedReceiver<Resolution>,
    _lock: StateLock,
}

async fn open_app() -> Result<App> {
    let cfg = config::config()?;

    let lock = StateLock::acquire(&config::lock_path()?)?;

    let store = Arc::new(RunStore::new(config::runs_dir()?));
    let ledger = Arc::new(WorkLedger::open(config::ledger_path()?).await?);
    let (approvals, resolutions) = ApprovalService::open(config::tickets_path()?).await?;
    let approvals = Arc::new(approvals);

    let graph = match &cfg.pipeline {
        Some(path) => StageGraph::from_file(path)?,
        None => default_filing_graph(),
    };

    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
    for (name, endpoint) in &cfg.executors {
        executors.insert(
            name.clone(),
            Arc::new(HttpExecutor::new(name.clone(), endpoint.clone())),
        );
    }
    for stage in graph.iter_stages() {
        if !executors.contains_key(&stage.executor) {
            anyhow::bail!(
                "No executor endpoint configured for '{}' (stage '{}'); add it under 'executors' in config.yaml",
                stage.executor,
                stage.name
            );
        }
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        ledger.clone(),
        approvals.clone(),
        ProtocolClient::new(cfg.poll.clone()),
        executors,
        cfg.retry.clone(),
        cfg.stage_timeout,
    );

    let supervisor = RunSupervisor::new(
        orchestrator,
        Arc::new(graph),
        store.clone(),
        ledger,
        approvals.clone(),
        cfg.supervisor.clone(),
    );

    Ok(App {
        supervisor,
        store,
        approvals,
        _resolutions: resolutions,
        _lock: lock,
    })
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit { key, payload } => submit(&key, payload).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Pending => list_pending().await,
            Commands::Resolve {
                ticket_id,
                approve,
                reject,
                actor,
                notes,
            } => resolve(&ticket_id, approve, reject, &actor, notes).await,
            Commands::Recover => recover().await,
            Commands::Config => show_config(),
        }
    }
}

/// Submit a work item and wait for the run to settle
async fn submit(key: &str, payload_file: Option<PathBuf>) -> Result<()> {
    let key: WorkItemKey = key
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let payload = match payload_file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Payload is not valid JSON: {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let app = open_app().await?;
    let item = WorkItem::new(key.clone(), payload);

    let handle = match app.supervisor.submit(item).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Some(LedgerError::AlreadyActive { holder, .. }) = e.downcast_ref::<LedgerError>()
            {
                eprintln!("Work item '{}' is already being processed (run {})", key, holder);
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    println!("Run {} started for '{}'", handle.run_id, key);

    let run = handle.wait().await?;
    print_run(&run);

    if run.status == RunStatus::Failed {
        std::process::exit(1);
    }

    Ok(())
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let app = open_app().await?;
    let run = app
        .store
        .load_run(run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))?;

    print_run(&run);
    Ok(())
}

/// List recent runs, most recently updated first
async fn list_runs(limit: usize) -> Result<()> {
    let app = open_app().await?;
    let runs = app.store.recent_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {:<10} {:<24} updated {}",
            run.id,
            status_label(run.status),
            run.work_item.to_string(),
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// List open approval tickets
async fn list_pending() -> Result<()> {
    let app = open_app().await?;
    let pending = app.approvals.list_pending().await;

    if pending.is_empty() {
        println!("No pending approvals");
        return Ok(());
    }

    for ticket in pending {
        println!(
            "{}  run {}  stage '{}'  created {}",
            ticket.id,
            ticket.run_id,
            ticket.stage,
            ticket.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "    proposed: {}",
            serde_json::to_string(&ticket.proposed_action).unwrap_or_default()
        );
    }

    Ok(())
}

/// Decide a ticket and drive the resumed run to its next settle point
async fn resolve(
    ticket_id: &str,
    approve: bool,
    reject: bool,
    actor: &str,
    notes: Option<String>,
) -> Result<()> {
    let decision = match (approve, reject) {
        (true, false) => Decision::Approved,
        (false, true) => Decision::Rejected,
        _ => anyhow::bail!("Pass exactly one of --approve or --reject"),
    };

    let app = open_app().await?;

    let run = match app.supervisor.resolve(ticket_id, decision, actor, notes).await {
        Ok(run) => run,
        Err(e) => {
            match e.downcast_ref::<ApprovalError>() {
                Some(ApprovalError::AlreadyResolved { decision, .. }) => {
                    eprintln!("Ticket {} was already resolved as {:?}", ticket_id, decision);
                    std::process::exit(1);
                }
                Some(ApprovalError::UnknownTicket(_)) => {
                    eprintln!("No ticket '{}' found", ticket_id);
                    std::process::exit(1);
                }
                _ => return Err(e),
            }
        }
    };

    print_run(&run);
    Ok(())
}

/// Run a recovery pass
async fn recover() -> Result<()> {
    let app = open_app().await?;
    let report = app.supervisor.recover().await?;

    println!("Recovery finished:");
    println!("  resumed orphans:   {}", report.resumed);
    println!("  failed orphans:    {}", report.orphaned);
    println!("  re-attached:       {}", report.reattached);
    println!("  decided offline:   {}", report.decided_offline);
    println!("  left in flight:    {}", report.in_flight);

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("State directory: {}", cfg.home.display());
    match &cfg.config_file {
        Some(path) => println!("Config file:     {}", path.display()),
        None => println!("Config file:     (none found)"),
    }
    println!("Stage timeout:   {:?}", cfg.stage_timeout);
    println!("Retry:           {} attempts, base {}ms", cfg.retry.max_attempts, cfg.retry.base_delay_ms);
    println!("Concurrency:     {} runs", cfg.supervisor.max_concurrent_runs);
    println!("Orphan policy:   {:?}", cfg.supervisor.orphan_policy);
    println!("Executors:");
    if cfg.executors.is_empty() {
        println!("  (none configured)");
    }
    for (name, endpoint) in &cfg.executors {
        println!("  {} -> {}", name, endpoint);
    }

    Ok(())
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Suspended => "SUSPENDED",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn print_run(run: &PipelineRun) {
    println!("Run:       {}", run.id);
    println!("Work item: {}", run.work_item);
    println!("Status:    {}", status_label(run.status));
    println!("Created:   {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:   {}", run.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(suspension) = &run.suspension {
        println!(
            "Awaiting approval at stage '{}' (ticket {})",
            suspension.stage, suspension.ticket_id
        );
        println!("Decide with: filament resolve {} --approve|--reject", suspension.ticket_id);
    }

    if let Some(failure) = &run.failure {
        match &failure.stage {
            Some(stage) => println!("Failure:   [{}] at stage '{}': {}", failure.class, stage, failure.message),
            None => println!("Failure:   [{}]: {}", failure.class, failure.message),
        }
    }

    if !run.stage_results.is_empty() {
        println!("Stages:");
        for result in &run.stage_results {
            let label = match result.status {
                StageStatus::Success => "ok",
                StageStatus::Failed => "failed",
                StageStatus::Skipped => "skipped",
            };
            let mut line = format!("  {:<12} {:<8}", result.stage, label);
            if result.attempts > 1 {
                line.push_str(&format!(" ({} attempts)", result.attempts));
            }
            if !result.detail.is_empty() && result.status != StageStatus::Success {
                line.push_str(&format!(" - {}", result.detail));
            }
            println!("{}", line);
        }
    }
}
