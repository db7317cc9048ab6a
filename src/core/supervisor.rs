//! Run supervisor: top-level entry point for work items.
//!
//! Accepts submissions (enforcing the single-active-run invariant through the
//! ledger), bounds concurrency with a semaphore so excess runs queue instead
//! of spawning unbounded, listens for ticket resolutions, cancels runs, and
//! recovers in-flight and suspended runs after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{ApprovalTicket, Decision, PipelineRun, RunStatus, WorkItem};

use super::approvals::{ApprovalService, Resolution};
use super::ledger::WorkLedger;
use super::orchestrator::Orchestrator;
use super::run_store::RunStore;
use super::stages::StageGraph;

/// What to do with a RUNNING run that outlived the liveness threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Re-enter the run from its last completed stage
    Resume,

    /// Fail the run with `orphaned_run`
    Fail,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self::Resume
    }
}

/// Supervisor tuning knobs
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum runs executing concurrently; excess submissions queue
    pub max_concurrent_runs: usize,

    /// Policy for RUNNING runs found stale at startup
    pub orphan_policy: OrphanPolicy,

    /// A RUNNING run whose last event is older than this is an orphan
    pub liveness_threshold: Duration,

    /// Optional TTL after which pending tickets are expired (rejected)
    pub approval_ttl: Option<Duration>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 8,
            orphan_policy: OrphanPolicy::default(),
            liveness_threshold: Duration::from_secs(600),
            approval_ttl: None,
        }
    }
}

/// Summary of a recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned runs re-entered
    pub resumed: usize,

    /// Orphaned runs failed per policy
    pub orphaned: usize,

    /// Suspended runs re-attached to their pending tickets
    pub reattached: usize,

    /// Suspended runs whose tickets were decided while the process was down
    pub decided_offline: usize,

    /// RUNNING runs younger than the liveness threshold, left alone
    pub in_flight: usize,
}

/// Handle to a submitted run
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    handle: JoinHandle<Result<PipelineRun>>,
}

impl RunHandle {
    /// Wait for the run's task to settle (terminal state or suspension)
    pub async fn wait(self) -> Result<PipelineRun> {
        self.handle.await.context("run task panicked")?
    }
}

/// Top-level supervisor; share as `Arc<RunSupervisor>`
pub struct RunSupervisor {
    orchestrator: Orchestrator,
    graph: Arc<StageGraph>,
    store: Arc<RunStore>,
    ledger: Arc<WorkLedger>,
    approvals: Arc<ApprovalService>,
    limiter: Arc<Semaphore>,
    cancels: Mutex<HashMap<Uuid, CancellationToken>>,
    config: SupervisorConfig,
}

impl RunSupervisor {
    pub fn new(
        orchestrator: Orchestrator,
        graph: Arc<StageGraph>,
        store: Arc<RunStore>,
        ledger: Arc<WorkLedger>,
        approvals: Arc<ApprovalService>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            graph,
            store,
            ledger,
            approvals,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            cancels: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Accept a work item and start a run for it on its own task.
    ///
    /// Fails with `AlreadyActive` (inside the error chain) when the item
    /// already has a RUNNING or SUSPENDED run.
    pub async fn submit(self: &Arc<Self>, item: WorkItem) -> Result<RunHandle> {
        let run_id = Uuid::new_v4();
        let key = item.key.to_string();

        self.ledger
            .try_acquire(&key, run_id)
            .await
            .with_context(|| format!("Cannot start run for '{}'", key))?;

        info!(%run_id, work_item = %key, "Work item accepted");

        let cancel = CancellationToken::new();
        self.track_cancel(run_id, cancel.clone()).await;

        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            // Backpressure: wait for a slot instead of running unbounded
            let _permit = supervisor
                .limiter
                .clone()
                .acquire_owned()
                .await
                .context("concurrency limiter closed")?;

            let result = supervisor
                .orchestrator
                .execute(&supervisor.graph, &item, run_id, cancel)
                .await;

            supervisor.untrack_cancel(run_id).await;
            if let Err(e) = &result {
                // Claim stays held; the recovery scan will settle this run
                error!(%run_id, error = %e, "Run task failed");
            }
            result
        });

        Ok(RunHandle { run_id, handle })
    }

    /// Decide a ticket and drive the resumption to its next settle point.
    ///
    /// This is the approval channel's entry point; the resolution is also
    /// published to the resolution loop, which ignores runs already handled.
    pub async fn resolve(
        self: &Arc<Self>,
        ticket_id: &str,
        decision: Decision,
        actor: &str,
        notes: Option<String>,
    ) -> Result<PipelineRun> {
        let ticket = self
            .approvals
            .resolve(ticket_id, decision, actor, notes)
            .await?;
        self.resume_run(ticket).await
    }

    /// Resume a suspended run for a decided ticket
    pub async fn resume_run(self: &Arc<Self>, ticket: ApprovalTicket) -> Result<PipelineRun> {
        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .context("concurrency limiter closed")?;

        let cancel = CancellationToken::new();
        self.track_cancel(ticket.run_id, cancel.clone()).await;

        let result = self
            .orchestrator
            .resume(&self.graph, &ticket, cancel)
            .await;

        self.untrack_cancel(ticket.run_id).await;
        result
    }

    /// Consume ticket resolutions and resume their runs.
    ///
    /// Runs until the approval service is dropped. Each resumption executes
    /// on its own task so a slow run does not block later decisions.
    pub async fn run_resolution_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Resolution>) {
        while let Some(resolution) = rx.recv().await {
            let supervisor = self.clone();
            tokio::spawn(async move {
                let ticket_id = resolution.ticket.id.clone();
                match supervisor.resume_run(resolution.ticket).await {
                    Ok(run) => {
                        info!(%ticket_id, run_id = %run.id, status = ?run.status, "Resumption settled")
                    }
                    Err(e) => error!(%ticket_id, error = %e, "Resumption failed"),
                }
            });
        }
    }

    /// Cancel a RUNNING run: no new stage invocations are issued, in-flight
    /// remote tasks are left to finish on their own.
    pub async fn cancel(&self, run_id: Uuid) -> Result<()> {
        let cancels = self.cancels.lock().await;
        match cancels.get(&run_id) {
            Some(token) => {
                info!(%run_id, "Cancelling run");
                token.cancel();
                Ok(())
            }
            None => anyhow::bail!("Run {} is not actively executing", run_id),
        }
    }

    /// Recover state after a process restart.
    ///
    /// Expires overdue tickets, re-attaches suspended runs to their pending
    /// tickets, settles runs whose tickets were decided while the process was
    /// down, and applies the orphan policy to stale RUNNING runs.
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        if let Some(ttl) = self.config.approval_ttl {
            self.approvals.expire_overdue(ttl).await?;
        }

        let open = self
            .store
            .runs_with_status(&[RunStatus::Running, RunStatus::Suspended])
            .await?;

        for run in open {
            match run.status {
                RunStatus::Suspended => {
                    let decided = match &run.suspension {
                        Some(suspension) => self
                            .approvals
                            .get(&suspension.ticket_id)
                            .await
                            .filter(|t| !t.is_pending()),
                        None => None,
                    };

                    match decided {
                        Some(ticket) => {
                            // Decision arrived while the process was down
                            info!(run_id = %run.id, ticket_id = %ticket.id, "Applying offline decision");
                            match self.resume_run(ticket).await {
                                Ok(_) => report.decided_offline += 1,
                                Err(e) => error!(run_id = %run.id, error = %e, "Offline resumption failed"),
                            }
                        }
                        None => {
                            if self.approvals.pending_for_run(run.id).await.is_none() {
                                warn!(run_id = %run.id, "Suspended run has no open ticket");
                            }
                            report.reattached += 1;
                        }
                    }
                }
                RunStatus::Running => {
                    let age = Utc::now()
                        .signed_duration_since(run.updated_at)
                        .to_std()
                        .unwrap_or_default();

                    if age < self.config.liveness_threshold {
                        report.in_flight += 1;
                        continue;
                    }

                    match self.config.orphan_policy {
                        OrphanPolicy::Fail => {
                            warn!(run_id = %run.id, "Failing orphaned run");
                            self.orchestrator.fail_orphaned(&run).await?;
                            report.orphaned += 1;
                        }
                        OrphanPolicy::Resume => {
                            // Claim may have been released by a racing writer
                            let key = run.work_item.to_string();
                            if self.ledger.try_acquire(&key, run.id).await.is_err() {
                                warn!(run_id = %run.id, "Claim held elsewhere, skipping orphan resume");
                                continue;
                            }

                            info!(run_id = %run.id, "Resuming orphaned run");
                            let cancel = CancellationToken::new();
                            self.track_cancel(run.id, cancel.clone()).await;
                            let result = self
                                .orchestrator
                                .continue_run(&self.graph, run.id, cancel)
                                .await;
                            self.untrack_cancel(run.id).await;

                            match result {
                                Ok(_) => report.resumed += 1,
                                Err(e) => error!(run_id = %run.id, error = %e, "Orphan resume failed"),
                            }
                        }
                    }
                }
                RunStatus::Completed | RunStatus::Failed => {}
            }
        }

        info!(?report, "Recovery pass finished");
        Ok(report)
    }

    /// Open tickets, oldest first (the approval channel's listing)
    pub async fn pending_approvals(&self) -> Vec<ApprovalTicket> {
        self.approvals.list_pending().await
    }

    async fn track_cancel(&self, run_id: Uuid, token: CancellationToken) {
        self.cancels.lock().await.insert(run_id, token);
    }

    async fn untrack_cancel(&self, run_id: Uuid) {
        self.cancels.lock().await.remove(&run_id);
    }
}
