//! Main orchestrator for pipeline execution.
//!
//! Drives a run through its stage groups: ledger-backed deduplication,
//! retry handling, parallel group barriers, and suspend/resume around
//! approval-gated stages. A run-level failure is a valid outcome (the run is
//! returned in FAILED state); an `Err` from these methods means the
//! orchestrator itself could not make progress (storage faults and the like).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    ApprovalTicket, Decision, Event, EventType, PipelineRun, RunStatus, StageStatus, WorkItem,
    WorkItemKey,
};
use crate::protocol::{Executor, ProtocolClient, TaskRequest};

use super::approvals::{ApprovalError, ApprovalService};
use super::ledger::WorkLedger;
use super::retry::RetryPolicy;
use super::run_store::{parse_result_ref, result_ref, RunStore};
use super::stages::{FailurePolicy, InputSource, StageDef, StageGraph};

/// Artifact name holding the run's work item (reloaded on resume)
const WORK_ITEM_ARTIFACT: &str = "_work_item";

/// Error class recorded when a run is cancelled
pub const CLASS_CANCELLED: &str = "cancelled";

/// Error class recorded when an orphaned run is failed by recovery
pub const CLASS_ORPHANED: &str = "orphaned_run";

/// Pipeline orchestrator. Cheap to clone; all state lives behind Arcs.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<RunStore>,
    ledger: Arc<WorkLedger>,
    approvals: Arc<ApprovalService>,
    client: ProtocolClient,
    executors: Arc<HashMap<String, Arc<dyn Executor>>>,
    retry: RetryPolicy,
    stage_timeout: Duration,
}

/// Outcome of dispatching one stage
enum StageRun {
    Completed { payload: serde_json::Value },
    Failed { class: String, message: String },
}

impl Orchestrator {
    pub fn new(
        store: Arc<RunStore>,
        ledger: Arc<WorkLedger>,
        approvals: Arc<ApprovalService>,
        client: ProtocolClient,
        executors: HashMap<String, Arc<dyn Executor>>,
        retry: RetryPolicy,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            approvals,
            client,
            executors: Arc::new(executors),
            retry,
            stage_timeout,
        }
    }

    /// Execute a fresh run for a work item.
    ///
    /// The caller must already hold the ledger claim for the item's key.
    #[instrument(skip(self, graph, item, cancel), fields(run_id = %run_id, work_item = %item.key))]
    pub async fn execute(
        &self,
        graph: &StageGraph,
        item: &WorkItem,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        info!("Starting run");

        let started = Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("Run started for '{}'", item.key),
        )
        .with_work_item(item.key.clone());
        self.store.append(&started).await?;

        // Persist the work item so a restart can resume with the same input
        let item_json = serde_json::to_value(item).context("Failed to serialize work item")?;
        self.store
            .store_artifact(run_id, WORK_ITEM_ARTIFACT, &item_json)
            .await?;

        let mut payloads = HashMap::new();
        self.run_groups(graph, item, run_id, 0, None, &mut payloads, &cancel)
            .await
    }

    /// Resume a suspended run after its ticket was decided.
    #[instrument(skip(self, graph, ticket, cancel), fields(run_id = %ticket.run_id, ticket_id = %ticket.id))]
    pub async fn resume(
        &self,
        graph: &StageGraph,
        ticket: &ApprovalTicket,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        let run_id = ticket.run_id;
        let run = self
            .store
            .load_run(run_id)
            .await?
            .with_context(|| format!("Run {} not found", run_id))?;

        if run.status != RunStatus::Suspended {
            warn!(status = ?run.status, "Resume requested for a run that is not suspended");
            return Ok(run);
        }

        let suspension = run
            .suspension
            .clone()
            .context("Suspended run has no recorded suspension point")?;
        if suspension.ticket_id != ticket.id {
            anyhow::bail!(
                "Ticket {} does not gate run {} (expected {})",
                ticket.id,
                run_id,
                suspension.ticket_id
            );
        }

        let item = self.load_work_item(run_id).await?;
        let actor = ticket.decided_by.as_deref().unwrap_or("unknown");

        let resumed = Event::new(
            run_id,
            Some(suspension.stage.clone()),
            EventType::RunResumed,
            format!("Resumed after {:?} decision by {}", ticket.decision, actor),
        )
        .with_ticket(ticket.id.clone());
        self.store.append(&resumed).await?;

        match ticket.decision {
            Decision::Approved => {
                info!(stage = %suspension.stage, "Decision approved, continuing run");
                let from_group = graph
                    .group_of(&suspension.stage)
                    .with_context(|| format!("Stage '{}' not in graph", suspension.stage))?;

                let mut payloads = self.rebuild_payloads(&run).await?;
                self.run_groups(
                    graph,
                    &item,
                    run_id,
                    from_group,
                    Some(&suspension.stage),
                    &mut payloads,
                    &cancel,
                )
                .await
            }
            Decision::Rejected => {
                info!(stage = %suspension.stage, "Decision rejected, completing run with no action");
                let skipped = Event::new(
                    run_id,
                    Some(suspension.stage.clone()),
                    EventType::StageSkipped,
                    format!("No action taken: rejected by {}", actor),
                );
                self.store.append(&skipped).await?;
                self.complete_run(run_id, &item.key).await
            }
            Decision::Pending => anyhow::bail!("Ticket {} is still pending", ticket.id),
        }
    }

    /// Re-enter an interrupted RUNNING run from its persisted state.
    ///
    /// Used by recovery for orphaned runs: the graph is walked from the top
    /// and the ledger skips everything that already completed, so execution
    /// picks up at the first unfinished stage.
    #[instrument(skip(self, graph, cancel), fields(run_id = %run_id))]
    pub async fn continue_run(
        &self,
        graph: &StageGraph,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        let run = self.run_status(run_id).await?;
        if run.is_finished() {
            return Ok(run);
        }

        info!("Continuing interrupted run");
        let item = self.load_work_item(run_id).await?;
        let mut payloads = self.rebuild_payloads(&run).await?;
        self.run_groups(graph, &item, run_id, 0, None, &mut payloads, &cancel)
            .await
    }

    /// Fail an interrupted run that recovery classified as orphaned
    pub async fn fail_orphaned(&self, run: &PipelineRun) -> Result<PipelineRun> {
        self.fail_run(
            run.id,
            &run.work_item,
            None,
            CLASS_ORPHANED,
            "run orphaned by process restart",
        )
        .await
    }

    /// Reconstruct a run's current state
    pub async fn run_status(&self, run_id: Uuid) -> Result<PipelineRun> {
        self.store
            .load_run(run_id)
            .await?
            .with_context(|| format!("Run {} not found", run_id))
    }

    /// Load the persisted work item for a run
    pub async fn load_work_item(&self, run_id: Uuid) -> Result<WorkItem> {
        let value = self
            .store
            .load_artifact(run_id, WORK_ITEM_ARTIFACT)
            .await?
            .with_context(|| format!("Run {} has no persisted work item", run_id))?;
        serde_json::from_value(value).context("Failed to parse persisted work item")
    }

    /// Execute stage groups starting at `from_group`.
    ///
    /// `approved_stage` names an approval-gated stage whose ticket has been
    /// approved, letting it pass the gate exactly once.
    #[allow(clippy::too_many_arguments)]
    async fn run_groups(
        &self,
        graph: &StageGraph,
        item: &WorkItem,
        run_id: Uuid,
        from_group: usize,
        approved_stage: Option<&str>,
        payloads: &mut HashMap<String, serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun> {
        let key = item.key.to_string();

        for group in graph.groups.iter().skip(from_group) {
            if cancel.is_cancelled() {
                return self
                    .fail_run(run_id, &item.key, None, CLASS_CANCELLED, "run cancelled by operator")
                    .await;
            }

            // Settle ledger hits and unmet gates before dispatching anything
            let mut to_run: Vec<(StageDef, serde_json::Value)> = Vec::new();

            for stage in &group.stages {
                if self.ledger.has_completed(&key, &stage.name).await {
                    let reference = self.ledger.completion_ref(&key, &stage.name).await;
                    debug!(stage = %stage.name, "Stage already completed, skipping");

                    let mut skipped = Event::new(
                        run_id,
                        Some(stage.name.clone()),
                        EventType::StageSkipped,
                        format!("Stage '{}' already completed for '{}'", stage.name, key),
                    );
                    if let Some(reference) = &reference {
                        skipped = skipped.with_result_ref(reference.clone());
                    }
                    self.store.append(&skipped).await?;

                    if let Some(reference) = reference {
                        if let Some(payload) = self.load_ref_payload(&reference).await? {
                            payloads.insert(stage.name.clone(), payload);
                        }
                    }
                    continue;
                }

                if let Some(condition) = &stage.run_if {
                    let met = payloads
                        .get(&condition.stage)
                        .map(|p| condition.matches(p))
                        .unwrap_or(false);
                    if !met {
                        info!(stage = %stage.name, gate = %condition.stage, "Gate not met, skipping stage");
                        let skipped = Event::new(
                            run_id,
                            Some(stage.name.clone()),
                            EventType::StageSkipped,
                            format!(
                                "Stage '{}' skipped: no {} signal from '{}'",
                                stage.name, condition.field, condition.stage
                            ),
                        );
                        self.store.append(&skipped).await?;
                        continue;
                    }
                }

                let input = assemble_input(item, payloads, stage)?;

                if stage.requires_approval && approved_stage != Some(stage.name.as_str()) {
                    return self.suspend_run(run_id, &item.key, stage, input).await;
                }

                to_run.push((stage.clone(), input));
            }

            // Dispatch the remainder: inline for one stage, barrier for many
            let results: Vec<(String, StageRun)> = match to_run.len() {
                0 => Vec::new(),
                1 => {
                    let (stage, input) = to_run.pop().ok_or_else(|| anyhow::anyhow!("empty group"))?;
                    let name = stage.name.clone();
                    let outcome = self
                        .run_stage(run_id, &item.key, &stage, input, cancel)
                        .await?;
                    vec![(name, outcome)]
                }
                _ => {
                    let mut join_set = JoinSet::new();
                    for (stage, input) in to_run {
                        let orchestrator = self.clone();
                        let item_key = item.key.clone();
                        let cancel = cancel.clone();
                        join_set.spawn(async move {
                            let name = stage.name.clone();
                            let outcome = orchestrator
                                .run_stage(run_id, &item_key, &stage, input, &cancel)
                                .await;
                            (name, outcome)
                        });
                    }

                    let mut collected = Vec::new();
                    while let Some(joined) = join_set.join_next().await {
                        let (name, outcome) = joined.context("Stage task panicked")?;
                        collected.push((name, outcome?));
                    }
                    collected
                }
            };

            let mut failures: Vec<(String, String, String)> = Vec::new();
            for (name, outcome) in results {
                match outcome {
                    StageRun::Completed { payload } => {
                        payloads.insert(name, payload);
                    }
                    StageRun::Failed { class, message } => {
                        failures.push((name, class, message));
                    }
                }
            }

            if let Some((stage, class, message)) = failures.into_iter().next() {
                match group.on_failure {
                    FailurePolicy::Strict => {
                        return self
                            .fail_run(run_id, &item.key, Some(stage), &class, &message)
                            .await;
                    }
                    FailurePolicy::BestEffort => {
                        warn!(stage = %stage, class = %class, "Group member failed, continuing best-effort");
                    }
                }
            }
        }

        self.complete_run(run_id, &item.key).await
    }

    /// Invoke one stage with retry, recording events, artifact, and ledger
    /// completion. Failures are returned as data, not errors.
    async fn run_stage(
        &self,
        run_id: Uuid,
        item_key: &WorkItemKey,
        stage: &StageDef,
        input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<StageRun> {
        let executor = match self.executors.get(&stage.executor) {
            Some(executor) => executor.clone(),
            None => {
                let message = format!("no executor configured for '{}'", stage.executor);
                let failed = Event::new(
                    run_id,
                    Some(stage.name.clone()),
                    EventType::StageFailed,
                    format!("Stage '{}' failed: {}", stage.name, message),
                )
                .with_error("unknown_executor", message.clone());
                self.store.append(&failed).await?;
                return Ok(StageRun::Failed {
                    class: "unknown_executor".to_string(),
                    message,
                });
            }
        };

        let retry = stage.retry.as_ref().unwrap_or(&self.retry);
        let timeout = stage.timeout(self.stage_timeout);
        let key = item_key.to_string();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(StageRun::Failed {
                    class: CLASS_CANCELLED.to_string(),
                    message: "run cancelled by operator".to_string(),
                });
            }

            attempt += 1;

            let started = Event::new(
                run_id,
                Some(stage.name.clone()),
                EventType::StageStarted,
                format!("Stage '{}' attempt {}", stage.name, attempt),
            )
            .with_attempts(attempt);
            self.store.append(&started).await?;

            let request = TaskRequest {
                stage: stage.name.clone(),
                work_item: item_key.clone(),
                payload: input.clone(),
            };

            match self.client.invoke(executor.as_ref(), request, timeout).await {
                Ok(outcome) => {
                    self.store
                        .store_artifact(run_id, &stage.name, &outcome.payload)
                        .await?;
                    let reference = result_ref(run_id, &stage.name, &outcome.payload);

                    let completed = Event::new(
                        run_id,
                        Some(stage.name.clone()),
                        EventType::StageCompleted,
                        format!(
                            "Stage '{}' completed in {}ms",
                            stage.name, outcome.duration_ms
                        ),
                    )
                    .with_attempts(attempt)
                    .with_duration(outcome.duration_ms)
                    .with_result_ref(reference.clone());
                    self.store.append(&completed).await?;

                    self.ledger
                        .record_completion(&key, &stage.name, &reference)
                        .await?;

                    return Ok(StageRun::Completed {
                        payload: outcome.payload,
                    });
                }
                Err(e) if retry.should_retry(attempt, &e) => {
                    let delay = retry.delay_for_attempt(attempt);

                    let retrying = Event::new(
                        run_id,
                        Some(stage.name.clone()),
                        EventType::StageRetrying,
                        format!(
                            "Stage '{}' failed, retrying in {:?}: {}",
                            stage.name, delay, e
                        ),
                    )
                    .with_attempts(attempt)
                    .with_error(e.class(), e.to_string());
                    self.store.append(&retrying).await?;

                    warn!(
                        stage = %stage.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage failed, retrying"
                    );

                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let failed = Event::new(
                        run_id,
                        Some(stage.name.clone()),
                        EventType::StageFailed,
                        format!(
                            "Stage '{}' failed after {} attempt(s): {}",
                            stage.name, attempt, e
                        ),
                    )
                    .with_attempts(attempt)
                    .with_error(e.class(), e.to_string());
                    self.store.append(&failed).await?;

                    error!(stage = %stage.name, attempt, error = %e, "Stage failed permanently");

                    return Ok(StageRun::Failed {
                        class: e.class().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Create a ticket and suspend the run at an approval-gated stage
    async fn suspend_run(
        &self,
        run_id: Uuid,
        item_key: &WorkItemKey,
        stage: &StageDef,
        proposed_action: serde_json::Value,
    ) -> Result<PipelineRun> {
        let ticket_id = match self
            .approvals
            .create_ticket(run_id, &stage.name, proposed_action)
            .await
        {
            Ok(ticket) => ticket.id,
            // A prior suspension of this run already opened a ticket
            // (recovery re-walked the graph); re-suspend against it.
            Err(ApprovalError::DuplicateTicket { ticket_id, .. }) => ticket_id,
            Err(e) => return Err(e.into()),
        };

        info!(stage = %stage.name, %ticket_id, "Run suspended pending approval");

        let suspended = Event::new(
            run_id,
            Some(stage.name.clone()),
            EventType::RunSuspended,
            format!("Stage '{}' awaiting approval for '{}'", stage.name, item_key),
        )
        .with_ticket(ticket_id);
        self.store.append(&suspended).await?;

        self.run_status(run_id).await
    }

    /// Rebuild the payload map for a resumed run from recorded artifacts
    async fn rebuild_payloads(
        &self,
        run: &PipelineRun,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let mut payloads = HashMap::new();

        // Latest result per stage wins
        let mut refs: HashMap<&str, &str> = HashMap::new();
        for result in &run.stage_results {
            if matches!(result.status, StageStatus::Success | StageStatus::Skipped) {
                if let Some(reference) = &result.result_ref {
                    refs.insert(result.stage.as_str(), reference.as_str());
                }
            }
        }

        for (stage, reference) in refs {
            if let Some(payload) = self.load_ref_payload(reference).await? {
                payloads.insert(stage.to_string(), payload);
            }
        }

        Ok(payloads)
    }

    /// Load a payload through a ledger result reference (possibly another run)
    async fn load_ref_payload(&self, reference: &str) -> Result<Option<serde_json::Value>> {
        match parse_result_ref(reference) {
            Some((ref_run, stage)) => self.store.load_artifact(ref_run, stage).await,
            None => Ok(None),
        }
    }

    /// Mark a run failed, releasing its ledger claim
    async fn fail_run(
        &self,
        run_id: Uuid,
        item_key: &WorkItemKey,
        stage: Option<String>,
        class: &str,
        message: &str,
    ) -> Result<PipelineRun> {
        error!(%run_id, class, %message, "Run failed");

        let failed = Event::new(
            run_id,
            stage,
            EventType::RunFailed,
            format!("Run failed: {}", message),
        )
        .with_error(class, message);
        self.store.append(&failed).await?;

        self.ledger.release(&item_key.to_string(), run_id).await?;
        self.run_status(run_id).await
    }

    /// Mark a run completed, releasing its ledger claim
    async fn complete_run(&self, run_id: Uuid, item_key: &WorkItemKey) -> Result<PipelineRun> {
        info!(%run_id, "Run completed");

        let completed = Event::new(
            run_id,
            None,
            EventType::RunCompleted,
            format!("Run completed for '{}'", item_key),
        );
        self.store.append(&completed).await?;

        self.ledger.release(&item_key.to_string(), run_id).await?;
        self.run_status(run_id).await
    }
}

/// Assemble a stage's input payload from its declared sources
fn assemble_input(
    item: &WorkItem,
    payloads: &HashMap<String, serde_json::Value>,
    stage: &StageDef,
) -> Result<serde_json::Value> {
    let mut input = serde_json::Map::new();

    for source in &stage.inputs {
        match source {
            InputSource::WorkItem(_) => {
                input.insert(
                    "work_item".to_string(),
                    serde_json::json!({
                        "source": item.key.source,
                        "item": item.key.item,
                        "payload": item.payload,
                    }),
                );
            }
            InputSource::Stage { stage: name } => {
                let payload = payloads.get(name).with_context(|| {
                    format!(
                        "Stage '{}' needs the result of '{}', which is unavailable",
                        stage.name, name
                    )
                })?;
                input.insert(name.clone(), payload.clone());
            }
        }
    }

    Ok(serde_json::Value::Object(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stages::WorkItemMarker;

    fn score_stage(inputs: Vec<InputSource>) -> StageDef {
        StageDef {
            name: "score".to_string(),
            executor: "evaluator".to_string(),
            inputs,
            timeout_seconds: None,
            requires_approval: false,
            run_if: None,
            retry: None,
        }
    }

    #[test]
    fn test_assemble_input_shapes() {
        let stage = score_stage(vec![
            InputSource::WorkItem(WorkItemMarker::WorkItem),
            InputSource::Stage {
                stage: "analyze".to_string(),
            },
        ]);

        let item = WorkItem::new(
            WorkItemKey::new("BHP", "doc-1"),
            serde_json::json!({"url": "https://example.com"}),
        );
        let mut payloads = HashMap::new();
        payloads.insert(
            "analyze".to_string(),
            serde_json::json!({"sentiment": "BULLISH"}),
        );

        let input = assemble_input(&item, &payloads, &stage).unwrap();
        assert_eq!(input["work_item"]["source"], "BHP");
        assert_eq!(input["work_item"]["payload"]["url"], "https://example.com");
        assert_eq!(input["analyze"]["sentiment"], "BULLISH");
    }

    #[test]
    fn test_assemble_input_missing_dependency() {
        let stage = score_stage(vec![InputSource::Stage {
            stage: "analyze".to_string(),
        }]);

        let item = WorkItem::new(WorkItemKey::new("BHP", "doc-1"), serde_json::json!({}));
        let payloads = HashMap::new();

        assert!(assemble_input(&item, &payloads, &stage).is_err());
    }

    #[test]
    fn test_assemble_input_empty_sources() {
        let stage = score_stage(Vec::new());
        let item = WorkItem::new(WorkItemKey::new("BHP", "doc-1"), serde_json::json!({}));

        let input = assemble_input(&item, &HashMap::new(), &stage).unwrap();
        assert_eq!(input, serde_json::json!({}));
    }
}
