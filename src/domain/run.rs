//! Run state and reconstruction from events.
//!
//! A PipelineRun is one execution attempt of all stages for one work item.
//! Runs are never stored directly; their state is derived by replaying the
//! run's event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};
use super::work_item::WorkItemKey;

/// One execution attempt of the pipeline for one work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Identity key of the work item being processed
    pub work_item: WorkItemKey,

    /// Current status of the run
    pub status: RunStatus,

    /// Results of stages executed so far (append-only)
    pub stage_results: Vec<StageResult>,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// Timestamp of the most recent event
    pub updated_at: DateTime<Utc>,

    /// Suspension point while SUSPENDED
    pub suspension: Option<Suspension>,

    /// Cause of failure while FAILED
    pub failure: Option<RunFailure>,
}

/// Status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Actively executing stages
    Running,

    /// Awaiting an approval decision; no task is held
    Suspended,

    /// Finished (including "no action taken" rejection outcomes)
    Completed,

    /// Failed with a recorded stage and error class
    Failed,
}

/// Where a suspended run stopped, and the ticket gating it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    /// The approval-gated stage that has not yet executed
    pub stage: String,

    /// The open ticket's id
    pub ticket_id: String,
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stage that triggered the failure (None for run-level causes)
    pub stage: Option<String>,

    /// Error class from the taxonomy (e.g. "executor_rejected", "cancelled")
    pub class: String,

    /// Error message
    pub message: String,
}

/// Result of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub stage: String,

    /// Outcome of the stage
    pub status: StageStatus,

    /// Number of invocation attempts (0 for skipped stages)
    pub attempts: u32,

    /// Ledger reference to the result payload, when one exists
    pub result_ref: Option<String>,

    /// Last error message, if any
    pub error: Option<String>,

    /// Error class, if any
    pub error_class: Option<String>,

    /// Human-readable note (e.g. skip reason)
    pub detail: String,
}

/// Outcome of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Executor completed and the result was recorded
    Success,

    /// Stage failed permanently
    Failed,

    /// Stage was not invoked (duplicate, unmet gate, or rejection)
    Skipped,
}

impl PipelineRun {
    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let work_item = first.work_item.clone()?;

        let mut run = Self {
            id: first.run_id,
            work_item,
            status: RunStatus::Running,
            stage_results: Vec::new(),
            created_at: first.timestamp,
            updated_at: first.timestamp,
            suspension: None,
            failure: None,
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        self.updated_at = event.timestamp;

        match event.event_type {
            EventType::RunStarted => {
                self.status = RunStatus::Running;
                self.created_at = event.timestamp;
            }
            EventType::RunSuspended => {
                self.status = RunStatus::Suspended;
                if let (Some(stage), Some(ticket_id)) = (&event.stage, &event.ticket_id) {
                    self.suspension = Some(Suspension {
                        stage: stage.clone(),
                        ticket_id: ticket_id.clone(),
                    });
                }
            }
            EventType::RunResumed => {
                self.status = RunStatus::Running;
                self.suspension = None;
            }
            EventType::RunCompleted => {
                self.status = RunStatus::Completed;
                self.suspension = None;
            }
            EventType::RunFailed => {
                self.status = RunStatus::Failed;
                self.suspension = None;
                self.failure = Some(RunFailure {
                    stage: event.stage.clone(),
                    class: event
                        .error_class
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    message: event.error.clone().unwrap_or_default(),
                });
            }
            EventType::StageCompleted => {
                if let Some(stage) = &event.stage {
                    self.stage_results.push(StageResult {
                        stage: stage.clone(),
                        status: StageStatus::Success,
                        attempts: event.attempts.unwrap_or(1),
                        result_ref: event.result_ref.clone(),
                        error: None,
                        error_class: None,
                        detail: event.detail.clone(),
                    });
                }
            }
            EventType::StageSkipped => {
                if let Some(stage) = &event.stage {
                    self.stage_results.push(StageResult {
                        stage: stage.clone(),
                        status: StageStatus::Skipped,
                        attempts: 0,
                        result_ref: event.result_ref.clone(),
                        error: None,
                        error_class: None,
                        detail: event.detail.clone(),
                    });
                }
            }
            EventType::StageFailed => {
                if let Some(stage) = &event.stage {
                    self.stage_results.push(StageResult {
                        stage: stage.clone(),
                        status: StageStatus::Failed,
                        attempts: event.attempts.unwrap_or(1),
                        result_ref: None,
                        error: event.error.clone(),
                        error_class: event.error_class.clone(),
                        detail: event.detail.clone(),
                    });
                }
            }
            // Attempt-level events carry no durable state of their own
            EventType::StageStarted | EventType::StageRetrying => {}
        }
    }

    /// Latest result for a stage, if the run has one
    pub fn result_for(&self, stage: &str) -> Option<&StageResult> {
        self.stage_results.iter().rev().find(|r| r.stage == stage)
    }

    /// Check whether a stage has a SUCCESS or SKIPPED result in this run
    pub fn stage_settled(&self, stage: &str) -> bool {
        matches!(
            self.result_for(stage).map(|r| r.status),
            Some(StageStatus::Success) | Some(StageStatus::Skipped)
        )
    }

    /// Check if the run is in a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: Uuid) -> Event {
        Event::new(
            run_id,
            None,
            EventType::RunStarted,
            "Run started".to_string(),
        )
        .with_work_item(WorkItemKey::new("BHP", "doc-1"))
    }

    #[test]
    fn test_run_from_events_completed() {
        let run_id = Uuid::new_v4();
        let events = vec![
            started(run_id),
            Event::new(
                run_id,
                Some("acquire".to_string()),
                EventType::StageCompleted,
                "Stage 'acquire' completed".to_string(),
            )
            .with_attempts(1)
            .with_result_ref("ref-1"),
            Event::new(
                run_id,
                None,
                EventType::RunCompleted,
                "Run completed".to_string(),
            ),
        ];

        let run = PipelineRun::from_events(&events).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.work_item, WorkItemKey::new("BHP", "doc-1"));
        assert!(run.stage_settled("acquire"));
        assert_eq!(run.result_for("acquire").unwrap().attempts, 1);
    }

    #[test]
    fn test_run_suspension_point() {
        let run_id = Uuid::new_v4();
        let events = vec![
            started(run_id),
            Event::new(
                run_id,
                Some("trade".to_string()),
                EventType::RunSuspended,
                "Awaiting approval".to_string(),
            )
            .with_ticket("tkt-abc"),
        ];

        let run = PipelineRun::from_events(&events).unwrap();
        assert_eq!(run.status, RunStatus::Suspended);
        let suspension = run.suspension.unwrap();
        assert_eq!(suspension.stage, "trade");
        assert_eq!(suspension.ticket_id, "tkt-abc");
    }

    #[test]
    fn test_run_failure_carries_stage_and_class() {
        let run_id = Uuid::new_v4();
        let events = vec![
            started(run_id),
            Event::new(
                run_id,
                Some("analyze".to_string()),
                EventType::StageFailed,
                "Stage 'analyze' failed".to_string(),
            )
            .with_attempts(1)
            .with_error("executor_rejected", "malformed document"),
            Event::new(
                run_id,
                Some("analyze".to_string()),
                EventType::RunFailed,
                "Run failed".to_string(),
            )
            .with_error("executor_rejected", "malformed document"),
        ];

        let run = PipelineRun::from_events(&events).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let failure = run.failure.unwrap();
        assert_eq!(failure.stage.as_deref(), Some("analyze"));
        assert_eq!(failure.class, "executor_rejected");
    }

    #[test]
    fn test_result_for_uses_latest() {
        let run_id = Uuid::new_v4();
        let events = vec![
            started(run_id),
            Event::new(
                run_id,
                Some("acquire".to_string()),
                EventType::StageCompleted,
                "first".to_string(),
            )
            .with_result_ref("ref-old"),
            Event::new(
                run_id,
                Some("acquire".to_string()),
                EventType::StageSkipped,
                "second".to_string(),
            )
            .with_result_ref("ref-new"),
        ];

        let run = PipelineRun::from_events(&events).unwrap();
        let latest = run.result_for("acquire").unwrap();
        assert_eq!(latest.status, StageStatus::Skipped);
        assert_eq!(latest.result_ref.as_deref(), Some("ref-new"));
    }

    #[test]
    fn test_from_events_requires_work_item() {
        let run_id = Uuid::new_v4();
        let events = vec![Event::new(
            run_id,
            None,
            EventType::RunStarted,
            "Run started".to_string(),
        )];

        // RunStarted without a work item key cannot be reconstructed
        assert!(PipelineRun::from_events(&events).is_none());
    }
}
