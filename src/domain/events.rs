//! Event types for the event-sourced orchestrator.
//!
//! All run state changes are recorded as immutable events in an append-only
//! log; the current state of any run is reconstructed by replaying its events
//! in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_item::WorkItemKey;

/// A single event in a run's append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage name (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (no payloads, no secrets)
    pub detail: String,

    /// Work item key (set on RunStarted only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_item: Option<WorkItemKey>,

    /// Attempt count at the time of the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Time taken in milliseconds (for completed stages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Error class if failed (taxonomy name, e.g. "executor_timeout")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,

    /// Ledger reference for the stage result (set on completion/skip)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,

    /// Approval ticket id (set on suspension/resumption)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage: Option<String>,
        event_type: EventType,
        detail: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            detail,
            work_item: None,
            attempts: None,
            duration_ms: None,
            error: None,
            error_class: None,
            result_ref: None,
            ticket_id: None,
        }
    }

    pub fn with_work_item(mut self, key: WorkItemKey) -> Self {
        self.work_item = Some(key);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, class: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self.error = Some(message.into());
        self
    }

    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    pub fn with_ticket(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = Some(ticket_id.into());
        self
    }
}

/// Types of events that can occur during run execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run was suspended pending an approval decision
    RunSuspended,

    /// A suspended run was resumed after a decision
    RunResumed,

    /// A run completed (including rejection outcomes)
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A stage invocation started (one event per attempt)
    StageStarted,

    /// A stage completed successfully
    StageCompleted,

    /// A stage was skipped (ledger hit or unmet gate)
    StageSkipped,

    /// A stage attempt failed and will be retried
    StageRetrying,

    /// A stage failed permanently
    StageFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("analyze".to_string()),
            EventType::StageCompleted,
            "Stage 'analyze' completed".to_string(),
        )
        .with_attempts(2)
        .with_duration(1500)
        .with_result_ref("run:analyze:abcd1234");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StageCompleted);
        assert_eq!(parsed.attempts, Some(2));
        assert_eq!(parsed.duration_ms, Some(1500));
        assert_eq!(parsed.result_ref.as_deref(), Some("run:analyze:abcd1234"));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = Event::new(
            Uuid::new_v4(),
            None,
            EventType::RunCompleted,
            "Run completed".to_string(),
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("error_class"));
        assert!(!json.contains("ticket_id"));
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::new(
            Uuid::new_v4(),
            Some("trade".to_string()),
            EventType::StageFailed,
            "Stage 'trade' failed".to_string(),
        )
        .with_error("executor_rejected", "insufficient funds");

        assert_eq!(event.error_class.as_deref(), Some("executor_rejected"));
        assert_eq!(event.error.as_deref(), Some("insufficient funds"));
    }
}
