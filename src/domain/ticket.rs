//! Approval tickets: durable records of pending human decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pending or decided human sign-off gating a run's continuation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    /// Unique ticket id, used as the external reference (`tkt-<hex12>`)
    pub id: String,

    /// The suspended run this ticket gates
    pub run_id: Uuid,

    /// The approval-gated stage awaiting the decision
    pub stage: String,

    /// Proposed action payload shown to the approver
    pub proposed_action: serde_json::Value,

    /// Current decision state
    pub decision: Decision,

    /// When the ticket was created
    pub created_at: DateTime<Utc>,

    /// When the decision was made (terminal tickets only)
    pub decided_at: Option<DateTime<Utc>>,

    /// Who decided (terminal tickets only)
    pub decided_by: Option<String>,

    /// Optional free-text notes from the decision
    pub notes: Option<String>,
}

/// Decision state of a ticket; PENDING → {APPROVED, REJECTED}, both terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalTicket {
    /// Create a new pending ticket
    pub fn new(run_id: Uuid, stage: impl Into<String>, proposed_action: serde_json::Value) -> Self {
        Self {
            id: generate_ticket_id(),
            run_id,
            stage: stage.into(),
            proposed_action,
            decision: Decision::Pending,
            created_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            notes: None,
        }
    }

    /// Check whether the ticket is still open
    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }
}

/// Generate a ticket id (`tkt-` + 12 hex chars)
fn generate_ticket_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("tkt-{}", &uuid[..12])
}
