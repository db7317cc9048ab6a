//! filament - durable pipeline orchestrator for regulatory-filing workflows
//!
//! Turns a raw event ("new regulatory filing for a company") into a vetted,
//! human-approved action by coordinating remote task executors.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All run state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Suspended and interrupted runs resume from persisted state, even
//!   across process restarts
//!
//! The work ledger records completed (work item, stage) pairs so duplicate
//! submissions skip finished work, and holds the single-active-run claim per
//! work item. Approval-gated stages suspend their run behind a ticket; an
//! external decision resumes it.
//!
//! # Modules
//!
//! - `protocol`: Executor invocation (JSON-RPC submit/poll)
//! - `core`: Orchestration logic (Orchestrator, WorkLedger, ApprovalService,
//!   RunSupervisor)
//! - `domain`: Data structures (Event, PipelineRun, WorkItem, ApprovalTicket)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a work item
//! filament submit BHP:2024-FY-results --payload filing.json
//!
//! # List open approvals and decide one
//! filament pending
//! filament resolve tkt-1a2b3c4d5e6f --approve --actor analyst1
//!
//! # Recover after a restart
//! filament recover
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod protocol;

// Re-export main types at crate root for convenience
pub use crate::core::{
    ApprovalService, Orchestrator, RetryPolicy, RunStore, RunSupervisor, StageGraph, WorkLedger,
};
pub use crate::domain::{
    ApprovalTicket, Decision, Event, EventType, PipelineRun, RunStatus, StageResult, StageStatus,
    WorkItem, WorkItemKey,
};
pub use crate::protocol::{Executor, ProtocolClient, ProtocolError};
