//! Domain types for the filament orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of run state changes
//! - PipelineRun: Run state reconstructed from events
//! - WorkItem: Units of pipeline input
//! - ApprovalTicket: Pending human decisions

pub mod events;
pub mod run;
pub mod ticket;
pub mod work_item;

// Re-export commonly used types
pub use events::{Event, EventType};
pub use run::{PipelineRun, RunFailure, RunStatus, StageResult, StageStatus, Suspension};
pub use ticket::{ApprovalTicket, Decision};
pub use work_item::{digest_value, WorkItem, WorkItemKey};
