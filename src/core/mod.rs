//! Core orchestration logic.
//!
//! This module contains:
//! - RunStore: Append-only event logging per run
//! - WorkLedger: Durable deduplication and active-run claims
//! - ApprovalService: Human-in-the-loop decision lifecycle
//! - Stages: Stage graph definitions and loading
//! - Orchestrator: Main execution engine
//! - RunSupervisor: Submission, recovery, and cancellation

pub mod approvals;
pub mod ledger;
pub mod lock;
pub mod orchestrator;
pub mod retry;
pub mod run_store;
pub mod stages;
pub mod supervisor;

// Re-export commonly used types
pub use approvals::{ApprovalError, ApprovalService, Resolution};
pub use ledger::{LedgerError, WorkLedger};
pub use lock::StateLock;
pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use run_store::RunStore;
pub use stages::{default_filing_graph, Condition, FailurePolicy, InputSource, StageDef, StageGraph, StageGroup};
pub use supervisor::{OrphanPolicy, RecoveryReport, RunHandle, RunSupervisor, SupervisorConfig};
