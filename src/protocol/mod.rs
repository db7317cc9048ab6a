//! Executor invocation protocol.
//!
//! This module contains:
//! - Messages: JSON-RPC wire types for submit/poll
//! - Client: the polling protocol client and the `Executor` trait seam

pub mod client;
pub mod messages;

// Re-export commonly used types
pub use client::{
    Executor, HttpExecutor, PollPolicy, ProtocolClient, ProtocolError, StageOutcome,
    TaskTransition,
};
pub use messages::{ExecutorFault, TaskRequest, TaskState, TaskStatus};
