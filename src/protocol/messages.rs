//! Wire types for the executor invocation protocol.
//!
//! Executors speak JSON-RPC 2.0 over HTTP: a submit request is acknowledged
//! immediately with a task id, and subsequent status queries by task id return
//! the task's state with a result or a typed fault. The orchestrator depends
//! only on this request/ack/poll contract, never on executor semantics.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::WorkItemKey;

/// Method name for submitting a task
pub const METHOD_SUBMIT: &str = "tasks/submit";

/// Method name for querying task status
pub const METHOD_STATUS: &str = "tasks/get";

/// JSON-RPC 2.0 request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
    pub id: String,
}

impl JsonRpcRequest {
    /// Build a request with a fresh id
    pub fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id: Uuid::new_v4().to_string(),
        }
    }
}

/// JSON-RPC 2.0 response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Payload submitted to an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Stage name being executed
    pub stage: String,

    /// Identity of the work item the stage belongs to
    pub work_item: WorkItemKey,

    /// Stage input, opaque to the orchestrator
    pub payload: serde_json::Value,
}

/// Immediate acknowledgment of a submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAck {
    /// Task id assigned by the remote executor
    pub id: String,
}

/// Status of a remote task as reported by its executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,

    /// Result payload (present when state is `completed`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Fault details (present when state is `errored`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutorFault>,
}

/// Poll state of a remote task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not yet picked up
    Submitted,

    /// In progress
    Working,

    /// Finished with a result
    Completed,

    /// Finished with a fault
    Errored,
}

/// Executor-reported fault: a stable class plus a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorFault {
    pub class: String,
    pub message: String,
}
