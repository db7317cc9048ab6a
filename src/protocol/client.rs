//! Task protocol client: submit-then-poll invocation of remote executors.
//!
//! The client never blocks on the remote work itself. A submit returns a task
//! id immediately; the client then polls at an exponentially increasing
//! interval until the task reaches a terminal state or the per-stage timeout
//! elapses. The client never retries — retry policy lives in the
//! orchestrator, which accounts for attempts via the transition events this
//! client emits.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::messages::{
    JsonRpcRequest, JsonRpcResponse, SubmitAck, TaskRequest, TaskState, TaskStatus, METHOD_STATUS,
    METHOD_SUBMIT,
};

/// Errors from executor invocation
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The per-stage timeout elapsed before the task finished. The remote
    /// task is not assumed cancelled; a fresh submission is a new task.
    #[error("executor '{executor}' timed out after {timeout_ms}ms (task {task_id:?})")]
    ExecutorTimeout {
        executor: String,
        task_id: Option<String>,
        timeout_ms: u64,
    },

    /// The executor reported a permanent rejection. Never retried.
    #[error("executor '{executor}' rejected the task ({class}): {message}")]
    ExecutorRejected {
        executor: String,
        class: String,
        message: String,
    },

    /// Transport-level failure reaching the executor. Retryable.
    #[error("transport error talking to executor '{executor}': {message}")]
    Transport { executor: String, message: String },

    /// The executor's response violated the protocol contract. Never retried.
    #[error("malformed response from executor '{executor}': {detail}")]
    Malformed { executor: String, detail: String },
}

impl ProtocolError {
    /// Whether the orchestrator's retry policy may retry this failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExecutorTimeout { .. } | Self::Transport { .. }
        )
    }

    /// Stable class name for event logs and run failure records
    pub fn class(&self) -> &'static str {
        match self {
            Self::ExecutorTimeout { .. } => "executor_timeout",
            Self::ExecutorRejected { .. } => "executor_rejected",
            Self::Transport { .. } => "transient_network_error",
            Self::Malformed { .. } => "malformed_response",
        }
    }
}

/// One stage invocation's successful outcome
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Result payload reported by the executor
    pub payload: serde_json::Value,

    /// Remote task id that produced the result
    pub task_id: String,

    /// Number of status polls issued
    pub polls: u32,

    /// Wall-clock duration of the invocation
    pub duration_ms: u64,
}

/// Observable protocol transitions, emitted for retry accounting
#[derive(Debug, Clone)]
pub enum TaskTransition {
    Submitted {
        executor: String,
        stage: String,
        task_id: String,
    },
    Polled {
        executor: String,
        stage: String,
        task_id: String,
        state: TaskState,
    },
    Completed {
        executor: String,
        stage: String,
        task_id: String,
    },
    Errored {
        executor: String,
        stage: String,
        task_id: String,
        class: String,
    },
    TimedOut {
        executor: String,
        stage: String,
        task_id: Option<String>,
    },
}

/// A remote executor endpoint, independent of transport.
///
/// The HTTP client below is the production implementation; tests substitute
/// in-process executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor identity (matches the stage definition's `executor` field)
    fn name(&self) -> &str;

    /// Submit a task; returns the remote task id immediately
    async fn submit(&self, request: &TaskRequest) -> Result<String, ProtocolError>;

    /// Query the status of a previously submitted task
    async fn poll(&self, task_id: &str) -> Result<TaskStatus, ProtocolError>;
}

/// Poll interval policy: exponentially increasing from a base up to a cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Initial poll interval in milliseconds
    #[serde(default = "default_base_interval")]
    pub base_interval_ms: u64,

    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Interval multiplier applied after each poll
    #[serde(default = "default_poll_multiplier")]
    pub multiplier: f64,
}

fn default_base_interval() -> u64 {
    500
}
fn default_max_interval() -> u64 {
    10_000
}
fn default_poll_multiplier() -> f64 {
    2.0
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval(),
            max_interval_ms: default_max_interval(),
            multiplier: default_poll_multiplier(),
        }
    }
}

impl PollPolicy {
    /// Interval before the nth poll (0-indexed)
    pub fn interval(&self, poll: u32) -> Duration {
        let ms = self.base_interval_ms as f64 * self.multiplier.powi(poll as i32);
        Duration::from_millis(ms.min(self.max_interval_ms as f64) as u64)
    }
}

/// Protocol client wrapping an executor with poll/timeout handling
#[derive(Clone)]
pub struct ProtocolClient {
    poll_policy: PollPolicy,
    transitions: Option<mpsc::UnboundedSender<TaskTransition>>,
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new(PollPolicy::default())
    }
}

impl ProtocolClient {
    /// Create a client with the given poll policy
    pub fn new(poll_policy: PollPolicy) -> Self {
        Self {
            poll_policy,
            transitions: None,
        }
    }

    /// Attach a transition channel for retry accounting
    pub fn with_transitions(mut self, sender: mpsc::UnboundedSender<TaskTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    fn emit(&self, transition: TaskTransition) {
        if let Some(sender) = &self.transitions {
            // Receiver may have gone away; transitions are advisory
            let _ = sender.send(transition);
        }
    }

    /// Invoke an executor and wait for its result.
    ///
    /// Submits the request, then polls until COMPLETED, ERRORED, or the
    /// timeout elapses. A timed-out task id is never polled again.
    pub async fn invoke(
        &self,
        executor: &dyn Executor,
        request: TaskRequest,
        timeout: Duration,
    ) -> Result<StageOutcome, ProtocolError> {
        let started = Instant::now();
        let deadline = started + timeout;

        let task_id = executor.submit(&request).await?;
        debug!(executor = executor.name(), stage = %request.stage, %task_id, "Task submitted");
        self.emit(TaskTransition::Submitted {
            executor: executor.name().to_string(),
            stage: request.stage.clone(),
            task_id: task_id.clone(),
        });

        let mut polls = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    executor = executor.name(),
                    stage = %request.stage,
                    %task_id,
                    "Task timed out while polling"
                );
                self.emit(TaskTransition::TimedOut {
                    executor: executor.name().to_string(),
                    stage: request.stage.clone(),
                    task_id: Some(task_id.clone()),
                });
                return Err(ProtocolError::ExecutorTimeout {
                    executor: executor.name().to_string(),
                    task_id: Some(task_id),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let wait = self.poll_policy.interval(polls).min(deadline - now);
            tokio::time::sleep(wait).await;

            if Instant::now() >= deadline {
                continue; // fall through to the timeout branch above
            }

            let status = executor.poll(&task_id).await?;
            polls += 1;
            self.emit(TaskTransition::Polled {
                executor: executor.name().to_string(),
                stage: request.stage.clone(),
                task_id: task_id.clone(),
                state: status.state,
            });

            match status.state {
                TaskState::Completed => {
                    let payload = status.result.ok_or_else(|| ProtocolError::Malformed {
                        executor: executor.name().to_string(),
                        detail: "completed task carried no result".to_string(),
                    })?;
                    self.emit(TaskTransition::Completed {
                        executor: executor.name().to_string(),
                        stage: request.stage.clone(),
                        task_id: task_id.clone(),
                    });
                    return Ok(StageOutcome {
                        payload,
                        task_id,
                        polls,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                TaskState::Errored => {
                    let fault = status.error.unwrap_or_else(|| {
                        super::messages::ExecutorFault {
                            class: "unknown".to_string(),
                            message: "executor reported an error without details".to_string(),
                        }
                    });
                    self.emit(TaskTransition::Errored {
                        executor: executor.name().to_string(),
                        stage: request.stage.clone(),
                        task_id: task_id.clone(),
                        class: fault.class.clone(),
                    });
                    return Err(ProtocolError::ExecutorRejected {
                        executor: executor.name().to_string(),
                        class: fault.class,
                        message: fault.message,
                    });
                }
                TaskState::Submitted | TaskState::Working => {}
            }
        }
    }
}

/// HTTP executor speaking JSON-RPC 2.0
pub struct HttpExecutor {
    name: String,
    endpoint: String,
    http: reqwest::Client,
}

impl HttpExecutor {
    /// Create an executor client for a named endpoint
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn call(&self, request: JsonRpcRequest) -> Result<serde_json::Value, ProtocolError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProtocolError::Transport {
                executor: self.name.clone(),
                message: e.to_string(),
            })?;

        let envelope: JsonRpcResponse =
            response.json().await.map_err(|e| ProtocolError::Transport {
                executor: self.name.clone(),
                message: e.to_string(),
            })?;

        if let Some(error) = envelope.error {
            return Err(ProtocolError::Malformed {
                executor: self.name.clone(),
                detail: format!("JSON-RPC error {}: {}", error.code, error.message),
            });
        }

        envelope.result.ok_or_else(|| ProtocolError::Malformed {
            executor: self.name.clone(),
            detail: "response carried neither result nor error".to_string(),
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &TaskRequest) -> Result<String, ProtocolError> {
        let params = serde_json::to_value(request).map_err(|e| ProtocolError::Malformed {
            executor: self.name.clone(),
            detail: e.to_string(),
        })?;

        let result = self.call(JsonRpcRequest::new(METHOD_SUBMIT, params)).await?;
        let ack: SubmitAck =
            serde_json::from_value(result).map_err(|e| ProtocolError::Malformed {
                executor: self.name.clone(),
                detail: format!("invalid submit ack: {}", e),
            })?;

        Ok(ack.id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, ProtocolError> {
        let params = serde_json::json!({ "id": task_id });
        let result = self.call(JsonRpcRequest::new(METHOD_STATUS, params)).await?;

        serde_json::from_value(result).map_err(|e| ProtocolError::Malformed {
            executor: self.name.clone(),
            detail: format!("invalid task status: {}", e),
        })
    }
}
