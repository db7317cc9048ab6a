//! Shared test harness: an in-process scripted executor plus a fully wired
//! supervisor over a temp state directory.
#![allow(dead_code)] // each test crate uses a different slice of the harness

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

use filament::core::{
    default_filing_graph, ApprovalService, Orchestrator, Resolution, RetryPolicy, RunStore,
    RunSupervisor, StageGraph, SupervisorConfig, WorkLedger,
};
use filament::protocol::{
    Executor, ExecutorFault, PollPolicy, ProtocolClient, ProtocolError, TaskRequest, TaskState,
    TaskStatus,
};

/// One scripted behavior for a stage invocation
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Complete with this payload
    Succeed(serde_json::Value),

    /// Report a terminal executor fault
    Reject { class: String, message: String },

    /// Stay WORKING forever (drives the client into a timeout)
    Hang,

    /// Fail the submit itself with a transport error
    Transport,
}

/// In-process executor whose behavior is scripted per stage.
///
/// Unscripted invocations succeed with a stage-appropriate default payload,
/// so most tests only script the stages they care about.
pub struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<Behavior>>>,
    tasks: Mutex<HashMap<String, Behavior>>,
    invocations: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        })
    }

    /// Queue behaviors for a stage, consumed one per invocation
    pub async fn script(&self, stage: &str, behaviors: Vec<Behavior>) {
        let mut script = self.script.lock().await;
        script.entry(stage.to_string()).or_default().extend(behaviors);
    }

    /// Stages invoked so far, in submit order
    pub async fn invocations(&self) -> Vec<String> {
        self.invocations.lock().await.clone()
    }

    /// Number of invocations of one stage
    pub async fn invocation_count(&self, stage: &str) -> usize {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|s| s.as_str() == stage)
            .count()
    }

    fn default_payload(stage: &str) -> serde_json::Value {
        match stage {
            "acquire" => serde_json::json!({
                "document_id": "doc-1",
                "content_ref": "library/doc-1.md",
            }),
            "analyze" => serde_json::json!({
                "sentiment": "BULLISH",
                "summary": "Record full-year results",
            }),
            "marketdata" => serde_json::json!({
                "price": 42.5,
                "currency": "AUD",
            }),
            "score" => serde_json::json!({
                "recommendation": "BUY",
                "confidence": 0.9,
            }),
            "trade" => serde_json::json!({
                "status": "executed",
                "quantity": 100,
                "execution_price": 42.5,
                "amount": 4250.0,
            }),
            other => serde_json::json!({ "stage": other, "ok": true }),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, request: &TaskRequest) -> Result<String, ProtocolError> {
        let behavior = {
            let mut script = self.script.lock().await;
            script
                .get_mut(&request.stage)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| Behavior::Succeed(Self::default_payload(&request.stage)))
        };

        self.invocations.lock().await.push(request.stage.clone());

        if matches!(behavior, Behavior::Transport) {
            return Err(ProtocolError::Transport {
                executor: "scripted".to_string(),
                message: "connection refused".to_string(),
            });
        }

        let task_id = format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().await.insert(task_id.clone(), behavior);
        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, ProtocolError> {
        let tasks = self.tasks.lock().await;
        let behavior = tasks.get(task_id).ok_or_else(|| ProtocolError::Malformed {
            executor: "scripted".to_string(),
            detail: format!("unknown task {}", task_id),
        })?;

        Ok(match behavior {
            Behavior::Succeed(payload) => TaskStatus {
                state: TaskState::Completed,
                result: Some(payload.clone()),
                error: None,
            },
            Behavior::Reject { class, message } => TaskStatus {
                state: TaskState::Errored,
                result: None,
                error: Some(ExecutorFault {
                    class: class.clone(),
                    message: message.clone(),
                }),
            },
            Behavior::Hang => TaskStatus {
                state: TaskState::Working,
                result: None,
                error: None,
            },
            Behavior::Transport => TaskStatus {
                state: TaskState::Working,
                result: None,
                error: None,
            },
        })
    }
}

/// Fully wired system over a temp directory
pub struct Harness {
    pub supervisor: Arc<RunSupervisor>,
    pub store: Arc<RunStore>,
    pub ledger: Arc<WorkLedger>,
    pub approvals: Arc<ApprovalService>,
    pub resolutions: mpsc::UnboundedReceiver<Resolution>,
    pub executor: Arc<ScriptedExecutor>,
    pub temp: TempDir,
}

/// Fast-paced retry policy for tests
pub fn test_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Build a harness over a fresh temp directory
pub async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    harness_in(temp, default_filing_graph(), SupervisorConfig::default(), test_retry(3)).await
}

/// Build a harness with explicit graph, supervisor config, and retry policy
pub async fn harness_with(
    graph: StageGraph,
    config: SupervisorConfig,
    retry: RetryPolicy,
) -> Harness {
    let temp = TempDir::new().unwrap();
    harness_in(temp, graph, config, retry).await
}

/// Build a harness over an existing state directory (restart simulation)
pub async fn harness_in(
    temp: TempDir,
    graph: StageGraph,
    config: SupervisorConfig,
    retry: RetryPolicy,
) -> Harness {
    let store = Arc::new(RunStore::new(temp.path().join("runs")));
    let ledger = Arc::new(
        WorkLedger::open(temp.path().join("ledger.jsonl"))
            .await
            .unwrap(),
    );
    let (approvals, resolutions) = ApprovalService::open(temp.path().join("tickets.jsonl"))
        .await
        .unwrap();
    let approvals = Arc::new(approvals);

    let executor = ScriptedExecutor::new();
    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
    for stage in graph.iter_stages() {
        executors.insert(stage.executor.clone(), executor.clone() as Arc<dyn Executor>);
    }

    let client = ProtocolClient::new(PollPolicy {
        base_interval_ms: 1,
        max_interval_ms: 5,
        multiplier: 2.0,
    });

    let orchestrator = Orchestrator::new(
        store.clone(),
        ledger.clone(),
        approvals.clone(),
        client,
        executors,
        retry,
        Duration::from_millis(100),
    );

    let supervisor = RunSupervisor::new(
        orchestrator,
        Arc::new(graph),
        store.clone(),
        ledger.clone(),
        approvals.clone(),
        config,
    );

    Harness {
        supervisor,
        store,
        ledger,
        approvals,
        resolutions,
        executor,
        temp,
    }
}
