//! Append-only run store with file-based persistence.
//!
//! Each run owns a directory holding its event log (newline-delimited JSON)
//! and an artifacts directory with one JSON file per completed stage. Run
//! state is never stored directly; it is reconstructed by replaying the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Event, PipelineRun, RunStatus};

/// File-based run store using JSONL event logs
#[derive(Debug, Clone)]
pub struct RunStore {
    /// Directory containing one subdirectory per run
    root: PathBuf,

    /// Serializes appends: concurrent group members log to the same file
    write_lock: Arc<Mutex<()>>,
}

impl RunStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn artifacts_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    /// Append an event to a run's log, creating the run directory if needed
    pub async fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let artifacts = self.artifacts_dir(event.run_id);
        fs::create_dir_all(&artifacts)
            .await
            .with_context(|| format!("Failed to create run directory: {}", artifacts.display()))?;

        let events_path = self.events_path(event.run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of a run in order
    pub async fn replay(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let events_path = self.events_path(run_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Reconstruct a run from its event log
    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let events = self.replay(run_id).await?;
        Ok(PipelineRun::from_events(&events))
    }

    /// List all run ids in the store
    pub async fn list_runs(&self) -> Result<Vec<Uuid>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Load every run currently in one of the given statuses (recovery scan)
    pub async fn runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<PipelineRun>> {
        let mut matching = Vec::new();

        for run_id in self.list_runs().await? {
            if let Some(run) = self.load_run(run_id).await? {
                if statuses.contains(&run.status) {
                    matching.push(run);
                }
            }
        }

        Ok(matching)
    }

    /// Load recent runs, most recently updated first
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let mut runs = Vec::new();

        for run_id in self.list_runs().await? {
            if let Some(run) = self.load_run(run_id).await? {
                runs.push(run);
            }
        }

        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        runs.truncate(limit);

        Ok(runs)
    }

    /// Persist a stage's result payload as an artifact
    pub async fn store_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        payload: &serde_json::Value,
    ) -> Result<PathBuf> {
        let artifacts = self.artifacts_dir(run_id);
        fs::create_dir_all(&artifacts).await?;

        let artifact_path = artifacts.join(format!("{}.json", stage));
        let content =
            serde_json::to_string_pretty(payload).context("Failed to serialize artifact")?;

        fs::write(&artifact_path, content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", artifact_path.display()))?;

        Ok(artifact_path)
    }

    /// Load a stage's result payload, if recorded
    pub async fn load_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
    ) -> Result<Option<serde_json::Value>> {
        let artifact_path = self.artifacts_dir(run_id).join(format!("{}.json", stage));
        if !artifact_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&artifact_path)
            .await
            .with_context(|| format!("Failed to read artifact: {}", artifact_path.display()))?;

        let payload = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact: {}", artifact_path.display()))?;

        Ok(Some(payload))
    }
}

/// Build a ledger result reference: `{run_id}:{stage}:{digest}`
pub fn result_ref(run_id: Uuid, stage: &str, payload: &serde_json::Value) -> String {
    format!(
        "{}:{}:{}",
        run_id,
        stage,
        crate::domain::digest_value(payload)
    )
}

/// Parse the run id out of a result reference
pub fn parse_result_ref(reference: &str) -> Option<(Uuid, &str)> {
    let mut parts = reference.splitn(3, ':');
    let run_id = Uuid::parse_str(parts.next()?).ok()?;
    let stage = parts.next()?;
    parts.next()?; // digest must be present
    Some((run_id, stage))
}
