//! Durable work ledger: completion records and active-run claims.
//!
//! Follows the run store pattern: append-only JSONL with state derived from
//! replay. The ledger backs two guarantees:
//! - a (work item, stage) completion is permanent, so later runs skip the
//!   stage instead of re-invoking it;
//! - at most one run is RUNNING or SUSPENDED per work-item key at a time,
//!   enforced by `try_acquire`.
//!
//! Every cross-run interaction is a single conditional mutation behind the
//! ledger lock, so no broader locking is required.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors from ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Another run already holds the claim for this key. An expected
    /// concurrency outcome, not a bug: callers surface "already handled".
    #[error("work item '{key}' already has an active run ({holder})")]
    AlreadyActive { key: String, holder: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A record in the ledger log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum LedgerRecord {
    /// A (work item, stage) pair completed successfully
    Completed {
        key: String,
        stage: String,
        result_ref: String,
        at: DateTime<Utc>,
    },

    /// A run claimed exclusive ownership of a work-item key
    Claimed {
        key: String,
        run_id: Uuid,
        at: DateTime<Utc>,
    },

    /// A run released its claim (terminal state reached)
    Released {
        key: String,
        run_id: Uuid,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct LedgerIndex {
    /// (key, stage) → result_ref
    completions: HashMap<(String, String), String>,

    /// key → run currently holding the claim
    active: HashMap<String, Uuid>,
}

impl LedgerIndex {
    fn apply(&mut self, record: LedgerRecord) {
        match record {
            LedgerRecord::Completed {
                key,
                stage,
                result_ref,
                ..
            } => {
                self.completions.entry((key, stage)).or_insert(result_ref);
            }
            LedgerRecord::Claimed { key, run_id, .. } => {
                self.active.insert(key, run_id);
            }
            LedgerRecord::Released { key, run_id, .. } => {
                if self.active.get(&key) == Some(&run_id) {
                    self.active.remove(&key);
                }
            }
        }
    }
}

/// JSONL-backed work ledger
pub struct WorkLedger {
    path: PathBuf,
    index: Mutex<LedgerIndex>,
}

impl WorkLedger {
    /// Open a ledger, replaying any existing log to rebuild both indices
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut index = LedgerIndex::default();

        if path.exists() {
            let file = File::open(&path).await?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let record: LedgerRecord = serde_json::from_str(&line)?;
                index.apply(record);
            }
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    async fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let json = serde_json::to_string(record)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Check whether a (work item, stage) pair has already completed
    pub async fn has_completed(&self, key: &str, stage: &str) -> bool {
        let index = self.index.lock().await;
        index
            .completions
            .contains_key(&(key.to_string(), stage.to_string()))
    }

    /// Result reference recorded for a completed (work item, stage) pair
    pub async fn completion_ref(&self, key: &str, stage: &str) -> Option<String> {
        let index = self.index.lock().await;
        index
            .completions
            .get(&(key.to_string(), stage.to_string()))
            .cloned()
    }

    /// Record a completion. Idempotent: recording the same pair again is a
    /// no-op and the first result_ref wins.
    pub async fn record_completion(
        &self,
        key: &str,
        stage: &str,
        result_ref: &str,
    ) -> Result<(), LedgerError> {
        let mut index = self.index.lock().await;

        let entry = (key.to_string(), stage.to_string());
        if index.completions.contains_key(&entry) {
            return Ok(());
        }

        let record = LedgerRecord::Completed {
            key: key.to_string(),
            stage: stage.to_string(),
            result_ref: result_ref.to_string(),
            at: Utc::now(),
        };
        self.append(&record).await?;
        index.apply(record);

        Ok(())
    }

    /// The run currently holding the claim for a key, if any
    pub async fn active_run(&self, key: &str) -> Option<Uuid> {
        let index = self.index.lock().await;
        index.active.get(key).copied()
    }

    /// Claim exclusive ownership of a key for a run.
    ///
    /// Fails with `AlreadyActive` if another run holds the claim. Claiming a
    /// key the same run already holds is a no-op.
    pub async fn try_acquire(&self, key: &str, run_id: Uuid) -> Result<(), LedgerError> {
        let mut index = self.index.lock().await;

        if let Some(&holder) = index.active.get(key) {
            if holder == run_id {
                return Ok(());
            }
            return Err(LedgerError::AlreadyActive {
                key: key.to_string(),
                holder,
            });
        }

        let record = LedgerRecord::Claimed {
            key: key.to_string(),
            run_id,
            at: Utc::now(),
        };
        self.append(&record).await?;
        index.apply(record);

        Ok(())
    }

    /// Release a claim. Releasing a claim the run does not hold is a no-op.
    pub async fn release(&self, key: &str, run_id: Uuid) -> Result<(), LedgerError> {
        let mut index = self.index.lock().await;

        if index.active.get(key) != Some(&run_id) {
            return Ok(());
        }

        let record = LedgerRecord::Released {
            key: key.to_string(),
            run_id,
            at: Utc::now(),
        };
        self.append(&record).await?;
        index.apply(record);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_ledger() -> (WorkLedger, TempDir) {
        let temp = TempDir::new().unwrap();
        let ledger = WorkLedger::open(temp.path().join("ledger.jsonl"))
            .await
            .unwrap();
        (ledger, temp)
    }

    #[tokio::test]
    async fn test_completion_recording_is_idempotent() {
        let (ledger, _temp) = test_ledger().await;

        assert!(!ledger.has_completed("BHP:doc-1", "analyze").await);

        ledger
            .record_completion("BHP:doc-1", "analyze", "ref-1")
            .await
            .unwrap();
        ledger
            .record_completion("BHP:doc-1", "analyze", "ref-2")
            .await
            .unwrap();
        ledger
            .record_completion("BHP:doc-1", "analyze", "ref-3")
            .await
            .unwrap();

        assert!(ledger.has_completed("BHP:doc-1", "analyze").await);
        // First recording wins
        assert_eq!(
            ledger.completion_ref("BHP:doc-1", "analyze").await.as_deref(),
            Some("ref-1")
        );
    }

    #[tokio::test]
    async fn test_try_acquire_conflict() {
        let (ledger, _temp) = test_ledger().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        ledger.try_acquire("BHP:doc-1", first).await.unwrap();

        // Same run re-acquiring is fine
        ledger.try_acquire("BHP:doc-1", first).await.unwrap();

        // A different run is rejected
        let err = ledger.try_acquire("BHP:doc-1", second).await.unwrap_err();
        match err {
            LedgerError::AlreadyActive { holder, .. } => assert_eq!(holder, first),
            other => panic!("unexpected error: {:?}", other),
        }

        // Released claims can be re-acquired
        ledger.release("BHP:doc-1", first).await.unwrap();
        ledger.try_acquire("BHP:doc-1", second).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let (ledger, _temp) = test_ledger().await;
        let holder = Uuid::new_v4();
        let other = Uuid::new_v4();

        ledger.try_acquire("BHP:doc-1", holder).await.unwrap();
        ledger.release("BHP:doc-1", other).await.unwrap();

        assert_eq!(ledger.active_run("BHP:doc-1").await, Some(holder));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ledger.jsonl");
        let run_id = Uuid::new_v4();

        {
            let ledger = WorkLedger::open(&path).await.unwrap();
            ledger
                .record_completion("BHP:doc-1", "acquire", "ref-a")
                .await
                .unwrap();
            ledger.try_acquire("BHP:doc-1", run_id).await.unwrap();
        }

        // Reopen and verify both indices were rebuilt from the log
        let ledger = WorkLedger::open(&path).await.unwrap();
        assert!(ledger.has_completed("BHP:doc-1", "acquire").await);
        assert_eq!(ledger.active_run("BHP:doc-1").await, Some(run_id));

        let err = ledger
            .try_acquire("BHP:doc-1", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (ledger, _temp) = test_ledger().await;
        let ledger = std::sync::Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.try_acquire("BHP:doc-1", Uuid::new_v4()).await
            }));
        }

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(LedgerError::AlreadyActive { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(conflicts, 15);
    }
}
