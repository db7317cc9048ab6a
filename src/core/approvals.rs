//! Approval state machine for human-in-the-loop decisions.
//!
//! Tickets gate suspended runs. Resolution is exactly-once: the first writer
//! wins and later writers get `AlreadyResolved`, which also makes the
//! optional TTL expiry race-safe against a concurrent human decision.
//! Resolutions are published on a channel the supervisor subscribes to, so a
//! suspended run holds no task while it waits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ApprovalTicket, Decision};

/// Errors from approval operations
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// An open ticket already exists for this run
    #[error("run {run_id} already has an open ticket ({ticket_id})")]
    DuplicateTicket { run_id: Uuid, ticket_id: String },

    /// No ticket with this id
    #[error("unknown ticket '{0}'")]
    UnknownTicket(String),

    /// The ticket was already decided; the first decision stands
    #[error("ticket '{ticket_id}' already resolved as {decision:?}")]
    AlreadyResolved {
        ticket_id: String,
        decision: Decision,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A terminal decision delivered to the supervisor
#[derive(Debug, Clone)]
pub struct Resolution {
    pub ticket: ApprovalTicket,
}

/// A record in the ticket log (append-only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum TicketRecord {
    Created {
        ticket: ApprovalTicket,
    },
    Resolved {
        ticket_id: String,
        decision: Decision,
        actor: String,
        notes: Option<String>,
        at: DateTime<Utc>,
    },
}

/// JSONL-backed approval service
pub struct ApprovalService {
    path: PathBuf,
    tickets: Mutex<HashMap<String, ApprovalTicket>>,
    resolutions: mpsc::UnboundedSender<Resolution>,
}

impl ApprovalService {
    /// Open the service, replaying any existing ticket log. Returns the
    /// service together with the resolution channel's receiving end.
    pub async fn open(
        path: impl Into<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Resolution>), ApprovalError> {
        let path = path.into();
        let mut tickets: HashMap<String, ApprovalTicket> = HashMap::new();

        if path.exists() {
            let file = File::open(&path).await?;
            let reader = BufReader::new(file);
            let mut lines = reader.lines();

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TicketRecord>(&line)? {
                    TicketRecord::Created { ticket } => {
                        tickets.insert(ticket.id.clone(), ticket);
                    }
                    TicketRecord::Resolved {
                        ticket_id,
                        decision,
                        actor,
                        notes,
                        at,
                    } => {
                        if let Some(ticket) = tickets.get_mut(&ticket_id) {
                            ticket.decision = decision;
                            ticket.decided_at = Some(at);
                            ticket.decided_by = Some(actor);
                            ticket.notes = notes;
                        }
                    }
                }
            }
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                path,
                tickets: Mutex::new(tickets),
                resolutions: tx,
            },
            rx,
        ))
    }

    async fn append(&self, record: &TicketRecord) -> Result<(), ApprovalError> {
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

    /// Create a ticket for a suspended run.
    ///
    /// Fails with `DuplicateTicket` if the run already has an open ticket.
    pub async fn create_ticket(
        &self,
        run_id: Uuid,
        stage: &str,
        proposed_action: serde_json::Value,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let mut tickets = self.tickets.lock().await;

        if let Some(open) = tickets.values().find(|t| t.run_id == run_id && t.is_pending()) {
            return Err(ApprovalError::DuplicateTicket {
                run_id,
                ticket_id: open.id.clone(),
            });
        }

        let ticket = ApprovalTicket::new(run_id, stage, proposed_action);
        self.append(&TicketRecord::Created {
            ticket: ticket.clone(),
        })
        .await?;
        tickets.insert(ticket.id.clone(), ticket.clone());

        info!(ticket_id = %ticket.id, %run_id, stage, "Approval ticket created");
        Ok(ticket)
    }

    /// Decide a ticket. Exactly-once: the first terminal decision stands and
    /// later calls fail with `AlreadyResolved`.
    pub async fn resolve(
        &self,
        ticket_id: &str,
        decision: Decision,
        actor: &str,
        notes: Option<String>,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let mut tickets = self.tickets.lock().await;

        let ticket = tickets
            .get_mut(ticket_id)
            .ok_or_else(|| ApprovalError::UnknownTicket(ticket_id.to_string()))?;

        if !ticket.is_pending() {
            return Err(ApprovalError::AlreadyResolved {
                ticket_id: ticket_id.to_string(),
                decision: ticket.decision,
            });
        }

        let at = Utc::now();
        self.append(&TicketRecord::Resolved {
            ticket_id: ticket_id.to_string(),
            decision,
            actor: actor.to_string(),
            notes: notes.clone(),
            at,
        })
        .await?;

        ticket.decision = decision;
        ticket.decided_at = Some(at);
        ticket.decided_by = Some(actor.to_string());
        ticket.notes = notes;

        info!(ticket_id, ?decision, actor, "Ticket resolved");

        let resolved = ticket.clone();
        // Receiver may have gone away (one-shot CLI invocations resume inline)
        let _ = self.resolutions.send(Resolution {
            ticket: resolved.clone(),
        });

        Ok(resolved)
    }

    /// All open tickets, oldest first
    pub async fn list_pending(&self) -> Vec<ApprovalTicket> {
        let tickets = self.tickets.lock().await;
        let mut pending: Vec<ApprovalTicket> = tickets
            .values()
            .filter(|t| t.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Look up a ticket by id
    pub async fn get(&self, ticket_id: &str) -> Option<ApprovalTicket> {
        let tickets = self.tickets.lock().await;
        tickets.get(ticket_id).cloned()
    }

    /// The open ticket for a run, if one exists
    pub async fn pending_for_run(&self, run_id: Uuid) -> Option<ApprovalTicket> {
        let tickets = self.tickets.lock().await;
        tickets
            .values()
            .find(|t| t.run_id == run_id && t.is_pending())
            .cloned()
    }

    /// Expire tickets that have been pending longer than the TTL.
    ///
    /// Each expiry goes through `resolve`, so a concurrent human decision
    /// wins the race and the expiry becomes a no-op.
    pub async fn expire_overdue(&self, ttl: Duration) -> Result<Vec<ApprovalTicket>, ApprovalError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        let overdue: Vec<String> = self
            .list_pending()
            .await
            .into_iter()
            .filter(|t| t.created_at < cutoff)
            .map(|t| t.id)
            .collect();

        let mut expired = Vec::new();
        for ticket_id in overdue {
            match self
                .resolve(&ticket_id, Decision::Rejected, "system", Some("expired".to_string()))
                .await
            {
                Ok(ticket) => expired.push(ticket),
                Err(ApprovalError::AlreadyResolved { .. }) => {
                    // Lost the race to a human decision
                }
                Err(e) => return Err(e),
            }
        }

        if !expired.is_empty() {
            warn!(count = expired.len(), "Expired overdue approval tickets");
        }

        Ok(expired)
    }
}
