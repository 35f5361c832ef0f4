//! Human-in-the-loop gate.
//!
//! A pipeline instance that needs review parks behind a [`HitlTicket`]:
//! the ticket row plus the instance checkpoint are the entire suspended
//! state, so the orchestrator holds no resources while waiting. A reviewer
//! resolves the ticket exactly once; the deadline scanner expires tickets
//! that wait too long and delivers a synthetic rejection. Both paths hand a
//! [`TicketResolution`] to the dispatcher, which resumes a freshly loaded
//! instance.
//!
//! # Delivery guarantee
//!
//! Ticket transitions are conditional updates on `status = 'awaiting'`, so
//! exactly one terminal transition wins; a second resolve observes zero
//! affected rows and fails with `already-resolved`.

mod dispatcher;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ledger::{parse_timestamp, AuditDb, LedgerError};
use crate::pipeline::{ReviewDecision, ReviewOutcome};

pub use dispatcher::ReviewDispatcher;

/// Errors raised by gate operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HitlError {
    /// No ticket exists with the given id.
    #[error("ticket not found: {ticket_id}")]
    NotFound {
        /// The missing ticket id.
        ticket_id: String,
    },

    /// The ticket already left the awaiting state.
    #[error("ticket already resolved: {ticket_id} is {status}")]
    AlreadyResolved {
        /// The ticket id.
        ticket_id: String,
        /// Its current terminal status.
        status: TicketStatus,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

/// Ticket lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Waiting for a reviewer.
    Awaiting,
    /// Approved by a reviewer.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
    /// Deadline passed without a decision.
    Expired,
}

impl TicketStatus {
    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Awaiting => "awaiting",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Parses a status tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "awaiting" => Some(Self::Awaiting),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted review ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlTicket {
    /// Unique ticket id.
    pub ticket_id: String,

    /// The claim under review.
    pub claim_id: String,

    /// The suspended pipeline instance.
    pub instance_id: String,

    /// Why review was required.
    pub risk_summary: String,

    /// Current lifecycle state.
    pub status: TicketStatus,

    /// Reviewer identity, once resolved.
    pub reviewer: Option<String>,

    /// Reviewer-supplied reason, once resolved.
    pub reason: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Expiry deadline.
    pub deadline: DateTime<Utc>,

    /// Resolution timestamp, once terminal.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HitlTicket {
    /// The review decision this ticket's terminal state represents.
    ///
    /// Returns `None` while the ticket is still awaiting.
    #[must_use]
    pub fn decision(&self) -> Option<ReviewDecision> {
        let outcome = match self.status {
            TicketStatus::Awaiting => return None,
            TicketStatus::Approved => ReviewOutcome::Approved,
            TicketStatus::Rejected => ReviewOutcome::Rejected,
            TicketStatus::Expired => ReviewOutcome::Expired,
        };
        Some(ReviewDecision {
            outcome,
            reviewer: self
                .reviewer
                .clone()
                .unwrap_or_else(|| "auto".to_string()),
            reason: self.reason.clone().unwrap_or_default(),
            auto: self.reviewer.is_none(),
            decided_at: self.resolved_at.unwrap_or_else(Utc::now),
        })
    }
}

/// A resolved ticket paired with the decision to deliver.
#[derive(Debug, Clone)]
pub struct TicketResolution {
    /// The resolved ticket.
    pub ticket: HitlTicket,

    /// The decision handed to the resumed instance.
    pub decision: ReviewDecision,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC so lexicographic comparison in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The HITL gate: ticket persistence plus resolution delivery.
pub struct HitlGate {
    conn: Arc<Mutex<Connection>>,
    notify: mpsc::UnboundedSender<TicketResolution>,
}

impl std::fmt::Debug for HitlGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitlGate").finish_non_exhaustive()
    }
}

impl HitlGate {
    /// Creates a gate over the audit database, returning the gate and the
    /// resolution stream the dispatcher consumes.
    #[must_use]
    pub fn new(db: &AuditDb) -> (Self, mpsc::UnboundedReceiver<TicketResolution>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        (
            Self {
                conn: db.connection(),
                notify,
            },
            receiver,
        )
    }

    /// Opens a ticket for a suspended instance.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Storage`] if the insert fails.
    pub fn open_ticket(
        &self,
        claim_id: &str,
        instance_id: &str,
        risk_summary: &str,
        deadline: DateTime<Utc>,
    ) -> Result<HitlTicket, HitlError> {
        let ticket = HitlTicket {
            ticket_id: uuid::Uuid::new_v4().to_string(),
            claim_id: claim_id.to_string(),
            instance_id: instance_id.to_string(),
            risk_summary: risk_summary.to_string(),
            status: TicketStatus::Awaiting,
            reviewer: None,
            reason: None,
            created_at: Utc::now(),
            deadline,
            resolved_at: None,
        };

        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO tickets (ticket_id, claim_id, instance_id, status, risk_summary, \
             created_at, deadline) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ticket.ticket_id,
                ticket.claim_id,
                ticket.instance_id,
                ticket.status.as_str(),
                ticket.risk_summary,
                fmt_ts(ticket.created_at),
                fmt_ts(ticket.deadline),
            ],
        )
        .map_err(LedgerError::from)?;
        Ok(ticket)
    }

    /// Resolves an awaiting ticket and delivers the decision.
    ///
    /// # Errors
    ///
    /// - [`HitlError::NotFound`] for an unknown ticket
    /// - [`HitlError::AlreadyResolved`] if the ticket already left the
    ///   awaiting state (exactly-once delivery)
    pub fn resolve(
        &self,
        ticket_id: &str,
        approved: bool,
        reviewer: &str,
        reason: &str,
    ) -> Result<HitlTicket, HitlError> {
        let status = if approved {
            TicketStatus::Approved
        } else {
            TicketStatus::Rejected
        };
        let resolved_at = Utc::now();

        let transitioned = {
            let conn = self.conn.lock().expect("lock poisoned");
            conn.execute(
                "UPDATE tickets SET status = ?1, reviewer = ?2, reason = ?3, resolved_at = ?4 \
                 WHERE ticket_id = ?5 AND status = 'awaiting'",
                params![
                    status.as_str(),
                    reviewer,
                    reason,
                    fmt_ts(resolved_at),
                    ticket_id
                ],
            )
            .map_err(LedgerError::from)?
        };

        let ticket = self.get(ticket_id)?;
        if transitioned == 0 {
            return Err(HitlError::AlreadyResolved {
                ticket_id: ticket_id.to_string(),
                status: ticket.status,
            });
        }

        let decision = ReviewDecision {
            outcome: if approved {
                ReviewOutcome::Approved
            } else {
                ReviewOutcome::Rejected
            },
            reviewer: reviewer.to_string(),
            reason: reason.to_string(),
            auto: false,
            decided_at: resolved_at,
        };
        let _ = self.notify.send(TicketResolution {
            ticket: ticket.clone(),
            decision,
        });
        Ok(ticket)
    }

    /// Expires every awaiting ticket whose deadline has passed, delivering
    /// a synthetic `expired` decision for each.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Storage`] on query failure.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<HitlTicket>, HitlError> {
        let due: Vec<String> = {
            let conn = self.conn.lock().expect("lock poisoned");
            let mut stmt = conn
                .prepare(
                    "SELECT ticket_id FROM tickets WHERE status = 'awaiting' AND deadline <= ?1",
                )
                .map_err(LedgerError::from)?;
            let rows = stmt
                .query_map(params![fmt_ts(now)], |row| row.get::<_, String>(0))
                .map_err(LedgerError::from)?;
            rows.collect::<Result<_, _>>().map_err(LedgerError::from)?
        };

        let mut expired = Vec::new();
        for ticket_id in due {
            let transitioned = {
                let conn = self.conn.lock().expect("lock poisoned");
                conn.execute(
                    "UPDATE tickets SET status = 'expired', resolved_at = ?1 \
                     WHERE ticket_id = ?2 AND status = 'awaiting'",
                    params![fmt_ts(now), ticket_id],
                )
                .map_err(LedgerError::from)?
            };
            // A racing reviewer may have won; only the actual transition
            // delivers a decision.
            if transitioned == 1 {
                let ticket = self.get(&ticket_id)?;
                let _ = self.notify.send(TicketResolution {
                    ticket: ticket.clone(),
                    decision: ReviewDecision::expired(),
                });
                expired.push(ticket);
            }
        }
        Ok(expired)
    }

    /// Fetches a ticket by id.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::NotFound`] if no ticket exists.
    pub fn get(&self, ticket_id: &str) -> Result<HitlTicket, HitlError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let row = conn
            .query_row(
                "SELECT ticket_id, claim_id, instance_id, status, risk_summary, reviewer, \
                 reason, created_at, deadline, resolved_at FROM tickets WHERE ticket_id = ?1",
                params![ticket_id],
                Self::row_to_ticket,
            )
            .optional()
            .map_err(LedgerError::from)?;
        row.map(Self::decode_ticket).transpose()?.ok_or_else(|| {
            HitlError::NotFound {
                ticket_id: ticket_id.to_string(),
            }
        })
    }

    /// The awaiting ticket for an instance, if any. Used by crash
    /// recovery: the resumed instance reads its ticket's status and acts
    /// accordingly.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Storage`] on query failure.
    pub fn find_by_instance(&self, instance_id: &str) -> Result<Option<HitlTicket>, HitlError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let row = conn
            .query_row(
                "SELECT ticket_id, claim_id, instance_id, status, risk_summary, reviewer, \
                 reason, created_at, deadline, resolved_at FROM tickets \
                 WHERE instance_id = ?1 ORDER BY created_at DESC LIMIT 1",
                params![instance_id],
                Self::row_to_ticket,
            )
            .optional()
            .map_err(LedgerError::from)?;
        row.map(Self::decode_ticket).transpose().map_err(Into::into)
    }

    /// Lists open tickets, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Storage`] on query failure.
    pub fn list_pending(&self) -> Result<Vec<HitlTicket>, HitlError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT ticket_id, claim_id, instance_id, status, risk_summary, reviewer, \
                 reason, created_at, deadline, resolved_at FROM tickets \
                 WHERE status = 'awaiting' ORDER BY deadline ASC",
            )
            .map_err(LedgerError::from)?;
        let rows = stmt
            .query_map([], Self::row_to_ticket)
            .map_err(LedgerError::from)?;
        let mut tickets = Vec::new();
        for row in rows {
            tickets.push(Self::decode_ticket(row.map_err(LedgerError::from)?)?);
        }
        Ok(tickets)
    }

    #[allow(clippy::type_complexity)]
    fn row_to_ticket(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        Option<String>,
    )> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn decode_ticket(
        row: (
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            String,
            String,
            Option<String>,
        ),
    ) -> Result<HitlTicket, HitlError> {
        let (
            ticket_id,
            claim_id,
            instance_id,
            status,
            risk_summary,
            reviewer,
            reason,
            created_at,
            deadline,
            resolved_at,
        ) = row;
        Ok(HitlTicket {
            ticket_id,
            claim_id,
            instance_id,
            status: TicketStatus::parse(&status).ok_or_else(|| {
                HitlError::Storage(LedgerError::Corrupt(format!(
                    "unknown ticket status: {status}"
                )))
            })?,
            reviewer,
            reason,
            risk_summary,
            created_at: parse_timestamp(&created_at)?,
            deadline: parse_timestamp(&deadline)?,
            resolved_at: resolved_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
