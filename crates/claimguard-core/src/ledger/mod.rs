//! Audit ledger and checkpoint storage.
//!
//! This module uses `SQLite` with WAL mode for the relational audit log and
//! the pipeline checkpoint rows. Events are append-only: they can only be
//! added, never modified or deleted. The HITL ticket table shares the same
//! database so ticket transitions and checkpoint writes stay on one durable
//! device.
//!
//! # Durability classes
//!
//! Most audit writes are best-effort from the core's perspective: a failed
//! insert degrades to a warning and the pipeline proceeds. Two kinds are
//! required-for-success and must be durable before the caller sees success:
//! `stage_complete` (written in one transaction with the checkpoint via
//! [`AuditDb::complete_stage`]) and `proof_signed`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{PipelineInstance, PipelineStatus, Stage};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// No instance exists with the given id.
    #[error("instance not found: {instance_id}")]
    InstanceNotFound {
        /// The missing instance id.
        instance_id: String,
    },
}

/// Closed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A claim was submitted.
    Submit,
    /// A stage attempt began.
    StageStart,
    /// A stage completed and its output is durable.
    StageComplete,
    /// A stage exhausted its retries or failed fatally.
    StageFail,
    /// A halt flag fired during consensus or detection.
    HaltTriggered,
    /// A HITL ticket was opened.
    HitlOpen,
    /// A HITL ticket was resolved by a reviewer.
    HitlResolved,
    /// A HITL ticket expired.
    HitlExpired,
    /// A proof record was written.
    ProofSigned,
    /// The caller cancelled the instance.
    Cancelled,
}

impl AuditEventKind {
    /// Stable string tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::StageStart => "stage_start",
            Self::StageComplete => "stage_complete",
            Self::StageFail => "stage_fail",
            Self::HaltTriggered => "halt_triggered",
            Self::HitlOpen => "hitl_open",
            Self::HitlResolved => "hitl_resolved",
            Self::HitlExpired => "hitl_expired",
            Self::ProofSigned => "proof_signed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses an event kind tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "submit" => Some(Self::Submit),
            "stage_start" => Some(Self::StageStart),
            "stage_complete" => Some(Self::StageComplete),
            "stage_fail" => Some(Self::StageFail),
            "halt_triggered" => Some(Self::HaltTriggered),
            "hitl_open" => Some(Self::HitlOpen),
            "hitl_resolved" => Some(Self::HitlResolved),
            "hitl_expired" => Some(Self::HitlExpired),
            "proof_signed" => Some(Self::ProofSigned),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One append-only ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sequence id, assigned on append.
    pub seq_id: Option<u64>,

    /// Event kind.
    pub kind: AuditEventKind,

    /// The claim this event belongs to.
    pub claim_id: String,

    /// Compact JSON payload.
    pub payload: serde_json::Value,

    /// Event timestamp.
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an event with the current timestamp.
    #[must_use]
    pub fn new(kind: AuditEventKind, claim_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            seq_id: None,
            kind,
            claim_id: claim_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Event for a stage transition.
    #[must_use]
    pub fn for_stage(
        kind: AuditEventKind,
        claim_id: impl Into<String>,
        instance_id: &str,
        stage: Stage,
    ) -> Self {
        Self::new(
            kind,
            claim_id,
            serde_json::json!({ "instance_id": instance_id, "stage": stage.as_str() }),
        )
    }
}

/// The audit database: append-only events plus checkpoint and ticket rows.
///
/// Uses `SQLite`'s WAL mode to allow concurrent reads while writes are in
/// progress. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct AuditDb {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for AuditDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDb").finish_non_exhaustive()
    }
}

impl AuditDb {
    /// Opens or creates the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection handle for sibling stores (tickets).
    #[must_use]
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Appends an event durably and returns its sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails; callers on
    /// the required-for-success paths propagate this.
    pub fn append_event(&self, event: &AuditEvent) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        Self::insert_event(&conn, event)
    }

    /// Appends an event, degrading failures to a warning.
    ///
    /// Used on the best-effort audit paths where a ledger outage must not
    /// fail the pipeline.
    pub fn append_event_best_effort(&self, event: &AuditEvent) {
        if let Err(error) = self.append_event(event) {
            tracing::warn!(
                kind = event.kind.as_str(),
                claim_id = %event.claim_id,
                %error,
                "best-effort audit write failed"
            );
        }
    }

    fn insert_event(conn: &Connection, event: &AuditEvent) -> Result<u64, LedgerError> {
        conn.execute(
            "INSERT INTO events (kind, claim_id, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.kind.as_str(),
                event.claim_id,
                event.payload.to_string(),
                event.created_at.to_rfc3339(),
            ],
        )?;
        let seq_id = conn.last_insert_rowid();
        Ok(u64::try_from(seq_id).unwrap_or(0))
    }

    /// Reads all events for a claim in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on query or decode failure.
    pub fn events_for_claim(&self, claim_id: &str) -> Result<Vec<AuditEvent>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq_id, kind, claim_id, payload, created_at FROM events \
             WHERE claim_id = ?1 ORDER BY seq_id ASC",
        )?;
        let rows = stmt.query_map(params![claim_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq_id, kind, claim_id, payload, created_at) = row?;
            events.push(AuditEvent {
                seq_id: u64::try_from(seq_id).ok(),
                kind: AuditEventKind::parse(&kind)
                    .ok_or_else(|| LedgerError::Corrupt(format!("unknown event kind: {kind}")))?,
                claim_id,
                payload: serde_json::from_str(&payload)
                    .map_err(|e| LedgerError::Corrupt(e.to_string()))?,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(events)
    }

    /// Persists a stage completion: the `stage_complete` event and the
    /// updated checkpoint commit in one transaction, so no stage-N event
    /// becomes durable before the stage's outputs are.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the transaction fails; the stage is then
    /// considered not completed.
    pub fn complete_stage(
        &self,
        instance: &PipelineInstance,
        stage: Stage,
    ) -> Result<(), LedgerError> {
        let event = AuditEvent::for_stage(
            AuditEventKind::StageComplete,
            instance.claim.id.clone(),
            &instance.instance_id,
            stage,
        );
        let conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.unchecked_transaction()?;
        Self::insert_event(&tx, &event)?;
        Self::upsert_instance(&tx, instance)?;
        tx.commit()?;
        Ok(())
    }

    /// Upserts an instance checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    pub fn save_instance(&self, instance: &PipelineInstance) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        Self::upsert_instance(&conn, instance)
    }

    fn upsert_instance(conn: &Connection, instance: &PipelineInstance) -> Result<(), LedgerError> {
        let checkpoint = serde_json::to_string(instance)
            .map_err(|e| LedgerError::Corrupt(e.to_string()))?;
        conn.execute(
            "INSERT INTO instances (instance_id, claim_id, status, stage, checkpoint, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(instance_id) DO UPDATE SET \
             status = excluded.status, stage = excluded.stage, \
             checkpoint = excluded.checkpoint, updated_at = excluded.updated_at",
            params![
                instance.instance_id,
                instance.claim.id,
                instance.status.as_str(),
                instance.current_stage.as_str(),
                checkpoint,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Loads an instance checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InstanceNotFound`] if no row exists.
    pub fn load_instance(&self, instance_id: &str) -> Result<PipelineInstance, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let checkpoint: Option<String> = conn
            .query_row(
                "SELECT checkpoint FROM instances WHERE instance_id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let checkpoint = checkpoint.ok_or_else(|| LedgerError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;
        serde_json::from_str(&checkpoint).map_err(|e| LedgerError::Corrupt(e.to_string()))
    }

    /// Loads the most recent instance for a claim, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on query or decode failure.
    pub fn find_instance_by_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<PipelineInstance>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let checkpoint: Option<String> = conn
            .query_row(
                "SELECT checkpoint FROM instances WHERE claim_id = ?1 \
                 ORDER BY updated_at DESC LIMIT 1",
                params![claim_id],
                |row| row.get(0),
            )
            .optional()?;
        match checkpoint {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| LedgerError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Lists instance ids in a given status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on query failure.
    pub fn instances_in_status(
        &self,
        status: PipelineStatus,
    ) -> Result<Vec<String>, LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt =
            conn.prepare("SELECT instance_id FROM instances WHERE status = ?1")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Liveness probe: a trivial query against the events table.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the database is unusable.
    pub fn probe(&self) -> Result<(), LedgerError> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::Claim;

    #[test]
    fn test_append_and_read_events() {
        let db = AuditDb::in_memory().unwrap();
        let first = db
            .append_event(&AuditEvent::new(
                AuditEventKind::Submit,
                "c1",
                serde_json::json!({"priority": "normal"}),
            ))
            .unwrap();
        let second = db
            .append_event(&AuditEvent::for_stage(
                AuditEventKind::StageComplete,
                "c1",
                "i1",
                Stage::Sanitize,
            ))
            .unwrap();
        assert!(second > first);

        let events = db.events_for_claim("c1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditEventKind::Submit);
        assert_eq!(events[1].kind, AuditEventKind::StageComplete);
        assert!(db.events_for_claim("other").unwrap().is_empty());
    }

    #[test]
    fn test_instance_roundtrip() {
        let db = AuditDb::in_memory().unwrap();
        let mut instance = PipelineInstance::new(Claim::new("c1", "body"));
        db.save_instance(&instance).unwrap();

        let loaded = db.load_instance(&instance.instance_id).unwrap();
        assert_eq!(loaded.claim.id, "c1");
        assert_eq!(loaded.status, PipelineStatus::Running);

        instance.status = PipelineStatus::Completed;
        db.save_instance(&instance).unwrap();
        let loaded = db.load_instance(&instance.instance_id).unwrap();
        assert_eq!(loaded.status, PipelineStatus::Completed);

        assert!(matches!(
            db.load_instance("missing"),
            Err(LedgerError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_complete_stage_is_transactional() {
        let db = AuditDb::in_memory().unwrap();
        let mut instance = PipelineInstance::new(Claim::new("c1", "body"));
        instance.log_completion(Stage::Sanitize, 1);
        db.complete_stage(&instance, Stage::Sanitize).unwrap();

        let events = db.events_for_claim("c1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditEventKind::StageComplete);

        let loaded = db.load_instance(&instance.instance_id).unwrap();
        assert!(loaded.stage_completed(Stage::Sanitize));
    }

    #[test]
    fn test_find_by_claim_and_status_listing() {
        let db = AuditDb::in_memory().unwrap();
        let mut instance = PipelineInstance::new(Claim::new("c1", "body"));
        instance.status = PipelineStatus::AwaitingReview;
        db.save_instance(&instance).unwrap();

        let found = db.find_instance_by_claim("c1").unwrap().unwrap();
        assert_eq!(found.instance_id, instance.instance_id);
        assert!(db.find_instance_by_claim("none").unwrap().is_none());

        let awaiting = db.instances_in_status(PipelineStatus::AwaitingReview).unwrap();
        assert_eq!(awaiting, vec![instance.instance_id]);
    }

    #[test]
    fn test_event_kind_tags_roundtrip() {
        for kind in [
            AuditEventKind::Submit,
            AuditEventKind::StageStart,
            AuditEventKind::StageComplete,
            AuditEventKind::StageFail,
            AuditEventKind::HaltTriggered,
            AuditEventKind::HitlOpen,
            AuditEventKind::HitlResolved,
            AuditEventKind::HitlExpired,
            AuditEventKind::ProofSigned,
            AuditEventKind::Cancelled,
        ] {
            assert_eq!(AuditEventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_probe() {
        let db = AuditDb::in_memory().unwrap();
        assert!(db.probe().is_ok());
    }

    #[test]
    fn test_on_disk_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let db = AuditDb::open(&path).unwrap();
            db.append_event(&AuditEvent::new(
                AuditEventKind::Submit,
                "c1",
                serde_json::json!({}),
            ))
            .unwrap();
        }
        let db = AuditDb::open(&path).unwrap();
        assert_eq!(db.events_for_claim("c1").unwrap().len(), 1);
    }
}
