//! Trust ledger for externally reported findings.
//!
//! Findings arrive from an outside reviewer and are enforced until a human
//! dismisses them with a reason. The ledger lives in its own database file
//! so audit statistics can be pruned or rebuilt without touching trust
//! state.

use crate::{parse_timestamp, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub const FINDINGS_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingStatus {
    Open,
    Dismissed,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Dismissed => "dismissed",
        }
    }
}

/// Whether a recorded finding should still gate behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    Enforce,
    Waive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingDismissal {
    pub finding_id: String,
    pub reason: String,
    pub dismissed_at: DateTime<Utc>,
}

pub struct FindingsLedger {
    conn: Connection,
}

impl FindingsLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > FINDINGS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: FINDINGS_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_findings_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Records a new finding as open. Duplicate ids are an error, not an
    /// overwrite: the first report keeps its timestamp and status.
    pub fn record_finding(
        &self,
        finding_id: &str,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.finding_status(finding_id)?.is_some() {
            return Err(StorageError::DuplicateFinding {
                id: finding_id.to_string(),
            });
        }
        self.conn.execute(
            "
            INSERT INTO findings (finding_id, summary, status, recorded_at)
            VALUES (?1, ?2, 'open', ?3)
            ",
            params![finding_id, summary, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Dismisses an open finding. The reason is mandatory and kept in an
    /// append-only history, so repeated dismissals of the same finding
    /// stack rather than overwrite.
    pub fn dismiss_finding(
        &self,
        finding_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if reason.trim().is_empty() {
            return Err(StorageError::EmptyDismissalReason);
        }
        if self.finding_status(finding_id)?.is_none() {
            return Err(StorageError::UnknownFinding {
                id: finding_id.to_string(),
            });
        }

        self.conn.execute(
            "
            INSERT INTO finding_dismissals (finding_id, reason, dismissed_at)
            VALUES (?1, ?2, ?3)
            ",
            params![finding_id, reason.trim(), now.to_rfc3339()],
        )?;
        self.conn.execute(
            "UPDATE findings SET status = 'dismissed' WHERE finding_id = ?1",
            [finding_id],
        )?;
        Ok(())
    }

    pub fn finding_status(&self, finding_id: &str) -> Result<Option<FindingStatus>, StorageError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM findings WHERE finding_id = ?1",
                [finding_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => Ok(None),
            Some("open") => Ok(Some(FindingStatus::Open)),
            Some("dismissed") => Ok(Some(FindingStatus::Dismissed)),
            Some(other) => Err(StorageError::Serialization(format!(
                "invalid finding status: {other}"
            ))),
        }
    }

    /// Enforce by default. Only a recorded dismissal waives a finding;
    /// an unknown id is still enforced so a lost ledger row fails closed.
    pub fn trust_decision(&self, finding_id: &str) -> Result<TrustDecision, StorageError> {
        match self.finding_status(finding_id)? {
            Some(FindingStatus::Dismissed) => Ok(TrustDecision::Waive),
            Some(FindingStatus::Open) | None => Ok(TrustDecision::Enforce),
        }
    }

    /// Dismissals for one finding, most recent first.
    pub fn dismissal_history(
        &self,
        finding_id: &str,
    ) -> Result<Vec<FindingDismissal>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT finding_id, reason, dismissed_at
            FROM finding_dismissals
            WHERE finding_id = ?1
            ORDER BY dismissed_at DESC, dismissal_id DESC
            ",
        )?;

        let rows = statement.query_map([finding_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (finding_id, reason, dismissed_raw) = row?;
            history.push(FindingDismissal {
                finding_id,
                reason,
                dismissed_at: parse_timestamp(dismissed_raw)?,
            });
        }
        Ok(history)
    }
}
