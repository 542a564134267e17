pub mod findings;

pub use findings::{FindingDismissal, FindingStatus, FindingsLedger, TrustDecision};

use atp_core::{Anomaly, SessionSummary, Severity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

pub const AUDIT_SCHEMA_VERSION: i64 = 1;
pub const EVENT_LOG_CURSOR: &str = "event_log";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("finding already recorded: {id}")]
    DuplicateFinding { id: String },
    #[error("unknown finding: {id}")]
    UnknownFinding { id: String },
    #[error("a dismissal requires a non-empty reason")]
    EmptyDismissalReason,
}

/// Per-session counter increments computed from one ingested batch and
/// applied in a single upsert.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionDelta {
    pub total_events: u64,
    pub task_count: u64,
    pub approval_count: u64,
    pub block_count: u64,
    pub gate_block_count: u64,
    pub gate_allow_count: u64,
}

/// System of record for session governance counters, rolling metric windows,
/// anomaly history, and the event-log ingestion cursor.
pub struct StatsStore {
    conn: Connection,
}

impl StatsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > AUDIT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: AUDIT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_audit_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn apply_session_delta(
        &self,
        session_id: &str,
        delta: &SessionDelta,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO session_summaries (
                session_id,
                total_events,
                task_count,
                approval_count,
                block_count,
                gate_block_count,
                gate_allow_count,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(session_id) DO UPDATE SET
                total_events=total_events+excluded.total_events,
                task_count=task_count+excluded.task_count,
                approval_count=approval_count+excluded.approval_count,
                block_count=block_count+excluded.block_count,
                gate_block_count=gate_block_count+excluded.gate_block_count,
                gate_allow_count=gate_allow_count+excluded.gate_allow_count,
                updated_at=excluded.updated_at
            ",
            params![
                session_id,
                delta.total_events as i64,
                delta.task_count as i64,
                delta.approval_count as i64,
                delta.block_count as i64,
                delta.gate_block_count as i64,
                delta.gate_allow_count as i64,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn session_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT session_id, total_events, task_count, approval_count,
                       block_count, gate_block_count, gate_allow_count, updated_at
                FROM session_summaries
                WHERE session_id = ?1
                ",
                [session_id],
                |row| {
                    let updated_at_raw: String = row.get(7)?;
                    Ok((
                        SessionSummary {
                            session_id: row.get(0)?,
                            total_events: row.get::<_, i64>(1)? as u64,
                            task_count: row.get::<_, i64>(2)? as u64,
                            approval_count: row.get::<_, i64>(3)? as u64,
                            block_count: row.get::<_, i64>(4)? as u64,
                            gate_block_count: row.get::<_, i64>(5)? as u64,
                            gate_allow_count: row.get::<_, i64>(6)? as u64,
                            updated_at: None,
                        },
                        updated_at_raw,
                    ))
                },
            )
            .optional()?;

        let Some((mut summary, updated_at_raw)) = row else {
            return Ok(None);
        };
        summary.updated_at = Some(parse_timestamp(updated_at_raw)?);
        Ok(Some(summary))
    }

    pub fn session_summaries(&self) -> Result<Vec<SessionSummary>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT session_id, total_events, task_count, approval_count,
                   block_count, gate_block_count, gate_allow_count, updated_at
            FROM session_summaries
            ORDER BY session_id ASC
            ",
        )?;

        let rows = statement.query_map([], |row| {
            let updated_at_raw: String = row.get(7)?;
            Ok((
                SessionSummary {
                    session_id: row.get(0)?,
                    total_events: row.get::<_, i64>(1)? as u64,
                    task_count: row.get::<_, i64>(2)? as u64,
                    approval_count: row.get::<_, i64>(3)? as u64,
                    block_count: row.get::<_, i64>(4)? as u64,
                    gate_block_count: row.get::<_, i64>(5)? as u64,
                    gate_allow_count: row.get::<_, i64>(6)? as u64,
                    updated_at: None,
                },
                updated_at_raw,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (mut summary, updated_at_raw) = row?;
            summary.updated_at = Some(parse_timestamp(updated_at_raw)?);
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub fn bump_kind_counter(&self, kind: &str, by: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO event_kind_counters (kind, total) VALUES (?1, ?2)
            ON CONFLICT(kind) DO UPDATE SET total=total+excluded.total
            ",
            params![kind, by as i64],
        )?;
        Ok(())
    }

    pub fn kind_counter(&self, kind: &str) -> Result<u64, StorageError> {
        let total: Option<i64> = self
            .conn
            .query_row(
                "SELECT total FROM event_kind_counters WHERE kind = ?1",
                [kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(total.unwrap_or(0) as u64)
    }

    pub fn record_metric_sample(
        &self,
        metric_name: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO metric_windows (metric_name, value, recorded_at)
            VALUES (?1, ?2, ?3)
            ",
            params![metric_name, value, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent sample for the metric at or after `cutoff`, or `None`
    /// when no sample qualifies. Absence means "insufficient data", never
    /// zero.
    pub fn latest_metric_sample(
        &self,
        metric_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<f64>, StorageError> {
        let value = self
            .conn
            .query_row(
                "
                SELECT value
                FROM metric_windows
                WHERE metric_name = ?1 AND recorded_at >= ?2
                ORDER BY recorded_at DESC, sample_id DESC
                LIMIT 1
                ",
                params![metric_name, cutoff.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StorageError> {
        let metric_values_json = serde_json::to_string(&anomaly.metric_values)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT OR REPLACE INTO anomaly_history (
                anomaly_id,
                kind,
                severity,
                description,
                metric_values_json,
                detected_at,
                escalated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                anomaly.id,
                anomaly.kind,
                anomaly.severity.as_str(),
                anomaly.description,
                metric_values_json,
                anomaly.detected_at.to_rfc3339(),
                if anomaly.escalated { 1_i64 } else { 0_i64 },
            ],
        )?;
        Ok(())
    }

    pub fn mark_anomaly_escalated(&self, anomaly_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "UPDATE anomaly_history SET escalated = 1 WHERE anomaly_id = ?1",
            [anomaly_id],
        )?;
        Ok(changes > 0)
    }

    pub fn anomalies_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Anomaly>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT anomaly_id, kind, severity, description, metric_values_json,
                   detected_at, escalated
            FROM anomaly_history
            WHERE detected_at >= ?1
            ORDER BY detected_at ASC, anomaly_id ASC
            ",
        )?;

        let rows = statement.query_map([cutoff.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut anomalies = Vec::new();
        for row in rows {
            let (id, kind, severity_raw, description, metric_values_json, detected_raw, escalated) =
                row?;
            let severity = parse_severity(&severity_raw).ok_or_else(|| {
                StorageError::Serialization(format!("invalid severity: {severity_raw}"))
            })?;
            let metric_values = serde_json::from_str(&metric_values_json)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            anomalies.push(Anomaly {
                id,
                kind,
                severity,
                description,
                metric_values,
                detected_at: parse_timestamp(detected_raw)?,
                escalated: escalated != 0,
            });
        }
        Ok(anomalies)
    }

    pub fn cursor(&self, cursor_name: &str) -> Result<u64, StorageError> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT byte_offset FROM ingestion_cursors WHERE cursor_name = ?1",
                [cursor_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0) as u64)
    }

    pub fn cursor_updated_at(
        &self,
        cursor_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM ingestion_cursors WHERE cursor_name = ?1",
                [cursor_name],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(parse_timestamp).transpose()
    }

    pub fn set_cursor(
        &self,
        cursor_name: &str,
        byte_offset: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO ingestion_cursors (cursor_name, byte_offset, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cursor_name) DO UPDATE SET
                byte_offset=excluded.byte_offset,
                updated_at=excluded.updated_at
            ",
            params![cursor_name, byte_offset as i64, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Retention maintenance, separate from the ingestion hot path. Removes
    /// anomaly history, metric samples, and session aggregates older than
    /// the cutoff; returns rows removed.
    pub fn prune_old_data(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = cutoff.to_rfc3339();
        let mut removed = 0usize;
        removed += self.conn.execute(
            "DELETE FROM anomaly_history WHERE detected_at < ?1",
            [&cutoff],
        )?;
        removed += self.conn.execute(
            "DELETE FROM metric_windows WHERE recorded_at < ?1",
            [&cutoff],
        )?;
        removed += self.conn.execute(
            "DELETE FROM session_summaries WHERE updated_at < ?1",
            [&cutoff],
        )?;
        Ok(removed)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn parse_severity(value: &str) -> Option<Severity> {
    match value {
        "info" => Some(Severity::Info),
        "warning" => Some(Severity::Warning),
        "critical" => Some(Severity::Critical),
        _ => None,
    }
}

pub(crate) fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::seconds(offset_secs)
    }

    fn anomaly(id: &str, detected_at: DateTime<Utc>) -> Anomaly {
        Anomaly {
            id: id.to_string(),
            kind: "high_block_rate".to_string(),
            severity: Severity::Warning,
            description: "3/4 reviews blocked".to_string(),
            metric_values: BTreeMap::from([("block_rate".to_string(), 0.75)]),
            detected_at,
            escalated: false,
        }
    }

    #[test]
    fn migration_creates_audit_tables() {
        let store = StatsStore::open_in_memory().expect("open");
        for table in [
            "session_summaries",
            "event_kind_counters",
            "metric_windows",
            "anomaly_history",
            "ingestion_cursors",
        ] {
            assert!(store.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(
            store.schema_version().expect("version"),
            AUDIT_SCHEMA_VERSION
        );
    }

    #[test]
    fn session_deltas_accumulate_across_batches() {
        let store = StatsStore::open_in_memory().expect("open");
        let delta = SessionDelta {
            total_events: 3,
            task_count: 1,
            approval_count: 1,
            block_count: 1,
            ..SessionDelta::default()
        };
        store
            .apply_session_delta("session-1", &delta, ts(0))
            .expect("first batch");
        store
            .apply_session_delta("session-1", &delta, ts(60))
            .expect("second batch");

        let summary = store
            .session_summary("session-1")
            .expect("query")
            .expect("present");
        assert_eq!(summary.total_events, 6);
        assert_eq!(summary.task_count, 2);
        assert_eq!(summary.approval_count, 2);
        assert_eq!(summary.block_count, 2);
        assert_eq!(summary.updated_at, Some(ts(60)));
        assert!(store
            .session_summary("session-unknown")
            .expect("query")
            .is_none());
    }

    #[test]
    fn metric_window_returns_latest_sample_inside_cutoff() {
        let store = StatsStore::open_in_memory().expect("open");
        store
            .record_metric_sample("events_per_hour", 10.0, ts(0))
            .expect("old sample");
        store
            .record_metric_sample("events_per_hour", 24.0, ts(600))
            .expect("new sample");

        let baseline = store
            .latest_metric_sample("events_per_hour", ts(300))
            .expect("query");
        assert_eq!(baseline, Some(24.0));

        // Cutoff past every sample: no baseline, not zero.
        let none = store
            .latest_metric_sample("events_per_hour", ts(900))
            .expect("query");
        assert_eq!(none, None);
        assert_eq!(
            store
                .latest_metric_sample("unknown_metric", ts(0))
                .expect("query"),
            None
        );
    }

    #[test]
    fn anomaly_history_round_trips_and_marks_escalation() {
        let store = StatsStore::open_in_memory().expect("open");
        store.insert_anomaly(&anomaly("a-1", ts(0))).expect("write");

        assert!(store.mark_anomaly_escalated("a-1").expect("mark"));
        assert!(!store.mark_anomaly_escalated("a-missing").expect("mark"));

        let rows = store.anomalies_since(ts(-60)).expect("read");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].escalated);
        assert_eq!(rows[0].metric_values.get("block_rate"), Some(&0.75));
    }

    #[test]
    fn cursor_defaults_to_zero_and_persists() {
        let store = StatsStore::open_in_memory().expect("open");
        assert_eq!(store.cursor(EVENT_LOG_CURSOR).expect("read"), 0);
        store
            .set_cursor(EVENT_LOG_CURSOR, 4_096, ts(0))
            .expect("write");
        assert_eq!(store.cursor(EVENT_LOG_CURSOR).expect("read"), 4_096);
        assert_eq!(
            store.cursor_updated_at(EVENT_LOG_CURSOR).expect("read"),
            Some(ts(0))
        );
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit").join("stats.sqlite3");
        {
            let store = StatsStore::open(&path).expect("open");
            store
                .set_cursor(EVENT_LOG_CURSOR, 512, ts(0))
                .expect("cursor");
        }
        // Reopening runs the migration again; it must be a no-op.
        let store = StatsStore::open(&path).expect("reopen");
        assert_eq!(store.cursor(EVENT_LOG_CURSOR).expect("read"), 512);
        assert_eq!(
            store.schema_version().expect("version"),
            AUDIT_SCHEMA_VERSION
        );
    }

    #[test]
    fn prune_removes_rows_older_than_cutoff() {
        let store = StatsStore::open_in_memory().expect("open");
        store
            .insert_anomaly(&anomaly("old", ts(-7_200)))
            .expect("old anomaly");
        store
            .insert_anomaly(&anomaly("fresh", ts(0)))
            .expect("fresh anomaly");
        store
            .record_metric_sample("events_per_hour", 5.0, ts(-7_200))
            .expect("old sample");
        store
            .apply_session_delta("stale-session", &SessionDelta::default(), ts(-7_200))
            .expect("stale session");

        let removed = store.prune_old_data(ts(-3_600)).expect("prune");
        assert_eq!(removed, 3);
        assert_eq!(store.anomalies_since(ts(-86_400)).expect("read").len(), 1);
    }
}
