//! Fire-and-forget event emission.
//!
//! The emitter sits on the hot path of agent tooling, so it must never
//! propagate a failure back to the caller. A full disk or a missing
//! directory costs one audit event, not a blocked workflow.

use crate::PipelineError;
use atp_core::{AuditConfig, AuditEvent, AuditPaths};
use chrono::Utc;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use tracing::{debug, warn};

pub struct EventEmitter {
    paths: AuditPaths,
    config: AuditConfig,
}

impl EventEmitter {
    pub fn new(paths: AuditPaths, config: AuditConfig) -> Self {
        Self { paths, config }
    }

    /// Appends one event to the log and refreshes the activity marker.
    /// Failures are logged and swallowed; callers get no error channel.
    pub fn emit(
        &self,
        kind: &str,
        data: Value,
        source: &str,
        session_id: &str,
        agent: &str,
    ) -> Option<AuditEvent> {
        if !self.config.enabled {
            return None;
        }
        match self.try_emit(kind, data, source, session_id, agent) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(kind, error = %err, "dropping audit event");
                None
            }
        }
    }

    fn try_emit(
        &self,
        kind: &str,
        data: Value,
        source: &str,
        session_id: &str,
        agent: &str,
    ) -> Result<AuditEvent, PipelineError> {
        let event = AuditEvent::new(kind, data, source, session_id, agent, Utc::now());

        if let Some(parent) = self.paths.event_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.event_log)?;
        let line = serde_json::to_string(&event)?;
        writeln!(log, "{line}")?;

        // A marker write failure is not worth losing the already appended
        // event over; the settle controller falls back to file mtimes.
        if let Err(err) = std::fs::write(&self.paths.marker, format!("{:.6}", event.timestamp)) {
            warn!(error = %err, "failed to refresh activity marker");
        }

        debug!(kind, session = session_id, "audit event appended");
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::KIND_REVIEW_COMPLETED;
    use serde_json::json;

    fn emitter(root: &std::path::Path) -> EventEmitter {
        EventEmitter::new(AuditPaths::new(root), AuditConfig::default())
    }

    #[test]
    fn emit_appends_jsonl_and_writes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let emitter = emitter(dir.path());

        let event = emitter
            .emit(
                KIND_REVIEW_COMPLETED,
                json!({"verdict": "blocked"}),
                "review_hook",
                "session-1",
                "worker-a",
            )
            .expect("event emitted");

        let paths = AuditPaths::new(dir.path());
        let log = std::fs::read_to_string(&paths.event_log).expect("log readable");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).expect("valid event line");
        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.kind, KIND_REVIEW_COMPLETED);

        let marker = std::fs::read_to_string(&paths.marker).expect("marker readable");
        let marker_ts: f64 = marker.trim().parse().expect("decimal timestamp");
        assert!((marker_ts - event.timestamp).abs() < 1e-6);
    }

    #[test]
    fn emit_creates_missing_audit_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("deep").join("project");
        let emitter = emitter(&nested);

        let event = emitter.emit(
            "task.pair_created",
            json!({"task_id": "t-1"}),
            "pair_hook",
            "session-1",
            "worker-a",
        );
        assert!(event.is_some());
        assert!(AuditPaths::new(&nested).event_log.exists());
    }

    #[test]
    fn emit_is_a_no_op_when_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        };
        let emitter = EventEmitter::new(AuditPaths::new(dir.path()), config);

        let event = emitter.emit("task.pair_created", json!({}), "hook", "s", "a");
        assert!(event.is_none());
        assert!(!AuditPaths::new(dir.path()).event_log.exists());
    }

    #[test]
    fn emit_swallows_unwritable_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AuditPaths::new(dir.path());
        // A directory where the log file should be makes the append fail.
        std::fs::create_dir_all(&paths.event_log).expect("blocking dir");
        let emitter = emitter(dir.path());

        let event = emitter.emit("task.pair_created", json!({}), "hook", "s", "a");
        assert!(event.is_none());
    }
}
