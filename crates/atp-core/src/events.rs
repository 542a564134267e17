use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const KIND_TASK_PAIR_CREATED: &str = "task.pair_created";
pub const KIND_REVIEW_COMPLETED: &str = "review.completed";
pub const KIND_GATE_COMPLETION: &str = "gate.completion";
pub const KIND_GATE_IDLE: &str = "gate.idle";
pub const KIND_REINFORCEMENT_INJECTED: &str = "reinforcement.injected";
pub const KIND_REINFORCEMENT_SKIPPED: &str = "reinforcement.skipped";

pub const METRIC_EVENTS_PER_HOUR: &str = "events_per_hour";

pub const ANOMALY_HIGH_BLOCK_RATE: &str = "high_block_rate";
pub const ANOMALY_HIGH_GATE_BLOCK_RATE: &str = "high_gate_block_rate";
pub const ANOMALY_EVENT_RATE_SPIKE: &str = "event_rate_spike";
pub const ANOMALY_REPEATED_IDLE_BLOCKS: &str = "repeated_idle_blocks";
pub const ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE: &str = "high_reinforcement_skip_rate";

/// One newline-delimited record in the append-only event log. Immutable once
/// written; ordering is arrival order per writer, nothing stronger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    /// Epoch seconds, fractional. The marker file carries the same value.
    pub timestamp: f64,
    pub timestamp_iso: String,
    pub session_id: String,
    pub agent: String,
    pub source: String,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl AuditEvent {
    pub fn new(
        kind: &str,
        data: Value,
        source: &str,
        session_id: &str,
        agent: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let timestamp = now.timestamp_micros() as f64 / 1_000_000.0;
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            timestamp_iso: now.to_rfc3339(),
            session_id: session_id.to_string(),
            agent: agent.to_string(),
            source: source.to_string(),
            kind: kind.to_string(),
            data,
        }
    }

    pub fn detected_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros((self.timestamp * 1_000_000.0) as i64)
            .single()
    }

    /// Typed view of `kind` + `data`. Kinds without a fixed schema fall back
    /// to `Other`; the raw `data` map stays available either way.
    pub fn payload(&self) -> EventPayload {
        match self.kind.as_str() {
            KIND_TASK_PAIR_CREATED => EventPayload::TaskPairCreated,
            KIND_REVIEW_COMPLETED => match self.data.get("verdict").and_then(Value::as_str) {
                Some("approved") => EventPayload::ReviewCompleted {
                    verdict: ReviewVerdict::Approved,
                },
                Some("blocked") => EventPayload::ReviewCompleted {
                    verdict: ReviewVerdict::Blocked,
                },
                _ => EventPayload::Other,
            },
            KIND_GATE_COMPLETION => EventPayload::CompletionGate {
                allowed: self.gate_allowed(),
            },
            KIND_GATE_IDLE => EventPayload::IdleGate {
                allowed: self.gate_allowed(),
            },
            KIND_REINFORCEMENT_INJECTED => EventPayload::ReinforcementInjected,
            KIND_REINFORCEMENT_SKIPPED => EventPayload::ReinforcementSkipped,
            _ => EventPayload::Other,
        }
    }

    fn gate_allowed(&self) -> bool {
        self.data
            .get("allowed")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    TaskPairCreated,
    ReviewCompleted { verdict: ReviewVerdict },
    CompletionGate { allowed: bool },
    IdleGate { allowed: bool },
    ReinforcementInjected,
    ReinforcementSkipped,
    Other,
}

/// Derived per processing pass, never stored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub sessions_touched: BTreeSet<String>,
    /// `gate.idle` events that blocked. Counted here because the flag lives
    /// in the payload, not the kind string.
    pub idle_blocks: usize,
}

impl BatchSummary {
    pub fn summarize(events: &[AuditEvent]) -> Self {
        let mut summary = Self::default();
        for event in events {
            summary.total += 1;
            *summary.by_kind.entry(event.kind.clone()).or_insert(0) += 1;
            summary.sessions_touched.insert(event.session_id.clone());
            if matches!(event.payload(), EventPayload::IdleGate { allowed: false }) {
                summary.idle_blocks += 1;
            }
        }
        summary
    }

    pub fn kind_count(&self, kind: &str) -> usize {
        self.by_kind.get(kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Produced per batch by the detector; persisted to history only when
/// `anomaly_flush` is on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub metric_values: BTreeMap<String, f64>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub escalated: bool,
}

impl Anomaly {
    pub fn new(
        kind: &str,
        severity: Severity,
        description: String,
        metric_values: BTreeMap<String, f64>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            severity,
            description,
            metric_values,
            detected_at,
            escalated: false,
        }
    }
}

/// Per-session governance counters. The stats store is the system of record
/// for these, not a cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_events: u64,
    pub task_count: u64,
    pub approval_count: u64,
    pub block_count: u64,
    pub gate_block_count: u64,
    pub gate_allow_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn event(kind: &str, session: &str, data: Value) -> AuditEvent {
        AuditEvent::new(kind, data, "hook", session, "worker-1", ts())
    }

    #[test]
    fn event_round_trips_through_json_line() {
        let original = event(
            KIND_REVIEW_COMPLETED,
            "session-1",
            json!({"verdict": "blocked", "task_id": "42"}),
        );
        let line = serde_json::to_string(&original).expect("serialize");
        let decoded: AuditEvent = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(decoded, original);
        assert_eq!(decoded.timestamp_iso, ts().to_rfc3339());
    }

    #[test]
    fn payload_resolves_known_kinds() {
        assert_eq!(
            event(KIND_TASK_PAIR_CREATED, "s", json!({})).payload(),
            EventPayload::TaskPairCreated
        );
        assert_eq!(
            event(KIND_REVIEW_COMPLETED, "s", json!({"verdict": "approved"})).payload(),
            EventPayload::ReviewCompleted {
                verdict: ReviewVerdict::Approved
            }
        );
        assert_eq!(
            event(KIND_GATE_IDLE, "s", json!({"allowed": false})).payload(),
            EventPayload::IdleGate { allowed: false }
        );
        assert_eq!(
            event("custom.vendor_event", "s", json!({"x": 1})).payload(),
            EventPayload::Other
        );
    }

    #[test]
    fn payload_missing_gate_flag_counts_as_allowed() {
        assert_eq!(
            event(KIND_GATE_COMPLETION, "s", json!({})).payload(),
            EventPayload::CompletionGate { allowed: true }
        );
    }

    #[test]
    fn summary_counts_idle_blocks_and_sessions() {
        let events = vec![
            event(KIND_GATE_IDLE, "a", json!({"allowed": false})),
            event(KIND_GATE_IDLE, "a", json!({"allowed": true})),
            event(KIND_GATE_IDLE, "b", json!({"allowed": false})),
            event(KIND_TASK_PAIR_CREATED, "b", json!({})),
        ];
        let summary = BatchSummary::summarize(&events);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.idle_blocks, 2);
        assert_eq!(summary.kind_count(KIND_GATE_IDLE), 3);
        assert_eq!(summary.sessions_touched.len(), 2);
    }
}
