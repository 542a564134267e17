//! Threshold checks over a batch summary and accumulated session state.
//!
//! Every check is independent and pure. A check whose preconditions are
//! unmet (too few samples, no baseline) emits nothing; missing data is
//! never read as either presence or absence of a problem.

use atp_core::{
    Anomaly, BatchSummary, SessionSummary, Severity, Thresholds, ANOMALY_EVENT_RATE_SPIKE,
    ANOMALY_HIGH_BLOCK_RATE, ANOMALY_HIGH_GATE_BLOCK_RATE, ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE,
    ANOMALY_REPEATED_IDLE_BLOCKS, KIND_REINFORCEMENT_INJECTED, KIND_REINFORCEMENT_SKIPPED,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Gate block rate trips at this fixed ratio; it is deliberately not a
/// configurable threshold.
const GATE_BLOCK_RATE_LIMIT: f64 = 0.5;
const GATE_MIN_SAMPLES: u64 = 3;
const REINFORCEMENT_MIN_SAMPLES: usize = 3;
const BLOCK_RATE_MIN_TASKS: u64 = 2;

pub fn detect_anomalies(
    summary: &BatchSummary,
    sessions: &[SessionSummary],
    baseline_events_per_hour: Option<f64>,
    thresholds: &Thresholds,
    detected_at: DateTime<Utc>,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    check_block_rate(sessions, thresholds, detected_at, &mut anomalies);
    check_gate_block_rate(sessions, detected_at, &mut anomalies);
    check_event_rate_spike(
        summary,
        baseline_events_per_hour,
        thresholds,
        detected_at,
        &mut anomalies,
    );
    check_repeated_idle_blocks(summary, thresholds, detected_at, &mut anomalies);
    check_reinforcement_skip_rate(summary, thresholds, detected_at, &mut anomalies);
    anomalies
}

fn check_block_rate(
    sessions: &[SessionSummary],
    thresholds: &Thresholds,
    detected_at: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    for session in sessions {
        let reviews = session.approval_count + session.block_count;
        if session.task_count < BLOCK_RATE_MIN_TASKS || reviews == 0 {
            continue;
        }
        let block_rate = session.block_count as f64 / reviews as f64;
        if block_rate > thresholds.governance_block_rate {
            out.push(Anomaly::new(
                ANOMALY_HIGH_BLOCK_RATE,
                Severity::Warning,
                format!(
                    "session {} has {} of {} reviews blocked (rate {:.2})",
                    session.session_id, session.block_count, reviews, block_rate
                ),
                BTreeMap::from([
                    ("block_rate".to_string(), block_rate),
                    ("block_count".to_string(), session.block_count as f64),
                    ("approval_count".to_string(), session.approval_count as f64),
                ]),
                detected_at,
            ));
        }
    }
}

fn check_gate_block_rate(
    sessions: &[SessionSummary],
    detected_at: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    for session in sessions {
        let gates = session.gate_block_count + session.gate_allow_count;
        if gates < GATE_MIN_SAMPLES {
            continue;
        }
        let gate_block_rate = session.gate_block_count as f64 / gates as f64;
        if gate_block_rate > GATE_BLOCK_RATE_LIMIT {
            out.push(Anomaly::new(
                ANOMALY_HIGH_GATE_BLOCK_RATE,
                Severity::Warning,
                format!(
                    "session {} has {} of {} gate decisions blocked (rate {:.2})",
                    session.session_id, session.gate_block_count, gates, gate_block_rate
                ),
                BTreeMap::from([
                    ("gate_block_rate".to_string(), gate_block_rate),
                    (
                        "gate_block_count".to_string(),
                        session.gate_block_count as f64,
                    ),
                    (
                        "gate_allow_count".to_string(),
                        session.gate_allow_count as f64,
                    ),
                ]),
                detected_at,
            ));
        }
    }
}

fn check_event_rate_spike(
    summary: &BatchSummary,
    baseline_events_per_hour: Option<f64>,
    thresholds: &Thresholds,
    detected_at: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    // No baseline means no verdict, not a spike against zero.
    let Some(baseline) = baseline_events_per_hour else {
        return;
    };
    if summary.total == 0 || baseline <= 0.0 {
        return;
    }
    let limit = baseline * thresholds.event_rate_spike_multiplier;
    if summary.total as f64 > limit {
        out.push(Anomaly::new(
            ANOMALY_EVENT_RATE_SPIKE,
            Severity::Info,
            format!(
                "batch of {} events exceeds {:.1} ({} x baseline {:.1}/h)",
                summary.total, limit, thresholds.event_rate_spike_multiplier, baseline
            ),
            BTreeMap::from([
                ("batch_total".to_string(), summary.total as f64),
                ("baseline".to_string(), baseline),
                (
                    "multiplier".to_string(),
                    thresholds.event_rate_spike_multiplier,
                ),
            ]),
            detected_at,
        ));
    }
}

fn check_repeated_idle_blocks(
    summary: &BatchSummary,
    thresholds: &Thresholds,
    detected_at: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    if summary.idle_blocks >= thresholds.idle_block_count as usize
        && thresholds.idle_block_count > 0
    {
        out.push(Anomaly::new(
            ANOMALY_REPEATED_IDLE_BLOCKS,
            Severity::Warning,
            format!(
                "{} idle-gate blocks in one batch (threshold {})",
                summary.idle_blocks, thresholds.idle_block_count
            ),
            BTreeMap::from([
                ("idle_blocks".to_string(), summary.idle_blocks as f64),
                (
                    "threshold".to_string(),
                    f64::from(thresholds.idle_block_count),
                ),
            ]),
            detected_at,
        ));
    }
}

fn check_reinforcement_skip_rate(
    summary: &BatchSummary,
    thresholds: &Thresholds,
    detected_at: DateTime<Utc>,
    out: &mut Vec<Anomaly>,
) {
    let skips = summary.kind_count(KIND_REINFORCEMENT_SKIPPED);
    let injections = summary.kind_count(KIND_REINFORCEMENT_INJECTED);
    let samples = skips + injections;
    if samples < REINFORCEMENT_MIN_SAMPLES {
        return;
    }
    let skip_rate = skips as f64 / samples as f64;
    if skip_rate > thresholds.reinforcement_skip_rate {
        out.push(Anomaly::new(
            ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE,
            Severity::Warning,
            format!(
                "{} of {} reinforcements skipped (rate {:.2})",
                skips, samples, skip_rate
            ),
            BTreeMap::from([
                ("skip_rate".to_string(), skip_rate),
                ("skips".to_string(), skips as f64),
                ("injections".to_string(), injections as f64),
            ]),
            detected_at,
        ));
    }
}
