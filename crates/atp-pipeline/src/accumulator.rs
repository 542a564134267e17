//! Batch ingestion of events into the persistent statistics store.

use crate::PipelineError;
use atp_core::{
    AuditEvent, BatchSummary, EventPayload, ReviewVerdict, SessionSummary, METRIC_EVENTS_PER_HOUR,
};
use atp_storage::{SessionDelta, StatsStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// How far back the rate baseline looks. A sample older than this says
/// nothing about current load.
pub const DEFAULT_BASELINE_LOOKBACK_HOURS: i64 = 24;

pub struct StatsAccumulator<'a> {
    store: &'a StatsStore,
}

impl<'a> StatsAccumulator<'a> {
    pub fn new(store: &'a StatsStore) -> Self {
        Self { store }
    }

    /// Folds one batch into the per-session counters and global kind
    /// counters and returns the derived batch summary. Counters only ever
    /// increase; retention pruning is the only thing that removes rows.
    pub fn ingest(
        &self,
        events: &[AuditEvent],
        now: DateTime<Utc>,
    ) -> Result<BatchSummary, PipelineError> {
        let mut deltas: BTreeMap<&str, SessionDelta> = BTreeMap::new();
        let mut kind_counts: BTreeMap<&str, u64> = BTreeMap::new();

        for event in events {
            let delta = deltas.entry(event.session_id.as_str()).or_default();
            delta.total_events += 1;
            match event.payload() {
                EventPayload::TaskPairCreated => delta.task_count += 1,
                EventPayload::ReviewCompleted {
                    verdict: ReviewVerdict::Approved,
                } => delta.approval_count += 1,
                EventPayload::ReviewCompleted {
                    verdict: ReviewVerdict::Blocked,
                } => delta.block_count += 1,
                EventPayload::CompletionGate { allowed } | EventPayload::IdleGate { allowed } => {
                    if allowed {
                        delta.gate_allow_count += 1;
                    } else {
                        delta.gate_block_count += 1;
                    }
                }
                EventPayload::ReinforcementInjected
                | EventPayload::ReinforcementSkipped
                | EventPayload::Other => {}
            }
            *kind_counts.entry(event.kind.as_str()).or_insert(0) += 1;
        }

        for (session_id, delta) in &deltas {
            self.store.apply_session_delta(session_id, delta, now)?;
        }
        for (kind, count) in &kind_counts {
            self.store.bump_kind_counter(kind, *count)?;
        }
        debug!(
            events = events.len(),
            sessions = deltas.len(),
            "batch folded into statistics"
        );
        Ok(BatchSummary::summarize(events))
    }

    /// Records the observed event rate for this pass so later passes can
    /// use it as a spike baseline.
    pub fn record_rate_sample(
        &self,
        events_per_hour: f64,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.store
            .record_metric_sample(METRIC_EVENTS_PER_HOUR, events_per_hour, now)?;
        Ok(())
    }

    /// The most recent rate sample inside the lookback window. `None`
    /// means insufficient data; callers must not substitute zero, a zero
    /// baseline would flag every batch as a spike.
    pub fn baseline_rate(&self, now: DateTime<Utc>) -> Result<Option<f64>, PipelineError> {
        let cutoff = now - Duration::hours(DEFAULT_BASELINE_LOOKBACK_HOURS);
        Ok(self
            .store
            .latest_metric_sample(METRIC_EVENTS_PER_HOUR, cutoff)?)
    }

    pub fn session_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, PipelineError> {
        Ok(self.store.session_summary(session_id)?)
    }

    pub fn session_summaries(&self) -> Result<Vec<SessionSummary>, PipelineError> {
        Ok(self.store.session_summaries()?)
    }

    pub fn prune_old_data(&self, cutoff: DateTime<Utc>) -> Result<usize, PipelineError> {
        Ok(self.store.prune_old_data(cutoff)?)
    }
}
