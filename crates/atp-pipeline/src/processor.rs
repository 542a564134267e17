//! Batch processing pass: drain new events, fold statistics, detect,
//! recommend, escalate.
//!
//! At most one processor runs at a time, enforced by an exclusive file
//! lock. Passes are idempotent-safe to re-run; the ingestion cursor makes
//! each event count once in the common case, and the accumulator is
//! additive when a crashed pass replays a batch.

use crate::accumulator::StatsAccumulator;
use crate::detector::detect_anomalies;
use crate::escalation::{EscalationChain, EscalationContext, EscalationReport, ReasoningEngine};
use crate::recommendations::RecommendationManager;
use crate::PipelineError;
use atp_core::{load_directives, Anomaly, AuditConfig, AuditEvent, AuditPaths, BatchSummary};
use atp_storage::{StatsStore, EVENT_LOG_CURSOR};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Exclusive processor lock. The file carries owner metadata for humans
/// inspecting a wedged pipeline; the OS lock is what actually excludes.
pub struct ProcessorLock {
    path: PathBuf,
    file: File,
}

impl ProcessorLock {
    pub fn acquire(path: &Path, now: DateTime<Utc>) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(PipelineError::LockHeld);
        }
        file.set_len(0)?;
        let metadata = json!({
            "pid": std::process::id(),
            "acquired_at": now.to_rfc3339(),
        });
        serde_json::to_writer(&file, &metadata)?;
        file.sync_all().ok();
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for ProcessorLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(error = %err, "failed to remove processor lock file");
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub events_processed: usize,
    pub cursor: u64,
    pub anomalies: Vec<Anomaly>,
    pub recommendations_touched: usize,
    pub escalation: Option<EscalationReport>,
}

pub struct Processor<'a> {
    paths: AuditPaths,
    config: AuditConfig,
    store: &'a StatsStore,
    engine: Option<&'a dyn ReasoningEngine>,
}

impl<'a> Processor<'a> {
    pub fn new(
        paths: AuditPaths,
        config: AuditConfig,
        store: &'a StatsStore,
        engine: Option<&'a dyn ReasoningEngine>,
    ) -> Self {
        Self {
            paths,
            config,
            store,
            engine,
        }
    }

    /// One full pass over everything appended since the last cursor.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<ProcessReport, PipelineError> {
        let _lock = ProcessorLock::acquire(&self.paths.processor_lock, now)?;

        let previous_pass_at = self.store.cursor_updated_at(EVENT_LOG_CURSOR)?;
        let cursor = self.store.cursor(EVENT_LOG_CURSOR)?;
        let (events, new_cursor) = self.read_new_events(cursor)?;
        if events.is_empty() {
            self.store.set_cursor(EVENT_LOG_CURSOR, new_cursor, now)?;
            debug!(cursor = new_cursor, "no new events to process");
            return Ok(ProcessReport {
                cursor: new_cursor,
                ..ProcessReport::default()
            });
        }

        let accumulator = StatsAccumulator::new(self.store);
        // Baseline is read before this pass's sample lands, so a burst is
        // judged against history rather than against itself.
        let baseline = accumulator.baseline_rate(now)?;
        let summary = accumulator.ingest(&events, now)?;

        let mut touched_sessions = Vec::new();
        for session_id in &summary.sessions_touched {
            if let Some(session) = accumulator.session_summary(session_id)? {
                touched_sessions.push(session);
            }
        }

        let anomalies = detect_anomalies(
            &summary,
            &touched_sessions,
            baseline,
            &self.config.thresholds,
            now,
        );
        let window_start = previous_pass_at.or_else(|| events.first().and_then(AuditEvent::detected_at));
        accumulator.record_rate_sample(observed_rate(&summary, window_start, now), now)?;

        if self.config.anomaly_flush {
            for anomaly in &anomalies {
                self.store.insert_anomaly(anomaly)?;
            }
        }

        let mut manager = RecommendationManager::load(&self.paths.recommendations, now);
        for anomaly in &anomalies {
            manager.create_from_anomaly(anomaly, None, None, None, now);
        }

        let escalation = if self.config.llm_analysis_enabled {
            self.escalate(&anomalies, &events, &mut manager, now)
        } else {
            None
        };
        if let Some(report) = &escalation {
            if self.config.anomaly_flush {
                for anomaly_id in &report.escalated_anomaly_ids {
                    self.store.mark_anomaly_escalated(anomaly_id)?;
                }
            }
        }

        self.store.set_cursor(EVENT_LOG_CURSOR, new_cursor, now)?;
        info!(
            events = events.len(),
            anomalies = anomalies.len(),
            cursor = new_cursor,
            "processing pass complete"
        );
        Ok(ProcessReport {
            events_processed: events.len(),
            cursor: new_cursor,
            recommendations_touched: anomalies.len(),
            anomalies,
            escalation,
        })
    }

    /// Event-log retention, separate from the hot path. Runs only when
    /// the cursor has consumed the whole log, so no unprocessed event can
    /// be dropped; retained lines are rewritten through a temp file and
    /// the cursor moves to the new end. Returns lines removed.
    pub fn prune_events(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        let _lock = ProcessorLock::acquire(&self.paths.processor_lock, now)?;

        let raw = match std::fs::read(&self.paths.event_log) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let cursor = self.store.cursor(EVENT_LOG_CURSOR)?;
        if raw.len() as u64 != cursor {
            debug!(cursor, length = raw.len(), "log has an unprocessed tail, skipping prune");
            return Ok(0);
        }

        let mut kept = Vec::with_capacity(raw.len());
        let mut removed = 0usize;
        for line in raw.split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            // Already-consumed malformed lines are dropped with the old
            // events.
            let fresh = serde_json::from_slice::<AuditEvent>(line)
                .ok()
                .and_then(|event| event.detected_at())
                .is_some_and(|detected| detected >= cutoff);
            if fresh {
                kept.extend_from_slice(line);
                kept.push(b'\n');
            } else {
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(0);
        }

        let temp = self.paths.event_log.with_extension("jsonl.tmp");
        std::fs::write(&temp, &kept)?;
        std::fs::rename(&temp, &self.paths.event_log)?;
        self.store
            .set_cursor(EVENT_LOG_CURSOR, kept.len() as u64, now)?;
        info!(removed, retained = kept.len(), "event log pruned");
        Ok(removed)
    }

    /// Escalation is best-effort: an engine failure costs this pass's
    /// verdicts, never the already-persisted statistics.
    fn escalate(
        &self,
        anomalies: &[Anomaly],
        events: &[AuditEvent],
        manager: &mut RecommendationManager,
        now: DateTime<Utc>,
    ) -> Option<EscalationReport> {
        let engine = self.engine?;
        if anomalies.is_empty() {
            return None;
        }
        let directives = load_directives(&self.paths.directives);
        if directives.is_empty() {
            return None;
        }

        let session_summaries = match self.store.session_summaries() {
            Ok(summaries) => summaries,
            Err(err) => {
                warn!(error = %err, "skipping escalation, stats unavailable");
                return None;
            }
        };
        let context = EscalationContext {
            stats: json!({
                "sessions": session_summaries.len(),
                "active_recommendations": manager.get_active(now).len(),
            }),
            recent_events: events.to_vec(),
            config_snapshot: serde_json::to_value(&self.config).unwrap_or_default(),
            active_recommendations: manager.get_active(now),
            session_summaries,
        };

        let chain = EscalationChain::new(self.config.clone());
        match chain.run(engine, anomalies, &directives, &context, manager, now) {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "escalation chain failed");
                None
            }
        }
    }

    /// Reads complete lines appended after the cursor. A shrunken log
    /// means rotation or truncation; the cursor resets to the start. A
    /// trailing line without its newline is a write in progress and is
    /// left for the next pass. Malformed complete lines are skipped but
    /// still consumed.
    fn read_new_events(&self, cursor: u64) -> Result<(Vec<AuditEvent>, u64), PipelineError> {
        let mut file = match File::open(&self.paths.event_log) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), 0));
            }
            Err(err) => return Err(err.into()),
        };

        let length = file.metadata()?.len();
        let start = if length < cursor {
            warn!(cursor, length, "event log shrank, resetting cursor");
            0
        } else {
            cursor
        };

        file.seek(SeekFrom::Start(start))?;
        let mut buffer = Vec::with_capacity((length - start) as usize);
        file.read_to_end(&mut buffer)?;

        let complete = match buffer.iter().rposition(|byte| *byte == b'\n') {
            Some(position) => position + 1,
            None => return Ok((Vec::new(), start)),
        };

        let mut events = Vec::new();
        for line in buffer[..complete].split(|byte| *byte == b'\n') {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(error = %err, "skipping malformed event line");
                }
            }
        }
        Ok((events, start + complete as u64))
    }
}

/// Events per hour observed by this pass. The window opens at the
/// previous pass, or failing that at the batch's first event; a
/// sub-minute window is clamped so one quick double-pass cannot
/// fabricate a huge rate.
fn observed_rate(
    summary: &BatchSummary,
    window_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    const MIN_WINDOW_SECONDS: i64 = 60;
    let elapsed_seconds = window_start
        .map(|start| (now - start).num_seconds())
        .unwrap_or(3_600)
        .max(MIN_WINDOW_SECONDS);
    summary.total as f64 * 3_600.0 / elapsed_seconds as f64
}
