//! Deduplicated, stateful recommendations derived from anomalies.
//!
//! The manager is the only writer of the recommendation store. Every
//! mutation rewrites the whole document through a temp file and an
//! atomic rename; a failed write leaves the in-memory state ahead of
//! disk until the next successful save.

use atp_core::{
    Anomaly, EscalationTier, Recommendation, RecommendationDocument, RecommendationStatus,
    ANOMALY_EVENT_RATE_SPIKE, ANOMALY_HIGH_BLOCK_RATE, ANOMALY_HIGH_GATE_BLOCK_RATE,
    ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE, ANOMALY_REPEATED_IDLE_BLOCKS,
};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_RECOMMENDATION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

pub struct RecommendationManager {
    path: PathBuf,
    document: RecommendationDocument,
}

impl RecommendationManager {
    /// Loads the store from disk. A missing or malformed file starts an
    /// empty document rather than failing; the store is derived state and
    /// can always be rebuilt from fresh anomalies.
    pub fn load(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let document = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| RecommendationDocument::empty(now));
        Self { path, document }
    }

    /// Upserts against the single active record per anomaly type. A hit
    /// increments `evidence_count`, resets the TTL from `now`, and takes
    /// the anomaly's latest metric values; prior stale or dismissed
    /// records of the same type do not block a fresh record.
    pub fn create_from_anomaly(
        &mut self,
        anomaly: &Anomaly,
        suggestion: Option<String>,
        category: Option<String>,
        ttl_seconds: Option<i64>,
        now: DateTime<Utc>,
    ) -> Recommendation {
        let ttl = Duration::seconds(ttl_seconds.unwrap_or(DEFAULT_RECOMMENDATION_TTL_SECONDS));

        if let Some(existing) = self
            .document
            .recommendations
            .iter_mut()
            .find(|rec| rec.status == RecommendationStatus::Active && rec.anomaly_type == anomaly.kind)
        {
            existing.evidence_count += 1;
            existing.last_seen_at = now;
            existing.expires_at = now + ttl;
            existing.severity = anomaly.severity;
            existing.description = anomaly.description.clone();
            existing.latest_metric_values = anomaly.metric_values.clone();
            let updated = existing.clone();
            self.save(now);
            return updated;
        }

        let recommendation = Recommendation {
            id: Uuid::new_v4().to_string(),
            anomaly_type: anomaly.kind.clone(),
            status: RecommendationStatus::Active,
            severity: anomaly.severity,
            description: anomaly.description.clone(),
            suggestion: suggestion
                .unwrap_or_else(|| format!("Investigate recurring {} anomalies", anomaly.kind)),
            analysis: None,
            escalation_tier: None,
            category: category.unwrap_or_else(|| default_category(&anomaly.kind).to_string()),
            evidence_count: 1,
            created_at: now,
            last_seen_at: now,
            expires_at: now + ttl,
            dismissed_reason: None,
            resolved_at: None,
            superseded_by: None,
            latest_metric_values: anomaly.metric_values.clone(),
        };
        self.document.recommendations.push(recommendation.clone());
        self.save(now);
        recommendation
    }

    /// Overwrites suggestion, analysis, and tier on the active record for
    /// the anomaly type. Escalation never creates records; only detected
    /// anomalies do.
    pub fn update_from_escalation(
        &mut self,
        anomaly_type: &str,
        suggestion: String,
        analysis: Option<String>,
        tier: EscalationTier,
        now: DateTime<Utc>,
    ) -> Option<Recommendation> {
        let record = self
            .document
            .recommendations
            .iter_mut()
            .find(|rec| rec.status == RecommendationStatus::Active && rec.anomaly_type == anomaly_type)?;
        record.suggestion = suggestion;
        record.analysis = analysis;
        record.escalation_tier = Some(tier);
        record.last_seen_at = now;
        let updated = record.clone();
        self.save(now);
        Some(updated)
    }

    /// Dismissal is terminal and requires a reason.
    pub fn dismiss(&mut self, id: &str, reason: &str, now: DateTime<Utc>) -> bool {
        if reason.trim().is_empty() {
            return false;
        }
        let Some(record) = self.active_by_id(id) else {
            return false;
        };
        record.status = RecommendationStatus::Dismissed;
        record.dismissed_reason = Some(reason.trim().to_string());
        self.save(now);
        true
    }

    pub fn resolve(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(record) = self.active_by_id(id) else {
            return false;
        };
        record.status = RecommendationStatus::Resolved;
        record.resolved_at = Some(now);
        self.save(now);
        true
    }

    pub fn supersede(&mut self, old_id: &str, new_id: &str, now: DateTime<Utc>) -> bool {
        let Some(record) = self.active_by_id(old_id) else {
            return false;
        };
        record.status = RecommendationStatus::Superseded;
        record.superseded_by = Some(new_id.to_string());
        self.save(now);
        true
    }

    /// Moves every expired active record to stale. Runs before any
    /// active-listing read so staleness is consistent at read time.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for record in &mut self.document.recommendations {
            if record.status == RecommendationStatus::Active && record.expires_at <= now {
                record.status = RecommendationStatus::Stale;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "expired recommendations went stale");
            self.save(now);
        }
        expired
    }

    /// Retention for terminal records: stale, dismissed, resolved, and
    /// superseded entries last seen before the cutoff are removed from
    /// the store. Active records are never removed here, regardless of
    /// age; expiry moves them to stale first.
    pub fn prune_terminal(&mut self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let before = self.document.recommendations.len();
        self.document.recommendations.retain(|rec| {
            rec.status == RecommendationStatus::Active || rec.last_seen_at >= cutoff
        });
        let removed = before - self.document.recommendations.len();
        if removed > 0 {
            debug!(removed, "terminal recommendations dropped by retention");
            self.save(now);
        }
        removed
    }

    /// Active records, most evidence first. Ties keep insertion order.
    pub fn get_active(&mut self, now: DateTime<Utc>) -> Vec<Recommendation> {
        self.prune_expired(now);
        let mut active: Vec<Recommendation> = self
            .document
            .recommendations
            .iter()
            .filter(|rec| rec.status == RecommendationStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.evidence_count.cmp(&a.evidence_count));
        active
    }

    pub fn all(&self) -> &[Recommendation] {
        &self.document.recommendations
    }

    fn active_by_id(&mut self, id: &str) -> Option<&mut Recommendation> {
        self.document
            .recommendations
            .iter_mut()
            .find(|rec| rec.status == RecommendationStatus::Active && rec.id == id)
    }

    fn save(&mut self, now: DateTime<Utc>) {
        self.document.updated_at = now;
        if let Err(err) = self.write_document() {
            warn!(error = %err, "failed to persist recommendation store");
        }
    }

    fn write_document(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.document)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

fn default_category(anomaly_kind: &str) -> &'static str {
    match anomaly_kind {
        ANOMALY_HIGH_BLOCK_RATE | ANOMALY_HIGH_GATE_BLOCK_RATE => "governance",
        ANOMALY_EVENT_RATE_SPIKE => "activity",
        ANOMALY_REPEATED_IDLE_BLOCKS => "workflow",
        ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE => "reinforcement",
        _ => "general",
    }
}
