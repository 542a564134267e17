use crate::escalation_contracts::EscalationTier;
use crate::events::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const RECOMMENDATION_STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Active,
    Stale,
    Dismissed,
    Resolved,
    Superseded,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendationStatus::Active => "active",
            RecommendationStatus::Stale => "stale",
            RecommendationStatus::Dismissed => "dismissed",
            RecommendationStatus::Resolved => "resolved",
            RecommendationStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deduplicated, stateful suggestion derived from anomalies and escalation
/// verdicts. At most one `active` record exists per `anomaly_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub id: String,
    pub anomaly_type: String,
    pub status: RecommendationStatus,
    pub severity: Severity,
    pub description: String,
    pub suggestion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_tier: Option<EscalationTier>,
    pub category: String,
    pub evidence_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dismissed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    #[serde(default)]
    pub latest_metric_values: BTreeMap<String, f64>,
}

/// On-disk shape of the recommendation store, written whole via
/// temp-then-rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationDocument {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl RecommendationDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: RECOMMENDATION_STORE_VERSION,
            updated_at: now,
            recommendations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn document_round_trips_optional_fields() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp");
        let doc = RecommendationDocument {
            version: RECOMMENDATION_STORE_VERSION,
            updated_at: now,
            recommendations: vec![Recommendation {
                id: "rec-1".to_string(),
                anomaly_type: "high_block_rate".to_string(),
                status: RecommendationStatus::Active,
                severity: Severity::Warning,
                description: "blocked 3/4 reviews".to_string(),
                suggestion: "review gating thresholds".to_string(),
                analysis: None,
                escalation_tier: None,
                category: "governance".to_string(),
                evidence_count: 2,
                created_at: now,
                last_seen_at: now,
                expires_at: now,
                dismissed_reason: None,
                resolved_at: None,
                superseded_by: None,
                latest_metric_values: BTreeMap::from([("block_rate".to_string(), 0.75)]),
            }],
        };

        let json = serde_json::to_string(&doc).expect("serialize");
        assert!(!json.contains("dismissed_reason"));
        let decoded: RecommendationDocument = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, doc);
    }
}
