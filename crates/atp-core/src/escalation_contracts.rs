use crate::events::{Anomaly, AuditEvent, SessionSummary};
use crate::recommendations::Recommendation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTier {
    Triage,
    Analysis,
    DeepDive,
}

impl EscalationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTier::Triage => "triage",
            EscalationTier::Analysis => "analysis",
            EscalationTier::DeepDive => "deep_dive",
        }
    }
}

impl fmt::Display for EscalationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured request handed to the external reasoning engine. Built by a
/// pure function per tier; never executed here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierRequest {
    pub tier: EscalationTier,
    pub model: String,
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directive_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub stats: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_events: Vec<AuditEvent>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config_snapshot: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_summaries: Vec<SessionSummary>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub prior_verdict: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriageClassification {
    KnownPattern,
    EmergingPattern,
    Benign,
}

/// Machine-parseable verdict from the lowest-cost tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageVerdict {
    pub classification: TriageClassification,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisVerdict {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default)]
    pub escalate: bool,
    /// A note the deep-dive tier should investigate systemically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// A threshold adjustment the chain proposes; applying it belongs to a
/// collaborator outside this core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigRangeChange {
    pub key: String,
    pub current: f64,
    pub proposed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeepDiveVerdict {
    pub root_cause: String,
    pub suggestion: String,
    #[serde(default)]
    pub config_changes: Vec<ConfigRangeChange>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn triage_verdict_parses_engine_json() {
        let verdict: TriageVerdict = serde_json::from_value(json!({
            "classification": "emerging_pattern",
            "rationale": "block rate doubled inside one session"
        }))
        .expect("parse");
        assert_eq!(verdict.classification, TriageClassification::EmergingPattern);
        assert!(verdict.suggestion.is_none());
    }

    #[test]
    fn analysis_verdict_defaults_escalate_to_false() {
        let verdict: AnalysisVerdict = serde_json::from_value(json!({
            "summary": "single noisy session, not systemic"
        }))
        .expect("parse");
        assert!(!verdict.escalate);
        assert!(verdict.context.is_none());
    }

    #[test]
    fn deep_dive_verdict_carries_config_changes() {
        let verdict: DeepDiveVerdict = serde_json::from_value(json!({
            "root_cause": "review gate threshold too aggressive for refactors",
            "suggestion": "raise governance_block_rate",
            "config_changes": [
                {"key": "thresholds.governance_block_rate", "current": 0.5, "proposed": 0.65}
            ]
        }))
        .expect("parse");
        assert_eq!(verdict.config_changes.len(), 1);
        assert_eq!(
            verdict.config_changes[0].key,
            "thresholds.governance_block_rate"
        );
    }

    #[test]
    fn tier_request_omits_empty_sections() {
        let request = TierRequest {
            tier: EscalationTier::Triage,
            model: "haiku".to_string(),
            instructions: "classify".to_string(),
            directive_questions: Vec::new(),
            anomalies: Vec::new(),
            stats: Value::Null,
            recent_events: Vec::new(),
            config_snapshot: Value::Null,
            active_recommendations: Vec::new(),
            session_summaries: Vec::new(),
            prior_verdict: Value::Null,
        };
        let json = serde_json::to_string(&request).expect("serialize");
        assert!(!json.contains("recent_events"));
        assert!(!json.contains("prior_verdict"));
    }
}
