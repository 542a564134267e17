//! Directive matching and tiered escalation requests.
//!
//! The chain builds progressively deeper structured requests and hands
//! them to an external reasoning engine. It never reasons itself, and it
//! never creates recommendations; verdicts only update records that
//! detected anomalies already created.

use crate::recommendations::RecommendationManager;
use crate::PipelineError;
use atp_core::{
    AnalysisVerdict, Anomaly, AuditConfig, AuditEvent, ConfigRangeChange, DeepDiveVerdict,
    Directive, EscalationTier, Recommendation, SessionSummary, TierRequest, TriageClassification,
    TriageVerdict,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Pairs every anomaly with every directive watching its kind. One
/// anomaly can match several directives and vice versa. Each directive's
/// patterns are compiled once up front, not per anomaly.
pub fn match_directives<'a>(
    anomalies: &'a [Anomaly],
    directives: &'a [Directive],
) -> Vec<(&'a Anomaly, &'a Directive)> {
    let compiled: Vec<_> = directives
        .iter()
        .map(|directive| (directive, directive.compiled_watches()))
        .collect();
    let mut matched = Vec::new();
    for anomaly in anomalies {
        for (directive, patterns) in &compiled {
            if patterns.iter().any(|pattern| pattern.matches(&anomaly.kind)) {
                matched.push((anomaly, *directive));
            }
        }
    }
    matched
}

/// The external reasoning service. It consumes a structured request and
/// returns structured JSON; everything about how it reasons is opaque.
pub trait ReasoningEngine {
    fn triage(&self, request: &TierRequest) -> Result<TriageVerdict, PipelineError>;
    fn analyze(&self, request: &TierRequest) -> Result<AnalysisVerdict, PipelineError>;
    fn deep_dive(&self, request: &TierRequest) -> Result<DeepDiveVerdict, PipelineError>;
}

/// Everything a processing pass gathers for the chain to embed in its
/// requests. Which pieces each tier uses is fixed per tier.
#[derive(Debug, Clone, Default)]
pub struct EscalationContext {
    pub stats: Value,
    pub recent_events: Vec<AuditEvent>,
    pub config_snapshot: Value,
    pub active_recommendations: Vec<Recommendation>,
    pub session_summaries: Vec<SessionSummary>,
}

#[derive(Debug, Clone)]
pub struct EscalationReport {
    pub tier_reached: EscalationTier,
    pub matched_pairs: usize,
    pub triage: TriageVerdict,
    pub analysis: Option<AnalysisVerdict>,
    pub deep_dive: Option<DeepDiveVerdict>,
    /// Threshold adjustments proposed at the deep-dive tier. Applying
    /// them belongs to a collaborator outside this pipeline.
    pub proposed_config_changes: Vec<ConfigRangeChange>,
    pub escalated_anomaly_ids: Vec<String>,
}

pub struct EscalationChain {
    config: AuditConfig,
}

impl EscalationChain {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    pub fn build_triage_request(
        &self,
        matched: &[(&Anomaly, &Directive)],
        context: &EscalationContext,
    ) -> TierRequest {
        TierRequest {
            tier: EscalationTier::Triage,
            model: self.config.models.triage.clone(),
            instructions: "Classify the matched anomalies as known_pattern, emerging_pattern, \
                           or benign. Answer each directive question briefly. Respond with JSON \
                           {classification, rationale, suggestion?}."
                .to_string(),
            directive_questions: directive_questions(matched),
            anomalies: matched_anomalies(matched),
            stats: context.stats.clone(),
            recent_events: Vec::new(),
            config_snapshot: Value::Null,
            active_recommendations: context.active_recommendations.clone(),
            session_summaries: Vec::new(),
            prior_verdict: Value::Null,
        }
    }

    pub fn build_analysis_request(
        &self,
        matched: &[(&Anomaly, &Directive)],
        triage: &TriageVerdict,
        context: &EscalationContext,
    ) -> TierRequest {
        TierRequest {
            tier: EscalationTier::Analysis,
            model: self.config.models.analysis.clone(),
            instructions: "Analyze why these anomalies are emerging, using the raw event window \
                           and current configuration. Respond with JSON {summary, suggestion?, \
                           escalate, context?}; set escalate only for suspected systemic causes."
                .to_string(),
            directive_questions: directive_questions(matched),
            anomalies: matched_anomalies(matched),
            stats: context.stats.clone(),
            recent_events: self.event_window(context),
            config_snapshot: context.config_snapshot.clone(),
            active_recommendations: context.active_recommendations.clone(),
            session_summaries: Vec::new(),
            prior_verdict: serde_json::to_value(triage).unwrap_or(Value::Null),
        }
    }

    pub fn build_deep_dive_request(
        &self,
        matched: &[(&Anomaly, &Directive)],
        analysis: &AnalysisVerdict,
        context: &EscalationContext,
    ) -> TierRequest {
        TierRequest {
            tier: EscalationTier::DeepDive,
            model: self.config.models.deep_dive.clone(),
            instructions: "Find the root cause across sessions and propose concrete \
                           configuration range changes. Respond with JSON {root_cause, \
                           suggestion, config_changes: [{key, current, proposed, rationale?}]}."
                .to_string(),
            directive_questions: directive_questions(matched),
            anomalies: matched_anomalies(matched),
            stats: context.stats.clone(),
            recent_events: self.event_window(context),
            config_snapshot: context.config_snapshot.clone(),
            active_recommendations: context.active_recommendations.clone(),
            session_summaries: context.session_summaries.clone(),
            prior_verdict: serde_json::to_value(analysis).unwrap_or(Value::Null),
        }
    }

    /// Runs the chain against matched anomalies, folding each verdict into
    /// the recommendation store. Stops at the first tier whose verdict does
    /// not ask to go deeper.
    pub fn run(
        &self,
        engine: &dyn ReasoningEngine,
        anomalies: &[Anomaly],
        directives: &[Directive],
        context: &EscalationContext,
        manager: &mut RecommendationManager,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationReport>, PipelineError> {
        let matched = match_directives(anomalies, directives);
        if matched.is_empty() {
            debug!("no anomaly matched a watch directive");
            return Ok(None);
        }
        let escalated_anomaly_ids: Vec<String> = matched
            .iter()
            .map(|(anomaly, _)| anomaly.id.clone())
            .collect();
        let kinds: BTreeSet<&str> = matched
            .iter()
            .map(|(anomaly, _)| anomaly.kind.as_str())
            .collect();

        let triage = engine.triage(&self.build_triage_request(&matched, context))?;
        info!(classification = ?triage.classification, "triage verdict received");

        if triage.classification != TriageClassification::EmergingPattern {
            if let Some(suggestion) = &triage.suggestion {
                for kind in &kinds {
                    manager.update_from_escalation(
                        kind,
                        suggestion.clone(),
                        Some(triage.rationale.clone()),
                        EscalationTier::Triage,
                        now,
                    );
                }
            }
            return Ok(Some(EscalationReport {
                tier_reached: EscalationTier::Triage,
                matched_pairs: matched.len(),
                triage,
                analysis: None,
                deep_dive: None,
                proposed_config_changes: Vec::new(),
                escalated_anomaly_ids,
            }));
        }

        let analysis = engine.analyze(&self.build_analysis_request(&matched, &triage, context))?;
        let suggestion = analysis
            .suggestion
            .clone()
            .unwrap_or_else(|| analysis.summary.clone());
        for kind in &kinds {
            manager.update_from_escalation(
                kind,
                suggestion.clone(),
                Some(analysis.summary.clone()),
                EscalationTier::Analysis,
                now,
            );
        }

        if !analysis.escalate {
            return Ok(Some(EscalationReport {
                tier_reached: EscalationTier::Analysis,
                matched_pairs: matched.len(),
                triage,
                analysis: Some(analysis),
                deep_dive: None,
                proposed_config_changes: Vec::new(),
                escalated_anomaly_ids,
            }));
        }

        let deep_dive =
            engine.deep_dive(&self.build_deep_dive_request(&matched, &analysis, context))?;
        for kind in &kinds {
            manager.update_from_escalation(
                kind,
                deep_dive.suggestion.clone(),
                Some(deep_dive.root_cause.clone()),
                EscalationTier::DeepDive,
                now,
            );
        }

        Ok(Some(EscalationReport {
            tier_reached: EscalationTier::DeepDive,
            matched_pairs: matched.len(),
            triage,
            analysis: Some(analysis),
            proposed_config_changes: deep_dive.config_changes.clone(),
            deep_dive: Some(deep_dive),
            escalated_anomaly_ids,
        }))
    }

    fn event_window(&self, context: &EscalationContext) -> Vec<AuditEvent> {
        let window = self.config.event_window();
        let events = &context.recent_events;
        let start = events.len().saturating_sub(window);
        events[start..].to_vec()
    }
}

fn directive_questions(matched: &[(&Anomaly, &Directive)]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    matched
        .iter()
        .filter(|(_, directive)| seen.insert(directive.id.clone()))
        .map(|(_, directive)| directive.haiku_question.clone())
        .collect()
}

fn matched_anomalies(matched: &[(&Anomaly, &Directive)]) -> Vec<Anomaly> {
    let mut seen = BTreeSet::new();
    matched
        .iter()
        .filter(|(anomaly, _)| seen.insert(anomaly.id.clone()))
        .map(|(anomaly, _)| (*anomaly).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_core::Severity;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn anomaly(kind: &str) -> Anomaly {
        Anomaly::new(
            kind,
            Severity::Warning,
            format!("{kind} over threshold"),
            BTreeMap::new(),
            ts(),
        )
    }

    fn directive(id: &str, watches: &[&str]) -> Directive {
        Directive {
            id: id.to_string(),
            description: String::new(),
            watches: watches.iter().map(|w| w.to_string()).collect(),
            haiku_question: format!("is {id} expected?"),
        }
    }

    /// Scripted engine that records which tiers ran.
    struct ScriptedEngine {
        triage: TriageVerdict,
        analysis: AnalysisVerdict,
        deep_dive: DeepDiveVerdict,
        tiers_run: RefCell<Vec<EscalationTier>>,
    }

    impl ScriptedEngine {
        fn new(classification: TriageClassification, escalate: bool) -> Self {
            Self {
                triage: TriageVerdict {
                    classification,
                    rationale: "scripted".to_string(),
                    suggestion: Some("watch it".to_string()),
                },
                analysis: AnalysisVerdict {
                    summary: "block surge follows a config rollout".to_string(),
                    suggestion: Some("revert the rollout".to_string()),
                    escalate,
                    context: None,
                },
                deep_dive: DeepDiveVerdict {
                    root_cause: "threshold too tight for refactor sessions".to_string(),
                    suggestion: "raise governance_block_rate".to_string(),
                    config_changes: vec![ConfigRangeChange {
                        key: "thresholds.governance_block_rate".to_string(),
                        current: 0.5,
                        proposed: 0.65,
                        rationale: None,
                    }],
                },
                tiers_run: RefCell::new(Vec::new()),
            }
        }
    }

    impl ReasoningEngine for ScriptedEngine {
        fn triage(&self, request: &TierRequest) -> Result<TriageVerdict, PipelineError> {
            assert_eq!(request.tier, EscalationTier::Triage);
            self.tiers_run.borrow_mut().push(request.tier);
            Ok(self.triage.clone())
        }

        fn analyze(&self, request: &TierRequest) -> Result<AnalysisVerdict, PipelineError> {
            assert_eq!(request.tier, EscalationTier::Analysis);
            self.tiers_run.borrow_mut().push(request.tier);
            Ok(self.analysis.clone())
        }

        fn deep_dive(&self, request: &TierRequest) -> Result<DeepDiveVerdict, PipelineError> {
            assert_eq!(request.tier, EscalationTier::DeepDive);
            self.tiers_run.borrow_mut().push(request.tier);
            Ok(self.deep_dive.clone())
        }
    }

    fn run_chain(
        engine: &ScriptedEngine,
        manager: &mut RecommendationManager,
    ) -> Option<EscalationReport> {
        let chain = EscalationChain::new(AuditConfig::default());
        let anomalies = vec![anomaly("high_block_rate")];
        let directives = vec![directive("d1", &["high_*"])];
        chain
            .run(
                engine,
                &anomalies,
                &directives,
                &EscalationContext::default(),
                manager,
                ts(),
            )
            .expect("chain run")
    }

    #[test]
    fn matching_honors_all_three_pattern_shapes() {
        let anomalies = vec![anomaly("high_block_rate"), anomaly("event_rate_spike")];
        let directives = vec![
            directive("star", &["*"]),
            directive("prefix", &["high_*"]),
            directive("exact", &["event_rate_spike"]),
            directive("miss", &["gate.*"]),
        ];
        let matched = match_directives(&anomalies, &directives);
        let pairs: Vec<(&str, &str)> = matched
            .iter()
            .map(|(a, d)| (a.kind.as_str(), d.id.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("high_block_rate", "star"),
                ("high_block_rate", "prefix"),
                ("event_rate_spike", "star"),
                ("event_rate_spike", "exact"),
            ]
        );
    }

    #[test]
    fn unmatched_anomalies_never_reach_the_engine() {
        let chain = EscalationChain::new(AuditConfig::default());
        let engine = ScriptedEngine::new(TriageClassification::EmergingPattern, true);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = RecommendationManager::load(dir.path().join("recs.json"), ts());

        let report = chain
            .run(
                &engine,
                &[anomaly("high_block_rate")],
                &[directive("d1", &["gate.*"])],
                &EscalationContext::default(),
                &mut manager,
                ts(),
            )
            .expect("chain run");
        assert!(report.is_none());
        assert!(engine.tiers_run.borrow().is_empty());
    }

    #[test]
    fn benign_triage_stops_at_the_first_tier() {
        let engine = ScriptedEngine::new(TriageClassification::Benign, true);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = RecommendationManager::load(dir.path().join("recs.json"), ts());

        let report = run_chain(&engine, &mut manager).expect("matched");
        assert_eq!(report.tier_reached, EscalationTier::Triage);
        assert!(report.analysis.is_none());
        assert_eq!(*engine.tiers_run.borrow(), vec![EscalationTier::Triage]);
    }

    #[test]
    fn emerging_pattern_descends_until_escalate_clears() {
        let engine = ScriptedEngine::new(TriageClassification::EmergingPattern, false);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = RecommendationManager::load(dir.path().join("recs.json"), ts());
        manager.create_from_anomaly(&anomaly("high_block_rate"), None, None, None, ts());

        let report = run_chain(&engine, &mut manager).expect("matched");
        assert_eq!(report.tier_reached, EscalationTier::Analysis);
        assert!(report.deep_dive.is_none());

        let active = manager.get_active(ts());
        assert_eq!(active[0].suggestion, "revert the rollout");
        assert_eq!(active[0].escalation_tier, Some(EscalationTier::Analysis));
    }

    #[test]
    fn deep_dive_proposes_config_changes() {
        let engine = ScriptedEngine::new(TriageClassification::EmergingPattern, true);
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = RecommendationManager::load(dir.path().join("recs.json"), ts());
        manager.create_from_anomaly(&anomaly("high_block_rate"), None, None, None, ts());

        let report = run_chain(&engine, &mut manager).expect("matched");
        assert_eq!(report.tier_reached, EscalationTier::DeepDive);
        assert_eq!(report.proposed_config_changes.len(), 1);
        assert_eq!(
            *engine.tiers_run.borrow(),
            vec![
                EscalationTier::Triage,
                EscalationTier::Analysis,
                EscalationTier::DeepDive,
            ]
        );

        let active = manager.get_active(ts());
        assert_eq!(active[0].escalation_tier, Some(EscalationTier::DeepDive));
        assert_eq!(active[0].analysis.as_deref(), Some("threshold too tight for refactor sessions"));
    }

    struct FailingEngine;

    impl ReasoningEngine for FailingEngine {
        fn triage(&self, _request: &TierRequest) -> Result<TriageVerdict, PipelineError> {
            Err(PipelineError::Engine("triage backend unavailable".to_string()))
        }

        fn analyze(&self, _request: &TierRequest) -> Result<AnalysisVerdict, PipelineError> {
            unreachable!("triage already failed")
        }

        fn deep_dive(&self, _request: &TierRequest) -> Result<DeepDiveVerdict, PipelineError> {
            unreachable!("triage already failed")
        }
    }

    #[test]
    fn engine_failure_surfaces_without_touching_recommendations() {
        let chain = EscalationChain::new(AuditConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let mut manager = RecommendationManager::load(dir.path().join("recs.json"), ts());
        let rec = manager.create_from_anomaly(&anomaly("high_block_rate"), None, None, None, ts());

        let result = chain.run(
            &FailingEngine,
            &[anomaly("high_block_rate")],
            &[directive("d1", &["high_*"])],
            &EscalationContext::default(),
            &mut manager,
            ts(),
        );
        assert!(matches!(result, Err(PipelineError::Engine(_))));

        let active = manager.get_active(ts());
        assert_eq!(active[0].suggestion, rec.suggestion);
        assert_eq!(active[0].escalation_tier, None);
    }

    #[test]
    fn event_window_respects_the_configured_level() {
        let mut config = AuditConfig::default();
        config.ring_buffer_size = 2;
        let chain = EscalationChain::new(config);
        let context = EscalationContext {
            recent_events: (0..5)
                .map(|i| {
                    AuditEvent::new(
                        "task.pair_created",
                        serde_json::json!({"n": i}),
                        "hook",
                        "s",
                        "a",
                        ts(),
                    )
                })
                .collect(),
            ..EscalationContext::default()
        };

        let matched_anomaly = anomaly("high_block_rate");
        let matched_directive = directive("d1", &["*"]);
        let matched = vec![(&matched_anomaly, &matched_directive)];
        let triage = TriageVerdict {
            classification: TriageClassification::EmergingPattern,
            rationale: "r".to_string(),
            suggestion: None,
        };
        let request = chain.build_analysis_request(&matched, &triage, &context);
        // Last two events only at ring_buffer_size 2.
        assert_eq!(request.recent_events.len(), 2);
        assert_eq!(request.recent_events[0].data["n"], 3);
    }
}
