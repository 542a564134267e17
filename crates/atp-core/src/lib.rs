pub mod config;
pub mod directives;
pub mod escalation_contracts;
pub mod events;
pub mod recommendations;

pub use config::{AuditConfig, AuditLevel, AuditPaths, RetentionConfig, Thresholds, TierModels};
pub use directives::{load_directives, Directive, WatchPattern};
pub use escalation_contracts::{
    AnalysisVerdict, ConfigRangeChange, DeepDiveVerdict, EscalationTier, TierRequest,
    TriageClassification, TriageVerdict,
};
pub use events::{
    Anomaly, AuditEvent, BatchSummary, EventPayload, ReviewVerdict, SessionSummary, Severity,
    ANOMALY_EVENT_RATE_SPIKE, ANOMALY_HIGH_BLOCK_RATE, ANOMALY_HIGH_GATE_BLOCK_RATE,
    ANOMALY_HIGH_REINFORCEMENT_SKIP_RATE, ANOMALY_REPEATED_IDLE_BLOCKS, KIND_GATE_COMPLETION,
    KIND_GATE_IDLE, KIND_REINFORCEMENT_INJECTED, KIND_REINFORCEMENT_SKIPPED,
    KIND_REVIEW_COMPLETED, KIND_TASK_PAIR_CREATED, METRIC_EVENTS_PER_HOUR,
};
pub use recommendations::{Recommendation, RecommendationDocument, RecommendationStatus};
