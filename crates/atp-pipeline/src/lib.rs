pub mod accumulator;
pub mod detector;
pub mod emitter;
pub mod escalation;
pub mod processor;
pub mod recommendations;
pub mod settle;

pub use accumulator::StatsAccumulator;
pub use detector::detect_anomalies;
pub use emitter::EventEmitter;
pub use escalation::{EscalationChain, EscalationContext, EscalationReport, ReasoningEngine};
pub use processor::{ProcessReport, Processor, ProcessorLock};
pub use recommendations::RecommendationManager;
pub use settle::{SettleController, SettleDecision};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] atp_storage::StorageError),
    #[error("processor lock is held by another process")]
    LockHeld,
    #[error("reasoning engine error: {0}")]
    Engine(String),
}
