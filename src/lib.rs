pub mod confidence;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod event;
pub mod flaky;
pub mod history;
pub mod normalizer;
pub mod orchestrator;
pub mod persistence;
pub mod rules;
pub mod signals;

pub use confidence::{AiAdjuster, ConfidenceBreakdown, ConfidenceCalculator, LogCompleteness};
pub use config::{load_config_or_default, TriageConfig};
pub use decision::{decide, CiAction, CiDecision, CiPolicy};
pub use engine::TriageEngine;
pub use error::{ConfigError, ExtractionError, PersistenceError, TransitionError};
pub use event::{EventLevel, NormalizedEvent, TestUnit, UnitStatus};
pub use flaky::{FailureNature, FlakyStore, FlakyVerdict, InfraFailurePolicy};
pub use history::{HistoricalStore, HistoryState, PatternRecord, ResolutionStatus};
pub use normalizer::PatternNormalizer;
pub use orchestrator::{Analyzer, BatchReport, Orchestrator, RunSummary, TestAnalysis, UnitReport};
pub use rules::{FailureType, FailureVerdict, RuleRegistry, RuleSet};
pub use signals::{Signal, SignalEngine, SignalType};
