//! Wiring of the analysis stack from a `TriageConfig`.

use crate::confidence::{AiAdjuster, ConfidenceCalculator};
use crate::config::TriageConfig;
use crate::error::PersistenceError;
use crate::event::TestUnit;
use crate::flaky::{FlakyStore, RunEntry};
use crate::history::{HistoricalStore, PatternRecord};
use crate::orchestrator::{Analyzer, BatchReport, Orchestrator};
use crate::persistence::{HistoryDatabase, PersistenceWriter};
use crate::rules::RuleRegistry;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;

type StoredHistory = (HistoryDatabase, Vec<PatternRecord>, HashMap<String, Vec<RunEntry>>);

pub struct TriageEngine {
    orchestrator: Orchestrator,
    writer: Option<PersistenceWriter>,
}

impl TriageEngine {
    /// Build the engine. Must be called from within a tokio runtime when a
    /// history database is configured.
    pub fn from_config(
        config: &TriageConfig,
        adjuster: Option<Arc<dyn AiAdjuster>>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let rules = RuleRegistry::load(config.rules_dir()).context("loading rule packs")?;

        let tracker_config = config.history.tracker_config();
        let (history, flaky, writer) = match &config.history.database_path {
            Some(path) => match Self::open_database(path, config.flaky.window_size) {
                Ok((database, patterns, runs)) => {
                    log::info!(
                        "History database {}: {} patterns, {} tests with run history",
                        path,
                        patterns.len(),
                        runs.len()
                    );
                    let writer =
                        PersistenceWriter::spawn(database, config.history.flush_interval_seconds);
                    let history =
                        HistoricalStore::with_persistence(tracker_config, patterns, writer.sink());
                    let flaky =
                        FlakyStore::with_persistence(config.flaky.clone(), runs, writer.sink());
                    (history, flaky, Some(writer))
                }
                Err(e) => {
                    log::warn!("History database {} unavailable: {}", path, e);
                    (
                        HistoricalStore::unavailable(tracker_config),
                        FlakyStore::new(config.flaky.clone()),
                        None,
                    )
                }
            },
            None => (
                HistoricalStore::new(tracker_config),
                FlakyStore::new(config.flaky.clone()),
                None,
            ),
        };

        let mut calculator = ConfidenceCalculator::new().context("compiling scoring patterns")?;
        match (config.ai.enabled, adjuster) {
            (true, Some(adjuster)) => {
                log::info!("AI adjustment enabled via '{}'", adjuster.name());
                calculator = calculator.with_adjuster(adjuster, config.ai.max_adjustment);
            }
            (true, None) => log::warn!("AI adjustment enabled but no adjuster is available"),
            (false, _) => {}
        }

        let analyzer = Analyzer::new(
            Arc::new(rules),
            Arc::new(history),
            Arc::new(flaky),
            config.policy.clone(),
        )
        .context("compiling extraction patterns")?
        .with_calculator(calculator);

        let mut orchestrator =
            Orchestrator::new(Arc::new(analyzer)).with_timeout(config.batch.timeout());
        if let Some(concurrency) = config.batch.concurrency {
            orchestrator = orchestrator.with_concurrency(concurrency);
        }

        Ok(Self {
            orchestrator,
            writer,
        })
    }

    fn open_database(path: &str, window: usize) -> Result<StoredHistory, PersistenceError> {
        let database = HistoryDatabase::open(path)?.with_run_window(window);
        let patterns = database.load_patterns()?;
        let runs = database.load_runs(window)?;
        Ok((database, patterns, runs))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub async fn run(&self, units: Vec<TestUnit>) -> BatchReport {
        self.orchestrator.run(units).await
    }

    /// Flush pending history writes.
    pub async fn shutdown(self) {
        if let Some(writer) = self.writer {
            writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLevel, NormalizedEvent};
    use crate::history::HistoryState;
    use crate::rules::FailureType;

    fn failing_unit(minute: u32) -> TestUnit {
        let event = NormalizedEvent::new(
            "test_cart_total",
            "pytest",
            EventLevel::Error,
            "AssertionError: expected 40 to equal 42",
        )
        .with_timestamp(&format!("2024-07-01T09:{minute:02}:00Z"));
        TestUnit::failed("test_cart_total", "pytest", vec![event])
    }

    #[tokio::test]
    async fn test_unopenable_database_scores_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "plain file").unwrap();
        let mut config = TriageConfig::default();
        config.history.database_path = Some(blocker.join("history.db").display().to_string());

        let engine = TriageEngine::from_config(&config, None).unwrap();
        assert!(!engine.orchestrator().analyzer().history().is_available());
        for minute in 0..2 {
            let report = engine.run(vec![failing_unit(minute)]).await;
            let analysis = report.reports[0].analysis().unwrap();
            assert_eq!(analysis.history, HistoryState::Unavailable);
            assert_eq!(analysis.confidence.history_score, 0.0);
            assert_eq!(analysis.verdict.failure_type, FailureType::ProductDefect);
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_history_kept_in_memory_without_database() {
        let engine = TriageEngine::from_config(&TriageConfig::default(), None).unwrap();
        let first = engine.run(vec![failing_unit(0)]).await;
        let second = engine.run(vec![failing_unit(1)]).await;
        engine.shutdown().await;

        assert_eq!(first.reports[0].analysis().unwrap().history, HistoryState::FirstSeen);
        assert!(matches!(
            second.reports[0].analysis().unwrap().history,
            HistoryState::Repeating { frequency: 2, .. }
        ));
    }
}
