//! Batch orchestration
//!
//! Runs the per-unit pipeline for every unit of a batch in two phases.
//! Extraction, fingerprinting and classification run on blocking worker
//! threads bounded by a semaphore. History tracking, scoring and the CI
//! decision then run in input order against the shared stores. Reports
//! keep input order.

use crate::confidence::{ConfidenceBreakdown, ConfidenceCalculator, HistoryEvidence, LogCompleteness};
use crate::decision::{decide, CiAction, CiDecision, CiPolicy};
use crate::event::{TestUnit, UnitStatus};
use crate::flaky::{FailureNature, FlakyStore, FlakyVerdict};
use crate::history::{HistoricalStore, HistoryState};
use crate::normalizer::PatternNormalizer;
use crate::rules::{FailureType, FailureVerdict, RuleRegistry, RuleSet};
use crate::signals::{Signal, SignalEngine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Full analysis of one failed unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAnalysis {
    pub test_name: String,
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_summary: Option<String>,
    pub signals: Vec<Signal>,
    pub verdict: FailureVerdict,
    pub flaky: FlakyVerdict,
    pub history: HistoryState,
    pub confidence: ConfidenceBreakdown,
    pub decision: CiDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitReport {
    Analyzed(Box<TestAnalysis>),
    Passed { test_name: String },
    TimedOut { test_name: String },
    Errored { test_name: String, error: String },
}

impl UnitReport {
    pub fn test_name(&self) -> &str {
        match self {
            UnitReport::Analyzed(analysis) => &analysis.test_name,
            UnitReport::Passed { test_name }
            | UnitReport::TimedOut { test_name }
            | UnitReport::Errored { test_name, .. } => test_name,
        }
    }

    pub fn analysis(&self) -> Option<&TestAnalysis> {
        match self {
            UnitReport::Analyzed(analysis) => Some(analysis.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub analyzed: usize,
    pub passed: usize,
    pub errored: usize,
    pub timed_out: usize,
    pub by_failure_type: BTreeMap<FailureType, usize>,
    pub by_action: BTreeMap<CiAction, usize>,
    pub overall_action: CiAction,
}

impl RunSummary {
    pub fn from_reports(reports: &[UnitReport]) -> Self {
        let mut summary = RunSummary {
            total: reports.len(),
            ..RunSummary::default()
        };
        for report in reports {
            match report {
                UnitReport::Analyzed(analysis) => {
                    summary.analyzed += 1;
                    *summary
                        .by_failure_type
                        .entry(analysis.verdict.failure_type)
                        .or_insert(0) += 1;
                    *summary.by_action.entry(analysis.decision.action).or_insert(0) += 1;
                    summary.overall_action = summary.overall_action.escalate(analysis.decision.action);
                }
                UnitReport::Passed { .. } => summary.passed += 1,
                UnitReport::TimedOut { .. } => {
                    summary.timed_out += 1;
                    summary.overall_action = summary.overall_action.escalate(CiAction::Warn);
                }
                UnitReport::Errored { .. } => {
                    summary.errored += 1;
                    summary.overall_action = summary.overall_action.escalate(CiAction::Warn);
                }
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub reports: Vec<UnitReport>,
    pub summary: RunSummary,
    pub rules_version: u64,
    pub rules_digest: String,
}

/// Store-independent findings for one failed unit.
#[derive(Debug, Clone)]
pub struct FailureEvidence {
    pub test_name: String,
    pub framework: String,
    pub observed_at: DateTime<Utc>,
    pub pattern_hash: String,
    pub summary: String,
    pub infra_related: bool,
    pub completeness: LogCompleteness,
    pub signals: Vec<Signal>,
    pub verdict: FailureVerdict,
    pub ai_adjustment: f64,
}

/// A unit after the parallel phase, waiting to be recorded.
#[derive(Debug, Clone)]
pub enum PreparedUnit {
    Passed {
        test_name: String,
        observed_at: DateTime<Utc>,
    },
    /// Final already; recording it touches no store.
    Malformed(Box<TestAnalysis>),
    Failed(Box<FailureEvidence>),
}

/// Per-unit pipeline. Everything here is synchronous and in-memory.
pub struct Analyzer {
    signals: SignalEngine,
    normalizer: PatternNormalizer,
    calculator: ConfidenceCalculator,
    rules: Arc<RuleRegistry>,
    history: Arc<HistoricalStore>,
    flaky: Arc<FlakyStore>,
    policy: CiPolicy,
}

impl Analyzer {
    pub fn new(
        rules: Arc<RuleRegistry>,
        history: Arc<HistoricalStore>,
        flaky: Arc<FlakyStore>,
        policy: CiPolicy,
    ) -> Result<Self, regex::Error> {
        let signals = SignalEngine::new()?;
        log::debug!("Signal extractors: {}", signals.extractor_names().join(", "));
        Ok(Self {
            signals,
            normalizer: PatternNormalizer::new()?,
            calculator: ConfidenceCalculator::new()?,
            rules,
            history,
            flaky,
            policy,
        })
    }

    pub fn with_calculator(mut self, calculator: ConfidenceCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn history(&self) -> &Arc<HistoricalStore> {
        &self.history
    }

    pub fn flaky(&self) -> &Arc<FlakyStore> {
        &self.flaky
    }

    /// Analyze one unit against a fixed rule snapshot.
    pub fn analyze(&self, rules: &RuleSet, unit: &TestUnit) -> UnitReport {
        self.record(self.prepare(rules, unit))
    }

    /// Everything that depends only on the unit and the rule snapshot.
    /// Leaves the history and flaky stores untouched, so it may run on any
    /// worker in any order.
    pub fn prepare(&self, rules: &RuleSet, unit: &TestUnit) -> PreparedUnit {
        if unit.status == UnitStatus::Passed {
            return PreparedUnit::Passed {
                test_name: unit.test_name.clone(),
                observed_at: unit.observed_at(),
            };
        }
        if let Err(e) = unit.validate() {
            log::debug!("Unit '{}' has malformed events: {}", unit.test_name, e);
            return PreparedUnit::Malformed(Box::new(self.malformed(unit, &e.to_string())));
        }

        let signals = self.signals.extract_all(&unit.events);
        let message = failure_message(unit, &signals);
        let (pattern_hash, summary) = self.normalizer.fingerprint(&message);
        let infra_related = signals.iter().any(|signal| signal.is_infra_related);
        let verdict = rules.classify(&unit.framework, &signals);
        let ai_adjustment = self.calculator.ai_adjustment(&verdict, &signals);

        PreparedUnit::Failed(Box::new(FailureEvidence {
            test_name: unit.test_name.clone(),
            framework: unit.framework.clone(),
            observed_at: unit.observed_at(),
            pattern_hash,
            summary,
            infra_related,
            completeness: LogCompleteness::assess(unit),
            signals,
            verdict,
            ai_adjustment,
        }))
    }

    /// Apply a prepared unit to the history and flaky stores, then score
    /// and decide. Callers sharing stores must record units in a fixed order.
    pub fn record(&self, prepared: PreparedUnit) -> UnitReport {
        match prepared {
            PreparedUnit::Passed {
                test_name,
                observed_at,
            } => {
                self.flaky.record_pass(&test_name, observed_at);
                UnitReport::Passed { test_name }
            }
            PreparedUnit::Malformed(analysis) => UnitReport::Analyzed(analysis),
            PreparedUnit::Failed(evidence) => UnitReport::Analyzed(Box::new(self.record_failure(*evidence))),
        }
    }

    fn record_failure(&self, evidence: FailureEvidence) -> TestAnalysis {
        let FailureEvidence {
            test_name,
            framework,
            observed_at,
            pattern_hash,
            summary,
            infra_related,
            completeness,
            signals,
            verdict,
            ai_adjustment,
        } = evidence;

        self.history
            .record_occurrence(&pattern_hash, &test_name, observed_at, &summary);
        let history_state = self.history.history_state(&pattern_hash, observed_at);
        let flaky = self
            .flaky
            .analyze_failure(&test_name, &pattern_hash, infra_related, observed_at);

        let confidence = self.calculator.score(
            &verdict,
            &signals,
            &HistoryEvidence {
                state: history_state,
                consistent: flaky.nature != FailureNature::Flaky,
            },
            completeness,
            ai_adjustment,
        );
        let decision = decide(
            verdict.failure_type,
            confidence.final_confidence,
            flaky.nature,
            &self.policy,
        );

        log::debug!(
            "Unit '{}': {:?} via {:?}, {:?}, confidence {:.2} -> {:?}",
            test_name,
            verdict.failure_type,
            verdict.matched_rule_id,
            flaky.nature,
            confidence.final_confidence,
            decision.action
        );

        TestAnalysis {
            test_name,
            framework,
            pattern_hash: Some(pattern_hash),
            pattern_summary: Some(summary),
            signals,
            verdict,
            flaky,
            history: history_state,
            confidence,
            decision,
        }
    }

    /// UNKNOWN analysis for a unit whose events could not be read. Stores
    /// are left untouched.
    fn malformed(&self, unit: &TestUnit, error: &str) -> TestAnalysis {
        let mut verdict = FailureVerdict::unknown("events could not be analyzed");
        verdict.annotate(&format!("extraction error: {error}"));
        let flaky = FlakyVerdict::unknown("run history not updated for malformed events");
        let history = HistoryState::Unavailable;
        let confidence = self.calculator.score(
            &verdict,
            &[],
            &HistoryEvidence {
                state: history,
                consistent: true,
            },
            LogCompleteness::Missing,
            0.0,
        );
        let decision = decide(
            verdict.failure_type,
            confidence.final_confidence,
            flaky.nature,
            &self.policy,
        );

        TestAnalysis {
            test_name: unit.test_name.clone(),
            framework: unit.framework.clone(),
            pattern_hash: None,
            pattern_summary: None,
            signals: Vec::new(),
            verdict,
            flaky,
            history,
            confidence,
            decision,
        }
    }
}

/// Text fingerprinted for the failure: the primary event's message, else
/// the first signal's.
fn failure_message(unit: &TestUnit, signals: &[Signal]) -> String {
    let primary = unit.primary_event().and_then(|event| {
        let message = event.message.trim();
        if !message.is_empty() {
            return Some(message.to_string());
        }
        event
            .stack_trace
            .as_deref()
            .and_then(|trace| trace.lines().find(|line| !line.trim().is_empty()))
            .map(|line| line.trim().to_string())
    });
    primary
        .or_else(|| signals.first().map(|signal| signal.message.clone()))
        .unwrap_or_else(|| format!("{} failed without events", unit.test_name))
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

pub struct Orchestrator {
    analyzer: Arc<Analyzer>,
    concurrency: usize,
    timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(analyzer: Arc<Analyzer>) -> Self {
        Self {
            analyzer,
            concurrency: default_concurrency(),
            timeout: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn analyzer(&self) -> &Arc<Analyzer> {
        &self.analyzer
    }

    /// Analyze a batch. Units are prepared in parallel; store updates are
    /// then applied one unit at a time in input order, so a batch always
    /// produces the same reports for the same inputs and prior history.
    /// Units not prepared when the batch timeout expires are reported
    /// `TIMED_OUT` and leave the stores untouched.
    pub async fn run(&self, units: Vec<TestUnit>) -> BatchReport {
        let start_time = Instant::now();
        let rules = self.analyzer.rules().snapshot();
        let names: Vec<String> = units.iter().map(|unit| unit.test_name.clone()).collect();
        let mut slots: Vec<Option<Result<PreparedUnit, String>>> = vec![None; units.len()];

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, unit) in units.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let analyzer = Arc::clone(&self.analyzer);
            let rules = Arc::clone(&rules);
            tasks.spawn(async move {
                let test_name = unit.test_name.clone();
                let prepared = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        match tokio::task::spawn_blocking(move || analyzer.prepare(&rules, &unit)).await {
                            Ok(prepared) => Ok(prepared),
                            Err(e) => {
                                log::error!("Analysis of '{}' failed: {}", test_name, e);
                                Err(e.to_string())
                            }
                        }
                    }
                    Err(e) => Err(e.to_string()),
                };
                (index, prepared)
            });
        }

        let deadline = self.timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::warn!(
                            "Batch timeout after {:?}, {} units still in flight",
                            self.timeout.unwrap_or_default(),
                            tasks.len()
                        );
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };
            match next {
                Some(Ok((index, prepared))) => slots[index] = Some(prepared),
                Some(Err(e)) => log::error!("Unit task failed: {}", e),
                None => break,
            }
        }

        let timed_out = deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline);
        let reports: Vec<UnitReport> = slots
            .into_iter()
            .zip(names)
            .map(|(slot, test_name)| match slot {
                Some(Ok(prepared)) => self.analyzer.record(prepared),
                Some(Err(error)) => UnitReport::Errored { test_name, error },
                None if timed_out => UnitReport::TimedOut { test_name },
                None => UnitReport::Errored {
                    test_name,
                    error: "analysis task did not complete".to_string(),
                },
            })
            .collect();

        let summary = RunSummary::from_reports(&reports);
        log::info!(
            "Analyzed {} units in {:?}: {} failed, {} passed, {} errored, {} timed out, overall {:?}",
            summary.total,
            start_time.elapsed(),
            summary.analyzed,
            summary.passed,
            summary.errored,
            summary.timed_out,
            summary.overall_action
        );

        BatchReport {
            reports,
            summary,
            rules_version: rules.version,
            rules_digest: rules.digest.clone(),
        }
    }
}
