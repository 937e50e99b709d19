//! Flaky vs deterministic classification from per-test run history.

use crate::persistence::{HistoryEvent, PersistenceSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureNature {
    Deterministic,
    Flaky,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(RunStatus::Passed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_hash: Option<String>,
}

impl RunEntry {
    fn is_failure(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunHistory {
    pub test_name: String,
    pub entries: VecDeque<RunEntry>,
}

/// How infrastructure-related failures interact with the consecutive
/// failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InfraFailurePolicy {
    /// Infra failures are never deterministic by count alone.
    #[default]
    AlwaysFlaky,
    /// Infra failures need this many consecutive repeats instead.
    ExtendedThreshold(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakyConfig {
    pub threshold: usize,
    pub window_size: usize,
    #[serde(default)]
    pub infra_policy: InfraFailurePolicy,
}

impl Default for FlakyConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_size: 20,
            infra_policy: InfraFailurePolicy::AlwaysFlaky,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyVerdict {
    pub nature: FailureNature,
    pub consecutive_failures: usize,
    pub evidence: Vec<String>,
}

impl FlakyVerdict {
    pub fn unknown(reason: &str) -> Self {
        Self {
            nature: FailureNature::Unknown,
            consecutive_failures: 0,
            evidence: vec![reason.to_string()],
        }
    }
}

/// Trailing failures sharing `pattern_hash`.
fn trailing_streak(entries: &VecDeque<RunEntry>, pattern_hash: &str) -> usize {
    entries
        .iter()
        .rev()
        .take_while(|entry| entry.is_failure() && entry.pattern_hash.as_deref() == Some(pattern_hash))
        .count()
}

/// A pass after some failure, or failures carrying different fingerprints.
fn alternation(entries: &VecDeque<RunEntry>) -> Option<String> {
    let mut seen_failure = false;
    for entry in entries {
        match entry.status {
            RunStatus::Failed => seen_failure = true,
            RunStatus::Passed if seen_failure => {
                return Some(format!(
                    "test passed after failing within the last {} runs",
                    entries.len()
                ));
            }
            RunStatus::Passed => {}
        }
    }

    let patterns: BTreeSet<&str> = entries
        .iter()
        .filter(|entry| entry.is_failure())
        .filter_map(|entry| entry.pattern_hash.as_deref())
        .collect();
    if patterns.len() > 1 {
        return Some(format!(
            "{} distinct failure patterns within the last {} runs",
            patterns.len(),
            entries.len()
        ));
    }
    None
}

/// Classify the latest failure in `entries`, which must already include it.
pub fn classify_window(
    entries: &VecDeque<RunEntry>,
    pattern_hash: &str,
    infra_related: bool,
    config: &FlakyConfig,
) -> FlakyVerdict {
    let streak = trailing_streak(entries, pattern_hash);
    let threshold = config.threshold.max(1);
    let mut evidence = Vec::new();

    if streak >= threshold {
        let required = match (infra_related, config.infra_policy) {
            (false, _) => Some(threshold),
            (true, InfraFailurePolicy::AlwaysFlaky) => None,
            (true, InfraFailurePolicy::ExtendedThreshold(n)) => Some(n.max(threshold)),
        };
        match required {
            Some(required) if streak >= required => {
                evidence.push(format!(
                    "{streak} consecutive failures with pattern {pattern_hash}"
                ));
                return FlakyVerdict {
                    nature: FailureNature::Deterministic,
                    consecutive_failures: streak,
                    evidence,
                };
            }
            _ => {
                evidence.push(format!(
                    "infrastructure-related failure repeated {streak} times; not deterministic by count"
                ));
                return FlakyVerdict {
                    nature: FailureNature::Flaky,
                    consecutive_failures: streak,
                    evidence,
                };
            }
        }
    }

    if let Some(reason) = alternation(entries) {
        evidence.push(reason);
        return FlakyVerdict {
            nature: FailureNature::Flaky,
            consecutive_failures: streak,
            evidence,
        };
    }

    evidence.push(format!(
        "{streak} of {threshold} consecutive failures needed, no alternation in {} runs",
        entries.len()
    ));
    FlakyVerdict {
        nature: FailureNature::Unknown,
        consecutive_failures: streak,
        evidence,
    }
}

pub struct FlakyStore {
    config: FlakyConfig,
    histories: RwLock<HashMap<String, Arc<Mutex<TestRunHistory>>>>,
    sink: Option<PersistenceSink>,
}

fn lock_history(entry: &Mutex<TestRunHistory>) -> MutexGuard<'_, TestRunHistory> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FlakyStore {
    pub fn new(config: FlakyConfig) -> Self {
        Self {
            config,
            histories: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    pub fn with_persistence(
        config: FlakyConfig,
        runs: HashMap<String, Vec<RunEntry>>,
        sink: PersistenceSink,
    ) -> Self {
        let mut store = Self::new(config);
        store.sink = Some(sink);
        store.hydrate(runs);
        store
    }

    pub fn config(&self) -> &FlakyConfig {
        &self.config
    }

    pub fn hydrate(&self, runs: HashMap<String, Vec<RunEntry>>) {
        let window = self.config.window_size.max(1);
        let mut map = self.histories.write().unwrap_or_else(|p| p.into_inner());
        for (test_name, entries) in runs {
            let mut entries: VecDeque<RunEntry> = entries.into_iter().collect();
            while entries.len() > window {
                entries.pop_front();
            }
            map.insert(
                test_name.clone(),
                Arc::new(Mutex::new(TestRunHistory { test_name, entries })),
            );
        }
    }

    fn entry(&self, test_name: &str) -> Arc<Mutex<TestRunHistory>> {
        if let Some(entry) = self
            .histories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(test_name)
        {
            return Arc::clone(entry);
        }
        let mut map = self.histories.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(test_name.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TestRunHistory {
                test_name: test_name.to_string(),
                entries: VecDeque::new(),
            }))
        }))
    }

    fn append(&self, history: &mut TestRunHistory, entry: RunEntry) {
        history.entries.push_back(entry.clone());
        while history.entries.len() > self.config.window_size.max(1) {
            history.entries.pop_front();
        }
        if let Some(sink) = &self.sink {
            sink.submit(HistoryEvent::Run {
                test_name: history.test_name.clone(),
                entry,
            });
        }
    }

    /// Record a failure of `test_name` and classify it against its window.
    pub fn analyze_failure(
        &self,
        test_name: &str,
        pattern_hash: &str,
        infra_related: bool,
        timestamp: DateTime<Utc>,
    ) -> FlakyVerdict {
        let entry = self.entry(test_name);
        let mut history = lock_history(&entry);
        self.append(
            &mut history,
            RunEntry {
                timestamp,
                status: RunStatus::Failed,
                pattern_hash: Some(pattern_hash.to_string()),
            },
        );
        let verdict = classify_window(&history.entries, pattern_hash, infra_related, &self.config);
        log::debug!(
            "Test '{}' failure classified {:?} (streak {})",
            test_name,
            verdict.nature,
            verdict.consecutive_failures
        );
        verdict
    }

    /// Record a pass. Breaks the failure streak; history is kept.
    pub fn record_pass(&self, test_name: &str, timestamp: DateTime<Utc>) {
        let entry = self.entry(test_name);
        let mut history = lock_history(&entry);
        self.append(
            &mut history,
            RunEntry {
                timestamp,
                status: RunStatus::Passed,
                pattern_hash: None,
            },
        );
    }

    pub fn history(&self, test_name: &str) -> Option<TestRunHistory> {
        self.histories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(test_name)
            .map(|entry| lock_history(entry).clone())
    }

    /// Current trailing failure streak for a test, any pattern.
    pub fn consecutive_failures(&self, test_name: &str) -> usize {
        self.history(test_name)
            .map(|history| {
                history
                    .entries
                    .iter()
                    .rev()
                    .take_while(|entry| entry.is_failure())
                    .count()
            })
            .unwrap_or(0)
    }
}
