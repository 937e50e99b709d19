//! Historical frequency tracking of failure fingerprints.
//!
//! Records live in memory behind per-hash locks; durable storage is a
//! write-behind sink. When the sink reports the store unreachable, every
//! query answers `HistoryState::Unavailable` so scoring floors instead of
//! failing.

use crate::error::TransitionError;
use crate::persistence::{HistoryEvent, PersistenceSink};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Fraction of the raw log ratio followed exactly before the soft cap.
const BOOST_KNEE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    #[default]
    Open,
    Investigating,
    Resolved,
    Ignored,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Open => "OPEN",
            ResolutionStatus::Investigating => "INVESTIGATING",
            ResolutionStatus::Resolved => "RESOLVED",
            ResolutionStatus::Ignored => "IGNORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(ResolutionStatus::Open),
            "INVESTIGATING" => Some(ResolutionStatus::Investigating),
            "RESOLVED" => Some(ResolutionStatus::Resolved),
            "IGNORED" => Some(ResolutionStatus::Ignored),
            _ => None,
        }
    }

    /// `OPEN -> INVESTIGATING -> {RESOLVED, IGNORED}`. Reopening happens
    /// only through a new occurrence.
    pub fn can_transition_to(self, to: ResolutionStatus) -> bool {
        matches!(
            (self, to),
            (ResolutionStatus::Open, ResolutionStatus::Investigating)
                | (ResolutionStatus::Investigating, ResolutionStatus::Resolved)
                | (ResolutionStatus::Investigating, ResolutionStatus::Ignored)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub pattern_hash: String,
    pub summary: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub test_names: BTreeSet<String>,
    pub resolution_status: ResolutionStatus,
    /// Retained occurrence times, oldest first.
    #[serde(default)]
    pub occurrences: VecDeque<DateTime<Utc>>,
}

impl PatternRecord {
    fn new(pattern_hash: &str, summary: &str, seen: DateTime<Utc>) -> Self {
        Self {
            pattern_hash: pattern_hash.to_string(),
            summary: summary.to_string(),
            first_seen: seen,
            last_seen: seen,
            occurrence_count: 0,
            test_names: BTreeSet::new(),
            resolution_status: ResolutionStatus::Open,
            occurrences: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub lookback_days: u32,
    /// Frequency at which the raw boost ratio reaches 1.
    pub saturation_k: f64,
    pub retention_days: u32,
    pub max_occurrences: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            saturation_k: 20.0,
            retention_days: 90,
            max_occurrences: 1_000,
        }
    }
}

/// What the tracker knows about a fingerprint at scoring time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HistoryState {
    Unavailable,
    FirstSeen,
    Repeating { frequency: u64, boost: f64 },
}

/// `ln(1+freq)/ln(1+K)`, followed exactly up to the knee and then bent
/// smoothly towards 1 so the result stays strictly increasing and below 1.
pub fn frequency_boost(frequency: u64, saturation_k: f64) -> f64 {
    if frequency == 0 || saturation_k <= 0.0 {
        return 0.0;
    }
    let raw = (1.0 + frequency as f64).ln() / (1.0 + saturation_k).ln();
    let boost = if raw <= BOOST_KNEE {
        raw
    } else {
        let headroom = 1.0 - BOOST_KNEE;
        1.0 - headroom * (-(raw - BOOST_KNEE) / headroom).exp()
    };
    boost.min(1.0 - f64::EPSILON)
}

pub struct HistoricalStore {
    config: HistoryConfig,
    records: RwLock<HashMap<String, Arc<Mutex<PatternRecord>>>>,
    available: Arc<AtomicBool>,
    sink: Option<PersistenceSink>,
}

fn lock_record(entry: &Mutex<PatternRecord>) -> MutexGuard<'_, PatternRecord> {
    entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HistoricalStore {
    /// In-memory store with no durable backing.
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
            sink: None,
        }
    }

    /// Store hydrated from persisted records, writing changes through `sink`.
    pub fn with_persistence(
        config: HistoryConfig,
        records: Vec<PatternRecord>,
        sink: PersistenceSink,
    ) -> Self {
        let store = Self {
            config,
            records: RwLock::new(HashMap::new()),
            available: sink.health(),
            sink: Some(sink),
        };
        store.hydrate(records);
        store
    }

    /// Store whose backing could not be reached; answers "no history".
    pub fn unavailable(config: HistoryConfig) -> Self {
        let store = Self::new(config);
        store.available.store(false, Ordering::SeqCst);
        store
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn hydrate(&self, records: Vec<PatternRecord>) {
        let mut map = self.records.write().unwrap_or_else(|p| p.into_inner());
        for record in records {
            map.insert(record.pattern_hash.clone(), Arc::new(Mutex::new(record)));
        }
    }

    fn entry(&self, pattern_hash: &str, summary: &str, seen: DateTime<Utc>) -> Arc<Mutex<PatternRecord>> {
        if let Some(entry) = self
            .records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(pattern_hash)
        {
            return Arc::clone(entry);
        }
        let mut map = self.records.write().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            map.entry(pattern_hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PatternRecord::new(pattern_hash, summary, seen)))),
        )
    }

    fn lookup(&self, pattern_hash: &str) -> Option<Arc<Mutex<PatternRecord>>> {
        self.records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(pattern_hash)
            .cloned()
    }

    /// Upsert the record for `pattern_hash`. A RESOLVED record reopens.
    pub fn record_occurrence(
        &self,
        pattern_hash: &str,
        test_name: &str,
        timestamp: DateTime<Utc>,
        summary: &str,
    ) -> PatternRecord {
        let entry = self.entry(pattern_hash, summary, timestamp);
        let snapshot = {
            let mut record = lock_record(&entry);
            record.occurrence_count += 1;
            record.test_names.insert(test_name.to_string());
            if timestamp < record.first_seen {
                record.first_seen = timestamp;
            }
            if timestamp > record.last_seen {
                record.last_seen = timestamp;
            }
            if record.resolution_status == ResolutionStatus::Resolved {
                log::info!("Pattern {pattern_hash} recurred after resolution, reopening");
                record.resolution_status = ResolutionStatus::Open;
            }

            let position = record.occurrences.partition_point(|ts| *ts <= timestamp);
            record.occurrences.insert(position, timestamp);
            let horizon = record.last_seen - Duration::days(i64::from(self.config.retention_days));
            while record.occurrences.front().is_some_and(|ts| *ts < horizon) {
                record.occurrences.pop_front();
            }
            while record.occurrences.len() > self.config.max_occurrences {
                record.occurrences.pop_front();
            }
            record.clone()
        };

        self.persist(HistoryEvent::Pattern(snapshot.clone()));
        snapshot
    }

    /// Occurrences within `lookback_days` before now.
    pub fn get_frequency(&self, pattern_hash: &str, lookback_days: u32) -> u64 {
        self.frequency_at(pattern_hash, lookback_days, Utc::now())
    }

    /// Occurrences within `lookback_days` before `as_of`.
    pub fn frequency_at(&self, pattern_hash: &str, lookback_days: u32, as_of: DateTime<Utc>) -> u64 {
        let Some(entry) = self.lookup(pattern_hash) else {
            return 0;
        };
        let since = as_of - Duration::days(i64::from(lookback_days));
        let record = lock_record(&entry);
        record
            .occurrences
            .iter()
            .filter(|ts| **ts >= since && **ts <= as_of)
            .count() as u64
    }

    pub fn calculate_frequency_boost(&self, pattern_hash: &str, lookback_days: u32) -> f64 {
        frequency_boost(
            self.get_frequency(pattern_hash, lookback_days),
            self.config.saturation_k,
        )
    }

    pub fn history_state(&self, pattern_hash: &str, as_of: DateTime<Utc>) -> HistoryState {
        if !self.is_available() {
            return HistoryState::Unavailable;
        }
        let Some(entry) = self.lookup(pattern_hash) else {
            return HistoryState::FirstSeen;
        };
        let occurrence_count = lock_record(&entry).occurrence_count;
        if occurrence_count <= 1 {
            return HistoryState::FirstSeen;
        }
        let frequency = self.frequency_at(pattern_hash, self.config.lookback_days, as_of);
        HistoryState::Repeating {
            frequency,
            boost: frequency_boost(frequency, self.config.saturation_k),
        }
    }

    /// Apply a manual resolution change. Returns the previous status.
    pub fn update_resolution_status(
        &self,
        pattern_hash: &str,
        status: ResolutionStatus,
    ) -> Result<ResolutionStatus, TransitionError> {
        let entry = self
            .lookup(pattern_hash)
            .ok_or_else(|| TransitionError::UnknownPattern(pattern_hash.to_string()))?;
        let snapshot = {
            let mut record = lock_record(&entry);
            let previous = record.resolution_status;
            if previous == status {
                return Ok(previous);
            }
            if !previous.can_transition_to(status) {
                return Err(TransitionError::Invalid {
                    hash: pattern_hash.to_string(),
                    from: previous,
                    to: status,
                });
            }
            record.resolution_status = status;
            (previous, record.clone())
        };
        self.persist(HistoryEvent::Pattern(snapshot.1));
        Ok(snapshot.0)
    }

    pub fn get_record(&self, pattern_hash: &str) -> Option<PatternRecord> {
        self.lookup(pattern_hash)
            .map(|entry| lock_record(&entry).clone())
    }

    /// Snapshot of all records, sorted by hash.
    pub fn records(&self) -> Vec<PatternRecord> {
        let entries: Vec<Arc<Mutex<PatternRecord>>> = self
            .records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut records: Vec<PatternRecord> =
            entries.iter().map(|entry| lock_record(entry).clone()).collect();
        records.sort_by(|a, b| a.pattern_hash.cmp(&b.pattern_hash));
        records
    }

    /// Most frequent patterns, ties broken by hash.
    pub fn top_patterns(&self, limit: usize) -> Vec<PatternRecord> {
        let mut records = self.records();
        records.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.pattern_hash.cmp(&b.pattern_hash))
        });
        records.truncate(limit);
        records
    }

    fn persist(&self, event: HistoryEvent) {
        if let Some(sink) = &self.sink {
            sink.submit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap()
    }

    fn store() -> HistoricalStore {
        HistoricalStore::new(HistoryConfig::default())
    }

    #[test]
    fn test_boost_zero_frequency() {
        assert_eq!(frequency_boost(0, 20.0), 0.0);
    }

    #[test]
    fn test_boost_strictly_increasing_below_one() {
        let mut previous = 0.0;
        for frequency in 1..=5_000u64 {
            let boost = frequency_boost(frequency, 20.0);
            assert!(boost > previous, "boost not increasing at {frequency}");
            assert!(boost < 1.0, "boost reached 1 at {frequency}");
            previous = boost;
        }
    }

    #[test]
    fn test_boost_follows_log_ratio_below_knee() {
        let expected = (1.0f64 + 5.0).ln() / (1.0f64 + 20.0).ln();
        assert!((frequency_boost(5, 20.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_boost_at_saturation_constant() {
        let expected = 1.0 - 0.1 * (-1.0f64).exp();
        let boost = frequency_boost(20, 20.0);
        assert!((boost - expected).abs() < 1e-12);
        assert!((boost - 0.963212).abs() < 1e-6);
        assert!(frequency_boost(21, 20.0) > boost);
    }

    #[test]
    fn test_record_occurrence_upserts() {
        let store = store();
        store.record_occurrence("abc", "login", at(1), "summary");
        let record = store.record_occurrence("abc", "checkout", at(3), "summary");
        assert_eq!(record.occurrence_count, 2);
        assert_eq!(record.first_seen, at(1));
        assert_eq!(record.last_seen, at(3));
        assert_eq!(record.test_names.len(), 2);
    }

    #[test]
    fn test_frequency_respects_lookback() {
        let store = store();
        store.record_occurrence("abc", "t", at(1), "s");
        store.record_occurrence("abc", "t", at(20), "s");
        store.record_occurrence("abc", "t", at(25), "s");
        assert_eq!(store.frequency_at("abc", 7, at(26)), 2);
        assert_eq!(store.frequency_at("abc", 30, at(26)), 3);
        assert_eq!(store.frequency_at("missing", 30, at(26)), 0);
    }

    #[test]
    fn test_history_state_progression() {
        let store = store();
        assert_eq!(store.history_state("abc", at(1)), HistoryState::FirstSeen);
        store.record_occurrence("abc", "t", at(1), "s");
        assert_eq!(store.history_state("abc", at(1)), HistoryState::FirstSeen);
        store.record_occurrence("abc", "t", at(2), "s");
        match store.history_state("abc", at(2)) {
            HistoryState::Repeating { frequency, boost } => {
                assert_eq!(frequency, 2);
                assert!(boost > 0.0);
            }
            other => panic!("Expected repeating state, got {other:?}"),
        }
    }

    #[test]
    fn test_unavailable_store_reports_no_history() {
        let store = HistoricalStore::unavailable(HistoryConfig::default());
        store.record_occurrence("abc", "t", at(1), "s");
        store.record_occurrence("abc", "t", at(2), "s");
        assert_eq!(store.history_state("abc", at(2)), HistoryState::Unavailable);
    }

    #[test]
    fn test_resolution_transitions() {
        let store = store();
        store.record_occurrence("abc", "t", at(1), "s");

        assert!(matches!(
            store.update_resolution_status("abc", ResolutionStatus::Resolved),
            Err(TransitionError::Invalid { .. })
        ));
        assert_eq!(
            store.update_resolution_status("abc", ResolutionStatus::Investigating),
            Ok(ResolutionStatus::Open)
        );
        assert_eq!(
            store.update_resolution_status("abc", ResolutionStatus::Resolved),
            Ok(ResolutionStatus::Investigating)
        );
        assert!(matches!(
            store.update_resolution_status("nope", ResolutionStatus::Investigating),
            Err(TransitionError::UnknownPattern(_))
        ));
    }

    #[test]
    fn test_resolved_pattern_reopens_on_recurrence() {
        let store = store();
        store.record_occurrence("abc", "t", at(1), "s");
        store
            .update_resolution_status("abc", ResolutionStatus::Investigating)
            .unwrap();
        store
            .update_resolution_status("abc", ResolutionStatus::Resolved)
            .unwrap();
        let record = store.record_occurrence("abc", "t", at(2), "s");
        assert_eq!(record.resolution_status, ResolutionStatus::Open);
    }

    #[test]
    fn test_ignored_pattern_stays_ignored() {
        let store = store();
        store.record_occurrence("abc", "t", at(1), "s");
        store
            .update_resolution_status("abc", ResolutionStatus::Investigating)
            .unwrap();
        store
            .update_resolution_status("abc", ResolutionStatus::Ignored)
            .unwrap();
        let record = store.record_occurrence("abc", "t", at(2), "s");
        assert_eq!(record.resolution_status, ResolutionStatus::Ignored);
    }

    #[test]
    fn test_occurrences_are_bounded() {
        let store = HistoricalStore::new(HistoryConfig {
            max_occurrences: 3,
            ..HistoryConfig::default()
        });
        for day in 1..=6 {
            store.record_occurrence("abc", "t", at(day), "s");
        }
        let record = store.get_record("abc").unwrap();
        assert_eq!(record.occurrence_count, 6);
        assert_eq!(record.occurrences.len(), 3);
        assert_eq!(record.occurrences.front(), Some(&at(4)));
    }

    #[test]
    fn test_top_patterns_order() {
        let store = store();
        store.record_occurrence("bbb", "t", at(1), "s");
        store.record_occurrence("aaa", "t", at(1), "s");
        store.record_occurrence("ccc", "t", at(1), "s");
        store.record_occurrence("ccc", "t", at(2), "s");
        let top: Vec<String> = store
            .top_patterns(2)
            .into_iter()
            .map(|r| r.pattern_hash)
            .collect();
        assert_eq!(top, vec!["ccc".to_string(), "aaa".to_string()]);
    }

    #[test]
    fn test_concurrent_occurrences_are_serialized() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.record_occurrence("shared", &format!("t{worker}"), at(1), "s");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_record("shared").unwrap().occurrence_count, 400);
    }
}
