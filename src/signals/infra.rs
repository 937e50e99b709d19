//! Extractors for infrastructure trouble: databases, networks, dependent
//! services and resource pressure on the runner.

use super::{EventView, Signal, SignalExtractor, SignalType};
use regex::Regex;

const DATABASE_PRIOR: f64 = 0.70;
const NETWORK_PRIOR: f64 = 0.65;
const SERVICE_PRIOR: f64 = 0.60;
const MEMORY_PRIOR: f64 = 0.70;
const CPU_PRIOR: f64 = 0.55;

/// Threshold assumed for tests named as performance checks without an
/// explicit budget.
const DEFAULT_PERF_BUDGET_MS: u64 = 1_000;

const SERVICE_TERMS: &[&str] = &[
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "upstream connect error",
    "upstream request timeout",
    "circuit breaker",
    "no healthy upstream",
];

/// Connectivity problems are infrastructure; schema and data errors are not.
pub struct DatabaseExtractor {
    connectivity: Regex,
    schema: Regex,
}

impl DatabaseExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            connectivity: Regex::new(
                r"deadlock|connection pool|too many connections|database is locked|could not connect to (?:the )?(?:database|server)|connection to (?:the )?database|pool timed out",
            )?,
            schema: Regex::new(
                r#"sqlstate|sqlexception|relation "?[\w.]+"? does not exist|duplicate key|unknown column|no such table|ora-\d{5}|psycopg2\.|integrityerror"#,
            )?,
        })
    }
}

impl SignalExtractor for DatabaseExtractor {
    fn name(&self) -> &str {
        "database"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Database
    }

    fn prior_confidence(&self) -> f64 {
        DATABASE_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        let connectivity = self.connectivity.is_match(&view.text);
        if !connectivity && !self.schema.is_match(&view.text) {
            return None;
        }
        Some(
            self.signal_from(view)
                .retryable(connectivity)
                .infra(connectivity),
        )
    }
}

pub struct NetworkExtractor {
    pattern: Regex,
}

impl NetworkExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(
                r"econnrefused|econnreset|etimedout|enotfound|eai_again|ehostunreach|connection refused|connection reset|socket hang up|network is unreachable|name or service not known|getaddrinfo|temporary failure in name resolution|ssl handshake|broken pipe",
            )?,
        })
    }
}

impl SignalExtractor for NetworkExtractor {
    fn name(&self) -> &str {
        "network"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Network
    }

    fn prior_confidence(&self) -> f64 {
        NETWORK_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !self.pattern.is_match(&view.text) {
            return None;
        }
        Some(
            self.signal_from(view)
                .retryable(true)
                .infra(true),
        )
    }
}

pub struct ServiceExtractor;

impl SignalExtractor for ServiceExtractor {
    fn name(&self) -> &str {
        "service"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Service
    }

    fn prior_confidence(&self) -> f64 {
        SERVICE_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !view.contains_any(SERVICE_TERMS) {
            return None;
        }
        Some(
            self.signal_from(view)
                .retryable(true)
                .infra(true),
        )
    }
}

pub struct MemoryExtractor {
    pattern: Regex,
}

impl MemoryExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(
                r"out ?of ?memory|outofmemoryerror|heap out of memory|enomem|memory limit|cannot allocate memory|oom[- ]?kill|allocation failed",
            )?,
        })
    }
}

impl SignalExtractor for MemoryExtractor {
    fn name(&self) -> &str {
        "memory"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Memory
    }

    fn prior_confidence(&self) -> f64 {
        MEMORY_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !self.pattern.is_match(&view.text) {
            return None;
        }
        Some(self.signal_from(view).infra(true))
    }
}

/// CPU pressure, either named in the log or inferred from a performance
/// test overrunning the budget encoded in its name (`..._under_500ms`).
pub struct CpuExtractor {
    vocabulary: Regex,
    budget: Regex,
}

impl CpuExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            vocabulary: Regex::new(
                r"cpu (?:usage|limit|throttl)|throttl(?:ed|ing)|load average|high cpu|cpu quota",
            )?,
            budget: Regex::new(r"(?i)(?:under|within|below|lt)_?(\d+)_?(ms|s)(?:$|[^a-z0-9])")?,
        })
    }

    /// Budget in milliseconds implied by the test name, if it is a
    /// performance test.
    pub fn inferred_budget_ms(&self, test_name: &str) -> Option<u64> {
        if let Some(caps) = self.budget.captures(test_name) {
            let value: u64 = caps.get(1)?.as_str().parse().ok()?;
            return match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
                "s" => Some(value.saturating_mul(1_000)),
                _ => Some(value),
            };
        }
        let lower = test_name.to_lowercase();
        if ["perf", "benchmark", "latency", "load_test"]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            return Some(DEFAULT_PERF_BUDGET_MS);
        }
        None
    }
}

impl SignalExtractor for CpuExtractor {
    fn name(&self) -> &str {
        "cpu"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Cpu
    }

    fn prior_confidence(&self) -> f64 {
        CPU_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if self.vocabulary.is_match(&view.text) {
            return Some(self.signal_from(view).infra(true));
        }

        let budget = self.inferred_budget_ms(&view.event.test_name)?;
        let duration = view.event.duration_ms?;
        if duration <= budget {
            return None;
        }
        let mut signal = self.signal_from(view).infra(true);
        signal.message = format!(
            "duration {duration}ms exceeded inferred budget {budget}ms: {}",
            signal.message
        );
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLevel, NormalizedEvent};

    fn view_of(event: &NormalizedEvent) -> EventView<'_> {
        EventView::new(event)
    }

    fn error(message: &str) -> NormalizedEvent {
        NormalizedEvent::new("t", "pytest", EventLevel::Error, message)
    }

    #[test]
    fn test_database_connectivity_vs_schema() {
        let extractor = DatabaseExtractor::new().unwrap();

        let event = error("FATAL: too many connections for role \"app\"");
        let signal = extractor.extract(&view_of(&event)).unwrap();
        assert!(signal.is_infra_related);
        assert!(signal.is_retryable);

        let event = error("psycopg2.errors.UndefinedTable: relation \"orders\" does not exist");
        let signal = extractor.extract(&view_of(&event)).unwrap();
        assert!(!signal.is_infra_related);
        assert!(!signal.is_retryable);
    }

    #[test]
    fn test_network_errors() {
        let extractor = NetworkExtractor::new().unwrap();
        let event = error("connect ECONNREFUSED 127.0.0.1:5432");
        let signal = extractor.extract(&view_of(&event)).unwrap();
        assert_eq!(signal.signal_type, SignalType::Network);
        assert!(signal.is_infra_related);
        assert!(extractor.extract(&view_of(&error("expected 1 got 2"))).is_none());
    }

    #[test]
    fn test_service_terms() {
        let event = error("upstream connect error or disconnect/reset before headers");
        assert!(ServiceExtractor.extract(&view_of(&event)).is_some());
    }

    #[test]
    fn test_memory_patterns() {
        let extractor = MemoryExtractor::new().unwrap();
        let event = error("FATAL ERROR: Reached heap limit Allocation failed - JavaScript heap out of memory");
        let signal = extractor.extract(&view_of(&event)).unwrap();
        assert!(signal.is_infra_related);
        assert!(!signal.is_retryable);
    }

    #[test]
    fn test_cpu_budget_inference() {
        let extractor = CpuExtractor::new().unwrap();
        assert_eq!(extractor.inferred_budget_ms("test_search_under_500ms"), Some(500));
        assert_eq!(extractor.inferred_budget_ms("checkout_within_2s_chrome"), Some(2_000));
        assert_eq!(
            extractor.inferred_budget_ms("perf_homepage_render"),
            Some(DEFAULT_PERF_BUDGET_MS)
        );
        assert_eq!(extractor.inferred_budget_ms("test_login"), None);
    }

    #[test]
    fn test_cpu_signal_only_when_budget_exceeded() {
        let extractor = CpuExtractor::new().unwrap();
        let mut event = NormalizedEvent::new(
            "test_search_under_500ms",
            "pytest",
            EventLevel::Error,
            "search too slow",
        )
        .with_duration(1_250);
        let signal = extractor.extract(&view_of(&event)).unwrap();
        assert!(signal.message.contains("1250ms"));
        assert!(signal.message.contains("500ms"));

        event.duration_ms = Some(400);
        assert!(extractor.extract(&view_of(&event)).is_none());
    }
}
