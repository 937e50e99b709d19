//! Signal extraction
//!
//! Turns a single normalized event into typed observations. Every extractor
//! builds the same `Signal` struct; the engine concatenates their outputs and
//! resolves a code reference from the stack trace once per signal.

pub mod infra;
pub mod test_failures;

use crate::event::NormalizedEvent;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prior assigned to error events no extractor recognised.
pub const UNKNOWN_PRIOR: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Assertion,
    Timeout,
    Locator,
    Http,
    Database,
    Network,
    Service,
    Memory,
    Cpu,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_type: SignalType,
    pub message: String,
    pub prior_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// First `file:line` frame found in the trace or message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_reference: Option<String>,
    pub is_retryable: bool,
    pub is_infra_related: bool,
}

impl Signal {
    pub fn new(signal_type: SignalType, message: &str, prior_confidence: f64) -> Self {
        Self {
            signal_type,
            message: message.to_string(),
            prior_confidence: prior_confidence.clamp(0.0, 1.0),
            stack_trace: None,
            code_reference: None,
            is_retryable: false,
            is_infra_related: false,
        }
    }

    /// Build a signal carrying the event's message and stack trace.
    pub fn from_event(signal_type: SignalType, event: &NormalizedEvent, prior: f64) -> Self {
        let message = if event.message.trim().is_empty() {
            event
                .stack_trace
                .as_deref()
                .and_then(|trace| trace.lines().find(|line| !line.trim().is_empty()))
                .unwrap_or_default()
                .trim()
                .to_string()
        } else {
            event.message.trim().to_string()
        };

        let mut signal = Self::new(signal_type, &message, prior);
        signal.stack_trace = event.stack_trace.clone();
        signal
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.is_retryable = retryable;
        self
    }

    pub fn infra(mut self, infra: bool) -> Self {
        self.is_infra_related = infra;
        self
    }

    pub fn with_stack_trace(mut self, trace: &str) -> Self {
        self.stack_trace = Some(trace.to_string());
        self
    }

    /// Message plus stack trace, lowercased.
    pub fn match_text(&self) -> String {
        match &self.stack_trace {
            Some(trace) => format!("{}\n{}", self.message, trace).to_lowercase(),
            None => self.message.to_lowercase(),
        }
    }
}

/// An event prepared once for all extractors.
pub struct EventView<'a> {
    pub event: &'a NormalizedEvent,
    /// Lowercased message and stack trace.
    pub text: String,
}

impl<'a> EventView<'a> {
    pub fn new(event: &'a NormalizedEvent) -> Self {
        Self {
            event,
            text: event.full_text().to_lowercase(),
        }
    }

    pub fn contains_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|needle| self.text.contains(needle))
    }
}

pub trait SignalExtractor: Send + Sync {
    fn name(&self) -> &str;
    fn signal_type(&self) -> SignalType;
    fn prior_confidence(&self) -> f64;
    fn extract(&self, view: &EventView<'_>) -> Option<Signal>;

    /// Signal of this extractor's type and prior for the viewed event.
    fn signal_from(&self, view: &EventView<'_>) -> Signal {
        Signal::from_event(self.signal_type(), view.event, self.prior_confidence())
    }
}

pub struct SignalEngine {
    extractors: Vec<Box<dyn SignalExtractor>>,
    code_reference: Regex,
}

impl SignalEngine {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            extractors: vec![
                Box::new(test_failures::AssertionExtractor),
                Box::new(test_failures::TimeoutExtractor),
                Box::new(test_failures::LocatorExtractor),
                Box::new(test_failures::HttpExtractor::new()?),
                Box::new(infra::DatabaseExtractor::new()?),
                Box::new(infra::NetworkExtractor::new()?),
                Box::new(infra::ServiceExtractor),
                Box::new(infra::MemoryExtractor::new()?),
                Box::new(infra::CpuExtractor::new()?),
            ],
            code_reference: Regex::new(
                r#"([\w.@/\\-]+\.(?:rs|py|js|mjs|cjs|ts|tsx|jsx|java|kt|rb|go|cs|php|scala))(?::(\d+)|"?,\s*line\s+(\d+))"#,
            )?,
        })
    }

    pub fn extractor_names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    /// Extract every signal the event supports. Never fails: malformed
    /// events yield an empty list.
    pub fn extract(&self, event: &NormalizedEvent) -> Vec<Signal> {
        if event.validate().is_err() {
            log::debug!("Skipping malformed event for '{}'", event.test_name);
            return Vec::new();
        }

        let view = EventView::new(event);
        let mut signals: Vec<Signal> = self
            .extractors
            .iter()
            .filter_map(|extractor| extractor.extract(&view))
            .collect();

        if signals.is_empty() && event.level.is_error() {
            signals.push(Signal::from_event(SignalType::Unknown, event, UNKNOWN_PRIOR));
        }

        for signal in &mut signals {
            signal.code_reference = self.resolve_code_reference(signal);
        }
        signals
    }

    pub fn extract_all(&self, events: &[NormalizedEvent]) -> Vec<Signal> {
        events.iter().flat_map(|event| self.extract(event)).collect()
    }

    fn resolve_code_reference(&self, signal: &Signal) -> Option<String> {
        let haystack = signal.stack_trace.as_deref().unwrap_or(&signal.message);
        let caps = self.code_reference.captures(haystack)?;
        let file = caps.get(1)?.as_str();
        let line = caps.get(2).or_else(|| caps.get(3))?.as_str();
        Some(format!("{file}:{line}"))
    }
}
