//! Normalized test-execution events as produced by upstream report adapters.

use crate::error::ExtractionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl EventLevel {
    pub fn is_error(self) -> bool {
        matches!(self, EventLevel::Error | EventLevel::Fatal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub test_name: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    /// RFC 3339, as supplied by the adapter.
    pub timestamp: String,
    #[serde(default)]
    pub level: EventLevel,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

fn default_event_type() -> String {
    "log".to_string()
}

impl NormalizedEvent {
    pub fn new(test_name: &str, framework: &str, level: EventLevel, message: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            event_type: default_event_type(),
            timestamp: Utc::now().to_rfc3339(),
            level,
            message: message.to_string(),
            stack_trace: None,
            framework: framework.to_string(),
            duration_ms: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: &str) -> Self {
        self.stack_trace = Some(stack_trace.to_string());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_timestamp(mut self, timestamp: &str) -> Self {
        self.timestamp = timestamp.to_string();
        self
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn validate(&self) -> Result<(), ExtractionError> {
        if self.test_name.trim().is_empty() {
            return Err(ExtractionError::MissingTestName);
        }
        let has_trace = self
            .stack_trace
            .as_deref()
            .is_some_and(|trace| !trace.trim().is_empty());
        if self.message.trim().is_empty() && !has_trace {
            return Err(ExtractionError::EmptyEvent(self.test_name.clone()));
        }
        if self.parsed_timestamp().is_none() {
            return Err(ExtractionError::InvalidTimestamp {
                test_name: self.test_name.clone(),
                timestamp: self.timestamp.clone(),
            });
        }
        Ok(())
    }

    /// Message and stack trace joined, for text matching.
    pub fn full_text(&self) -> String {
        match &self.stack_trace {
            Some(trace) => format!("{}\n{}", self.message, trace),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Failed,
    Passed,
}

/// One test's events for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUnit {
    pub test_name: String,
    pub framework: String,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default)]
    pub events: Vec<NormalizedEvent>,
    /// Application-side log lines captured alongside the run.
    #[serde(default)]
    pub application_logs: Vec<String>,
}

impl TestUnit {
    pub fn failed(test_name: &str, framework: &str, events: Vec<NormalizedEvent>) -> Self {
        Self {
            test_name: test_name.to_string(),
            framework: framework.to_string(),
            status: UnitStatus::Failed,
            events,
            application_logs: Vec::new(),
        }
    }

    pub fn passed(test_name: &str, framework: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            framework: framework.to_string(),
            status: UnitStatus::Passed,
            events: Vec::new(),
            application_logs: Vec::new(),
        }
    }

    pub fn with_application_logs(mut self, lines: Vec<String>) -> Self {
        self.application_logs = lines;
        self
    }

    /// Validate every event, including that it belongs to this unit.
    pub fn validate(&self) -> Result<(), ExtractionError> {
        for event in &self.events {
            event.validate()?;
            if event.test_name != self.test_name {
                return Err(ExtractionError::ForeignEvent {
                    expected: self.test_name.clone(),
                    found: event.test_name.clone(),
                });
            }
        }
        Ok(())
    }

    /// The event that best describes the failure: first error-level event,
    /// else the last event carrying text.
    pub fn primary_event(&self) -> Option<&NormalizedEvent> {
        self.events
            .iter()
            .find(|event| event.level.is_error())
            .or_else(|| {
                self.events
                    .iter()
                    .rev()
                    .find(|event| !event.message.trim().is_empty())
            })
    }

    /// Latest parseable event timestamp, falling back to now.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.events
            .iter()
            .filter_map(NormalizedEvent::parsed_timestamp)
            .max()
            .unwrap_or_else(Utc::now)
    }
}
