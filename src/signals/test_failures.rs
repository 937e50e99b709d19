//! Extractors for failures raised by the test itself: assertions, waits,
//! element lookups and HTTP responses.

use super::{EventView, Signal, SignalExtractor, SignalType};
use regex::Regex;

const ASSERTION_PRIOR: f64 = 0.85;
const TIMEOUT_PRIOR: f64 = 0.75;
const LOCATOR_PRIOR: f64 = 0.80;
const HTTP_PRIOR: f64 = 0.70;

const ASSERTION_TERMS: &[&str] = &[
    "assertionerror",
    "assertion failed",
    "assertion error",
    "assert ",
    "assert.",
    "expected",
    "to equal",
    "toequal(",
    "tobe(",
    "comparisonfailure",
    "does not match",
];

const TIMEOUT_TERMS: &[&str] = &[
    "timed out",
    "timeout",
    "deadline exceeded",
    "time limit exceeded",
];

const LOCATOR_TERMS: &[&str] = &[
    "element not found",
    "no such element",
    "nosuchelementexception",
    "unable to locate element",
    "locator",
    "selector",
    "stale element",
    "element is not attached",
    "not clickable",
    "not visible",
];

pub struct AssertionExtractor;

impl SignalExtractor for AssertionExtractor {
    fn name(&self) -> &str {
        "assertion"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Assertion
    }

    fn prior_confidence(&self) -> f64 {
        ASSERTION_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !view.contains_any(ASSERTION_TERMS) {
            return None;
        }
        Some(self.signal_from(view))
    }
}

pub struct TimeoutExtractor;

impl SignalExtractor for TimeoutExtractor {
    fn name(&self) -> &str {
        "timeout"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Timeout
    }

    fn prior_confidence(&self) -> f64 {
        TIMEOUT_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !view.contains_any(TIMEOUT_TERMS) {
            return None;
        }
        Some(self.signal_from(view).retryable(true))
    }
}

pub struct LocatorExtractor;

impl SignalExtractor for LocatorExtractor {
    fn name(&self) -> &str {
        "locator"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Locator
    }

    fn prior_confidence(&self) -> f64 {
        LOCATOR_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        if !view.contains_any(LOCATOR_TERMS) {
            return None;
        }
        Some(self.signal_from(view).retryable(true))
    }
}

/// Recognises 4xx/5xx responses. Server errors are retryable and
/// infrastructure related; client errors are neither.
pub struct HttpExtractor {
    status: Regex,
}

impl HttpExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            status: Regex::new(
                r"\b(?:http(?:/\d(?:\.\d)?)?|status(?:\s+code)?|response\s+code|returned|responded\s+with)\s*[:=]?\s*([45]\d{2})\b",
            )?,
        })
    }

    fn status_code(&self, text: &str) -> Option<u16> {
        if let Some(caps) = self.status.captures(text) {
            return caps.get(1)?.as_str().parse().ok();
        }
        if text.contains("internal server error") {
            return Some(500);
        }
        None
    }
}

impl SignalExtractor for HttpExtractor {
    fn name(&self) -> &str {
        "http"
    }

    fn signal_type(&self) -> SignalType {
        SignalType::Http
    }

    fn prior_confidence(&self) -> f64 {
        HTTP_PRIOR
    }

    fn extract(&self, view: &EventView<'_>) -> Option<Signal> {
        let code = self.status_code(&view.text)?;
        let server_side = code >= 500;
        Some(
            self.signal_from(view)
                .retryable(server_side)
                .infra(server_side),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLevel, NormalizedEvent};

    fn extract_with(extractor: &dyn SignalExtractor, message: &str) -> Option<Signal> {
        let event = NormalizedEvent::new("t", "cypress", EventLevel::Error, message);
        extractor.extract(&EventView::new(&event))
    }

    #[test]
    fn test_assertion_vocabulary() {
        let signal = extract_with(&AssertionExtractor, "AssertionError: expected 3 to equal 4");
        let signal = signal.unwrap();
        assert_eq!(signal.signal_type, SignalType::Assertion);
        assert!(!signal.is_retryable);
        assert!(!signal.is_infra_related);
        assert!(extract_with(&AssertionExtractor, "page loaded").is_none());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let signal = extract_with(&TimeoutExtractor, "Test timed out after 5000ms").unwrap();
        assert!(signal.is_retryable);
        assert_eq!(signal.prior_confidence, TIMEOUT_PRIOR);
    }

    #[test]
    fn test_locator_terms() {
        assert!(extract_with(&LocatorExtractor, "element not found: #login").is_some());
        assert!(extract_with(
            &LocatorExtractor,
            "org.openqa.selenium.NoSuchElementException: no such element"
        )
        .is_some());
        assert!(extract_with(&LocatorExtractor, "user created").is_none());
    }

    #[test]
    fn test_http_server_error_is_infra() {
        let extractor = HttpExtractor::new().unwrap();
        let signal = extract_with(&extractor, "Request failed with status code 503").unwrap();
        assert!(signal.is_infra_related);
        assert!(signal.is_retryable);

        let signal = extract_with(&extractor, "GET /api/cart returned 404").unwrap();
        assert!(!signal.is_infra_related);
        assert!(!signal.is_retryable);
    }

    #[test]
    fn test_http_ignores_plain_numbers() {
        let extractor = HttpExtractor::new().unwrap();
        assert!(extract_with(&extractor, "expected 500 items but got 499").is_none());
        assert!(extract_with(&extractor, "Internal Server Error").is_some());
    }
}
