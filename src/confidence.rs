//! Confidence scoring for a classified failure.
//!
//! `final = clamp(0.35·rule + 0.25·signal_quality + 0.20·history
//!               + 0.20·log_completeness + ai_adjustment, 0, 1)`

use crate::event::TestUnit;
use crate::history::HistoryState;
use crate::rules::{FailureVerdict, RuleBasis};
use crate::signals::Signal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RULE_WEIGHT: f64 = 0.35;
pub const SIGNAL_QUALITY_WEIGHT: f64 = 0.25;
pub const HISTORY_WEIGHT: f64 = 0.20;
pub const LOG_COMPLETENESS_WEIGHT: f64 = 0.20;

/// Upper bound on any AI adjustment.
pub const MAX_AI_ADJUSTMENT: f64 = 0.3;

/// Messages shorter than this are never considered specific.
const SPECIFIC_MESSAGE_MIN_CHARS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCompleteness {
    /// Automation events plus application logs.
    Full,
    AutomationOnly,
    /// No usable events, or malformed ones.
    Missing,
}

impl LogCompleteness {
    pub fn assess(unit: &TestUnit) -> Self {
        if unit.events.is_empty() || unit.validate().is_err() {
            return LogCompleteness::Missing;
        }
        if unit.application_logs.iter().any(|line| !line.trim().is_empty()) {
            LogCompleteness::Full
        } else {
            LogCompleteness::AutomationOnly
        }
    }

    pub fn score(self) -> f64 {
        match self {
            LogCompleteness::Full => 1.0,
            LogCompleteness::AutomationOnly => 0.7,
            LogCompleteness::Missing => 0.0,
        }
    }
}

/// Optional external model that nudges confidence upward. Must never be
/// used to change the failure type.
pub trait AiAdjuster: Send + Sync {
    fn name(&self) -> &str;

    /// Suggested adjustment, or `None` when the model is unavailable.
    fn adjustment(&self, verdict: &FailureVerdict, signals: &[Signal]) -> Option<f64>;
}

/// History as seen by the scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEvidence {
    pub state: HistoryState,
    /// False when the flaky detector called this failure FLAKY.
    pub consistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub rule_score: f64,
    pub signal_quality_score: f64,
    pub history_score: f64,
    pub log_completeness_score: f64,
    pub ai_adjustment: f64,
    #[serde(rename = "final")]
    pub final_confidence: f64,
}

impl ConfidenceBreakdown {
    pub fn new(
        rule_score: f64,
        signal_quality_score: f64,
        history_score: f64,
        log_completeness_score: f64,
        ai_adjustment: f64,
    ) -> Self {
        let mut breakdown = Self {
            rule_score,
            signal_quality_score,
            history_score,
            log_completeness_score,
            ai_adjustment: ai_adjustment.clamp(0.0, MAX_AI_ADJUSTMENT),
            final_confidence: 0.0,
        };
        breakdown.final_confidence = breakdown.unclamped_total().clamp(0.0, 1.0);
        breakdown
    }

    /// Weighted component sum, without the AI adjustment.
    pub fn weighted_total(&self) -> f64 {
        RULE_WEIGHT * self.rule_score
            + SIGNAL_QUALITY_WEIGHT * self.signal_quality_score
            + HISTORY_WEIGHT * self.history_score
            + LOG_COMPLETENESS_WEIGHT * self.log_completeness_score
    }

    pub fn unclamped_total(&self) -> f64 {
        self.weighted_total() + self.ai_adjustment
    }
}

/// Noisy-OR of the rule's base confidence with corroborating signals.
pub fn rule_score(basis: Option<&RuleBasis>) -> f64 {
    let Some(basis) = basis else {
        return 0.0;
    };
    let base = basis.base_confidence.clamp(0.0, 1.0);
    let residual = basis
        .corroborating_priors
        .iter()
        .fold(1.0 - base, |acc, prior| acc * (1.0 - base * prior.clamp(0.0, 1.0)));
    (1.0 - residual).min(1.0)
}

pub fn history_score(evidence: &HistoryEvidence) -> f64 {
    match evidence.state {
        HistoryState::Unavailable => 0.0,
        HistoryState::FirstSeen => 0.2,
        HistoryState::Repeating { boost, .. } if evidence.consistent => 0.5 + 0.5 * boost,
        HistoryState::Repeating { boost, .. } => 0.3 + 0.3 * boost,
    }
}

pub struct ConfidenceCalculator {
    adjuster: Option<Arc<dyn AiAdjuster>>,
    max_ai_adjustment: f64,
    specific_token: Regex,
}

impl ConfidenceCalculator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            adjuster: None,
            max_ai_adjustment: MAX_AI_ADJUSTMENT,
            // quoted value, CSS/XPath selector, or identifier-like token
            specific_token: Regex::new(
                r#"'[^']+'|"[^"]+"|`[^`]+`|(?:^|[\s(])[#.][A-Za-z][\w-]*|\[[\w-]+(?:=[^\]]*)?\]|//\w+|\b[a-z]+[A-Z]\w*|\b[A-Za-z]\w*_\w+|\b[A-Za-z]\w*\.[A-Za-z]\w*\("#,
            )?,
        })
    }

    pub fn with_adjuster(mut self, adjuster: Arc<dyn AiAdjuster>, max_adjustment: f64) -> Self {
        self.adjuster = Some(adjuster);
        self.max_ai_adjustment = max_adjustment.clamp(0.0, MAX_AI_ADJUSTMENT);
        self
    }

    /// Adjustment from the configured adjuster; 0 when absent or unavailable.
    pub fn ai_adjustment(&self, verdict: &FailureVerdict, signals: &[Signal]) -> f64 {
        let Some(adjuster) = &self.adjuster else {
            return 0.0;
        };
        match adjuster.adjustment(verdict, signals) {
            Some(value) if value.is_finite() => value.clamp(0.0, self.max_ai_adjustment),
            Some(value) => {
                log::warn!("AI adjuster '{}' returned {}, ignoring", adjuster.name(), value);
                0.0
            }
            None => {
                log::debug!("AI adjuster '{}' unavailable", adjuster.name());
                0.0
            }
        }
    }

    fn is_specific(&self, message: &str) -> bool {
        message.chars().count() >= SPECIFIC_MESSAGE_MIN_CHARS && self.specific_token.is_match(message)
    }

    pub fn signal_quality(&self, signals: &[Signal]) -> f64 {
        let mut score: f64 = 0.1;
        if signals.is_empty() {
            return score;
        }
        score += 0.2;
        if signals.iter().any(|s| s.stack_trace.as_deref().is_some_and(|t| !t.trim().is_empty())) {
            score += 0.3;
        }
        if signals.iter().any(|s| s.code_reference.is_some()) {
            score += 0.2;
        }
        if signals.iter().any(|s| self.is_specific(&s.message)) {
            score += 0.2;
        }
        score.min(1.0)
    }

    pub fn score(
        &self,
        verdict: &FailureVerdict,
        signals: &[Signal],
        history: &HistoryEvidence,
        log_completeness: LogCompleteness,
        ai_adjustment: f64,
    ) -> ConfidenceBreakdown {
        ConfidenceBreakdown::new(
            rule_score(verdict.rule_basis.as_ref()),
            self.signal_quality(signals),
            history_score(history),
            log_completeness.score(),
            ai_adjustment,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventLevel, NormalizedEvent};
    use crate::rules::FailureType;
    use crate::signals::SignalType;

    const EPS: f64 = 1e-9;

    fn calculator() -> ConfidenceCalculator {
        ConfidenceCalculator::new().unwrap()
    }

    fn verdict(base: f64, corroborating: Vec<f64>) -> FailureVerdict {
        FailureVerdict {
            failure_type: FailureType::AutomationDefect,
            matched_rule_id: Some("pw-element-not-found".into()),
            evidence: vec!["element not found: #login".into()],
            reason: "test".into(),
            rule_basis: Some(RuleBasis {
                base_confidence: base,
                pack: "playwright".into(),
                corroborating_priors: corroborating,
            }),
        }
    }

    fn first_seen() -> HistoryEvidence {
        HistoryEvidence {
            state: HistoryState::FirstSeen,
            consistent: true,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let sum = RULE_WEIGHT + SIGNAL_QUALITY_WEIGHT + HISTORY_WEIGHT + LOG_COMPLETENESS_WEIGHT;
        assert!((sum - 1.0).abs() < EPS);
    }

    #[test]
    fn test_rule_score_corroboration() {
        assert_eq!(rule_score(None), 0.0);
        assert!((rule_score(Some(&verdict(0.9, vec![]).rule_basis.unwrap())) - 0.9).abs() < EPS);

        let one = rule_score(Some(&verdict(0.6, vec![0.8]).rule_basis.unwrap()));
        assert!((one - (1.0 - 0.4 * (1.0 - 0.48))).abs() < EPS);

        let mut previous = 0.6;
        let mut priors = Vec::new();
        for _ in 0..20 {
            priors.push(0.9);
            let score = rule_score(Some(&verdict(0.6, priors.clone()).rule_basis.unwrap()));
            assert!(score >= previous);
            assert!(score <= 1.0);
            previous = score;
        }
    }

    #[test]
    fn test_history_score_levels() {
        let score = |state, consistent| history_score(&HistoryEvidence { state, consistent });
        assert_eq!(score(HistoryState::Unavailable, true), 0.0);
        assert_eq!(score(HistoryState::FirstSeen, true), 0.2);
        let repeating = HistoryState::Repeating {
            frequency: 5,
            boost: 0.5,
        };
        assert!((score(repeating, true) - 0.75).abs() < EPS);
        assert!((score(repeating, false) - 0.45).abs() < EPS);
    }

    #[test]
    fn test_history_score_monotone_in_boost() {
        let mut previous = 0.0;
        for step in 0..=10 {
            let boost = f64::from(step) / 10.0 * 0.999;
            let value = history_score(&HistoryEvidence {
                state: HistoryState::Repeating { frequency: 1, boost },
                consistent: true,
            });
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn test_signal_quality_components() {
        let calc = calculator();
        assert!((calc.signal_quality(&[]) - 0.1).abs() < EPS);

        let bare = Signal::new(SignalType::Unknown, "boom", 0.3);
        assert!((calc.signal_quality(&[bare]) - 0.3).abs() < EPS);

        let mut rich = Signal::new(
            SignalType::Locator,
            "element not found: locator('#login-button')",
            0.8,
        )
        .with_stack_trace("at tests/login.spec.ts:42:13");
        rich.code_reference = Some("tests/login.spec.ts:42".into());
        assert!((calc.signal_quality(&[rich]) - 1.0).abs() < EPS);
    }

    #[test]
    fn test_specific_message_detection() {
        let calc = calculator();
        assert!(calc.is_specific("expected 'Welcome back' to be visible on page"));
        assert!(calc.is_specific("timed out waiting for #checkout-submit to appear"));
        assert!(calc.is_specific("NullPointerException in orderService.applyCoupon("));
        assert!(!calc.is_specific("it broke"));
        assert!(!calc.is_specific("something went wrong while running the suite"));
    }

    #[test]
    fn test_log_completeness() {
        let event = NormalizedEvent::new("login", "pytest", EventLevel::Error, "boom");
        let unit = TestUnit::failed("login", "pytest", vec![event.clone()]);
        assert_eq!(LogCompleteness::assess(&unit), LogCompleteness::AutomationOnly);

        let unit = unit.with_application_logs(vec!["ERROR db down".into()]);
        assert_eq!(LogCompleteness::assess(&unit), LogCompleteness::Full);

        let unit = TestUnit::failed("login", "pytest", vec![]);
        assert_eq!(LogCompleteness::assess(&unit), LogCompleteness::Missing);

        let broken = TestUnit::failed("login", "pytest", vec![event.with_timestamp("garbage")]);
        assert_eq!(LogCompleteness::assess(&broken), LogCompleteness::Missing);
    }

    #[test]
    fn test_ai_adjustment_adds_exactly() {
        let calc = calculator();
        let verdict = verdict(0.9, vec![]);
        let signals = vec![Signal::new(SignalType::Locator, "element not found: #login", 0.8)];

        let without = calc.score(&verdict, &signals, &first_seen(), LogCompleteness::AutomationOnly, 0.0);
        let with = calc.score(&verdict, &signals, &first_seen(), LogCompleteness::AutomationOnly, 0.2);

        assert!((with.unclamped_total() - without.unclamped_total() - 0.2).abs() < EPS);
        assert!(with.final_confidence < 1.0);
        assert!((with.final_confidence - without.final_confidence - 0.2).abs() < EPS);
        assert_eq!(verdict.failure_type, FailureType::AutomationDefect);
    }

    #[test]
    fn test_final_is_clamped() {
        let maxed = ConfidenceBreakdown::new(1.0, 1.0, 1.0, 1.0, 0.3);
        assert_eq!(maxed.final_confidence, 1.0);
        assert_eq!(maxed.ai_adjustment, 0.3);

        let capped_ai = ConfidenceBreakdown::new(0.0, 0.0, 0.0, 0.0, 5.0);
        assert_eq!(capped_ai.ai_adjustment, MAX_AI_ADJUSTMENT);

        let negative = ConfidenceBreakdown::new(0.0, 0.0, 0.0, 0.0, -1.0);
        assert_eq!(negative.final_confidence, 0.0);
    }

    #[test]
    fn test_final_non_decreasing_in_each_component() {
        fn breakdown(components: [f64; 4], ai: f64) -> ConfidenceBreakdown {
            ConfidenceBreakdown::new(components[0], components[1], components[2], components[3], ai)
        }

        for varied in 0..4 {
            for fixed in [0.0, 0.35, 0.7, 1.0] {
                for ai in [0.0, 0.15, MAX_AI_ADJUSTMENT] {
                    let mut previous = f64::NEG_INFINITY;
                    for step in 0..=20 {
                        let mut components = [fixed; 4];
                        components[varied] = f64::from(step) / 20.0;
                        let score = breakdown(components, ai).final_confidence;
                        assert!(
                            score >= previous,
                            "final dropped at component {varied}, step {step}, others {fixed}, ai {ai}"
                        );
                        assert!((0.0..=1.0).contains(&score));
                        previous = score;
                    }
                }
            }
        }
    }

    struct FixedAdjuster(Option<f64>);

    impl AiAdjuster for FixedAdjuster {
        fn name(&self) -> &str {
            "fixed"
        }

        fn adjustment(&self, _: &FailureVerdict, _: &[Signal]) -> Option<f64> {
            self.0
        }
    }

    #[test]
    fn test_adjuster_is_clamped_and_optional() {
        let verdict = verdict(0.9, vec![]);
        assert_eq!(calculator().ai_adjustment(&verdict, &[]), 0.0);

        let calc = calculator().with_adjuster(Arc::new(FixedAdjuster(Some(0.8))), 0.25);
        assert_eq!(calc.ai_adjustment(&verdict, &[]), 0.25);

        let calc = calculator().with_adjuster(Arc::new(FixedAdjuster(None)), 0.3);
        assert_eq!(calc.ai_adjustment(&verdict, &[]), 0.0);

        let calc = calculator().with_adjuster(Arc::new(FixedAdjuster(Some(f64::NAN))), 0.3);
        assert_eq!(calc.ai_adjustment(&verdict, &[]), 0.0);
    }
}
