//! CI Decision Engine
//!
//! Maps a classified, scored failure to a FAIL/WARN/PASS gate action. The
//! engine is a pure function of its inputs and the policy; the first rule
//! in evaluation order that applies decides.

use crate::flaky::FailureNature;
use crate::rules::FailureType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CiAction {
    #[default]
    Pass,
    Warn,
    Fail,
}

impl CiAction {
    /// Most severe of two actions.
    pub fn escalate(self, other: CiAction) -> CiAction {
        self.max(other)
    }
}

/// Action for flaky failures; FAIL is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlakyAction {
    Pass,
    #[default]
    Warn,
}

impl From<FlakyAction> for CiAction {
    fn from(action: FlakyAction) -> Self {
        match action {
            FlakyAction::Pass => CiAction::Pass,
            FlakyAction::Warn => CiAction::Warn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CiPolicy {
    pub threshold_high: f64,
    pub threshold_low: f64,
    pub flaky_action: FlakyAction,
    pub environment_action: CiAction,
    pub configuration_action: CiAction,
}

impl Default for CiPolicy {
    fn default() -> Self {
        Self {
            threshold_high: 0.75,
            threshold_low: 0.40,
            flaky_action: FlakyAction::Warn,
            environment_action: CiAction::Warn,
            configuration_action: CiAction::Warn,
        }
    }
}

/// The rule that produced a decision, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    FlakyFailure,
    LowConfidence,
    AutomationDefect,
    ConfidentProductDefect,
    UncertainProductDefect,
    EnvironmentPolicy,
    ConfigurationPolicy,
    UnknownFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiDecision {
    pub action: CiAction,
    pub rule: DecisionRule,
    pub reason: String,
}

pub fn decide(
    failure_type: FailureType,
    confidence: f64,
    nature: FailureNature,
    policy: &CiPolicy,
) -> CiDecision {
    let decision = |action: CiAction, rule: DecisionRule, reason: String| CiDecision {
        action,
        rule,
        reason,
    };

    if nature == FailureNature::Flaky {
        return decision(
            policy.flaky_action.into(),
            DecisionRule::FlakyFailure,
            format!(
                "failure classified FLAKY; policy action {:?} (confidence {:.2})",
                policy.flaky_action, confidence
            ),
        );
    }

    if confidence < policy.threshold_low {
        return decision(
            CiAction::Warn,
            DecisionRule::LowConfidence,
            format!(
                "confidence {:.2} below low threshold {:.2}",
                confidence, policy.threshold_low
            ),
        );
    }

    match failure_type {
        FailureType::AutomationDefect => decision(
            CiAction::Warn,
            DecisionRule::AutomationDefect,
            format!("automation defect (confidence {confidence:.2}) does not block the build"),
        ),
        FailureType::ProductDefect if confidence >= policy.threshold_high => decision(
            CiAction::Fail,
            DecisionRule::ConfidentProductDefect,
            format!(
                "product defect with confidence {:.2} >= high threshold {:.2} ({:?})",
                confidence, policy.threshold_high, nature
            ),
        ),
        FailureType::ProductDefect => decision(
            CiAction::Warn,
            DecisionRule::UncertainProductDefect,
            format!(
                "product defect with confidence {:.2} below high threshold {:.2}",
                confidence, policy.threshold_high
            ),
        ),
        FailureType::EnvironmentIssue => decision(
            policy.environment_action,
            DecisionRule::EnvironmentPolicy,
            format!(
                "environment issue (confidence {:.2}); policy action {:?}",
                confidence, policy.environment_action
            ),
        ),
        FailureType::ConfigurationIssue => decision(
            policy.configuration_action,
            DecisionRule::ConfigurationPolicy,
            format!(
                "configuration issue (confidence {:.2}); policy action {:?}",
                confidence, policy.configuration_action
            ),
        ),
        FailureType::Unknown => decision(
            CiAction::Warn,
            DecisionRule::UnknownFailure,
            format!("unclassified failure (confidence {confidence:.2})"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [FailureType; 5] = [
        FailureType::ProductDefect,
        FailureType::AutomationDefect,
        FailureType::EnvironmentIssue,
        FailureType::ConfigurationIssue,
        FailureType::Unknown,
    ];

    #[test]
    fn test_confident_deterministic_product_defect_fails() {
        let decision = decide(
            FailureType::ProductDefect,
            0.92,
            FailureNature::Deterministic,
            &CiPolicy::default(),
        );
        assert_eq!(decision.action, CiAction::Fail);
        assert_eq!(decision.rule, DecisionRule::ConfidentProductDefect);
        assert!(decision.reason.contains("0.92"));
    }

    #[test]
    fn test_flaky_never_fails() {
        for policy in [
            CiPolicy::default(),
            CiPolicy {
                flaky_action: FlakyAction::Pass,
                environment_action: CiAction::Fail,
                configuration_action: CiAction::Fail,
                ..CiPolicy::default()
            },
        ] {
            for failure_type in ALL_TYPES {
                for confidence in [0.0, 0.5, 0.92, 1.0] {
                    let decision = decide(failure_type, confidence, FailureNature::Flaky, &policy);
                    assert_ne!(decision.action, CiAction::Fail);
                    assert_eq!(decision.rule, DecisionRule::FlakyFailure);
                }
            }
        }
    }

    #[test]
    fn test_low_confidence_warns() {
        for failure_type in ALL_TYPES {
            let decision = decide(failure_type, 0.39, FailureNature::Deterministic, &CiPolicy::default());
            assert_eq!(decision.action, CiAction::Warn);
            assert_eq!(decision.rule, DecisionRule::LowConfidence);
        }
    }

    #[test]
    fn test_only_product_defects_fail_by_default() {
        for failure_type in ALL_TYPES {
            for nature in [FailureNature::Deterministic, FailureNature::Unknown] {
                let decision = decide(failure_type, 0.99, nature, &CiPolicy::default());
                let expected = if failure_type == FailureType::ProductDefect {
                    CiAction::Fail
                } else {
                    CiAction::Warn
                };
                assert_eq!(decision.action, expected, "{failure_type:?} {nature:?}");
            }
        }
    }

    #[test]
    fn test_product_defect_between_thresholds_warns() {
        let decision = decide(
            FailureType::ProductDefect,
            0.6,
            FailureNature::Deterministic,
            &CiPolicy::default(),
        );
        assert_eq!(decision.action, CiAction::Warn);
        assert_eq!(decision.rule, DecisionRule::UncertainProductDefect);
    }

    #[test]
    fn test_environment_and_configuration_follow_policy() {
        let policy = CiPolicy {
            environment_action: CiAction::Pass,
            configuration_action: CiAction::Fail,
            ..CiPolicy::default()
        };
        let env = decide(FailureType::EnvironmentIssue, 0.8, FailureNature::Unknown, &policy);
        assert_eq!(env.action, CiAction::Pass);
        assert_eq!(env.rule, DecisionRule::EnvironmentPolicy);
        let config = decide(FailureType::ConfigurationIssue, 0.8, FailureNature::Unknown, &policy);
        assert_eq!(config.action, CiAction::Fail);
    }

    #[test]
    fn test_decision_is_pure() {
        let policy = CiPolicy::default();
        let a = decide(FailureType::ProductDefect, 0.8, FailureNature::Unknown, &policy);
        let b = decide(FailureType::ProductDefect, 0.8, FailureNature::Unknown, &policy);
        assert_eq!(a, b);
    }

    #[test]
    fn test_escalate_orders_by_severity() {
        assert_eq!(CiAction::Pass.escalate(CiAction::Warn), CiAction::Warn);
        assert_eq!(CiAction::Fail.escalate(CiAction::Pass), CiAction::Fail);
    }
}
