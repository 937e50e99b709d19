//! Rule packs and the failure classifier.
//!
//! One YAML file per framework pack plus a generic fallback pack. Packs are
//! validated and sorted on load; a loaded `RuleSet` is immutable and shared
//! through `RuleRegistry` snapshots.

use crate::error::ConfigError;
use crate::signals::Signal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const GENERIC_SCOPE: &str = "generic";

/// Maximum evidence entries attached to a verdict.
pub const MAX_EVIDENCE: usize = 3;

/// Maximum characters per evidence entry.
pub const MAX_EVIDENCE_CHARS: usize = 200;

const BUILTIN_PACKS: &[(&str, &str)] = &[
    ("generic.yaml", include_str!("../rules/generic.yaml")),
    ("playwright.yaml", include_str!("../rules/playwright.yaml")),
    ("selenium.yaml", include_str!("../rules/selenium.yaml")),
    ("cypress.yaml", include_str!("../rules/cypress.yaml")),
    ("pytest.yaml", include_str!("../rules/pytest.yaml")),
    ("junit.yaml", include_str!("../rules/junit.yaml")),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ProductDefect,
    AutomationDefect,
    EnvironmentIssue,
    ConfigurationIssue,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: String,
    /// Framework name or `generic`. Taken from the pack when omitted.
    #[serde(default)]
    pub scope: String,
    pub match_any: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_all: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    pub failure_type: FailureType,
    pub base_confidence: f64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Rule {
    /// Any `match_any` term in `text`. Terms are lowercased at load.
    fn matches_any(&self, text: &str) -> bool {
        self.match_any.iter().any(|term| text.contains(term.as_str()))
    }

    /// Whether lowercased `text` satisfies this rule.
    pub fn matches(&self, text: &str) -> bool {
        self.matches_any(text)
            && self.match_all.iter().all(|term| text.contains(term.as_str()))
            && !self.excludes.iter().any(|term| text.contains(term.as_str()))
    }

    fn normalize_terms(&mut self) {
        for terms in [&mut self.match_any, &mut self.match_all, &mut self.excludes] {
            for term in terms.iter_mut() {
                *term = term.to_lowercase();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulePack {
    pub framework: String,
    pub rules: Vec<Rule>,
    #[serde(skip)]
    pub digest: String,
}

impl RulePack {
    /// Parse and validate a pack. `source` names the file in errors.
    pub fn from_yaml(source: &str, content: &str) -> Result<Self, ConfigError> {
        let mut pack: RulePack =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: source.to_string(),
                source: e,
            })?;
        pack.framework = pack.framework.trim().to_lowercase();
        pack.digest = content_digest(&[content]);
        pack.validate(source)?;

        for rule in &mut pack.rules {
            rule.normalize_terms();
            if rule.scope.is_empty() {
                rule.scope = pack.framework.clone();
            }
        }
        pack.rules
            .sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(pack)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&path.display().to_string(), &content)
    }

    fn validate(&self, source: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            pack: source.to_string(),
            reason,
        };

        if self.framework.is_empty() {
            return Err(invalid("pack has no framework name".to_string()));
        }

        let mut ids = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(invalid("rule with empty id".to_string()));
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate rule id '{}'", rule.id)));
            }
            if rule.match_any.is_empty() || rule.match_any.iter().any(|t| t.trim().is_empty()) {
                return Err(invalid(format!("rule '{}' has an empty match_any", rule.id)));
            }
            if !(0.0..=1.0).contains(&rule.base_confidence) {
                return Err(invalid(format!(
                    "rule '{}' base_confidence {} outside [0, 1]",
                    rule.id, rule.base_confidence
                )));
            }
            if rule.failure_type == FailureType::Unknown {
                return Err(invalid(format!("rule '{}' cannot classify as UNKNOWN", rule.id)));
            }
        }
        Ok(())
    }

    /// First satisfied rule in priority order.
    pub fn find_match(&self, text: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(text))
    }
}

#[derive(Debug, Clone)]
pub struct RuleMatch<'a> {
    pub rule: &'a Rule,
    pub pack: &'a str,
}

/// What the confidence calculator needs from the matched rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleBasis {
    pub base_confidence: f64,
    pub pack: String,
    /// Priors of supporting signals beyond the first.
    pub corroborating_priors: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureVerdict {
    pub failure_type: FailureType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    pub evidence: Vec<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_basis: Option<RuleBasis>,
}

impl FailureVerdict {
    pub fn unknown(reason: &str) -> Self {
        Self {
            failure_type: FailureType::Unknown,
            matched_rule_id: None,
            evidence: Vec::new(),
            reason: reason.to_string(),
            rule_basis: None,
        }
    }

    /// Append an evidence note, respecting the evidence bounds.
    pub fn annotate(&mut self, note: &str) {
        if self.evidence.len() >= MAX_EVIDENCE {
            self.evidence.pop();
        }
        self.evidence.push(truncate_evidence(note));
    }
}

pub fn truncate_evidence(text: &str) -> String {
    if text.chars().count() <= MAX_EVIDENCE_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_EVIDENCE_CHARS).collect()
}

fn content_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    generic: RulePack,
    frameworks: HashMap<String, RulePack>,
    pub version: u64,
    pub digest: String,
}

impl RuleSet {
    pub fn new(generic: RulePack, packs: Vec<RulePack>) -> Self {
        let mut digests = vec![generic.digest.clone()];
        let mut frameworks = HashMap::new();
        for pack in packs {
            digests.push(pack.digest.clone());
            if frameworks.contains_key(&pack.framework) {
                log::warn!(
                    "Duplicate rule pack for framework '{}', keeping the first",
                    pack.framework
                );
                continue;
            }
            frameworks.insert(pack.framework.clone(), pack);
        }
        digests.sort();
        let refs: Vec<&str> = digests.iter().map(String::as_str).collect();
        Self {
            generic,
            frameworks,
            version: 1,
            digest: content_digest(&refs),
        }
    }

    /// Packs compiled into the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        let mut generic = None;
        let mut packs = Vec::new();
        for (name, content) in BUILTIN_PACKS {
            let pack = RulePack::from_yaml(name, content)?;
            if pack.framework == GENERIC_SCOPE {
                generic = Some(pack);
            } else {
                packs.push(pack);
            }
        }
        let generic = generic.ok_or_else(|| ConfigError::MissingGenericPack("built-in".into()))?;
        Ok(Self::new(generic, packs))
    }

    /// Load every `.yaml`/`.yml` file in `dir`. `generic.yaml` is required;
    /// broken framework packs are skipped with a warning.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut yaml_files = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            let is_yaml = path
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if path.is_file() && is_yaml {
                yaml_files.push(path);
            }
        }
        yaml_files.sort();

        let mut generic = None;
        let mut packs = Vec::new();
        for path in &yaml_files {
            let is_generic_file = path
                .file_stem()
                .map(|stem| stem == GENERIC_SCOPE)
                .unwrap_or(false);

            if is_generic_file {
                let pack = RulePack::load_from_file(path)?;
                if pack.framework != GENERIC_SCOPE {
                    return Err(ConfigError::InvalidRule {
                        pack: path.display().to_string(),
                        reason: format!("generic pack declares framework '{}'", pack.framework),
                    });
                }
                generic = Some(pack);
                continue;
            }

            match RulePack::load_from_file(path) {
                Ok(pack) if pack.framework == GENERIC_SCOPE => {
                    log::warn!(
                        "Skipping {}: only generic.yaml may hold the generic pack",
                        path.display()
                    );
                }
                Ok(pack) => {
                    log::info!(
                        "Loaded rule pack '{}' ({} rules) from {}",
                        pack.framework,
                        pack.rules.len(),
                        path.display()
                    );
                    packs.push(pack);
                }
                Err(e) => {
                    log::warn!("Skipping rule pack {}: {}", path.display(), e);
                }
            }
        }

        let generic =
            generic.ok_or_else(|| ConfigError::MissingGenericPack(dir.display().to_string()))?;
        Ok(Self::new(generic, packs))
    }

    pub fn generic(&self) -> &RulePack {
        &self.generic
    }

    pub fn framework_pack(&self, framework: &str) -> Option<&RulePack> {
        self.frameworks.get(&framework.trim().to_lowercase())
    }

    /// Framework names with a pack, sorted.
    pub fn frameworks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.frameworks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn rule_count(&self) -> usize {
        self.generic.rules.len() + self.frameworks.values().map(|p| p.rules.len()).sum::<usize>()
    }

    /// Match against the framework's own pack only.
    pub fn match_framework(&self, framework: &str, text: &str) -> Option<RuleMatch<'_>> {
        let pack = self.framework_pack(framework)?;
        pack.find_match(text).map(|rule| RuleMatch {
            rule,
            pack: &pack.framework,
        })
    }

    pub fn match_generic(&self, text: &str) -> Option<RuleMatch<'_>> {
        self.generic.find_match(text).map(|rule| RuleMatch {
            rule,
            pack: &self.generic.framework,
        })
    }

    /// Classify the signals of one failure.
    pub fn classify(&self, framework: &str, signals: &[Signal]) -> FailureVerdict {
        if signals.is_empty() {
            return FailureVerdict::unknown("no signals extracted");
        }

        let texts: Vec<String> = signals.iter().map(Signal::match_text).collect();
        let combined = texts.join("\n");

        let matched = self
            .match_framework(framework, &combined)
            .or_else(|| self.match_generic(&combined));
        let Some(RuleMatch { rule, pack }) = matched else {
            return FailureVerdict::unknown(&format!(
                "no rule in the '{}' or generic pack matched {} signal(s)",
                framework,
                signals.len()
            ));
        };

        // Signals extracted from the same message are one observation and
        // count once, at their strongest prior.
        let mut supporting: Vec<&Signal> = Vec::new();
        for (signal, text) in signals.iter().zip(&texts) {
            if !rule.matches_any(text) {
                continue;
            }
            match supporting.iter_mut().find(|kept| kept.message == signal.message) {
                Some(kept) if signal.prior_confidence > kept.prior_confidence => *kept = signal,
                Some(_) => {}
                None => supporting.push(signal),
            }
        }

        let evidence_sources: Vec<&Signal> = if supporting.is_empty() {
            signals.iter().collect()
        } else {
            supporting.clone()
        };
        let evidence = evidence_sources
            .iter()
            .filter(|signal| !signal.message.is_empty())
            .take(MAX_EVIDENCE)
            .map(|signal| truncate_evidence(&signal.message))
            .collect();

        let corroborating_priors = supporting
            .iter()
            .skip(1)
            .map(|signal| signal.prior_confidence)
            .collect();

        log::debug!(
            "Rule '{}' from pack '{}' matched ({} supporting signals)",
            rule.id,
            pack,
            supporting.len()
        );

        FailureVerdict {
            failure_type: rule.failure_type,
            matched_rule_id: Some(rule.id.clone()),
            evidence,
            reason: format!(
                "matched rule '{}' ({}) in pack '{}'",
                rule.id,
                rule.description.as_deref().unwrap_or("no description"),
                pack
            ),
            rule_basis: Some(RuleBasis {
                base_confidence: rule.base_confidence,
                pack: pack.to_string(),
                corroborating_priors,
            }),
        }
    }
}

/// Current rule set, swapped atomically on reload.
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
    version: AtomicU64,
}

impl RuleRegistry {
    pub fn new(mut rules: RuleSet) -> Self {
        rules.version = 1;
        Self {
            current: RwLock::new(Arc::new(rules)),
            version: AtomicU64::new(1),
        }
    }

    /// Registry over `dir`, or the built-in packs when no directory is set.
    pub fn load(dir: Option<&Path>) -> Result<Self, ConfigError> {
        let rules = match dir {
            Some(dir) => RuleSet::load_dir(dir)?,
            None => RuleSet::builtin()?,
        };
        log::info!(
            "Rule set ready: {} rules, frameworks [{}], digest {}",
            rules.rule_count(),
            rules.frameworks().join(", "),
            rules.digest
        );
        Ok(Self::new(rules))
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Install a new rule set and return its version.
    pub fn replace(&self, mut rules: RuleSet) -> u64 {
        let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        rules.version = version;
        *current = Arc::new(rules);
        version
    }

    /// Rebuild from `dir`. On error the current set stays in place.
    pub fn reload(&self, dir: &Path) -> Result<u64, ConfigError> {
        let rules = RuleSet::load_dir(dir)?;
        let digest = rules.digest.clone();
        let version = self.replace(rules);
        log::info!("Reloaded rules from {} (version {}, digest {})", dir.display(), version, digest);
        Ok(version)
    }
}
