use crate::decision::CiPolicy;
use crate::error::ConfigError;
use crate::flaky::FlakyConfig;
use crate::history::HistoryConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub rules: RulesConfig,
    pub policy: CiPolicy,
    pub flaky: FlakyConfig,
    pub history: HistorySettings,
    pub batch: BatchConfig,
    pub ai: AiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Directory of rule pack YAML files. Built-in packs when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub lookback_days: u32,
    pub saturation_k: f64,
    pub retention_days: u32,
    pub max_occurrences: usize,
    /// SQLite file. History is kept in memory only when unset.
    pub database_path: Option<String>,
    pub flush_interval_seconds: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        let tracker = HistoryConfig::default();
        Self {
            lookback_days: tracker.lookback_days,
            saturation_k: tracker.saturation_k,
            retention_days: tracker.retention_days,
            max_occurrences: tracker.max_occurrences,
            database_path: None,
            flush_interval_seconds: 5,
        }
    }
}

impl HistorySettings {
    pub fn tracker_config(&self) -> HistoryConfig {
        HistoryConfig {
            lookback_days: self.lookback_days,
            saturation_k: self.saturation_k,
            retention_days: self.retention_days,
            max_occurrences: self.max_occurrences,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Worker limit; twice the available parallelism when unset.
    pub concurrency: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

impl BatchConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub max_adjustment: f64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_adjustment: crate::confidence::MAX_AI_ADJUSTMENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TriageConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {path}"))?;
        let config: TriageConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing configuration {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("writing configuration {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy = &self.policy;
        for (name, value) in [
            ("policy.threshold_low", policy.threshold_low),
            ("policy.threshold_high", policy.threshold_high),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} {value} outside [0, 1]")));
            }
        }
        if policy.threshold_low > policy.threshold_high {
            return Err(ConfigError::Invalid(format!(
                "policy.threshold_low {} exceeds threshold_high {}",
                policy.threshold_low, policy.threshold_high
            )));
        }
        if self.flaky.window_size == 0 {
            return Err(ConfigError::Invalid("flaky.window_size must be at least 1".into()));
        }
        if self.flaky.threshold == 0 {
            return Err(ConfigError::Invalid("flaky.threshold must be at least 1".into()));
        }
        if self.history.saturation_k <= 0.0 || !self.history.saturation_k.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "history.saturation_k must be positive, got {}",
                self.history.saturation_k
            )));
        }
        if self.history.max_occurrences == 0 {
            return Err(ConfigError::Invalid("history.max_occurrences must be at least 1".into()));
        }
        if self.batch.concurrency == Some(0) {
            return Err(ConfigError::Invalid("batch.concurrency must be at least 1".into()));
        }
        if !(0.0..=crate::confidence::MAX_AI_ADJUSTMENT).contains(&self.ai.max_adjustment) {
            return Err(ConfigError::Invalid(format!(
                "ai.max_adjustment {} outside [0, {}]",
                self.ai.max_adjustment,
                crate::confidence::MAX_AI_ADJUSTMENT
            )));
        }
        Ok(())
    }

    pub fn rules_dir(&self) -> Option<&Path> {
        self.rules.dir.as_deref()
    }
}

/// Load `path`, falling back to defaults when it is missing or broken.
pub fn load_config_or_default(path: &str) -> TriageConfig {
    match TriageConfig::from_file(path) {
        Ok(config) => {
            log::info!("Loaded configuration from: {}", path);
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({:#}), using defaults", e);
            TriageConfig::default()
        }
    }
}
