use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{PipelineMode, TaskSelectionStrategy};

/// Top-level configuration loaded from `~/.auto-forge/config.toml`.
///
/// **Security**: this struct never stores API keys or tokens. Preflight only
/// records the *names* of the env vars that must be present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub critique: CritiqueConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
}

impl Config {
    /// Load config from `~/.auto-forge/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runner.validate()?;
        self.pipeline.validate()?;
        self.validator.validate()?;
        if self.critique.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "critique.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".auto-forge")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Locale for user-facing messages (`en`, `es`).
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            locale: default_locale(),
        }
    }
}

fn default_project_name() -> String {
    "auto-forge".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_locale() -> String {
    "en".into()
}

/// Retry policy for persisted task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Total attempts per task, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff wait. `None` means uncapped.
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub self_healing: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: None,
            self_healing: true,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation(
                "runner.max_retries must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "runner.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

/// One `(tagSet, provider)` routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub tags: Vec<String>,
    pub provider: String,
    #[serde(default)]
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Evaluated in order; the first matching rule wins.
    #[serde(default = "default_routing_rules")]
    pub rules: Vec<RoutingRule>,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_tool")]
    pub default_tool: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: default_routing_rules(),
            default_provider: default_provider(),
            default_tool: default_tool(),
        }
    }
}

fn default_routing_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            tags: vec!["frontend".into(), "ui".into()],
            provider: "gemini".into(),
            tool: Some("code".into()),
        },
        RoutingRule {
            tags: vec!["backend".into(), "api".into(), "database".into()],
            provider: "claude".into(),
            tool: Some("code".into()),
        },
        RoutingRule {
            tags: vec!["docs".into(), "research".into()],
            provider: "openai".into(),
            tool: Some("write".into()),
        },
    ]
}
fn default_provider() -> String {
    "claude".into()
}
fn default_tool() -> String {
    "code".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: PipelineMode,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default)]
    pub selection_strategy: TaskSelectionStrategy,
    /// The decomposer is asked for `max_tasks * overgeneration_factor` tasks.
    #[serde(default = "default_overgeneration_factor")]
    pub overgeneration_factor: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            max_tasks: default_max_tasks(),
            selection_strategy: TaskSelectionStrategy::default(),
            overgeneration_factor: default_overgeneration_factor(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tasks == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_tasks must be at least 1".to_string(),
            ));
        }
        if self.overgeneration_factor == 0 {
            return Err(ConfigError::Validation(
                "pipeline.overgeneration_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_tasks() -> usize {
    5
}
fn default_overgeneration_factor() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Threshold used when neither the model nor `thresholds` names the strategy.
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: f64,
    #[serde(default = "default_ml_weight")]
    pub ml_weight: f64,
    #[serde(default = "default_plugin_weight")]
    pub plugin_weight: f64,
    /// Per-strategy pass thresholds (`critic`, `majority`, `default`, ...).
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
    /// Distance from the threshold inside which a sample is uncertain.
    #[serde(default = "default_uncertainty_margin")]
    pub uncertainty_margin: f64,
    /// Scorer confidence below which a sample is uncertain.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Optional JSON weight model loaded at startup.
    #[serde(default)]
    pub model_path: Option<String>,
    /// Citation count at which the citation subscore saturates.
    #[serde(default = "default_citation_saturation")]
    pub citation_saturation: usize,
    #[serde(default)]
    pub source_reputation: BTreeMap<String, f64>,
    #[serde(default = "default_reputation")]
    pub default_reputation: f64,
    #[serde(default = "default_review_queue_capacity")]
    pub review_queue_capacity: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: default_fallback_threshold(),
            ml_weight: default_ml_weight(),
            plugin_weight: default_plugin_weight(),
            thresholds: BTreeMap::new(),
            uncertainty_margin: default_uncertainty_margin(),
            min_confidence: default_min_confidence(),
            model_path: None,
            citation_saturation: default_citation_saturation(),
            source_reputation: BTreeMap::new(),
            default_reputation: default_reputation(),
            review_queue_capacity: default_review_queue_capacity(),
        }
    }
}

impl ValidatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if (self.ml_weight + self.plugin_weight - 1.0).abs() > 1e-9 {
            return Err(ConfigError::Validation(format!(
                "validator.ml_weight + validator.plugin_weight must equal 1.0, got {}",
                self.ml_weight + self.plugin_weight
            )));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.ml_weight) || !in_unit(self.plugin_weight) {
            return Err(ConfigError::Validation(format!(
                "validator blend weights must be within [0, 1], got ml={} plugin={}",
                self.ml_weight, self.plugin_weight
            )));
        }
        if !in_unit(self.fallback_threshold) {
            return Err(ConfigError::Validation(
                "validator.fallback_threshold must be within [0, 1]".to_string(),
            ));
        }
        if let Some((name, value)) = self.thresholds.iter().find(|(_, v)| !in_unit(**v)) {
            return Err(ConfigError::Validation(format!(
                "validator.thresholds.{name} must be within [0, 1], got {value}"
            )));
        }
        if self.citation_saturation == 0 {
            return Err(ConfigError::Validation(
                "validator.citation_saturation must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_fallback_threshold() -> f64 {
    0.55
}
fn default_ml_weight() -> f64 {
    0.6
}
fn default_plugin_weight() -> f64 {
    0.4
}
fn default_uncertainty_margin() -> f64 {
    0.05
}
fn default_min_confidence() -> f64 {
    0.6
}
fn default_citation_saturation() -> usize {
    3
}
fn default_reputation() -> f64 {
    0.5
}
fn default_review_queue_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueConfig {
    /// Maximum HYPOTHESIS validations before the loop reports exhaustion.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for CritiqueConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightConfig {
    /// Env var names that must be set and non-empty before a run.
    #[serde(default = "default_required_env")]
    pub required_env: Vec<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            required_env: default_required_env(),
        }
    }
}

fn default_required_env() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".into()]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
