//! Confidence-aware scoring of generated hypotheses.
//!
//! Scoring path, in order of preference:
//!
//! 1. weight model and scorer plugin: `ml_weight * ml + plugin_weight * plugin`
//! 2. scorer plugin only: the plugin score
//! 3. weight model only: the model score
//! 4. neither: mean of the subscores against the fixed fallback threshold
//!
//! Every decision is reported on a non-blocking telemetry channel. Samples
//! near the threshold (or scored with low confidence) are queued for review
//! without changing the pass/fail outcome.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use af_core::config::ValidatorConfig;
use af_telemetry::metrics::{names, MetricsCollector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::research::{term_overlap, Citation};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("cannot read weight model {path}: {source}")]
    ModelIo {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid weight model: {0}")]
    ModelFormat(String),
}

pub type Result<T> = std::result::Result<T, ValidatorError>;

// ---------------------------------------------------------------------------
// Inputs and features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationInput {
    pub hypothesis: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub goal: String,
    #[serde(default)]
    pub context_hints: Vec<String>,
    /// Threshold table key, e.g. `critic`, `majority`, `default`.
    pub strategy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub citation_count: usize,
    /// Fraction of context hints echoed in the hypothesis. 1.0 when there
    /// are no hints.
    pub hint_hit_rate: f64,
    /// Fraction of goal terms present in the hypothesis.
    pub goal_overlap: f64,
    /// Mean reputation of cited sources, 0.0 without citations.
    pub source_reputation: f64,
}

/// Normalised signals in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Subscores {
    pub citations: f64,
    pub hints: f64,
    pub goal_alignment: f64,
    pub reputation: f64,
}

impl Subscores {
    pub fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("citations", self.citations),
            ("hints", self.hints),
            ("goal_alignment", self.goal_alignment),
            ("reputation", self.reputation),
        ]
    }

    pub fn mean(&self) -> f64 {
        self.named().iter().map(|(_, v)| v).sum::<f64>() / 4.0
    }
}

// ---------------------------------------------------------------------------
// Scorer plugins
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScorerOutput {
    pub score: f64,
    pub confidence: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl ScorerOutput {
    pub fn plain(score: f64) -> Self {
        Self {
            score,
            confidence: None,
            lower: None,
            upper: None,
        }
    }
}

/// A hot-swappable scoring function over extracted features.
///
/// Plugins that can estimate their own confidence override
/// [`ScorerPlugin::confidence`]; others only provide a plain score.
pub trait ScorerPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0"
    }

    fn score(&self, features: &Features, subscores: &Subscores) -> f64;

    fn confidence(&self, features: &Features, subscores: &Subscores) -> ScorerOutput {
        ScorerOutput::plain(self.score(features, subscores))
    }
}

// ---------------------------------------------------------------------------
// Weight model
// ---------------------------------------------------------------------------

/// Learned subscore weights and per-strategy thresholds, stored as JSON:
///
/// ```json
/// { "version": "2024-06-01",
///   "weights": { "citations": 0.3, "goal_alignment": 0.4, "hints": 0.1, "reputation": 0.2 },
///   "thresholds": { "critic": 0.7 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightModel {
    pub version: String,
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, f64>,
}

impl WeightModel {
    pub fn from_json(text: &str) -> Result<Self> {
        let model: WeightModel =
            serde_json::from_str(text).map_err(|e| ValidatorError::ModelFormat(e.to_string()))?;
        if model.weights.values().any(|w| !w.is_finite()) {
            return Err(ValidatorError::ModelFormat("non-finite weight".into()));
        }
        if let Some((name, t)) = model
            .thresholds
            .iter()
            .find(|(_, t)| !(0.0..=1.0).contains(*t))
        {
            return Err(ValidatorError::ModelFormat(format!(
                "threshold {name} = {t} outside [0, 1]"
            )));
        }
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ValidatorError::ModelIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Dot product of subscores with the model weights, clamped to [0, 1].
    /// Subscores without a weight contribute nothing.
    pub fn score(&self, subscores: &Subscores) -> f64 {
        subscores
            .named()
            .iter()
            .map(|(name, value)| self.weights.get(*name).copied().unwrap_or(0.0) * value)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Results, telemetry, review queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPath {
    Blended,
    PluginOnly,
    ModelOnly,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub uncertain: bool,
    pub confidence: Option<f64>,
    pub path: ScoringPath,
    pub ml_score: Option<f64>,
    pub plugin_score: Option<f64>,
    pub subscores: Subscores,
    pub strategy: String,
    /// Set when `passed` is false.
    pub feedback: Option<String>,
}

/// One telemetry event per validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub at: DateTime<Utc>,
    pub strategy: String,
    pub score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub uncertain: bool,
    pub path: ScoringPath,
    pub subscores: Subscores,
    pub model_version: Option<String>,
    /// `name@version` of the scorer plugin.
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSample {
    pub id: uuid::Uuid,
    pub at: DateTime<Utc>,
    pub goal: String,
    pub hypothesis: String,
    pub strategy: String,
    pub score: f64,
    pub threshold: f64,
    pub confidence: Option<f64>,
}

/// Bounded FIFO of uncertain samples awaiting review. When full, the oldest
/// sample is dropped.
#[derive(Debug)]
pub struct ReviewQueue {
    capacity: usize,
    samples: Mutex<VecDeque<ReviewSample>>,
}

impl ReviewQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the evicted sample, if any.
    pub fn push(&self, sample: ReviewSample) -> Option<ReviewSample> {
        let mut samples = self.samples.lock().unwrap_or_else(|e| {
            warn!("review queue lock poisoned, recovering");
            e.into_inner()
        });
        let evicted = if samples.len() >= self.capacity {
            samples.pop_front()
        } else {
            None
        };
        samples.push_back(sample);
        evicted
    }

    pub fn drain(&self) -> Vec<ReviewSample> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded telemetry channel for [`Validator::with_telemetry`].
pub fn telemetry_channel(
    capacity: usize,
) -> (flume::Sender<ValidationRecord>, flume::Receiver<ValidationRecord>) {
    flume::bounded(capacity)
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct Validator {
    config: ValidatorConfig,
    scorer: RwLock<Option<Arc<dyn ScorerPlugin>>>,
    model: RwLock<Option<Arc<WeightModel>>>,
    telemetry: Option<flume::Sender<ValidationRecord>>,
    review: ReviewQueue,
    metrics: Arc<MetricsCollector>,
}

impl Validator {
    /// A validator with no scorer and no model (fallback path).
    ///
    /// Blend weights are rescaled to sum to 1 so the blended score stays in
    /// [0, 1]; negative, non-finite or all-zero weights are replaced by the
    /// defaults.
    pub fn new(mut config: ValidatorConfig) -> Self {
        let (ml_weight, plugin_weight) = blend_weights(config.ml_weight, config.plugin_weight);
        config.ml_weight = ml_weight;
        config.plugin_weight = plugin_weight;
        let review = ReviewQueue::new(config.review_queue_capacity);
        Self {
            config,
            scorer: RwLock::new(None),
            model: RwLock::new(None),
            telemetry: None,
            review,
            metrics: Arc::new(MetricsCollector::with_defaults()),
        }
    }

    /// Like [`Validator::new`], also loading `model_path` when configured. A
    /// model that fails to load is logged and skipped.
    pub fn from_config(config: ValidatorConfig) -> Self {
        let model_path = config.model_path.clone();
        let validator = Self::new(config);
        if let Some(path) = model_path {
            if let Err(e) = validator.load_model(&path) {
                warn!(path = %path, error = %e, "weight model not loaded, scoring without it");
            }
        }
        validator
    }

    pub fn with_scorer(self, scorer: Arc<dyn ScorerPlugin>) -> Self {
        self.swap_scorer(Some(scorer));
        self
    }

    pub fn with_model(self, model: WeightModel) -> Self {
        self.set_model(Some(model));
        self
    }

    pub fn with_telemetry(mut self, sender: flume::Sender<ValidationRecord>) -> Self {
        self.telemetry = Some(sender);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the scorer plugin at runtime, returning the previous one.
    pub fn swap_scorer(
        &self,
        scorer: Option<Arc<dyn ScorerPlugin>>,
    ) -> Option<Arc<dyn ScorerPlugin>> {
        let mut slot = self.scorer.write().unwrap_or_else(|e| e.into_inner());
        if let Some(next) = &scorer {
            info!(plugin = next.name(), version = next.version(), "scorer plugin installed");
        }
        std::mem::replace(&mut *slot, scorer)
    }

    pub fn set_model(&self, model: Option<WeightModel>) {
        if let Some(m) = &model {
            info!(version = %m.version, "weight model installed");
        }
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = model.map(Arc::new);
    }

    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let model = WeightModel::load(path)?;
        self.set_model(Some(model));
        Ok(())
    }

    pub fn review_queue(&self) -> &ReviewQueue {
        &self.review
    }

    // -- features ------------------------------------------------------------

    pub fn extract_features(&self, input: &ValidationInput) -> Features {
        let text = input.hypothesis.to_lowercase();
        let hints: Vec<&String> = input
            .context_hints
            .iter()
            .filter(|h| !h.trim().is_empty())
            .collect();
        let hint_hit_rate = if hints.is_empty() {
            1.0
        } else {
            let hits = hints
                .iter()
                .filter(|h| text.contains(&h.trim().to_lowercase()))
                .count();
            hits as f64 / hints.len() as f64
        };

        let source_reputation = if input.citations.is_empty() {
            0.0
        } else {
            input
                .citations
                .iter()
                .map(|c| {
                    self.config
                        .source_reputation
                        .get(&c.source)
                        .copied()
                        .unwrap_or(self.config.default_reputation)
                })
                .sum::<f64>()
                / input.citations.len() as f64
        };

        Features {
            citation_count: input.citations.len(),
            hint_hit_rate,
            goal_overlap: term_overlap(&input.goal, &input.hypothesis),
            source_reputation,
        }
    }

    pub fn subscores(&self, features: &Features) -> Subscores {
        let saturation = self.config.citation_saturation.max(1) as f64;
        Subscores {
            citations: (features.citation_count as f64 / saturation).min(1.0),
            hints: features.hint_hit_rate.clamp(0.0, 1.0),
            goal_alignment: features.goal_overlap.clamp(0.0, 1.0),
            reputation: features.source_reputation.clamp(0.0, 1.0),
        }
    }

    /// Model threshold, then configured threshold, then the fallback constant.
    pub fn threshold_for(&self, strategy: &str) -> f64 {
        let model = self.model.read().unwrap_or_else(|e| e.into_inner()).clone();
        model
            .and_then(|m| m.thresholds.get(strategy).copied())
            .or_else(|| self.config.thresholds.get(strategy).copied())
            .unwrap_or(self.config.fallback_threshold)
    }

    // -- validation ----------------------------------------------------------

    pub fn validate(&self, input: &ValidationInput) -> ValidationResult {
        let features = self.extract_features(input);
        let subscores = self.subscores(&features);

        let scorer = self.scorer.read().unwrap_or_else(|e| e.into_inner()).clone();
        let model = self.model.read().unwrap_or_else(|e| e.into_inner()).clone();

        let plugin_output = scorer.as_ref().map(|s| {
            let mut out = s.confidence(&features, &subscores);
            out.score = out.score.clamp(0.0, 1.0);
            out
        });
        let ml_score = model.as_ref().map(|m| m.score(&subscores));

        let (path, score, threshold) = match (ml_score, plugin_output) {
            (Some(ml), Some(plugin)) => (
                ScoringPath::Blended,
                self.config.ml_weight * ml + self.config.plugin_weight * plugin.score,
                self.threshold_for(&input.strategy),
            ),
            (None, Some(plugin)) => (
                ScoringPath::PluginOnly,
                plugin.score,
                self.threshold_for(&input.strategy),
            ),
            (Some(ml), None) => (ScoringPath::ModelOnly, ml, self.threshold_for(&input.strategy)),
            (None, None) => (
                ScoringPath::Fallback,
                subscores.mean(),
                self.config.fallback_threshold,
            ),
        };

        let passed = score >= threshold;
        let confidence = plugin_output.and_then(|p| p.confidence);
        let uncertain = (score - threshold).abs() <= self.config.uncertainty_margin
            || confidence.is_some_and(|c| c < self.config.min_confidence);
        let feedback = (!passed).then(|| feedback_for(&subscores, score, threshold, &input.strategy));

        let result = ValidationResult {
            score,
            threshold,
            passed,
            uncertain,
            confidence,
            path,
            ml_score,
            plugin_score: plugin_output.map(|p| p.score),
            subscores,
            strategy: input.strategy.clone(),
            feedback,
        };

        debug!(
            strategy = %input.strategy,
            score,
            threshold,
            passed,
            uncertain,
            path = ?path,
            "hypothesis validated"
        );
        self.record(input, &result, model.as_deref(), scorer.as_deref());
        result
    }

    fn record(
        &self,
        input: &ValidationInput,
        result: &ValidationResult,
        model: Option<&WeightModel>,
        scorer: Option<&dyn ScorerPlugin>,
    ) {
        let outcome = if result.passed { "pass" } else { "fail" };
        let strategy = result.strategy.as_str();
        self.metrics
            .increment_counter(names::VALIDATIONS, &[("strategy", strategy), ("outcome", outcome)]);
        self.metrics
            .observe(names::VALIDATION_SCORE, &[("strategy", strategy)], result.score);

        if result.uncertain {
            let sample = ReviewSample {
                id: uuid::Uuid::new_v4(),
                at: Utc::now(),
                goal: input.goal.clone(),
                hypothesis: input.hypothesis.clone(),
                strategy: result.strategy.clone(),
                score: result.score,
                threshold: result.threshold,
                confidence: result.confidence,
            };
            if let Some(evicted) = self.review.push(sample) {
                debug!(sample = %evicted.id, "review queue full, oldest sample dropped");
            }
            self.metrics
                .increment_counter(names::VALIDATIONS_UNCERTAIN, &[("strategy", strategy)]);
            let depth = i64::try_from(self.review.len()).unwrap_or(i64::MAX);
            self.metrics.set_gauge(names::REVIEW_QUEUE_DEPTH, &[], depth);
        }

        let Some(sender) = &self.telemetry else {
            return;
        };
        let record = ValidationRecord {
            at: Utc::now(),
            strategy: result.strategy.clone(),
            score: result.score,
            threshold: result.threshold,
            passed: result.passed,
            uncertain: result.uncertain,
            path: result.path,
            subscores: result.subscores,
            model_version: model.map(|m| m.version.clone()),
            plugin: scorer.map(|s| format!("{}@{}", s.name(), s.version())),
        };
        if let Err(e) = sender.try_send(record) {
            debug!(error = %e, "validation record dropped");
        }
    }
}

fn blend_weights(ml: f64, plugin: f64) -> (f64, f64) {
    let usable = |w: f64| w.is_finite() && w >= 0.0;
    if !usable(ml) || !usable(plugin) || ml + plugin <= 0.0 {
        let defaults = ValidatorConfig::default();
        warn!(ml, plugin, "unusable blend weights, using defaults");
        return (defaults.ml_weight, defaults.plugin_weight);
    }
    let total = ml + plugin;
    if (total - 1.0).abs() > 1e-9 {
        debug!(ml, plugin, "rescaling blend weights");
    }
    (ml / total, plugin / total)
}

/// Names the weakest subscores (every one below 0.5, or the single lowest)
/// and ends with a generic instruction.
fn feedback_for(subscores: &Subscores, score: f64, threshold: f64, strategy: &str) -> String {
    let mut ranked = subscores.named().to_vec();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    let weak: Vec<&(&str, f64)> = ranked.iter().filter(|(_, v)| *v < 0.5).collect();
    let named: Vec<String> = if weak.is_empty() {
        ranked
            .first()
            .map(|(n, v)| format!("{n} ({v:.2})"))
            .into_iter()
            .collect()
    } else {
        weak.iter().map(|(n, v)| format!("{n} ({v:.2})")).collect()
    };

    format!(
        "Score {score:.2} is below the {strategy} threshold {threshold:.2}. \
         Weakest signals: {}. \
         Strengthen the citations with reputable sources and align the answer more closely with the goal.",
        named.join(", ")
    )
}
