use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use af_core::config::ValidatorConfig;
use af_intelligence::research::Citation;
use af_intelligence::validator::{
    telemetry_channel, Features, ScorerOutput, ScorerPlugin, ScoringPath, Subscores,
    ValidationInput, Validator, ValidatorError, WeightModel,
};
use af_telemetry::metrics::{names, MetricsCollector};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct FixedScorer {
    score: f64,
    confidence: Option<f64>,
}

impl FixedScorer {
    fn new(score: f64) -> Arc<Self> {
        Arc::new(Self {
            score,
            confidence: None,
        })
    }
}

impl ScorerPlugin for FixedScorer {
    fn name(&self) -> &str {
        "fixed"
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn score(&self, _features: &Features, _subscores: &Subscores) -> f64 {
        self.score
    }

    fn confidence(&self, features: &Features, subscores: &Subscores) -> ScorerOutput {
        ScorerOutput {
            confidence: self.confidence,
            ..ScorerOutput::plain(self.score(features, subscores))
        }
    }
}

fn config() -> ValidatorConfig {
    ValidatorConfig {
        thresholds: BTreeMap::from([("critic".to_string(), 0.7)]),
        source_reputation: BTreeMap::from([("docs.rs".to_string(), 0.9)]),
        ..ValidatorConfig::default()
    }
}

fn citation(id: &str, source: &str) -> Citation {
    Citation {
        id: id.into(),
        source: source.into(),
        title: format!("title {id}"),
        snippet: String::new(),
    }
}

fn input(strategy: &str) -> ValidationInput {
    ValidationInput {
        hypothesis: "The tokio async runtime schedules tasks cooperatively".into(),
        citations: Vec::new(),
        goal: "tokio async runtime".into(),
        context_hints: Vec::new(),
        strategy: strategy.into(),
    }
}

fn goal_model(thresholds: &[(&str, f64)]) -> WeightModel {
    WeightModel {
        version: "m-1".into(),
        weights: BTreeMap::from([("goal_alignment".to_string(), 1.0)]),
        thresholds: thresholds
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[test]
fn features_reflect_hints_citations_and_reputation() {
    let validator = Validator::new(config());
    let mut input = input("default");
    input.citations = vec![citation("a", "docs.rs"), citation("b", "forum")];
    input.context_hints = vec!["Tokio".into(), "mio".into(), "  ".into()];

    let features = validator.extract_features(&input);
    assert_eq!(features.citation_count, 2);
    assert!(close(features.hint_hit_rate, 0.5));
    assert!(close(features.goal_overlap, 1.0));
    assert!(close(features.source_reputation, 0.7));

    let subscores = validator.subscores(&features);
    assert!(close(subscores.citations, 2.0 / 3.0));
}

#[test]
fn no_hints_and_no_citations() {
    let validator = Validator::new(config());
    let features = validator.extract_features(&input("default"));
    assert!(close(features.hint_hit_rate, 1.0));
    assert_eq!(features.source_reputation, 0.0);
}

// ---------------------------------------------------------------------------
// Scoring paths
// ---------------------------------------------------------------------------

#[test]
fn model_and_plugin_are_blended() {
    let validator = Validator::new(config())
        .with_model(goal_model(&[]))
        .with_scorer(FixedScorer::new(0.5));

    let result = validator.validate(&input("critic"));
    assert_eq!(result.path, ScoringPath::Blended);
    assert!(close(result.ml_score.unwrap(), 1.0));
    assert!(close(result.plugin_score.unwrap(), 0.5));
    assert!(close(result.score, 0.6 * 1.0 + 0.4 * 0.5));
    assert!(close(result.threshold, 0.7));
    assert!(result.passed);
    assert!(result.feedback.is_none());
}

#[test]
fn unnormalised_blend_weights_keep_score_in_unit_range() {
    let skewed = ValidatorConfig {
        ml_weight: 3.0,
        plugin_weight: 1.0,
        ..config()
    };
    let validator = Validator::new(skewed)
        .with_model(goal_model(&[]))
        .with_scorer(FixedScorer::new(0.5));
    let result = validator.validate(&input("critic"));
    assert!(close(result.score, 0.75 * 1.0 + 0.25 * 0.5));

    let negative = ValidatorConfig {
        ml_weight: 2.0,
        plugin_weight: -1.0,
        ..config()
    };
    let validator = Validator::new(negative)
        .with_model(goal_model(&[]))
        .with_scorer(FixedScorer::new(0.5));
    let result = validator.validate(&input("critic"));
    assert!(close(result.score, 0.6 * 1.0 + 0.4 * 0.5));
    assert!((0.0..=1.0).contains(&result.score));
}

#[test]
fn plugin_alone_uses_plugin_score() {
    let validator = Validator::new(config()).with_scorer(FixedScorer::new(0.4));

    let result = validator.validate(&input("critic"));
    assert_eq!(result.path, ScoringPath::PluginOnly);
    assert!(close(result.score, 0.4));
    assert!(!result.passed);
    assert!(result.ml_score.is_none());

    // Unknown strategies fall back to the constant threshold.
    let other = validator.validate(&input("majority"));
    assert!(close(other.threshold, 0.55));
}

#[test]
fn model_thresholds_take_precedence_over_config() {
    let validator = Validator::new(config()).with_model(goal_model(&[("critic", 0.9)]));

    let result = validator.validate(&input("critic"));
    assert_eq!(result.path, ScoringPath::ModelOnly);
    assert!(close(result.threshold, 0.9));
    assert!(close(result.score, 1.0));
    assert!(result.passed);
}

#[test]
fn fallback_path_uses_fixed_threshold_and_mean_subscore() {
    let validator = Validator::new(config());

    let result = validator.validate(&input("critic"));
    assert_eq!(result.path, ScoringPath::Fallback);
    // citations 0, hints 1, goal 1, reputation 0
    assert!(close(result.score, 0.5));
    assert!(close(result.threshold, 0.55));
    assert!(!result.passed);

    let feedback = result.feedback.unwrap();
    assert!(feedback.contains("citations (0.00)"));
    assert!(feedback.contains("reputation (0.00)"));
    assert!(feedback.contains("align the answer more closely with the goal"));
}

// ---------------------------------------------------------------------------
// Uncertainty and review
// ---------------------------------------------------------------------------

#[test]
fn near_threshold_is_uncertain_without_changing_outcome() {
    let validator = Validator::new(config()).with_scorer(FixedScorer::new(0.72));

    let result = validator.validate(&input("critic"));
    assert!(result.passed);
    assert!(result.uncertain);
    assert_eq!(validator.review_queue().len(), 1);

    let samples = validator.review_queue().drain();
    assert_eq!(samples[0].strategy, "critic");
    assert!(validator.review_queue().is_empty());
}

#[test]
fn low_confidence_is_uncertain() {
    let scorer = Arc::new(FixedScorer {
        score: 0.95,
        confidence: Some(0.3),
    });
    let validator = Validator::new(config()).with_scorer(scorer);
    let result = validator.validate(&input("critic"));
    assert!(result.passed);
    assert!(result.uncertain);
    assert_eq!(result.confidence, Some(0.3));

    let confident = Validator::new(config()).with_scorer(FixedScorer::new(0.95));
    assert!(!confident.validate(&input("critic")).uncertain);
    assert!(confident.review_queue().is_empty());
}

// ---------------------------------------------------------------------------
// Telemetry and metrics
// ---------------------------------------------------------------------------

#[test]
fn telemetry_is_non_blocking() {
    let (tx, rx) = telemetry_channel(1);
    let validator = Validator::new(config())
        .with_scorer(FixedScorer::new(0.9))
        .with_model(goal_model(&[]))
        .with_telemetry(tx);

    validator.validate(&input("critic"));
    // Channel is full; the second record is dropped instead of blocking.
    validator.validate(&input("critic"));

    let record = rx.try_recv().unwrap();
    assert_eq!(record.strategy, "critic");
    assert_eq!(record.plugin.as_deref(), Some("fixed@1.0"));
    assert_eq!(record.model_version.as_deref(), Some("m-1"));
    assert!(rx.try_recv().is_err());

    drop(rx);
    validator.validate(&input("critic"));
}

#[test]
fn outcomes_are_counted() {
    let metrics = Arc::new(MetricsCollector::with_defaults());
    let validator = Validator::new(config())
        .with_scorer(FixedScorer::new(0.72))
        .with_metrics(metrics.clone());

    validator.validate(&input("critic"));
    validator.validate(&input("majority"));

    assert_eq!(
        metrics.counter(names::VALIDATIONS, &[("strategy", "critic"), ("outcome", "pass")]),
        1
    );
    assert_eq!(
        metrics.counter(names::VALIDATIONS, &[("strategy", "majority"), ("outcome", "pass")]),
        1
    );
    assert_eq!(metrics.counter_total(names::VALIDATIONS_UNCERTAIN), 1);
    assert_eq!(metrics.gauge(names::REVIEW_QUEUE_DEPTH, &[]), 1);
    let (count, _) = metrics
        .histogram_stats(names::VALIDATION_SCORE, &[("strategy", "critic")])
        .unwrap();
    assert_eq!(count, 1);
}

// ---------------------------------------------------------------------------
// Model loading and hot swap
// ---------------------------------------------------------------------------

#[test]
fn model_loads_from_configured_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "version": "2024-06", "weights": {{ "goal_alignment": 0.8 }}, "thresholds": {{ "critic": 0.75 }} }}"#
    )
    .unwrap();

    let validator = Validator::from_config(ValidatorConfig {
        model_path: Some(file.path().display().to_string()),
        ..config()
    });
    let result = validator.validate(&input("critic"));
    assert_eq!(result.path, ScoringPath::ModelOnly);
    assert!(close(result.score, 0.8));
    assert!(close(result.threshold, 0.75));
}

#[test]
fn broken_model_is_skipped() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not json").unwrap();

    let validator = Validator::from_config(ValidatorConfig {
        model_path: Some(file.path().display().to_string()),
        ..config()
    });
    assert_eq!(validator.validate(&input("critic")).path, ScoringPath::Fallback);

    assert!(matches!(
        validator.load_model(file.path()),
        Err(ValidatorError::ModelFormat(_))
    ));
    assert!(matches!(
        validator.load_model("/definitely/not/here.json"),
        Err(ValidatorError::ModelIo { .. })
    ));
}

#[test]
fn out_of_range_model_threshold_is_rejected() {
    let err = WeightModel::from_json(r#"{ "version": "x", "weights": {}, "thresholds": { "critic": 1.5 } }"#)
        .unwrap_err();
    assert!(err.to_string().contains("critic"));
}

#[test]
fn scorer_can_be_swapped_at_runtime() {
    let validator = Validator::new(config()).with_scorer(FixedScorer::new(0.2));
    assert!(!validator.validate(&input("critic")).passed);

    let previous = validator.swap_scorer(Some(FixedScorer::new(0.9)));
    assert_eq!(previous.unwrap().name(), "fixed");
    assert!(validator.validate(&input("critic")).passed);

    validator.swap_scorer(None);
    assert_eq!(validator.validate(&input("critic")).path, ScoringPath::Fallback);
}
