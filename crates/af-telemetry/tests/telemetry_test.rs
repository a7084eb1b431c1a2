use af_telemetry::logging::{self, LogFormat};
use af_telemetry::metrics::{global_metrics, names, MetricsCollector};

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[test]
fn logging_init_is_idempotent() {
    logging::init_logging("auto-forge-test", "debug");
    // Whichever test ran first owns the subscriber; later calls are no-ops.
    assert!(!logging::init("auto-forge-test", "info", LogFormat::Json));
    logging::init_logging_json("auto-forge-test", "info");
    tracing::info!(task_id = "t1", "log line after init");
}

#[test]
fn env_filter_falls_back_to_default_directives() {
    let filter = logging::env_filter("af_agents=debug,warn");
    let rendered = filter.to_string();
    assert!(!rendered.is_empty());
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[test]
fn counters_are_tracked_per_label_set() {
    let m = MetricsCollector::new();
    m.increment_counter(names::TASK_OUTCOMES, &[("provider", "claude"), ("outcome", "done")]);
    m.increment_counter(names::TASK_OUTCOMES, &[("outcome", "done"), ("provider", "claude")]);
    m.increment_counter(names::TASK_OUTCOMES, &[("provider", "claude"), ("outcome", "failed")]);

    assert_eq!(
        m.counter(names::TASK_OUTCOMES, &[("provider", "claude"), ("outcome", "done")]),
        2
    );
    assert_eq!(m.counter_total(names::TASK_OUTCOMES), 3);
    assert_eq!(m.counter(names::TASK_OUTCOMES, &[("outcome", "retry")]), 0);
}

#[test]
fn gauges_overwrite() {
    let m = MetricsCollector::new();
    m.set_gauge(names::REVIEW_QUEUE_DEPTH, &[], 7);
    m.set_gauge(names::REVIEW_QUEUE_DEPTH, &[], 2);
    assert_eq!(m.gauge(names::REVIEW_QUEUE_DEPTH, &[]), 2);
}

#[test]
fn score_histogram_uses_registered_buckets() {
    let m = MetricsCollector::with_defaults();
    m.observe(names::VALIDATION_SCORE, &[("strategy", "critic")], 0.42);
    m.observe(names::VALIDATION_SCORE, &[("strategy", "critic")], 0.91);

    let (count, sum) = m
        .histogram_stats(names::VALIDATION_SCORE, &[("strategy", "critic")])
        .unwrap();
    assert_eq!(count, 2);
    assert!((sum - 1.33).abs() < 1e-9);

    let text = m.export_prometheus();
    assert!(text.contains("af_validation_score_bucket{le=\"0.5\",strategy=\"critic\"} 1"));
    assert!(text.contains("af_validation_score_bucket{le=\"+Inf\",strategy=\"critic\"} 2"));
}

#[test]
fn prometheus_export_groups_families() {
    let m = MetricsCollector::new();
    m.increment_counter(names::PLAN_STEPS, &[("kind", "FILE"), ("status", "SUCCESS")]);
    m.increment_counter(names::PLAN_STEPS, &[("kind", "GIT"), ("status", "FAILED")]);

    let text = m.export_prometheus();
    assert_eq!(text.matches("# TYPE af_plan_steps_total counter").count(), 1);
    assert!(text.contains("af_plan_steps_total{kind=\"FILE\",status=\"SUCCESS\"} 1"));
}

#[test]
fn json_export_lists_series() {
    let m = MetricsCollector::new();
    m.increment_counter(names::VALIDATIONS, &[("outcome", "pass"), ("strategy", "default")]);
    let json = m.export_json();
    assert_eq!(
        json["counters"]["af_validations_total{outcome=\"pass\",strategy=\"default\"}"],
        1
    );
}

#[test]
fn global_collector_is_shared() {
    assert!(std::ptr::eq(global_metrics(), global_metrics()));
}
