use th_telemetry::logging::{self, LogFormat};
use th_telemetry::metrics::{MetricsCollector, EVENTS_TOTAL, INSTANCES, TASK_DURATION_SECONDS};

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[test]
fn init_logging_is_idempotent() {
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");
    logging::init_logging_json("test-service-json", "info");
    tracing::info!(key = "value", "log line after repeated init");
}

#[test]
fn log_format_parsing() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
}

// ---------------------------------------------------------------------------
// Counters and gauges
// ---------------------------------------------------------------------------

#[test]
fn counters_are_per_label_set() {
    let m = MetricsCollector::new();
    m.increment_counter(EVENTS_TOTAL, &[("type", "task.created")]);
    m.increment_counter(EVENTS_TOTAL, &[("type", "task.created")]);
    m.increment_counter(EVENTS_TOTAL, &[("type", "task.failed")]);
    m.increment_counter_by(EVENTS_TOTAL, &[("type", "task.failed")], 0);

    assert_eq!(m.get_counter(EVENTS_TOTAL, &[("type", "task.created")]), 2);
    assert_eq!(m.get_counter(EVENTS_TOTAL, &[("type", "task.failed")]), 1);
    assert_eq!(m.get_counter(EVENTS_TOTAL, &[("type", "task.rejected")]), 0);
}

#[test]
fn gauges_overwrite() {
    let m = MetricsCollector::new();
    assert_eq!(m.get_gauge(INSTANCES, &[("role", "coder")]), 0);
    m.set_gauge(INSTANCES, &[("role", "coder")], 3);
    m.set_gauge(INSTANCES, &[("role", "coder")], 1);
    m.set_gauge(INSTANCES, &[("role", "reviewer")], 2);
    assert_eq!(m.get_gauge(INSTANCES, &[("role", "coder")]), 1);
    assert_eq!(m.get_gauge(INSTANCES, &[("role", "reviewer")]), 2);
}

#[test]
fn concurrent_increments_are_not_lost() {
    let m = std::sync::Arc::new(MetricsCollector::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let m = m.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.increment_counter(EVENTS_TOTAL, &[("type", "agent.heartbeat")]);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(m.get_counter(EVENTS_TOTAL, &[("type", "agent.heartbeat")]), 8000);
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[test]
fn prometheus_export_contains_every_family() {
    let m = MetricsCollector::new();
    m.increment_counter(EVENTS_TOTAL, &[("type", "task.completed")]);
    m.set_gauge(INSTANCES, &[("role", "coder")], 2);
    m.record_histogram(TASK_DURATION_SECONDS, &[("outcome", "completed")], 42.0);

    let out = m.export_prometheus();
    assert!(out.contains("# TYPE taskhive_events_total counter"));
    assert!(out.contains("taskhive_events_total{type=\"task.completed\"} 1"));
    assert!(out.contains("# TYPE taskhive_instances gauge"));
    assert!(out.contains("taskhive_instances{role=\"coder\"} 2"));
    assert!(out.contains("# TYPE taskhive_task_duration_seconds histogram"));
    assert!(out.contains("taskhive_task_duration_seconds_bucket{le=\"60\",outcome=\"completed\"} 1"));
    assert!(out.contains("taskhive_task_duration_seconds_bucket{le=\"30\",outcome=\"completed\"} 0"));
    assert!(out.contains("taskhive_task_duration_seconds_count{outcome=\"completed\"} 1"));
    assert_eq!(out.matches("# TYPE taskhive_events_total").count(), 1);
}

#[test]
fn json_export_is_keyed_by_series() {
    let m = MetricsCollector::new();
    m.increment_counter(EVENTS_TOTAL, &[("type", "group.created")]);
    m.set_gauge(INSTANCES, &[], 4);
    m.record_histogram(TASK_DURATION_SECONDS, &[], 3.0);

    let json = m.export_json();
    assert_eq!(json["counters"]["taskhive_events_total{type=\"group.created\"}"], 1);
    assert_eq!(json["gauges"]["taskhive_instances"], 4);
    assert_eq!(json["histograms"]["taskhive_task_duration_seconds"]["count"], 1);
    assert_eq!(m.histogram_summary(TASK_DURATION_SECONDS, &[]), (1, 3.0));
}
