use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use th_core::event_bus::{EventBus, EventFilter, SubscriptionId};
use th_core::types::{Event, EventType};
use th_telemetry::metrics::{MetricsCollector, EVENTS_TOTAL, TASK_DURATION_SECONDS};

/// Where a task's duration measurement stands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Mark {
    Claimed(DateTime<Utc>),
    /// The terminal event was handled before its claim.
    Settled {
        outcome: &'static str,
        at: DateTime<Utc>,
    },
}

/// Feed every bus event into `metrics`.
///
/// Counts `taskhive_events_total{type}` and records claim-to-terminal
/// durations in `taskhive_task_duration_seconds{outcome}`. Handlers run
/// detached, so a claim and its terminal event may arrive in either order.
pub fn attach(bus: &EventBus, metrics: Arc<MetricsCollector>) -> SubscriptionId {
    let marks: Arc<DashMap<String, Mark>> = Arc::new(DashMap::new());
    bus.subscribe(EventFilter::All, move |event| {
        let metrics = metrics.clone();
        let marks = marks.clone();
        async move { record(&metrics, &marks, &event) }
    })
}

fn record(metrics: &MetricsCollector, marks: &DashMap<String, Mark>, event: &Event) {
    metrics.increment_counter(EVENTS_TOTAL, &[("type", event.event_type.as_str())]);

    let Some(task_id) = &event.task_id else {
        return;
    };
    let observe = |outcome: &str, from: DateTime<Utc>, to: DateTime<Utc>| {
        let secs = (to - from).num_milliseconds().max(0) as f64 / 1000.0;
        metrics.record_histogram(TASK_DURATION_SECONDS, &[("outcome", outcome)], secs);
    };

    match event.event_type {
        EventType::TaskClaimed => match marks.entry(task_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                match current {
                    Mark::Settled { outcome, at } if at >= event.timestamp => {
                        observe(outcome, event.timestamp, at);
                        entry.remove();
                    }
                    Mark::Claimed(prev) if prev > event.timestamp => {}
                    _ => {
                        entry.insert(Mark::Claimed(event.timestamp));
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Mark::Claimed(event.timestamp));
            }
        },
        EventType::TaskCompleted | EventType::TaskFailed | EventType::TaskRejected => {
            let outcome = match event.event_type {
                EventType::TaskCompleted => "completed",
                EventType::TaskFailed => "failed",
                _ => "rejected",
            };
            match marks.remove(task_id) {
                Some((_, Mark::Claimed(claimed_at))) => observe(outcome, claimed_at, event.timestamp),
                // Never-claimed tasks (cascaded failures) carry no agent.
                _ if event.agent_id.is_some() => {
                    marks.insert(
                        task_id.clone(),
                        Mark::Settled {
                            outcome,
                            at: event.timestamp,
                        },
                    );
                }
                _ => {}
            }
        }
        EventType::TaskRecovered => {
            marks.remove(task_id);
        }
        _ => {}
    }
}
