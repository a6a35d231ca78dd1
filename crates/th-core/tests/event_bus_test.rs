use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use th_core::event_bus::{EventBus, EventFilter};
use th_core::types::{Event, EventType};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn wildcard_receives_everything_and_typed_only_its_type() {
    let bus = EventBus::new();
    let all = Arc::new(AtomicUsize::new(0));
    let claimed = Arc::new(AtomicUsize::new(0));

    let counter = all.clone();
    bus.subscribe("*".parse::<EventFilter>().unwrap(), move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let counter = claimed.clone();
    bus.subscribe(EventType::TaskClaimed, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    bus.emit(Event::new(EventType::TaskClaimed));
    bus.emit(Event::new(EventType::TaskCreated));
    bus.emit(Event::new(EventType::AgentHeartbeat));
    settle().await;

    assert_eq!(all.load(Ordering::SeqCst), 3);
    assert_eq!(claimed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_handler_does_not_affect_siblings() {
    let bus = EventBus::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    bus.subscribe(EventFilter::All, |_| async {
        panic!("handler blew up");
    });
    let counter = delivered.clone();
    bus.subscribe(EventFilter::All, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    bus.emit(Event::new(EventType::TaskFailed));
    bus.emit(Event::new(EventType::TaskFailed));
    settle().await;

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(bus.history_len(), 2);
}

#[tokio::test]
async fn slow_handler_does_not_block_emit() {
    let bus = EventBus::new();
    bus.subscribe(EventFilter::All, |_| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let started = std::time::Instant::now();
    for _ in 0..100 {
        bus.emit(Event::new(EventType::AgentHeartbeat));
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let id = bus.subscribe(EventType::TaskCreated, move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(bus.handler_count(), 1);

    assert!(!bus.unsubscribe(EventType::TaskClaimed, id));
    assert!(bus.unsubscribe(EventType::TaskCreated, id));
    assert_eq!(bus.handler_count(), 0);

    bus.emit(Event::new(EventType::TaskCreated));
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn history_evicts_oldest_first() {
    let bus = EventBus::with_capacity(3);
    let first = Event::new(EventType::TaskCreated);
    bus.emit(first.clone());
    for _ in 0..3 {
        bus.emit(Event::new(EventType::TaskClaimed));
    }

    let history = bus.get_history(None);
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.id != first.id));
    assert!(bus
        .get_history(Some(EventType::TaskCreated.into()))
        .is_empty());
}

#[test]
fn emit_without_runtime_still_records_history() {
    let bus = EventBus::new();
    bus.subscribe(EventFilter::All, |_| async {});
    bus.emit(Event::new(EventType::GroupCreated));
    assert_eq!(bus.history_len(), 1);
}

#[tokio::test]
async fn channel_subscribers_receive_matching_events() {
    let bus = EventBus::new();
    let failures = bus.subscribe_channel(EventType::TaskFailed);
    let everything = bus.subscribe_channel(EventFilter::All);

    bus.emit(Event::new(EventType::TaskCreated));
    let failed = bus.emit_new(
        EventType::TaskFailed,
        serde_json::json!({ "error": "boom" }),
    );

    let got = failures.recv_async().await.unwrap();
    assert_eq!(got.id, failed.id);
    assert_eq!(got.payload["error"], "boom");
    assert!(failures.try_recv().is_err());
    assert_eq!(everything.len(), 2);
}

#[tokio::test]
async fn dropped_channel_receivers_are_pruned() {
    let bus = EventBus::new();
    let rx = bus.subscribe_channel(EventFilter::All);
    drop(rx);
    bus.emit(Event::new(EventType::TaskCreated));
    let live = bus.subscribe_channel(EventFilter::All);
    bus.emit(Event::new(EventType::TaskCreated));
    assert_eq!(live.len(), 1);
}
