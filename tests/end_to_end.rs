//! Integration tests driving the real [`ChangeTailer`]/decoder/poller stack
//! against the in-memory fake pool in `tests/support`, covering the
//! end-to-end scenarios and the slot-lifecycle/filter/identity properties.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pg_reactive_stream::{ChangeEvent, ChangeObserver, ChangeTailer, StreamConfig};
use serde_json::json;
use support::{FakePool, delete_change, insert_change, update_change};

struct Recorder {
    events: Mutex<Vec<ChangeEvent>>,
    errors: Mutex<Vec<Arc<pg_reactive_stream::ReplicationError>>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), errors: Mutex::new(Vec::new()) })
    }

    fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ChangeObserver for Recorder {
    fn on_next(&self, event: &ChangeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_error(&self, err: &Arc<pg_reactive_stream::ReplicationError>) {
        self.errors.lock().unwrap().push(err.clone());
    }
}

/// Poll interval is short in these tests; give the poller a few ticks to
/// pick up queued changes before asserting on delivered events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

#[tokio::test]
async fn scenario_1_insert_is_delivered() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.push_change(insert_change(
        "public",
        "widgets",
        &[("id", json!(1)), ("kind", json!("baseball"))],
    ));
    settle().await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        ChangeEvent::Insert { table, row } => {
            assert_eq!(table, "widgets");
            assert_eq!(row.get("kind"), Some(&json!("baseball")));
        }
        other => panic!("expected insert, got {other:?}"),
    }

    tailer.teardown().await;
}

#[tokio::test]
async fn scenario_2_events_outside_the_filter_are_dropped() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.push_change(insert_change("public", "widgets", &[("id", json!(1))]));
    pool.push_change(insert_change("public", "other_table_on_public", &[("id", json!(2))]));
    settle().await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].table(), "widgets");

    tailer.teardown().await;
}

#[tokio::test]
async fn scenario_3_update_carries_the_full_new_row() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.push_change(update_change(
        "public",
        "widgets",
        &[("id", json!(1)), ("kind", json!("soccer"))],
    ));
    settle().await;

    match &recorder.events()[0] {
        ChangeEvent::Update { row, .. } => {
            assert_eq!(row.get("id"), Some(&json!(1)));
            assert_eq!(row.get("kind"), Some(&json!("soccer")));
        }
        other => panic!("expected update, got {other:?}"),
    }

    tailer.teardown().await;
}

#[tokio::test]
async fn scenario_4_delete_carries_only_the_default_identity() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.push_change(delete_change(
        "public",
        "widgets",
        &[("id", json!(1)), ("kind", json!("soccer"))],
    ));
    settle().await;

    match &recorder.events()[0] {
        ChangeEvent::Delete { identity, .. } => {
            assert_eq!(identity.len(), 1);
            assert_eq!(identity.get("id"), Some(&json!(1)));
        }
        other => panic!("expected delete, got {other:?}"),
    }

    tailer.teardown().await;
}

#[tokio::test]
async fn scenario_5_delete_honors_a_declared_multi_column_identity() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()])
        .identity("widgets", vec!["id".into(), "kind".into()])
        .poll_interval_ms(5)
        .build()
        .unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.push_change(delete_change(
        "public",
        "widgets",
        &[("id", json!(1)), ("kind", json!("soccer"))],
    ));
    settle().await;

    match &recorder.events()[0] {
        ChangeEvent::Delete { identity, .. } => {
            assert_eq!(identity.len(), 2);
            assert_eq!(identity.get("kind"), Some(&json!("soccer")));
        }
        other => panic!("expected delete, got {other:?}"),
    }

    tailer.teardown().await;
}

#[tokio::test]
async fn p1_teardown_drops_the_slot_from_the_catalog() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).slot_id("p1").build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();

    assert_eq!(pool.slot_names(), vec!["app_slot_p1".to_string()]);

    tailer.teardown().await;

    assert!(pool.slot_names().is_empty());
}

#[tokio::test]
async fn fatal_when_the_decoder_plugin_is_missing() {
    let pool = FakePool::new().decoder_missing();
    let config = StreamConfig::builder(vec!["widgets".into()]).build().unwrap();

    let err = ChangeTailer::start(&pool, config).await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("58P01"));
}

#[tokio::test]
async fn recovers_once_from_a_missing_slot_during_polling() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let recorder = Recorder::new();
    tailer.stream().subscribe(recorder.clone());

    pool.inject_slot_missing();
    pool.push_change(insert_change("public", "widgets", &[("id", json!(1))]));
    settle().await;

    assert!(recorder.errors.lock().unwrap().is_empty());
    assert_eq!(recorder.events().len(), 1);

    tailer.teardown().await;
}

#[tokio::test]
async fn unsubscribing_stops_delivery_without_affecting_other_subscribers() {
    let pool = FakePool::new();
    let config = StreamConfig::builder(vec!["widgets".into()]).poll_interval_ms(5).build().unwrap();
    let tailer = ChangeTailer::start(&pool, config).await.unwrap();
    let a = Recorder::new();
    let b = Recorder::new();
    let id_a = tailer.stream().subscribe(a.clone());
    tailer.stream().subscribe(b.clone());

    tailer.stream().unsubscribe(id_a);

    pool.push_change(insert_change("public", "widgets", &[("id", json!(1))]));
    settle().await;

    assert!(a.events().is_empty());
    assert_eq!(b.events().len(), 1);

    tailer.teardown().await;
}
