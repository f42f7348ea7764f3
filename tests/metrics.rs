//! Integration tests for the Prometheus metrics emitted by the store.
//!
//! Each test installs (or reuses) the process-global recorder, drives the store through
//! its public API and inspects the rendered exposition text. Counters are shared by
//! every test in this binary, so assertions compare values before and after an operation.
//!
//! All tests use `#[serial]` because the metrics recorder is process-global.

use std::sync::Arc;

use eventkeep::metrics::{self, MetricsHandle};
use eventkeep::{
    EventData, EventDescriptor, EventId, EventStore, ExpectedVersion, ReadOptions,
    RecordedEvent, StreamId, StreamTarget, StreamVersion, SubscriberError,
    SubscriptionOptions, SystemClock,
};
use serial_test::serial;

/// Install the recorder, tolerating `AlreadyInstalled`, and return its handle.
fn handle() -> MetricsHandle {
    let _ = metrics::install_recorder();
    metrics::get_installed_handle()
        .expect("metrics recorder should be installed after install_recorder() call")
}

/// Extract the numeric value for a metric line from Prometheus-format text.
///
/// Searches for a line starting with `prefix` (e.g.,
/// `eventkeep_reads_total{target="global"} `) and returns its parsed `f64`
/// value. Returns `0.0` if the series has not been emitted yet.
fn metric_value(rendered: &str, prefix: &str) -> f64 {
    rendered
        .lines()
        .find_map(|line| {
            line.strip_prefix(prefix)
                .and_then(|rest| rest.trim().parse::<f64>().ok())
        })
        .unwrap_or(0.0)
}

fn proposed(event_type: &str) -> EventDescriptor {
    EventDescriptor::new(EventId::generate(), event_type, EventData::new())
}

fn new_store() -> EventStore {
    EventStore::new(Arc::new(SystemClock))
}

#[test]
#[serial]
fn append_counters_track_calls_and_events() {
    let handle = handle();
    let before = handle.render();

    let store = new_store();
    let stream = StreamId::from("metrics-append");
    store
        .append(
            &stream,
            ExpectedVersion::NoStream,
            vec![proposed("A"), proposed("B"), proposed("C")],
        )
        .expect("append should succeed");
    store
        .append(&stream, ExpectedVersion::exact(2), vec![proposed("D")])
        .expect("append should succeed");

    let after = handle.render();
    assert_eq!(
        metric_value(&after, "eventkeep_appends_total ")
            - metric_value(&before, "eventkeep_appends_total "),
        2.0
    );
    assert_eq!(
        metric_value(&after, "eventkeep_events_appended_total ")
            - metric_value(&before, "eventkeep_events_appended_total "),
        4.0
    );
}

#[test]
#[serial]
fn rejected_appends_are_counted_by_reason() {
    let handle = handle();
    let conflict = "eventkeep_append_rejections_total{reason=\"concurrency_conflict\"} ";
    let duplicate = "eventkeep_append_rejections_total{reason=\"duplicate_event_id\"} ";
    let virtual_stream = "eventkeep_append_rejections_total{reason=\"virtual_stream\"} ";
    let invalid = "eventkeep_append_rejections_total{reason=\"invalid_argument\"} ";
    let before = handle.render();

    let store = new_store();
    let stream = StreamId::from("metrics-reject");
    store
        .append(
            &stream,
            ExpectedVersion::NoStream,
            vec![EventDescriptor::new("fixed-id", "A", EventData::new())],
        )
        .expect("first append");

    let _ = store
        .append(&stream, ExpectedVersion::NoStream, vec![proposed("A")])
        .expect_err("stream already exists");
    let _ = store
        .append(
            &stream,
            ExpectedVersion::Any,
            vec![EventDescriptor::new("fixed-id", "A", EventData::new())],
        )
        .expect_err("duplicate id");
    let _ = store
        .append(&store.global_stream_id(), ExpectedVersion::Any, vec![proposed("A")])
        .expect_err("global stream is read-only");
    let _ = store
        .append(&stream, ExpectedVersion::Any, vec![proposed("")])
        .expect_err("empty event type");

    let after = handle.render();
    for prefix in [conflict, duplicate, virtual_stream, invalid] {
        assert_eq!(
            metric_value(&after, prefix) - metric_value(&before, prefix),
            1.0,
            "series: {prefix}"
        );
    }
}

#[test]
#[serial]
fn reads_are_counted_by_target() {
    let handle = handle();
    let named = "eventkeep_reads_total{target=\"stream\"} ";
    let global = "eventkeep_reads_total{target=\"global\"} ";
    let before = handle.render();

    let store = new_store();
    let stream = StreamId::from("metrics-read");
    store
        .append(&stream, ExpectedVersion::Any, vec![proposed("A")])
        .expect("append");

    store
        .read(&StreamTarget::from(&stream), ReadOptions::read())
        .expect("named read");
    let _ = store
        .read(&StreamTarget::named("metrics-missing"), ReadOptions::read())
        .expect_err("missing stream");
    store
        .read(&StreamTarget::Global, ReadOptions::read())
        .expect("global read");

    let after = handle.render();
    assert_eq!(metric_value(&after, named) - metric_value(&before, named), 2.0);
    assert_eq!(metric_value(&after, global) - metric_value(&before, global), 1.0);
}

#[test]
#[serial]
fn truncation_counts_removed_events() {
    let handle = handle();
    let prefix = "eventkeep_truncated_events_total ";
    let before = handle.render();

    let store = new_store();
    let stream = StreamId::from("metrics-truncate");
    store
        .append(
            &stream,
            ExpectedVersion::NoStream,
            (0..5).map(|_| proposed("A")).collect(),
        )
        .expect("append");
    let removed = store
        .truncate(&stream, StreamVersion::new(3))
        .expect("truncate");
    assert_eq!(removed, 3);

    let after = handle.render();
    assert_eq!(metric_value(&after, prefix) - metric_value(&before, prefix), 3.0);
}

#[test]
#[serial]
fn subscription_gauge_and_delivery_failures() {
    let handle = handle();
    let gauge = "eventkeep_subscriptions_active ";
    let failures = "eventkeep_delivery_failures_total ";
    let before = handle.render();

    let store = new_store();
    let ok = Arc::new(|_: &EventStore, _: &RecordedEvent| -> Result<(), SubscriberError> { Ok(()) });
    let failing = Arc::new(|_: &EventStore, _: &RecordedEvent| -> Result<(), SubscriberError> {
        Err("projection unavailable".into())
    });

    let ok_id = store
        .subscribe(StreamTarget::Global, ok, SubscriptionOptions::subscribe().from_end())
        .expect("subscribe");
    let failing_id = store
        .subscribe(StreamTarget::Global, failing, SubscriptionOptions::subscribe().from_end())
        .expect("subscribe");

    let during = handle.render();
    assert_eq!(metric_value(&during, gauge) - metric_value(&before, gauge), 2.0);

    let _ = store
        .append(
            &StreamId::from("metrics-deliver"),
            ExpectedVersion::Any,
            vec![proposed("A")],
        )
        .expect_err("one subscriber fails");

    assert!(store.unsubscribe(ok_id));
    assert!(store.unsubscribe(failing_id));

    let after = handle.render();
    assert_eq!(metric_value(&after, failures) - metric_value(&before, failures), 1.0);
    assert_eq!(metric_value(&after, gauge), metric_value(&before, gauge));
}
