//! Core domain types for eventkeep.
//!
//! This module defines the value types every other module depends on: stream and
//! event identifiers, the two position counters (per-stream version and global
//! sequence number), the event payload and metadata maps, the write-side
//! descriptor submitted by producers, and the immutable recorded form returned to
//! readers and subscribers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;

/// Reserved identifier of the virtual stream that contains every committed event.
pub const GLOBAL_STREAM_ID: &str = "$all";

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// Metadata key holding the commit timestamp (Unix epoch milliseconds).
pub const RECORDED_AT_KEY: &str = "recordedAt";

/// Metadata key holding the `{id, version}` marker of the engine that recorded the event.
pub const EVENT_STORE_KEY: &str = "event_store";

/// Identifier of a logical stream.
///
/// Stream ids are opaque strings. The value [`GLOBAL_STREAM_ID`] is reserved for the
/// virtual global stream; use [`StreamTarget`] at API boundaries that accept both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved id of the global stream.
    pub fn global() -> Self {
        Self(GLOBAL_STREAM_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this id is the reserved global stream id.
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_STREAM_ID
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Addressing target for reads and subscriptions.
///
/// A read against `Named` uses stream versions as positions; a read against `Global`
/// uses sequence numbers. Only `Named` targets can ever exist or not exist: the global
/// stream is always present, even when the log is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    /// A single real stream.
    Named(StreamId),
    /// The virtual, read-only stream of every committed event.
    Global,
}

impl StreamTarget {
    /// Target a named stream. The reserved global id maps to [`StreamTarget::Global`].
    pub fn named(id: impl Into<String>) -> Self {
        Self::from(StreamId::new(id))
    }

    /// Whether this addresses the global stream, including `Named("$all")`.
    pub fn is_global(&self) -> bool {
        match self {
            StreamTarget::Named(id) => id.is_global(),
            StreamTarget::Global => true,
        }
    }

    /// Map a `Named` target carrying the reserved global id to [`StreamTarget::Global`].
    pub fn normalized(self) -> Self {
        match self {
            StreamTarget::Named(id) => StreamTarget::from(id),
            StreamTarget::Global => StreamTarget::Global,
        }
    }

    /// The stream id this target is addressed by (`$all` for the global stream).
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamTarget::Named(id) => id.clone(),
            StreamTarget::Global => StreamId::global(),
        }
    }
}

impl From<StreamId> for StreamTarget {
    fn from(id: StreamId) -> Self {
        if id.is_global() {
            StreamTarget::Global
        } else {
            StreamTarget::Named(id)
        }
    }
}

impl From<&StreamId> for StreamTarget {
    fn from(id: &StreamId) -> Self {
        StreamTarget::from(id.clone())
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::Named(id) => id.fmt(f),
            StreamTarget::Global => f.write_str(GLOBAL_STREAM_ID),
        }
    }
}

/// Producer-chosen identifier of an event, unique within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Event type tag naming the schema of an event (e.g. `"OrderPlaced"`).
///
/// Opaque to the engine apart from the length limit [`MAX_EVENT_TYPE_LEN`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(event_type: &str) -> Self {
        Self::new(event_type)
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Zero-based position of an event within its own stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamVersion(u64);

impl StreamVersion {
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version the event after this one receives.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for StreamVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

/// Zero-based position of an event in the whole log, assigned in commit order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for SequenceNumber {
    fn from(sequence: u64) -> Self {
        Self(sequence)
    }
}

/// Immutable event payload: a mapping of field name to JSON value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventData(Map<String, Value>);

impl EventData {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Return a copy of this payload with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EventData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for EventData {
    type Error = Error;

    /// Accepts only JSON objects.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidArgument(format!(
                "event data must be a JSON object, got {other}"
            ))),
        }
    }
}

/// Immutable auxiliary key/value pairs attached to an event at authoring time.
///
/// On commit the store records a copy augmented with [`RECORDED_AT_KEY`] and
/// [`EVENT_STORE_KEY`]; the producer's own value is never touched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMetadata(Map<String, Value>);

impl EventMetadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Return a copy of this metadata with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Commit timestamp in epoch milliseconds, present only on recorded metadata.
    pub fn recorded_at(&self) -> Option<u64> {
        self.0.get(RECORDED_AT_KEY).and_then(Value::as_u64)
    }
}

impl From<Map<String, Value>> for EventMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// An event a producer wants to append to a stream.
///
/// # Fields
///
/// * `event_id` - Producer-assigned id, unique within the target stream.
/// * `event_type` - Schema tag of the event.
/// * `data` - Domain payload.
/// * `metadata` - Infrastructure context (correlation id, causation id, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub event_id: EventId,
    pub event_type: EventType,
    pub data: EventData,
    pub metadata: EventMetadata,
}

impl EventDescriptor {
    /// Create a descriptor with empty metadata.
    pub fn new(event_id: impl Into<EventId>, event_type: impl Into<EventType>, data: EventData) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            data,
            metadata: EventMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A committed event with store-assigned positions.
///
/// Created exactly once, inside an append, and never mutated afterwards. This is the
/// only form handed to readers and subscribers.
///
/// # Fields
///
/// * `stream_id` - Stream the event was appended to.
/// * `stream_version` - Zero-based version within the stream.
/// * `sequence_number` - Zero-based position in the global log.
/// * `recorded_at` - Commit time, Unix epoch milliseconds from the store's clock.
/// * `event_id`, `event_type`, `data` - Copied from the descriptor.
/// * `metadata` - The descriptor's metadata augmented with commit information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: StreamId,
    pub stream_version: StreamVersion,
    pub sequence_number: SequenceNumber,
    pub recorded_at: u64,
    pub event_id: EventId,
    pub event_type: EventType,
    pub data: EventData,
    pub metadata: EventMetadata,
}

impl RecordedEvent {
    /// Position of this event under the addressing scheme of `target`: the sequence
    /// number for the global stream, the stream version otherwise.
    pub fn position_in(&self, target: &StreamTarget) -> u64 {
        if target.is_global() {
            self.sequence_number.value()
        } else {
            self.stream_version.value()
        }
    }

    /// Rebuild the descriptor this event was recorded from, with the augmented metadata.
    pub fn descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            event_id: self.event_id.clone(),
            event_type: self.event_type.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// View of an existing stream: its id and the highest surviving version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStream {
    pub stream_id: StreamId,
    pub version: StreamVersion,
}

/// Summary of a stream returned by `ReadIndex::list_streams`.
///
/// Carries no event data, only the number of surviving events and the latest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub event_count: u64,
    pub latest_version: StreamVersion,
}

/// A message yielded by the broker's async subscription streams.
///
/// # Variants
///
/// * `Event(Arc<RecordedEvent>)` - A recorded event, shared across subscribers.
/// * `CaughtUp` - Marks the end of the catch-up phase; live events follow.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    Event(Arc<RecordedEvent>),
    CaughtUp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorded(stream: &str, version: u64, sequence: u64) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::from(stream),
            stream_version: StreamVersion::new(version),
            sequence_number: SequenceNumber::new(sequence),
            recorded_at: 0,
            event_id: EventId::generate(),
            event_type: EventType::from("TestEvent"),
            data: EventData::new(),
            metadata: EventMetadata::new(),
        }
    }

    #[test]
    fn reserved_stream_id_maps_to_global_target() {
        assert_eq!(StreamTarget::from(StreamId::global()), StreamTarget::Global);
        assert_eq!(StreamTarget::named(GLOBAL_STREAM_ID), StreamTarget::Global);
        assert_eq!(
            StreamTarget::named("orders-1"),
            StreamTarget::Named(StreamId::from("orders-1"))
        );
    }

    #[test]
    fn global_target_reports_reserved_stream_id() {
        assert_eq!(StreamTarget::Global.stream_id().as_str(), "$all");
        assert_eq!(StreamTarget::Global.to_string(), "$all");
        assert!(StreamTarget::Global.stream_id().is_global());
    }

    #[test]
    fn versions_and_sequence_numbers_order_numerically() {
        assert!(StreamVersion::new(2) < StreamVersion::new(10));
        assert_eq!(StreamVersion::new(4).next(), StreamVersion::new(5));
        assert!(SequenceNumber::new(9) < SequenceNumber::new(11));
        assert_eq!(SequenceNumber::default().value(), 0);
    }

    #[test]
    fn generated_event_ids_are_distinct() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn event_data_with_leaves_original_untouched() {
        let original = EventData::new().with("username", "user_1");
        let extended = original.clone().with("email", "user_1@example.com");

        assert_eq!(original.len(), 1);
        assert_eq!(extended.len(), 2);
        assert_eq!(extended.get("username"), Some(&json!("user_1")));
    }

    #[test]
    fn event_data_from_non_object_is_rejected() {
        let err = EventData::try_from(json!([1, 2, 3])).expect_err("array is not a map");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let ok = EventData::try_from(json!({"qty": 1})).expect("object converts");
        assert_eq!(ok.get("qty"), Some(&json!(1)));
    }

    #[test]
    fn metadata_recorded_at_reads_numeric_key() {
        let metadata = EventMetadata::new().with(RECORDED_AT_KEY, 1_700_000_000_123u64);
        assert_eq!(metadata.recorded_at(), Some(1_700_000_000_123));
        assert_eq!(EventMetadata::new().recorded_at(), None);
    }

    #[test]
    fn named_target_with_reserved_id_is_global() {
        let raw = StreamTarget::Named(StreamId::global());
        assert!(raw.is_global());
        assert_eq!(raw.normalized(), StreamTarget::Global);
        assert_eq!(
            StreamTarget::named("orders-1").normalized(),
            StreamTarget::named("orders-1")
        );
    }

    #[test]
    fn position_in_uses_addressing_scheme_of_target() {
        let event = recorded("orders-1", 3, 17);
        assert_eq!(event.position_in(&StreamTarget::Global), 17);
        assert_eq!(event.position_in(&StreamTarget::named("orders-1")), 3);
    }

    #[test]
    fn descriptor_round_trips_identity_fields() {
        let event = recorded("orders-1", 0, 0);
        let descriptor = event.descriptor();
        assert_eq!(descriptor.event_id, event.event_id);
        assert_eq!(descriptor.event_type, "TestEvent");
    }

    #[test]
    fn recorded_event_serializes_with_transparent_ids() {
        let event = recorded("orders-1", 1, 5);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["stream_id"], json!("orders-1"));
        assert_eq!(value["stream_version"], json!(1));
        assert_eq!(value["sequence_number"], json!(5));
    }

    #[test]
    fn subscription_message_clone_shares_arc() {
        let arc = Arc::new(recorded("s", 0, 0));
        let msg = SubscriptionMessage::Event(arc.clone());
        match msg.clone() {
            SubscriptionMessage::Event(cloned) => assert!(Arc::ptr_eq(&arc, &cloned)),
            SubscriptionMessage::CaughtUp => panic!("expected Event variant"),
        }
    }
}
