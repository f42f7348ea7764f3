//! Snapshots of aggregate state.
//!
//! A [`Snapshot`] records an aggregate's state as of a stream position, so that a loader
//! only needs to replay events after that position. The [`Snapshotter`] builds snapshots
//! from any aggregate its [`Normalizer`] understands, stripping the fields that only exist
//! to drive replay (the pending event buffer and the version counter).
//!
//! Snapshots are not stored or tracked by the event store.

use std::convert::Infallible;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{RecordedEvent, SequenceNumber, StreamId, StreamVersion};

/// Fields removed from every normalized aggregate by default.
pub const DEFAULT_EXCLUDED_FIELDS: [&str; 2] = ["domain_events", "version"];

/// Point-in-time summary of an aggregate's state.
///
/// # Fields
///
/// * `stream_id` - Stream the aggregate was rebuilt from.
/// * `version` - Stream version of the last event folded into `data`.
/// * `sequence_number` - Sequence number of that same event.
/// * `data` - Normalized aggregate state without replay machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub version: StreamVersion,
    pub sequence_number: SequenceNumber,
    pub data: Map<String, Value>,
}

impl Snapshot {
    /// Read options that resume replay right after this snapshot.
    pub fn resume_options(&self) -> crate::options::ReadOptions {
        crate::options::ReadOptions::read().from(self.version.value())
    }
}

/// Converts an aggregate into a plain field map.
pub trait Normalizer<A: ?Sized> {
    type Error: std::error::Error + Send + Sync + 'static;

    fn normalize(&self, aggregate: &A) -> Result<Map<String, Value>, Self::Error>;
}

/// Error returned by [`JsonNormalizer`].
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("failed to serialize aggregate: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The aggregate serialized to something other than a JSON object.
    #[error("aggregate must normalize to a JSON object, got {kind}")]
    NotAnObject { kind: &'static str },
}

/// [`Normalizer`] for any `Serialize` aggregate, via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonNormalizer;

impl<A: Serialize + ?Sized> Normalizer<A> for JsonNormalizer {
    type Error = NormalizeError;

    fn normalize(&self, aggregate: &A) -> Result<Map<String, Value>, Self::Error> {
        match serde_json::to_value(aggregate)? {
            Value::Object(map) => Ok(map),
            other => Err(NormalizeError::NotAnObject {
                kind: json_kind(&other),
            }),
        }
    }
}

/// [`Normalizer`] for aggregates that already are a field map.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapNormalizer;

impl Normalizer<Map<String, Value>> for MapNormalizer {
    type Error = Infallible;

    fn normalize(&self, aggregate: &Map<String, Value>) -> Result<Map<String, Value>, Self::Error> {
        Ok(aggregate.clone())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Builds [`Snapshot`]s. Pure: it never touches the store.
#[derive(Debug, Clone)]
pub struct Snapshotter<N = JsonNormalizer> {
    normalizer: N,
    excluded_fields: Vec<String>,
}

impl Default for Snapshotter<JsonNormalizer> {
    fn default() -> Self {
        Self::with_normalizer(JsonNormalizer)
    }
}

impl Snapshotter<JsonNormalizer> {
    /// Snapshotter for `Serialize` aggregates.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<N> Snapshotter<N> {
    pub fn with_normalizer(normalizer: N) -> Self {
        Self {
            normalizer,
            excluded_fields: DEFAULT_EXCLUDED_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Also strip `field` from snapshot data.
    pub fn with_excluded_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.excluded_fields.contains(&field) {
            self.excluded_fields.push(field);
        }
        self
    }

    pub fn excluded_fields(&self) -> &[String] {
        &self.excluded_fields
    }

    /// Take a snapshot of `aggregate` as of the given stream position.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Stream the aggregate was rebuilt from.
    /// * `version` - Version of the last event applied to the aggregate.
    /// * `sequence_number` - Sequence number of that event.
    /// * `aggregate` - The rebuilt aggregate.
    ///
    /// # Errors
    ///
    /// Returns the normalizer's error unchanged.
    pub fn take_snapshot<A: ?Sized>(
        &self,
        stream_id: StreamId,
        version: StreamVersion,
        sequence_number: SequenceNumber,
        aggregate: &A,
    ) -> Result<Snapshot, N::Error>
    where
        N: Normalizer<A>,
    {
        let mut data = self.normalizer.normalize(aggregate)?;
        for field in &self.excluded_fields {
            data.remove(field);
        }

        tracing::debug!(
            stream_id = %stream_id,
            version = %version,
            fields = data.len(),
            "snapshot taken"
        );

        Ok(Snapshot {
            stream_id,
            version,
            sequence_number,
            data,
        })
    }

    /// Take a snapshot positioned at `last_applied`, the last event folded into
    /// `aggregate`.
    ///
    /// # Errors
    ///
    /// Returns the normalizer's error unchanged.
    pub fn take_snapshot_at<A: ?Sized>(
        &self,
        last_applied: &RecordedEvent,
        aggregate: &A,
    ) -> Result<Snapshot, N::Error>
    where
        N: Normalizer<A>,
    {
        self.take_snapshot(
            last_applied.stream_id.clone(),
            last_applied.stream_version,
            last_applied.sequence_number,
            aggregate,
        )
    }
}
