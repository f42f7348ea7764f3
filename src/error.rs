//! Error types for eventkeep.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! store operations return `Result<T, Error>`. Every error is reported synchronously to
//! the caller; nothing is silently recovered.

use std::sync::Arc;

use crate::options::ExpectedVersion;
use crate::subscription::SubscriptionId;
use crate::types::{EventId, RecordedEvent, SequenceNumber, StreamId, StreamTarget, StreamVersion};

/// Error returned by a subscriber callback.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all store operations.
///
/// Retry guidance:
///
/// - `ConcurrencyConflict` -> reload the stream and retry the command.
/// - `VirtualStreamWriteRejected`, `DuplicateEventId`, `InvalidArgument` -> caller bug, do not retry as-is.
/// - `StreamNotFound` -> the stream has no surviving events.
/// - `DeliveryFailed` -> the write **succeeded**; only post-commit notification failed.
/// - `CatchUpFailed` -> the subscriber was not registered.
/// - `SubscriptionLagged` -> re-subscribe from the last processed position.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Attempted to append to or truncate the virtual global stream.
    #[error("cannot write to virtual stream {stream_id}")]
    VirtualStreamWriteRejected {
        /// Id the caller tried to write to.
        stream_id: StreamId,
    },

    /// Optimistic concurrency check failed: the stream's current version does not
    /// match the caller's expectation.
    #[error(
        "concurrency conflict on stream {stream_id}: expected version {expected}, actual {}",
        describe_version(.actual)
    )]
    ConcurrencyConflict {
        stream_id: StreamId,
        /// The version the caller expected the stream to be at.
        expected: ExpectedVersion,
        /// The version the stream is actually at (`None` = no stream).
        actual: Option<StreamVersion>,
    },

    /// An event id in the batch already exists, non-truncated, in the target stream,
    /// or appears twice in the batch.
    #[error("duplicate event id {event_id} in stream {stream_id}")]
    DuplicateEventId {
        stream_id: StreamId,
        event_id: EventId,
    },

    /// The requested stream has no surviving events.
    #[error("stream not found: {stream_id}")]
    StreamNotFound {
        stream_id: StreamId,
    },

    /// A request argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The batch was committed but one or more subscribers failed while being notified.
    #[error(
        "appended {} events, but delivery failed for {} subscriber(s)",
        .committed.len(),
        .failures.len()
    )]
    DeliveryFailed {
        /// The committed batch, exactly as a successful append would have returned it.
        committed: Vec<Arc<RecordedEvent>>,
        /// One entry per subscriber that failed.
        failures: Vec<DeliveryFailure>,
    },

    /// Backlog replay failed while registering a subscriber; the subscriber was removed.
    #[error("catch-up replay failed for subscription {subscription}: {source}")]
    CatchUpFailed {
        subscription: SubscriptionId,
        #[source]
        source: SubscriberError,
    },

    /// An async broker subscription fell behind the broadcast buffer and was ended.
    /// Re-subscribe from the last processed position.
    #[error("subscription lagged behind by {skipped} events: re-subscribe from last checkpoint")]
    SubscriptionLagged { skipped: u64 },
}

impl Error {
    /// Whether the caller may retry after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }

    /// The events that were committed despite this error.
    ///
    /// Only `DeliveryFailed` carries committed events; every other variant means
    /// nothing was written.
    pub fn committed_events(&self) -> Option<&[Arc<RecordedEvent>]> {
        match self {
            Error::DeliveryFailed { committed, .. } => Some(committed),
            _ => None,
        }
    }
}

/// A single subscriber failure during post-commit notification.
#[derive(Debug, thiserror::Error)]
#[error("subscriber {subscription} on {target} failed at sequence {sequence_number}: {source}")]
pub struct DeliveryFailure {
    pub subscription: SubscriptionId,
    /// Stream the subscriber was registered on.
    pub target: StreamTarget,
    /// Sequence number of the event the subscriber rejected.
    pub sequence_number: SequenceNumber,
    #[source]
    pub source: SubscriberError,
}

fn describe_version(version: &Option<StreamVersion>) -> String {
    match version {
        Some(version) => version.to_string(),
        None => "initial".to_string(),
    }
}
