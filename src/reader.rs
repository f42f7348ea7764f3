//! Read-only handle to the in-memory event log.
//!
//! `ReadIndex` provides concurrent, read-only access to the event log without going
//! through [`EventStore`](crate::EventStore). It wraps an `Arc<RwLock<EventLog>>` and
//! exposes read methods that acquire a read lock for the duration of the operation, so
//! every read observes whole committed batches only.

use std::sync::{Arc, RwLock};

use metrics::counter;

use crate::error::Error;
use crate::options::ReadOptions;
use crate::store::EventLog;
use crate::types::{EventStream, RecordedEvent, SequenceNumber, StreamId, StreamInfo, StreamTarget};

/// Shared, read-only handle to the in-memory event log.
///
/// Multiple `ReadIndex` clones share the same underlying data -- cloning produces a
/// new handle, not a copy of the data.
///
/// This is the handle the broker's catch-up streams hold.
#[derive(Clone, Debug)]
pub struct ReadIndex {
    /// Shared reference to the in-memory event log.
    log: Arc<RwLock<EventLog>>,
}

impl ReadIndex {
    /// Create a new `ReadIndex` backed by the given shared event log.
    ///
    /// # Arguments
    ///
    /// * `log` - Shared reference to the in-memory event log.
    ///
    /// # Returns
    ///
    /// A new `ReadIndex` handle.
    pub fn new(log: Arc<RwLock<EventLog>>) -> ReadIndex {
        ReadIndex { log }
    }

    /// Read a slice of a named stream or of the global stream.
    ///
    /// Events are ordered by stream version (named target) or sequence number (global
    /// target) in the requested direction; then everything at or on the wrong side of
    /// `options.position` is dropped; then at most `options.max_count` events are kept
    /// (zero means no cap).
    ///
    /// # Arguments
    ///
    /// * `target` - Stream to read.
    /// * `options` - Direction, exclusive start position and count cap.
    ///
    /// # Returns
    ///
    /// The matching events, shared with the log.
    ///
    /// # Errors
    ///
    /// Returns `Error::StreamNotFound` if a named target has no surviving events. The
    /// global stream always exists and reads as empty when the log is empty.
    pub fn read(
        &self,
        target: &StreamTarget,
        options: ReadOptions,
    ) -> Result<Vec<Arc<RecordedEvent>>, Error> {
        let label = if target.is_global() { "global" } else { "stream" };
        counter!("eventkeep_reads_total", "target" => label).increment(1);

        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.read(target, &options)
    }

    /// Returns the stream id and highest surviving version of a named stream.
    ///
    /// Returns `None` if the stream has no surviving events. The global stream has no
    /// version of its own, so its id also yields `None`.
    pub fn get_stream(&self, stream_id: &StreamId) -> Option<EventStream> {
        if stream_id.is_global() {
            return None;
        }
        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.stream(stream_id)
    }

    /// Whether a stream currently has at least one surviving event.
    ///
    /// Always `true` for the global stream id.
    pub fn stream_exists(&self, stream_id: &StreamId) -> bool {
        if stream_id.is_global() {
            return true;
        }
        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.current_version(stream_id).is_some()
    }

    /// Return metadata for all existing streams, sorted by stream id.
    ///
    /// Acquires a single read guard for the whole operation and never touches event
    /// payloads.
    ///
    /// # Returns
    ///
    /// A `Vec<StreamInfo>`; empty when no streams exist.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.list_streams()
    }

    /// The sequence number the next committed event will receive.
    ///
    /// Never decreases, not even after truncation.
    pub fn next_sequence_number(&self) -> SequenceNumber {
        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.next_sequence()
    }

    /// Number of surviving events across all streams.
    pub fn event_count(&self) -> usize {
        let log = self.log.read().expect("EventLog RwLock poisoned");
        log.len()
    }
}
