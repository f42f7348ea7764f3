//! Storage engine for eventkeep.
//!
//! This module owns the ordered event log and the per-stream index derived from it,
//! and exposes the [`EventStore`] handle through which every write goes. Appends are
//! validated and committed inside a single write-lock critical section; subscriber
//! notification happens after the lock is released, from a FIFO of committed batches
//! drained by the outermost caller, so that subscribers observe events in commit order.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use metrics::{counter, gauge};
use parking_lot::ReentrantMutex;
use serde_json::json;

use crate::broker::Broker;
use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{DeliveryFailure, Error};
use crate::options::{Direction, ExpectedVersion, Position, ReadOptions, SubscriptionOptions};
use crate::reader::ReadIndex;
use crate::subscription::{self, Registration, Subscriber, SubscriberRegistry, SubscriptionId};
use crate::types::{
    EVENT_STORE_KEY, EventDescriptor, EventId, EventMetadata, EventStream, MAX_EVENT_TYPE_LEN,
    RECORDED_AT_KEY, RecordedEvent, SequenceNumber, StreamId, StreamInfo, StreamTarget,
    StreamVersion,
};

/// Identifier written into the `event_store` metadata marker of every recorded event.
pub const ENGINE_ID: &str = "IN_MEMORY";

/// Version written into the `event_store` metadata marker of every recorded event.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-stream slice of the index: surviving versions and the ids they carry.
#[derive(Debug, Default)]
struct StreamIndex {
    /// Surviving stream versions mapped to their sequence numbers.
    versions: BTreeMap<StreamVersion, SequenceNumber>,
    /// Ids of surviving events, for duplicate detection.
    event_ids: HashSet<EventId>,
}

impl StreamIndex {
    fn current_version(&self) -> Option<StreamVersion> {
        self.versions.last_key_value().map(|(version, _)| *version)
    }
}

/// The ordered event log plus the per-stream index derived from it.
///
/// Both structures are only ever mutated together, under the write half of the
/// `RwLock` that [`EventStore`] and [`ReadIndex`] share, so a reader never observes
/// an index entry without its event or a partially committed batch.
///
/// Sequence numbers come from a monotonic counter rather than the number of stored
/// events, so truncation never causes a sequence number to be handed out twice.
#[derive(Debug, Default)]
pub struct EventLog {
    /// Surviving events keyed by sequence number (commit order).
    events: BTreeMap<SequenceNumber, Arc<RecordedEvent>>,
    /// Streams with at least one surviving event.
    streams: HashMap<StreamId, StreamIndex>,
    /// Sequence number the next committed event receives.
    next_sequence: SequenceNumber,
}

impl EventLog {
    /// Current version of a stream, `None` if it has no surviving events.
    pub(crate) fn current_version(&self, stream_id: &StreamId) -> Option<StreamVersion> {
        self.streams
            .get(stream_id)
            .and_then(StreamIndex::current_version)
    }

    pub(crate) fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Number of surviving events across all streams.
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn stream(&self, stream_id: &StreamId) -> Option<EventStream> {
        self.current_version(stream_id).map(|version| EventStream {
            stream_id: stream_id.clone(),
            version,
        })
    }

    pub(crate) fn list_streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .streams
            .iter()
            .filter_map(|(stream_id, index)| {
                index.current_version().map(|latest_version| StreamInfo {
                    stream_id: stream_id.clone(),
                    event_count: index.versions.len() as u64,
                    latest_version,
                })
            })
            .collect();
        streams.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        streams
    }

    /// Validate and commit a batch. Either every event is committed or none is.
    ///
    /// The caller must hold the write lock for the whole call; the concurrency and
    /// duplicate checks are only meaningful because nothing else can commit between
    /// them and the insert.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream (never the global stream).
    /// * `expected_version` - Optimistic concurrency expectation.
    /// * `descriptors` - Batch to commit, in order.
    /// * `recorded_at` - Commit timestamp stamped onto every event of the batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] if `expected_version` does not match.
    /// Returns [`Error::DuplicateEventId`] if an id already survives in the stream or
    /// repeats within the batch.
    pub(crate) fn append(
        &mut self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        descriptors: Vec<EventDescriptor>,
        recorded_at: u64,
    ) -> Result<Vec<Arc<RecordedEvent>>, Error> {
        // Step 1: Optimistic concurrency check against the derived current version.
        let current_version = self.current_version(stream_id);
        if !expected_version.matches(current_version) {
            return Err(Error::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual: current_version,
            });
        }

        // Step 2: Duplicate detection against surviving events and within the batch.
        {
            let existing = self.streams.get(stream_id);
            let mut batch_ids = HashSet::with_capacity(descriptors.len());
            for descriptor in &descriptors {
                let known =
                    existing.is_some_and(|index| index.event_ids.contains(&descriptor.event_id));
                if known || !batch_ids.insert(&descriptor.event_id) {
                    return Err(Error::DuplicateEventId {
                        stream_id: stream_id.clone(),
                        event_id: descriptor.event_id.clone(),
                    });
                }
            }
        }

        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        // Step 3: Assign positions and insert. Nothing below can fail.
        let mut next_version = current_version.map_or(StreamVersion::new(0), StreamVersion::next);
        let index = self.streams.entry(stream_id.clone()).or_default();
        let mut recorded = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let sequence_number = self.next_sequence;
            let event = Arc::new(RecordedEvent {
                stream_id: stream_id.clone(),
                stream_version: next_version,
                sequence_number,
                recorded_at,
                event_id: descriptor.event_id,
                event_type: descriptor.event_type,
                data: descriptor.data,
                metadata: stamp_metadata(descriptor.metadata, recorded_at),
            });

            index.versions.insert(next_version, sequence_number);
            index.event_ids.insert(event.event_id.clone());
            self.events.insert(sequence_number, Arc::clone(&event));
            recorded.push(event);

            self.next_sequence = sequence_number.next();
            next_version = next_version.next();
        }

        Ok(recorded)
    }

    /// Read a slice of a stream or of the global stream.
    ///
    /// Ordering by direction comes first, then exclusive position filtering, then the
    /// count cap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] if a named target has no surviving events.
    pub(crate) fn read(
        &self,
        target: &StreamTarget,
        options: &ReadOptions,
    ) -> Result<Vec<Arc<RecordedEvent>>, Error> {
        let limit = match options.max_count {
            Some(0) | None => usize::MAX,
            Some(count) => count,
        };

        match target {
            StreamTarget::Named(stream_id) if !stream_id.is_global() => {
                let index = self
                    .streams
                    .get(stream_id)
                    .ok_or_else(|| Error::StreamNotFound {
                        stream_id: stream_id.clone(),
                    })?;
                let Some((lower, upper)) = position_bounds(options.direction, options.position)
                else {
                    return Ok(Vec::new());
                };
                let range = index
                    .versions
                    .range((lower.map(StreamVersion::new), upper.map(StreamVersion::new)))
                    .filter_map(|(_, sequence)| self.events.get(sequence).cloned());
                Ok(take_directed(range, options.direction, limit))
            }
            _ => {
                let Some((lower, upper)) = position_bounds(options.direction, options.position)
                else {
                    return Ok(Vec::new());
                };
                let range = self
                    .events
                    .range((lower.map(SequenceNumber::new), upper.map(SequenceNumber::new)))
                    .map(|(_, event)| Arc::clone(event));
                Ok(take_directed(range, options.direction, limit))
            }
        }
    }

    /// Remove every surviving event of `stream_id` with a version below `before`.
    ///
    /// A stream left without events is dropped from the index entirely, so it no longer
    /// exists and its next append starts again at version 0.
    ///
    /// # Returns
    ///
    /// The number of events removed.
    pub(crate) fn truncate(&mut self, stream_id: &StreamId, before: StreamVersion) -> usize {
        let Some(index) = self.streams.get_mut(stream_id) else {
            return 0;
        };

        let retained = index.versions.split_off(&before);
        let removed = std::mem::replace(&mut index.versions, retained);

        for sequence in removed.values() {
            if let Some(event) = self.events.remove(sequence) {
                index.event_ids.remove(&event.event_id);
            }
        }

        if index.versions.is_empty() {
            self.streams.remove(stream_id);
        }

        removed.len()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
        self.streams.clear();
        self.next_sequence = SequenceNumber::default();
    }
}

/// Translate a direction and a start position into key bounds.
///
/// Returns `None` when the read is empty by construction (backward from the start,
/// forward from the end).
fn position_bounds(direction: Direction, position: Position) -> Option<(Bound<u64>, Bound<u64>)> {
    match (direction, position) {
        (Direction::Forward, Position::Start) | (Direction::Backward, Position::End) => {
            Some((Bound::Unbounded, Bound::Unbounded))
        }
        (Direction::Forward, Position::End) | (Direction::Backward, Position::Start) => None,
        (Direction::Forward, Position::At(p)) => Some((Bound::Excluded(p), Bound::Unbounded)),
        (Direction::Backward, Position::At(p)) => Some((Bound::Unbounded, Bound::Excluded(p))),
    }
}

fn take_directed<I>(events: I, direction: Direction, limit: usize) -> Vec<I::Item>
where
    I: DoubleEndedIterator,
{
    match direction {
        Direction::Forward => events.take(limit).collect(),
        Direction::Backward => events.rev().take(limit).collect(),
    }
}

/// Copy of `metadata` carrying the commit time and the engine marker.
fn stamp_metadata(metadata: EventMetadata, recorded_at: u64) -> EventMetadata {
    metadata.with(RECORDED_AT_KEY, recorded_at).with(
        EVENT_STORE_KEY,
        json!({
            "id": ENGINE_ID,
            "version": ENGINE_VERSION,
        }),
    )
}

/// Reject malformed input before any lock is taken.
fn validate_batch(stream_id: &StreamId, descriptors: &[EventDescriptor]) -> Result<(), Error> {
    if stream_id.as_str().is_empty() {
        return Err(Error::InvalidArgument("stream id must not be empty".to_string()));
    }
    for descriptor in descriptors {
        if descriptor.event_id.as_str().is_empty() {
            return Err(Error::InvalidArgument("event id must not be empty".to_string()));
        }
        if descriptor.event_type.as_str().is_empty() {
            return Err(Error::InvalidArgument(
                "event type must not be empty".to_string(),
            ));
        }
        if descriptor.event_type.as_str().len() > MAX_EVENT_TYPE_LEN {
            return Err(Error::InvalidArgument(format!(
                "event type exceeds {} byte limit: {} bytes",
                MAX_EVENT_TYPE_LEN,
                descriptor.event_type.as_str().len()
            )));
        }
    }
    Ok(())
}

fn rejection_reason(err: &Error) -> &'static str {
    match err {
        Error::ConcurrencyConflict { .. } => "concurrency_conflict",
        Error::DuplicateEventId { .. } => "duplicate_event_id",
        Error::VirtualStreamWriteRejected { .. } => "virtual_stream",
        _ => "invalid_argument",
    }
}

/// A committed batch waiting for notification, with the recipients it had at commit time.
struct PendingBatch {
    recipients: Vec<Registration>,
    events: Vec<Arc<RecordedEvent>>,
}

/// Batches committed but not yet delivered, in commit order.
#[derive(Default)]
struct DeliveryQueue {
    /// Set while some frame on the lock-holding thread is draining the queue.
    draining: bool,
    pending: VecDeque<PendingBatch>,
}

/// Resets the queue when the draining frame exits, including by unwinding.
struct DrainReset<'a>(&'a RefCell<DeliveryQueue>);

impl Drop for DrainReset<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.borrow_mut();
        queue.draining = false;
        queue.pending.clear();
    }
}

/// In-memory event store.
///
/// `EventStore` is a cheap, cloneable handle: clones share the same log, subscribers
/// and broker. Independently constructed stores share nothing.
///
/// # Concurrency
///
/// - Appends hold the log's write lock from the concurrency check through the insert,
///   so two writers can never both observe the same current version.
/// - Reads take the read lock and always see whole batches.
/// - Post-commit notification runs after the write lock is released but while the
///   reentrant delivery lock is held. Committed batches go through a FIFO queue: an
///   append made from inside a subscriber callback commits immediately, but its events
///   are delivered only after every earlier batch, so all subscribers see events in
///   commit order.
#[derive(Clone)]
pub struct EventStore {
    log: Arc<RwLock<EventLog>>,
    registry: Arc<SubscriberRegistry>,
    delivery: Arc<ReentrantMutex<RefCell<DeliveryQueue>>>,
    broker: Broker,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl EventStore {
    /// Create an empty store with the default configuration.
    pub fn new(clock: Arc<dyn Clock>) -> EventStore {
        EventStore::with_config(clock, StoreConfig::default())
    }

    /// Create an empty store.
    ///
    /// # Arguments
    ///
    /// * `clock` - Time source for `recorded_at`.
    /// * `config` - Broker capacity and catch-up page size.
    pub fn with_config(clock: Arc<dyn Clock>, config: StoreConfig) -> EventStore {
        EventStore {
            log: Arc::new(RwLock::new(EventLog::default())),
            registry: Arc::new(SubscriberRegistry::default()),
            delivery: Arc::new(ReentrantMutex::new(RefCell::new(DeliveryQueue::default()))),
            broker: Broker::new(config.broker_capacity.get())
                .with_catch_up_batch_size(config.catch_up_batch_size.get()),
            clock,
            config,
        }
    }

    /// The reserved id of the virtual global stream.
    pub fn global_stream_id(&self) -> StreamId {
        StreamId::global()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read-only handle sharing this store's log.
    pub fn read_index(&self) -> ReadIndex {
        ReadIndex::new(Arc::clone(&self.log))
    }

    /// Broadcast broker that receives every committed batch.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Append a batch of events to a stream with optimistic concurrency control.
    ///
    /// Versions are assigned from the stream's current version + 1 and sequence numbers
    /// from the global counter, in input order. After commit, every subscriber registered
    /// on `stream_id` and then every subscriber registered on the global stream is
    /// invoked once per event, in commit order, before this call returns.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream.
    /// * `expected_version` - Concurrency check against the current stream state.
    /// * `events` - Batch to append; an empty batch commits nothing.
    ///
    /// # Returns
    ///
    /// The recorded events with their assigned positions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VirtualStreamWriteRejected`] if `stream_id` is the global stream.
    /// Returns [`Error::InvalidArgument`] for malformed descriptors.
    /// Returns [`Error::ConcurrencyConflict`] if the concurrency check fails.
    /// Returns [`Error::DuplicateEventId`] if an event id already exists in the stream.
    /// In all of the above cases nothing was committed.
    ///
    /// Returns [`Error::DeliveryFailed`] if the batch **was committed** but at least one
    /// subscriber failed; the committed events are carried in the error.
    ///
    /// # Appending from a subscriber
    ///
    /// An append made from inside [`Subscriber::on_event`] commits and returns before its
    /// events are delivered: they are queued behind the batch being delivered and sent
    /// once it is done. Failures while delivering them are reported to the outermost
    /// append (or logged, inside [`EventStore::subscribe`]).
    pub fn append(
        &self,
        stream_id: &StreamId,
        expected_version: ExpectedVersion,
        events: Vec<EventDescriptor>,
    ) -> Result<Vec<Arc<RecordedEvent>>, Error> {
        if stream_id.is_global() {
            counter!("eventkeep_append_rejections_total", "reason" => "virtual_stream")
                .increment(1);
            return Err(Error::VirtualStreamWriteRejected {
                stream_id: stream_id.clone(),
            });
        }
        if let Err(err) = validate_batch(stream_id, &events) {
            counter!("eventkeep_append_rejections_total", "reason" => "invalid_argument")
                .increment(1);
            return Err(err);
        }

        // The delivery lock is taken before the write lock so batches enter the delivery
        // queue in commit order.
        let delivery = self.delivery.lock();

        let committed = {
            let mut log = self.log.write().expect("EventLog RwLock poisoned");
            let recorded_at = self.clock.now_millis();
            log.append(stream_id, expected_version, events, recorded_at)
                .inspect_err(|err| {
                    counter!("eventkeep_append_rejections_total", "reason" => rejection_reason(err))
                        .increment(1);
                })?
            // Write lock dropped here.
        };

        if committed.is_empty() {
            return Ok(committed);
        }

        counter!("eventkeep_appends_total").increment(1);
        counter!("eventkeep_events_appended_total").increment(committed.len() as u64);
        tracing::debug!(
            stream_id = %stream_id,
            count = committed.len(),
            first_sequence = %committed[0].sequence_number,
            "committed batch"
        );

        self.broker.publish(&committed);

        let batch = PendingBatch {
            recipients: self.registry.recipients(stream_id),
            events: committed.clone(),
        };
        let ((), failures) =
            self.run_delivery(&delivery, || delivery.borrow_mut().pending.push_back(batch));
        if failures.is_empty() {
            Ok(committed)
        } else {
            Err(Error::DeliveryFailed {
                committed,
                failures,
            })
        }
    }

    /// Run `work`, then deliver every queued batch in FIFO order.
    ///
    /// Only the outermost call on the lock-holding thread drains. A nested call (from a
    /// subscriber callback) just runs `work`; whatever it queued is picked up by the
    /// frame already draining.
    ///
    /// # Returns
    ///
    /// The result of `work` and the failures collected while draining.
    fn run_delivery<R>(
        &self,
        queue: &RefCell<DeliveryQueue>,
        work: impl FnOnce() -> R,
    ) -> (R, Vec<DeliveryFailure>) {
        if queue.borrow().draining {
            return (work(), Vec::new());
        }
        queue.borrow_mut().draining = true;
        let _reset = DrainReset(queue);

        let result = work();
        let mut failures = Vec::new();
        loop {
            // The borrow must end before delivery: callbacks may enqueue.
            let next = queue.borrow_mut().pending.pop_front();
            let Some(batch) = next else { break };
            failures.extend(subscription::deliver(self, &batch.recipients, &batch.events));
        }

        if !failures.is_empty() {
            counter!("eventkeep_delivery_failures_total").increment(failures.len() as u64);
        }
        (result, failures)
    }

    /// Read a slice of a stream or of the global stream.
    ///
    /// See [`ReadIndex::read`].
    pub fn read(
        &self,
        target: &StreamTarget,
        options: ReadOptions,
    ) -> Result<Vec<Arc<RecordedEvent>>, Error> {
        self.read_index().read(target, options)
    }

    /// Current view of a named stream, `None` if it has no surviving events.
    pub fn get_stream(&self, stream_id: &StreamId) -> Option<EventStream> {
        self.read_index().get_stream(stream_id)
    }

    /// Whether a stream has surviving events. Always `true` for the global stream.
    pub fn stream_exists(&self, stream_id: &StreamId) -> bool {
        self.read_index().stream_exists(stream_id)
    }

    /// Summaries of all existing streams, sorted by id.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        self.read_index().list_streams()
    }

    /// Remove every event of `stream_id` with a version strictly below `before`.
    ///
    /// Surviving events keep their versions and sequence numbers. Truncating a stream
    /// that does not exist is a no-op.
    ///
    /// # Returns
    ///
    /// The number of events removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VirtualStreamWriteRejected`] if `stream_id` is the global stream.
    pub fn truncate(&self, stream_id: &StreamId, before: StreamVersion) -> Result<usize, Error> {
        if stream_id.is_global() {
            return Err(Error::VirtualStreamWriteRejected {
                stream_id: stream_id.clone(),
            });
        }

        let removed = {
            let mut log = self.log.write().expect("EventLog RwLock poisoned");
            log.truncate(stream_id, before)
        };

        counter!("eventkeep_truncated_events_total").increment(removed as u64);
        tracing::debug!(stream_id = %stream_id, before = %before, removed, "truncated stream");
        Ok(removed)
    }

    /// Register a subscriber on a stream (or on the global stream).
    ///
    /// Unless `options.position` is [`Position::End`], the backlog strictly after that
    /// position is replayed to the subscriber, in pages, before this call returns. No
    /// live event is delivered to anyone while the replay runs. An event committed just
    /// before registration may be delivered both by the replay and live: subscribers must
    /// be idempotent.
    ///
    /// Subscribing from a position to a named stream that does not exist yet replays
    /// nothing.
    ///
    /// # Returns
    ///
    /// The id to pass to [`EventStore::unsubscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatchUpFailed`] if the subscriber fails during replay; it is then
    /// unregistered.
    pub fn subscribe(
        &self,
        target: impl Into<StreamTarget>,
        subscriber: Arc<dyn Subscriber>,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionId, Error> {
        let target = target.into().normalized();
        let delivery = self.delivery.lock();

        let subscription = self
            .registry
            .register(target.clone(), Arc::clone(&subscriber));
        gauge!("eventkeep_subscriptions_active").increment(1.0);
        tracing::info!(%subscription, %target, position = ?options.position, "subscriber registered");

        // Appends made by the subscriber during replay are queued until replay ends.
        let (replay, failures) = self.run_delivery(&delivery, || {
            subscription::catch_up(
                self,
                &target,
                subscriber.as_ref(),
                options.position,
                self.config.catch_up_batch_size,
            )
        });
        if !failures.is_empty() {
            tracing::warn!(
                %subscription,
                failures = failures.len(),
                "events appended during catch-up were not delivered to every subscriber"
            );
        }

        if let Err(source) = replay {
            self.registry.remove(subscription);
            gauge!("eventkeep_subscriptions_active").decrement(1.0);
            tracing::warn!(%subscription, %target, error = %source, "catch-up replay failed");
            return Err(Error::CatchUpFailed {
                subscription,
                source,
            });
        }

        Ok(subscription)
    }

    /// Remove a subscriber. Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let delivery = self.delivery.lock();
        let removed = self.registry.remove(subscription);
        if removed {
            for batch in delivery.borrow_mut().pending.iter_mut() {
                batch.recipients.retain(|registration| registration.id != subscription);
            }
            gauge!("eventkeep_subscriptions_active").decrement(1.0);
            tracing::info!(%subscription, "subscriber removed");
        }
        removed
    }

    /// Drop every event and every subscriber, returning the store to its initial state.
    pub fn clear(&self) {
        let delivery = self.delivery.lock();
        delivery.borrow_mut().pending.clear();
        self.log.write().expect("EventLog RwLock poisoned").clear();
        let dropped = self.registry.clear();
        gauge!("eventkeep_subscriptions_active").decrement(dropped as f64);
        tracing::info!(dropped_subscribers = dropped, "store cleared");
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.read().expect("EventLog RwLock poisoned");
        f.debug_struct("EventStore")
            .field("events", &log.len())
            .field("next_sequence", &log.next_sequence())
            .field("subscribers", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
