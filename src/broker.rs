//! Broadcast broker for decoupled live event subscriptions.
//!
//! The `Broker` wraps a `tokio::broadcast` channel that carries `Arc<RecordedEvent>`
//! messages. The store publishes every committed batch right after commit, and all active
//! receivers get it. Unlike synchronous [`Subscriber`](crate::Subscriber)s, broker
//! consumers run on their own tasks, never block the appender, and cannot fail an append.

use std::sync::Arc;

use async_stream::stream;
use tokio::sync::broadcast;

use crate::config::DEFAULT_CATCHUP_BATCH_SIZE;
use crate::error::Error;
use crate::options::{Direction, Position, ReadOptions};
use crate::reader::ReadIndex;
use crate::types::{RecordedEvent, SequenceNumber, StreamId, StreamTarget, SubscriptionMessage};

/// Broadcast broker for pushing newly committed events to live subscribers.
///
/// The `Broker` holds the sending half of a `tokio::broadcast` channel. Each call to
/// [`publish`](Broker::publish) sends the events to all active receivers. Subscribers
/// obtain a receiver via [`subscribe`](Broker::subscribe), or a catch-up-then-live stream
/// via [`subscribe_all`] / [`subscribe_stream`].
///
/// # Design
///
/// The broadcast channel clones every message to every receiver. Events are already
/// `Arc`-wrapped by the log, so all subscribers share the log's allocation rather than
/// deep-cloning event data.
#[derive(Clone, Debug)]
pub struct Broker {
    tx: broadcast::Sender<Arc<RecordedEvent>>,
    catch_up_batch_size: usize,
}

impl Broker {
    /// Create a new broker with the given broadcast channel capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of events the broadcast channel can buffer before
    ///   lagging subscribers are dropped. Must be greater than zero.
    pub fn new(capacity: usize) -> Self {
        // `broadcast::channel` returns (Sender, Receiver). We discard the initial receiver
        // because subscribers obtain their own via `subscribe()`.
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            catch_up_batch_size: DEFAULT_CATCHUP_BATCH_SIZE,
        }
    }

    /// Set how many events a catch-up stream reads per page. Zero is treated as one.
    pub fn with_catch_up_batch_size(mut self, batch_size: usize) -> Self {
        self.catch_up_batch_size = batch_size.max(1);
        self
    }

    /// Publish committed events to all active subscribers.
    ///
    /// Publishing with no receivers is normal (nobody is listening) and only traced.
    ///
    /// # Arguments
    ///
    /// * `events` - Events of one committed batch, in commit order.
    pub fn publish(&self, events: &[Arc<RecordedEvent>]) {
        for event in events {
            if self.tx.send(Arc::clone(event)).is_err() {
                tracing::trace!(sequence_number = %event.sequence_number, "broker publish: no active receivers");
            }
        }
    }

    /// Create a new broadcast receiver for live events.
    ///
    /// The returned receiver will receive all events published after this call. Events
    /// published before subscription are not replayed -- catch-up logic is handled
    /// separately by the subscription stream functions.
    ///
    /// # Returns
    ///
    /// A `broadcast::Receiver<Arc<RecordedEvent>>` that yields events as they are published.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RecordedEvent>> {
        self.tx.subscribe()
    }

    /// Number of receivers currently attached.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Create an async stream that replays the global stream strictly after `position`
/// (catch-up), emits a `CaughtUp` marker, then forwards live events from the broadcast
/// channel.
///
/// The broadcast receiver is registered **before** any historical read begins, preventing
/// a race where events appended between the end of catch-up and the start of live listening
/// would be lost.
///
/// # Arguments
///
/// * `read_index` - Shared read-only handle to the in-memory event log.
/// * `broker` - Reference to the broadcast broker for subscribing to live events.
/// * `position` - Exclusive sequence number to replay after; `Position::End` skips catch-up.
///
/// # Returns
///
/// A stream yielding `Result<SubscriptionMessage, Error>`. The stream yields `Event` variants
/// during catch-up and live phases, a single `CaughtUp` marker between them, and terminates
/// with `Err(Error::SubscriptionLagged { .. })` if the broadcast receiver lags.
pub async fn subscribe_all(
    read_index: ReadIndex,
    broker: &Broker,
    position: Position,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    subscribe_target(read_index, broker, StreamTarget::Global, position)
}

/// Create an async stream that replays a single stream strictly after `position`
/// (catch-up), emits a `CaughtUp` marker, then forwards live events of that stream.
///
/// If the stream does not exist, the catch-up phase terminates immediately and `CaughtUp`
/// is yielded with no preceding events.
///
/// # Arguments
///
/// * `read_index` - Shared read-only handle to the in-memory event log.
/// * `broker` - Reference to the broadcast broker for subscribing to live events.
/// * `stream_id` - Stream to follow. The reserved global id behaves like [`subscribe_all`].
/// * `position` - Exclusive stream version to replay after; `Position::End` skips catch-up.
///
/// # Returns
///
/// Same shape as [`subscribe_all`].
pub async fn subscribe_stream(
    read_index: ReadIndex,
    broker: &Broker,
    stream_id: StreamId,
    position: Position,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    subscribe_target(read_index, broker, StreamTarget::from(stream_id), position)
}

fn subscribe_target(
    read_index: ReadIndex,
    broker: &Broker,
    target: StreamTarget,
    position: Position,
) -> impl futures_core::Stream<Item = Result<SubscriptionMessage, Error>> {
    // Step 1: Register broadcast receiver BEFORE reading history.
    let mut rx = broker.subscribe();
    let batch_size = broker.catch_up_batch_size;

    stream! {
        // Step 2: Catch-up phase -- read history in pages. Sequence numbers grow strictly
        // in commit order for every target, so they drive de-duplication.
        let mut last_catchup_sequence: Option<SequenceNumber> = None;

        if position != Position::End {
            let mut cursor = position;
            loop {
                let page = ReadOptions {
                    direction: Direction::Forward,
                    position: cursor,
                    max_count: Some(batch_size),
                };
                match read_index.read(&target, page) {
                    Ok(batch) => {
                        let batch_len = batch.len();

                        for event in batch {
                            last_catchup_sequence = Some(event.sequence_number);
                            cursor = Position::At(event.position_in(&target));
                            yield Ok(SubscriptionMessage::Event(event));
                        }

                        // A short page means we reached the head of the log.
                        if batch_len < batch_size {
                            break;
                        }
                    }
                    Err(Error::StreamNotFound { .. }) => {
                        // Stream does not exist -- no catch-up events.
                        break;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        // Step 3: Emit CaughtUp marker.
        yield Ok(SubscriptionMessage::CaughtUp);

        // Step 4: Live phase -- drain broadcast receiver, filtering and de-duplicating.
        loop {
            match rx.recv().await {
                Ok(arc_event) => {
                    if let StreamTarget::Named(stream_id) = &target
                        && arc_event.stream_id != *stream_id
                    {
                        continue;
                    }

                    // Deduplication: skip events already sent during catch-up.
                    if let Some(last) = last_catchup_sequence
                        && arc_event.sequence_number <= last
                    {
                        continue;
                    }

                    yield Ok(SubscriptionMessage::Event(arc_event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Step 5: Lag termination.
                    tracing::warn!(%target, skipped, "broker subscription lagged");
                    yield Err(Error::SubscriptionLagged { skipped });
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Broker dropped -- end the stream.
                    return;
                }
            }
        }
    }
}
