//! Synchronous subscribers and the registry that routes committed events to them.
//!
//! Subscribers are registered per [`StreamTarget`]. After every commit the store
//! snapshots the relevant registrations (the named stream's first, then the global
//! stream's) and invokes them once per event in commit order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use crate::error::{DeliveryFailure, Error, SubscriberError};
use crate::options::{Direction, Position, ReadOptions};
use crate::store::EventStore;
use crate::types::{RecordedEvent, StreamId, StreamTarget};

/// Receives committed events synchronously.
///
/// `on_event` runs on the appending thread after the batch is committed and the log
/// lock is released, so it may read from or append to `store`. Events appended from a
/// callback are delivered after the batch currently being delivered. Returning an error does
/// not undo the commit; it is reported to the appender as
/// [`Error::DeliveryFailed`](crate::Error::DeliveryFailed).
///
/// Events may be delivered more than once around a catch-up boundary. Implementations
/// should be idempotent on `sequence_number`.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, store: &EventStore, event: &RecordedEvent) -> Result<(), SubscriberError>;
}

impl<F> Subscriber for F
where
    F: Fn(&EventStore, &RecordedEvent) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_event(&self, store: &EventStore, event: &RecordedEvent) -> Result<(), SubscriberError> {
        self(store, event)
    }
}

/// Handle identifying one registration, returned by
/// [`EventStore::subscribe`](crate::EventStore::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One registered subscriber.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) id: SubscriptionId,
    pub(crate) target: StreamTarget,
    pub(crate) subscriber: Arc<dyn Subscriber>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    by_target: HashMap<StreamTarget, Vec<Registration>>,
}

/// Subscriber lists keyed by target, in registration order.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriberRegistry {
    pub(crate) fn register(
        &self,
        target: StreamTarget,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        let mut state = self.state.write().expect("SubscriberRegistry RwLock poisoned");
        let id = SubscriptionId::new(state.next_id);
        state.next_id += 1;
        state
            .by_target
            .entry(target.clone())
            .or_default()
            .push(Registration {
                id,
                target,
                subscriber,
            });
        id
    }

    /// Remove a registration. Returns `false` if the id is unknown.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.write().expect("SubscriberRegistry RwLock poisoned");
        let mut removed = false;
        state.by_target.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|registration| registration.id != id);
            removed |= registrations.len() != before;
            !registrations.is_empty()
        });
        removed
    }

    /// Drop every registration. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.state.write().expect("SubscriberRegistry RwLock poisoned");
        let dropped: usize = state.by_target.values().map(Vec::len).sum();
        state.by_target.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.read().expect("SubscriberRegistry RwLock poisoned");
        state.by_target.values().map(Vec::len).sum()
    }

    /// Snapshot of who must be notified of a commit to `stream_id`: the stream's own
    /// subscribers first, then the global stream's.
    pub(crate) fn recipients(&self, stream_id: &StreamId) -> Vec<Registration> {
        let state = self.state.read().expect("SubscriberRegistry RwLock poisoned");
        let named = StreamTarget::Named(stream_id.clone());
        [named, StreamTarget::Global]
            .iter()
            .filter_map(|target| state.by_target.get(target))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Invoke every recipient once per event, in commit order.
///
/// A subscriber that fails is skipped for the rest of the batch; the others still see
/// every event.
///
/// # Returns
///
/// One [`DeliveryFailure`] per failed subscriber; empty when everyone succeeded.
pub(crate) fn deliver(
    store: &EventStore,
    recipients: &[Registration],
    events: &[Arc<RecordedEvent>],
) -> Vec<DeliveryFailure> {
    let mut failed = HashSet::new();
    let mut failures = Vec::new();

    for event in events {
        for registration in recipients {
            if failed.contains(&registration.id) {
                continue;
            }
            if let Err(source) = registration.subscriber.on_event(store, event) {
                tracing::warn!(
                    subscription = %registration.id,
                    target = %registration.target,
                    sequence_number = %event.sequence_number,
                    error = %source,
                    "subscriber failed"
                );
                failed.insert(registration.id);
                failures.push(DeliveryFailure {
                    subscription: registration.id,
                    target: registration.target.clone(),
                    sequence_number: event.sequence_number,
                    source,
                });
            }
        }
    }

    failures
}

/// Replay the backlog of `target` strictly after `position` to `subscriber`.
///
/// Reads forward in pages of `batch_size` and stops once a page comes back short. A
/// named target that does not exist has no backlog.
///
/// # Errors
///
/// Returns the subscriber's error as soon as it rejects an event.
pub(crate) fn catch_up(
    store: &EventStore,
    target: &StreamTarget,
    subscriber: &dyn Subscriber,
    position: Position,
    batch_size: NonZeroUsize,
) -> Result<(), SubscriberError> {
    let batch_size = batch_size.get();
    if position == Position::End {
        return Ok(());
    }

    let mut cursor = position;
    loop {
        let page = ReadOptions {
            direction: Direction::Forward,
            position: cursor,
            max_count: Some(batch_size),
        };
        let events = match store.read(target, page) {
            Ok(events) => events,
            Err(Error::StreamNotFound { .. }) => return Ok(()),
            Err(other) => return Err(other.into()),
        };

        for event in &events {
            subscriber.on_event(store, event)?;
            cursor = Position::At(event.position_in(target));
        }

        if events.len() < batch_size {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::options::ExpectedVersion;
    use crate::types::{EventData, EventDescriptor, SequenceNumber};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    impl Subscriber for Recorder {
        fn on_event(&self, _: &EventStore, event: &RecordedEvent) -> Result<(), SubscriberError> {
            self.seen
                .lock()
                .expect("mutex poisoned")
                .push(event.sequence_number.value());
            Ok(())
        }
    }

    fn batch(size: usize) -> NonZeroUsize {
        NonZeroUsize::new(size).expect("nonzero")
    }

    fn new_store() -> EventStore {
        EventStore::new(Arc::new(ManualClock::new(0)))
    }

    fn append(store: &EventStore, stream: &str, n: usize) {
        let batch = (0..n)
            .map(|_| EventDescriptor::new(crate::types::EventId::generate(), "Tick", EventData::new()))
            .collect();
        store
            .append(&StreamId::from(stream), ExpectedVersion::Any, batch)
            .expect("append should succeed");
    }

    #[test]
    fn subscription_ids_are_unique_and_displayable() {
        let registry = SubscriberRegistry::default();
        let recorder: Arc<dyn Subscriber> = Arc::new(Recorder::default());
        let a = registry.register(StreamTarget::Global, Arc::clone(&recorder));
        let b = registry.register(StreamTarget::Global, recorder);
        assert_ne!(a, b);
        assert_eq!(SubscriptionId::new(7).to_string(), "sub-7");
    }

    #[test]
    fn recipients_lists_named_before_global() {
        let registry = SubscriberRegistry::default();
        let recorder: Arc<dyn Subscriber> = Arc::new(Recorder::default());
        let global = registry.register(StreamTarget::Global, Arc::clone(&recorder));
        let named = registry.register(StreamTarget::named("orders-1"), Arc::clone(&recorder));
        registry.register(StreamTarget::named("other"), recorder);

        let ids: Vec<SubscriptionId> = registry
            .recipients(&StreamId::from("orders-1"))
            .iter()
            .map(|registration| registration.id)
            .collect();
        assert_eq!(ids, vec![named, global]);
    }

    #[test]
    fn remove_and_clear_report_what_they_dropped() {
        let registry = SubscriberRegistry::default();
        let recorder: Arc<dyn Subscriber> = Arc::new(Recorder::default());
        let a = registry.register(StreamTarget::Global, Arc::clone(&recorder));
        registry.register(StreamTarget::named("s"), recorder);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.clear(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn catch_up_pages_through_whole_backlog() {
        let store = new_store();
        append(&store, "s", 7);
        let recorder = Recorder::default();

        // A page size that does not divide the backlog exercises the short last page.
        catch_up(&store, &StreamTarget::Global, &recorder, Position::Start, batch(3))
            .expect("catch-up should succeed");
        assert_eq!(
            *recorder.seen.lock().expect("mutex poisoned"),
            vec![0, 1, 2, 3, 4, 5, 6]
        );
    }

    #[test]
    fn catch_up_exact_page_multiple_terminates() {
        let store = new_store();
        append(&store, "s", 4);
        let recorder = Recorder::default();
        catch_up(&store, &StreamTarget::named("s"), &recorder, Position::At(0), batch(3))
            .expect("catch-up should succeed");
        assert_eq!(*recorder.seen.lock().expect("mutex poisoned"), vec![1, 2, 3]);
    }

    #[test]
    fn catch_up_with_single_event_pages_terminates() {
        let store = new_store();
        append(&store, "s", 3);
        let recorder = Recorder::default();
        catch_up(&store, &StreamTarget::Global, &recorder, Position::Start, NonZeroUsize::MIN)
            .expect("catch-up should succeed");
        assert_eq!(*recorder.seen.lock().expect("mutex poisoned"), vec![0, 1, 2]);
    }

    #[test]
    fn catch_up_on_missing_stream_replays_nothing() {
        let store = new_store();
        let recorder = Recorder::default();
        catch_up(&store, &StreamTarget::named("nope"), &recorder, Position::Start, batch(10))
            .expect("missing stream has no backlog");
        assert!(recorder.seen.lock().expect("mutex poisoned").is_empty());
    }

    #[test]
    fn catch_up_from_end_replays_nothing() {
        let store = new_store();
        append(&store, "s", 2);
        let recorder = Recorder::default();
        catch_up(&store, &StreamTarget::Global, &recorder, Position::End, batch(10))
            .expect("nothing to replay");
        assert!(recorder.seen.lock().expect("mutex poisoned").is_empty());
    }

    #[test]
    fn closures_are_subscribers() {
        let store = new_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = move |_: &EventStore, event: &RecordedEvent| -> Result<(), SubscriberError> {
            sink.lock().expect("mutex poisoned").push(event.sequence_number);
            Ok(())
        };
        store
            .subscribe(StreamTarget::Global, Arc::new(subscriber), Default::default())
            .expect("subscribe");
        append(&store, "s", 2);
        assert_eq!(
            *seen.lock().expect("mutex poisoned"),
            vec![SequenceNumber::new(0), SequenceNumber::new(1)]
        );
    }
}
