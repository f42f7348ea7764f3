//! eventkeep: an in-memory event store for event sourcing and CQRS.
//!
//! Events are appended to named streams with optimistic concurrency control and
//! per-stream duplicate detection. Every committed event is also visible through the
//! read-only global stream `$all`, ordered by sequence number. Reads go forward or
//! backward from an exclusive position; subscribers replay a backlog when they register
//! and then receive every new commit synchronously. A broadcast [`Broker`] offers the
//! same feed as async catch-up streams for consumers that must not block writers.
//!
//! ```
//! use std::sync::Arc;
//! use eventkeep::{
//!     EventData, EventDescriptor, EventStore, ExpectedVersion, ReadOptions, StreamId,
//!     StreamTarget, SystemClock,
//! };
//!
//! let store = EventStore::new(Arc::new(SystemClock));
//! let stream = StreamId::from("account-1");
//! store
//!     .append(
//!         &stream,
//!         ExpectedVersion::NoStream,
//!         vec![EventDescriptor::new("e-1", "AccountOpened", EventData::new().with("owner", "ada"))],
//!     )
//!     .expect("first append");
//!
//! let events = store
//!     .read(&StreamTarget::from(&stream), ReadOptions::read())
//!     .expect("stream exists");
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].stream_version.value(), 0);
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod options;
pub mod reader;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod types;

pub use broker::{Broker, subscribe_all, subscribe_stream};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use error::{DeliveryFailure, Error, SubscriberError};
pub use options::{Direction, ExpectedVersion, Position, ReadOptions, SubscriptionOptions};
pub use reader::ReadIndex;
pub use snapshot::{JsonNormalizer, MapNormalizer, Normalizer, Snapshot, Snapshotter};
pub use store::{ENGINE_ID, ENGINE_VERSION, EventLog, EventStore};
pub use subscription::{Subscriber, SubscriptionId};
pub use types::{
    EventData, EventDescriptor, EventId, EventMetadata, EventStream, EventType,
    GLOBAL_STREAM_ID, MAX_EVENT_TYPE_LEN, RecordedEvent, SequenceNumber, StreamId, StreamInfo,
    StreamTarget, StreamVersion, SubscriptionMessage,
};

#[cfg(test)]
mod tests {
    // Verify that the public items are reachable from the crate root.

    #[test]
    fn reexport_expected_version() {
        let any = crate::ExpectedVersion::Any;
        let copy = any;
        assert_eq!(copy, crate::ExpectedVersion::Any);
        assert_eq!(crate::ExpectedVersion::exact(7), crate::ExpectedVersion::Exact(crate::StreamVersion::new(7)));
    }

    #[test]
    fn reexport_constants() {
        assert_eq!(crate::MAX_EVENT_TYPE_LEN, 256);
        assert_eq!(crate::GLOBAL_STREAM_ID, "$all");
        assert_eq!(crate::ENGINE_ID, "IN_MEMORY");
    }

    #[test]
    fn reexport_error() {
        let err = crate::Error::InvalidArgument("test".into());
        assert!(err.to_string().contains("test"));
    }
}
