//! Options accepted by append, read and subscribe.
//!
//! Positions are interpreted per addressing scheme: against the global stream a
//! [`Position::At`] value is a sequence number, against a named stream it is a
//! stream version. Boundaries are always exclusive.

use std::fmt;

use crate::types::StreamVersion;

/// Controls optimistic concurrency on append.
///
/// # Variants
///
/// * `Any` - No concurrency check.
/// * `NoStream` - The stream must not exist (its version is "initial").
/// * `Exact(v)` - The stream's current version must be exactly `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpectedVersion {
    #[default]
    Any,
    NoStream,
    Exact(StreamVersion),
}

impl ExpectedVersion {
    /// Shorthand for `ExpectedVersion::Exact(StreamVersion::new(version))`.
    pub const fn exact(version: u64) -> Self {
        ExpectedVersion::Exact(StreamVersion::new(version))
    }

    /// Check this expectation against the stream's current version (`None` = no stream).
    pub fn matches(&self, current: Option<StreamVersion>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoStream, None) => true,
            (ExpectedVersion::Exact(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }
}

impl From<Option<StreamVersion>> for ExpectedVersion {
    /// The version a caller observed: `None` means it saw no stream.
    fn from(observed: Option<StreamVersion>) -> Self {
        match observed {
            Some(version) => ExpectedVersion::Exact(version),
            None => ExpectedVersion::NoStream,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any"),
            ExpectedVersion::NoStream => f.write_str("initial"),
            ExpectedVersion::Exact(version) => version.fmt(f),
        }
    }
}

/// Read direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Where a read or a subscription starts.
///
/// * `Start` - Before the first event: forward reads return everything, backward
///   reads return nothing.
/// * `End` - Just past the last event: backward reads return the latest events,
///   forward reads return nothing, and subscriptions receive live events only.
/// * `At(p)` - An explicit position; forward reads return positions `> p`,
///   backward reads positions `< p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    #[default]
    Start,
    End,
    At(u64),
}

/// Options for a read.
///
/// Built fluently:
///
/// ```
/// use eventkeep::{Direction, Position, ReadOptions};
///
/// let options = ReadOptions::read().backward().from_end().max_count(10);
/// assert_eq!(options.direction, Direction::Backward);
/// assert_eq!(options.position, Position::End);
/// assert_eq!(options.max_count, Some(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOptions {
    pub direction: Direction,
    pub position: Position,
    /// Cap applied after ordering and filtering. `None` and `Some(0)` read everything.
    pub max_count: Option<usize>,
}

impl ReadOptions {
    /// Forward from the start, uncapped.
    pub fn read() -> Self {
        Self::default()
    }

    /// The most recent surviving event: backward from the end, one event.
    pub fn last_event() -> Self {
        Self::read().backward().from_end().max_count(1)
    }

    pub fn forward(mut self) -> Self {
        self.direction = Direction::Forward;
        self
    }

    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    pub fn from_start(mut self) -> Self {
        self.position = Position::Start;
        self
    }

    pub fn from_end(mut self) -> Self {
        self.position = Position::End;
        self
    }

    pub fn from(mut self, position: u64) -> Self {
        self.position = Position::At(position);
        self
    }

    /// Keep at most `max_count` events; zero means no cap.
    pub fn max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }
}

/// Options for a subscription: where delivery starts.
///
/// The default is [`Position::End`], i.e. live events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub position: Position,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            position: Position::End,
        }
    }
}

impl SubscriptionOptions {
    pub fn subscribe() -> Self {
        Self::default()
    }

    pub fn from_start(mut self) -> Self {
        self.position = Position::Start;
        self
    }

    pub fn from_end(mut self) -> Self {
        self.position = Position::End;
        self
    }

    /// Replay backlog strictly after `position`, then continue live.
    pub fn from(mut self, position: u64) -> Self {
        self.position = Position::At(position);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_every_state() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(StreamVersion::new(7))));
    }

    #[test]
    fn no_stream_matches_only_absent_stream() {
        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(StreamVersion::new(0))));
    }

    #[test]
    fn exact_matches_only_equal_version() {
        assert!(ExpectedVersion::exact(2).matches(Some(StreamVersion::new(2))));
        assert!(!ExpectedVersion::exact(2).matches(Some(StreamVersion::new(3))));
        assert!(!ExpectedVersion::exact(0).matches(None));
    }

    #[test]
    fn observed_version_converts_to_expectation() {
        assert_eq!(ExpectedVersion::from(None), ExpectedVersion::NoStream);
        assert_eq!(
            ExpectedVersion::from(Some(StreamVersion::new(4))),
            ExpectedVersion::exact(4)
        );
    }

    #[test]
    fn display_names_initial_version() {
        assert_eq!(ExpectedVersion::NoStream.to_string(), "initial");
        assert_eq!(ExpectedVersion::exact(12).to_string(), "12");
    }

    #[test]
    fn default_read_is_forward_from_start_uncapped() {
        let options = ReadOptions::read();
        assert_eq!(options.direction, Direction::Forward);
        assert_eq!(options.position, Position::Start);
        assert_eq!(options.max_count, None);
    }

    #[test]
    fn last_event_is_single_backward_read_from_end() {
        let options = ReadOptions::last_event();
        assert_eq!(options.direction, Direction::Backward);
        assert_eq!(options.position, Position::End);
        assert_eq!(options.max_count, Some(1));
    }

    #[test]
    fn subscription_defaults_to_live_only() {
        assert_eq!(SubscriptionOptions::subscribe().position, Position::End);
        assert_eq!(
            SubscriptionOptions::subscribe().from(3).position,
            Position::At(3)
        );
    }
}
