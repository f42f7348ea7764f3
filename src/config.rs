//! Store configuration.
//!
//! Every knob has a default; [`StoreConfig::from_env`] overrides them from
//! `EVENTKEEP_*` environment variables.

use std::num::NonZeroUsize;

/// Default capacity of the broker's broadcast channel.
pub const DEFAULT_BROKER_CAPACITY: usize = 4096;

/// Default number of events read per page while replaying a backlog.
pub const DEFAULT_CATCHUP_BATCH_SIZE: usize = 1000;

/// Tunables of an [`EventStore`](crate::EventStore).
///
/// Both values are nonzero: a zero-capacity broadcast channel cannot be built and a
/// zero-sized replay page would never make progress.
///
/// # Fields
///
/// * `broker_capacity` - Events buffered per broker receiver before it lags.
/// * `catch_up_batch_size` - Page size of subscription backlog replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub broker_capacity: NonZeroUsize,
    pub catch_up_batch_size: NonZeroUsize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            broker_capacity: NonZeroUsize::new(DEFAULT_BROKER_CAPACITY)
                .expect("default broker capacity is nonzero"),
            catch_up_batch_size: NonZeroUsize::new(DEFAULT_CATCHUP_BATCH_SIZE)
                .expect("default catch-up batch size is nonzero"),
        }
    }
}

impl StoreConfig {
    /// Build a configuration from environment variables.
    ///
    /// - `EVENTKEEP_BROKER_CAPACITY` (default 4096)
    /// - `EVENTKEEP_CATCHUP_BATCH_SIZE` (default 1000)
    ///
    /// Unset variables fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable if a value is not a positive integer.
    pub fn from_env() -> Result<StoreConfig, String> {
        let defaults = StoreConfig::default();
        let broker_capacity =
            nonzero_from_env("EVENTKEEP_BROKER_CAPACITY", defaults.broker_capacity)?;
        let catch_up_batch_size =
            nonzero_from_env("EVENTKEEP_CATCHUP_BATCH_SIZE", defaults.catch_up_batch_size)?;

        Ok(StoreConfig {
            broker_capacity,
            catch_up_batch_size,
        })
    }
}

fn nonzero_from_env(name: &str, default: NonZeroUsize) -> Result<NonZeroUsize, String> {
    match std::env::var(name) {
        Ok(val) => {
            let raw: usize = val
                .parse()
                .map_err(|e| format!("{name} is not a valid usize: {e}"))?;
            NonZeroUsize::new(raw).ok_or_else(|| format!("{name} must be nonzero"))
        }
        Err(_) => Ok(default),
    }
}
