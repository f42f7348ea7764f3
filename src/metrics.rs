//! Prometheus metrics infrastructure for eventkeep.
//!
//! The store emits its counters and gauges through the `metrics` facade, which is a no-op
//! until a recorder is installed. This module installs a process-global Prometheus
//! recorder and hands out a handle that renders the current snapshot in text exposition
//! format. Serving that text is left to the embedding application.

use std::sync::{Arc, OnceLock};

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,

    /// The Prometheus recorder could not be built or registered.
    #[error("failed to install Prometheus recorder: {0}")]
    Install(#[from] BuildError),
}

/// Handle to the installed Prometheus metrics recorder.
///
/// This is a cheaply cloneable reference to the underlying recorder. It can be
/// used to render the current metrics snapshot in Prometheus exposition format.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current metrics snapshot in Prometheus exposition format.
    ///
    /// # Returns
    ///
    /// A string containing all registered metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

/// Guard to ensure the global recorder is installed at most once per process.
static RECORDER_HANDLE: OnceLock<MetricsHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder.
///
/// Call once at startup before the store is used; metrics emitted earlier are lost.
/// A second call in the same process returns [`MetricsError::AlreadyInstalled`].
///
/// # Returns
///
/// A [`MetricsHandle`] that can render the current metrics snapshot.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] if the recorder has already been installed.
/// Returns [`MetricsError::Install`] if another global recorder is already registered
/// with the `metrics` facade.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    if RECORDER_HANDLE.get().is_some() {
        return Err(MetricsError::AlreadyInstalled);
    }

    let prom_handle = PrometheusBuilder::new().install_recorder()?;
    let handle = MetricsHandle {
        inner: Arc::new(prom_handle),
    };
    RECORDER_HANDLE
        .set(handle.clone())
        .map_err(|_| MetricsError::AlreadyInstalled)?;

    describe_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Returns the previously installed [`MetricsHandle`], if any.
///
/// This is useful in test code where `install_recorder()` may have already been
/// called by another test in the same process.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

fn describe_metrics() {
    describe_counter!("eventkeep_appends_total", "Successful append calls");
    describe_counter!("eventkeep_events_appended_total", "Events committed");
    describe_counter!(
        "eventkeep_append_rejections_total",
        "Append calls rejected before commit, by reason"
    );
    describe_counter!("eventkeep_reads_total", "Read calls, by target kind");
    describe_counter!(
        "eventkeep_truncated_events_total",
        "Events removed by truncation"
    );
    describe_gauge!(
        "eventkeep_subscriptions_active",
        "Registered synchronous subscribers"
    );
    describe_counter!(
        "eventkeep_delivery_failures_total",
        "Subscriber failures during post-commit notification"
    );
}
