//! Error taxonomy shared by the hub components.

use std::time::Duration;

/// Errors surfaced by the hub.
///
/// None of these are fatal: proxies map dispatch failures to neutral values and
/// the broker reports throttling as a [`crate::broker::SyncOutcome`] instead.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The executor did not answer within the call timeout.
    #[error("timed out after {timeout:?} waiting for the playback executor")]
    DispatchTimeout { timeout: Duration },
    /// The executor queue is closed or the task was dropped before running.
    #[error("playback executor is not accepting tasks")]
    ExecutorUnavailable,
    /// Consumer id was empty or otherwise unusable.
    #[error("invalid consumer registration: {0}")]
    InvalidConsumerRegistration(String),
    /// No live player instance (never created, released, or stale handle).
    #[error("playback resource is not available")]
    ResourceUnavailable,
    /// The resource factory failed.
    #[error("playback resource construction failed: {0}")]
    ConstructionFailed(String),
    /// A cancellable wait was cancelled.
    #[error("wait cancelled")]
    Cancelled,
    /// The presentation surface could not be built or started.
    #[error("presentation surface build failed: {0}")]
    PresentationBuild(String),
}

pub type HubResult<T> = Result<T, HubError>;
