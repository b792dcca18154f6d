//! Blocking call bridge.
//!
//! Turns a task submitted to the executor into a synchronous result with a hard
//! wait bound. A timed-out task is not cancelled: it still runs (and may still
//! mutate the player) after the caller gave up, and its result is discarded.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::error::{HubError, HubResult};
use crate::executor::AffinityExecutor;

/// Synchronous request/response over the affinity executor.
#[derive(Clone)]
pub struct BlockingCallBridge {
    executor: Arc<AffinityExecutor>,
    timeout: Duration,
}

impl BlockingCallBridge {
    pub fn new(executor: Arc<AffinityExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` on the executor and wait for its result.
    ///
    /// Runs in place when already on the executor. A dropped task (executor
    /// shutting down) is reported like a timeout, as
    /// [`HubError::ExecutorUnavailable`].
    pub fn invoke<R, F>(&self, op: F) -> HubResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.executor.is_current() {
            return Ok(op());
        }
        let (result_tx, result_rx) = crossbeam_channel::bounded::<R>(1);
        self.executor.submit(Box::new(move || {
            let _ = result_tx.send(op());
        }))?;
        match result_rx.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    executor = %self.executor.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "timed out communicating with playback executor"
                );
                Err(HubError::DispatchTimeout {
                    timeout: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(
                    executor = %self.executor.name(),
                    "playback executor dropped the call"
                );
                Err(HubError::ExecutorUnavailable)
            }
        }
    }
}
