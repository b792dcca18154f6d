//! Affinity executor.
//!
//! A single named worker thread draining a FIFO task queue. It is the only
//! context allowed to touch the playback resource; everything else submits
//! closures to it.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::error::{HubError, HubResult};

/// Unit of work run on the executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identity of an executor, compared against the thread-local marker installed
/// by the executor thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_EXECUTOR: Cell<Option<ExecutorId>> = const { Cell::new(None) };
}

impl ExecutorId {
    fn next() -> Self {
        Self(NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Executor identity of the calling thread, if it is an executor thread.
    pub fn current() -> Option<ExecutorId> {
        CURRENT_EXECUTOR.with(|c| c.get())
    }
}

/// Single-threaded FIFO executor owning the playback resource.
pub struct AffinityExecutor {
    id: ExecutorId,
    name: String,
    cmd_tx: Mutex<Option<Sender<Task>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl AffinityExecutor {
    /// Spawn the executor thread.
    pub fn spawn(name: &str) -> HubResult<Self> {
        let id = ExecutorId::next();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<Task>();
        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                CURRENT_EXECUTOR.with(|c| c.set(Some(id)));
                tracing::debug!(executor = %thread_name, "executor started");
                while let Ok(task) = cmd_rx.recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(executor = %thread_name, "executor task panicked");
                    }
                }
                tracing::debug!(executor = %thread_name, "executor stopped");
            })
            .map_err(|_| HubError::ExecutorUnavailable)?;
        Ok(Self {
            id,
            name: name.to_string(),
            cmd_tx: Mutex::new(Some(cmd_tx)),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` when called from this executor's thread.
    pub fn is_current(&self) -> bool {
        ExecutorId::current() == Some(self.id)
    }

    /// Queue a task. Tasks run in submission order.
    pub fn submit(&self, task: Task) -> HubResult<()> {
        let guard = self.cmd_tx.lock().unwrap_or_else(|err| err.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(HubError::ExecutorUnavailable);
        };
        tx.send(task).map_err(|_| HubError::ExecutorUnavailable)
    }

    /// Run `task` in place when already on the executor, otherwise queue it.
    pub fn run_or_submit(&self, task: Task) -> HubResult<()> {
        if self.is_current() {
            task();
            Ok(())
        } else {
            self.submit(task)
        }
    }

    /// Close the queue. Already queued tasks still run; the thread is joined
    /// unless this is called from the executor itself.
    pub fn shutdown(&self) {
        let sender = self
            .cmd_tx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        drop(sender);
        if self.is_current() {
            return;
        }
        let join = self.join.lock().unwrap_or_else(|err| err.into_inner()).take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }

    /// `false` once [`AffinityExecutor::shutdown`] ran.
    pub fn is_running(&self) -> bool {
        self.cmd_tx
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }
}

impl Drop for AffinityExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = AffinityExecutor::spawn("test-fifo").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            executor
                .submit(Box::new(move || seen.lock().unwrap().push(i)))
                .unwrap();
        }
        executor.shutdown();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn is_current_only_on_executor_thread() {
        let executor = Arc::new(AffinityExecutor::spawn("test-identity").unwrap());
        assert!(!executor.is_current());
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = executor.clone();
        executor
            .submit(Box::new(move || {
                let _ = tx.send((inner.is_current(), ExecutorId::current()));
            }))
            .unwrap();
        let (on_executor, id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(on_executor);
        assert_eq!(id, Some(executor.id()));
    }

    #[test]
    fn distinct_executors_have_distinct_ids() {
        let a = AffinityExecutor::spawn("test-a").unwrap();
        let b = AffinityExecutor::spawn("test-b").unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn panicking_task_does_not_stop_executor() {
        let executor = AffinityExecutor::spawn("test-panic").unwrap();
        executor.submit(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        executor
            .submit(Box::new(move || {
                let _ = tx.send(7);
            }))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let executor = AffinityExecutor::spawn("test-shutdown").unwrap();
        executor.shutdown();
        assert!(!executor.is_running());
        assert!(matches!(
            executor.submit(Box::new(|| {})),
            Err(HubError::ExecutorUnavailable)
        ));
    }

    #[test]
    fn run_or_submit_runs_inline_on_executor() {
        let executor = Arc::new(AffinityExecutor::spawn("test-inline").unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let inner = executor.clone();
        let order_outer = order.clone();
        executor
            .submit(Box::new(move || {
                let order_inner = order_outer.clone();
                inner
                    .run_or_submit(Box::new(move || order_inner.lock().unwrap().push("inner")))
                    .unwrap();
                order_outer.lock().unwrap().push("outer");
                let _ = tx.send(());
            }))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
    }
}
