//! A dedicated thread that cache refreshes are funnelled through.
//!
//! Cache misses from other threads are executed here synchronously; refreshes
//! of stale entries are queued and run in the background. Jobs arrive over a
//! tokio unbounded channel and are run in order.

use crate::error::{SqlError, SqlResult};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

pub struct RefreshWorker {
    name: String,
    sender: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl RefreshWorker {
    /// Start a worker thread named `name`.
    pub fn spawn(name: impl Into<String>) -> SqlResult<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(worker = %thread_name, "Cache refresh worker started");
                while let Some(job) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(worker = %thread_name, "Cache refresh job panicked");
                    }
                }
                debug!(worker = %thread_name, "Cache refresh worker stopped");
            })
            .map_err(|e| SqlError::internal(format!("failed to spawn refresh worker: {}", e)))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            name,
            sender: Some(sender),
            handle: Some(handle),
            thread_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this worker.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Queue `job` without waiting for it.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) -> SqlResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SqlError::internal("refresh worker is shut down"))?;
        sender
            .send(Box::new(job))
            .map_err(|_| SqlError::internal(format!("refresh worker '{}' has stopped", self.name)))
    }

    /// Run `job` on the worker and wait for its result.
    ///
    /// Runs inline when called from the worker itself.
    pub fn run_sync<T, F>(&self, job: F) -> SqlResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }
        let (tx, rx) = oneshot::channel();
        self.schedule(move || {
            let _ = tx.send(job());
        })?;
        rx.blocking_recv().map_err(|_| {
            SqlError::internal(format!(
                "refresh worker '{}' dropped a job before completing it",
                self.name
            ))
        })
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        // Closing the channel ends the thread's loop.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if self.is_current() {
                return;
            }
            if handle.join().is_err() {
                error!(worker = %self.name, "Cache refresh worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for RefreshWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshWorker")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_run_sync_returns_value_from_worker_thread() {
        let worker = RefreshWorker::spawn("test-refresh-sync").unwrap();
        let name = worker
            .run_sync(|| thread::current().name().map(String::from))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-refresh-sync"));
        assert!(!worker.is_current());
    }

    #[test]
    fn test_schedule_runs_in_background() {
        let worker = RefreshWorker::spawn("test-refresh-async").unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        worker
            .schedule(move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        // Jobs run in order, so a synchronous job observes the earlier one.
        worker.run_sync(|| ()).unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let worker = RefreshWorker::spawn("test-refresh-panic").unwrap();
        worker.schedule(|| panic!("boom")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(worker.run_sync(|| 7).unwrap(), 7);
    }
}
