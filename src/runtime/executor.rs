//! Thread-pooled task executor.
//!
//! The [`Executor`] is a thin handle over a tokio worker pool. Components
//! that need to run a closure "somewhere, soon" ([`Strand`](super::Strand)
//! drain tasks, queued method invocations, async signal subscribers) go
//! through it rather than spawning on an ambient runtime, so a session can
//! own its pool and shut it down deterministically.
//!
//! Two flavors:
//!
//! - [`Executor::new`] builds and owns a multi-thread runtime (standalone
//!   deployments, tests);
//! - [`Executor::current`] borrows the runtime the caller already runs on
//!   (embedding in an existing tokio application).
//!
//! Tasks may not assume any particular worker thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Handle to a worker pool. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    handle: Handle,
    /// Present when this executor owns its runtime.
    owned: Mutex<Option<Runtime>>,
}

/// Cancellation handle for a delayed task.
///
/// [`cancel`](DelayedTask::cancel) prevents the task from running if it has
/// not yet been dispatched to a worker; a task already running is unaffected.
#[derive(Clone)]
pub struct DelayedTask {
    token: CancellationToken,
}

impl DelayedTask {
    /// Prevent the task from running if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Executor {
    /// Build an executor that owns a fresh multi-thread runtime.
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("omnibus-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                handle,
                owned: Mutex::new(Some(runtime)),
            }),
        })
    }

    /// Borrow the runtime of the calling context.
    ///
    /// Panics (in tokio) when called outside a runtime, like any
    /// `Handle::current` user.
    pub fn current() -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                handle: Handle::current(),
                owned: Mutex::new(None),
            }),
        }
    }

    /// The underlying tokio handle, for spawning I/O tasks.
    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Run `f` on some worker as soon as possible.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handle.spawn(async move { f() });
    }

    /// Run `f` after `delay`. The returned handle cancels the task as long
    /// as it has not been dispatched.
    pub fn post_delayed<F>(&self, f: F, delay: Duration) -> DelayedTask
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        self.inner.handle.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    if !task_token.is_cancelled() {
                        f();
                    }
                }
                () = task_token.cancelled() => {}
            }
        });
        DelayedTask { token }
    }

    /// Shut down an owned pool without waiting for queued tasks.
    ///
    /// No-op for executors borrowed from an ambient runtime. Safe to call
    /// from within a worker.
    pub fn shutdown(&self) {
        if let Ok(mut owned) = self.inner.owned.lock() {
            if let Some(rt) = owned.take() {
                rt.shutdown_background();
            }
        }
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Ok(mut owned) = self.owned.lock() {
            if let Some(rt) = owned.take() {
                // shutdown_background never blocks, so dropping an executor
                // from inside an async context is fine.
                rt.shutdown_background();
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test_log::test]
    fn post_runs_task() {
        let exec = Executor::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        exec.post(move || {
            tx.send(41).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 41);
    }

    #[test_log::test]
    fn canceled_delayed_task_does_not_run() {
        let exec = Executor::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = exec.post_delayed(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(100),
        );
        handle.cancel();
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn delayed_task_runs_when_not_canceled() {
        let exec = Executor::new(2).unwrap();
        let (tx, rx) = mpsc::channel();
        exec.post_delayed(
            move || {
                tx.send(()).unwrap();
            },
            Duration::from_millis(10),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}
