//! FIFO serial executor.
//!
//! A [`Strand`] wraps an [`Executor`](super::Executor) and guarantees that at
//! most one of its tasks runs at any time, in submission order. It is the
//! per-object concurrency unit: an object bound to a strand gets actor-style
//! single-writer semantics while still sharing the worker pool.
//!
//! ## Drain contract
//!
//! Each submission enqueues the callable and, if no drain task is in flight
//! for this strand, posts one to the executor. The drain task pops and runs
//! exactly one task, then reposts itself while the queue is non-empty, so a
//! busy strand never monopolizes a worker.
//!
//! ## Teardown
//!
//! [`join`](Strand::join) cancels every task that has not started and waits
//! for the one currently running. A task may join (or drop) its own strand;
//! the reentrant case is detected by thread id and the wait is skipped.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use crate::future::{Future, Promise};
use crate::runtime::executor::Executor;

/// Serial FIFO executor over a shared worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    executor: Executor,
    state: Mutex<QueueState>,
    idle: Condvar,
}

struct QueueState {
    queue: VecDeque<QueuedTask>,
    /// A drain task is posted or running.
    draining: bool,
    /// Thread currently executing a task of this strand.
    running_thread: Option<ThreadId>,
    joined: bool,
}

struct QueuedTask {
    run: Box<dyn FnOnce() + Send>,
    /// Complete the task's future as canceled without running it.
    discard: Box<dyn FnOnce() + Send>,
}

impl Strand {
    /// A strand draining onto `executor`.
    pub fn new(executor: Executor) -> Self {
        Strand {
            inner: Arc::new(StrandInner {
                executor,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    draining: false,
                    running_thread: None,
                    joined: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    /// Schedule `f`; the returned future completes with `f`'s return value,
    /// is `Canceled` if cancelled before dispatch, or carries the panic
    /// message if `f` panics.
    pub fn schedule<T, F>(&self, f: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (task, future) = make_task(f, None);
        self.inner.enqueue(task);
        future
    }

    /// Like [`schedule`](Self::schedule) but enqueues only after `delay`.
    /// Cancelling before the delay elapses prevents the task from ever
    /// entering the queue.
    pub fn schedule_delayed<T, F>(&self, f: F, delay: Duration) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if delay.is_zero() {
            return self.schedule(f);
        }
        let enqueued = Arc::new(AtomicBool::new(false));
        let (task, future) = make_task(f, Some(enqueued.clone()));
        let weak = Arc::downgrade(&self.inner);
        let delayed = self.inner.executor.post_delayed(
            move || {
                enqueued.store(true, Ordering::SeqCst);
                match weak.upgrade() {
                    Some(inner) => inner.enqueue(task),
                    None => (task.discard)(),
                }
            },
            delay,
        );
        // A cancel that lands before the delay fires kills the posted task
        // outright; `make_task` handles the in-queue case.
        let d = delayed.clone();
        future.on_complete(move |_| d.cancel());
        future
    }

    /// True when called from a task currently running on this strand.
    pub fn is_in_strand(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.running_thread == Some(std::thread::current().id()))
            .unwrap_or(false)
    }

    /// Cancel all queued tasks and wait for the running one (if any) to
    /// finish. Safe to call from inside a strand task: the self case is
    /// detected and the wait skipped. Further submissions complete canceled.
    pub fn join(&self) {
        self.inner.join();
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }
}

/// Build the queue entry and its observing future.
///
/// The future's cancel handler only marks the request (plus completes the
/// task as canceled when it was never enqueued); the drain task observes the
/// request when popping and skips execution.
fn make_task<T, F>(f: F, enqueued: Option<Arc<AtomicBool>>) -> (QueuedTask, Future<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let promise = match enqueued {
        Some(enqueued) => Promise::with_cancel_handler(move |p: &Promise<T>| {
            if !enqueued.load(Ordering::SeqCst) {
                p.set_canceled();
            }
        }),
        None => Promise::with_cancel_handler(|_: &Promise<T>| {}),
    };
    let run_promise = promise.clone();
    let discard_promise = promise.clone();
    let task = QueuedTask {
        run: Box::new(move || {
            if run_promise.is_cancel_requested() {
                run_promise.set_canceled();
                return;
            }
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => {
                    run_promise.set_value(value);
                }
                Err(panic) => {
                    run_promise.set_error(panic_message(&panic));
                }
            }
        }),
        discard: Box::new(move || {
            discard_promise.set_canceled();
        }),
    };
    (task, promise.future())
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

impl StrandInner {
    fn enqueue(self: &Arc<Self>, task: QueuedTask) {
        let post = {
            let Ok(mut state) = self.state.lock() else {
                (task.discard)();
                return;
            };
            if state.joined {
                drop(state);
                (task.discard)();
                return;
            }
            state.queue.push_back(task);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if post {
            self.post_drain();
        }
    }

    fn post_drain(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let executor = self.executor.clone();
        executor.post(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain_one();
            }
        });
    }

    /// Run exactly one queued task, then repost while work remains.
    fn drain_one(self: &Arc<Self>) {
        let task = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match state.queue.pop_front() {
                Some(task) => {
                    state.running_thread = Some(std::thread::current().id());
                    task
                }
                None => {
                    state.draining = false;
                    drop(state);
                    self.idle.notify_all();
                    return;
                }
            }
        };

        (task.run)();

        let repost = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.running_thread = None;
            if state.queue.is_empty() || state.joined {
                state.draining = false;
                false
            } else {
                true
            }
        };
        if repost {
            self.post_drain();
        } else {
            self.idle.notify_all();
        }
    }

    fn join(&self) {
        let (discarded, wait) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.joined = true;
            let discarded: Vec<QueuedTask> = state.queue.drain(..).collect();
            let reentrant = state.running_thread == Some(std::thread::current().id());
            (discarded, !reentrant)
        };
        // Completing futures may run arbitrary continuations; never under
        // the queue lock.
        for task in discarded {
            (task.discard)();
        }
        if !wait {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while state.draining {
            state = match self.idle.wait(state) {
                Ok(g) => g,
                Err(_) => return,
            };
        }
    }
}

impl Drop for StrandInner {
    fn drop(&mut self) {
        // Drain tasks hold only weak references, so no task of this strand
        // can be running here; just flush the queue.
        if let Ok(mut state) = self.state.lock() {
            let discarded: Vec<QueuedTask> = state.queue.drain(..).collect();
            state.joined = true;
            drop(state);
            for task in discarded {
                (task.discard)();
            }
        }
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureState;
    use std::sync::atomic::AtomicUsize;

    fn executor() -> Executor {
        Executor::new(4).unwrap()
    }

    #[test_log::test]
    fn tasks_run_serially_in_submission_order() {
        let strand = Strand::new(executor());
        let log = Arc::new(Mutex::new(Vec::new()));
        let overlap = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));

        let mut futures = Vec::new();
        for i in 0..50u32 {
            let log = log.clone();
            let overlap = overlap.clone();
            let busy = busy.clone();
            futures.push(strand.schedule(move || {
                if busy.swap(true, Ordering::SeqCst) {
                    overlap.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(200));
                log.lock().unwrap().push(i);
                busy.store(false, Ordering::SeqCst);
            }));
        }
        for f in futures {
            assert_eq!(f.wait(Some(Duration::from_secs(5))), FutureState::FinishedWithValue);
        }
        assert!(!overlap.load(Ordering::SeqCst), "two tasks overlapped");
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test_log::test]
    fn cancel_before_dispatch() {
        let strand = Strand::new(executor());
        // Block the strand so the second task stays queued.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let g = gate.clone();
        let blocker = strand.schedule(move || {
            let (lock, cond) = &*g;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
        });
        let victim = strand.schedule(|| panic!("must not run"));
        victim.cancel();
        let (lock, cond) = &*gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
        assert_eq!(blocker.wait(Some(Duration::from_secs(5))), FutureState::FinishedWithValue);
        assert_eq!(victim.wait(Some(Duration::from_secs(5))), FutureState::Canceled);
    }

    #[test_log::test]
    fn delayed_task_canceled_before_delay_never_queues() {
        let strand = Strand::new(executor());
        let f = strand.schedule_delayed(|| panic!("must not run"), Duration::from_millis(100));
        f.cancel();
        assert_eq!(f.wait(Some(Duration::from_secs(2))), FutureState::Canceled);
    }

    #[test_log::test]
    fn panic_becomes_error_future() {
        let strand = Strand::new(executor());
        let f = strand.schedule(|| panic!("kaboom"));
        assert_eq!(f.wait(Some(Duration::from_secs(5))), FutureState::FinishedWithError);
        assert!(f.error_message().unwrap().contains("kaboom"));
    }

    #[test_log::test]
    fn join_cancels_pending_and_waits_for_running() {
        let strand = Strand::new(executor());
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let running = strand.schedule(move || {
            std::thread::sleep(Duration::from_millis(50));
            c.fetch_add(1, Ordering::SeqCst);
        });
        let queued: Vec<_> = (0..10)
            .map(|_| {
                let c = counter.clone();
                strand.schedule(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(5));
        strand.join();
        assert_eq!(running.state(), FutureState::FinishedWithValue);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        for f in queued {
            assert_eq!(f.state(), FutureState::Canceled);
        }
        // Submissions after join complete canceled.
        let late = strand.schedule(|| 1);
        assert_eq!(late.wait(Some(Duration::from_secs(1))), FutureState::Canceled);
    }

    #[test_log::test]
    fn task_may_join_its_own_strand() {
        let strand = Strand::new(executor());
        let inner = strand.clone();
        let f = strand.schedule(move || {
            // Reentrant join must not deadlock.
            inner.join();
            7
        });
        assert_eq!(f.wait(Some(Duration::from_secs(5))), FutureState::FinishedWithValue);
        assert_eq!(f.result().unwrap(), 7);
    }

    #[test_log::test]
    fn aggressive_cancel_counts_match() {
        let strand = Strand::new(executor());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut futures = Vec::new();
        for _ in 0..100 {
            let c = counter.clone();
            futures.push(strand.schedule(move || {
                std::thread::sleep(Duration::from_micros(300));
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for f in &futures {
            f.cancel();
        }
        let mut ran = 0;
        for f in futures {
            if f.wait(Some(Duration::from_secs(10))) != FutureState::Canceled {
                ran += 1;
            }
        }
        assert_eq!(ran, counter.load(Ordering::SeqCst));
    }
}
