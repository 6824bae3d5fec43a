//! Periodically executed task.
//!
//! A [`PeriodicTask`] reschedules a callback on a [`Strand`] with a fixed
//! period. The state machine is
//! `Stopped → Starting → Running ⇄ Triggering → Stopping → Stopped`:
//!
//! - [`start`](PeriodicTask::start) schedules the first fire (immediately or
//!   after one period);
//! - [`trigger`](PeriodicTask::trigger) atomically attempts
//!   `Running → Triggering` and, on success, fires right now — any other
//!   state makes it a no-op;
//! - [`stop`](PeriodicTask::stop) blocks until an in-flight fire finishes;
//!   from inside the callback use [`async_stop`](PeriodicTask::async_stop)
//!   instead;
//! - a panicking callback stops the task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::future::Future;
use crate::runtime::strand::Strand;

const STOPPED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const TRIGGERING: u8 = 3;
const STOPPING: u8 = 4;

/// A self-rescheduling task bound to a strand.
pub struct PeriodicTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    status: AtomicU8,
    state: Mutex<TaskState>,
    stopped: Condvar,
}

struct TaskState {
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
    strand: Option<Strand>,
    period: Duration,
    compensate: bool,
    name: String,
    /// Future of the next (or currently executing) fire.
    scheduled: Option<Future<()>>,
    /// Thread currently inside the callback, for reentrancy detection.
    firing_thread: Option<std::thread::ThreadId>,
}

impl PeriodicTask {
    pub fn new() -> Self {
        PeriodicTask {
            inner: Arc::new(TaskInner {
                status: AtomicU8::new(STOPPED),
                state: Mutex::new(TaskState {
                    callback: None,
                    strand: None,
                    period: Duration::from_secs(1),
                    compensate: false,
                    name: String::new(),
                    scheduled: None,
                    firing_thread: None,
                }),
                stopped: Condvar::new(),
            }),
        }
    }

    /// Set the callback. Must be called before `start`; cannot be changed
    /// while running.
    pub fn set_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.inner.state.lock() {
            state.callback = Some(Arc::new(f));
        }
    }

    /// Set the strand the callback is scheduled on.
    pub fn set_strand(&self, strand: Strand) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.strand = Some(strand);
        }
    }

    /// Set the period. Takes effect at the next reschedule.
    pub fn set_period(&self, period: Duration) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.period = period;
        }
    }

    /// When enabled, the next delay is `period - callback_duration`
    /// (saturating at zero) so the cadence stays fixed.
    pub fn compensate_callback_time(&self, compensate: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.compensate = compensate;
        }
    }

    /// Name used in log lines.
    pub fn set_name(&self, name: impl Into<String>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.name = name.into();
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.inner.status.load(Ordering::SeqCst),
            STARTING | RUNNING | TRIGGERING
        )
    }

    /// True when `stop`/`async_stop` was called or the task never started.
    pub fn is_stopping(&self) -> bool {
        matches!(self.inner.status.load(Ordering::SeqCst), STOPPING | STOPPED)
    }

    /// Start firing. No effect if not stopped. `immediate` fires the first
    /// callback with zero delay instead of waiting one period.
    pub fn start(&self, immediate: bool) {
        if self
            .inner
            .status
            .compare_exchange(STOPPED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let delay = {
            let Ok(state) = self.inner.state.lock() else {
                self.inner.status.store(STOPPED, Ordering::SeqCst);
                return;
            };
            debug_assert!(state.callback.is_some(), "start() without a callback");
            if immediate {
                Duration::ZERO
            } else {
                state.period
            }
        };
        self.inner.status.store(RUNNING, Ordering::SeqCst);
        TaskInner::schedule_fire(&self.inner, delay);
    }

    /// Fire right now if currently `Running`. Lock-free check; any other
    /// state makes this a no-op.
    pub fn trigger(&self) {
        if self
            .inner
            .status
            .compare_exchange(RUNNING, TRIGGERING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Replace the pending delayed fire with an immediate one.
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(f) = state.scheduled.take() {
                f.cancel();
            }
        }
        TaskInner::schedule_fire(&self.inner, Duration::ZERO);
    }

    /// Stop and wait for an in-flight callback to finish.
    ///
    /// Calling this from inside the callback would self-deadlock; that case
    /// is detected, logged, and degraded to [`async_stop`](Self::async_stop).
    pub fn stop(&self) {
        let reentrant = self
            .inner
            .state
            .lock()
            .map(|s| s.firing_thread == Some(std::thread::current().id()))
            .unwrap_or(false);
        if reentrant {
            tracing::error!("PeriodicTask::stop() called from its own callback; use async_stop()");
            self.async_stop();
            return;
        }
        if !self.inner.begin_stop() {
            return;
        }
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        while self.inner.status.load(Ordering::SeqCst) != STOPPED {
            state = match self.inner.stopped.wait(state) {
                Ok(g) => g,
                Err(_) => return,
            };
        }
    }

    /// Request a stop and return immediately. Safe from inside the callback.
    pub fn async_stop(&self) {
        self.inner.begin_stop();
    }
}

impl Default for PeriodicTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.async_stop();
    }
}

impl TaskInner {
    /// Move to `Stopping` and cancel the pending fire. Returns false when
    /// already stopped. The fire future's completion settles the final
    /// `Stopped` transition, covering both the canceled-before-dispatch and
    /// the mid-callback case.
    fn begin_stop(self: &Arc<Self>) -> bool {
        loop {
            let current = self.status.load(Ordering::SeqCst);
            if current == STOPPED || current == STOPPING {
                return false;
            }
            if self
                .status
                .compare_exchange(current, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        let scheduled = self
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.scheduled.take());
        let this = self.clone();
        let settle = move || {
            this.status.store(STOPPED, Ordering::SeqCst);
            // Bracket the store with the state lock so a stop() between its
            // status check and its wait cannot miss the notification.
            drop(this.state.lock());
            this.stopped.notify_all();
        };
        match scheduled {
            Some(f) => {
                f.cancel();
                f.on_complete(move |_| settle());
            }
            None => settle(),
        }
        true
    }

    fn schedule_fire(self: &Arc<Self>, delay: Duration) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(strand) = state.strand.clone() else {
            tracing::error!(name = %state.name, "PeriodicTask started without a strand");
            self.status.store(STOPPED, Ordering::SeqCst);
            return;
        };
        let this = self.clone();
        let fire = strand.schedule_delayed(move || this.fire(), delay);
        state.scheduled = Some(fire);
    }

    fn fire(self: Arc<Self>) {
        // A stop that lost the race against dispatch: do nothing; the fire
        // future completing settles the Stopped transition.
        if matches!(self.status.load(Ordering::SeqCst), STOPPING | STOPPED) {
            return;
        }
        self.status.store(RUNNING, Ordering::SeqCst);

        let (callback, compensate, period, name) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.firing_thread = Some(std::thread::current().id());
            (
                state.callback.clone(),
                state.compensate,
                state.period,
                state.name.clone(),
            )
        };
        let Some(callback) = callback else {
            return;
        };

        let began = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| callback()));
        let elapsed = began.elapsed();

        if let Ok(mut state) = self.state.lock() {
            state.firing_thread = None;
        }

        if let Err(panic) = outcome {
            tracing::warn!(
                name = %name,
                "periodic callback panicked, stopping task: {}",
                crate::runtime::strand::panic_message(&panic)
            );
            self.status.store(STOPPED, Ordering::SeqCst);
            self.stopped.notify_all();
            return;
        }

        if self.status.load(Ordering::SeqCst) == STOPPING {
            // begin_stop waits on the current fire future, which is the one
            // running us; returning completes it and settles Stopped.
            return;
        }

        let next = if compensate {
            period.saturating_sub(elapsed)
        } else {
            period
        };
        self.schedule_fire(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::Executor;
    use std::sync::atomic::AtomicUsize;

    fn strand() -> Strand {
        Strand::new(Executor::new(2).unwrap())
    }

    fn counting_task(strand: &Strand, period: Duration) -> (PeriodicTask, Arc<AtomicUsize>) {
        let task = PeriodicTask::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        task.set_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.set_strand(strand.clone());
        task.set_period(period);
        (task, count)
    }

    #[test_log::test]
    fn fires_periodically_and_stops() {
        let strand = strand();
        let (task, count) = counting_task(&strand, Duration::from_millis(10));
        task.start(true);
        assert!(task.is_running());
        std::thread::sleep(Duration::from_millis(100));
        task.stop();
        assert!(!task.is_running());
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "expected several fires, got {}", after_stop);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_stop, "fired after stop");
    }

    #[test_log::test]
    fn immediate_start_fires_without_delay() {
        let strand = strand();
        let (task, count) = counting_task(&strand, Duration::from_secs(60));
        task.start(true);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        task.stop();
    }

    #[test_log::test]
    fn non_immediate_start_waits_one_period() {
        let strand = strand();
        let (task, count) = counting_task(&strand, Duration::from_secs(60));
        task.start(false);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        task.stop();
    }

    #[test_log::test]
    fn trigger_fires_now_only_when_running() {
        let strand = strand();
        let (task, count) = counting_task(&strand, Duration::from_secs(60));
        // Not started: no-op.
        task.trigger();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        task.start(false);
        task.trigger();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        task.stop();
    }

    #[test_log::test]
    fn panicking_callback_stops_task() {
        let strand = strand();
        let task = PeriodicTask::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        task.set_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            panic!("callback failure");
        });
        task.set_strand(strand);
        task.set_period(Duration::from_millis(5));
        task.start(true);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[test_log::test]
    fn async_stop_from_callback() {
        let strand = strand();
        let task = Arc::new(PeriodicTask::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let t = Arc::downgrade(&task);
        task.set_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(task) = t.upgrade() {
                task.async_stop();
            }
        });
        task.set_strand(strand);
        task.set_period(Duration::from_millis(5));
        task.start(true);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!task.is_running());
    }

    #[test_log::test]
    fn restart_after_stop() {
        let strand = strand();
        let (task, count) = counting_task(&strand, Duration::from_millis(10));
        task.start(true);
        std::thread::sleep(Duration::from_millis(30));
        task.stop();
        let between = count.load(Ordering::SeqCst);
        task.start(true);
        std::thread::sleep(Duration::from_millis(30));
        task.stop();
        assert!(count.load(Ordering::SeqCst) > between);
    }
}
