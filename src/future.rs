//! Single-assignment value cell with continuations.
//!
//! A [`Promise`] is the producer side, a [`Future`] the consumer side of a
//! write-once cell. The cell moves from `Running` to exactly one of
//! `FinishedWithValue`, `FinishedWithError` or `Canceled` and never changes
//! again.
//!
//! Cancellation is cooperative: [`Future::cancel`] records a request and runs
//! the promise's cancel handler if one was installed; the producer decides
//! whether to honour it (completing with `Canceled`) or finish normally.
//!
//! Continuations registered before completion run on the completing thread;
//! continuations registered after completion run synchronously on the
//! registering thread. [`Future`] also implements [`std::future::Future`], so
//! tokio tasks can `.await` it directly.
//!
//! Dropping every [`Promise`] clone without completing the cell completes it
//! with a "promise broken" error, so waiters never hang on a producer that
//! went away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Poll, Waker};
use std::time::Duration;

use crate::error::{Error, Result};

/// Observable state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Running,
    FinishedWithValue,
    FinishedWithError,
    Canceled,
}

enum Cell<T> {
    Running,
    Value(T),
    Error(String),
    Canceled,
}

type Continuation<T> = Box<dyn FnOnce(&Future<T>) + Send>;
type CancelHandler<T> = Arc<dyn Fn(&Promise<T>) + Send + Sync>;

struct Inner<T> {
    cell: Cell<T>,
    cancel_requested: bool,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
    cancel_handler: Option<CancelHandler<T>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    /// Live `Promise` clones; at zero with the cell still running the cell
    /// is completed with a broken-promise error.
    promises: AtomicUsize,
}

/// Producer side of the cell.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer side of the cell. Cheap to clone; all clones observe the same
/// completion.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// A promise whose future treats `cancel()` as purely advisory.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A promise that runs `handler` when its future is cancelled. The
    /// handler typically calls [`Promise::set_canceled`] or forwards the
    /// cancellation to whatever produces the value.
    pub fn with_cancel_handler<F>(handler: F) -> Self
    where
        F: Fn(&Promise<T>) + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(handler)))
    }

    fn build(handler: Option<CancelHandler<T>>) -> Self {
        Promise {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    cell: Cell::Running,
                    cancel_requested: false,
                    continuations: Vec::new(),
                    wakers: Vec::new(),
                    cancel_handler: handler,
                }),
                cond: Condvar::new(),
                promises: AtomicUsize::new(1),
            }),
        }
    }

    /// The future observing this promise.
    pub fn future(&self) -> Future<T> {
        Future {
            shared: self.shared.clone(),
        }
    }

    /// Complete with a value. Returns `false` if the cell was already set
    /// (multiple completers may race; first wins).
    pub fn set_value(&self, value: T) -> bool {
        complete(&self.shared, Cell::Value(value))
    }

    /// Complete with an error message.
    pub fn set_error(&self, message: impl Into<String>) -> bool {
        complete(&self.shared, Cell::Error(message.into()))
    }

    /// Complete as canceled.
    pub fn set_canceled(&self) -> bool {
        complete(&self.shared, Cell::Canceled)
    }

    /// True once the consumer has requested cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared
            .inner
            .lock()
            .map(|i| i.cancel_requested)
            .unwrap_or(false)
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.shared.promises.fetch_add(1, Ordering::SeqCst);
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.promises.fetch_sub(1, Ordering::SeqCst) == 1 {
            complete(&self.shared, Cell::Error(Error::PromiseBroken.to_string()));
        }
    }
}

/// Write the cell and fire continuations/wakers. First completion wins.
fn complete<T>(shared: &Arc<Shared<T>>, value: Cell<T>) -> bool {
    let (continuations, wakers) = {
        let Ok(mut inner) = shared.inner.lock() else {
            return false;
        };
        if !matches!(inner.cell, Cell::Running) {
            return false;
        }
        inner.cell = value;
        (
            std::mem::take(&mut inner.continuations),
            std::mem::take(&mut inner.wakers),
        )
    };
    shared.cond.notify_all();
    if !continuations.is_empty() {
        let fut = Future {
            shared: shared.clone(),
        };
        for c in continuations {
            c(&fut);
        }
    }
    for w in wakers {
        w.wake();
    }
    true
}

impl<T: Send + 'static> Future<T> {
    /// An already-completed future.
    pub fn from_value(value: T) -> Self {
        let p = Promise::new();
        p.set_value(value);
        p.future()
    }

    /// An already-errored future.
    pub fn from_error(message: impl Into<String>) -> Self {
        let p = Promise::<T>::new();
        p.set_error(message);
        p.future()
    }

    /// An already-canceled future.
    pub fn canceled() -> Self {
        let p = Promise::<T>::new();
        p.set_canceled();
        p.future()
    }

    /// Current state without blocking.
    pub fn state(&self) -> FutureState {
        match self.shared.inner.lock() {
            Ok(inner) => match inner.cell {
                Cell::Running => FutureState::Running,
                Cell::Value(_) => FutureState::FinishedWithValue,
                Cell::Error(_) => FutureState::FinishedWithError,
                Cell::Canceled => FutureState::Canceled,
            },
            Err(_) => FutureState::FinishedWithError,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state() != FutureState::Running
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == FutureState::Canceled
    }

    pub fn has_error(&self) -> bool {
        self.state() == FutureState::FinishedWithError
    }

    /// Block until completion or timeout; `None` waits forever. Returns the
    /// state observed when the wait ended (`Running` on timeout).
    pub fn wait(&self, timeout: Option<Duration>) -> FutureState {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let Ok(mut inner) = self.shared.inner.lock() else {
            return FutureState::FinishedWithError;
        };
        loop {
            match inner.cell {
                Cell::Running => {}
                Cell::Value(_) => return FutureState::FinishedWithValue,
                Cell::Error(_) => return FutureState::FinishedWithError,
                Cell::Canceled => return FutureState::Canceled,
            }
            match deadline {
                None => {
                    inner = match self.shared.cond.wait(inner) {
                        Ok(g) => g,
                        Err(_) => return FutureState::FinishedWithError,
                    };
                }
                Some(d) => {
                    let now = std::time::Instant::now();
                    if now >= d {
                        return FutureState::Running;
                    }
                    inner = match self.shared.cond.wait_timeout(inner, d - now) {
                        Ok((g, _)) => g,
                        Err(_) => return FutureState::FinishedWithError,
                    };
                }
            }
        }
    }

    /// Error text, if completed with an error.
    pub fn error_message(&self) -> Option<String> {
        match self.shared.inner.lock() {
            Ok(inner) => match &inner.cell {
                Cell::Error(m) => Some(m.clone()),
                _ => None,
            },
            Err(_) => None,
        }
    }

    /// Request cancellation. Advisory: sets the flag and runs the promise's
    /// cancel handler, if any. Completed futures are unaffected.
    pub fn cancel(&self) {
        let handler = {
            let Ok(mut inner) = self.shared.inner.lock() else {
                return;
            };
            if !matches!(inner.cell, Cell::Running) {
                return;
            }
            inner.cancel_requested = true;
            inner.cancel_handler.clone()
        };
        if let Some(handler) = handler {
            // Materialize a promise handle for the handler; the producer
            // still holds its own, so the count never hits zero here.
            self.shared.promises.fetch_add(1, Ordering::SeqCst);
            let promise = Promise {
                shared: self.shared.clone(),
            };
            handler(&promise);
        }
    }

    /// True once someone called [`cancel`](Self::cancel).
    pub fn is_cancel_requested(&self) -> bool {
        self.shared
            .inner
            .lock()
            .map(|i| i.cancel_requested)
            .unwrap_or(false)
    }

    /// Register a continuation. Runs inline if the future is already
    /// complete, otherwise on the completing thread.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        {
            let Ok(mut inner) = self.shared.inner.lock() else {
                return;
            };
            if matches!(inner.cell, Cell::Running) {
                inner.continuations.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Register a continuation that runs on `executor` instead of the
    /// completing thread.
    pub fn on_complete_on<F>(&self, executor: &crate::runtime::Executor, f: F)
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        let executor = executor.clone();
        self.on_complete(move |fut| {
            let fut = fut.clone();
            executor.post(move || f(&fut));
        });
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Block for completion and return the value, mapping error and
    /// cancellation states to [`Error`].
    pub fn result(&self) -> Result<T> {
        self.wait(None);
        let Ok(inner) = self.shared.inner.lock() else {
            return Err(Error::Call("future poisoned".into()));
        };
        match &inner.cell {
            Cell::Value(v) => Ok(v.clone()),
            Cell::Error(m) => Err(Error::from_wire_string(m.clone())),
            Cell::Canceled => Err(Error::Canceled),
            Cell::Running => unreachable!("wait(None) returned while running"),
        }
    }

    /// Completed value if available right now.
    pub fn value_now(&self) -> Option<T> {
        let inner = self.shared.inner.lock().ok()?;
        match &inner.cell {
            Cell::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Chain a transformation. Errors and cancellations pass through
    /// untouched; cancelling the returned future forwards the request to
    /// this one.
    pub fn then<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        let promise = Promise::with_cancel_handler(move |_: &Promise<U>| source.cancel());
        let completer = promise.clone();
        self.on_complete(move |fut| {
            let Ok(inner) = fut.shared.inner.lock() else {
                return;
            };
            match &inner.cell {
                Cell::Value(v) => {
                    let v = v.clone();
                    drop(inner);
                    completer.set_value(f(v));
                }
                Cell::Error(m) => {
                    let m = m.clone();
                    drop(inner);
                    completer.set_error(m);
                }
                Cell::Canceled => {
                    drop(inner);
                    completer.set_canceled();
                }
                Cell::Running => {}
            }
        });
        promise.future()
    }
}

impl<T: Clone + Send + 'static> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        let Ok(mut inner) = self.shared.inner.lock() else {
            return Poll::Ready(Err(Error::Call("future poisoned".into())));
        };
        match &inner.cell {
            Cell::Running => {
                let waker = cx.waker();
                if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
                    inner.wakers.push(waker.clone());
                }
                Poll::Pending
            }
            Cell::Value(v) => Poll::Ready(Ok(v.clone())),
            Cell::Error(m) => Poll::Ready(Err(Error::from_wire_string(m.clone()))),
            Cell::Canceled => Poll::Ready(Err(Error::Canceled)),
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.shared.inner.lock() {
            Ok(inner) => match inner.cell {
                Cell::Running => "Running",
                Cell::Value(_) => "FinishedWithValue",
                Cell::Error(_) => "FinishedWithError",
                Cell::Canceled => "Canceled",
            },
            Err(_) => "Poisoned",
        };
        write!(f, "Future({})", state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn value_flows_to_waiters() {
        let p = Promise::new();
        let f = p.future();
        let waiter = std::thread::spawn(move || f.result());
        std::thread::sleep(Duration::from_millis(20));
        assert!(p.set_value(7));
        assert_eq!(waiter.join().unwrap().unwrap(), 7);
    }

    #[test_log::test]
    fn first_completion_wins() {
        let p = Promise::new();
        assert!(p.set_value(1));
        assert!(!p.set_value(2));
        assert!(!p.set_error("late"));
        assert_eq!(p.future().result().unwrap(), 1);
    }

    #[test_log::test]
    fn wait_times_out_while_running() {
        let p = Promise::<i32>::new();
        let f = p.future();
        assert_eq!(f.wait(Some(Duration::from_millis(10))), FutureState::Running);
    }

    #[test_log::test]
    fn continuation_after_completion_runs_inline() {
        let p = Promise::new();
        p.set_value(3);
        let (tx, rx) = std::sync::mpsc::channel();
        p.future().on_complete(move |f| {
            tx.send(f.value_now().unwrap()).unwrap();
        });
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    #[test_log::test]
    fn cancel_runs_handler() {
        let p = Promise::<i32>::with_cancel_handler(|p| {
            p.set_canceled();
        });
        let f = p.future();
        f.cancel();
        assert_eq!(f.state(), FutureState::Canceled);
        assert!(matches!(f.result(), Err(Error::Canceled)));
    }

    #[test_log::test]
    fn cancel_without_handler_is_advisory() {
        let p = Promise::<i32>::new();
        let f = p.future();
        f.cancel();
        assert_eq!(f.state(), FutureState::Running);
        assert!(p.is_cancel_requested());
        p.set_value(9);
        assert_eq!(f.result().unwrap(), 9);
    }

    #[test_log::test]
    fn dropped_promise_breaks_future() {
        let p = Promise::<i32>::new();
        let f = p.future();
        drop(p);
        assert_eq!(f.state(), FutureState::FinishedWithError);
        assert!(f.error_message().unwrap().contains("Promise broken"));
    }

    #[test_log::test]
    fn then_propagates_error_and_cancel() {
        let p = Promise::<i32>::new();
        let mapped = p.future().then(|v| v * 2);
        p.set_error("boom");
        assert_eq!(mapped.state(), FutureState::FinishedWithError);

        let p2 = Promise::<i32>::with_cancel_handler(|p| {
            p.set_canceled();
        });
        let mapped2 = p2.future().then(|v| v + 1);
        mapped2.cancel();
        assert_eq!(p2.future().state(), FutureState::Canceled);
        assert_eq!(mapped2.state(), FutureState::Canceled);
    }

    #[test_log::test]
    fn then_maps_value() {
        let p = Promise::new();
        let mapped = p.future().then(|v: i32| v + 5);
        p.set_value(10);
        assert_eq!(mapped.result().unwrap(), 15);
    }

    #[test_log::test(tokio::test)]
    async fn awaitable_from_tokio() {
        let p = Promise::new();
        let f = p.future();
        let jh = tokio::spawn(async move { f.await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        p.set_value("done".to_string());
        assert_eq!(jh.await.unwrap().unwrap(), "done");
    }
}
