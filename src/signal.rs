//! In-process signals.
//!
//! A [`Signal`] is an arity-checked, thread-safe publish/subscribe primitive.
//! Subscribers are free callbacks or weak references to an object method;
//! each carries its own threading model:
//!
//! | [`CallType`] | Behavior |
//! |---|---|
//! | `Direct` | handler runs on the emitting thread |
//! | `Queued` | handler is posted to the subscriber's strand (or the signal executor) |
//! | `Auto` | defer to the trigger's call type, then the signal default |
//!
//! Disconnection is cooperative: `disconnect` flips the subscriber's
//! `enabled` flag and then waits for every thread currently inside the
//! handler — except when the only active thread is the caller's own (a
//! handler disconnecting itself), which returns immediately to avoid
//! self-deadlock.
//!
//! The `on_subscribers` hook fires with `true` on the first connect and
//! `false` on the last disconnect; the remote-signal bridge uses it to
//! subscribe lazily.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::ThreadId;

use crate::error::{Error, Result};
use crate::runtime::{Executor, Strand};
use crate::types::object::{AnyObject, CallContext, DynamicObject};
use crate::types::signature::Signature;
use crate::types::value::AnyValue;

/// Identifier of one signal connection.
pub type SignalLink = u64;

/// Link id that never identifies a live connection.
pub const INVALID_SIGNAL_LINK: SignalLink = u64::MAX;

/// Threading model of a subscriber, an emission, or a bound object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallType {
    /// Defer to the next level (emission → signal default → direct).
    #[default]
    Auto,
    /// Execute inline on the current thread.
    Direct,
    /// Execute on the target's strand / executor.
    Queued,
}

/// Global link id allocator (one sequence per process, like message ids).
static LINK_UID: AtomicU64 = AtomicU64::new(1);

/// A typed in-process event source. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    /// Parameter tuple signature, or dynamic for unchecked signals.
    signature: Signature,
    state: Mutex<SignalState>,
}

type OnSubscribers = Arc<dyn Fn(bool) + Send + Sync>;

struct SignalState {
    subscribers: BTreeMap<SignalLink, Arc<SignalSubscriber>>,
    on_subscribers: Option<OnSubscribers>,
    default_call_type: CallType,
    /// Fallback executor for queued subscribers without a strand.
    executor: Option<Executor>,
}

/// One connection to a signal.
pub struct SignalSubscriber {
    link: SignalLink,
    target: SubscriberTarget,
    call_type: CallType,
    strand: Option<Strand>,
    declared_signature: Option<Signature>,
    /// Signal this subscriber is connected to, for self-disconnection.
    source: Mutex<Weak<SignalInner>>,
    state: Mutex<SubscriberState>,
    inactive: Condvar,
}

struct SubscriberState {
    enabled: bool,
    /// Threads currently executing the handler (`wait_for_inactive`).
    active_threads: Vec<ThreadId>,
}

enum SubscriberTarget {
    Callback(Arc<dyn Fn(&[AnyValue]) + Send + Sync>),
    /// Weak object target; expiry disconnects the link on next emission.
    Object { object: Weak<dyn DynamicObject>, method: u32 },
}

impl SignalSubscriber {
    /// A dynamically typed callback: no arity or signature checking.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&[AnyValue]) + Send + Sync + 'static,
    {
        Self::build(SubscriberTarget::Callback(Arc::new(f)), None)
    }

    /// A callback declaring its parameter tuple; checked at connect time.
    pub fn typed_callback<F>(signature: Signature, f: F) -> Self
    where
        F: Fn(&[AnyValue]) + Send + Sync + 'static,
    {
        Self::build(SubscriberTarget::Callback(Arc::new(f)), Some(signature))
    }

    /// A weak object-method target. The declared signature is the method's
    /// parameter tuple; an expired target disconnects itself.
    pub fn object(object: &AnyObject, method: u32) -> Self {
        let declared = object
            .meta_object()
            .method(method)
            .map(|m| m.parameters.clone());
        Self::build(
            SubscriberTarget::Object {
                object: Arc::downgrade(object),
                method,
            },
            declared,
        )
    }

    fn build(target: SubscriberTarget, declared_signature: Option<Signature>) -> Self {
        SignalSubscriber {
            link: INVALID_SIGNAL_LINK,
            target,
            call_type: CallType::Auto,
            strand: None,
            declared_signature,
            source: Mutex::new(Weak::new()),
            state: Mutex::new(SubscriberState {
                enabled: true,
                active_threads: Vec::new(),
            }),
            inactive: Condvar::new(),
        }
    }

    /// Override the threading model for this subscriber.
    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = call_type;
        self
    }

    /// Queue handler executions on `strand`.
    pub fn with_strand(mut self, strand: Strand) -> Self {
        self.strand = Some(strand);
        self
    }

    fn signature(&self) -> Option<&Signature> {
        self.declared_signature.as_ref()
    }

    /// Run the handler with enabled/active bookkeeping, panics contained.
    fn invoke(self: &Arc<Self>, args: &[AnyValue]) {
        let tid = std::thread::current().id();
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            // verify-enabled-then-register-active must be one locked step
            if !state.enabled {
                return;
            }
            state.active_threads.push(tid);
        }

        let outcome = match &self.target {
            SubscriberTarget::Callback(f) => catch_unwind(AssertUnwindSafe(|| f(args))),
            SubscriberTarget::Object { object, method } => match object.upgrade() {
                Some(object) => {
                    let method = *method;
                    let args = args.to_vec();
                    catch_unwind(AssertUnwindSafe(move || {
                        object.post(method, args, &CallContext::local());
                    }))
                }
                None => Ok(()),
            },
        };
        if let Err(panic) = outcome {
            tracing::warn!(
                "panic in signal subscriber: {}",
                crate::runtime::strand::panic_message(&panic)
            );
        }

        if let Ok(mut state) = self.state.lock() {
            if let Some(pos) = state.active_threads.iter().position(|t| *t == tid) {
                state.active_threads.swap_remove(pos);
            }
        }
        self.inactive.notify_all();
    }

    /// Block until no thread is inside the handler, except when the only
    /// active thread is the caller's own (reentrant disconnect from inside
    /// the handler).
    fn wait_for_inactive(&self) {
        let tid = std::thread::current().id();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        loop {
            if state.active_threads.is_empty() {
                return;
            }
            if state.active_threads.len() == 1 && state.active_threads[0] == tid {
                // The one active callback is above us in the call stack.
                return;
            }
            state = match self.inactive.wait(state) {
                Ok(g) => g,
                Err(_) => return,
            };
        }
    }
}

impl Signal {
    /// A signal with the given parameter tuple signature.
    pub fn new(signature: Signature) -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                signature,
                state: Mutex::new(SignalState {
                    subscribers: BTreeMap::new(),
                    on_subscribers: None,
                    default_call_type: CallType::Auto,
                    executor: None,
                }),
            }),
        }
    }

    /// A signal accepting any argument pack (`m`).
    pub fn dynamic() -> Self {
        Self::new(Signature::dynamic())
    }

    /// The parameter signature.
    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    /// Default call type applied when neither subscriber nor trigger chose.
    pub fn set_call_type(&self, call_type: CallType) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.default_call_type = call_type;
        }
    }

    /// Executor for queued subscribers that have no strand of their own.
    pub fn set_executor(&self, executor: Executor) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.executor = Some(executor);
        }
    }

    /// Install the first-connect/last-disconnect hook.
    pub fn set_on_subscribers<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.inner.state.lock() {
            state.on_subscribers = Some(Arc::new(f));
        }
    }

    /// Connect a subscriber.
    ///
    /// Fails with [`ArityMismatch`](Error::ArityMismatch) when the declared
    /// parameter counts differ and with
    /// [`SignatureMismatch`](Error::SignatureMismatch) when the signal's
    /// parameters cannot convert to the subscriber's. Both checks are
    /// skipped when either side is dynamic.
    pub fn connect(&self, subscriber: SignalSubscriber) -> Result<SignalLink> {
        if !self.inner.signature.is_dynamic() {
            if let Some(sub_sig) = subscriber.signature() {
                let signal_arity = self.inner.signature.arity().unwrap_or(0);
                match sub_sig.arity() {
                    Some(sub_arity) if sub_arity != signal_arity => {
                        return Err(Error::ArityMismatch {
                            expected: signal_arity,
                            got: sub_arity,
                        });
                    }
                    _ => {}
                }
                if !self.inner.signature.is_convertible_to(sub_sig) {
                    return Err(Error::SignatureMismatch {
                        signal: self.inner.signature.to_string(),
                        subscriber: sub_sig.to_string(),
                    });
                }
            }
        }

        let link = LINK_UID.fetch_add(1, Ordering::SeqCst);
        let mut subscriber = subscriber;
        subscriber.link = link;
        if let Ok(mut source) = subscriber.source.lock() {
            *source = Arc::downgrade(&self.inner);
        }

        let hook = {
            let Ok(mut state) = self.inner.state.lock() else {
                return Err(Error::Call("signal poisoned".into()));
            };
            let first = state.subscribers.is_empty();
            state.subscribers.insert(link, Arc::new(subscriber));
            if first {
                state.on_subscribers.clone()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook(true);
        }
        Ok(link)
    }

    /// Disconnect a link, waiting for in-flight handler executions.
    pub fn disconnect(&self, link: SignalLink) -> bool {
        self.inner.disconnect_link(link, true)
    }

    /// Disconnect without waiting for in-flight handler executions.
    pub fn async_disconnect(&self, link: SignalLink) -> bool {
        self.inner.disconnect_link(link, false)
    }

    /// Disconnect every subscriber (waiting).
    pub fn disconnect_all(&self) {
        loop {
            let link = match self.inner.state.lock() {
                Ok(state) => match state.subscribers.keys().next() {
                    Some(link) => *link,
                    None => return,
                },
                Err(_) => return,
            };
            self.inner.disconnect_link(link, true);
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| !s.subscribers.is_empty())
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    /// Emit with an arity check against the signal signature; mismatched
    /// emissions are dropped with an error log (never a panic).
    pub fn emit(&self, args: Vec<AnyValue>) {
        if let Some(arity) = self.inner.signature.arity() {
            if args.len() != arity {
                tracing::error!(
                    "dropping emission: expected {} arguments for signature {}, got {}",
                    arity,
                    self.inner.signature,
                    args.len()
                );
                return;
            }
        }
        self.trigger(&args, CallType::Auto);
    }

    /// Emit to all current subscribers with an explicit call type.
    pub fn trigger(&self, args: &[AnyValue], call_type: CallType) {
        let (snapshot, default_ct, executor) = {
            let Ok(state) = self.inner.state.lock() else {
                return;
            };
            (
                state.subscribers.values().cloned().collect::<Vec<_>>(),
                state.default_call_type,
                state.executor.clone(),
            )
        };

        for sub in snapshot {
            // Expired weak targets are disconnected, not invoked.
            if let SubscriberTarget::Object { object, .. } = &sub.target {
                if object.strong_count() == 0 {
                    tracing::debug!("signal target vanished, disconnecting link {}", sub.link);
                    self.inner.disconnect_link(sub.link, false);
                    continue;
                }
            }

            let effective = match sub.call_type {
                CallType::Auto => match call_type {
                    CallType::Auto => default_ct,
                    other => other,
                },
                other => other,
            };
            let asynchronous = effective == CallType::Queued || sub.strand.is_some();

            if asynchronous {
                let strand = sub.strand.clone();
                let sub = sub.clone();
                let args = args.to_vec();
                let run = move || sub.invoke(&args);
                if let Some(strand) = strand {
                    strand.schedule(run);
                } else if let Some(executor) = &executor {
                    executor.post(run);
                } else {
                    // No queue available: degrade to direct.
                    run();
                }
            } else {
                sub.invoke(args);
            }
        }
    }
}

impl SignalInner {
    fn disconnect_link(self: &Arc<Self>, link: SignalLink, wait: bool) -> bool {
        let (sub, hook) = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            let Some(sub) = state.subscribers.remove(&link) else {
                return false;
            };
            let hook = if state.subscribers.is_empty() {
                state.on_subscribers.clone()
            } else {
                None
            };
            (sub, hook)
        };
        if let Ok(mut sub_state) = sub.state.lock() {
            sub_state.enabled = false;
        }
        if let Some(hook) = hook {
            hook(false);
        }
        if wait {
            sub.wait_for_inactive();
        }
        true
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("signature", &self.inner.signature.to_string())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sig(s: &str) -> Signature {
        Signature::parse(s).unwrap()
    }

    #[test_log::test]
    fn connect_checks_arity() {
        let signal = Signal::new(sig("(is)"));
        let err = signal
            .connect(SignalSubscriber::typed_callback(sig("(i)"), |_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { expected: 2, got: 1 }));
        assert!(signal
            .connect(SignalSubscriber::typed_callback(sig("(ls)"), |_| {}))
            .is_ok());
    }

    #[test_log::test]
    fn connect_checks_signature_convertibility() {
        let signal = Signal::new(sig("(s)"));
        let err = signal
            .connect(SignalSubscriber::typed_callback(sig("(i)"), |_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch { .. }));
    }

    #[test_log::test]
    fn dynamic_subscriber_skips_checks() {
        let signal = Signal::new(sig("(is)"));
        assert!(signal.connect(SignalSubscriber::callback(|_| {})).is_ok());
    }

    #[test_log::test]
    fn emission_reaches_subscribers_in_order() {
        let signal = Signal::new(sig("(i)"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        signal
            .connect(SignalSubscriber::callback(move |args| {
                s.lock().unwrap().push(args[0].as_i64().unwrap());
            }))
            .unwrap();
        for i in 0..5 {
            signal.emit(vec![AnyValue::int32(i)]);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test_log::test]
    fn wrong_arity_emission_is_dropped() {
        let signal = Signal::new(sig("(i)"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        signal
            .connect(SignalSubscriber::callback(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        signal.emit(vec![]);
        signal.emit(vec![AnyValue::int32(1), AnyValue::int32(2)]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn on_subscribers_fires_on_first_and_last() {
        let signal = Signal::new(sig("(i)"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        signal.set_on_subscribers(move |up| {
            e.lock().unwrap().push(up);
        });
        let l1 = signal.connect(SignalSubscriber::callback(|_| {})).unwrap();
        let l2 = signal.connect(SignalSubscriber::callback(|_| {})).unwrap();
        signal.disconnect(l1);
        signal.disconnect(l2);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    #[test_log::test]
    fn disconnected_subscriber_no_longer_fires() {
        let signal = Signal::new(sig("(i)"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let link = signal
            .connect(SignalSubscriber::callback(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        signal.emit(vec![AnyValue::int32(1)]);
        assert!(signal.disconnect(link));
        assert!(!signal.disconnect(link));
        signal.emit(vec![AnyValue::int32(2)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn handler_may_disconnect_itself() {
        let signal = Signal::new(sig("(i)"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let signal2 = signal.clone();
        let link = Arc::new(Mutex::new(INVALID_SIGNAL_LINK));
        let link2 = link.clone();
        let id = signal
            .connect(SignalSubscriber::callback(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                // Reentrant disconnect must not deadlock.
                signal2.disconnect(*link2.lock().unwrap());
            }))
            .unwrap();
        *link.lock().unwrap() = id;
        signal.emit(vec![AnyValue::int32(1)]);
        signal.emit(vec![AnyValue::int32(2)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn panicking_handler_is_contained() {
        let signal = Signal::new(sig("(i)"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        signal
            .connect(SignalSubscriber::callback(|_| panic!("handler bug")))
            .unwrap();
        signal
            .connect(SignalSubscriber::callback(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        signal.emit(vec![AnyValue::int32(1)]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn queued_subscriber_runs_on_strand() {
        let executor = Executor::new(2).unwrap();
        let strand = Strand::new(executor);
        let signal = Signal::new(sig("(i)"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        signal
            .connect(
                SignalSubscriber::callback(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .with_call_type(CallType::Queued)
                .with_strand(strand),
            )
            .unwrap();
        signal.emit(vec![AnyValue::int32(1)]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
