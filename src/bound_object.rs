//! Bound objects: the server-side dispatch surface.
//!
//! A [`BoundObject`] translates wire messages into invocations on one local
//! object. For every socket it has seen it tracks two maps:
//!
//! - signal links: `remote link id → (local link id, signal id)` for every
//!   signal the socket subscribed to via `registerEvent`;
//! - in-flight calls: `message id → (future, cancel count)` for every Call
//!   whose reply has not been sent.
//!
//! Both are purged when the socket disconnects: links are disconnected,
//! pending futures cancelled.
//!
//! ## Self-interface
//!
//! Action ids below [`SELF_METHOD_END`](crate::types::object::SELF_METHOD_END)
//! address the bound object itself rather than the hosted object:
//!
//! | id | method |
//! |----|--------|
//! | 0 | `registerEvent(object, signal, remoteLink) → link` |
//! | 1 | `unregisterEvent(object, signal, remoteLink)` |
//! | 2 | `metaObject(object) → MetaObject` |
//! | 3 | `terminate(object)` |
//! | 5 | `property(key) → value` |
//! | 6 | `setProperty(key, value)` |
//! | 7 | `properties() → [name]` |
//! | 8 | `registerEventWithSignature(object, signal, remoteLink, signature) → link` |
//!
//! Self-interface calls always run inline on the dispatch thread and receive
//! the calling socket as an explicit [`CallContext`] argument.
//!
//! ## Cancellation
//!
//! A `Cancel` message increments the call's cancel count and cancels its
//! future. When a method returns an inner future, the count is the shared
//! budget between the reply adapter and the cancel path: whoever decrements
//! it successfully forwards exactly one `cancel()` into the inner future, so
//! outer + inner cancellations always equal the number of Cancel messages.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::future::{Future, FutureState, Promise};
use crate::object_host::ObjectHost;
use crate::runtime::Executor;
use crate::signal::{CallType, SignalLink, SignalSubscriber};
use crate::transport::{SocketId, TransportSocket};
use crate::types::object::{AnyObject, CallContext, MetaMethod, MetaObject, SELF_METHOD_END};
use crate::types::signature::Signature;
use crate::types::value::AnyValue;
use crate::types::convert::convert_arguments;
use crate::wire::{Message, MessageAddress, MessageFlags, MessageKind, PROTOCOL_VERSION};

/// Self-interface action ids (stable across peers).
pub const ACTION_REGISTER_EVENT: u32 = 0;
pub const ACTION_UNREGISTER_EVENT: u32 = 1;
pub const ACTION_META_OBJECT: u32 = 2;
pub const ACTION_TERMINATE: u32 = 3;
pub const ACTION_GET_PROPERTY: u32 = 5;
pub const ACTION_SET_PROPERTY: u32 = 6;
pub const ACTION_PROPERTIES: u32 = 7;
pub const ACTION_REGISTER_EVENT_WITH_SIGNATURE: u32 = 8;

/// Object id of the main object of every service.
pub const MAIN_OBJECT_ID: u32 = 1;

/// Capability names recognized by the core.
pub const CAP_MESSAGE_FLAGS: &str = "MessageFlags";
pub const CAP_REMOTE_CANCELABLE_CALLS: &str = "RemoteCancelableCalls";

struct RemoteSignalLink {
    local_link: SignalLink,
    signal_id: u32,
}

struct InflightCall {
    future: Future<AnyValue>,
    cancel_count: Arc<AtomicU32>,
}

struct WatchedSocket {
    socket: Weak<TransportSocket>,
    disconnect_link: SignalLink,
}

#[derive(Default)]
struct BoundState {
    /// socket → remote link id → local subscription
    links: HashMap<SocketId, HashMap<u64, RemoteSignalLink>>,
    /// socket → message id → cancellable in-flight call
    inflight: HashMap<SocketId, HashMap<u32, InflightCall>>,
    watched: HashMap<SocketId, WatchedSocket>,
}

type DisconnectCallback = Arc<dyn Fn(SocketId, &str) + Send + Sync>;

/// Dispatch shim binding one object to the wire.
pub struct BoundObject {
    service: u32,
    object_id: u32,
    object: AnyObject,
    self_meta: MetaObject,
    call_type: CallType,
    executor: Executor,
    /// Sub-objects returned by methods, addressed by higher object ids.
    children: Arc<ObjectHost>,
    owner: Mutex<Weak<ObjectHost>>,
    state: Mutex<BoundState>,
    on_socket_disconnected_cb: Mutex<Option<DisconnectCallback>>,
}

impl BoundObject {
    pub fn new(
        service: u32,
        object_id: u32,
        object: AnyObject,
        call_type: CallType,
        executor: Executor,
    ) -> Arc<Self> {
        Arc::new(BoundObject {
            service,
            object_id,
            object,
            self_meta: self_interface_meta(),
            call_type,
            executor: executor.clone(),
            children: ObjectHost::new(service, executor),
            owner: Mutex::new(Weak::new()),
            state: Mutex::new(BoundState::default()),
            on_socket_disconnected_cb: Mutex::new(None),
        })
    }

    /// Bind `object` as the main object of `service`.
    pub fn main(
        service: u32,
        object: AnyObject,
        call_type: CallType,
        executor: Executor,
    ) -> Arc<Self> {
        Self::new(service, MAIN_OBJECT_ID, object, call_type, executor)
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    pub fn object(&self) -> &AnyObject {
        &self.object
    }

    pub(crate) fn set_owner(&self, owner: Weak<ObjectHost>) {
        if let Ok(mut slot) = self.owner.lock() {
            *slot = owner;
        }
    }

    /// Hook running after per-socket cleanup when a watched socket drops
    /// (the service directory unregisters the socket's services here).
    pub fn set_on_socket_disconnected<F>(&self, f: F)
    where
        F: Fn(SocketId, &str) + Send + Sync + 'static,
    {
        if let Ok(mut cb) = self.on_socket_disconnected_cb.lock() {
            *cb = Some(Arc::new(f));
        }
    }

    /// Entry point: one message received for this object (or a child) on
    /// `socket`.
    pub fn on_message(self: &Arc<Self>, msg: Message, socket: &Arc<TransportSocket>) {
        if msg.version != PROTOCOL_VERSION {
            let text = format!(
                "Cannot negotiate connection: remote end doesn't support protocol v{}",
                msg.version
            );
            tracing::warn!("{}", text);
            if msg.kind == MessageKind::Call {
                let mut ret = Message::response_to(msg.address, MessageKind::Reply);
                ret.set_error(text);
                self.send_reply(socket, ret);
            }
            return;
        }

        if msg.address.object > self.object_id {
            self.children.dispatch(msg, socket);
            return;
        }

        tracing::trace!(
            service = self.service,
            object = self.object_id,
            "msg {} ({} bytes)",
            msg.address,
            msg.payload.len()
        );

        match msg.kind {
            MessageKind::Call => self.handle_call(msg, socket),
            MessageKind::Post => self.handle_post(msg, socket),
            MessageKind::Cancel => self.handle_cancel(&msg, socket),
            other => {
                tracing::warn!("unexpected message kind {:?} on {}", other, msg.address);
            }
        }
    }

    // ------------------------------------------------------------------
    // Call path
    // ------------------------------------------------------------------

    fn handle_call(self: &Arc<Self>, msg: Message, socket: &Arc<TransportSocket>) {
        let address = msg.address;
        match self.prepare_call(&msg, socket) {
            Ok((future, declared, forced, cancel_count)) => {
                let bound = Arc::downgrade(self);
                let socket_weak = Arc::downgrade(socket);
                let socket_id = socket.id();
                future.on_complete(move |fut| {
                    reply_adapter(
                        &bound,
                        fut,
                        &declared,
                        forced.as_ref(),
                        &socket_weak,
                        socket_id,
                        address,
                        Some(&cancel_count),
                    );
                });
            }
            Err(e) => {
                // Per-call failure: the dispatch loop itself never aborts.
                tracing::debug!("call {} failed: {}", address, e);
                let mut ret = Message::response_to(address, MessageKind::Reply);
                ret.set_error(e.to_wire_string());
                self.send_reply(socket, ret);
            }
        }
    }

    /// Decode, convert, invoke, and register the in-flight entry.
    #[allow(clippy::type_complexity)]
    fn prepare_call(
        self: &Arc<Self>,
        msg: &Message,
        socket: &Arc<TransportSocket>,
    ) -> Result<(Future<AnyValue>, Signature, Option<Signature>, Arc<AtomicU32>)> {
        let action = msg.address.action;
        let is_self = action < SELF_METHOD_END;
        let method: MetaMethod = if is_self {
            self.self_meta
                .method(action)
                .cloned()
                .ok_or(Error::NoSuchMethod(action))?
        } else {
            self.object
                .meta_object()
                .method(action)
                .cloned()
                .ok_or(Error::NoSuchMethod(action))?
        };

        let (args, forced) = decode_arguments(msg, &method.parameters)?;
        let args = convert_arguments(args, &method.parameters)?;

        let future = if is_self {
            // Self-interface methods read the calling socket; always inline.
            match self.invoke_self(action, args, socket) {
                Ok(value) => Future::from_value(value),
                Err(e) => Future::from_error(e.to_wire_string()),
            }
        } else {
            self.invoke_user(action, args, CallContext::from_socket(socket.clone()))
        };

        let cancel_count = Arc::new(AtomicU32::new(0));
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::Call("bound object poisoned".into()));
            };
            tracing::trace!(
                "registering future for socket {:?}, message {}",
                socket.id(),
                msg.address.message_id
            );
            state.inflight.entry(socket.id()).or_default().insert(
                msg.address.message_id,
                InflightCall {
                    future: future.clone(),
                    cancel_count: cancel_count.clone(),
                },
            );
        }
        self.watch_socket(socket);

        Ok((future, method.returns.clone(), forced, cancel_count))
    }

    /// Run a user-object method honoring the bound call-type policy.
    fn invoke_user(
        self: &Arc<Self>,
        action: u32,
        args: Vec<AnyValue>,
        ctx: CallContext,
    ) -> Future<AnyValue> {
        match self.call_type {
            CallType::Direct => {
                let object = self.object.clone();
                match catch_unwind(AssertUnwindSafe(|| object.invoke(action, args, &ctx))) {
                    Ok(Ok(value)) => Future::from_value(value),
                    Ok(Err(e)) => Future::from_error(e.to_wire_string()),
                    Err(panic) => Future::from_error(format!(
                        "Uncaught error: {}",
                        crate::runtime::strand::panic_message(&panic)
                    )),
                }
            }
            CallType::Queued | CallType::Auto => {
                let promise = Promise::new();
                let completer = promise.clone();
                let object = self.object.clone();
                let run = move || {
                    match catch_unwind(AssertUnwindSafe(|| object.invoke(action, args, &ctx))) {
                        Ok(Ok(value)) => {
                            completer.set_value(value);
                        }
                        Ok(Err(e)) => {
                            completer.set_error(e.to_wire_string());
                        }
                        Err(panic) => {
                            completer.set_error(format!(
                                "Uncaught error: {}",
                                crate::runtime::strand::panic_message(&panic)
                            ));
                        }
                    }
                };
                match self.object.strand() {
                    Some(strand) => {
                        strand.schedule(run);
                    }
                    None => self.executor.post(run),
                }
                promise.future()
            }
        }
    }

    // ------------------------------------------------------------------
    // Post path
    // ------------------------------------------------------------------

    fn handle_post(self: &Arc<Self>, msg: Message, socket: &Arc<TransportSocket>) {
        let action = msg.address.action;
        let is_self = action < SELF_METHOD_END;
        let meta = if is_self {
            &self.self_meta
        } else {
            self.object.meta_object()
        };
        let parameters = if let Some(signal) = meta.signal(action) {
            signal.signature.clone()
        } else if let Some(method) = meta.method(action) {
            method.parameters.clone()
        } else {
            tracing::error!("no such signal/method on post message {}", msg.address);
            return;
        };

        let decoded = decode_arguments(&msg, &parameters)
            .and_then(|(args, _)| convert_arguments(args, &parameters));
        let args = match decoded {
            Ok(args) => args,
            Err(e) => {
                // No reply path for posts: log and drop.
                tracing::debug!("dropping post {}: {}", msg.address, e);
                return;
            }
        };

        if is_self {
            // Self-interface needs the calling socket, so never queued.
            if let Err(e) = self.invoke_self(action, args, socket) {
                tracing::debug!("self-interface post {} failed: {}", msg.address, e);
            }
            return;
        }
        if let Some(signal) = self.object.signal(action) {
            signal.emit(args);
            return;
        }
        let future = self.invoke_user(action, args, CallContext::from_socket(socket.clone()));
        let address = msg.address;
        future.on_complete(move |fut| {
            if let Some(message) = fut.error_message() {
                tracing::debug!("post {} failed: {}", address, message);
            }
        });
    }

    // ------------------------------------------------------------------
    // Cancel path
    // ------------------------------------------------------------------

    fn handle_cancel(self: &Arc<Self>, msg: &Message, socket: &Arc<TransportSocket>) {
        let target_id = match msg.value_as(&Signature::parse("I").unwrap_or_else(|_| Signature::dynamic())) {
            Ok(v) => match v.as_u32() {
                Some(id) => id,
                None => {
                    tracing::warn!("cancel payload is not a message id");
                    return;
                }
            },
            Err(e) => {
                tracing::warn!("malformed cancel message: {}", e);
                return;
            }
        };
        tracing::debug!("canceling call {} on socket {:?}", target_id, socket.id());

        let entry = {
            let Ok(state) = self.state.lock() else {
                return;
            };
            let Some(calls) = state.inflight.get(&socket.id()) else {
                tracing::debug!("socket {:?} not recorded", socket.id());
                return;
            };
            let Some(call) = calls.get(&target_id) else {
                // Completed (or never existed): silently drop.
                tracing::debug!("no recorded future for message {}", target_id);
                return;
            };
            (call.future.clone(), call.cancel_count.clone())
        };
        let (future, cancel_count) = entry;

        // Count the request, then cancel. The reply adapter balances the
        // count against the inner future on its side.
        cancel_count.fetch_add(1, Ordering::SeqCst);
        future.cancel();

        if future.state() == FutureState::FinishedWithValue {
            // The reply adapter has already run (or is running): it left the
            // entry in place only if the value is an inner future that we
            // may still have to cancel.
            self.remove_inflight(socket.id(), target_id);
            let Some(AnyValue::Future(inner)) = future.value_now() else {
                tracing::debug!("message {}: return value is not a future", target_id);
                return;
            };
            if try_take_cancel(&cancel_count) {
                tracing::info!("cancelled inner future of message {}", target_id);
                inner.cancel();
            }
        }
    }

    // ------------------------------------------------------------------
    // Self-interface
    // ------------------------------------------------------------------

    fn invoke_self(
        self: &Arc<Self>,
        action: u32,
        mut args: Vec<AnyValue>,
        socket: &Arc<TransportSocket>,
    ) -> Result<AnyValue> {
        match action {
            ACTION_REGISTER_EVENT => {
                let (object, signal, link) = event_args(&args)?;
                let local = self.register_event(object, signal, link, None, socket)?;
                Ok(AnyValue::uint64(local))
            }
            ACTION_REGISTER_EVENT_WITH_SIGNATURE => {
                let (object, signal, link) = event_args(&args)?;
                let signature = args
                    .get(3)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| Error::Protocol("missing signature argument".into()))?;
                let forced = if signature.is_empty() {
                    None
                } else {
                    Some(Signature::parse(&signature)?)
                };
                let local = self.register_event(object, signal, link, forced, socket)?;
                Ok(AnyValue::uint64(local))
            }
            ACTION_UNREGISTER_EVENT => {
                let (object, signal, link) = event_args(&args)?;
                self.unregister_event(object, signal, link, socket)?;
                Ok(AnyValue::Void)
            }
            ACTION_META_OBJECT => {
                let merged = MetaObject::merge(&self.self_meta, self.object.meta_object());
                Ok(merged.to_value())
            }
            ACTION_TERMINATE => {
                self.terminate();
                Ok(AnyValue::Void)
            }
            ACTION_GET_PROPERTY => {
                let key = take_arg(&mut args, 0).unwrap_dynamic();
                self.object.property(&key)
            }
            ACTION_SET_PROPERTY => {
                let key = take_arg(&mut args, 0).unwrap_dynamic();
                let value = take_arg(&mut args, 1);
                self.object.set_property(&key, value)?;
                Ok(AnyValue::Void)
            }
            ACTION_PROPERTIES => {
                let names = self
                    .object
                    .meta_object()
                    .properties()
                    .map(|p| AnyValue::str(&p.name))
                    .collect();
                Ok(AnyValue::List(names))
            }
            other => Err(Error::NoSuchMethod(other)),
        }
    }

    /// Subscribe a bridge that forwards each emission to `socket` as an
    /// Event message, recording the link under the subscribing socket.
    fn register_event(
        self: &Arc<Self>,
        _object_id: u32,
        signal_id: u32,
        remote_link: u64,
        forced: Option<Signature>,
        socket: &Arc<TransportSocket>,
    ) -> Result<SignalLink> {
        let meta_signal = self
            .object
            .meta_object()
            .signal(signal_id)
            .cloned()
            .ok_or(Error::NoSuchSignal(signal_id))?;
        let signal = self
            .object
            .signal(signal_id)
            .ok_or(Error::NoSuchSignal(signal_id))?;

        let service = self.service;
        let object = self.object_id;
        let socket_weak = Arc::downgrade(socket);
        let declared = meta_signal.signature.clone();
        let bridge = SignalSubscriber::callback(move |args| {
            forward_event(
                args,
                service,
                object,
                signal_id,
                &declared,
                forced.as_ref(),
                &socket_weak,
            );
        });
        let local_link = signal.connect(bridge)?;
        tracing::debug!(
            "registerEvent: remote link {} → local link {} (signal {})",
            remote_link,
            local_link,
            signal_id
        );

        {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::Call("bound object poisoned".into()));
            };
            state.links.entry(socket.id()).or_default().insert(
                remote_link,
                RemoteSignalLink {
                    local_link,
                    signal_id,
                },
            );
        }
        self.watch_socket(socket);
        Ok(local_link)
    }

    fn unregister_event(
        self: &Arc<Self>,
        object_id: u32,
        _signal_id: u32,
        remote_link: u64,
        socket: &Arc<TransportSocket>,
    ) -> Result<()> {
        let removed = {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::Call("bound object poisoned".into()));
            };
            let removed = state
                .links
                .get_mut(&socket.id())
                .and_then(|l| l.remove(&remote_link));
            let now_empty = state
                .links
                .get(&socket.id())
                .is_some_and(HashMap::is_empty);
            if now_empty {
                state.links.remove(&socket.id());
            }
            removed
        };
        let Some(link) = removed else {
            let text = format!(
                "Unregister request failed for {} {}",
                remote_link, object_id
            );
            tracing::error!("{}", text);
            return Err(Error::Call(text));
        };
        if let Some(signal) = self.object.signal(link.signal_id) {
            signal.disconnect(link.local_link);
        }
        Ok(())
    }

    /// Drop this object from its owner, releasing the last reference.
    fn terminate(self: &Arc<Self>) {
        tracing::debug!("terminate() received for object {}", self.object_id);
        let owner = self.owner.lock().ok().and_then(|o| o.upgrade());
        match owner {
            Some(owner) => {
                owner.remove_object(self.object_id);
            }
            None => {
                tracing::warn!("terminate() received on object without owner");
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    /// Subscribe once to the socket's `disconnected` signal.
    fn watch_socket(self: &Arc<Self>, socket: &Arc<TransportSocket>) {
        {
            let Ok(state) = self.state.lock() else {
                return;
            };
            if state.watched.contains_key(&socket.id()) {
                return;
            }
        }
        let weak = Arc::downgrade(self);
        let socket_id = socket.id();
        let link = socket
            .disconnected
            .connect(SignalSubscriber::callback(move |args| {
                let error = args
                    .first()
                    .and_then(|a| a.as_str())
                    .unwrap_or("disconnected")
                    .to_string();
                if let Some(bound) = weak.upgrade() {
                    bound.on_socket_disconnected(socket_id, &error);
                }
            }));
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("failed to watch socket {:?}: {}", socket_id, e);
                return;
            }
        };
        if let Ok(mut state) = self.state.lock() {
            state.watched.insert(
                socket_id,
                WatchedSocket {
                    socket: Arc::downgrade(socket),
                    disconnect_link: link,
                },
            );
        }
        // The disconnect may have fired before the subscription landed; a
        // dead socket would then never clean up.
        if !socket.is_connected() {
            self.on_socket_disconnected(socket_id, "disconnected before watch");
        }
    }

    /// Purge every per-socket structure for a dead socket. Idempotent.
    pub fn on_socket_disconnected(self: &Arc<Self>, socket_id: SocketId, error: &str) {
        let (links, inflight) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.watched.remove(&socket_id);
            (
                state.links.remove(&socket_id),
                state.inflight.remove(&socket_id),
            )
        };
        if let Some(links) = links {
            for (_, link) in links {
                if let Some(signal) = self.object.signal(link.signal_id) {
                    signal.async_disconnect(link.local_link);
                }
            }
        }
        if let Some(inflight) = inflight {
            for (_, call) in inflight {
                call.future.cancel();
            }
        }
        self.children.on_socket_disconnected(socket_id, error);
        let cb = self
            .on_socket_disconnected_cb
            .lock()
            .ok()
            .and_then(|cb| cb.clone());
        if let Some(cb) = cb {
            cb(socket_id, error);
        }
    }

    fn remove_inflight(&self, socket_id: SocketId, message_id: u32) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(calls) = state.inflight.get_mut(&socket_id) {
            calls.remove(&message_id);
            if calls.is_empty() {
                state.inflight.remove(&socket_id);
            }
        }
    }

    /// In-flight call count for one socket (tests, diagnostics).
    pub fn inflight_count(&self, socket_id: SocketId) -> usize {
        self.state
            .lock()
            .map(|s| s.inflight.get(&socket_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// Signal-link count for one socket (tests, diagnostics).
    pub fn link_count(&self, socket_id: SocketId) -> usize {
        self.state
            .lock()
            .map(|s| s.links.get(&socket_id).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    /// In-flight calls across every socket.
    pub fn total_inflight_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.inflight.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    /// Signal links across every socket.
    pub fn total_link_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.links.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    pub(crate) fn children(&self) -> &Arc<ObjectHost> {
        &self.children
    }

    fn send_reply(&self, socket: &Arc<TransportSocket>, message: Message) {
        if let Err(e) = socket.send(message) {
            tracing::warn!("can't send answer: {}", e);
        }
    }

    /// Disconnect every recorded link and cancel every pending call.
    fn teardown(&self) {
        let (links, inflight) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            (
                std::mem::take(&mut state.links),
                std::mem::take(&mut state.inflight),
            )
        };
        for (_, socket_links) in links {
            for (_, link) in socket_links {
                if let Some(signal) = self.object.signal(link.signal_id) {
                    signal.async_disconnect(link.local_link);
                }
            }
        }
        for (_, calls) in inflight {
            for (_, call) in calls {
                call.future.cancel();
            }
        }
        if let Ok(mut state) = self.state.lock() {
            for (_, watched) in state.watched.drain() {
                if let Some(socket) = watched.socket.upgrade() {
                    socket.disconnected.async_disconnect(watched.disconnect_link);
                }
            }
        }
    }
}

impl Drop for BoundObject {
    fn drop(&mut self) {
        self.teardown();
        self.children.clear();
    }
}

// ============================================================================
// FREE HELPERS
// ============================================================================

/// Decode the argument pack of a Call/Post, honoring `DYNAMIC_PAYLOAD` and
/// peeling the `RETURN_TYPE` suffix.
fn decode_arguments(
    msg: &Message,
    parameters: &Signature,
) -> Result<(Vec<AnyValue>, Option<Signature>)> {
    let mut expected = parameters.clone();
    if msg.flags.has(MessageFlags::DYNAMIC_PAYLOAD) {
        expected = Signature::dynamic();
    }
    if msg.flags.has(MessageFlags::RETURN_TYPE) {
        let wrapped = expected.with_appended_string();
        let AnyValue::Tuple(mut members) = msg.value_as(&wrapped)? else {
            return Err(Error::Protocol("malformed return-type payload".into()));
        };
        let forced_text = members
            .pop()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Protocol("missing return signature".into()))?;
        let forced = if forced_text.is_empty() {
            None
        } else {
            Some(Signature::parse(&forced_text)?)
        };
        let args = if expected.tuple_members().is_some() {
            members
        } else {
            // A single non-tuple slot (dynamic or scalar) was wrapped.
            members
                .pop()
                .map(AnyValue::into_arguments)
                .unwrap_or_default()
        };
        return Ok((args, forced));
    }
    Ok((msg.value_as(&expected)?.into_arguments(), None))
}

fn take_arg(args: &mut [AnyValue], index: usize) -> AnyValue {
    args.get_mut(index)
        .map(|v| std::mem::replace(v, AnyValue::Void))
        .unwrap_or(AnyValue::Void)
}

fn event_args(args: &[AnyValue]) -> Result<(u32, u32, u64)> {
    let bad = || Error::Protocol("malformed registerEvent arguments".into());
    let object = args.first().and_then(AnyValue::as_u32).ok_or_else(bad)?;
    let signal = args.get(1).and_then(AnyValue::as_u32).ok_or_else(bad)?;
    let link = args
        .get(2)
        .and_then(AnyValue::as_i64)
        .map(|v| v as u64)
        .ok_or_else(bad)?;
    Ok((object, signal, link))
}

/// Decrement the cancel budget once; true when this caller owns a cancel.
fn try_take_cancel(count: &AtomicU32) -> bool {
    loop {
        let current = count.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if count
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

/// Encode one signal emission as an Event message on the subscribing socket.
///
/// Tries the caller-requested signature first (when the peer understands
/// flagged payloads), then the declared one, then a dynamic payload.
fn forward_event(
    args: &[AnyValue],
    service: u32,
    object: u32,
    signal_id: u32,
    declared: &Signature,
    forced: Option<&Signature>,
    socket: &Weak<TransportSocket>,
) {
    let Some(socket) = socket.upgrade() else {
        // Socket already gone; disconnect cleanup will drop this bridge.
        return;
    };
    let mut msg = Message::new(
        MessageKind::Event,
        MessageAddress {
            service,
            object,
            action: signal_id,
            message_id: socket.next_message_id(),
        },
    );
    let pack = AnyValue::Tuple(args.to_vec());

    let mut encoded = false;
    if let Some(forced) = forced {
        if socket.remote_capability(CAP_MESSAGE_FLAGS, false) {
            if let Ok(converted) = crate::types::convert::convert(pack.clone(), forced) {
                if msg.set_dynamic_value(converted).is_ok() {
                    encoded = true;
                }
            }
            if !encoded {
                tracing::debug!("event conversion to requested signature {} failed", forced);
            }
        }
    }
    if !encoded && msg.set_value(pack.clone(), declared).is_err() {
        if socket.remote_capability(CAP_MESSAGE_FLAGS, false) {
            if let Err(e) = msg.set_dynamic_value(pack) {
                tracing::warn!("cannot encode event for signal {}: {}", signal_id, e);
                return;
            }
        } else {
            tracing::warn!(
                "cannot encode event for signal {} with signature {}",
                signal_id,
                declared
            );
            return;
        }
    }
    if let Err(e) = socket.send(msg) {
        tracing::debug!("failed to forward event: {}", e);
    }
}

/// Build a response once the call's future settles and send it.
///
/// When the value is itself a future, reply only when *that* completes; the
/// in-flight entry stays registered so a racing Cancel can still find it,
/// and the shared cancel budget decides who forwards cancellation inward.
#[allow(clippy::too_many_arguments)]
fn reply_adapter(
    bound: &Weak<BoundObject>,
    future: &Future<AnyValue>,
    declared: &Signature,
    forced: Option<&Signature>,
    socket: &Weak<TransportSocket>,
    socket_id: SocketId,
    address: MessageAddress,
    cancel_count: Option<&Arc<AtomicU32>>,
) {
    let mut ret = Message::response_to(address, MessageKind::Reply);
    match future.state() {
        FutureState::FinishedWithError => {
            ret.set_error(future.error_message().unwrap_or_default());
        }
        FutureState::Canceled => {
            tracing::debug!("call {} was cancelled", address.message_id);
            set_canceled(&mut ret, socket);
        }
        FutureState::FinishedWithValue => {
            let Some(value) = future.value_now() else {
                ret.set_error("Uncaught error: future value vanished");
                remove_and_send(bound, socket, socket_id, address, ret);
                return;
            };
            if let AnyValue::Future(inner) = value {
                // Second bounce: reply when the inner future completes.
                let bound = bound.clone();
                let socket_cb = socket.clone();
                let declared = declared.clone();
                let forced_owned = forced.cloned();
                inner.on_complete(move |inner_fut| {
                    reply_adapter_next(
                        &bound,
                        inner_fut,
                        &declared,
                        forced_owned.as_ref(),
                        &socket_cb,
                        socket_id,
                        address,
                    );
                });
                // Balance cancels requested before we registered the inner
                // continuation.
                if let Some(count) = cancel_count {
                    if try_take_cancel(count) {
                        tracing::debug!("cancel requested for call {}", address.message_id);
                        inner.cancel();
                    }
                }
                return;
            }
            encode_result(&mut ret, value, declared, forced, socket, bound);
        }
        FutureState::Running => return,
    }
    remove_and_send(bound, socket, socket_id, address, ret);
}

/// Second bounce of the reply adapter: the inner future completed.
#[allow(clippy::too_many_arguments)]
fn reply_adapter_next(
    bound: &Weak<BoundObject>,
    inner: &Future<AnyValue>,
    declared: &Signature,
    forced: Option<&Signature>,
    socket: &Weak<TransportSocket>,
    socket_id: SocketId,
    address: MessageAddress,
) {
    // Remove first: a Cancel arriving from here on observes an unknown
    // message id and drops silently.
    if let Some(bound) = bound.upgrade() {
        bound.remove_inflight(socket_id, address.message_id);
    }
    let mut ret = Message::response_to(address, MessageKind::Reply);
    match inner.state() {
        FutureState::FinishedWithError => {
            ret.set_error(inner.error_message().unwrap_or_default());
        }
        FutureState::Canceled => {
            tracing::debug!("call {} has been canceled", address.message_id);
            set_canceled(&mut ret, socket);
        }
        FutureState::FinishedWithValue => match inner.value_now() {
            Some(value) => encode_result(&mut ret, value, declared, forced, socket, bound),
            None => ret.set_error("Unknown error caught while forwarding the answer"),
        },
        FutureState::Running => return,
    }
    if let Some(socket) = socket.upgrade() {
        if let Err(e) = socket.send(ret) {
            tracing::warn!("can't send answer for address {}: {}", address, e);
        }
    }
}

fn set_canceled(ret: &mut Message, socket: &Weak<TransportSocket>) {
    let cancelable = socket
        .upgrade()
        .map(|s| s.shared_capability(CAP_REMOTE_CANCELABLE_CALLS, false))
        .unwrap_or(false);
    if cancelable {
        ret.kind = MessageKind::Canceled;
    } else {
        ret.set_error(Error::Canceled.to_wire_string());
    }
}

/// Result conversion cascade: requested signature (peer permitting) →
/// declared signature → dynamic payload.
fn encode_result(
    ret: &mut Message,
    value: AnyValue,
    declared: &Signature,
    forced: Option<&Signature>,
    socket: &Weak<TransportSocket>,
    bound: &Weak<BoundObject>,
) {
    // A returned live object becomes a hosted sub-object.
    let value = match value {
        AnyValue::Object(object) => match bound.upgrade() {
            Some(bound) => {
                let id = bound.children().host_object(object);
                AnyValue::ObjectRef {
                    service: bound.service(),
                    object: id,
                }
            }
            None => {
                ret.set_error("Uncaught error: object host destroyed");
                return;
            }
        },
        other => other,
    };

    let peer_flags = socket
        .upgrade()
        .map(|s| s.remote_capability(CAP_MESSAGE_FLAGS, false))
        .unwrap_or(false);
    if let Some(forced) = forced {
        if peer_flags {
            if let Ok(converted) = crate::types::convert::convert(value.clone(), forced) {
                if ret.set_dynamic_value(converted).is_ok() {
                    return;
                }
            }
            tracing::debug!("conversion to requested signature {} failed", forced);
        }
    }
    if ret.set_value(value.clone(), declared).is_ok() {
        return;
    }
    if let Err(e) = ret.set_dynamic_value(value) {
        ret.set_error(format!("Uncaught error: {}", e));
    }
}

fn remove_and_send(
    bound: &Weak<BoundObject>,
    socket: &Weak<TransportSocket>,
    socket_id: SocketId,
    address: MessageAddress,
    ret: Message,
) {
    if let Some(bound) = bound.upgrade() {
        bound.remove_inflight(socket_id, address.message_id);
    }
    if let Some(socket) = socket.upgrade() {
        if let Err(e) = socket.send(ret) {
            tracing::warn!("can't send answer for address {}: {}", address, e);
        }
    }
}

/// Reflection data for the self-interface.
fn self_interface_meta() -> MetaObject {
    let mut meta = MetaObject::default();
    let mut add = |uid: u32, name: &str, params: &str, returns: &str| {
        if let (Ok(parameters), Ok(returns)) = (Signature::parse(params), Signature::parse(returns))
        {
            meta.add_method(MetaMethod {
                uid,
                name: name.to_string(),
                parameters,
                returns,
            });
        }
    };
    add(ACTION_REGISTER_EVENT, "registerEvent", "(IIL)", "L");
    add(ACTION_UNREGISTER_EVENT, "unregisterEvent", "(IIL)", "v");
    add(ACTION_META_OBJECT, "metaObject", "(I)", MetaObject::SIGNATURE);
    add(ACTION_TERMINATE, "terminate", "(I)", "v");
    add(ACTION_GET_PROPERTY, "property", "(m)", "m");
    add(ACTION_SET_PROPERTY, "setProperty", "(mm)", "v");
    add(ACTION_PROPERTIES, "properties", "()", "[s]");
    add(
        ACTION_REGISTER_EVENT_WITH_SIGNATURE,
        "registerEventWithSignature",
        "(IILs)",
        "L",
    );
    meta
}
