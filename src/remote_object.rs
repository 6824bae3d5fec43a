//! Client-side object proxies.
//!
//! A [`RemoteObject`] is the mirror image of a bound object: it turns typed
//! `call`/`post`/`subscribe` invocations into wire messages on a socket and
//! resolves replies back into futures.
//!
//! One socket carries traffic for many proxies (the directory proxy and any
//! number of service proxies share the connection to a machine), so inbound
//! routing goes through a per-socket [`ClientRouter`] keyed by
//! `(service, object)`.
//!
//! Cancellation: cancelling a call future sends a `Cancel` message carrying
//! the original message id; the reply (`Canceled` kind, or the fixed error
//! text from peers without the capability) settles the future.
//!
//! Signals: the proxy keeps one local [`Signal`] per remote signal and
//! bridges it lazily — the first subscriber triggers `registerEvent` on the
//! peer, the last disconnect triggers `unregisterEvent`. Incoming `Event`
//! messages are decoded and re-emitted locally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::bound_object::{
    ACTION_GET_PROPERTY, ACTION_META_OBJECT, ACTION_REGISTER_EVENT, ACTION_SET_PROPERTY,
    ACTION_UNREGISTER_EVENT, MAIN_OBJECT_ID,
};
use crate::error::{Error, Result};
use crate::future::{Future, Promise};
use crate::signal::{Signal, SignalLink, SignalSubscriber};
use crate::transport::TransportSocket;
use crate::types::convert::convert_arguments;
use crate::types::object::MetaObject;
use crate::types::signature::Signature;
use crate::types::value::AnyValue;
use crate::wire::{Message, MessageAddress, MessageFlags, MessageKind};

/// Routes inbound frames of one socket to the proxies living on it.
pub struct ClientRouter {
    objects: DashMap<(u32, u32), Weak<RemoteObjectInner>>,
}

impl ClientRouter {
    /// Create a router and install it as the socket's message handler.
    pub fn install(socket: &Arc<TransportSocket>) -> Arc<ClientRouter> {
        let router = Arc::new(ClientRouter {
            objects: DashMap::new(),
        });
        let weak = Arc::downgrade(&router);
        socket.set_message_handler(move |msg, _socket| {
            if let Some(router) = weak.upgrade() {
                router.route(msg);
            }
        });
        socket.start_reading();
        router
    }

    fn route(&self, msg: Message) {
        let key = (msg.address.service, msg.address.object);
        let target = self.objects.get(&key).and_then(|w| w.upgrade());
        match target {
            Some(object) => object.on_message(msg),
            None => {
                tracing::debug!("no proxy for message {}", msg.address);
                self.objects.retain(|_, w| w.strong_count() > 0);
            }
        }
    }
}

struct SignalBridge {
    signal: Signal,
    /// Links handed to subscribers, so unsubscribe can find the bridge.
    links: HashMap<SignalLink, ()>,
    registered: bool,
}

struct RemoteObjectInner {
    service: u32,
    object: u32,
    socket: Arc<TransportSocket>,
    meta: Mutex<Option<MetaObject>>,
    pending: DashMap<u32, Promise<AnyValue>>,
    signals: Mutex<HashMap<u32, SignalBridge>>,
}

/// Proxy for one object hosted by a peer.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteObjectInner>,
}

impl RemoteObject {
    /// Attach a proxy for `(service, object)` to a routed socket.
    pub fn new(
        router: &Arc<ClientRouter>,
        socket: Arc<TransportSocket>,
        service: u32,
        object: u32,
    ) -> RemoteObject {
        let inner = Arc::new(RemoteObjectInner {
            service,
            object,
            socket,
            meta: Mutex::new(None),
            pending: DashMap::new(),
            signals: Mutex::new(HashMap::new()),
        });
        router
            .objects
            .insert((service, object), Arc::downgrade(&inner));
        RemoteObject { inner }
    }

    /// Proxy for a service's main object.
    pub fn for_service(
        router: &Arc<ClientRouter>,
        socket: Arc<TransportSocket>,
        service: u32,
    ) -> RemoteObject {
        Self::new(router, socket, service, MAIN_OBJECT_ID)
    }

    pub fn service(&self) -> u32 {
        self.inner.service
    }

    /// Fetch (and cache) the remote meta object. Must complete before
    /// name-based calls resolve.
    pub fn fetch_meta_object(&self) -> Future<MetaObject> {
        let inner = self.inner.clone();
        self.inner
            .call_action(
                ACTION_META_OBJECT,
                vec![AnyValue::uint32(self.inner.object)],
                &params_signature("(I)"),
            )
            .then(move |value| {
                let meta = MetaObject::from_value(&value.clone().unwrap_dynamic());
                match meta {
                    Ok(meta) => {
                        if let Ok(mut slot) = inner.meta.lock() {
                            *slot = Some(meta.clone());
                        }
                        meta
                    }
                    Err(e) => {
                        tracing::warn!("malformed remote meta object: {}", e);
                        MetaObject::default()
                    }
                }
            })
    }

    /// The cached meta object.
    pub fn meta_object(&self) -> Option<MetaObject> {
        self.inner.meta.lock().ok().and_then(|m| m.clone())
    }

    /// Call a method by name. Arguments are converted to the advertised
    /// parameter signature; the future settles with the decoded reply, the
    /// remote error, or cancellation.
    pub fn call(&self, method: &str, args: Vec<AnyValue>) -> Future<AnyValue> {
        let (action, params) = match self.resolve_method(method) {
            Ok(found) => found,
            Err(e) => return Future::from_error(e.to_wire_string()),
        };
        let args = match convert_arguments(args, &params) {
            Ok(args) => args,
            Err(e) => return Future::from_error(e.to_wire_string()),
        };
        self.inner.call_action(action, args, &params)
    }

    /// Fire-and-forget a method or signal trigger by name.
    pub fn post(&self, target: &str, args: Vec<AnyValue>) -> Result<()> {
        let meta = self
            .meta_object()
            .ok_or_else(|| Error::Call("meta object not fetched".into()))?;
        let (action, params) = if let Some(id) = meta.method_id(target) {
            let method = meta.method(id).ok_or(Error::NoSuchMethod(id))?;
            (id, method.parameters.clone())
        } else if let Some(id) = meta.signal_id(target) {
            let signal = meta.signal(id).ok_or(Error::NoSuchSignal(id))?;
            (id, signal.signature.clone())
        } else {
            return Err(Error::NotFound(target.to_string()));
        };
        let args = convert_arguments(args, &params)?;
        let mut msg = Message::new(
            MessageKind::Post,
            MessageAddress {
                service: self.inner.service,
                object: self.inner.object,
                action,
                message_id: self.inner.socket.next_message_id(),
            },
        );
        msg.set_value(AnyValue::Tuple(args), &params)?;
        self.inner.socket.send(msg)
    }

    /// Subscribe to a remote signal by name. The returned future resolves
    /// with the subscriber's link once the remote registration is in place
    /// (immediately when the bridge already exists).
    pub fn subscribe(&self, signal: &str, subscriber: SignalSubscriber) -> Future<SignalLink> {
        let meta = match self.meta_object() {
            Some(meta) => meta,
            None => return Future::from_error("meta object not fetched"),
        };
        let Some(signal_id) = meta.signal_id(signal) else {
            return Future::from_error(Error::NotFound(signal.to_string()).to_wire_string());
        };
        let signature = meta
            .signal(signal_id)
            .map(|s| s.signature.clone())
            .unwrap_or_else(Signature::dynamic);

        let (link, register) = {
            let Ok(mut signals) = self.inner.signals.lock() else {
                return Future::from_error("proxy poisoned");
            };
            let bridge = signals.entry(signal_id).or_insert_with(|| SignalBridge {
                signal: Signal::new(signature),
                links: HashMap::new(),
                registered: false,
            });
            let link = match bridge.signal.connect(subscriber) {
                Ok(link) => link,
                Err(e) => return Future::from_error(e.to_wire_string()),
            };
            bridge.links.insert(link, ());
            let register = !bridge.registered;
            bridge.registered = true;
            (link, register)
        };

        if register {
            // remote link id = signal id: unique per (socket, object) pair.
            self.inner
                .call_action(
                    ACTION_REGISTER_EVENT,
                    vec![
                        AnyValue::uint32(self.inner.object),
                        AnyValue::uint32(signal_id),
                        AnyValue::uint64(u64::from(signal_id)),
                    ],
                    &params_signature("(IIL)"),
                )
                .then(move |_| link)
        } else {
            Future::from_value(link)
        }
    }

    /// Drop a subscription made with [`subscribe`](Self::subscribe). The
    /// last local subscriber tears the remote registration down.
    pub fn unsubscribe(&self, signal: &str, link: SignalLink) -> Future<()> {
        let meta = match self.meta_object() {
            Some(meta) => meta,
            None => return Future::from_error("meta object not fetched"),
        };
        let Some(signal_id) = meta.signal_id(signal) else {
            return Future::from_error(Error::NotFound(signal.to_string()).to_wire_string());
        };
        let unregister = {
            let Ok(mut signals) = self.inner.signals.lock() else {
                return Future::from_error("proxy poisoned");
            };
            let Some(bridge) = signals.get_mut(&signal_id) else {
                return Future::from_value(());
            };
            bridge.signal.disconnect(link);
            bridge.links.remove(&link);
            if bridge.links.is_empty() && bridge.registered {
                bridge.registered = false;
                true
            } else {
                false
            }
        };
        if unregister {
            self.inner
                .call_action(
                    ACTION_UNREGISTER_EVENT,
                    vec![
                        AnyValue::uint32(self.inner.object),
                        AnyValue::uint32(signal_id),
                        AnyValue::uint64(u64::from(signal_id)),
                    ],
                    &params_signature("(IIL)"),
                )
                .then(|_| ())
        } else {
            Future::from_value(())
        }
    }

    /// Read a remote property by name.
    pub fn property(&self, name: &str) -> Future<AnyValue> {
        self.inner
            .call_action(
                ACTION_GET_PROPERTY,
                vec![AnyValue::str(name)],
                &params_signature("(m)"),
            )
            .then(AnyValue::unwrap_dynamic)
    }

    /// Write a remote property by name.
    pub fn set_property(&self, name: &str, value: AnyValue) -> Future<AnyValue> {
        self.inner.call_action(
            ACTION_SET_PROPERTY,
            vec![AnyValue::str(name), value],
            &params_signature("(mm)"),
        )
    }

    /// Pending (unanswered) call count, for tests and diagnostics.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    fn resolve_method(&self, name: &str) -> Result<(u32, Signature)> {
        let meta = self
            .meta_object()
            .ok_or_else(|| Error::Call("meta object not fetched".into()))?;
        let id = meta
            .method_id(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let method = meta.method(id).ok_or(Error::NoSuchMethod(id))?;
        Ok((id, method.parameters.clone()))
    }
}

impl RemoteObjectInner {
    /// Send one Call and register its pending promise. Cancelling the
    /// returned future emits a `Cancel` message for the call's id.
    fn call_action(
        self: &Arc<Self>,
        action: u32,
        args: Vec<AnyValue>,
        params: &Signature,
    ) -> Future<AnyValue> {
        let message_id = self.socket.next_message_id();
        let address = MessageAddress {
            service: self.service,
            object: self.object,
            action,
            message_id,
        };
        let mut msg = Message::new(MessageKind::Call, address);
        if let Err(e) = msg.set_value(AnyValue::Tuple(args), params) {
            return Future::from_error(e.to_wire_string());
        }

        let socket = Arc::downgrade(&self.socket);
        let promise = Promise::with_cancel_handler(move |_p: &Promise<AnyValue>| {
            let Some(socket) = socket.upgrade() else {
                return;
            };
            let mut cancel = Message::new(
                MessageKind::Cancel,
                MessageAddress {
                    message_id: socket.next_message_id(),
                    ..address
                },
            );
            let encoded = cancel.set_value(
                AnyValue::uint32(message_id),
                &params_signature("I"),
            );
            if encoded.is_ok() {
                if let Err(e) = socket.send(cancel) {
                    tracing::debug!("failed to send cancel for call {}: {}", message_id, e);
                }
            }
        });
        let future = promise.future();
        self.pending.insert(message_id, promise);

        if let Err(e) = self.socket.send(msg) {
            if let Some((_, promise)) = self.pending.remove(&message_id) {
                promise.set_error(e.to_wire_string());
            }
        }
        future
    }

    fn on_message(&self, msg: Message) {
        match msg.kind {
            MessageKind::Reply | MessageKind::Error | MessageKind::Canceled => {
                let Some((_, promise)) = self.pending.remove(&msg.address.message_id) else {
                    tracing::debug!("reply for unknown call {}", msg.address);
                    return;
                };
                match msg.kind {
                    MessageKind::Reply => match msg.value() {
                        Ok(value) => {
                            let value = if msg.flags.has(MessageFlags::DYNAMIC_PAYLOAD) {
                                value.unwrap_dynamic()
                            } else {
                                value
                            };
                            promise.set_value(value);
                        }
                        Err(e) => {
                            promise.set_error(format!("malformed reply: {}", e));
                        }
                    },
                    MessageKind::Error => {
                        let text = msg
                            .value()
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_else(|| "unknown remote error".to_string());
                        promise.set_error(text);
                    }
                    MessageKind::Canceled => {
                        promise.set_canceled();
                    }
                    _ => unreachable!(),
                }
            }
            MessageKind::Event => {
                let signal = {
                    let Ok(signals) = self.signals.lock() else {
                        return;
                    };
                    signals
                        .get(&msg.address.action)
                        .map(|bridge| bridge.signal.clone())
                };
                let Some(signal) = signal else {
                    tracing::debug!("event for unknown signal {}", msg.address);
                    return;
                };
                match msg.value() {
                    Ok(value) => signal.emit(value.into_arguments()),
                    Err(e) => tracing::warn!("malformed event payload on {}: {}", msg.address, e),
                }
            }
            other => {
                tracing::debug!("proxy ignoring {:?} message {}", other, msg.address);
            }
        }
    }
}

fn params_signature(text: &str) -> Signature {
    Signature::parse(text).unwrap_or_else(|_| Signature::dynamic())
}
