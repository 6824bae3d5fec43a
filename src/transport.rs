//! Transport sockets and servers.
//!
//! A [`TransportSocket`] is a bidirectional, reliable, framed message channel
//! over one TCP connection. One background task owns the stream and runs a
//! select loop over three sources, so writes are serialized and replies leave
//! in completion order:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ connection task                               │
//! │   recv(send queue) ──► write frame            │
//! │   read stream      ──► decode ──► handler     │
//! │   cancelled        ──► drain + disconnect     │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The socket exposes `connected`/`disconnected` signals (what the socket
//! cache races on), a per-socket message-id counter, and the capability map
//! exchanged right after connect.
//!
//! Reading starts explicitly: accepted sockets sit quiet until the owner has
//! installed a message handler and calls
//! [`start_reading`](TransportSocket::start_reading), so no early frame can
//! race the handler installation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::future::{Future, Promise};
use crate::net::{TcpListener, TcpStream};
use crate::signal::Signal;
use crate::types::signature::Signature;
use crate::types::value::AnyValue;
use crate::url::Url;
use crate::wire::{self, Message, MessageAddress, MessageKind};

/// Process-unique socket identity; per-socket maps key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

static SOCKET_ID: AtomicU64 = AtomicU64::new(1);

impl SocketId {
    fn next() -> Self {
        SocketId(SOCKET_ID.fetch_add(1, Ordering::SeqCst))
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Disconnected,
    Connecting,
    Connected,
}

type MessageHandler = Arc<dyn Fn(Message, &Arc<TransportSocket>) + Send + Sync>;

struct SocketState {
    status: SocketStatus,
    url: Option<Url>,
    peer_addr: Option<SocketAddr>,
    send_tx: Option<mpsc::UnboundedSender<Message>>,
}

/// A framed, bidirectional message channel.
pub struct TransportSocket {
    id: SocketId,
    state: Mutex<SocketState>,
    /// Fires once when the connection is established.
    pub connected: Signal,
    /// Fires once with the error text when the connection goes away.
    pub disconnected: Signal,
    handler: Mutex<Option<MessageHandler>>,
    local_capabilities: Mutex<HashMap<String, bool>>,
    remote_capabilities: Mutex<HashMap<String, bool>>,
    next_message_id: AtomicU32,
    reading: watch::Sender<bool>,
    close_token: CancellationToken,
}

impl TransportSocket {
    fn build(capabilities: HashMap<String, bool>, status: SocketStatus) -> Arc<Self> {
        let (reading, _) = watch::channel(false);
        Arc::new(TransportSocket {
            id: SocketId::next(),
            state: Mutex::new(SocketState {
                status,
                url: None,
                peer_addr: None,
                send_tx: None,
            }),
            connected: Signal::new(Signature::unit_tuple()),
            disconnected: Signal::new(
                Signature::parse("(s)").unwrap_or_else(|_| Signature::dynamic()),
            ),
            handler: Mutex::new(None),
            local_capabilities: Mutex::new(capabilities),
            remote_capabilities: Mutex::new(HashMap::new()),
            next_message_id: AtomicU32::new(1),
            reading,
            close_token: CancellationToken::new(),
        })
    }

    /// A socket that is not yet connected; drive it with
    /// [`connect`](Self::connect). The cache creates sockets this way so it
    /// can subscribe to the signals before the connection attempt starts.
    pub fn new(capabilities: HashMap<String, bool>) -> Arc<Self> {
        Self::build(capabilities, SocketStatus::Disconnected)
    }

    /// Wrap an accepted stream. The connection task starts immediately but
    /// stays read-silent until [`start_reading`](Self::start_reading).
    pub fn from_stream<S: TcpStream>(
        stream: S,
        capabilities: HashMap<String, bool>,
    ) -> Arc<Self> {
        let socket = Self::build(capabilities, SocketStatus::Connected);
        socket.install_stream(stream);
        socket
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn status(&self) -> SocketStatus {
        self.state
            .lock()
            .map(|s| s.status)
            .unwrap_or(SocketStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == SocketStatus::Connected
    }

    /// URL this socket was connected to, for outgoing sockets.
    pub fn url(&self) -> Option<Url> {
        self.state.lock().ok().and_then(|s| s.url.clone())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.state.lock().ok().and_then(|s| s.peer_addr)
    }

    /// Allocate a message id for a call on this socket.
    pub fn next_message_id(&self) -> u32 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Install the inbound message handler. Must happen before
    /// [`start_reading`](Self::start_reading); frames arriving without a
    /// handler are dropped with a warning.
    pub fn set_message_handler<F>(&self, f: F)
    where
        F: Fn(Message, &Arc<TransportSocket>) + Send + Sync + 'static,
    {
        if let Ok(mut handler) = self.handler.lock() {
            *handler = Some(Arc::new(f));
        }
    }

    /// Begin processing inbound frames.
    pub fn start_reading(&self) {
        // send_replace stores the value even when the connection task has
        // not subscribed yet.
        self.reading.send_replace(true);
    }

    /// What the remote end advertised for `name`.
    pub fn remote_capability(&self, name: &str, default: bool) -> bool {
        self.remote_capabilities
            .lock()
            .ok()
            .and_then(|caps| caps.get(name).copied())
            .unwrap_or(default)
    }

    /// A capability holds for the pair only when both ends advertise it.
    pub fn shared_capability(&self, name: &str, default: bool) -> bool {
        let local = self
            .local_capabilities
            .lock()
            .ok()
            .and_then(|caps| caps.get(name).copied())
            .unwrap_or(default);
        local && self.remote_capability(name, default)
    }

    /// Queue a message for sending. Fails once disconnected.
    pub fn send(&self, message: Message) -> Result<()> {
        let Ok(state) = self.state.lock() else {
            return Err(Error::SessionClosed);
        };
        match &state.send_tx {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::Protocol("socket is shutting down".into())),
            None => Err(Error::Protocol("socket is not connected".into())),
        }
    }

    /// Asynchronously connect to `url`. The returned future resolves when
    /// the connection is up (and the `connected` signal has fired) or fails
    /// with the connect error (after `disconnected` fired).
    pub fn connect<S: TcpStream>(self: &Arc<Self>, url: Url) -> Future<()> {
        let promise = Promise::new();
        let future = promise.future();

        if url.scheme() != Url::DEFAULT_SCHEME {
            let err = Error::UnsupportedProtocol(url.scheme().to_string());
            // Deferred so callers (the socket cache) never see the
            // disconnected signal fire inside their own connect call.
            let socket = self.clone();
            tokio::spawn(async move {
                socket.disconnected.emit(vec![AnyValue::str(err.to_string())]);
                promise.set_error(err.to_string());
            });
            return future;
        }
        {
            let Ok(mut state) = self.state.lock() else {
                promise.set_error("socket poisoned");
                return future;
            };
            if state.status != SocketStatus::Disconnected {
                promise.set_error("socket is already connecting or connected");
                return future;
            }
            state.status = SocketStatus::Connecting;
            state.url = Some(url.clone());
        }

        let socket = self.clone();
        tokio::spawn(async move {
            let outcome = async {
                let mut addrs = tokio::net::lookup_host(url.authority()).await?;
                let addr = addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address for {}", url),
                    )
                })?;
                S::connect(addr).await
            }
            .await;

            match outcome {
                Ok(stream) => {
                    socket.install_stream(stream);
                    socket.start_reading();
                    socket.connected.emit(vec![]);
                    promise.set_value(());
                }
                Err(e) => {
                    let text = format!("Failed to connect to {}: {}", url, e);
                    tracing::debug!("{}", text);
                    if let Ok(mut state) = socket.state.lock() {
                        state.status = SocketStatus::Disconnected;
                    }
                    socket.disconnected.emit(vec![AnyValue::str(text.clone())]);
                    promise.set_error(text);
                }
            }
        });
        future
    }

    /// Close the socket. Idempotent; the `disconnected` signal fires once
    /// the connection task has wound down.
    pub fn close(&self) {
        self.close_token.cancel();
    }

    /// Spawn the connection task owning `stream`.
    fn install_stream<S: TcpStream>(self: &Arc<Self>, stream: S) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.status = SocketStatus::Connected;
            state.peer_addr = stream.peer_addr().ok();
            state.send_tx = Some(send_tx);
        }
        // Advertise our capabilities as the first frame on the wire.
        if let Err(e) = self.send(self.capability_message()) {
            tracing::warn!("failed to queue capability message: {}", e);
        }
        let socket = self.clone();
        tokio::spawn(connection_task(socket, stream, send_rx));
    }

    fn capability_message(&self) -> Message {
        let caps = self
            .local_capabilities
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let entries = caps
            .into_iter()
            .map(|(k, v)| (AnyValue::Str(k), AnyValue::Bool(v)))
            .collect();
        let mut msg = Message::new(
            MessageKind::Capability,
            MessageAddress {
                service: 0,
                object: 0,
                action: 0,
                message_id: self.next_message_id(),
            },
        );
        let signature = Signature::parse("{sb}").unwrap_or_else(|_| Signature::dynamic());
        if let Err(e) = msg.set_value(AnyValue::Map(entries), &signature) {
            tracing::warn!("failed to encode capability map: {}", e);
        }
        msg
    }

    fn handle_frame(self: &Arc<Self>, message: Message) {
        if message.kind == MessageKind::Capability {
            match message.value() {
                Ok(AnyValue::Map(entries)) => {
                    if let Ok(mut caps) = self.remote_capabilities.lock() {
                        for (k, v) in entries {
                            if let (Some(name), AnyValue::Bool(value)) = (k.as_str(), v) {
                                caps.insert(name.to_string(), value);
                            }
                        }
                    }
                }
                other => {
                    tracing::warn!("ignoring malformed capability message: {:?}", other);
                }
            }
            return;
        }
        let handler = self.handler.lock().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => handler(message, self),
            None => {
                tracing::warn!(
                    "dropping {:?} message {}: no handler installed",
                    message.kind,
                    message.address
                );
            }
        }
    }

    /// Terminal bookkeeping shared by every disconnect path.
    fn on_connection_ended(self: &Arc<Self>, reason: String) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.status == SocketStatus::Disconnected {
                return;
            }
            state.status = SocketStatus::Disconnected;
            state.send_tx = None;
        }
        tracing::debug!(socket = self.id.0, "disconnected: {}", reason);
        self.disconnected.emit(vec![AnyValue::str(reason)]);
    }
}

async fn connection_task<S: TcpStream>(
    socket: Arc<TransportSocket>,
    mut stream: S,
    mut send_rx: mpsc::UnboundedReceiver<Message>,
) {
    let token = socket.close_token.clone();
    let mut reading = socket.reading.subscribe();
    let mut buf = [0u8; 16384];
    let mut pending = BytesMut::new();

    let reason = loop {
        let read_enabled = *reading.borrow();
        tokio::select! {
            maybe = send_rx.recv() => {
                match maybe {
                    Some(message) => {
                        if let Err(e) = stream.write_all(&message.encode()).await {
                            break format!("write failed: {}", e);
                        }
                    }
                    None => break "socket dropped".to_string(),
                }
            }
            result = stream.read(&mut buf), if read_enabled => {
                match result {
                    Ok(0) => break "connection closed by peer".to_string(),
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        loop {
                            match wire::decode(&mut pending) {
                                Ok(Some(message)) => socket.handle_frame(message),
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream cannot be resynchronized.
                                    socket.on_connection_ended(format!("protocol error: {}", e));
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => break format!("read failed: {}", e),
                }
            }
            _ = reading.changed() => {}
            () = token.cancelled() => {
                // Flush what was already queued before winding down.
                while let Ok(message) = send_rx.try_recv() {
                    if stream.write_all(&message.encode()).await.is_err() {
                        break;
                    }
                }
                break "socket closed".to_string();
            }
        }
    };
    socket.on_connection_ended(reason);
}

impl std::fmt::Debug for TransportSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSocket")
            .field("id", &self.id.0)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SERVER
// ============================================================================

/// Listens on an endpoint and surfaces accepted sockets.
pub struct TransportServer {
    endpoints: Mutex<Vec<Url>>,
    close_token: CancellationToken,
}

impl TransportServer {
    pub fn new() -> Self {
        TransportServer {
            endpoints: Mutex::new(Vec::new()),
            close_token: CancellationToken::new(),
        }
    }

    /// Bind `url` and push every accepted socket into `on_connection`.
    /// Accepted sockets have not started reading: install a handler first.
    /// Returns the resolved endpoint list (port 0 replaced by the real one).
    pub async fn listen<L: TcpListener>(
        &self,
        url: &Url,
        capabilities: HashMap<String, bool>,
        on_connection: mpsc::UnboundedSender<Arc<TransportSocket>>,
    ) -> Result<Vec<Url>> {
        if url.scheme() != Url::DEFAULT_SCHEME {
            return Err(Error::UnsupportedProtocol(url.scheme().to_string()));
        }
        let mut addrs = tokio::net::lookup_host(url.authority()).await?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::ConnectFailure(format!("no address for {}", url)))?;
        let listener = L::bind(addr).await?;
        let local = listener.local_addr()?;
        let endpoint = url.with_port(local.port());
        tracing::info!("listening on {}", endpoint);
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.push(endpoint.clone());
        }

        let token = self.close_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tracing::debug!("accepted connection from {}", peer);
                                let socket =
                                    TransportSocket::from_stream(stream, capabilities.clone());
                                if on_connection.send(socket).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!("accept failed: {}", e);
                                break;
                            }
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
        });
        Ok(vec![endpoint])
    }

    /// Every endpoint this server is listening on.
    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn close(&self) {
        self.close_token.cancel();
    }
}

impl Default for TransportServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.close();
    }
}
