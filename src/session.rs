//! Session: the per-process facade.
//!
//! A [`Session`] owns the pieces one process needs to take part in the
//! mesh: its executor pool, its listening endpoints, its socket cache, the
//! services it serves, and its view of the service directory.
//!
//! Two roles, one type:
//!
//! - **standalone** — [`listen_standalone`](Session::listen_standalone)
//!   embeds the service directory (service id 1) and serves it;
//! - **client/server** — [`connect`](Session::connect) attaches to a remote
//!   directory; [`listen`](Session::listen) +
//!   [`register_service`](Session::register_service) expose local services
//!   through it.
//!
//! Data flow for an inbound frame: socket task decodes → session routes by
//! service id → the service's [`BoundObject`] routes by object id and
//! dispatches. Replies travel the reverse path through the socket's
//! serialized writer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::bound_object::BoundObject;
use crate::config::SessionConfig;
use crate::directory::{
    directory_object, ServiceDirectory, ServiceInfo, SERVICE_DIRECTORY_ID,
};
use crate::error::{Error, Result};
use crate::net::TcpStream;
use crate::remote_object::{ClientRouter, RemoteObject};
use crate::runtime::Executor;
use crate::signal::CallType;
use crate::socket_cache::SocketCache;
use crate::transport::{SocketId, TransportServer, TransportSocket};
use crate::types::object::AnyObject;
use crate::types::value::AnyValue;
use crate::url::Url;
use crate::wire::{Message, MessageKind};

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(1);

enum DirectoryBackend {
    /// This session hosts the directory.
    Local(Arc<ServiceDirectory>),
    /// The directory lives behind a socket.
    Remote {
        socket: Arc<TransportSocket>,
        proxy: RemoteObject,
    },
}

struct SessionInner<S: TcpStream> {
    config: SessionConfig,
    machine_id: String,
    session_id: String,
    executor: Executor,
    cache: Arc<SocketCache<S>>,
    server: TransportServer,
    /// service id → main bound object of a locally served service.
    services: DashMap<u32, Arc<BoundObject>>,
    service_names: DashMap<String, u32>,
    directory: Mutex<Option<DirectoryBackend>>,
    /// Sockets accepted by our server (kept alive while connected).
    incoming: Mutex<Vec<Arc<TransportSocket>>>,
    /// One router per outgoing socket obtained from the cache.
    routers: DashMap<SocketId, Arc<ClientRouter>>,
    closed: AtomicBool,
}

/// The per-process container of services and connections.
pub struct Session<S: TcpStream = tokio::net::TcpStream> {
    inner: Arc<SessionInner<S>>,
}

impl<S: TcpStream> Session<S> {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let machine_id = config
            .machine_id
            .clone()
            .unwrap_or_else(crate::machine_id);
        let session_id = format!(
            "{}-{}",
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let executor = Executor::new(config.worker_threads)?;
        let cache = SocketCache::new(machine_id.clone(), config.capabilities.clone());
        Ok(Session {
            inner: Arc::new(SessionInner {
                config,
                machine_id,
                session_id,
                executor,
                cache,
                server: TransportServer::new(),
                services: DashMap::new(),
                service_names: DashMap::new(),
                directory: Mutex::new(None),
                incoming: Mutex::new(Vec::new()),
                routers: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// This session's machine identifier.
    pub fn machine_id(&self) -> &str {
        &self.inner.machine_id
    }

    /// The executor backing this session's strands and queued dispatch.
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Endpoints the session is listening on.
    pub fn endpoints(&self) -> Vec<Url> {
        self.inner.server.endpoints()
    }

    /// The embedded directory, when this session is standalone.
    pub fn directory(&self) -> Option<Arc<ServiceDirectory>> {
        match &*self.inner.directory.lock().ok()? {
            Some(DirectoryBackend::Local(dir)) => Some(dir.clone()),
            _ => None,
        }
    }

    /// Listen on `url` and host the service directory in-process.
    pub async fn listen_standalone(&self, url: &Url) -> Result<Vec<Url>> {
        {
            let Ok(backend) = self.inner.directory.lock() else {
                return Err(Error::SessionClosed);
            };
            if backend.is_some() {
                return Err(Error::Call("session is already initialised".into()));
            }
        }
        let dir = ServiceDirectory::new(self.inner.machine_id.clone());
        let object = directory_object(&dir)?;
        let bound = BoundObject::main(
            SERVICE_DIRECTORY_ID,
            object,
            // Directory methods read the calling socket: keep them inline.
            CallType::Direct,
            self.inner.executor.clone(),
        );
        let gc = dir.clone();
        bound.set_on_socket_disconnected(move |socket_id, _error| {
            gc.on_socket_disconnected(socket_id);
        });
        self.inner.services.insert(SERVICE_DIRECTORY_ID, bound);
        if let Ok(mut backend) = self.inner.directory.lock() {
            *backend = Some(DirectoryBackend::Local(dir.clone()));
        }

        let endpoints = self.listen(url).await?;

        let mut info = ServiceInfo::new("ServiceDirectory");
        info.machine_id = self.inner.machine_id.clone();
        info.session_id = "0".to_string();
        info.endpoints = endpoints.clone();
        let id = dir.register_service(&info, None)?;
        debug_assert_eq!(id, SERVICE_DIRECTORY_ID, "directory must get id 1");
        dir.service_ready(id)?;
        Ok(endpoints)
    }

    /// Listen on `url` for peers calling our services.
    pub async fn listen(&self, url: &Url) -> Result<Vec<Url>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<TransportSocket>>();
        let endpoints = self
            .inner
            .server
            .listen::<S::Listener>(url, self.inner.config.capabilities.clone(), tx)
            .await?;

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(socket) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionInner::adopt_incoming(&inner, socket);
            }
        });
        Ok(endpoints)
    }

    /// Attach to a remote service directory at `url`.
    pub async fn connect(&self, url: &Url) -> Result<()> {
        let socket = TransportSocket::new(self.inner.config.capabilities.clone());
        let router = ClientRouter::install(&socket);
        socket.connect::<S>(url.clone()).await?;
        let proxy = RemoteObject::for_service(&router, socket.clone(), SERVICE_DIRECTORY_ID);
        proxy.fetch_meta_object().await?;
        self.inner.routers.insert(socket.id(), router);
        let Ok(mut backend) = self.inner.directory.lock() else {
            return Err(Error::SessionClosed);
        };
        if backend.is_some() {
            return Err(Error::Call("session is already initialised".into()));
        }
        *backend = Some(DirectoryBackend::Remote { socket, proxy });
        Ok(())
    }

    /// Register `object` as service `name` (two-phase: pending, then ready).
    /// Requires a directory (standalone or connected) and, for remote
    /// directories, a prior [`listen`](Session::listen).
    pub async fn register_service(&self, name: &str, object: AnyObject) -> Result<u32> {
        self.register_service_with(name, object, CallType::Queued)
            .await
    }

    /// [`register_service`](Session::register_service) with an explicit
    /// dispatch policy for the object.
    pub async fn register_service_with(
        &self,
        name: &str,
        object: AnyObject,
        call_type: CallType,
    ) -> Result<u32> {
        let mut info = ServiceInfo::new(name);
        info.machine_id = self.inner.machine_id.clone();
        info.session_id = self.inner.session_id.clone();
        info.endpoints = self.inner.server.endpoints();
        if info.endpoints.is_empty() {
            return Err(Error::Call(
                "cannot register a service before listen()".into(),
            ));
        }

        let backend = self.backend()?;
        let id = match &backend {
            DirectoryBackend::Local(dir) => dir.register_service(&info, None)?,
            DirectoryBackend::Remote { proxy, .. } => proxy
                .call("registerService", vec![info.to_value()])
                .await?
                .as_u32()
                .ok_or_else(|| Error::Protocol("registerService returned no id".into()))?,
        };

        let bound = BoundObject::main(id, object, call_type, self.inner.executor.clone());
        self.inner.services.insert(id, bound);
        self.inner.service_names.insert(name.to_string(), id);

        match &backend {
            DirectoryBackend::Local(dir) => dir.service_ready(id)?,
            DirectoryBackend::Remote { proxy, .. } => {
                proxy
                    .call("serviceReady", vec![AnyValue::uint32(id)])
                    .await?;
            }
        }
        Ok(id)
    }

    /// Unregister a service by id and drop its bound object.
    pub async fn unregister_service(&self, id: u32) -> Result<()> {
        let backend = self.backend()?;
        match &backend {
            DirectoryBackend::Local(dir) => dir.unregister_service(id)?,
            DirectoryBackend::Remote { proxy, .. } => {
                proxy
                    .call("unregisterService", vec![AnyValue::uint32(id)])
                    .await?;
            }
        }
        self.inner.services.remove(&id);
        self.inner.service_names.retain(|_, v| *v != id);
        Ok(())
    }

    /// Resolve `name` through the directory and return a proxy to its main
    /// object, connecting (or reusing a cached socket) to the owning
    /// machine.
    pub async fn service(&self, name: &str) -> Result<RemoteObject> {
        let info = match self.backend()? {
            DirectoryBackend::Local(dir) => dir.service(name)?,
            DirectoryBackend::Remote { proxy, .. } => {
                let value = proxy.call("service", vec![AnyValue::str(name)]).await?;
                ServiceInfo::from_value(&value.unwrap_dynamic())?
            }
        };
        let socket = self.inner.cache.socket(&info, None).await?;
        let router = self
            .inner
            .routers
            .entry(socket.id())
            .or_insert_with(|| ClientRouter::install(&socket))
            .clone();
        let proxy = RemoteObject::for_service(&router, socket, info.service_id);
        proxy.fetch_meta_object().await?;
        Ok(proxy)
    }

    /// List the services the directory currently announces.
    pub async fn services(&self) -> Result<Vec<ServiceInfo>> {
        match self.backend()? {
            DirectoryBackend::Local(dir) => Ok(dir.services()),
            DirectoryBackend::Remote { proxy, .. } => {
                let value = proxy.call("services", vec![]).await?.unwrap_dynamic();
                let AnyValue::List(items) = value else {
                    return Err(Error::Protocol("malformed services() reply".into()));
                };
                items.iter().map(ServiceInfo::from_value).collect()
            }
        }
    }

    /// The bound object serving `service_id`, for tests and diagnostics.
    pub fn bound_object(&self, service_id: u32) -> Option<Arc<BoundObject>> {
        self.inner
            .services
            .get(&service_id)
            .map(|e| e.value().clone())
    }

    /// Tear everything down: cache, server, sockets, services.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cache.close();
        self.inner.server.close();
        if let Ok(mut incoming) = self.inner.incoming.lock() {
            for socket in incoming.drain(..) {
                socket.close();
            }
        }
        if let Ok(mut backend) = self.inner.directory.lock() {
            if let Some(DirectoryBackend::Remote { socket, .. }) = backend.take() {
                socket.close();
            }
        }
        self.inner.services.clear();
        self.inner.executor.shutdown();
    }

    fn backend(&self) -> Result<DirectoryBackend> {
        let Ok(backend) = self.inner.directory.lock() else {
            return Err(Error::SessionClosed);
        };
        match &*backend {
            Some(DirectoryBackend::Local(dir)) => Ok(DirectoryBackend::Local(dir.clone())),
            Some(DirectoryBackend::Remote { socket, proxy }) => Ok(DirectoryBackend::Remote {
                socket: socket.clone(),
                proxy: proxy.clone(),
            }),
            None => Err(Error::Call(
                "session is not connected to a service directory".into(),
            )),
        }
    }
}

impl<S: TcpStream> SessionInner<S> {
    /// Wire an accepted socket into the dispatch path.
    fn adopt_incoming(inner: &Arc<Self>, socket: Arc<TransportSocket>) {
        let weak = Arc::downgrade(inner);
        socket.set_message_handler(move |msg, socket| {
            if let Some(inner) = weak.upgrade() {
                inner.route_incoming(msg, socket);
            }
        });
        // Dead sockets are pruned from the keep-alive list as new ones come
        // in; per-object cleanup runs off the socket's own signal.
        if let Ok(mut incoming) = inner.incoming.lock() {
            incoming.retain(|s| s.is_connected());
            incoming.push(socket.clone());
        }
        socket.start_reading();
    }

    /// Route one inbound frame to the addressed service.
    fn route_incoming(&self, msg: Message, socket: &Arc<TransportSocket>) {
        let Some(bound) = self
            .services
            .get(&msg.address.service)
            .map(|e| e.value().clone())
        else {
            tracing::warn!("message for unknown service {}", msg.address);
            if msg.kind == MessageKind::Call {
                let mut ret = Message::response_to(msg.address, MessageKind::Reply);
                ret.set_error(format!("unknown service {}", msg.address.service));
                if let Err(e) = socket.send(ret) {
                    tracing::debug!("failed to send unknown-service reply: {}", e);
                }
            }
            return;
        };
        bound.on_message(msg, socket);
    }
}

impl<S: TcpStream> Drop for Session<S> {
    fn drop(&mut self) {
        // Only the last handle tears the session down.
        if Arc::strong_count(&self.inner) == 1 {
            self.close();
        }
    }
}

impl<S: TcpStream> Clone for Session<S> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
        }
    }
}

impl<S: TcpStream> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("machine_id", &self.machine_id())
            .field("session_id", &self.inner.session_id)
            .field("services", &self.inner.services.len())
            .finish()
    }
}
