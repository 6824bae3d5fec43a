//! Transport socket cache.
//!
//! Given a target machine and the endpoints it advertises, the cache races
//! one connection attempt per endpoint and hands the first established
//! socket to every concurrent requester: all endpoints of a machine share
//! one promise, the first `connected` event wins, late winners are closed.
//!
//! Endpoint filtering prefers loopback: when the target advertises the same
//! machine id as this process, only `127.*`/`localhost` endpoints are tried
//! (falling back to everything if none are advertised); for remote machines
//! the non-loopback endpoints are tried first.
//!
//! Known corner case inherited from the original design: two machines on
//! different subnets that both advertise the same RFC-1918 address (say
//! `192.168.1.42`) can be confused; nothing but the machine-id check at
//! registration guards against it. A post-connect machine-id handshake would
//! close the hole.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::directory::ServiceInfo;
use crate::error::Error;
use crate::future::{Future, Promise};
use crate::net::TcpStream;
use crate::signal::{SignalLink, SignalSubscriber};
use crate::transport::TransportSocket;
use crate::url::Url;

struct ConnectionSlot {
    socket: Arc<TransportSocket>,
    promise: Promise<Arc<TransportSocket>>,
    connected_link: SignalLink,
    disconnected_link: SignalLink,
}

struct Attempt {
    promise: Promise<Arc<TransportSocket>>,
    /// Endpoints still racing for this machine.
    socket_count: usize,
    successful: bool,
}

struct CacheState {
    dying: bool,
    /// machine id → endpoint url → slot
    connections: HashMap<String, HashMap<String, ConnectionSlot>>,
    attempts: HashMap<String, Attempt>,
}

/// Cache of one socket per reachable machine.
pub struct SocketCache<S: TcpStream = tokio::net::TcpStream> {
    machine_id: String,
    capabilities: HashMap<String, bool>,
    state: Mutex<CacheState>,
    _phantom: PhantomData<fn() -> S>,
}

impl<S: TcpStream> SocketCache<S> {
    pub fn new(machine_id: impl Into<String>, capabilities: HashMap<String, bool>) -> Arc<Self> {
        Arc::new(SocketCache {
            machine_id: machine_id.into(),
            capabilities,
            state: Mutex::new(CacheState {
                dying: false,
                connections: HashMap::new(),
                attempts: HashMap::new(),
            }),
            _phantom: PhantomData,
        })
    }

    /// Pick the endpoints worth trying, loopback-preferring.
    fn filter_endpoints(&self, info: &ServiceInfo, protocol: Option<&str>) -> Vec<Url> {
        let local = info.machine_id == self.machine_id;
        let mut sorted: Vec<Url>;
        if local {
            // A local connection always goes through loopback when it can.
            sorted = info
                .endpoints
                .iter()
                .filter(|u| u.is_loopback())
                .cloned()
                .collect();
            if sorted.is_empty() {
                sorted = info.endpoints.clone();
            }
        } else {
            sorted = info
                .endpoints
                .iter()
                .filter(|u| !u.is_loopback())
                .cloned()
                .collect();
            sorted.extend(info.endpoints.iter().filter(|u| u.is_loopback()).cloned());
        }

        let mut endpoints = Vec::new();
        for url in &sorted {
            if url.is_loopback() {
                if protocol.is_none() || protocol == Some(url.scheme()) {
                    // One loopback endpoint is enough; it is always preferred.
                    endpoints.push(url.clone());
                    break;
                }
            } else {
                endpoints.push(url.clone());
            }
        }
        if endpoints.is_empty() && local && !info.endpoints.is_empty() {
            // Local machine, but loopback is not advertised: any public
            // address of this host will do.
            if let Some(first) = sorted.first() {
                endpoints.push(first.clone());
            }
        }
        endpoints
    }

    /// A socket to the machine hosting `info`, connecting if necessary.
    ///
    /// Concurrent callers for the same machine share one future; the error
    /// case is reported only after every endpoint has failed.
    pub fn socket(
        self: &Arc<Self>,
        info: &ServiceInfo,
        protocol: Option<&str>,
    ) -> Future<Arc<TransportSocket>> {
        let endpoints = self.filter_endpoints(info, protocol);
        tracing::debug!(
            service = %info.name,
            machine = %info.machine_id,
            "requesting socket, {} candidate endpoint(s)",
            endpoints.len()
        );

        let Ok(mut state) = self.state.lock() else {
            return Future::from_error("socket cache poisoned");
        };
        if state.dying {
            return Future::from_error(Error::SessionClosed.to_string());
        }

        // A pending or established connection to this machine on any of the
        // candidate endpoints shares its promise.
        if let Some(slots) = state.connections.get(&info.machine_id) {
            for url in &endpoints {
                if let Some(slot) = slots.get(&url.to_string()) {
                    let future = slot.promise.future();
                    if future.has_error() {
                        // Dead endpoint: fall through and retry everything.
                        continue;
                    }
                    tracing::debug!("connection to {} pending or established", url);
                    return future;
                }
            }
        }

        let promise: Promise<Arc<TransportSocket>> = Promise::new();
        if endpoints.is_empty() {
            promise.set_error("No endpoint available.");
            return promise.future();
        }

        let attempt = Attempt {
            promise: promise.clone(),
            socket_count: 0,
            successful: false,
        };
        state.attempts.insert(info.machine_id.clone(), attempt);

        for url in endpoints {
            if let Some(p) = protocol {
                if p != url.scheme() {
                    continue;
                }
            }
            let socket = TransportSocket::new(self.capabilities.clone());
            tracing::debug!(
                "attempting connection to {} of machine id {}",
                url,
                info.machine_id
            );

            let weak = Arc::downgrade(self);
            let machine = info.machine_id.clone();
            let url_key = url.to_string();
            let connected_socket = socket.clone();
            let connected_link = socket
                .connected
                .connect(SignalSubscriber::callback(move |_| {
                    if let Some(cache) = weak.upgrade() {
                        cache.on_socket_connected(&connected_socket, &machine, &url_key);
                    }
                }))
                .unwrap_or(crate::signal::INVALID_SIGNAL_LINK);

            let weak = Arc::downgrade(self);
            let machine = info.machine_id.clone();
            let url_key = url.to_string();
            let disconnected_link = socket
                .disconnected
                .connect(SignalSubscriber::callback(move |_| {
                    if let Some(cache) = weak.upgrade() {
                        cache.on_socket_disconnected(&machine, &url_key);
                    }
                }))
                .unwrap_or(crate::signal::INVALID_SIGNAL_LINK);

            let slot = ConnectionSlot {
                socket: socket.clone(),
                promise: promise.clone(),
                connected_link,
                disconnected_link,
            };
            state
                .connections
                .entry(info.machine_id.clone())
                .or_default()
                .insert(url.to_string(), slot);
            if let Some(attempt) = state.attempts.get_mut(&info.machine_id) {
                attempt.socket_count += 1;
            }

            socket.connect::<S>(url);
        }
        promise.future()
    }

    /// Publish an externally established socket, fulfilling a waiting
    /// attempt if one exists.
    pub fn insert(self: &Arc<Self>, machine_id: &str, url: &Url, socket: Arc<TransportSocket>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let promise = Promise::new();
        promise.set_value(socket.clone());
        if let Some(attempt) = state.attempts.get_mut(machine_id) {
            attempt.successful = true;
            attempt.promise.set_value(socket.clone());
        }
        state.connections.entry(machine_id.to_string()).or_default().insert(
            url.to_string(),
            ConnectionSlot {
                socket,
                promise,
                connected_link: crate::signal::INVALID_SIGNAL_LINK,
                disconnected_link: crate::signal::INVALID_SIGNAL_LINK,
            },
        );
    }

    fn on_socket_connected(self: &Arc<Self>, socket: &Arc<TransportSocket>, machine: &str, url: &str) {
        let close_late_winner = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let dying = state.dying;
            let Some(attempt) = state.attempts.get_mut(machine) else {
                return;
            };
            if dying {
                attempt.promise.set_error(Error::SessionClosed.to_string());
                return;
            }
            if attempt.successful {
                // Someone else won the race; this socket is surplus.
                true
            } else {
                attempt.successful = true;
                attempt.promise.set_value(socket.clone());
                tracing::debug!("connection to {} won the race for machine {}", url, machine);
                false
            }
        };
        if close_late_winner {
            tracing::debug!("closing late winner {}", url);
            socket.close();
        }
    }

    fn on_socket_disconnected(self: &Arc<Self>, machine: &str, url: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.dying {
            if let Some(attempt) = state.attempts.get_mut(machine) {
                attempt.promise.set_error(Error::SessionClosed.to_string());
            }
            return;
        }
        let racing = state
            .attempts
            .get(machine)
            .map(|a| !a.successful)
            .unwrap_or(false);
        if racing {
            let Some(attempt) = state.attempts.get_mut(machine) else {
                return;
            };
            attempt.socket_count = attempt.socket_count.saturating_sub(1);
            if attempt.socket_count == 0 {
                // Every endpoint failed; reject all waiters.
                attempt.promise.set_error(format!(
                    "Failed to connect to machine {}. All endpoints are unavailable.",
                    machine
                ));
            }
            return;
        }
        // Established (or surplus) socket went away: evict the slot so the
        // next request reconnects.
        let mut remove_machine = false;
        let evicted = state.connections.get_mut(machine).and_then(|slots| {
            let slot = slots.remove(url);
            if slots.is_empty() {
                remove_machine = true;
            }
            slot
        });
        if remove_machine {
            state.connections.remove(machine);
            state.attempts.remove(machine);
        }
        drop(state);
        if let Some(slot) = evicted {
            // Drop the signal links so the socket's subscriber list does not
            // keep the slot's socket alive.
            slot.socket.connected.async_disconnect(slot.connected_link);
            slot.socket
                .disconnected
                .async_disconnect(slot.disconnected_link);
        }
    }

    /// Close every socket and fail every pending attempt with
    /// "session closed".
    pub fn close(self: &Arc<Self>) {
        let slots: Vec<ConnectionSlot> = {
            // Do not hold the lock while disconnecting: the disconnect
            // handlers re-enter the cache.
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.dying = true;
            let mut out = Vec::new();
            for (_, slots) in state.connections.drain() {
                for (_, slot) in slots {
                    out.push(slot);
                }
            }
            state.attempts.clear();
            out
        };
        for slot in slots {
            // Unsubscribe before disconnecting, otherwise the disconnect
            // handler runs against a cache that is being torn down.
            slot.socket.connected.async_disconnect(slot.connected_link);
            slot.socket
                .disconnected
                .async_disconnect(slot.disconnected_link);
            if slot.socket.is_connected() {
                slot.socket.close();
            }
            slot.promise.set_error(Error::SessionClosed.to_string());
        }
    }

    /// Number of cached or in-flight slots, for tests and diagnostics.
    pub fn slot_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.connections.values().map(|m| m.len()).sum())
            .unwrap_or(0)
    }
}
