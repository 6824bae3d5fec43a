//! Service directory.
//!
//! The authoritative registry of services: `name → id → ServiceInfo` plus
//! the socket that owns each registration, so services die with their
//! connection. Registration is two-phase — `registerService` parks the entry
//! in a *pending* set and only `serviceReady` makes it visible — so a client
//! resolving a name never observes a service whose endpoints are not yet
//! reachable.
//!
//! Services whose name starts with `_` are hidden: they register and resolve
//! normally but never produce `serviceAdded`/`serviceRemoved` emissions.
//!
//! Over the wire the directory is service id 1, object 1, with a fixed
//! member layout (ids 100..):
//!
//! | id | member |
//! |----|--------|
//! | 100 | `service(name) → ServiceInfo` |
//! | 101 | `services() → [ServiceInfo]` |
//! | 102 | `registerService(info) → id` |
//! | 103 | `unregisterService(id)` |
//! | 104 | `serviceReady(id)` |
//! | 105 | `updateServiceInfo(info)` |
//! | 106 | signal `serviceAdded(id, name)` |
//! | 107 | signal `serviceRemoved(id, name)` |
//! | 108 | `machineId() → string` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::transport::{SocketId, TransportSocket};
use crate::types::object::{AnyObject, ObjectBuilder};
use crate::types::signature::Signature;
use crate::types::value::AnyValue;
use crate::url::Url;

/// Service id every peer resolves the directory at.
pub const SERVICE_DIRECTORY_ID: u32 = 1;

/// Fixed wire ids of the directory members.
pub const ACTION_SD_SERVICE: u32 = 100;
pub const ACTION_SD_SERVICES: u32 = 101;
pub const ACTION_SD_REGISTER_SERVICE: u32 = 102;
pub const ACTION_SD_UNREGISTER_SERVICE: u32 = 103;
pub const ACTION_SD_SERVICE_READY: u32 = 104;
pub const ACTION_SD_UPDATE_SERVICE_INFO: u32 = 105;
pub const ACTION_SD_SERVICE_ADDED: u32 = 106;
pub const ACTION_SD_SERVICE_REMOVED: u32 = 107;
pub const ACTION_SD_MACHINE_ID: u32 = 108;

/// Record describing one registered service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    /// Assigned by the directory at registration; 0 until then.
    pub service_id: u32,
    pub machine_id: String,
    pub process_id: u32,
    pub session_id: String,
    /// Ordered candidate endpoints.
    pub endpoints: Vec<Url>,
}

impl ServiceInfo {
    /// Wire form: `(sIsIs[s])`.
    pub const SIGNATURE: &'static str = "(sIsIs[s])";

    pub fn new(name: impl Into<String>) -> Self {
        ServiceInfo {
            name: name.into(),
            service_id: 0,
            machine_id: String::new(),
            process_id: std::process::id(),
            session_id: String::new(),
            endpoints: Vec::new(),
        }
    }

    /// Hidden services are not announced.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('_')
    }

    pub fn to_value(&self) -> AnyValue {
        AnyValue::Tuple(vec![
            AnyValue::str(&self.name),
            AnyValue::uint32(self.service_id),
            AnyValue::str(&self.machine_id),
            AnyValue::uint32(self.process_id),
            AnyValue::str(&self.session_id),
            AnyValue::List(
                self.endpoints
                    .iter()
                    .map(|u| AnyValue::str(u.to_string()))
                    .collect(),
            ),
        ])
    }

    pub fn from_value(value: &AnyValue) -> Result<ServiceInfo> {
        let bad = || Error::Protocol("malformed ServiceInfo value".into());
        let AnyValue::Tuple(fields) = value else {
            return Err(bad());
        };
        let [name, id, machine, process, session, endpoints] = fields.as_slice() else {
            return Err(bad());
        };
        let AnyValue::List(endpoint_values) = endpoints else {
            return Err(bad());
        };
        let endpoints = endpoint_values
            .iter()
            .map(|v| Url::parse(v.as_str().ok_or_else(bad)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(ServiceInfo {
            name: name.as_str().ok_or_else(bad)?.to_string(),
            service_id: id.as_u32().ok_or_else(bad)?,
            machine_id: machine.as_str().ok_or_else(bad)?.to_string(),
            process_id: process.as_u32().ok_or_else(bad)?,
            session_id: session.as_str().ok_or_else(bad)?.to_string(),
            endpoints,
        })
    }
}

#[derive(Default)]
struct DirectoryState {
    /// Registered but not yet ready.
    pending: HashMap<u32, ServiceInfo>,
    /// Ready (resolvable) services.
    connected: HashMap<u32, ServiceInfo>,
    name_to_id: HashMap<String, u32>,
    socket_to_ids: HashMap<SocketId, Vec<u32>>,
    id_to_socket: HashMap<u32, Weak<TransportSocket>>,
    services_count: u32,
}

/// Pending announcement, fired after the lock is released.
enum Announce {
    Added(u32, String),
    Removed(u32, String),
    None,
}

/// The process-lived service registry.
pub struct ServiceDirectory {
    machine_id: String,
    state: Mutex<DirectoryState>,
    /// `(id, name)` for every non-hidden service becoming ready.
    pub service_added: Signal,
    /// `(id, name)` for every non-hidden service going away.
    pub service_removed: Signal,
}

impl ServiceDirectory {
    pub fn new(machine_id: impl Into<String>) -> Arc<Self> {
        let event_signature = Signature::parse("(Is)").unwrap_or_else(|_| Signature::dynamic());
        Arc::new(ServiceDirectory {
            machine_id: machine_id.into(),
            state: Mutex::new(DirectoryState::default()),
            service_added: Signal::new(event_signature.clone()),
            service_removed: Signal::new(event_signature),
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Register `info` in the pending set, owned by `socket`.
    ///
    /// Fails with [`DuplicateName`](Error::DuplicateName) when the name is
    /// taken. Returns the assigned service id.
    pub fn register_service(
        &self,
        info: &ServiceInfo,
        socket: Option<&Arc<TransportSocket>>,
    ) -> Result<u32> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Call("directory poisoned".into()));
        };
        if state.name_to_id.contains_key(&info.name) {
            tracing::warn!(
                "service '{}' is already registered, rejecting conflicting registration",
                info.name
            );
            return Err(Error::DuplicateName(info.name.clone()));
        }
        state.services_count += 1;
        let id = state.services_count;
        let mut info = info.clone();
        info.service_id = id;
        state.name_to_id.insert(info.name.clone(), id);
        if let Some(socket) = socket {
            // The directory itself has no owning socket.
            if id != SERVICE_DIRECTORY_ID {
                state.socket_to_ids.entry(socket.id()).or_default().push(id);
            }
            state.id_to_socket.insert(id, Arc::downgrade(socket));
        }
        if info.is_hidden() {
            tracing::debug!("registered service '{}' (#{})", info.name, id);
        } else {
            tracing::info!("registered service '{}' (#{})", info.name, id);
        }
        for endpoint in &info.endpoints {
            tracing::debug!("service '{}' is now on {}", info.name, endpoint);
        }
        state.pending.insert(id, info);
        Ok(id)
    }

    /// Move a pending service into the connected set and announce it.
    pub fn service_ready(&self, id: u32) -> Result<()> {
        let announce = {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::Call("directory poisoned".into()));
            };
            let Some(info) = state.pending.remove(&id) else {
                tracing::error!("can't find pending service #{}", id);
                return Err(Error::NotPending(id));
            };
            let announce = if info.is_hidden() {
                Announce::None
            } else {
                Announce::Added(id, info.name.clone())
            };
            state.connected.insert(id, info);
            announce
        };
        self.fire(announce);
        Ok(())
    }

    /// Remove a service from whichever set holds it and announce the
    /// removal.
    pub fn unregister_service(&self, id: u32) -> Result<()> {
        let announce = {
            let Ok(mut state) = self.state.lock() else {
                return Err(Error::Call("directory poisoned".into()));
            };
            let (info, _pending) = match state.connected.remove(&id) {
                Some(info) => (info, false),
                None => match state.pending.remove(&id) {
                    Some(info) => (info, true),
                    None => {
                        tracing::debug!("unregister service: can't find service #{}", id);
                        return Err(Error::NotFound(format!("#{}", id)));
                    }
                },
            };
            state.name_to_id.remove(&info.name);
            state.id_to_socket.remove(&id);
            for ids in state.socket_to_ids.values_mut() {
                ids.retain(|sid| *sid != id);
            }
            if info.is_hidden() {
                tracing::debug!("unregistered service '{}' (#{})", info.name, id);
                Announce::None
            } else {
                tracing::info!("unregistered service '{}' (#{})", info.name, id);
                Announce::Removed(id, info.name)
            }
        };
        self.fire(announce);
        Ok(())
    }

    /// Every ready service.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state
            .lock()
            .map(|s| s.connected.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolve a ready service by name.
    pub fn service(&self, name: &str) -> Result<ServiceInfo> {
        let Ok(state) = self.state.lock() else {
            return Err(Error::Call("directory poisoned".into()));
        };
        let id = state
            .name_to_id
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        state
            .connected
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Replace the endpoints of a service by id — and of every service
    /// sharing its session id, which covers a whole process moving.
    pub fn update_service_info(&self, info: &ServiceInfo) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Call("directory poisoned".into()));
        };
        if !info.session_id.is_empty() {
            for service in state.connected.values_mut() {
                if service.session_id == info.session_id {
                    service.endpoints = info.endpoints.clone();
                }
            }
        }
        if let Some(service) = state.connected.get_mut(&info.service_id) {
            *service = info.clone();
            return Ok(());
        }
        if let Some(service) = state.pending.get_mut(&info.service_id) {
            *service = info.clone();
            return Ok(());
        }
        tracing::debug!("updateServiceInfo: can't find service #{}", info.service_id);
        Err(Error::NotFound(format!("#{}", info.service_id)))
    }

    /// The socket that registered a service, if it is still alive.
    pub fn socket_of_service(&self, id: u32) -> Option<Arc<TransportSocket>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.id_to_socket.get(&id).and_then(Weak::upgrade))
    }

    /// Garbage-collect every service owned by a disconnected socket.
    pub fn on_socket_disconnected(&self, socket_id: SocketId) {
        let ids = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.socket_to_ids.remove(&socket_id).unwrap_or_default()
        };
        for id in ids {
            tracing::info!("service #{} disconnected", id);
            if let Err(e) = self.unregister_service(id) {
                tracing::warn!("cannot unregister service #{}: {}", id, e);
            }
        }
    }

    fn fire(&self, announce: Announce) {
        // Never emit under the directory lock: subscribers call back in.
        match announce {
            Announce::Added(id, name) => self
                .service_added
                .emit(vec![AnyValue::uint32(id), AnyValue::str(name)]),
            Announce::Removed(id, name) => self
                .service_removed
                .emit(vec![AnyValue::uint32(id), AnyValue::str(name)]),
            Announce::None => {}
        }
    }
}

/// Build the wire-facing object for a directory, with the fixed id layout.
pub fn directory_object(directory: &Arc<ServiceDirectory>) -> Result<AnyObject> {
    let mut builder = ObjectBuilder::new();
    builder.set_description("service directory");

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_SERVICE,
        "service",
        "(s)",
        ServiceInfo::SIGNATURE,
        move |args, _ctx| {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Protocol("service() expects a name".into()))?;
            dir.service(name).map(|info| info.to_value())
        },
    )?;

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_SERVICES,
        "services",
        "()",
        &format!("[{}]", ServiceInfo::SIGNATURE),
        move |_args, _ctx| {
            Ok(AnyValue::List(
                dir.services().iter().map(ServiceInfo::to_value).collect(),
            ))
        },
    )?;

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_REGISTER_SERVICE,
        "registerService",
        &format!("({})", ServiceInfo::SIGNATURE),
        "I",
        move |args, ctx| {
            let info = ServiceInfo::from_value(
                args.first()
                    .ok_or_else(|| Error::Protocol("registerService() expects an info".into()))?,
            )?;
            let id = dir.register_service(&info, ctx.socket.as_ref())?;
            Ok(AnyValue::uint32(id))
        },
    )?;

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_UNREGISTER_SERVICE,
        "unregisterService",
        "(I)",
        "v",
        move |args, _ctx| {
            let id = args
                .first()
                .and_then(AnyValue::as_u32)
                .ok_or_else(|| Error::Protocol("unregisterService() expects an id".into()))?;
            dir.unregister_service(id)?;
            Ok(AnyValue::Void)
        },
    )?;

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_SERVICE_READY,
        "serviceReady",
        "(I)",
        "v",
        move |args, _ctx| {
            let id = args
                .first()
                .and_then(AnyValue::as_u32)
                .ok_or_else(|| Error::Protocol("serviceReady() expects an id".into()))?;
            dir.service_ready(id)?;
            Ok(AnyValue::Void)
        },
    )?;

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_UPDATE_SERVICE_INFO,
        "updateServiceInfo",
        &format!("({})", ServiceInfo::SIGNATURE),
        "v",
        move |args, _ctx| {
            let info = ServiceInfo::from_value(
                args.first()
                    .ok_or_else(|| Error::Protocol("updateServiceInfo() expects an info".into()))?,
            )?;
            dir.update_service_info(&info)?;
            Ok(AnyValue::Void)
        },
    )?;

    builder.advertise_existing_signal_with_id(
        ACTION_SD_SERVICE_ADDED,
        "serviceAdded",
        directory.service_added.clone(),
    );
    builder.advertise_existing_signal_with_id(
        ACTION_SD_SERVICE_REMOVED,
        "serviceRemoved",
        directory.service_removed.clone(),
    );

    let dir = directory.clone();
    builder.advertise_method_with_id(
        ACTION_SD_MACHINE_ID,
        "machineId",
        "()",
        "s",
        move |_args, _ctx| Ok(AnyValue::str(dir.machine_id())),
    )?;

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::signal::SignalSubscriber;

    fn info(name: &str) -> ServiceInfo {
        let mut info = ServiceInfo::new(name);
        info.machine_id = "m".into();
        info.session_id = "s".into();
        info.endpoints = vec![Url::parse("tcp://127.0.0.1:9559").unwrap()];
        info
    }

    #[test_log::test]
    fn two_phase_registration() {
        let dir = ServiceDirectory::new("m");
        let id = dir.register_service(&info("calculator"), None).unwrap();
        // Pending services do not resolve.
        assert!(matches!(
            dir.service("calculator"),
            Err(Error::NotFound(_))
        ));
        assert!(dir.services().is_empty());
        dir.service_ready(id).unwrap();
        assert_eq!(dir.service("calculator").unwrap().service_id, id);
        assert_eq!(dir.services().len(), 1);
    }

    #[test_log::test]
    fn duplicate_name_is_rejected_and_first_wins() {
        let dir = ServiceDirectory::new("m");
        let id = dir.register_service(&info("svc1"), None).unwrap();
        dir.service_ready(id).unwrap();
        let err = dir.register_service(&info("svc1"), None).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(dir.service("svc1").unwrap().service_id, id);
    }

    #[test_log::test]
    fn ids_are_monotonic() {
        let dir = ServiceDirectory::new("m");
        let a = dir.register_service(&info("a"), None).unwrap();
        let b = dir.register_service(&info("b"), None).unwrap();
        dir.unregister_service(a).unwrap();
        let c = dir.register_service(&info("c"), None).unwrap();
        assert!(b > a);
        assert!(c > b);
    }

    #[test_log::test]
    fn service_ready_requires_pending() {
        let dir = ServiceDirectory::new("m");
        assert!(matches!(dir.service_ready(42), Err(Error::NotPending(42))));
        let id = dir.register_service(&info("a"), None).unwrap();
        dir.service_ready(id).unwrap();
        // A second ready for the same id no longer finds it pending.
        assert!(matches!(dir.service_ready(id), Err(Error::NotPending(_))));
    }

    #[test_log::test]
    fn announcements_fire_for_visible_services_only() {
        let dir = ServiceDirectory::new("m");
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let a = added.clone();
        dir.service_added
            .connect(SignalSubscriber::callback(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        let r = removed.clone();
        dir.service_removed
            .connect(SignalSubscriber::callback(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let visible = dir.register_service(&info("visible"), None).unwrap();
        let hidden = dir.register_service(&info("_hidden"), None).unwrap();
        dir.service_ready(visible).unwrap();
        dir.service_ready(hidden).unwrap();
        dir.unregister_service(hidden).unwrap();
        dir.unregister_service(visible).unwrap();

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn unregister_unknown_service_fails() {
        let dir = ServiceDirectory::new("m");
        assert!(matches!(
            dir.unregister_service(9),
            Err(Error::NotFound(_))
        ));
    }

    #[test_log::test]
    fn update_service_info_replaces_endpoints() {
        let dir = ServiceDirectory::new("m");
        let id = dir.register_service(&info("a"), None).unwrap();
        dir.service_ready(id).unwrap();
        let mut updated = dir.service("a").unwrap();
        updated.endpoints = vec![Url::parse("tcp://10.0.0.9:4444").unwrap()];
        dir.update_service_info(&updated).unwrap();
        assert_eq!(dir.service("a").unwrap().endpoints, updated.endpoints);
    }

    #[test_log::test]
    fn service_info_round_trips_through_value() {
        let mut i = info("calculator");
        i.service_id = 12;
        let back = ServiceInfo::from_value(&i.to_value()).unwrap();
        assert_eq!(back, i);
    }

    #[test_log::test]
    fn name_and_id_are_inverse_on_connected_set() {
        let dir = ServiceDirectory::new("m");
        for name in ["a", "b", "c"] {
            let id = dir.register_service(&info(name), None).unwrap();
            dir.service_ready(id).unwrap();
        }
        for service in dir.services() {
            assert_eq!(
                dir.service(&service.name).unwrap().service_id,
                service.service_id
            );
        }
    }
}
