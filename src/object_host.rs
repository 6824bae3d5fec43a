//! Object hosting: routing messages to bound objects by object id.
//!
//! Each service owns one [`ObjectHost`]. Id 1 is the service's main object;
//! ids from 2 upward are sub-objects a method returned (the reply carries an
//! object reference and the object lives here until `terminate`d or the
//! service goes away).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::bound_object::{BoundObject, MAIN_OBJECT_ID};
use crate::runtime::Executor;
use crate::signal::CallType;
use crate::transport::{SocketId, TransportSocket};
use crate::types::object::AnyObject;
use crate::wire::{Message, MessageKind};

/// A collection of bound objects addressed by object id.
pub struct ObjectHost {
    service: u32,
    executor: Executor,
    objects: DashMap<u32, Arc<BoundObject>>,
    next_object_id: AtomicU32,
}

impl ObjectHost {
    pub fn new(service: u32, executor: Executor) -> Arc<Self> {
        Arc::new(ObjectHost {
            service,
            executor,
            objects: DashMap::new(),
            next_object_id: AtomicU32::new(MAIN_OBJECT_ID + 1),
        })
    }

    pub fn service(&self) -> u32 {
        self.service
    }

    /// Install a bound object under its id.
    pub fn add_object(self: &Arc<Self>, bound: Arc<BoundObject>) {
        bound.set_owner(Arc::downgrade(self));
        self.objects.insert(bound.object_id(), bound);
    }

    /// Host `object` under a fresh sub-object id; returns the id.
    pub fn host_object(self: &Arc<Self>, object: AnyObject) -> u32 {
        let id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        let bound = BoundObject::new(
            self.service,
            id,
            object,
            CallType::Queued,
            self.executor.clone(),
        );
        self.add_object(bound);
        id
    }

    /// Drop the object with this id, releasing the host's reference.
    pub fn remove_object(&self, id: u32) -> bool {
        self.objects.remove(&id).is_some()
    }

    pub fn object(&self, id: u32) -> Option<Arc<BoundObject>> {
        self.objects.get(&id).map(|entry| entry.value().clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Route a message to the addressed object.
    pub fn dispatch(&self, msg: Message, socket: &Arc<TransportSocket>) {
        let Some(bound) = self.object(msg.address.object) else {
            tracing::warn!(
                service = self.service,
                "no object {} for message {}",
                msg.address.object,
                msg.address
            );
            if msg.kind == MessageKind::Call {
                let mut ret = Message::response_to(msg.address, MessageKind::Reply);
                ret.set_error(format!("unknown object {}", msg.address.object));
                if let Err(e) = socket.send(ret) {
                    tracing::debug!("failed to send unknown-object reply: {}", e);
                }
            }
            return;
        };
        bound.on_message(msg, socket);
    }

    /// Propagate a socket disconnect to every hosted object.
    pub fn on_socket_disconnected(&self, socket_id: SocketId, error: &str) {
        let objects: Vec<Arc<BoundObject>> =
            self.objects.iter().map(|e| e.value().clone()).collect();
        for bound in objects {
            bound.on_socket_disconnected(socket_id, error);
        }
    }

    /// Drop every hosted object.
    pub fn clear(&self) {
        self.objects.clear();
    }
}
