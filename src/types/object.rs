//! Object reflection and dynamic dispatch.
//!
//! A [`MetaObject`] describes what an object advertises: methods, signals and
//! properties, each under a numeric id. [`DynamicObject`] is the uniform
//! dispatch surface the messaging layer drives; [`ObjectBuilder`] assembles
//! one from closures, the way services are defined in-process.
//!
//! Id layout (consistent across peers):
//!
//! | Range | Meaning |
//! |---|---|
//! | `0..80` | bound-object self-interface (registerEvent, metaObject, ...) |
//! | `80..100` | reserved for manageable operations (stats, tracing) |
//! | `100..` | user methods, signals and properties |

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::runtime::Strand;
use crate::signal::Signal;
use crate::types::convert::convert;
use crate::types::signature::Signature;
use crate::types::value::AnyValue;

/// First id reserved for manageable operations.
pub const SELF_METHOD_END: u32 = 80;
/// First id available to user members.
pub const USER_MEMBER_START: u32 = 100;

/// An advertised method.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaMethod {
    pub uid: u32,
    pub name: String,
    /// Parameter tuple signature.
    pub parameters: Signature,
    /// Return value signature.
    pub returns: Signature,
}

/// An advertised signal.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaSignal {
    pub uid: u32,
    pub name: String,
    /// Parameter tuple signature.
    pub signature: Signature,
}

/// An advertised property.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaProperty {
    pub uid: u32,
    pub name: String,
    pub signature: Signature,
}

/// Reflection data for one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaObject {
    methods: BTreeMap<u32, MetaMethod>,
    signals: BTreeMap<u32, MetaSignal>,
    properties: BTreeMap<u32, MetaProperty>,
    description: String,
}

impl MetaObject {
    pub fn method(&self, uid: u32) -> Option<&MetaMethod> {
        self.methods.get(&uid)
    }

    pub fn signal(&self, uid: u32) -> Option<&MetaSignal> {
        self.signals.get(&uid)
    }

    pub fn property(&self, uid: u32) -> Option<&MetaProperty> {
        self.properties.get(&uid)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MetaMethod> {
        self.methods.values()
    }

    pub fn signals(&self) -> impl Iterator<Item = &MetaSignal> {
        self.signals.values()
    }

    pub fn properties(&self) -> impl Iterator<Item = &MetaProperty> {
        self.properties.values()
    }

    pub fn method_id(&self, name: &str) -> Option<u32> {
        self.methods
            .values()
            .find(|m| m.name == name)
            .map(|m| m.uid)
    }

    pub fn signal_id(&self, name: &str) -> Option<u32> {
        self.signals
            .values()
            .find(|s| s.name == name)
            .map(|s| s.uid)
    }

    pub fn property_id(&self, name: &str) -> Option<u32> {
        self.properties
            .values()
            .find(|p| p.name == name)
            .map(|p| p.uid)
    }

    pub fn add_method(&mut self, method: MetaMethod) {
        self.methods.insert(method.uid, method);
    }

    pub fn add_signal(&mut self, signal: MetaSignal) {
        self.signals.insert(signal.uid, signal);
    }

    pub fn add_property(&mut self, property: MetaProperty) {
        self.properties.insert(property.uid, property);
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Union of two meta objects; `a` wins on id collision. The self
    /// interface merged with the user object is what `metaObject` reports.
    pub fn merge(a: &MetaObject, b: &MetaObject) -> MetaObject {
        let mut out = b.clone();
        for m in a.methods.values() {
            out.methods.insert(m.uid, m.clone());
        }
        for s in a.signals.values() {
            out.signals.insert(s.uid, s.clone());
        }
        for p in a.properties.values() {
            out.properties.insert(p.uid, p.clone());
        }
        if out.description.is_empty() {
            out.description = a.description.clone();
        }
        out
    }

    /// Wire form: `({I(Isss)}{I(Iss)}{I(Iss)}s)`.
    pub const SIGNATURE: &'static str = "({I(Isss)}{I(Iss)}{I(Iss)}s)";

    pub fn to_value(&self) -> AnyValue {
        let methods = self
            .methods
            .values()
            .map(|m| {
                (
                    AnyValue::uint32(m.uid),
                    AnyValue::Tuple(vec![
                        AnyValue::uint32(m.uid),
                        AnyValue::str(&m.name),
                        AnyValue::str(m.parameters.to_string()),
                        AnyValue::str(m.returns.to_string()),
                    ]),
                )
            })
            .collect();
        let event = |uid: u32, name: &str, sig: &Signature| {
            (
                AnyValue::uint32(uid),
                AnyValue::Tuple(vec![
                    AnyValue::uint32(uid),
                    AnyValue::str(name),
                    AnyValue::str(sig.to_string()),
                ]),
            )
        };
        let signals = self
            .signals
            .values()
            .map(|s| event(s.uid, &s.name, &s.signature))
            .collect();
        let properties = self
            .properties
            .values()
            .map(|p| event(p.uid, &p.name, &p.signature))
            .collect();
        AnyValue::Tuple(vec![
            AnyValue::Map(methods),
            AnyValue::Map(signals),
            AnyValue::Map(properties),
            AnyValue::str(&self.description),
        ])
    }

    pub fn from_value(value: &AnyValue) -> Result<MetaObject> {
        let bad = || Error::Protocol("malformed MetaObject value".into());
        let AnyValue::Tuple(parts) = value else {
            return Err(bad());
        };
        let [methods, signals, properties, description] = parts.as_slice() else {
            return Err(bad());
        };
        let mut out = MetaObject::default();
        let AnyValue::Map(methods) = methods else {
            return Err(bad());
        };
        for (_, m) in methods {
            let AnyValue::Tuple(fields) = m else {
                return Err(bad());
            };
            let [uid, name, params, returns] = fields.as_slice() else {
                return Err(bad());
            };
            out.add_method(MetaMethod {
                uid: uid.as_u32().ok_or_else(bad)?,
                name: name.as_str().ok_or_else(bad)?.to_string(),
                parameters: Signature::parse(params.as_str().ok_or_else(bad)?)?,
                returns: Signature::parse(returns.as_str().ok_or_else(bad)?)?,
            });
        }
        let mut read_events = |value: &AnyValue| -> Result<Vec<(u32, String, Signature)>> {
            let AnyValue::Map(entries) = value else {
                return Err(bad());
            };
            entries
                .iter()
                .map(|(_, e)| {
                    let AnyValue::Tuple(fields) = e else {
                        return Err(bad());
                    };
                    let [uid, name, sig] = fields.as_slice() else {
                        return Err(bad());
                    };
                    Ok((
                        uid.as_u32().ok_or_else(bad)?,
                        name.as_str().ok_or_else(bad)?.to_string(),
                        Signature::parse(sig.as_str().ok_or_else(bad)?)?,
                    ))
                })
                .collect()
        };
        for (uid, name, signature) in read_events(signals)? {
            out.add_signal(MetaSignal {
                uid,
                name,
                signature,
            });
        }
        for (uid, name, signature) in read_events(properties)? {
            out.add_property(MetaProperty {
                uid,
                name,
                signature,
            });
        }
        out.description = description.as_str().ok_or_else(bad)?.to_string();
        Ok(out)
    }
}

/// Per-call context threaded through dynamic invocations.
///
/// The self-interface methods of a bound object need to know which socket
/// issued the call; the dispatcher passes it here explicitly instead of
/// stashing it in the object.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Socket the call arrived on; `None` for purely local invocations.
    pub socket: Option<Arc<crate::transport::TransportSocket>>,
}

impl CallContext {
    /// Context of a local (in-process) invocation.
    pub fn local() -> Self {
        Self::default()
    }

    /// Context of a call received on `socket`.
    pub fn from_socket(socket: Arc<crate::transport::TransportSocket>) -> Self {
        CallContext {
            socket: Some(socket),
        }
    }
}

/// Uniform dynamic dispatch surface.
///
/// Invocations are synchronous from the trait's point of view; a deferred
/// result is returned as [`AnyValue::Future`] and resolved by the caller
/// (the bound object's reply adapter does exactly that).
pub trait DynamicObject: Send + Sync {
    fn meta_object(&self) -> &MetaObject;

    /// Invoke a method. Arguments have already been converted to the
    /// method's parameter types.
    fn invoke(&self, method: u32, args: Vec<AnyValue>, ctx: &CallContext) -> Result<AnyValue>;

    /// The signal (or property signal) with this id.
    fn signal(&self, id: u32) -> Option<Signal>;

    fn property(&self, key: &AnyValue) -> Result<AnyValue>;

    fn set_property(&self, key: &AnyValue, value: AnyValue) -> Result<()>;

    /// Fire-and-forget: a signal id triggers the signal, a method id invokes
    /// and discards the result.
    fn post(&self, target: u32, args: Vec<AnyValue>, ctx: &CallContext) {
        if let Some(signal) = self.signal(target) {
            signal.emit(args);
            return;
        }
        if let Err(e) = self.invoke(target, args, ctx) {
            tracing::debug!("dropped post to {}: {}", target, e);
        }
    }

    /// The strand serializing this object's queued invocations, when the
    /// object is an actor.
    fn strand(&self) -> Option<Strand> {
        None
    }
}

/// Shared handle to a dynamic object.
pub type AnyObject = Arc<dyn DynamicObject>;

/// A readable/writable slot that is also a signal: every successful set
/// emits the new value.
pub struct Property {
    signature: Signature,
    value: Mutex<AnyValue>,
    signal: Signal,
}

impl Property {
    pub fn new(signature: Signature, initial: AnyValue) -> Result<Self> {
        let value = convert(initial, &signature)?;
        let signal = Signal::new(Signature::from_type(
            crate::types::signature::Type::Tuple(vec![signature.kind().clone()]),
        ));
        Ok(Property {
            signature,
            value: Mutex::new(value),
            signal,
        })
    }

    pub fn get(&self) -> AnyValue {
        self.value
            .lock()
            .map(|v| v.clone())
            .unwrap_or(AnyValue::Void)
    }

    pub fn set(&self, value: AnyValue) -> Result<()> {
        let converted = convert(value, &self.signature)?;
        if let Ok(mut slot) = self.value.lock() {
            *slot = converted.clone();
        }
        self.signal.emit(vec![converted]);
        Ok(())
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}

type MethodImpl = Arc<dyn Fn(Vec<AnyValue>, &CallContext) -> Result<AnyValue> + Send + Sync>;

/// Assembles a [`DynamicObject`] from closures.
///
/// Member ids are allocated from [`USER_MEMBER_START`] upward in advertise
/// order; the `*_with_id` variants pin specific ids (the service directory
/// protocol depends on its fixed layout).
pub struct ObjectBuilder {
    meta: MetaObject,
    methods: HashMap<u32, MethodImpl>,
    signals: HashMap<u32, Signal>,
    properties: HashMap<u32, Arc<Property>>,
    strand: Option<Strand>,
    next_id: u32,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        ObjectBuilder {
            meta: MetaObject::default(),
            methods: HashMap::new(),
            signals: HashMap::new(),
            properties: HashMap::new(),
            strand: None,
            next_id: USER_MEMBER_START,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Advertise a method; returns its id.
    pub fn advertise_method<F>(
        &mut self,
        name: &str,
        parameters: &str,
        returns: &str,
        f: F,
    ) -> Result<u32>
    where
        F: Fn(Vec<AnyValue>, &CallContext) -> Result<AnyValue> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.advertise_method_with_id(id, name, parameters, returns, f)?;
        Ok(id)
    }

    /// Advertise a method under a fixed id.
    pub fn advertise_method_with_id<F>(
        &mut self,
        id: u32,
        name: &str,
        parameters: &str,
        returns: &str,
        f: F,
    ) -> Result<()>
    where
        F: Fn(Vec<AnyValue>, &CallContext) -> Result<AnyValue> + Send + Sync + 'static,
    {
        self.meta.add_method(MetaMethod {
            uid: id,
            name: name.to_string(),
            parameters: Signature::parse(parameters)?,
            returns: Signature::parse(returns)?,
        });
        self.methods.insert(id, Arc::new(f));
        self.next_id = self.next_id.max(id + 1);
        Ok(())
    }

    /// Advertise a signal; returns its id and a handle for emitting.
    pub fn advertise_signal(&mut self, name: &str, parameters: &str) -> Result<(u32, Signal)> {
        let id = self.allocate_id();
        let signal = self.advertise_signal_with_id(id, name, parameters)?;
        Ok((id, signal))
    }

    /// Advertise a signal under a fixed id.
    pub fn advertise_signal_with_id(
        &mut self,
        id: u32,
        name: &str,
        parameters: &str,
    ) -> Result<Signal> {
        let signature = Signature::parse(parameters)?;
        let signal = Signal::new(signature.clone());
        self.advertise_existing_signal_with_id(id, name, signal.clone());
        Ok(signal)
    }

    /// Advertise a signal that already exists elsewhere (a struct field the
    /// in-process side emits directly).
    pub fn advertise_existing_signal_with_id(&mut self, id: u32, name: &str, signal: Signal) {
        self.meta.add_signal(MetaSignal {
            uid: id,
            name: name.to_string(),
            signature: signal.signature().clone(),
        });
        self.signals.insert(id, signal);
        self.next_id = self.next_id.max(id + 1);
    }

    /// Advertise a property; returns its id and the property handle.
    pub fn advertise_property(
        &mut self,
        name: &str,
        signature: &str,
        initial: AnyValue,
    ) -> Result<(u32, Arc<Property>)> {
        let id = self.allocate_id();
        let signature = Signature::parse(signature)?;
        let property = Arc::new(Property::new(signature.clone(), initial)?);
        self.meta.add_property(MetaProperty {
            uid: id,
            name: name.to_string(),
            signature,
        });
        self.properties.insert(id, property.clone());
        Ok((id, property))
    }

    /// Bind the object to a strand: queued invocations serialize on it.
    pub fn set_strand(&mut self, strand: Strand) {
        self.strand = Some(strand);
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.meta.set_description(description);
    }

    pub fn build(self) -> AnyObject {
        Arc::new(GenericObject {
            meta: self.meta,
            methods: self.methods,
            signals: self.signals,
            properties: self.properties,
            strand: self.strand,
        })
    }
}

impl Default for ObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct GenericObject {
    meta: MetaObject,
    methods: HashMap<u32, MethodImpl>,
    signals: HashMap<u32, Signal>,
    properties: HashMap<u32, Arc<Property>>,
    strand: Option<Strand>,
}

impl GenericObject {
    fn resolve_property(&self, key: &AnyValue) -> Result<&Arc<Property>> {
        let id = if let Some(name) = key.as_str() {
            self.meta
                .property_id(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?
        } else if let Some(id) = key.as_u32() {
            id
        } else {
            return Err(Error::Protocol(
                "Expected int or string for property index".into(),
            ));
        };
        self.properties
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("property {}", id)))
    }
}

impl DynamicObject for GenericObject {
    fn meta_object(&self) -> &MetaObject {
        &self.meta
    }

    fn invoke(&self, method: u32, args: Vec<AnyValue>, ctx: &CallContext) -> Result<AnyValue> {
        let f = self.methods.get(&method).ok_or(Error::NoSuchMethod(method))?;
        f(args, ctx)
    }

    fn signal(&self, id: u32) -> Option<Signal> {
        if let Some(signal) = self.signals.get(&id) {
            return Some(signal.clone());
        }
        self.properties.get(&id).map(|p| p.signal().clone())
    }

    fn property(&self, key: &AnyValue) -> Result<AnyValue> {
        Ok(self.resolve_property(key)?.get())
    }

    fn set_property(&self, key: &AnyValue, value: AnyValue) -> Result<()> {
        self.resolve_property(key)?.set(value)
    }

    fn strand(&self) -> Option<Strand> {
        self.strand.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn builder_allocates_user_ids() {
        let mut builder = ObjectBuilder::new();
        let id = builder
            .advertise_method("reply", "(s)", "s", |mut args, _| {
                Ok(args.pop().unwrap_or(AnyValue::Void))
            })
            .unwrap();
        assert_eq!(id, USER_MEMBER_START);
        let (sig_id, _) = builder.advertise_signal("fire", "(i)").unwrap();
        assert_eq!(sig_id, USER_MEMBER_START + 1);
        let obj = builder.build();
        assert_eq!(obj.meta_object().method_id("reply"), Some(id));
        let out = obj
            .invoke(id, vec![AnyValue::str("ok")], &CallContext::local())
            .unwrap();
        assert_eq!(out, AnyValue::str("ok"));
    }

    #[test_log::test]
    fn unknown_method_fails() {
        let obj = ObjectBuilder::new().build();
        assert!(matches!(
            obj.invoke(999, vec![], &CallContext::local()),
            Err(Error::NoSuchMethod(999))
        ));
    }

    #[test_log::test]
    fn property_emits_on_set() {
        let mut builder = ObjectBuilder::new();
        let (id, property) = builder
            .advertise_property("volume", "i", AnyValue::int32(10))
            .unwrap();
        let obj = builder.build();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        property
            .signal()
            .connect(crate::signal::SignalSubscriber::callback(move |args| {
                s.lock().unwrap().push(args[0].as_i64().unwrap());
            }))
            .unwrap();

        obj.set_property(&AnyValue::str("volume"), AnyValue::int32(42))
            .unwrap();
        assert_eq!(
            obj.property(&AnyValue::uint32(id)).unwrap(),
            AnyValue::int32(42)
        );
        assert_eq!(*seen.lock().unwrap(), vec![42]);
        // Type mismatch is rejected and does not emit.
        assert!(obj
            .set_property(&AnyValue::str("volume"), AnyValue::str("loud"))
            .is_err());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test_log::test]
    fn post_to_signal_triggers_it() {
        let mut builder = ObjectBuilder::new();
        let (id, signal) = builder.advertise_signal("fire", "(i)").unwrap();
        let obj = builder.build();
        let seen = Arc::new(Mutex::new(0i64));
        let s = seen.clone();
        signal
            .connect(crate::signal::SignalSubscriber::callback(move |args| {
                *s.lock().unwrap() = args[0].as_i64().unwrap();
            }))
            .unwrap();
        obj.post(id, vec![AnyValue::int32(42)], &CallContext::local());
        assert_eq!(*seen.lock().unwrap(), 42);
    }

    #[test_log::test]
    fn meta_object_round_trips_through_value() {
        let mut builder = ObjectBuilder::new();
        builder
            .advertise_method("reply", "(s)", "s", |_, _| Ok(AnyValue::Void))
            .unwrap();
        builder.advertise_signal("fire", "(i)").unwrap();
        builder
            .advertise_property("volume", "i", AnyValue::int32(0))
            .unwrap();
        builder.set_description("test object");
        let obj = builder.build();
        let value = obj.meta_object().to_value();
        let back = MetaObject::from_value(&value).unwrap();
        assert_eq!(&back, obj.meta_object());
    }

    #[test_log::test]
    fn merge_prefers_first() {
        let mut a = MetaObject::default();
        a.add_method(MetaMethod {
            uid: 0,
            name: "registerEvent".into(),
            parameters: Signature::parse("(IIL)").unwrap(),
            returns: Signature::parse("L").unwrap(),
        });
        let mut b = MetaObject::default();
        b.add_method(MetaMethod {
            uid: 100,
            name: "reply".into(),
            parameters: Signature::parse("(s)").unwrap(),
            returns: Signature::parse("s").unwrap(),
        });
        let merged = MetaObject::merge(&a, &b);
        assert!(merged.method(0).is_some());
        assert!(merged.method(100).is_some());
    }
}
