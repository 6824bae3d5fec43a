//! Dynamically typed values.
//!
//! [`AnyValue`] is the universal variant every wire payload decodes into and
//! every dynamic invocation operates on. Conversion to a concrete parameter
//! type happens once, at the dispatch boundary (see
//! [`convert`](crate::types::convert::convert)).

use std::fmt;

use bytes::Bytes;

use crate::future::Future;
use crate::types::object::AnyObject;
use crate::types::signature::{FloatWidth, IntWidth, Signature, Type};

/// A dynamically typed value.
#[derive(Clone)]
pub enum AnyValue {
    Void,
    Bool(bool),
    Int {
        /// Value, sign-extended. Unsigned 64-bit values are stored as their
        /// two's-complement bits.
        value: i64,
        width: IntWidth,
        signed: bool,
    },
    Float {
        value: f64,
        width: FloatWidth,
    },
    Str(String),
    Raw(Bytes),
    /// A value carrying its own signature (decoded from an `m` slot).
    Dynamic(Box<AnyValue>),
    /// Reference to an object hosted by a peer: (service id, object id).
    ObjectRef {
        service: u32,
        object: u32,
    },
    /// A live local object. Not directly encodable; the bound object turns it
    /// into an [`AnyValue::ObjectRef`] by hosting it under a fresh object id.
    Object(AnyObject),
    /// A deferred result. Not encodable; the reply adapter resolves it and
    /// replies with the inner completion (see the nested-future protocol).
    Future(Future<AnyValue>),
    List(Vec<AnyValue>),
    Map(Vec<(AnyValue, AnyValue)>),
    Tuple(Vec<AnyValue>),
}

impl AnyValue {
    pub fn int8(v: i8) -> Self {
        Self::int(v as i64, IntWidth::W8, true)
    }
    pub fn uint8(v: u8) -> Self {
        Self::int(v as i64, IntWidth::W8, false)
    }
    pub fn int16(v: i16) -> Self {
        Self::int(v as i64, IntWidth::W16, true)
    }
    pub fn uint16(v: u16) -> Self {
        Self::int(v as i64, IntWidth::W16, false)
    }
    pub fn int32(v: i32) -> Self {
        Self::int(v as i64, IntWidth::W32, true)
    }
    pub fn uint32(v: u32) -> Self {
        Self::int(v as i64, IntWidth::W32, false)
    }
    pub fn int64(v: i64) -> Self {
        Self::int(v, IntWidth::W64, true)
    }
    pub fn uint64(v: u64) -> Self {
        Self::int(v as i64, IntWidth::W64, false)
    }
    pub fn float32(v: f32) -> Self {
        AnyValue::Float {
            value: v as f64,
            width: FloatWidth::W32,
        }
    }
    pub fn float64(v: f64) -> Self {
        AnyValue::Float {
            value: v,
            width: FloatWidth::W64,
        }
    }
    pub fn str(v: impl Into<String>) -> Self {
        AnyValue::Str(v.into())
    }

    fn int(value: i64, width: IntWidth, signed: bool) -> Self {
        AnyValue::Int {
            value,
            width,
            signed,
        }
    }

    /// The canonical signature of this value.
    pub fn signature(&self) -> Signature {
        Signature::from_type(self.type_of())
    }

    fn type_of(&self) -> Type {
        match self {
            AnyValue::Void => Type::Void,
            AnyValue::Bool(_) => Type::Bool,
            AnyValue::Int { width, signed, .. } => Type::Int {
                width: *width,
                signed: *signed,
            },
            AnyValue::Float { width, .. } => Type::Float { width: *width },
            AnyValue::Str(_) => Type::String,
            AnyValue::Raw(_) => Type::Raw,
            AnyValue::Dynamic(_) => Type::Dynamic,
            AnyValue::ObjectRef { .. } | AnyValue::Object(_) | AnyValue::Future(_) => Type::Object,
            AnyValue::List(items) => Type::List(Box::new(
                items.first().map_or(Type::Dynamic, |v| v.type_of()),
            )),
            AnyValue::Map(entries) => match entries.first() {
                Some((k, v)) => Type::Map(Box::new(k.type_of()), Box::new(v.type_of())),
                None => Type::Map(Box::new(Type::Dynamic), Box::new(Type::Dynamic)),
            },
            AnyValue::Tuple(members) => Type::Tuple(members.iter().map(|m| m.type_of()).collect()),
        }
    }

    /// Strip any number of dynamic wrappers.
    pub fn unwrap_dynamic(self) -> AnyValue {
        match self {
            AnyValue::Dynamic(inner) => inner.unwrap_dynamic(),
            other => other,
        }
    }

    /// Integer content, if this is (or wraps) an integer or bool.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AnyValue::Int { value, .. } => Some(*value),
            AnyValue::Bool(b) => Some(*b as i64),
            AnyValue::Dynamic(inner) => inner.as_i64(),
            _ => None,
        }
    }

    /// Unsigned 32-bit content (the Cancel payload, ids).
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    /// String content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::Str(s) => Some(s),
            AnyValue::Dynamic(inner) => inner.as_str(),
            _ => None,
        }
    }

    /// Float content, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AnyValue::Float { value, .. } => Some(*value),
            AnyValue::Int { value, .. } => Some(*value as f64),
            AnyValue::Dynamic(inner) => inner.as_f64(),
            _ => None,
        }
    }

    /// Tuple members, consuming the value. Non-tuples become a 1-tuple, void
    /// an empty one: the shapes a decoded argument pack can take.
    pub fn into_arguments(self) -> Vec<AnyValue> {
        match self.unwrap_dynamic() {
            AnyValue::Tuple(members) => members,
            AnyValue::Void => Vec::new(),
            other => vec![other],
        }
    }
}

impl PartialEq for AnyValue {
    fn eq(&self, other: &Self) -> bool {
        use AnyValue::*;
        match (self, other) {
            (Void, Void) => true,
            (Bool(a), Bool(b)) => a == b,
            (
                Int { value: a, .. },
                Int { value: b, .. },
            ) => a == b,
            (Float { value: a, .. }, Float { value: b, .. }) => a == b,
            (Str(a), Str(b)) => a == b,
            (Raw(a), Raw(b)) => a == b,
            (Dynamic(a), Dynamic(b)) => a == b,
            (
                ObjectRef {
                    service: s1,
                    object: o1,
                },
                ObjectRef {
                    service: s2,
                    object: o2,
                },
            ) => s1 == s2 && o1 == o2,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            // Live objects and futures have no value identity.
            _ => false,
        }
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyValue::Void => f.write_str("Void"),
            AnyValue::Bool(b) => write!(f, "Bool({})", b),
            AnyValue::Int { value, signed, .. } => {
                if *signed {
                    write!(f, "Int({})", value)
                } else {
                    write!(f, "UInt({})", *value as u64)
                }
            }
            AnyValue::Float { value, .. } => write!(f, "Float({})", value),
            AnyValue::Str(s) => write!(f, "Str({:?})", s),
            AnyValue::Raw(b) => write!(f, "Raw({} bytes)", b.len()),
            AnyValue::Dynamic(inner) => write!(f, "Dynamic({:?})", inner),
            AnyValue::ObjectRef { service, object } => {
                write!(f, "ObjectRef({}/{})", service, object)
            }
            AnyValue::Object(_) => f.write_str("Object(<live>)"),
            AnyValue::Future(_) => f.write_str("Future(<pending>)"),
            AnyValue::List(items) => f.debug_list().entries(items).finish(),
            AnyValue::Map(entries) => {
                f.debug_map().entries(entries.iter().map(|(k, v)| (k, v))).finish()
            }
            AnyValue::Tuple(members) => {
                let mut t = f.debug_tuple("Tuple");
                for m in members {
                    t.field(m);
                }
                t.finish()
            }
        }
    }
}

impl From<()> for AnyValue {
    fn from(_: ()) -> Self {
        AnyValue::Void
    }
}
impl From<bool> for AnyValue {
    fn from(v: bool) -> Self {
        AnyValue::Bool(v)
    }
}
impl From<i32> for AnyValue {
    fn from(v: i32) -> Self {
        AnyValue::int32(v)
    }
}
impl From<u32> for AnyValue {
    fn from(v: u32) -> Self {
        AnyValue::uint32(v)
    }
}
impl From<i64> for AnyValue {
    fn from(v: i64) -> Self {
        AnyValue::int64(v)
    }
}
impl From<u64> for AnyValue {
    fn from(v: u64) -> Self {
        AnyValue::uint64(v)
    }
}
impl From<f64> for AnyValue {
    fn from(v: f64) -> Self {
        AnyValue::float64(v)
    }
}
impl From<&str> for AnyValue {
    fn from(v: &str) -> Self {
        AnyValue::Str(v.to_string())
    }
}
impl From<String> for AnyValue {
    fn from(v: String) -> Self {
        AnyValue::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn signatures_of_values() {
        assert_eq!(AnyValue::int32(4).signature().to_string(), "i");
        assert_eq!(AnyValue::str("x").signature().to_string(), "s");
        assert_eq!(
            AnyValue::Tuple(vec![AnyValue::int32(1), AnyValue::str("a")])
                .signature()
                .to_string(),
            "(is)"
        );
        assert_eq!(
            AnyValue::List(vec![AnyValue::str("a")]).signature().to_string(),
            "[s]"
        );
    }

    #[test_log::test]
    fn argument_unpacking() {
        let args = AnyValue::Tuple(vec![AnyValue::int32(1), AnyValue::int32(2)]).into_arguments();
        assert_eq!(args.len(), 2);
        assert_eq!(AnyValue::Void.into_arguments().len(), 0);
        let wrapped =
            AnyValue::Dynamic(Box::new(AnyValue::Tuple(vec![AnyValue::str("x")]))).into_arguments();
        assert_eq!(wrapped.len(), 1);
    }

    #[test_log::test]
    fn cancel_payload_accessor() {
        assert_eq!(AnyValue::uint32(77).as_u32(), Some(77));
        assert_eq!(AnyValue::str("x").as_u32(), None);
    }
}
