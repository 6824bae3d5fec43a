//! Dynamic type layer: signatures, values, conversion, object reflection.

pub mod convert;
pub mod object;
pub mod signature;
pub mod value;

pub use convert::{convert, convert_arguments};
pub use object::{
    AnyObject, CallContext, DynamicObject, MetaMethod, MetaObject, MetaProperty, MetaSignal,
    ObjectBuilder, Property,
};
pub use signature::{FloatWidth, IntWidth, Signature, Type};
pub use value::AnyValue;
