//! Value conversion.
//!
//! All wire decoding produces [`AnyValue`]; converting to the concrete
//! parameter type an object advertises happens here, once, at the dispatch
//! boundary. Failures surface as
//! [`ConversionFailure`](crate::Error::ConversionFailure) carrying both
//! signatures in text.

use crate::error::{Error, Result};
use crate::types::signature::{IntWidth, Signature, Type};
use crate::types::value::AnyValue;

/// Convert `value` to the shape described by `target`.
///
/// Dynamic wrappers on the input are peeled before matching (the "one level
/// of dereference" retry of the original dispatch layer); a dynamic target
/// wraps the value unchanged.
pub fn convert(value: AnyValue, target: &Signature) -> Result<AnyValue> {
    convert_type(value, target.kind())
}

/// Convert an argument pack to a method's parameter tuple.
pub fn convert_arguments(args: Vec<AnyValue>, params: &Signature) -> Result<Vec<AnyValue>> {
    match params.kind() {
        Type::Tuple(members) => {
            if members.len() != args.len() {
                return Err(Error::ConversionFailure {
                    from: AnyValue::Tuple(args).signature().to_string(),
                    to: params.to_string(),
                });
            }
            args.into_iter()
                .zip(members.iter())
                .map(|(a, t)| convert_type(a, t))
                .collect()
        }
        // Dynamic parameter signature: pass the pack through untouched.
        Type::Dynamic => Ok(args),
        _ => Err(Error::ConversionFailure {
            from: AnyValue::Tuple(args).signature().to_string(),
            to: params.to_string(),
        }),
    }
}

fn convert_type(value: AnyValue, target: &Type) -> Result<AnyValue> {
    // A dynamic target keeps the value as-is, tagged with its own signature.
    if matches!(target, Type::Dynamic) {
        return Ok(match value {
            AnyValue::Dynamic(_) => value,
            other => AnyValue::Dynamic(Box::new(other)),
        });
    }
    // A dynamic value converts based on its content.
    let value = match value {
        AnyValue::Dynamic(inner) => return convert_type(*inner, target),
        other => other,
    };

    let fail = |value: &AnyValue, target: &Type| Error::ConversionFailure {
        from: value.signature().to_string(),
        to: Signature::from_type(target.clone()).to_string(),
    };

    match (&value, target) {
        (AnyValue::Void, Type::Void) => Ok(value),
        (AnyValue::Bool(_), Type::Bool) => Ok(value),
        (AnyValue::Bool(b), Type::Int { width, signed }) => {
            Ok(int_value(*b as i64, *width, *signed))
        }
        (AnyValue::Int { value: v, .. }, Type::Bool) => Ok(AnyValue::Bool(*v != 0)),
        (AnyValue::Int { value: v, signed, .. }, Type::Int { width, signed: tsigned }) => {
            if fits(*v, *signed, *width, *tsigned) {
                Ok(int_value(*v, *width, *tsigned))
            } else {
                Err(fail(&value, target))
            }
        }
        (AnyValue::Int { value: v, .. }, Type::Float { width }) => Ok(AnyValue::Float {
            value: *v as f64,
            width: *width,
        }),
        (AnyValue::Float { value: v, .. }, Type::Float { width }) => Ok(AnyValue::Float {
            value: *v,
            width: *width,
        }),
        (AnyValue::Float { value: v, .. }, Type::Int { width, signed }) => {
            let truncated = *v as i64;
            if fits(truncated, true, *width, *signed) {
                Ok(int_value(truncated, *width, *signed))
            } else {
                Err(fail(&value, target))
            }
        }
        (AnyValue::Str(_), Type::String) => Ok(value),
        (AnyValue::Raw(_), Type::Raw) => Ok(value),
        (AnyValue::ObjectRef { .. } | AnyValue::Object(_), Type::Object) => Ok(value),
        (AnyValue::List(_), Type::List(elem)) => {
            let AnyValue::List(items) = value else { unreachable!() };
            let converted = items
                .into_iter()
                .map(|i| convert_type(i, elem))
                .collect::<Result<Vec<_>>>()?;
            Ok(AnyValue::List(converted))
        }
        (AnyValue::Map(_), Type::Map(k, v)) => {
            let AnyValue::Map(entries) = value else { unreachable!() };
            let converted = entries
                .into_iter()
                .map(|(key, val)| Ok((convert_type(key, k)?, convert_type(val, v)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(AnyValue::Map(converted))
        }
        (AnyValue::Tuple(members), Type::Tuple(types)) => {
            if members.len() != types.len() {
                return Err(fail(&value, target));
            }
            let AnyValue::Tuple(members) = value else { unreachable!() };
            let converted = members
                .into_iter()
                .zip(types.iter())
                .map(|(m, t)| convert_type(m, t))
                .collect::<Result<Vec<_>>>()?;
            Ok(AnyValue::Tuple(converted))
        }
        _ => Err(fail(&value, target)),
    }
}

fn int_value(value: i64, width: IntWidth, signed: bool) -> AnyValue {
    AnyValue::Int {
        value,
        width,
        signed,
    }
}

fn fits(value: i64, value_signed: bool, width: IntWidth, signed: bool) -> bool {
    // Unsigned 64-bit sources are stored as raw bits; treat them as
    // non-negative only when they fit in i64.
    if !value_signed && value < 0 {
        return matches!((width, signed), (IntWidth::W64, false));
    }
    match (width, signed) {
        (IntWidth::W8, true) => i8::try_from(value).is_ok(),
        (IntWidth::W8, false) => u8::try_from(value).is_ok(),
        (IntWidth::W16, true) => i16::try_from(value).is_ok(),
        (IntWidth::W16, false) => u16::try_from(value).is_ok(),
        (IntWidth::W32, true) => i32::try_from(value).is_ok(),
        (IntWidth::W32, false) => u32::try_from(value).is_ok(),
        (IntWidth::W64, true) => true,
        (IntWidth::W64, false) => value >= 0 || !value_signed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(s: &str) -> Signature {
        Signature::parse(s).unwrap()
    }

    #[test_log::test]
    fn widening_and_narrowing() {
        assert_eq!(
            convert(AnyValue::int32(42), &sig("l")).unwrap(),
            AnyValue::int64(42)
        );
        assert_eq!(
            convert(AnyValue::int64(300), &sig("C")).unwrap_err().to_string(),
            "Cannot convert value of signature 'l' to 'C'"
        );
        assert_eq!(
            convert(AnyValue::int32(42), &sig("d")).unwrap(),
            AnyValue::float64(42.0)
        );
    }

    #[test_log::test]
    fn string_to_int_fails() {
        assert!(matches!(
            convert(AnyValue::str("4"), &sig("i")),
            Err(Error::ConversionFailure { .. })
        ));
    }

    #[test_log::test]
    fn dynamic_round_trips() {
        let v = convert(AnyValue::int32(7), &sig("m")).unwrap();
        assert!(matches!(v, AnyValue::Dynamic(_)));
        assert_eq!(convert(v, &sig("i")).unwrap(), AnyValue::int32(7));
    }

    #[test_log::test]
    fn tuple_fieldwise() {
        let v = AnyValue::Tuple(vec![AnyValue::int32(1), AnyValue::str("x")]);
        let out = convert(v, &sig("(ls)")).unwrap();
        assert_eq!(
            out,
            AnyValue::Tuple(vec![AnyValue::int64(1), AnyValue::str("x")])
        );
    }

    #[test_log::test]
    fn argument_pack_arity_mismatch() {
        let err = convert_arguments(vec![AnyValue::int32(1)], &sig("(is)")).unwrap_err();
        assert!(matches!(err, Error::ConversionFailure { .. }));
    }
}
