//! Type signatures.
//!
//! Every method parameter list, return value, signal and payload is described
//! by a compact signature string. The grammar is one character per scalar
//! type plus three container forms:
//!
//! ```text
//! v void        b bool
//! c int8        C uint8
//! w int16       W uint16
//! i int32       I uint32
//! l int64       L uint64
//! f float32     d float64
//! s string      r raw bytes
//! m dynamic     o object reference
//! [e]           list of e
//! {kv}          map of k -> v
//! (abc)         tuple of a, b, c
//! ```
//!
//! A tuple may be followed by a `<name,field,...>` annotation block; it is
//! parsed and discarded (names do not take part in conversion).
//!
//! Signatures travel on the wire with each payload, so parsing has to be
//! total: any malformed input yields a [`Protocol`](crate::Error::Protocol)
//! error, never a panic.

use std::fmt;

use crate::error::{Error, Result};

/// Scalar integer width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

/// Floating point width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatWidth {
    W32,
    W64,
}

/// A parsed type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Bool,
    Int { width: IntWidth, signed: bool },
    Float { width: FloatWidth },
    String,
    Raw,
    /// Dynamically typed slot: the value carries its own signature.
    Dynamic,
    /// Reference to a remote object, encoded as (service, object) ids.
    Object,
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),
}

/// A validated signature: a [`Type`] plus its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(Type);

impl Signature {
    /// The dynamic-any signature (`m`).
    pub fn dynamic() -> Self {
        Signature(Type::Dynamic)
    }

    /// The void signature (`v`).
    pub fn void() -> Self {
        Signature(Type::Void)
    }

    /// An empty parameter tuple (`()`).
    pub fn unit_tuple() -> Self {
        Signature(Type::Tuple(Vec::new()))
    }

    /// Build a signature from an already-parsed type.
    pub fn from_type(t: Type) -> Self {
        Signature(t)
    }

    /// Parse a signature string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut chars = s.chars().peekable();
        let t = parse_one(&mut chars, s)?;
        if chars.next().is_some() {
            return Err(Error::Protocol(format!(
                "trailing characters in signature '{}'",
                s
            )));
        }
        Ok(Signature(t))
    }

    /// The underlying type descriptor.
    pub fn kind(&self) -> &Type {
        &self.0
    }

    /// True for the dynamic-any signature.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.0, Type::Dynamic)
    }

    /// Tuple member types, if this is a tuple.
    pub fn tuple_members(&self) -> Option<&[Type]> {
        match &self.0 {
            Type::Tuple(members) => Some(members),
            _ => None,
        }
    }

    /// Parameter count for a tuple signature; `None` when no arity can be
    /// derived (dynamic signatures accept anything).
    pub fn arity(&self) -> Option<usize> {
        match &self.0 {
            Type::Tuple(members) => Some(members.len()),
            Type::Dynamic => None,
            _ => Some(1),
        }
    }

    /// Wrap this signature's members in a `(...)s` tuple: the form a payload
    /// takes when the `RETURN_TYPE` flag appends a requested return
    /// signature to the arguments.
    pub fn with_appended_string(&self) -> Signature {
        let mut members = match self.kind() {
            Type::Tuple(m) => m.clone(),
            other => vec![other.clone()],
        };
        members.push(Type::String);
        Signature(Type::Tuple(members))
    }

    /// Structural convertibility check used by signal connection and call
    /// dispatch. Numeric types interconvert; everything converts to dynamic;
    /// dynamic converts to everything (checked at runtime); containers are
    /// covariant; tuples must agree on arity.
    pub fn is_convertible_to(&self, target: &Signature) -> bool {
        convertible(&self.0, &target.0)
    }
}

fn convertible(from: &Type, to: &Type) -> bool {
    use Type::*;
    match (from, to) {
        (_, Dynamic) | (Dynamic, _) => true,
        (Void, Void) => true,
        (Bool, Bool) => true,
        (Bool, Int { .. }) | (Int { .. }, Bool) => true,
        (Int { .. } | Float { .. }, Int { .. } | Float { .. }) => true,
        (String, String) => true,
        (Raw, Raw) => true,
        (Object, Object) => true,
        (List(a), List(b)) => convertible(a, b),
        (Map(ka, va), Map(kb, vb)) => convertible(ka, kb) && convertible(va, vb),
        (Tuple(a), Tuple(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| convertible(x, y))
        }
        _ => false,
    }
}

fn parse_one(chars: &mut std::iter::Peekable<std::str::Chars>, full: &str) -> Result<Type> {
    let c = chars
        .next()
        .ok_or_else(|| Error::Protocol(format!("truncated signature '{}'", full)))?;
    let t = match c {
        'v' => Type::Void,
        'b' => Type::Bool,
        'c' => int(IntWidth::W8, true),
        'C' => int(IntWidth::W8, false),
        'w' => int(IntWidth::W16, true),
        'W' => int(IntWidth::W16, false),
        'i' => int(IntWidth::W32, true),
        'I' => int(IntWidth::W32, false),
        'l' => int(IntWidth::W64, true),
        'L' => int(IntWidth::W64, false),
        'f' => Type::Float {
            width: FloatWidth::W32,
        },
        'd' => Type::Float {
            width: FloatWidth::W64,
        },
        's' => Type::String,
        'r' => Type::Raw,
        'm' => Type::Dynamic,
        'o' => Type::Object,
        '[' => {
            let elem = parse_one(chars, full)?;
            expect(chars, ']', full)?;
            Type::List(Box::new(elem))
        }
        '{' => {
            let key = parse_one(chars, full)?;
            let value = parse_one(chars, full)?;
            expect(chars, '}', full)?;
            Type::Map(Box::new(key), Box::new(value))
        }
        '(' => {
            let mut members = Vec::new();
            loop {
                if chars.peek() == Some(&')') {
                    chars.next();
                    break;
                }
                members.push(parse_one(chars, full)?);
            }
            // Optional <name,field,...> annotation; names are ignored.
            if chars.peek() == Some(&'<') {
                let mut depth = 0usize;
                for c in chars.by_ref() {
                    match c {
                        '<' => depth += 1,
                        '>' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                if depth != 0 {
                    return Err(Error::Protocol(format!(
                        "unterminated annotation in signature '{}'",
                        full
                    )));
                }
            }
            Type::Tuple(members)
        }
        other => {
            return Err(Error::Protocol(format!(
                "unknown signature character '{}' in '{}'",
                other, full
            )))
        }
    };
    Ok(t)
}

fn int(width: IntWidth, signed: bool) -> Type {
    Type::Int { width, signed }
}

fn expect(chars: &mut std::iter::Peekable<std::str::Chars>, want: char, full: &str) -> Result<()> {
    match chars.next() {
        Some(c) if c == want => Ok(()),
        _ => Err(Error::Protocol(format!(
            "expected '{}' in signature '{}'",
            want, full
        ))),
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_type(&self.0, f)
    }
}

fn write_type(t: &Type, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use Type::*;
    match t {
        Void => f.write_str("v"),
        Bool => f.write_str("b"),
        Int { width, signed } => {
            let c = match (width, signed) {
                (IntWidth::W8, true) => 'c',
                (IntWidth::W8, false) => 'C',
                (IntWidth::W16, true) => 'w',
                (IntWidth::W16, false) => 'W',
                (IntWidth::W32, true) => 'i',
                (IntWidth::W32, false) => 'I',
                (IntWidth::W64, true) => 'l',
                (IntWidth::W64, false) => 'L',
            };
            write!(f, "{}", c)
        }
        Float { width } => f.write_str(match width {
            FloatWidth::W32 => "f",
            FloatWidth::W64 => "d",
        }),
        String => f.write_str("s"),
        Raw => f.write_str("r"),
        Dynamic => f.write_str("m"),
        Object => f.write_str("o"),
        List(e) => {
            f.write_str("[")?;
            write_type(e, f)?;
            f.write_str("]")
        }
        Map(k, v) => {
            f.write_str("{")?;
            write_type(k, f)?;
            write_type(v, f)?;
            f.write_str("}")
        }
        Tuple(members) => {
            f.write_str("(")?;
            for m in members {
                write_type(m, f)?;
            }
            f.write_str(")")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn scalar_round_trip() {
        for s in ["v", "b", "c", "C", "w", "W", "i", "I", "l", "L", "f", "d", "s", "r", "m", "o"] {
            let sig = Signature::parse(s).unwrap();
            assert_eq!(sig.to_string(), s);
        }
    }

    #[test_log::test]
    fn container_round_trip() {
        for s in ["[s]", "{si}", "(is)", "([i]{sm})", "(s(ii)[d])", "()"] {
            let sig = Signature::parse(s).unwrap();
            assert_eq!(sig.to_string(), s);
        }
    }

    #[test_log::test]
    fn tuple_annotations_are_discarded() {
        let sig = Signature::parse("(sI)<ServiceInfo,name,serviceId>").unwrap();
        assert_eq!(sig.to_string(), "(sI)");
    }

    #[test_log::test]
    fn rejects_malformed() {
        for s in ["", "q", "[s", "{s}", "(s", "ss", "(s)x"] {
            assert!(Signature::parse(s).is_err(), "'{}' should not parse", s);
        }
    }

    #[test_log::test]
    fn arity() {
        assert_eq!(Signature::parse("(is)").unwrap().arity(), Some(2));
        assert_eq!(Signature::parse("()").unwrap().arity(), Some(0));
        assert_eq!(Signature::parse("m").unwrap().arity(), None);
        assert_eq!(Signature::parse("i").unwrap().arity(), Some(1));
    }

    #[test_log::test]
    fn convertibility() {
        let sig = |s: &str| Signature::parse(s).unwrap();
        assert!(sig("i").is_convertible_to(&sig("l")));
        assert!(sig("i").is_convertible_to(&sig("d")));
        assert!(sig("(is)").is_convertible_to(&sig("(ds)")));
        assert!(sig("(is)").is_convertible_to(&sig("m")));
        assert!(!sig("(is)").is_convertible_to(&sig("(s)")));
        assert!(!sig("s").is_convertible_to(&sig("i")));
    }

    #[test_log::test]
    fn return_type_wrapping() {
        let sig = Signature::parse("(is)").unwrap();
        assert_eq!(sig.with_appended_string().to_string(), "(iss)");
    }
}
