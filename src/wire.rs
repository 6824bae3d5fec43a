//! Wire format.
//!
//! Every frame is a fixed 28-byte header followed by a length-prefixed
//! signature string and the payload:
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────
//!   0      4    Magic (0x42DEAD42, big-endian)
//!   4      4    Message id
//!   8      4    Body size (signature block + payload)
//!  12      2    Protocol version
//!  14      1    Kind
//!  15      1    Flags
//!  16      4    Service id
//!  20      4    Object id
//!  24      4    Action (method / signal) id
//! ──────────────────────────────────────────────
//!  28      4    Signature length N
//!  32      N    Signature string
//!  32+N    …    Payload
//! ```
//!
//! All integer fields except the magic are little-endian. The payload is the
//! value encoded against the signature: scalars little-endian, strings and
//! raw blocks `u32`-length-prefixed, lists and maps `u32`-count-prefixed,
//! tuples fieldwise with no count, dynamics as a signature string followed
//! by the concrete encoding, object references as `(service, object)` id
//! pairs.
//!
//! Decoding is streaming: [`decode`] consumes complete frames from a
//! [`BytesMut`] and leaves partial ones untouched, the way the TCP reader
//! accumulates segments.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::convert::convert;
use crate::types::signature::{FloatWidth, IntWidth, Signature, Type};
use crate::types::value::AnyValue;

/// Frame magic, written big-endian.
pub const MAGIC: u32 = 0x42DE_AD42;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 0;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 28;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    None = 0,
    Call = 1,
    Reply = 2,
    Error = 3,
    Post = 4,
    Event = 5,
    Capability = 6,
    Cancel = 7,
    Canceled = 8,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Call),
            2 => Some(Self::Reply),
            3 => Some(Self::Error),
            4 => Some(Self::Post),
            5 => Some(Self::Event),
            6 => Some(Self::Capability),
            7 => Some(Self::Cancel),
            8 => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Reply-path kinds carry the message id of an originating call.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Reply | Self::Error | Self::Canceled)
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// Payload is dynamically typed; ignore the advertised signature.
    pub const DYNAMIC_PAYLOAD: MessageFlags = MessageFlags(0x01);
    /// Payload is `(args..., return-signature)`: the caller requests a
    /// specific return encoding.
    pub const RETURN_TYPE: MessageFlags = MessageFlags(0x02);

    pub fn empty() -> Self {
        MessageFlags(0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        MessageFlags(bits)
    }

    pub fn has(self, flag: MessageFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: MessageFlags) {
        self.0 |= flag.0;
    }
}

/// Address of a message: which member of which object of which service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageAddress {
    pub service: u32,
    pub object: u32,
    pub action: u32,
    /// Per-socket monotonic id correlating calls with replies.
    pub message_id: u32,
}

impl std::fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{service: {}, object: {}, action: {}, id: {}}}",
            self.service, self.object, self.action, self.message_id
        )
    }
}

/// One framed unit on a transport socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: u16,
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub address: MessageAddress,
    /// Signature of the payload.
    pub signature: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, address: MessageAddress) -> Self {
        Message {
            version: PROTOCOL_VERSION,
            kind,
            flags: MessageFlags::empty(),
            address,
            signature: String::new(),
            payload: Bytes::new(),
        }
    }

    /// A response frame (Reply / Error / Canceled) to `call`: same address,
    /// same message id.
    pub fn response_to(call_address: MessageAddress, kind: MessageKind) -> Self {
        Message::new(kind, call_address)
    }

    /// Set the payload to `value` converted to `signature`.
    pub fn set_value(&mut self, value: AnyValue, signature: &Signature) -> Result<()> {
        let converted = convert(value, signature)?;
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &converted, signature.kind())?;
        self.signature = signature.to_string();
        self.payload = buf.freeze();
        Ok(())
    }

    /// Set a dynamically typed payload and the `DYNAMIC_PAYLOAD` flag.
    pub fn set_dynamic_value(&mut self, value: AnyValue) -> Result<()> {
        self.set_value(value, &Signature::dynamic())?;
        self.flags.insert(MessageFlags::DYNAMIC_PAYLOAD);
        Ok(())
    }

    /// Set an error-string payload and the `Error` kind.
    pub fn set_error(&mut self, text: impl Into<String>) {
        self.kind = MessageKind::Error;
        // Encoding a string cannot fail.
        let _ = self.set_value(
            AnyValue::Str(text.into()),
            &Signature::from_type(Type::String),
        );
    }

    /// Decode the payload against its carried signature.
    pub fn value(&self) -> Result<AnyValue> {
        let signature = Signature::parse(&self.signature)?;
        self.value_as(&signature)
    }

    /// Decode the payload against an explicit signature.
    pub fn value_as(&self, signature: &Signature) -> Result<AnyValue> {
        let mut buf = &self.payload[..];
        let value = decode_value(&mut buf, signature.kind())?;
        if buf.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing payload bytes after decoding '{}'",
                buf.remaining(),
                signature
            )));
        }
        Ok(value)
    }

    /// Serialize to one frame.
    pub fn encode(&self) -> Bytes {
        let body_size = 4 + self.signature.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_size);
        buf.put_u32(MAGIC);
        buf.put_u32_le(self.address.message_id);
        buf.put_u32_le(body_size as u32);
        buf.put_u16_le(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.address.service);
        buf.put_u32_le(self.address.object);
        buf.put_u32_le(self.address.action);
        buf.put_u32_le(self.signature.len() as u32);
        buf.put_slice(self.signature.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Consume one complete frame from `buf`, if present.
///
/// `Ok(None)` means "need more bytes". A bad magic or unknown kind is a hard
/// protocol error; the connection cannot be resynchronized.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(Error::Protocol(format!(
            "bad frame magic 0x{:08X}",
            magic
        )));
    }
    let body_size =
        u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if buf.len() < HEADER_SIZE + body_size {
        return Ok(None);
    }

    let mut frame = buf.split_to(HEADER_SIZE + body_size);
    frame.advance(4); // magic
    let message_id = frame.get_u32_le();
    let _body = frame.get_u32_le();
    let version = frame.get_u16_le();
    let kind_byte = frame.get_u8();
    let kind = MessageKind::from_u8(kind_byte)
        .ok_or_else(|| Error::Protocol(format!("unknown message kind {}", kind_byte)))?;
    let flags = MessageFlags::from_bits(frame.get_u8());
    let service = frame.get_u32_le();
    let object = frame.get_u32_le();
    let action = frame.get_u32_le();

    if frame.remaining() < 4 {
        return Err(Error::Protocol("truncated signature block".into()));
    }
    let sig_len = frame.get_u32_le() as usize;
    if frame.remaining() < sig_len {
        return Err(Error::Protocol("truncated signature string".into()));
    }
    let signature = String::from_utf8(frame.split_to(sig_len).to_vec())
        .map_err(|_| Error::Protocol("signature is not valid UTF-8".into()))?;
    let payload = frame.freeze();

    Ok(Some(Message {
        version,
        kind,
        flags,
        address: MessageAddress {
            service,
            object,
            action,
            message_id,
        },
        signature,
        payload,
    }))
}

// ============================================================================
// VALUE CODEC
// ============================================================================

/// Encode `value` (already shaped like `t`) into `buf`.
pub fn encode_value(buf: &mut BytesMut, value: &AnyValue, t: &Type) -> Result<()> {
    let mismatch = |value: &AnyValue| Error::ConversionFailure {
        from: value.signature().to_string(),
        to: Signature::from_type(t.clone()).to_string(),
    };
    match (t, value) {
        (Type::Void, _) => Ok(()),
        (Type::Bool, AnyValue::Bool(b)) => {
            buf.put_u8(*b as u8);
            Ok(())
        }
        (Type::Int { width, .. }, AnyValue::Int { value: v, .. }) => {
            match width {
                IntWidth::W8 => buf.put_u8(*v as u8),
                IntWidth::W16 => buf.put_u16_le(*v as u16),
                IntWidth::W32 => buf.put_u32_le(*v as u32),
                IntWidth::W64 => buf.put_u64_le(*v as u64),
            }
            Ok(())
        }
        (Type::Float { width }, AnyValue::Float { value: v, .. }) => {
            match width {
                FloatWidth::W32 => buf.put_f32_le(*v as f32),
                FloatWidth::W64 => buf.put_f64_le(*v),
            }
            Ok(())
        }
        (Type::String, AnyValue::Str(s)) => {
            buf.put_u32_le(s.len() as u32);
            buf.put_slice(s.as_bytes());
            Ok(())
        }
        (Type::Raw, AnyValue::Raw(bytes)) => {
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
            Ok(())
        }
        (Type::Dynamic, _) => {
            // Peel exactly one wrapper so nested dynamics keep their depth.
            let inner: &AnyValue = match value {
                AnyValue::Dynamic(b) => b,
                other => other,
            };
            if matches!(inner, AnyValue::Object(_) | AnyValue::Future(_)) {
                return Err(Error::Protocol("cannot serialize a live object".into()));
            }
            let signature = inner.signature().to_string();
            buf.put_u32_le(signature.len() as u32);
            buf.put_slice(signature.as_bytes());
            encode_value(buf, inner, inner.signature().kind())
        }
        (Type::Object, AnyValue::ObjectRef { service, object }) => {
            buf.put_u32_le(*service);
            buf.put_u32_le(*object);
            Ok(())
        }
        (Type::Object, AnyValue::Object(_) | AnyValue::Future(_)) => {
            Err(Error::Protocol("cannot serialize a live object".into()))
        }
        (Type::List(elem), AnyValue::List(items)) => {
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_value(buf, item, elem)?;
            }
            Ok(())
        }
        (Type::Map(k, v), AnyValue::Map(entries)) => {
            buf.put_u32_le(entries.len() as u32);
            for (key, value) in entries {
                encode_value(buf, key, k)?;
                encode_value(buf, value, v)?;
            }
            Ok(())
        }
        (Type::Tuple(members), AnyValue::Tuple(values)) => {
            if members.len() != values.len() {
                return Err(mismatch(value));
            }
            for (value, member) in values.iter().zip(members.iter()) {
                encode_value(buf, value, member)?;
            }
            Ok(())
        }
        _ => Err(mismatch(value)),
    }
}

/// Decode one value of shape `t` from `buf`.
pub fn decode_value(buf: &mut impl Buf, t: &Type) -> Result<AnyValue> {
    let short = || Error::Protocol("truncated payload".into());
    match t {
        Type::Void => Ok(AnyValue::Void),
        Type::Bool => {
            if buf.remaining() < 1 {
                return Err(short());
            }
            Ok(AnyValue::Bool(buf.get_u8() != 0))
        }
        Type::Int { width, signed } => {
            let needed = match width {
                IntWidth::W8 => 1,
                IntWidth::W16 => 2,
                IntWidth::W32 => 4,
                IntWidth::W64 => 8,
            };
            if buf.remaining() < needed {
                return Err(short());
            }
            let value = match (width, signed) {
                (IntWidth::W8, true) => buf.get_i8() as i64,
                (IntWidth::W8, false) => buf.get_u8() as i64,
                (IntWidth::W16, true) => buf.get_i16_le() as i64,
                (IntWidth::W16, false) => buf.get_u16_le() as i64,
                (IntWidth::W32, true) => buf.get_i32_le() as i64,
                (IntWidth::W32, false) => buf.get_u32_le() as i64,
                (IntWidth::W64, true) => buf.get_i64_le(),
                (IntWidth::W64, false) => buf.get_u64_le() as i64,
            };
            Ok(AnyValue::Int {
                value,
                width: *width,
                signed: *signed,
            })
        }
        Type::Float { width } => {
            let needed = match width {
                FloatWidth::W32 => 4,
                FloatWidth::W64 => 8,
            };
            if buf.remaining() < needed {
                return Err(short());
            }
            let value = match width {
                FloatWidth::W32 => buf.get_f32_le() as f64,
                FloatWidth::W64 => buf.get_f64_le(),
            };
            Ok(AnyValue::Float {
                value,
                width: *width,
            })
        }
        Type::String => Ok(AnyValue::Str(read_string(buf)?)),
        Type::Raw => {
            if buf.remaining() < 4 {
                return Err(short());
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(short());
            }
            Ok(AnyValue::Raw(buf.copy_to_bytes(len)))
        }
        Type::Dynamic => {
            let signature = Signature::parse(&read_string(buf)?)?;
            let inner = decode_value(buf, signature.kind())?;
            Ok(AnyValue::Dynamic(Box::new(inner)))
        }
        Type::Object => {
            if buf.remaining() < 8 {
                return Err(short());
            }
            let service = buf.get_u32_le();
            let object = buf.get_u32_le();
            Ok(AnyValue::ObjectRef { service, object })
        }
        Type::List(elem) => {
            if buf.remaining() < 4 {
                return Err(short());
            }
            let count = buf.get_u32_le() as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_value(buf, elem)?);
            }
            Ok(AnyValue::List(items))
        }
        Type::Map(k, v) => {
            if buf.remaining() < 4 {
                return Err(short());
            }
            let count = buf.get_u32_le() as usize;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = decode_value(buf, k)?;
                let value = decode_value(buf, v)?;
                entries.push((key, value));
            }
            Ok(AnyValue::Map(entries))
        }
        Type::Tuple(members) => {
            let mut values = Vec::with_capacity(members.len());
            for member in members {
                values.push(decode_value(buf, member)?);
            }
            Ok(AnyValue::Tuple(values))
        }
    }
}

fn read_string(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(Error::Protocol("truncated payload".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(Error::Protocol("truncated payload".into()));
    }
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| Error::Protocol("string is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn call(action: u32) -> Message {
        Message::new(
            MessageKind::Call,
            MessageAddress {
                service: 2,
                object: 1,
                action,
                message_id: 7,
            },
        )
    }

    #[test_log::test]
    fn frame_round_trip() {
        let mut msg = call(100);
        msg.set_value(
            AnyValue::Tuple(vec![AnyValue::str("ok")]),
            &Signature::parse("(s)").unwrap(),
        )
        .unwrap();
        let mut buf = BytesMut::from(&msg.encode()[..]);
        let back = decode(&mut buf).unwrap().unwrap();
        assert_eq!(back, msg);
        assert!(buf.is_empty());
    }

    #[test_log::test]
    fn partial_frames_wait_for_more_bytes() {
        let mut msg = call(100);
        msg.set_value(AnyValue::str("hello"), &Signature::parse("s").unwrap())
            .unwrap();
        let encoded = msg.encode();
        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(5) {
            let before = decode(&mut buf).unwrap();
            if buf.len() + chunk.len() < encoded.len() {
                assert!(before.is_none());
            }
            buf.extend_from_slice(chunk);
        }
        assert_eq!(decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test_log::test]
    fn two_frames_in_one_buffer() {
        let mut a = call(100);
        a.set_value(AnyValue::int32(1), &Signature::parse("i").unwrap())
            .unwrap();
        let mut b = call(101);
        b.set_value(AnyValue::int32(2), &Signature::parse("i").unwrap())
            .unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode());
        buf.extend_from_slice(&b.encode());
        assert_eq!(decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test_log::test]
    fn bad_magic_is_fatal() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert!(decode(&mut buf).is_err());
    }

    #[test_log::test]
    fn error_payload_reads_back() {
        let mut msg = Message::response_to(call(100).address, MessageKind::Reply);
        msg.set_error("No such method");
        assert_eq!(msg.kind, MessageKind::Error);
        let text = msg.value().unwrap();
        assert_eq!(text.as_str(), Some("No such method"));
    }

    #[test_log::test]
    fn dynamic_payload_carries_signature() {
        let mut msg = call(100);
        msg.set_dynamic_value(AnyValue::Tuple(vec![AnyValue::int32(42)]))
            .unwrap();
        assert!(msg.flags.has(MessageFlags::DYNAMIC_PAYLOAD));
        assert_eq!(msg.signature, "m");
        let value = msg.value().unwrap().unwrap_dynamic();
        assert_eq!(value, AnyValue::Tuple(vec![AnyValue::int32(42)]));
    }

    // ------------------------------------------------------------------
    // Round-trip laws
    // ------------------------------------------------------------------

    /// Depth-limited generator of (signature, matching value) pairs.
    fn arb_typed_value() -> impl Strategy<Value = AnyValue> {
        let leaf = prop_oneof![
            Just(AnyValue::Void),
            any::<bool>().prop_map(AnyValue::Bool),
            any::<i8>().prop_map(AnyValue::int8),
            any::<u8>().prop_map(AnyValue::uint8),
            any::<i16>().prop_map(AnyValue::int16),
            any::<u16>().prop_map(AnyValue::uint16),
            any::<i32>().prop_map(AnyValue::int32),
            any::<u32>().prop_map(AnyValue::uint32),
            any::<i64>().prop_map(AnyValue::int64),
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(AnyValue::float64),
            ".{0,12}".prop_map(|s: String| AnyValue::str(s)),
            proptest::collection::vec(any::<u8>(), 0..16)
                .prop_map(|b| AnyValue::Raw(Bytes::from(b))),
            (any::<u32>(), any::<u32>())
                .prop_map(|(service, object)| AnyValue::ObjectRef { service, object }),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                // Homogeneous list: replicate one generated element shape.
                (inner.clone(), 0..4usize).prop_map(|(v, n)| AnyValue::List(vec![v; n.max(1)])),
                proptest::collection::vec(inner.clone(), 0..4).prop_map(AnyValue::Tuple),
                (".{0,6}", inner.clone(), 0..3usize).prop_map(|(k, v, n)| {
                    AnyValue::Map(
                        (0..n.max(1))
                            .map(|i| (AnyValue::str(format!("{}{}", k, i)), v.clone()))
                            .collect(),
                    )
                }),
                inner.prop_map(|v| AnyValue::Dynamic(Box::new(v))),
            ]
        })
    }

    proptest! {
        #[test]
        fn encode_decode_is_identity(value in arb_typed_value()) {
            let signature = value.signature();
            let mut buf = BytesMut::new();
            encode_value(&mut buf, &value, signature.kind()).unwrap();
            let mut read = &buf[..];
            let back = decode_value(&mut read, signature.kind()).unwrap();
            prop_assert_eq!(read.remaining(), 0);
            prop_assert_eq!(back, value);
        }

        #[test]
        fn convert_then_round_trip(value in arb_typed_value()) {
            // decode(encode(convert(v, m))) == convert(v, m)
            let target = Signature::dynamic();
            let converted = crate::types::convert::convert(value, &target).unwrap();
            let mut buf = BytesMut::new();
            encode_value(&mut buf, &converted, target.kind()).unwrap();
            let mut read = &buf[..];
            let back = decode_value(&mut read, target.kind()).unwrap();
            prop_assert_eq!(back, converted);
        }

        #[test]
        fn message_frame_identity(action in 0u32..1000, id in any::<u32>(), value in arb_typed_value()) {
            let mut msg = Message::new(MessageKind::Call, MessageAddress {
                service: 1, object: 1, action, message_id: id,
            });
            msg.set_value(value.clone(), &value.signature()).unwrap();
            let mut buf = BytesMut::from(&msg.encode()[..]);
            let back = decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(back, msg);
        }
    }
}
