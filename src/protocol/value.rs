//! Payload Values
//!
//! Values carried in an envelope's `data` array. Plain JSON values pass
//! through untouched; binary values (raw bytes and numeric arrays) travel as
//! a tagged object so a text transport can carry them losslessly:
//!
//! ```text
//! { "binary": true, "kind": "int16", "contents": [1, 0, 255, 255] }
//! ```
//!
//! `contents` is the exact little-endian byte layout of the array.

use std::collections::BTreeMap;

use serde_json::{Map, Number};

use super::envelope::CodecError;

/// Marker key of a tagged binary object.
const TAG_BINARY: &str = "binary";
/// Key holding the binary kind name.
const TAG_KIND: &str = "kind";
/// Key holding the byte contents.
const TAG_CONTENTS: &str = "contents";

// =============================================================================
// BINARY KINDS
// =============================================================================

/// The exact array type a binary value was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    /// Untyped byte buffer.
    RawBytes,
    /// Byte view over a buffer.
    ByteView,
    /// Signed 8-bit array.
    Int8,
    /// Unsigned 8-bit array.
    Uint8,
    /// Unsigned 8-bit array with clamped writes.
    Uint8Clamped,
    /// Signed 16-bit array.
    Int16,
    /// Unsigned 16-bit array.
    Uint16,
    /// Signed 32-bit array.
    Int32,
    /// Unsigned 32-bit array.
    Uint32,
    /// 32-bit float array.
    Float32,
    /// 64-bit float array.
    Float64,
}

impl BinaryKind {
    /// Every kind, in wire-name order.
    pub const ALL: [BinaryKind; 11] = [
        BinaryKind::RawBytes,
        BinaryKind::ByteView,
        BinaryKind::Int8,
        BinaryKind::Uint8,
        BinaryKind::Uint8Clamped,
        BinaryKind::Int16,
        BinaryKind::Uint16,
        BinaryKind::Int32,
        BinaryKind::Uint32,
        BinaryKind::Float32,
        BinaryKind::Float64,
    ];

    /// Name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            BinaryKind::RawBytes => "raw-bytes",
            BinaryKind::ByteView => "byte-view",
            BinaryKind::Int8 => "int8",
            BinaryKind::Uint8 => "uint8",
            BinaryKind::Uint8Clamped => "uint8-clamped",
            BinaryKind::Int16 => "int16",
            BinaryKind::Uint16 => "uint16",
            BinaryKind::Int32 => "int32",
            BinaryKind::Uint32 => "uint32",
            BinaryKind::Float32 => "float32",
            BinaryKind::Float64 => "float64",
        }
    }

    /// Parse a wire name.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }

    /// Width of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            BinaryKind::RawBytes
            | BinaryKind::ByteView
            | BinaryKind::Int8
            | BinaryKind::Uint8
            | BinaryKind::Uint8Clamped => 1,
            BinaryKind::Int16 | BinaryKind::Uint16 => 2,
            BinaryKind::Int32 | BinaryKind::Uint32 | BinaryKind::Float32 => 4,
            BinaryKind::Float64 => 8,
        }
    }
}

/// A binary payload value: its kind plus the raw little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryValue {
    kind: BinaryKind,
    bytes: Vec<u8>,
}

macro_rules! typed_array {
    ($from:ident, $to:ident, $ty:ty, $kind:expr) => {
        #[doc = concat!("Build a `", stringify!($ty), "` array value.")]
        pub fn $from(values: &[$ty]) -> Self {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Self { kind: $kind, bytes }
        }

        #[doc = concat!("Read back as `", stringify!($ty), "` elements, if the kind matches.")]
        pub fn $to(&self) -> Option<Vec<$ty>> {
            if self.kind != $kind {
                return None;
            }
            let size = std::mem::size_of::<$ty>();
            Some(
                self.bytes
                    .chunks_exact(size)
                    .map(|chunk| {
                        let mut buf = [0u8; std::mem::size_of::<$ty>()];
                        buf.copy_from_slice(chunk);
                        <$ty>::from_le_bytes(buf)
                    })
                    .collect(),
            )
        }
    };
}

impl BinaryValue {
    /// Build from a kind and its raw bytes.
    ///
    /// Fails if the byte length is not a whole number of elements.
    pub fn new(kind: BinaryKind, bytes: Vec<u8>) -> Result<Self, CodecError> {
        if bytes.len() % kind.element_size() != 0 {
            return Err(CodecError::Malformed(format!(
                "{} contents of {} bytes is not a multiple of {}",
                kind.wire_name(),
                bytes.len(),
                kind.element_size()
            )));
        }
        Ok(Self { kind, bytes })
    }

    /// Untyped byte buffer.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self { kind: BinaryKind::RawBytes, bytes: bytes.into() }
    }

    /// Byte view.
    pub fn byte_view(bytes: impl Into<Vec<u8>>) -> Self {
        Self { kind: BinaryKind::ByteView, bytes: bytes.into() }
    }

    /// Clamped unsigned byte array.
    pub fn uint8_clamped(bytes: impl Into<Vec<u8>>) -> Self {
        Self { kind: BinaryKind::Uint8Clamped, bytes: bytes.into() }
    }

    typed_array!(from_i8s, to_i8s, i8, BinaryKind::Int8);
    typed_array!(from_u8s, to_u8s, u8, BinaryKind::Uint8);
    typed_array!(from_i16s, to_i16s, i16, BinaryKind::Int16);
    typed_array!(from_u16s, to_u16s, u16, BinaryKind::Uint16);
    typed_array!(from_i32s, to_i32s, i32, BinaryKind::Int32);
    typed_array!(from_u32s, to_u32s, u32, BinaryKind::Uint32);
    typed_array!(from_f32s, to_f32s, f32, BinaryKind::Float32);
    typed_array!(from_f64s, to_f64s, f64, BinaryKind::Float64);

    /// The array kind.
    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.element_size()
    }

    /// Whether the value holds no elements.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn to_tagged(&self) -> serde_json::Value {
        let mut map = Map::new();
        map.insert(TAG_BINARY.into(), serde_json::Value::Bool(true));
        map.insert(TAG_KIND.into(), self.kind.wire_name().into());
        map.insert(
            TAG_CONTENTS.into(),
            serde_json::Value::Array(self.bytes.iter().map(|b| (*b).into()).collect()),
        );
        serde_json::Value::Object(map)
    }

    /// Whether a JSON object is shaped like a tagged binary value.
    fn is_tagged(map: &Map<String, serde_json::Value>) -> bool {
        map.len() == 3
            && map.get(TAG_BINARY) == Some(&serde_json::Value::Bool(true))
            && map.contains_key(TAG_KIND)
            && map.contains_key(TAG_CONTENTS)
    }

    fn from_tagged(map: &Map<String, serde_json::Value>) -> Result<Self, CodecError> {
        let kind = map
            .get(TAG_KIND)
            .and_then(|k| k.as_str())
            .and_then(BinaryKind::from_wire_name)
            .ok_or_else(|| CodecError::Malformed("unknown binary kind".into()))?;

        let contents = map
            .get(TAG_CONTENTS)
            .and_then(|c| c.as_array())
            .ok_or_else(|| CodecError::Malformed("binary contents must be an array".into()))?;

        let bytes = contents
            .iter()
            .map(|b| {
                b.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| CodecError::Malformed("binary contents must be bytes".into()))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        Self::new(kind, bytes)
    }
}

// =============================================================================
// VALUES
// =============================================================================

/// One element of an envelope's `data` array.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// Sequence of values.
    Array(Vec<Value>),
    /// String-keyed mapping of values.
    ///
    /// An object holding exactly `binary: true`, `kind` and `contents` is
    /// refused on encode, since it would come back as [`Value::Binary`].
    Object(BTreeMap<String, Value>),
    /// Tagged binary value.
    Binary(BinaryValue),
}

impl Value {
    /// Convert to the JSON tree sent on the wire, tagging binary values.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_wire).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect(),
            ),
            Value::Binary(bin) => bin.to_tagged(),
        }
    }

    /// Fail if any object in the tree would decode as a binary value.
    pub fn check_encodable(&self) -> Result<(), CodecError> {
        match self {
            Value::Array(items) => items.iter().try_for_each(Value::check_encodable),
            Value::Object(map) => {
                let shadows_binary = map.len() == 3
                    && map.get(TAG_BINARY) == Some(&Value::Bool(true))
                    && map.contains_key(TAG_KIND)
                    && map.contains_key(TAG_CONTENTS);
                if shadows_binary {
                    return Err(CodecError::Malformed(
                        "object is shaped like a tagged binary value".into(),
                    ));
                }
                map.values().try_for_each(Value::check_encodable)
            }
            _ => Ok(()),
        }
    }

    /// Rebuild from a wire JSON tree, restoring tagged binary values.
    pub fn from_wire(json: serde_json::Value) -> Result<Self, CodecError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_wire)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => {
                if BinaryValue::is_tagged(&map) {
                    Value::Binary(BinaryValue::from_tagged(&map)?)
                } else {
                    Value::Object(
                        map.into_iter()
                            .map(|(k, v)| Ok((k, Value::from_wire(v)?)))
                            .collect::<Result<_, CodecError>>()?,
                    )
                }
            }
        })
    }

    /// String contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer contents, if this is an integral number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Binary contents, if this is a binary value.
    pub fn as_binary(&self) -> Option<&BinaryValue> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become null.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<BinaryValue> for Value {
    fn from(b: BinaryValue) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<serde_json::Value> for Value {
    /// Plain JSON conversion. Objects are kept as objects even when shaped
    /// like a binary tag; use [`Value::from_wire`] to decode wire data.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_names_roundtrip() {
        for kind in BinaryKind::ALL {
            assert_eq!(BinaryKind::from_wire_name(kind.wire_name()), Some(kind));
        }
        assert_eq!(BinaryKind::from_wire_name("Int16Array"), None);
    }

    #[test]
    fn test_typed_layout_is_little_endian() {
        let value = BinaryValue::from_i16s(&[1, -1]);
        assert_eq!(value.kind(), BinaryKind::Int16);
        assert_eq!(value.as_bytes(), &[1, 0, 0xff, 0xff]);
        assert_eq!(value.len(), 2);
        assert_eq!(value.to_i16s(), Some(vec![1, -1]));
        assert_eq!(value.to_u16s(), None);
    }

    #[test]
    fn test_misaligned_contents_rejected() {
        let result = BinaryValue::new(BinaryKind::Float64, vec![0; 7]);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_tagged_shape() {
        let wire = Value::Binary(BinaryValue::from_u8s(&[7, 8])).to_wire();
        assert_eq!(
            wire,
            serde_json::json!({ "binary": true, "kind": "uint8", "contents": [7, 8] })
        );
    }

    #[test]
    fn test_nested_binary_restored() {
        let value = Value::Array(vec![
            Value::from("pos"),
            Value::Object(BTreeMap::from([(
                "xy".to_string(),
                Value::Binary(BinaryValue::from_f32s(&[1.5, -2.25])),
            )])),
        ]);
        let restored = Value::from_wire(value.to_wire()).unwrap();
        assert_eq!(restored, value);
    }

    #[test]
    fn test_invalid_tagged_values() {
        let cases = [
            serde_json::json!({ "binary": true, "kind": "int64", "contents": [] }),
            serde_json::json!({ "binary": true, "kind": "uint8", "contents": [256] }),
            serde_json::json!({ "binary": true, "kind": "uint32", "contents": [1, 2] }),
        ];
        for json in cases {
            assert!(matches!(Value::from_wire(json), Err(CodecError::Malformed(_))));
        }
    }

    #[test]
    fn test_plain_object_with_binary_key_stays_object() {
        let json = serde_json::json!({ "binary": true, "label": "not a buffer" });
        let value = Value::from_wire(json).unwrap();
        assert!(matches!(value, Value::Object(_)));
    }

    #[test]
    fn test_object_shaped_like_binary_not_encodable() {
        let lookalike = Value::Object(BTreeMap::from([
            ("binary".to_string(), Value::Bool(true)),
            ("kind".to_string(), Value::from("uint8")),
            ("contents".to_string(), Value::Array(vec![])),
        ]));
        let nested = Value::Array(vec![Value::from(1i64), lookalike.clone()]);
        assert!(matches!(nested.check_encodable(), Err(CodecError::Malformed(_))));

        let mut relaxed = BTreeMap::new();
        relaxed.insert("binary".to_string(), Value::Bool(false));
        relaxed.insert("kind".to_string(), Value::from("uint8"));
        relaxed.insert("contents".to_string(), Value::Array(vec![]));
        assert!(Value::Object(relaxed).check_encodable().is_ok());
        assert!(Value::Binary(BinaryValue::from_u8s(&[1])).check_encodable().is_ok());
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(Value::from(f64::NAN), Value::Null);
    }

    proptest! {
        #[test]
        fn prop_any_kind_roundtrips(
            kind_idx in 0usize..11,
            elems in 0usize..32,
            seed in any::<u8>(),
        ) {
            let kind = BinaryKind::ALL[kind_idx];
            let bytes: Vec<u8> = (0..elems * kind.element_size())
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();
            let value = Value::Binary(BinaryValue::new(kind, bytes).unwrap());
            prop_assert_eq!(Value::from_wire(value.to_wire()).unwrap(), value);
        }
    }
}
