//! Typed message properties and their wire encoding.
//!
//! Applications attach a map of name to [`PropertyValue`] to each posted
//! message, optionally overriding the wire type of individual entries.
//! [`encode`] validates the pair and produces [`WireProperties`];
//! [`decode`] goes the other way for delivered messages.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PropertyError;

/// Wire type tag of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyType {
    /// Boolean.
    Bool,
    /// Single byte.
    Char,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// UTF-8 text.
    String,
    /// Arbitrary bytes.
    Binary,
}

impl PropertyType {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Bool => 1,
            Self::Char => 2,
            Self::Short => 3,
            Self::Int32 => 4,
            Self::Int64 => 5,
            Self::String => 6,
            Self::Binary => 7,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Bool),
            2 => Some(Self::Char),
            3 => Some(Self::Short),
            4 => Some(Self::Int32),
            5 => Some(Self::Int64),
            6 => Some(Self::String),
            7 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Application-side property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// Wire type used when no override is given.
    #[must_use]
    pub const fn default_type(&self) -> PropertyType {
        match self {
            Self::Bool(_) => PropertyType::Bool,
            Self::Int(_) => PropertyType::Int64,
            Self::Text(_) => PropertyType::String,
            Self::Bytes(_) => PropertyType::Binary,
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i16> for PropertyValue {
    fn from(value: i16) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for PropertyValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl TryFrom<serde_json::Value> for PropertyValue {
    type Error = PropertyError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::String(s) => Ok(Self::Text(s)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| PropertyError::UnsupportedType(format!("number ({n})"))),
            Value::Null => Err(PropertyError::UnsupportedType("null".into())),
            Value::Array(_) => Err(PropertyError::UnsupportedType("array".into())),
            Value::Object(_) => Err(PropertyError::UnsupportedType("object".into())),
        }
    }
}

/// Property values keyed by name.
pub type Properties = HashMap<String, PropertyValue>;

/// Wire type tags keyed by property name.
pub type PropertyTypes = HashMap<String, PropertyType>;

/// Encoded property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Bool(bool),
    Char(u8),
    Short(i16),
    Int32(i32),
    Int64(i64),
    String(Bytes),
    Binary(Bytes),
    /// A tag this client does not know about.
    Unrecognized(i32),
}

impl WireValue {
    #[must_use]
    pub const fn type_code(&self) -> i32 {
        match self {
            Self::Bool(_) => PropertyType::Bool.code(),
            Self::Char(_) => PropertyType::Char.code(),
            Self::Short(_) => PropertyType::Short.code(),
            Self::Int32(_) => PropertyType::Int32.code(),
            Self::Int64(_) => PropertyType::Int64.code(),
            Self::String(_) => PropertyType::String.code(),
            Self::Binary(_) => PropertyType::Binary.code(),
            Self::Unrecognized(code) => *code,
        }
    }
}

/// Encoded properties, ordered by name.
pub type WireProperties = BTreeMap<String, WireValue>;

/// Encode application properties for the wire.
///
/// # Errors
/// Returns error if an override names a property with no value, or a
/// value cannot be represented by its (possibly overridden) type.
pub fn encode(
    properties: &Properties,
    overrides: &PropertyTypes,
) -> Result<WireProperties, PropertyError> {
    let mut unknown: Vec<&String> = overrides
        .keys()
        .filter(|name| !properties.contains_key(*name))
        .collect();
    unknown.sort();
    if let Some(name) = unknown.first() {
        return Err(PropertyError::UnknownOverride((*name).clone()));
    }

    let sorted: BTreeMap<&String, &PropertyValue> = properties.iter().collect();
    sorted
        .into_iter()
        .map(|(name, value)| {
            let ty = overrides
                .get(name)
                .copied()
                .unwrap_or_else(|| value.default_type());
            Ok((name.clone(), encode_value(name, value, ty)?))
        })
        .collect()
}

fn encode_value(
    name: &str,
    value: &PropertyValue,
    ty: PropertyType,
) -> Result<WireValue, PropertyError> {
    let incorrect = |expected| PropertyError::IncorrectType {
        name: name.to_string(),
        provided: value.kind(),
        expected,
    };

    match ty {
        PropertyType::Bool => match value {
            PropertyValue::Bool(b) => Ok(WireValue::Bool(*b)),
            _ => Err(incorrect("bool")),
        },
        PropertyType::Char => match value {
            PropertyValue::Bytes(b) if b.len() == 1 => Ok(WireValue::Char(b[0])),
            PropertyValue::Bytes(b) => Err(PropertyError::CharLength {
                name: name.to_string(),
                len: b.len(),
            }),
            _ => Err(incorrect("bytes")),
        },
        PropertyType::Short => {
            let n = integer(value).ok_or_else(|| incorrect("int"))?;
            i16::try_from(n)
                .map(WireValue::Short)
                .map_err(|_| out_of_range(name, i16::MIN.into(), i16::MAX.into()))
        }
        PropertyType::Int32 => {
            let n = integer(value).ok_or_else(|| incorrect("int"))?;
            i32::try_from(n)
                .map(WireValue::Int32)
                .map_err(|_| out_of_range(name, i32::MIN.into(), i32::MAX.into()))
        }
        PropertyType::Int64 => integer(value)
            .map(WireValue::Int64)
            .ok_or_else(|| incorrect("int")),
        PropertyType::String => match value {
            PropertyValue::Text(s) => Ok(WireValue::String(Bytes::copy_from_slice(s.as_bytes()))),
            _ => Err(incorrect("text")),
        },
        PropertyType::Binary => match value {
            PropertyValue::Bytes(b) => Ok(WireValue::Binary(Bytes::copy_from_slice(b))),
            _ => Err(incorrect("bytes")),
        },
    }
}

// Booleans are integers for the numeric tags.
fn integer(value: &PropertyValue) -> Option<i64> {
    match value {
        PropertyValue::Int(n) => Some(*n),
        PropertyValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn out_of_range(name: &str, min: i64, max: i64) -> PropertyError {
    PropertyError::OutOfRange {
        name: name.to_string(),
        min,
        max,
    }
}

/// Properties of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedProperties {
    pub values: Properties,
    pub types: PropertyTypes,
}

/// Decode wire properties of a delivered message.
///
/// # Errors
/// Returns every property that could not be decoded; the message as a
/// whole is then unusable.
pub fn decode(wire: &WireProperties) -> Result<DecodedProperties, Vec<PropertyError>> {
    let mut decoded = DecodedProperties::default();
    let mut errors = Vec::new();

    for (name, value) in wire {
        let (value, ty) = match value {
            WireValue::Bool(b) => (PropertyValue::Bool(*b), PropertyType::Bool),
            WireValue::Char(c) => (PropertyValue::Bytes(vec![*c]), PropertyType::Char),
            WireValue::Short(n) => (PropertyValue::Int((*n).into()), PropertyType::Short),
            WireValue::Int32(n) => (PropertyValue::Int((*n).into()), PropertyType::Int32),
            WireValue::Int64(n) => (PropertyValue::Int(*n), PropertyType::Int64),
            WireValue::String(raw) => match std::str::from_utf8(raw) {
                Ok(s) => (PropertyValue::Text(s.to_string()), PropertyType::String),
                Err(_) => {
                    errors.push(PropertyError::NonUtf8String(name.clone()));
                    continue;
                }
            },
            WireValue::Binary(raw) => (PropertyValue::Bytes(raw.to_vec()), PropertyType::Binary),
            WireValue::Unrecognized(code) => {
                errors.push(PropertyError::UnrecognizedType {
                    name: name.clone(),
                    code: *code,
                });
                continue;
            }
        };
        decoded.values.insert(name.clone(), value);
        decoded.types.insert(name.clone(), ty);
    }

    if errors.is_empty() {
        Ok(decoded)
    } else {
        Err(errors)
    }
}
