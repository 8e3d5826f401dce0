//! A pure, I/O-free tagged value type standing in for the subset of the
//! GVariant/D-Bus type system this crate needs to marshal: method arguments,
//! property values, and signal payloads.
//!
//! The tree (component B) and the configurator DSL (component C) only ever
//! see `Value`; conversion to and from `dbus::arg` types happens exclusively
//! in the publisher (component D), keeping the object model itself free of
//! any bus dependency.

use std::collections::BTreeMap;

use crate::path::ObjectPath;

/// A GVariant-equivalent value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    I32(i32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Variant(Box<Value>),
    Tuple(Vec<Value>),
}

impl Value {
    /// The D-Bus type signature character(s) for this value's outermost
    /// shape, used when building introspection XML (component B).
    pub fn signature(&self) -> &'static str {
        match self {
            Value::Bool(_) => "b",
            Value::U8(_) => "y",
            Value::U16(_) => "q",
            Value::U32(_) => "u",
            Value::I16(_) => "n",
            Value::I32(_) => "i",
            Value::U64(_) => "t",
            Value::I64(_) => "x",
            Value::F64(_) => "d",
            Value::Str(_) => "s",
            Value::ObjectPath(_) => "o",
            Value::Signature(_) => "g",
            Value::Bytes(_) => "ay",
            Value::Array(_) => "av",
            Value::Dict(_) => "a{sv}",
            Value::Variant(_) => "v",
            Value::Tuple(_) => "r",
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(v.into_iter().map(Value::Str).collect())
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::ObjectPath(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_match_dbus_conventions() {
        assert_eq!(Value::Bytes(vec![1, 2, 3]).signature(), "ay");
        assert_eq!(Value::Dict(BTreeMap::new()).signature(), "a{sv}");
        assert_eq!(Value::Str("hi".into()).signature(), "s");
    }

    #[test]
    fn accessors_narrow_correctly() {
        let v: Value = vec![0x48u8, 0x69].into();
        assert_eq!(v.as_bytes(), Some(&[0x48, 0x69][..]));
        assert_eq!(v.as_str(), None);
    }
}
