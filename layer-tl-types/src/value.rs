//! Dynamic TL values.
//!
//! RPC arguments and results are trees of [`Value`]s. An [`Object`] carries a
//! `predicate` (the constructor or method name, e.g. `"upload.getFile"`) and
//! named fields. Turning a tree into bytes is the job of an external codec.

use std::collections::BTreeMap;

use crate::deserialize::Error;

// ─── Value ───────────────────────────────────────────────────────────────────

/// A single node in a dynamic TL tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Vector(Vec<Value>),
    Object(Object),
}

impl Value {
    /// The predicate name when this is an object.
    pub fn predicate(&self) -> Option<&str> {
        self.as_object().map(|o| o.predicate.as_str())
    }

    /// Field lookup on an object value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_object().and_then(|o| o.get(field))
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        match self {
            Self::Object(o) => o.fields.get_mut(field),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    /// `true` only for `Bool(true)`.
    pub fn is_true(&self) -> bool { matches!(self, Self::Bool(true)) }

    pub fn as_bool(&self) -> Option<bool> {
        match self { Self::Bool(b) => Some(*b), _ => None }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v)  => Some(*v),
            Self::Long(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Accepts both `Int` and `Long`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v)  => Some(*v as i64),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self { Self::Double(v) => Some(*v), _ => None }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b)  => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Self::String(s) => Some(s), _ => None }
    }

    pub fn as_vec(&self) -> Option<&[Value]> {
        match self { Self::Vector(v) => Some(v), _ => None }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self { Self::Object(o) => Some(o), _ => None }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self { Self::Object(o) => Some(o), _ => None }
    }

    /// Take ownership of the bytes, erroring with the field name otherwise.
    pub fn into_bytes(self, field: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::Bytes(b)  => Ok(b),
            Self::String(s) => Ok(s.into_bytes()),
            _ => Err(Error::UnexpectedValue { expected: "bytes", field: field.into() }),
        }
    }
}

// ─── Object ──────────────────────────────────────────────────────────────────

/// A constructor or method call: a predicate name plus named fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Object {
    pub predicate: String,
    pub fields:    BTreeMap<String, Value>,
}

impl Object {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self { predicate: predicate.into(), fields: BTreeMap::new() }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Required integer field.
    pub fn i64_field(&self, field: &str) -> Result<i64, Error> {
        self.get(field)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::UnexpectedValue { expected: "integer", field: field.into() })
    }

    /// Required bytes field.
    pub fn bytes_field(&self, field: &str) -> Result<&[u8], Error> {
        self.get(field)
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::UnexpectedValue { expected: "bytes", field: field.into() })
    }
}

// ─── Conversions ─────────────────────────────────────────────────────────────

macro_rules! value_from {
    ( $( $t:ty => $variant:ident ),+ $(,)? ) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self { Self::$variant(v.into()) }
            }
        )+
    };
}

value_from! {
    bool        => Bool,
    i32         => Int,
    i64         => Long,
    f64         => Double,
    Vec<u8>     => Bytes,
    String      => String,
    &str        => String,
    Vec<Value>  => Vector,
    Object      => Object,
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self { Self::Bytes(v.to_vec()) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
