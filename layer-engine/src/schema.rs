//! Collaborator seams: method descriptors, the wire codec, file references.

use std::collections::HashMap;

use layer_tl_types::Value;

use crate::errors::InvocationError;

// ─── MethodSchema ─────────────────────────────────────────────────────────────

/// Descriptor of one callable method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub name:        String,
    /// Expected result type, e.g. `"Bool"` or `"upload.File"`.
    pub result_type: String,
}

/// Maps a method name to its descriptor.
pub trait MethodSchema: Send + Sync {
    fn find_method(&self, name: &str) -> Option<MethodInfo>;
}

/// In-memory method table.
#[derive(Clone, Debug, Default)]
pub struct StaticSchema {
    methods: HashMap<String, String>,
}

impl StaticSchema {
    pub fn new() -> Self { Self::default() }

    /// Builder-style registration.
    pub fn with(mut self, name: impl Into<String>, result_type: impl Into<String>) -> Self {
        self.insert(name, result_type);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, result_type: impl Into<String>) {
        self.methods.insert(name.into(), result_type.into());
    }
}

impl<N: Into<String>, T: Into<String>> FromIterator<(N, T)> for StaticSchema {
    fn from_iter<I: IntoIterator<Item = (N, T)>>(iter: I) -> Self {
        let mut schema = Self::new();
        for (n, t) in iter { schema.insert(n, t); }
        schema
    }
}

impl MethodSchema for StaticSchema {
    fn find_method(&self, name: &str) -> Option<MethodInfo> {
        self.methods.get(name).map(|t| MethodInfo { name: name.to_string(), result_type: t.clone() })
    }
}

// ─── TlCodec ──────────────────────────────────────────────────────────────────

/// Turns dynamic calls into bytes and result bytes back into values.
///
/// Only the TCP socket needs one; in-process sockets pass [`Value`]s through.
pub trait TlCodec: Send + Sync {
    fn serialize_method(&self, method: &str, args: &Value) -> Result<Vec<u8>, InvocationError>;
    fn deserialize(&self, result_type: &str, body: &[u8]) -> Result<Value, InvocationError>;
}

// ─── ReferenceDatabase ────────────────────────────────────────────────────────

/// Supplies the opaque `file_reference` bytes for a photo or document.
pub trait ReferenceDatabase: Send + Sync {
    fn get_reference(&self, object: &Value) -> Option<Vec<u8>>;
}

/// A reference database that knows nothing; the object's own
/// `file_reference` field is used instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReferences;

impl ReferenceDatabase for NoReferences {
    fn get_reference(&self, _: &Value) -> Option<Vec<u8>> { None }
}
