//! Error types for layer-engine.

use std::{fmt, io};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code:  i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name:  String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")` exact match
    /// - `err.is("FILE_*")` starts-with match
    /// - `err.is("*_INVALID")` ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Returns the flood-wait duration in seconds, if this is a FLOOD_WAIT error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(|v| v as u64)
        } else {
            None
        }
    }
}

/// Remote errors that callers treat as a successful no-op.
pub const BENIGN_ERRORS: &[&str] = &[
    "USER_DEACTIVATED",
    "USER_DEACTIVATED_BAN",
    "BOT_METHOD_INVALID",
    "USER_IS_BOT",
    "CHAT_WRITE_FORBIDDEN",
    "CHANNEL_PRIVATE",
    "USER_IS_BLOCKED",
    "PEER_ID_INVALID",
    "INPUT_USER_DEACTIVATED",
];

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any engine operation that talks to the network.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// Response deserialization failed.
    Deserialize(String),
    /// The request was dropped (socket or engine shut down before a reply).
    Dropped,
    /// The schema has no descriptor for this method.
    UnknownMethod(String),
    /// Missing location, malformed media, unknown datacenter and similar.
    Usage(String),
    /// Integrity or key-binding failure. Never retried.
    Security(String),
    /// An explicit cancellation was requested.
    Cancelled,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)           => write!(f, "{e}"),
            Self::Io(e)            => write!(f, "I/O error: {e}"),
            Self::Deserialize(s)   => write!(f, "deserialize error: {s}"),
            Self::Dropped          => write!(f, "request dropped"),
            Self::UnknownMethod(m) => write!(f, "could not find method {m}"),
            Self::Usage(s)         => write!(f, "{s}"),
            Self::Security(s)      => write!(f, "security error: {s}"),
            Self::Cancelled        => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl From<layer_tl_types::deserialize::Error> for InvocationError {
    fn from(e: layer_tl_types::deserialize::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl From<layer_mtproto::authentication::Error> for InvocationError {
    fn from(e: layer_mtproto::authentication::Error) -> Self { Self::Security(e.to_string()) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a FLOOD_WAIT error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }

    /// Whether this remote error is on the benign allow-list.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Rpc(e) => BENIGN_ERRORS.contains(&e.name.as_str()),
            _            => false,
        }
    }
}
