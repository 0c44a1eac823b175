//! The physical socket seam.
//!
//! A [`Connector`] opens one socket for a [`ConnectionContext`]. The engine
//! hands the socket ready-made [`Frame`]s; everything the server sends back
//! is reported on the event channel as [`SocketEvent`]s.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use layer_crypto::AuthKey;
use layer_tl_types::Value;
use tokio::sync::mpsc;

use crate::errors::InvocationError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a socket belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionContext {
    pub dc_id:     i32,
    pub is_media:  bool,
    pub is_cdn:    bool,
    pub socket_id: usize,
}

impl ConnectionContext {
    pub fn new(dc_id: i32, is_cdn: bool) -> Self {
        Self { dc_id, is_media: dc_id < 0, is_cdn, socket_id: 0 }
    }

    pub fn with_socket(mut self, socket_id: usize) -> Self {
        self.socket_id = socket_id;
        self
    }
}

// ─── Frames ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum PacketBody {
    /// A dynamic call, serialized by the socket's codec.
    Call(Value),
    /// Pre-serialized TL (service messages, key binding).
    Raw(Vec<u8>),
}

/// One numbered message inside a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub msg_id:       i64,
    pub seq_no:       i32,
    pub method:       String,
    pub body:         PacketBody,
    /// Type used to decode the reply. Empty when no reply is expected.
    pub result_type:  String,
    /// Wrap in `invokeAfterMsg` with this id.
    pub invoke_after: Option<i64>,
}

/// What one `write` puts on the wire.
#[derive(Clone, Debug)]
pub struct Frame {
    /// `None` sends the packet unencrypted.
    pub auth_key:   Option<AuthKey>,
    pub salt:       i64,
    pub session_id: i64,
    /// `(msg_id, seq_no)` of the enclosing `msg_container` when batching.
    pub container:  Option<(i64, i32)>,
    pub packets:    Vec<Packet>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Everything a socket reports back to its connection.
#[derive(Debug)]
pub enum SocketEvent {
    /// Reply to `req_msg_id`.
    Result { req_msg_id: i64, result: Result<Value, InvocationError> },
    BadSalt { bad_msg_id: i64, new_salt: i64 },
    BadMsg { bad_msg_id: i64, code: i32 },
    Ack { msg_ids: Vec<i64> },
    NewSession { first_msg_id: i64, server_salt: i64 },
    /// Content-related server messages that must be acknowledged.
    Received { msg_ids: Vec<i64> },
    /// The socket is gone; no more events will follow.
    Closed { reason: Option<String> },
}

/// A freshly negotiated key.
#[derive(Clone, Debug)]
pub struct GeneratedKey {
    pub auth_key:    AuthKey,
    pub salt:        i64,
    pub time_offset: i32,
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// One open physical connection.
pub trait Socket: Send + Sync {
    /// Resolves once the frame is written out.
    fn write(&self, frame: Frame) -> BoxFuture<'_, Result<(), InvocationError>>;

    /// Run the DH handshake over this socket. `expires_in` makes it a
    /// temporary key.
    fn create_auth_key(&self, expires_in: Option<i32>) -> BoxFuture<'_, Result<GeneratedKey, InvocationError>>;

    fn disconnect(&self);
}

/// Opens sockets.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        ctx:    ConnectionContext,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> BoxFuture<'_, Result<Arc<dyn Socket>, InvocationError>>;
}
