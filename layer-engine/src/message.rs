//! Tracked outgoing messages.

use std::sync::Arc;

use layer_tl_types::Value;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::InvocationError;
use crate::socket::PacketBody;

type Reply = Result<Value, InvocationError>;

/// Service methods that are never replayed after a disconnect.
const SERVICE_METHODS: &[&str] = &["msgs_state_req", "ping_delay_disconnect", "msgs_ack"];

// ─── State ────────────────────────────────────────────────────────────────────

pub const STATE_SENT:    u8 = 1;
pub const STATE_ACKED:   u8 = 2;
pub const STATE_REPLIED: u8 = 4;

struct Inner {
    msg_id:       Option<i64>,
    seq_no:       Option<i32>,
    state:        u8,
    invoke_after: Option<i64>,
    reply:        Option<oneshot::Sender<Reply>>,
}

// ─── OutgoingMessage ──────────────────────────────────────────────────────────

/// One logical call as the dispatcher tracks it.
///
/// The message id and sequence number stay unset until the message is
/// written, and are cleared again when it must move to another socket.
pub struct OutgoingMessage {
    method:           String,
    body:             PacketBody,
    result_type:      String,
    content_related:  bool,
    unencrypted:      bool,
    expects_reply:    bool,
    auth_handshake:   bool,
    file_related:     bool,
    user_related:     bool,
    bot_api:          bool,
    queue:            Option<String>,
    flood_wait_limit: Option<u64>,
    inner:            Mutex<Inner>,
}

impl OutgoingMessage {
    fn build(method: String, body: PacketBody, result_type: String, expects_reply: bool) -> Self {
        Self {
            method,
            body,
            result_type,
            content_related:  true,
            unencrypted:      false,
            expects_reply,
            auth_handshake:   false,
            file_related:     false,
            user_related:     false,
            bot_api:          false,
            queue:            None,
            flood_wait_limit: None,
            inner: Mutex::new(Inner {
                msg_id:       None,
                seq_no:       None,
                state:        0,
                invoke_after: None,
                reply:        None,
            }),
        }
    }

    /// A dynamic call.
    pub fn call(method: impl Into<String>, args: Value, result_type: impl Into<String>) -> Self {
        Self::build(method.into(), PacketBody::Call(args), result_type.into(), true)
    }

    /// A pre-serialized call.
    pub fn raw(method: impl Into<String>, body: Vec<u8>, result_type: impl Into<String>) -> Self {
        Self::build(method.into(), PacketBody::Raw(body), result_type.into(), true)
    }

    /// `msgs_ack` for the given server message ids.
    pub(crate) fn ack(msg_ids: Vec<i64>) -> Self {
        use layer_tl_types::Serializable;
        let body = layer_mtproto::tl::MsgsAck { msg_ids }.to_bytes();
        let mut msg = Self::build("msgs_ack".into(), PacketBody::Raw(body), String::new(), false);
        msg.content_related = false;
        msg.auth_handshake = true;
        msg
    }

    // ── Builder flags ──────────────────────────────────────────────────────

    pub fn unencrypted(mut self, v: bool) -> Self { self.unencrypted = v; self }
    pub fn auth_handshake(mut self, v: bool) -> Self { self.auth_handshake = v; self }
    pub fn file_related(mut self, v: bool) -> Self { self.file_related = v; self }
    pub fn user_related(mut self, v: bool) -> Self { self.user_related = v; self }
    pub fn bot_api(mut self, v: bool) -> Self { self.bot_api = v; self }
    pub fn queue(mut self, tag: Option<String>) -> Self { self.queue = tag; self }
    pub fn flood_wait_limit(mut self, secs: Option<u64>) -> Self { self.flood_wait_limit = secs; self }

    /// Pin the id this message will be sent with.
    pub fn with_msg_id(self, msg_id: i64) -> Self {
        self.inner.lock().msg_id = Some(msg_id);
        self
    }

    /// Wrap in an `Arc` and hand back the receiving side of its reply.
    pub fn into_tracked(self) -> (Arc<Self>, PendingReply) {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().reply = Some(tx);
        (Arc::new(self), PendingReply { rx })
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn method(&self) -> &str { &self.method }
    pub fn body(&self) -> &PacketBody { &self.body }
    pub fn result_type(&self) -> &str { &self.result_type }
    pub fn is_content_related(&self) -> bool { self.content_related }
    pub fn is_unencrypted(&self) -> bool { self.unencrypted }
    pub fn expects_reply(&self) -> bool { self.expects_reply }
    pub fn is_auth_handshake(&self) -> bool { self.auth_handshake }
    pub fn is_file_related(&self) -> bool { self.file_related }
    pub fn is_user_related(&self) -> bool { self.user_related }
    pub fn is_bot_api(&self) -> bool { self.bot_api }
    pub fn queue_tag(&self) -> Option<&str> { self.queue.as_deref() }
    pub fn get_flood_wait_limit(&self) -> Option<u64> { self.flood_wait_limit }

    pub fn is_service(&self) -> bool { SERVICE_METHODS.contains(&self.method.as_str()) }

    pub fn msg_id(&self) -> Option<i64> { self.inner.lock().msg_id }
    pub fn seq_no(&self) -> Option<i32> { self.inner.lock().seq_no }
    pub fn has_seq_no(&self) -> bool { self.inner.lock().seq_no.is_some() }
    pub fn invoke_after(&self) -> Option<i64> { self.inner.lock().invoke_after }

    pub fn state(&self) -> u8 { self.inner.lock().state }
    pub fn is_replied(&self) -> bool { self.state() & STATE_REPLIED != 0 }

    /// Replied, or acknowledged when nobody waits for a reply.
    pub fn can_garbage_collect(&self) -> bool {
        let state = self.state();
        state & STATE_REPLIED != 0 || (!self.expects_reply && state & STATE_ACKED != 0)
    }

    // ── Mutation ───────────────────────────────────────────────────────────

    /// Assign identifiers at write time. Already assigned ones are kept.
    pub(crate) fn assign(&self, next: impl FnOnce() -> (i64, i32), invoke_after: Option<i64>) -> (i64, i32) {
        let mut inner = self.inner.lock();
        let (msg_id, seq_no) = match (inner.msg_id, inner.seq_no) {
            (Some(id), Some(seq)) => (id, seq),
            (Some(id), None) => {
                let (_, seq) = next();
                (id, seq)
            }
            _ => next(),
        };
        inner.msg_id = Some(msg_id);
        inner.seq_no = Some(seq_no);
        if invoke_after.is_some() {
            inner.invoke_after = invoke_after;
        }
        inner.state |= STATE_SENT;
        (msg_id, seq_no)
    }

    /// Forget identifiers so the next write renumbers the message.
    pub fn clear_ids(&self) {
        let mut inner = self.inner.lock();
        inner.msg_id = None;
        inner.seq_no = None;
        inner.invoke_after = None;
    }

    pub(crate) fn acked(&self) {
        self.inner.lock().state |= STATE_ACKED;
    }

    /// Deliver the reply. Later replies for the same message are ignored.
    pub(crate) fn reply(&self, result: Reply) {
        let tx = {
            let mut inner = self.inner.lock();
            inner.state |= STATE_REPLIED;
            inner.reply.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    /// Mark replied without a payload (the caller gave up on it).
    pub(crate) fn abandon(&self) {
        self.reply(Err(InvocationError::Dropped));
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(f, "{} (msg_id {:?}, seq_no {:?}, state {})", self.method, inner.msg_id, inner.seq_no, inner.state)
    }
}

// ─── PendingReply ─────────────────────────────────────────────────────────────

/// Receiving half of a tracked call.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub async fn wait(self) -> Reply {
        self.rx.await.unwrap_or(Err(InvocationError::Dropped))
    }
}
