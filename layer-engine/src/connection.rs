//! One physical socket inside a datacenter pool.
//!
//! A [`Connection`] owns the MTProto session of its socket (message ids and
//! sequence numbers), a queue of messages waiting to be written, and the
//! table of messages written but not yet answered. Events coming back from
//! the socket are handled on a dedicated task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use layer_mtproto::Session;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::datacenter::DataCenter;
use crate::errors::{InvocationError, RpcError};
use crate::message::OutgoingMessage;
use crate::socket::{ConnectionContext, Connector, Frame, Packet, Socket, SocketEvent};

/// Most messages packed into one `msg_container`.
const MAX_CONTAINER_SIZE: usize = 100;

type Msg = Arc<OutgoingMessage>;

// ─── RecallOptions ────────────────────────────────────────────────────────────

/// How [`Connection::recall`] resends.
#[derive(Clone, Default)]
pub struct RecallOptions {
    /// Move the messages to this datacenter instead of resending here.
    pub datacenter: Option<Arc<DataCenter>>,
    /// Queue only; leave flushing to the caller.
    pub postpone:   bool,
}

// ─── Connection ───────────────────────────────────────────────────────────────

struct ConnState {
    session:    Session,
    pending:    VecDeque<Msg>,
    sent:       HashMap<i64, Msg>,
    containers: HashMap<i64, Vec<i64>>,
    /// Last message id written per queue tag.
    queues:     HashMap<String, i64>,
}

pub struct Connection {
    id:         usize,
    ctx:        ConnectionContext,
    dc:         Weak<DataCenter>,
    socket:     Arc<dyn Socket>,
    state:      Mutex<ConnState>,
    write_lock: tokio::sync::Mutex<()>,
    closing:    AtomicBool,
    reader:     Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open the socket for `ctx` and start handling its events.
    pub(crate) async fn open(
        dc:        &Arc<DataCenter>,
        ctx:       ConnectionContext,
        connector: &dyn Connector,
    ) -> Result<Arc<Self>, InvocationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = connector.connect(ctx, tx).await?;
        let conn = Arc::new(Self {
            id: ctx.socket_id,
            ctx,
            dc: Arc::downgrade(dc),
            socket,
            state: Mutex::new(ConnState {
                session:    Session::new(),
                pending:    VecDeque::new(),
                sent:       HashMap::new(),
                containers: HashMap::new(),
                queues:     HashMap::new(),
            }),
            write_lock: tokio::sync::Mutex::new(()),
            closing:    AtomicBool::new(false),
            reader:     Mutex::new(None),
        });
        let handle = tokio::spawn(Self::run(Arc::downgrade(&conn), rx));
        *conn.reader.lock() = Some(handle);
        tracing::debug!("[conn] DC{}: socket {} open", ctx.dc_id, ctx.socket_id);
        Ok(conn)
    }

    pub fn id(&self) -> usize { self.id }
    pub fn context(&self) -> ConnectionContext { self.ctx }
    pub fn socket(&self) -> &Arc<dyn Socket> { &self.socket }
    pub fn session_id(&self) -> i64 { self.state.lock().session.session_id() }

    /// Allocate a message id from this socket's session.
    pub fn next_msg_id(&self) -> i64 { self.state.lock().session.next_msg_id().0 }

    /// Messages written and still awaiting a reply.
    pub fn in_flight(&self) -> usize { self.state.lock().sent.len() }

    pub fn has_pending(&self) -> bool { !self.state.lock().pending.is_empty() }

    pub fn is_tracking(&self, msg_id: i64) -> bool {
        let st = self.state.lock();
        st.sent.contains_key(&msg_id) || st.containers.contains_key(&msg_id)
    }

    pub(crate) fn reset_session(&self) {
        let mut st = self.state.lock();
        st.session.reset();
        st.queues.clear();
    }

    /// Queue `msg` for the next flush.
    pub(crate) fn enqueue(&self, msg: Msg) {
        self.state.lock().pending.push_back(msg);
    }

    // ── Writing ────────────────────────────────────────────────────────────

    /// Write every message that can currently be sent.
    ///
    /// Encrypted messages wait for a temporary key, and for that key to be
    /// bound unless the datacenter is a CDN or the message belongs to the
    /// handshake itself.
    pub async fn flush(self: &Arc<Self>) -> Result<(), InvocationError> {
        let _guard = self.write_lock.lock().await;
        loop {
            let Some(dc) = self.dc.upgrade() else {
                return Err(InvocationError::Dropped);
            };
            let Some(frame) = self.next_frame(&dc) else {
                return Ok(());
            };
            let count = frame.packets.len();
            dc.writing(self.id, true);
            let res = self.socket.write(frame).await;
            dc.writing(self.id, false);
            if let Err(e) = res {
                tracing::warn!("[conn] DC{}: write on socket {} failed: {e}", dc.id(), self.id);
                let this = Arc::clone(self);
                let reason = e.to_string();
                tokio::spawn(async move { this.lost(Some(reason)).await });
                return Err(e);
            }
            tracing::debug!("[conn] DC{}: wrote {count} message(s) on socket {}", dc.id(), self.id);
        }
    }

    fn next_frame(&self, dc: &DataCenter) -> Option<Frame> {
        let temp = dc.temp_key();
        let mut st = self.state.lock();
        let ConnState { session, pending, sent, containers, queues } = &mut *st;

        let sendable = |m: &OutgoingMessage| match &temp {
            _ if m.is_unencrypted() => true,
            Some(t) => t.is_bound() || dc.is_cdn() || m.is_auth_handshake(),
            None    => false,
        };

        let mut batch: Vec<Msg> = Vec::new();
        let mut held = VecDeque::new();
        let mut plain = false;
        while let Some(msg) = pending.pop_front() {
            if msg.is_replied() {
                continue;
            }
            let fits = batch.len() < MAX_CONTAINER_SIZE && !plain
                && (!msg.is_unencrypted() || batch.is_empty());
            if fits && sendable(&msg) {
                plain = msg.is_unencrypted();
                batch.push(msg);
            } else {
                held.push_back(msg);
            }
        }
        *pending = held;
        if batch.is_empty() {
            return None;
        }

        let mut packets = Vec::with_capacity(batch.len());
        for msg in &batch {
            let prev = msg.queue_tag().and_then(|tag| queues.get(tag).copied())
                .filter(|&p| Some(p) != msg.msg_id());
            let (msg_id, seq_no) = msg.assign(
                || (session.next_msg_id().0, session.next_seq_no(msg.is_content_related())),
                prev,
            );
            if let Some(tag) = msg.queue_tag() {
                queues.insert(tag.to_string(), msg_id);
            }
            if msg.expects_reply() {
                sent.insert(msg_id, Arc::clone(msg));
            }
            packets.push(Packet {
                msg_id,
                seq_no,
                method:       msg.method().to_string(),
                body:         msg.body().clone(),
                result_type:  msg.result_type().to_string(),
                invoke_after: msg.invoke_after(),
            });
        }

        let container = (packets.len() > 1).then(|| {
            let id = session.next_msg_id().0;
            containers.insert(id, packets.iter().map(|p| p.msg_id).collect());
            (id, session.next_seq_no(false))
        });
        containers.retain(|_, members| members.iter().any(|m| sent.contains_key(m)));

        let session_id = session.session_id();
        if plain {
            return Some(Frame { auth_key: None, salt: 0, session_id, container: None, packets });
        }
        let temp = temp?;
        Some(Frame {
            auth_key: Some(temp.key().clone()),
            salt: temp.salt,
            session_id,
            container,
            packets,
        })
    }

    // ── Recall ─────────────────────────────────────────────────────────────

    fn expand(st: &ConnState, msg_id: i64) -> Vec<i64> {
        st.containers.get(&msg_id).cloned().unwrap_or_else(|| vec![msg_id])
    }

    /// Resend `msg_id` (or every member of the container it names).
    ///
    /// Returns how many messages were recalled.
    pub async fn recall(self: &Arc<Self>, msg_id: i64, opts: RecallOptions) -> usize {
        let mut moved = Vec::new();
        let mut local = 0;
        {
            let mut st = self.state.lock();
            for id in Self::expand(&st, msg_id) {
                let Some(msg) = st.sent.get(&id).cloned() else { continue };
                if msg.can_garbage_collect() {
                    continue;
                }
                if opts.datacenter.is_some() {
                    st.sent.remove(&id);
                    msg.clear_ids();
                    moved.push(msg);
                } else {
                    if !msg.has_seq_no() {
                        st.sent.remove(&id);
                    }
                    st.pending.push_back(msg);
                    local += 1;
                }
            }
        }
        let total = local + moved.len();
        if let Some(target) = opts.datacenter {
            tracing::debug!("[conn] moving {} message(s) to DC{}", moved.len(), target.id());
            for msg in moved {
                if let Err(e) = target.send(msg, !opts.postpone).await {
                    tracing::warn!("[conn] DC{}: resend failed: {e}", target.id());
                }
            }
        }
        if local > 0 && !opts.postpone {
            let _ = self.flush().await;
        }
        total
    }

    /// Clear identifiers of `ids` and queue them again on this socket.
    fn renumber(&self, st: &mut ConnState, ids: Vec<i64>) -> usize {
        let mut n = 0;
        for id in ids {
            if let Some(msg) = st.sent.remove(&id) {
                msg.clear_ids();
                st.pending.push_back(msg);
                n += 1;
            }
        }
        n
    }

    /// Unanswered messages worth replaying elsewhere.
    ///
    /// Queued and in-flight messages are both drained. Plaintext, service and
    /// key-binding messages are dropped; their callers see
    /// [`InvocationError::Dropped`]. A binding is tied to this socket's
    /// session and msg_id, so it never moves.
    pub(crate) fn backup_session(&self) -> Vec<Msg> {
        let mut st = self.state.lock();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let pending: Vec<Msg> = st.pending.drain(..).collect();
        let sent: Vec<Msg> = st.sent.drain().map(|(_, m)| m).collect();
        st.containers.clear();
        for msg in pending.into_iter().chain(sent) {
            if !seen.insert(Arc::as_ptr(&msg)) || msg.is_replied() {
                continue;
            }
            if msg.is_service() || msg.is_unencrypted() || msg.is_auth_handshake() {
                if msg.expects_reply() {
                    msg.abandon();
                }
                continue;
            }
            out.push(msg);
        }
        out
    }

    // ── Events ─────────────────────────────────────────────────────────────

    async fn run(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<SocketEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(conn) = weak.upgrade() else { return };
            conn.handle(event).await;
        }
        if let Some(conn) = weak.upgrade() {
            conn.lost(None).await;
        }
    }

    async fn handle(self: &Arc<Self>, event: SocketEvent) {
        let Some(dc) = self.dc.upgrade() else { return };
        dc.reading(self.id, true);
        let resend = match event {
            SocketEvent::Result { req_msg_id, result } => {
                let msg = self.state.lock().sent.remove(&req_msg_id);
                match msg {
                    Some(msg) => msg.reply(result),
                    None => tracing::debug!("[conn] DC{}: reply to unknown message {req_msg_id}", dc.id()),
                }
                false
            }
            SocketEvent::BadSalt { bad_msg_id, new_salt } => {
                tracing::debug!("[conn] DC{}: bad server salt, resending {bad_msg_id}", dc.id());
                dc.set_salt(new_salt);
                dc.reading(self.id, false);
                self.recall(bad_msg_id, RecallOptions::default()).await;
                return;
            }
            SocketEvent::BadMsg { bad_msg_id, code } => self.bad_msg(&dc, bad_msg_id, code),
            SocketEvent::Ack { msg_ids } => {
                let st = self.state.lock();
                for id in msg_ids.iter().flat_map(|id| Self::expand(&st, *id)) {
                    if let Some(msg) = st.sent.get(&id) {
                        msg.acked();
                    }
                }
                false
            }
            SocketEvent::NewSession { first_msg_id, server_salt } => {
                tracing::debug!("[conn] DC{}: new session from {first_msg_id}", dc.id());
                dc.set_salt(server_salt);
                false
            }
            SocketEvent::Received { msg_ids } => {
                self.enqueue(Arc::new(OutgoingMessage::ack(msg_ids)));
                true
            }
            SocketEvent::Closed { reason } => {
                dc.reading(self.id, false);
                self.lost(reason).await;
                return;
            }
        };
        dc.reading(self.id, false);
        if resend {
            if let Err(e) = self.flush().await {
                tracing::debug!("[conn] DC{}: flush after event failed: {e}", dc.id());
            }
        }
    }

    fn bad_msg(&self, dc: &DataCenter, bad_msg_id: i64, code: i32) -> bool {
        let mut st = self.state.lock();
        let ids = Self::expand(&st, bad_msg_id);
        match code {
            16 | 17 | 32 | 33 => {
                if matches!(code, 32 | 33) {
                    tracing::warn!("[conn] DC{}: seqno mismatch ({code}), resetting session", dc.id());
                    st.session.reset();
                    st.queues.clear();
                }
                let n = self.renumber(&mut st, ids);
                n > 0
            }
            _ => {
                tracing::warn!("[conn] DC{}: bad_msg_notification {code} for {bad_msg_id}", dc.id());
                for id in ids {
                    if let Some(msg) = st.sent.remove(&id) {
                        msg.reply(Err(RpcError { code, name: "BAD_MSG_NOTIFICATION".into(), value: None }.into()));
                    }
                }
                false
            }
        }
    }

    /// The socket went away underneath us.
    async fn lost(self: &Arc<Self>, reason: Option<String>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(dc) = self.dc.upgrade() else { return };
        if !dc.holds(self) {
            return;
        }
        tracing::warn!(
            "[conn] DC{}: socket {} lost{}",
            dc.id(), self.id,
            reason.map(|r| format!(": {r}")).unwrap_or_default(),
        );
        dc.signal_disconnect(self.id);
        if dc.reconnect_on_loss() {
            let id = self.id;
            tokio::spawn(async move {
                if let Err(e) = dc.reopen(id).await {
                    tracing::warn!("[conn] DC{}: reconnect of socket {id} failed: {e}", dc.id());
                }
            });
        }
    }

    /// Close the socket on purpose.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.socket.disconnect();
        if let Some(h) = self.reader.lock().take() {
            h.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(h) = self.reader.get_mut().take() {
            h.abort();
        }
    }
}
