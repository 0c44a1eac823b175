//! Plain TCP sockets speaking abridged or intermediate MTProto framing.
//!
//! Calls are serialized with a [`TlCodec`]; replies are matched back to the
//! message ids that asked for them and decoded with the result type the
//! engine recorded on the [`Packet`].

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use layer_crypto::AuthKey;
use layer_mtproto::authentication as auth;
use layer_mtproto::envelope::{self, Incoming};
use layer_mtproto::tl::{InvokeAfterMsg, ResPq, ServerDhParams, SetClientDhParamsAnswer};
use layer_mtproto::transport::{Decoder, TransportKind};
use layer_mtproto::{EncryptedSession, Message, MessageId, Session};
use layer_tl_types::{Deserializable, Object, Serializable, Value};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{InvocationError, RpcError};
use crate::schema::TlCodec;
use crate::socket::{
    BoxFuture, ConnectionContext, Connector, Frame, GeneratedKey, Packet, PacketBody, Socket, SocketEvent,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Production bootstrap addresses.
const DC_ADDRESSES: &[(i32, &str)] = &[
    (1, "149.154.175.53:443"),
    (2, "149.154.167.51:443"),
    (3, "149.154.175.100:443"),
    (4, "149.154.167.91:443"),
    (5, "91.108.56.130:443"),
];

// ─── TcpConnector ─────────────────────────────────────────────────────────────

/// Opens a [`TcpSocket`] per connection context.
///
/// Media datacenters (negative ids) fall back to the address of their main
/// datacenter. CDN addresses must be registered with [`Self::with_address`].
pub struct TcpConnector {
    addrs:     HashMap<i32, String>,
    transport: TransportKind,
    codec:     Arc<dyn TlCodec>,
}

impl TcpConnector {
    pub fn new(codec: Arc<dyn TlCodec>) -> Self {
        let addrs = DC_ADDRESSES.iter().map(|(id, a)| (*id, a.to_string())).collect();
        Self { addrs, transport: TransportKind::Abridged, codec }
    }

    pub fn with_address(mut self, dc_id: i32, addr: impl Into<String>) -> Self {
        self.addrs.insert(dc_id, addr.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    fn address(&self, dc_id: i32) -> Option<&str> {
        self.addrs.get(&dc_id).or_else(|| self.addrs.get(&dc_id.abs())).map(String::as_str)
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        ctx:    ConnectionContext,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> BoxFuture<'_, Result<Arc<dyn Socket>, InvocationError>> {
        Box::pin(async move {
            let addr = self.address(ctx.dc_id)
                .ok_or_else(|| InvocationError::Usage(format!("no address known for DC{}", ctx.dc_id)))?;
            tracing::info!("[tcp] DC{}: connecting socket {} to {addr}", ctx.dc_id, ctx.socket_id);
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let (rd, mut wr) = stream.into_split();
            wr.write_all(self.transport.init_bytes()).await?;

            let socket = TcpSocket::start(ctx, rd, wr, self.transport, Arc::clone(&self.codec), events);
            Ok(socket as Arc<dyn Socket>)
        })
    }
}

// ─── TcpSocket ────────────────────────────────────────────────────────────────

/// State shared between the socket and its reader task.
struct Shared {
    ctx:         ConnectionContext,
    codec:       Arc<dyn TlCodec>,
    events:      mpsc::UnboundedSender<SocketEvent>,
    /// Result type per outstanding message id.
    expecting:   Mutex<HashMap<i64, String>>,
    /// Unencrypted calls, answered in order.
    plain_calls: Mutex<VecDeque<i64>>,
    /// Key and session of the last encrypted write.
    keys:        Mutex<Option<(AuthKey, i64)>>,
    handshaking: AtomicBool,
    handshake:   mpsc::UnboundedSender<Vec<u8>>,
}

pub struct TcpSocket {
    shared:       Arc<Shared>,
    transport:    TransportKind,
    writer:       tokio::sync::Mutex<OwnedWriteHalf>,
    handshake_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    reader:       Mutex<Option<JoinHandle<()>>>,
    closed:       AtomicBool,
}

impl TcpSocket {
    fn start(
        ctx:       ConnectionContext,
        rd:        OwnedReadHalf,
        wr:        OwnedWriteHalf,
        transport: TransportKind,
        codec:     Arc<dyn TlCodec>,
        events:    mpsc::UnboundedSender<SocketEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ctx,
            codec,
            events,
            expecting:   Mutex::new(HashMap::new()),
            plain_calls: Mutex::new(VecDeque::new()),
            keys:        Mutex::new(None),
            handshaking: AtomicBool::new(false),
            handshake:   tx,
        });
        let reader = tokio::spawn(read_loop(rd, transport, Arc::clone(&shared)));
        Arc::new(Self {
            shared,
            transport,
            writer:       tokio::sync::Mutex::new(wr),
            handshake_rx: tokio::sync::Mutex::new(rx),
            reader:       Mutex::new(Some(reader)),
            closed:       AtomicBool::new(false),
        })
    }

    async fn send_packet(&self, data: &[u8]) -> Result<(), InvocationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        let framed = self.transport.frame(data);
        self.writer.lock().await.write_all(&framed).await?;
        Ok(())
    }

    fn encode(&self, p: &Packet) -> Result<Vec<u8>, InvocationError> {
        let body = match &p.body {
            PacketBody::Call(args) => self.shared.codec.serialize_method(&p.method, args)?,
            PacketBody::Raw(bytes) => bytes.clone(),
        };
        Ok(match p.invoke_after {
            Some(msg_id) => InvokeAfterMsg { msg_id, query: body }.to_bytes(),
            None => body,
        })
    }

    fn expect(&self, p: &Packet) {
        if !p.result_type.is_empty() {
            self.shared.expecting.lock().insert(p.msg_id, p.result_type.clone());
        }
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), InvocationError> {
        let Some(key) = frame.auth_key else {
            for p in &frame.packets {
                let body = self.encode(p)?;
                self.expect(p);
                self.shared.plain_calls.lock().push_back(p.msg_id);
                let msg = Message::plaintext(MessageId(p.msg_id), 0, body);
                self.send_packet(&msg.to_plaintext_bytes()).await?;
            }
            return Ok(());
        };

        let mut inner = Vec::with_capacity(frame.packets.len());
        for p in &frame.packets {
            inner.push(Message { id: MessageId(p.msg_id), seq_no: p.seq_no, body: self.encode(p)? });
        }
        let (msg_id, seq_no, body) = match (frame.container, inner.len()) {
            (Some((id, seq)), _) => (id, seq, Message::container_body(&inner)),
            (None, 1) => {
                let only = inner.remove(0);
                (only.id.0, only.seq_no, only.body)
            }
            (None, n) => {
                return Err(InvocationError::Usage(format!("{n} packets written without a container")));
            }
        };
        for p in &frame.packets {
            self.expect(p);
        }
        let enc = EncryptedSession::new(key.clone(), frame.salt);
        let wire = enc.encrypt(frame.session_id, msg_id, seq_no, &body);
        *self.shared.keys.lock() = Some((key, frame.session_id));
        self.send_packet(&wire).await
    }

    /// One unencrypted round trip of the key exchange.
    async fn plain_call<T: Deserializable>(
        &self,
        session: &mut Session,
        body:    Vec<u8>,
    ) -> Result<T, InvocationError> {
        let msg = session.pack_plain(body);
        self.send_packet(&msg.to_plaintext_bytes()).await?;
        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            self.handshake_rx.lock().await.recv().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "key exchange timed out"))?
        .ok_or(InvocationError::Dropped)?;
        Ok(T::from_bytes(&reply)?)
    }

    async fn generate_key(&self, expires_in: Option<i32>) -> Result<GeneratedKey, InvocationError> {
        let dc_id = self.shared.ctx.dc_id;
        let mut session = Session::new();

        let (req, s1) = auth::step1();
        let res_pq: ResPq = self.plain_call(&mut session, req.to_bytes()).await?;

        let (req, s2) = auth::step2(s1, res_pq, dc_id, expires_in)?;
        let dh: ServerDhParams = self.plain_call(&mut session, req.to_bytes()).await?;

        let (req, s3) = auth::step3(s2, dh)?;
        let answer: SetClientDhParamsAnswer = self.plain_call(&mut session, req.to_bytes()).await?;

        let done = auth::finish(s3, answer)?;
        tracing::info!(
            "[tcp] DC{dc_id}: {} key exchange complete",
            if expires_in.is_some() { "temporary" } else { "permanent" },
        );
        Ok(GeneratedKey {
            auth_key:    AuthKey::from_bytes(done.auth_key),
            salt:        done.first_salt,
            time_offset: done.time_offset,
        })
    }
}

impl Socket for TcpSocket {
    fn write(&self, frame: Frame) -> BoxFuture<'_, Result<(), InvocationError>> {
        Box::pin(self.write_frame(frame))
    }

    fn create_auth_key(&self, expires_in: Option<i32>) -> BoxFuture<'_, Result<GeneratedKey, InvocationError>> {
        Box::pin(async move {
            let mut rx = self.handshake_rx.lock().await;
            while rx.try_recv().is_ok() {}
            drop(rx);
            self.shared.handshaking.store(true, Ordering::Release);
            let res = self.generate_key(expires_in).await;
            self.shared.handshaking.store(false, Ordering::Release);
            res
        })
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(h) = self.reader.lock().take() {
            h.abort();
        }
        tracing::debug!("[tcp] DC{}: socket {} closed", self.shared.ctx.dc_id, self.shared.ctx.socket_id);
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if let Some(h) = self.reader.get_mut().take() {
            h.abort();
        }
    }
}

// ─── Reading ──────────────────────────────────────────────────────────────────

async fn read_loop(mut rd: OwnedReadHalf, transport: TransportKind, shared: Arc<Shared>) {
    let mut decoder = Decoder::new(transport);
    let mut buf = vec![0u8; 64 * 1024];
    let reason = 'read: loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break Some("connection closed by the server".to_string()),
            Ok(n) => n,
            Err(e) => break Some(e.to_string()),
        };
        decoder.push(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(packet)) => {
                    if let Err(e) = shared.on_packet(packet) {
                        tracing::warn!("[tcp] DC{}: dropping packet: {e}", shared.ctx.dc_id);
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read Some(e.to_string()),
            }
        }
    };
    let _ = shared.events.send(SocketEvent::Closed { reason });
}

impl Shared {
    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(event);
    }

    fn on_packet(&self, mut packet: Vec<u8>) -> Result<(), InvocationError> {
        if packet.len() >= 8 && packet[..8] == [0u8; 8] {
            let msg = Message::from_plaintext_bytes(&packet)
                .ok_or_else(|| InvocationError::Deserialize("malformed plaintext frame".into()))?;
            return self.on_plain(msg.body);
        }

        let (key, session_id) = self.keys.lock().clone()
            .ok_or_else(|| InvocationError::Deserialize("encrypted frame before any key".into()))?;
        let msg = EncryptedSession::new(key, 0)
            .decrypt(&mut packet, session_id)
            .map_err(|e| InvocationError::Security(e.to_string()))?;

        let mut to_ack = Vec::new();
        for env in envelope::parse(msg.msg_id, msg.seq_no, &msg.body)? {
            if env.needs_ack() {
                to_ack.push(env.msg_id);
            }
            self.on_incoming(env.item);
        }
        if !to_ack.is_empty() {
            self.emit(SocketEvent::Received { msg_ids: to_ack });
        }
        Ok(())
    }

    fn on_plain(&self, body: Vec<u8>) -> Result<(), InvocationError> {
        if self.handshaking.load(Ordering::Acquire) {
            let _ = self.handshake.send(body);
            return Ok(());
        }
        let Some(req_msg_id) = self.plain_calls.lock().pop_front() else {
            tracing::debug!("[tcp] DC{}: unsolicited plaintext frame", self.ctx.dc_id);
            return Ok(());
        };
        let result = self.decode(req_msg_id, &body);
        self.emit(SocketEvent::Result { req_msg_id, result });
        Ok(())
    }

    fn decode(&self, req_msg_id: i64, body: &[u8]) -> Result<Value, InvocationError> {
        let ty = self.expecting.lock().remove(&req_msg_id)
            .ok_or_else(|| InvocationError::Deserialize(format!("no result type for {req_msg_id}")))?;
        self.codec.deserialize(&ty, body)
    }

    fn on_incoming(&self, item: Incoming) {
        match item {
            Incoming::RpcResult { req_msg_id, body } => {
                let result = self.decode(req_msg_id, &body);
                self.emit(SocketEvent::Result { req_msg_id, result });
            }
            Incoming::RpcError { req_msg_id, code, message } => {
                self.expecting.lock().remove(&req_msg_id);
                let err = RpcError::from_telegram(code, &message);
                self.emit(SocketEvent::Result { req_msg_id, result: Err(err.into()) });
            }
            Incoming::BadServerSalt { bad_msg_id, new_salt } => {
                self.emit(SocketEvent::BadSalt { bad_msg_id, new_salt });
            }
            Incoming::BadMsg { bad_msg_id, code } => self.emit(SocketEvent::BadMsg { bad_msg_id, code }),
            Incoming::NewSession { first_msg_id, server_salt } => {
                self.emit(SocketEvent::NewSession { first_msg_id, server_salt });
            }
            Incoming::Ack { msg_ids } => self.emit(SocketEvent::Ack { msg_ids }),
            Incoming::Pong { msg_id, ping_id } => {
                self.expecting.lock().remove(&msg_id);
                let pong = Object::new("pong").with("msg_id", msg_id).with("ping_id", ping_id);
                self.emit(SocketEvent::Result { req_msg_id: msg_id, result: Ok(pong.into()) });
            }
            Incoming::Other { body } => {
                tracing::trace!("[tcp] DC{}: {} byte(s) of updates", self.ctx.dc_id, body.len());
            }
        }
    }
}
