//! In-process network for integration tests.
//!
//! [`MockNet`] hands out sockets that answer every packet synchronously from
//! a test-provided handler. Key handshakes succeed instantly with
//! deterministic keys, `auth.bindTempAuthKey` and `help.getConfig` are
//! answered out of the box.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use layer_crypto::AuthKey;
use layer_engine::{
    BoxFuture, Config, ConnectionContext, Connector, Engine, Frame, GeneratedKey, InvocationError,
    PacketBody, RpcError, Settings, Socket, SocketEvent, StaticSchema,
};
use layer_tl_types::{Object, Value};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One packet as the server saw it.
#[derive(Clone, Debug)]
pub struct Call {
    pub dc_id:        i32,
    pub socket_id:    usize,
    pub method:       String,
    pub args:         Value,
    pub msg_id:       i64,
    pub invoke_after: Option<i64>,
    pub encrypted:    bool,
}

/// `None` leaves the call unanswered.
pub type Reply = Option<Result<Value, InvocationError>>;

type Handler = Arc<dyn Fn(&Call) -> Reply + Send + Sync>;

struct NetState {
    handler:       Mutex<Handler>,
    calls:         Mutex<Vec<Call>>,
    sockets:       Mutex<Vec<(ConnectionContext, mpsc::UnboundedSender<SocketEvent>)>>,
    keys_made:     AtomicU64,
    bind_failures: AtomicU32,
    bind_stalls:   AtomicU32,
}

#[derive(Clone)]
pub struct MockNet {
    state: Arc<NetState>,
}

impl MockNet {
    pub fn new() -> Self {
        Self {
            state: Arc::new(NetState {
                handler:       Mutex::new(Arc::new(|_: &Call| Some(Ok(Value::Bool(true))))),
                calls:         Mutex::new(Vec::new()),
                sockets:       Mutex::new(Vec::new()),
                keys_made:     AtomicU64::new(0),
                bind_failures: AtomicU32::new(0),
                bind_stalls:   AtomicU32::new(0),
            }),
        }
    }

    /// Answer calls the built-in replies do not cover.
    pub fn on(&self, handler: impl Fn(&Call) -> Reply + Send + Sync + 'static) {
        *self.state.handler.lock() = Arc::new(handler);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.method == method).collect()
    }

    /// Refuse the next `n` key bindings.
    pub fn fail_binds(&self, n: u32) {
        self.state.bind_failures.store(n, Ordering::SeqCst);
    }

    /// Leave the next `n` key bindings unanswered.
    pub fn stall_binds(&self, n: u32) {
        self.state.bind_stalls.store(n, Ordering::SeqCst);
    }

    /// Every socket ever opened, oldest first.
    pub fn sockets(&self) -> Vec<ConnectionContext> {
        self.state.sockets.lock().iter().map(|(ctx, _)| *ctx).collect()
    }

    pub fn keys_made(&self) -> u64 {
        self.state.keys_made.load(Ordering::SeqCst)
    }

    /// Drop the newest socket at `socket_id` of `dc_id` as if the peer hung up.
    pub fn kill(&self, dc_id: i32, socket_id: usize) {
        let sockets = self.state.sockets.lock();
        let target = sockets.iter().rev().find(|(ctx, _)| ctx.dc_id == dc_id && ctx.socket_id == socket_id);
        if let Some((_, events)) = target {
            let _ = events.send(SocketEvent::Closed { reason: Some("killed by test".into()) });
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { net: self.clone() })
    }

    fn answer(&self, call: &Call) -> Reply {
        match call.method.as_str() {
            "auth.bindTempAuthKey" => {
                let stalled = self.state.bind_stalls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if stalled {
                    return None;
                }
                let refused = self.state.bind_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                Some(Ok(Value::Bool(!refused)))
            }
            "help.getConfig" => Some(Ok(Object::new("config").with("this_dc", call.dc_id.abs()).into())),
            _ => {
                let handler = Arc::clone(&*self.state.handler.lock());
                handler(call)
            }
        }
    }
}

// ─── Connector / Socket ───────────────────────────────────────────────────────

struct MockConnector {
    net: MockNet,
}

impl Connector for MockConnector {
    fn connect(
        &self,
        ctx:    ConnectionContext,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> BoxFuture<'_, Result<Arc<dyn Socket>, InvocationError>> {
        Box::pin(async move {
            self.net.state.sockets.lock().push((ctx, events.clone()));
            let socket: Arc<dyn Socket> = Arc::new(MockSocket {
                ctx,
                events,
                net:    self.net.clone(),
                closed: AtomicBool::new(false),
            });
            Ok(socket)
        })
    }
}

struct MockSocket {
    ctx:    ConnectionContext,
    events: mpsc::UnboundedSender<SocketEvent>,
    net:    MockNet,
    closed: AtomicBool,
}

impl Socket for MockSocket {
    fn write(&self, frame: Frame) -> BoxFuture<'_, Result<(), InvocationError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(InvocationError::Io(std::io::Error::other("socket closed")));
            }
            for packet in frame.packets {
                if packet.result_type.is_empty() {
                    continue;
                }
                let call = Call {
                    dc_id:        self.ctx.dc_id,
                    socket_id:    self.ctx.socket_id,
                    method:       packet.method,
                    args:         match packet.body {
                        PacketBody::Call(v) => v,
                        PacketBody::Raw(_)  => Value::Null,
                    },
                    msg_id:       packet.msg_id,
                    invoke_after: packet.invoke_after,
                    encrypted:    frame.auth_key.is_some(),
                };
                self.net.state.calls.lock().push(call.clone());
                if let Some(result) = self.net.answer(&call) {
                    let _ = self.events.send(SocketEvent::Result { req_msg_id: call.msg_id, result });
                }
            }
            Ok(())
        })
    }

    fn create_auth_key(&self, _expires_in: Option<i32>) -> BoxFuture<'_, Result<GeneratedKey, InvocationError>> {
        Box::pin(async move {
            let n = self.net.state.keys_made.fetch_add(1, Ordering::SeqCst);
            Ok(GeneratedKey {
                auth_key:    AuthKey::from_bytes([n as u8 + 1; 256]),
                salt:        n as i64,
                time_offset: 0,
            })
        })
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

pub fn schema() -> StaticSchema {
    StaticSchema::new()
        .with("ping", "Pong")
        .with("help.getConfig", "Config")
        .with("auth.exportAuthorization", "auth.ExportedAuthorization")
        .with("auth.importAuthorization", "auth.Authorization")
        .with("messages.sendMessage", "Updates")
        .with("messages.sendEncrypted", "messages.SentEncryptedMessage")
        .with("messages.editInlineBotMessage", "Bool")
        .with("upload.getFile", "upload.File")
        .with("upload.getCdnFile", "upload.CdnFile")
        .with("upload.getCdnFileHashes", "Vector<FileHash>")
        .with("upload.reuploadCdnFile", "Vector<FileHash>")
        .with("upload.saveFilePart", "Bool")
        .with("upload.saveBigFilePart", "Bool")
}

pub fn config(net: &MockNet, settings: Settings) -> Config {
    Config::new(Arc::new(schema()), net.connector()).with_settings(settings)
}

/// An engine with DC 2 as the authorized datacenter, not yet connected.
pub fn engine_with(net: &MockNet, settings: Settings) -> Engine {
    let engine = Engine::new(config(net, settings));
    engine.add_datacenter(2, false);
    engine.set_authorized_dc(Some(2));
    engine
}

/// Wait until `count` sockets have been opened in total.
pub async fn wait_for_sockets(net: &MockNet, count: usize) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while net.sockets().len() < count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("socket reopened");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

/// DC 2 connected and bound.
pub async fn engine(net: &MockNet) -> Engine {
    let engine = engine_with(net, Settings::default());
    engine.connect(2).await.expect("connect DC2");
    engine
}

pub fn rpc(code: i32, name: &str) -> Reply {
    Some(Err(RpcError::from_telegram(code, name).into()))
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// The `[offset, offset + limit)` slice of `data`, clamped to its end.
pub fn slice(data: &[u8], call: &Call) -> Vec<u8> {
    let offset = call.args.get("offset").and_then(Value::as_i64).unwrap_or(0) as usize;
    let limit = call.args.get("limit").and_then(Value::as_i32).unwrap_or(0) as usize;
    let start = offset.min(data.len());
    let end = (offset + limit).min(data.len());
    data[start..end].to_vec()
}
