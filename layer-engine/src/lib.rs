//! # layer-engine
//!
//! Pooled multi-datacenter MTProto engine.
//!
//! ## Features
//! - Permanent and temporary auth keys per datacenter, bound for forward
//!   secrecy, with login copied between datacenters
//! - Weighted round-robin socket pools that grow under media load and replay
//!   unanswered messages after a socket is lost
//! - Call dispatch with ordered queues, long-text splitting, inline/media
//!   routing, benign-error swallowing and `FLOOD_WAIT` retry
//! - Parallel chunked uploads and downloads, secret-chat file encryption,
//!   CDN redirects with SHA-256 verification, server-to-server reupload
//! - Session persistence (binary file, in-memory, SQLite)
//!
//! The physical sockets are pluggable through [`Connector`]; [`TcpConnector`]
//! speaks MTProto over plain TCP.

#![deny(unsafe_code)]

mod auth_key;
mod authorization;
mod cancel;
mod config;
mod connection;
mod datacenter;
mod dispatcher;
mod errors;
pub mod files;
mod message;
pub mod pool;
mod retry;
mod schema;
mod session;
pub mod session_backend;
mod socket;
mod tcp;

pub use auth_key::{AuthState, PermAuthKey, PermSlot, TempAuthKey};
pub use cancel::{LoginOutcome, LoginWait};
pub use config::{Config, Settings};
pub use connection::{Connection, RecallOptions};
pub use datacenter::DataCenter;
pub use dispatcher::{CallOptions, Pending, split_message};
pub use errors::{BENIGN_ERRORS, InvocationError, RpcError};
pub use files::{
    ChunkSink, ChunkSource, DownloadInfo, DownloadOptions, FileKey, MemorySink, MemorySource,
    ProgressReceiver, ProgressSample, ProgressSender, UploadOptions, UploadedFile,
};
pub use message::{OutgoingMessage, PendingReply};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use schema::{MethodInfo, MethodSchema, NoReferences, ReferenceDatabase, StaticSchema, TlCodec};
pub use session::{DcRecord, PersistedDc, PersistedSession};
pub use session_backend::{BinaryFileBackend, InMemoryBackend, SessionBackend};
#[cfg(feature = "sqlite-session")]
pub use session_backend::SqliteBackend;
pub use socket::{
    BoxFuture, ConnectionContext, Connector, Frame, GeneratedKey, Packet, PacketBody, Socket, SocketEvent,
};
pub use tcp::{TcpConnector, TcpSocket};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use files::CdnHashes;

/// Sentinel for "no authorized datacenter".
const NO_DC: i32 = i32::MIN;

// ─── EngineShared ─────────────────────────────────────────────────────────────

/// State every datacenter can reach through its back-reference.
pub struct EngineShared {
    pub(crate) settings:        Settings,
    pub(crate) schema:          Arc<dyn MethodSchema>,
    pub(crate) references:      Arc<dyn ReferenceDatabase>,
    pub(crate) connector:       Arc<dyn Connector>,
    pub(crate) session_backend: Arc<dyn SessionBackend>,
    pub(crate) retry_policy:    Arc<dyn RetryPolicy>,
    pub(crate) cdn_hashes:      Arc<CdnHashes>,
    dcs:                        RwLock<BTreeMap<i32, Arc<DataCenter>>>,
    authorized_dc:              AtomicI32,
    logged_in:                  AtomicBool,
    /// Cancelled on login; replaced on logout.
    login:                      Mutex<CancellationToken>,
}

impl EngineShared {
    pub fn datacenter(&self, id: i32) -> Option<Arc<DataCenter>> {
        self.dcs.read().get(&id).cloned()
    }

    /// All datacenters, ordered by id.
    pub fn datacenters(&self) -> Vec<Arc<DataCenter>> {
        self.dcs.read().values().cloned().collect()
    }

    pub fn is_logged_in(&self) -> bool { self.logged_in.load(Ordering::Acquire) }

    pub fn authorized_dc(&self) -> Option<i32> {
        match self.authorized_dc.load(Ordering::Acquire) {
            NO_DC => None,
            id    => Some(id),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Owns every datacenter. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineShared>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let Config { settings, schema, references, connector, session_backend, retry_policy } = config;
        tracing::debug!("[engine] session backend: {}", session_backend.name());
        Self {
            inner: Arc::new(EngineShared {
                settings,
                schema,
                references,
                connector,
                session_backend,
                retry_policy,
                cdn_hashes:    Arc::new(CdnHashes::new()),
                dcs:           RwLock::new(BTreeMap::new()),
                authorized_dc: AtomicI32::new(NO_DC),
                logged_in:     AtomicBool::new(false),
                login:         Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub(crate) fn from_shared(inner: Arc<EngineShared>) -> Self {
        Self { inner }
    }

    pub fn settings(&self) -> &Settings { &self.inner.settings }

    /// Cached CDN hashes, keyed by file token.
    pub fn cdn_hashes(&self) -> &Arc<CdnHashes> { &self.inner.cdn_hashes }

    // ─── Datacenters ──────────────────────────────────────────────────────

    /// Register a datacenter. An id that is already known returns the
    /// existing one unchanged.
    pub fn add_datacenter(&self, id: i32, is_cdn: bool) -> Arc<DataCenter> {
        let mut dcs = self.inner.dcs.write();
        if let Some(dc) = dcs.get(&id) {
            return Arc::clone(dc);
        }
        let dc = DataCenter::new(
            id,
            is_cdn,
            Arc::downgrade(&self.inner),
            self.inner.settings.clone(),
            Arc::clone(&self.inner.connector),
        );
        dcs.insert(id, Arc::clone(&dc));
        tracing::debug!("[engine] added DC{id}{}", if is_cdn { " (CDN)" } else { "" });
        dc
    }

    pub fn datacenter(&self, id: i32) -> Option<Arc<DataCenter>> { self.inner.datacenter(id) }
    pub fn datacenters(&self) -> Vec<Arc<DataCenter>> { self.inner.datacenters() }
    pub fn has_datacenter(&self, id: i32) -> bool { self.inner.dcs.read().contains_key(&id) }

    /// Open the first socket of `id` and bring its keys up.
    pub async fn connect(&self, id: i32) -> Result<(), InvocationError> {
        let dc = self.datacenter(id)
            .ok_or_else(|| InvocationError::Usage(format!("unknown DC{id}")))?;
        dc.connect(None).await?;
        dc.init_authorization().await
    }

    /// Close every socket of every datacenter.
    pub fn disconnect(&self) {
        for dc in self.datacenters() {
            dc.disconnect();
        }
    }

    // ─── Login ────────────────────────────────────────────────────────────

    pub fn authorized_dc(&self) -> Option<i32> { self.inner.authorized_dc() }

    pub fn set_authorized_dc(&self, id: Option<i32>) {
        self.inner.authorized_dc.store(id.unwrap_or(NO_DC), Ordering::Release);
    }

    pub fn is_logged_in(&self) -> bool { self.inner.is_logged_in() }

    /// Record a login (or logout) on the authorized datacenter.
    ///
    /// Logging in releases every pending [`LoginWait`].
    pub fn set_logged_in(&self, logged_in: bool) {
        self.inner.logged_in.store(logged_in, Ordering::Release);
        if let Some(dc) = self.authorized_dc().and_then(|id| self.datacenter(id)) {
            dc.authorized(logged_in);
        }
        let mut login = self.inner.login.lock();
        if logged_in {
            login.cancel();
            tracing::info!("[auth] logged in");
        } else if login.is_cancelled() {
            *login = CancellationToken::new();
            tracing::info!("[auth] logged out");
        }
    }

    /// A handle that resolves once [`Self::set_logged_in`] is called with `true`.
    pub fn login_wait(&self) -> LoginWait {
        LoginWait::new(self.inner.login.lock().clone())
    }

    // ─── Persistence ──────────────────────────────────────────────────────

    /// Snapshot the keys of every datacenter.
    pub fn session(&self) -> PersistedSession {
        PersistedSession {
            authorized_dc: self.authorized_dc(),
            logged_in:     self.is_logged_in(),
            dcs: self.datacenters().iter().map(|dc| DcRecord {
                dc_id:  dc.id(),
                is_cdn: dc.is_cdn(),
                keys:   PersistedDc::from_keys(&dc.key_state()),
            }).collect(),
        }
    }

    pub fn save_session(&self) -> Result<(), InvocationError> {
        let session = self.session();
        self.inner.session_backend.save(&session)?;
        tracing::debug!(
            "[engine] saved {} datacenter(s) to {}",
            session.dcs.len(), self.inner.session_backend.name(),
        );
        Ok(())
    }

    /// Load keys saved earlier. `false` when the backend holds nothing.
    ///
    /// Call before connecting; a restored datacenter with a bound key skips
    /// the handshake on [`Self::connect`].
    pub fn restore_session(&self) -> Result<bool, InvocationError> {
        let Some(session) = self.inner.session_backend.load()? else {
            return Ok(false);
        };
        for rec in session.dcs {
            self.add_datacenter(rec.dc_id, rec.is_cdn).restore_keys(rec.keys.into_keys());
        }
        self.set_authorized_dc(session.authorized_dc);
        self.inner.logged_in.store(session.logged_in, Ordering::Release);
        if session.logged_in {
            self.inner.login.lock().cancel();
        }
        tracing::info!("[engine] restored session from {}", self.inner.session_backend.name());
        Ok(true)
    }

    /// Forget the stored session.
    pub fn delete_session(&self) -> Result<(), InvocationError> {
        Ok(self.inner.session_backend.delete()?)
    }
}
