//! One datacenter: its socket pool, its keys, its backup queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::EngineShared;
use crate::auth_key::{AuthState, KeyState, PermAuthKey, PermSlot, TempAuthKey};
use crate::config::Settings;
use crate::connection::Connection;
use crate::errors::InvocationError;
use crate::message::OutgoingMessage;
use crate::pool::{Level, Pool};
use crate::socket::{BoxFuture, ConnectionContext, Connector};

type Msg = Arc<OutgoingMessage>;

pub struct DataCenter {
    id:            i32,
    is_cdn:        bool,
    engine:        Weak<EngineShared>,
    settings:      Settings,
    connector:     Arc<dyn Connector>,
    pool:          Mutex<Pool<Arc<Connection>>>,
    keys:          Mutex<KeyState>,
    /// Serializes [`crate::authorization`] runs for this datacenter.
    pub(crate) init_lock: tokio::sync::Mutex<()>,
    ready:         AtomicBool,
    /// Bumped on every pool change so waiters can re-check.
    sockets:       watch::Sender<usize>,
    backup:        Mutex<Vec<Msg>>,
    robin:         Mutex<Option<JoinHandle<()>>>,
    last_ctx:      Mutex<Option<ConnectionContext>>,
    /// Socket each queue tag is pinned to.
    queue_sockets: Mutex<HashMap<String, usize>>,
}

impl DataCenter {
    pub(crate) fn new(
        id:        i32,
        is_cdn:    bool,
        engine:    Weak<EngineShared>,
        settings:  Settings,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let read_dec = if id < 0 { settings.media_read_decrement } else { settings.read_decrement };
        let pool = Pool::new(read_dec, settings.write_decrement);
        Arc::new(Self {
            id,
            is_cdn,
            engine,
            settings,
            connector,
            pool:          Mutex::new(pool),
            keys:          Mutex::new(KeyState::default()),
            init_lock:     tokio::sync::Mutex::new(()),
            ready:         AtomicBool::new(false),
            sockets:       watch::Sender::new(0),
            backup:        Mutex::new(Vec::new()),
            robin:         Mutex::new(None),
            last_ctx:      Mutex::new(None),
            queue_sockets: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> i32 { self.id }
    pub fn is_cdn(&self) -> bool { self.is_cdn }
    pub fn is_media(&self) -> bool { self.id < 0 }
    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::Acquire) }
    pub fn settings(&self) -> &Settings { &self.settings }
    pub(crate) fn reconnect_on_loss(&self) -> bool { self.settings.reconnect_on_loss }
    pub(crate) fn engine(&self) -> Option<Arc<EngineShared>> { self.engine.upgrade() }

    pub fn context(&self) -> ConnectionContext { ConnectionContext::new(self.id, self.is_cdn) }

    fn max_sockets(&self) -> usize {
        if self.is_media() || self.is_cdn { self.settings.max_media_socket_count } else { 1 }
    }

    // ─── Pool ─────────────────────────────────────────────────────────────

    /// Open sockets.
    ///
    /// `None` brings up the first socket, replays the backup queue and marks
    /// the pool ready; a pool that is already up is left alone. `Some(id)`
    /// opens or reopens that one index.
    pub async fn connect(self: &Arc<Self>, socket_id: Option<usize>) -> Result<(), InvocationError> {
        *self.last_ctx.lock() = Some(self.context());
        if self.is_media() || self.is_cdn {
            self.start_robin();
        }
        match socket_id {
            None => {
                if self.is_ready() && !self.pool.lock().is_empty() {
                    tracing::warn!("[pool] DC{}: already connected", self.id);
                    return Ok(());
                }
                self.connect_more(1).await?;
                self.ready.store(true, Ordering::Release);
                self.restore_backup().await;
                tracing::info!("[pool] DC{}: connected", self.id);
            }
            Some(id) => self.open_at(id).await?,
        }
        Ok(())
    }

    /// Open `count` sockets at the lowest free indices.
    pub async fn connect_more(self: &Arc<Self>, count: usize) -> Result<(), InvocationError> {
        let ids = self.pool.lock().free_ids(count);
        for id in ids {
            self.open_at(id).await?;
        }
        Ok(())
    }

    async fn open_at(self: &Arc<Self>, id: usize) -> Result<(), InvocationError> {
        let ctx = self.context().with_socket(id);
        let conn = Connection::open(self, ctx, &*self.connector).await?;
        let old = {
            let mut pool = self.pool.lock();
            let old = pool.insert(id, conn);
            self.sockets.send_replace(pool.len());
            old
        };
        if let Some(old) = old {
            self.backup.lock().extend(old.backup_session());
            old.close();
        }
        tracing::debug!("[pool] DC{}: opened socket {id}", self.id);
        Ok(())
    }

    /// Reopen a lost socket and replay what it left behind.
    pub(crate) fn reopen(self: &Arc<Self>, id: usize) -> BoxFuture<'_, Result<(), InvocationError>> {
        Box::pin(async move {
            if !self.is_ready() {
                return Ok(());
            }
            self.open_at(id).await?;
            self.restore_backup().await;
            Ok(())
        })
    }

    /// Socket for the next message: heaviest weight wins.
    pub fn get_connection(&self) -> Option<Arc<Connection>> {
        self.pool.lock().select().map(|(_, c)| c)
    }

    /// Like [`Self::get_connection`], but waits for a socket to appear.
    pub async fn wait_get_connection(&self) -> Result<Arc<Connection>, InvocationError> {
        let mut rx = self.sockets.subscribe();
        loop {
            if let Some(conn) = self.get_connection() {
                return Ok(conn);
            }
            rx.changed().await.map_err(|_| InvocationError::Dropped)?;
        }
    }

    /// Socket 0, reserved for the key handshake.
    pub fn auth_connection(&self) -> Option<Arc<Connection>> {
        let pool = self.pool.lock();
        pool.get(0).or_else(|| pool.connections().next()).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.pool.lock().connections().cloned().collect()
    }

    pub fn socket_count(&self) -> usize { self.pool.lock().len() }
    pub fn socket_ids(&self) -> Vec<usize> { self.pool.lock().ids() }
    pub fn weight(&self, id: usize) -> Option<i64> { self.pool.lock().weight(id) }

    pub(crate) fn reading(&self, id: usize, started: bool) { self.pool.lock().reading(id, started); }
    pub(crate) fn writing(&self, id: usize, started: bool) { self.pool.lock().writing(id, started); }

    /// Whether `conn` is still the socket registered at its index.
    pub(crate) fn holds(&self, conn: &Arc<Connection>) -> bool {
        self.pool.lock().get(conn.id()).is_some_and(|c| Arc::ptr_eq(c, conn))
    }

    /// Socket `id` is gone: keep its unanswered messages, forget the socket.
    pub fn signal_disconnect(&self, id: usize) {
        let removed = {
            let mut pool = self.pool.lock();
            let c = pool.remove(id);
            self.sockets.send_replace(pool.len());
            c
        };
        if let Some(conn) = removed {
            let saved = conn.backup_session();
            tracing::debug!("[pool] DC{}: socket {id} gone, backed up {} message(s)", self.id, saved.len());
            self.backup.lock().extend(saved);
        }
        self.queue_sockets.lock().retain(|_, s| *s != id);
    }

    /// Close every socket. Unanswered messages go to the backup queue.
    pub fn disconnect(&self) {
        self.ready.store(false, Ordering::Release);
        self.stop_robin();
        let conns = {
            let mut pool = self.pool.lock();
            let c = pool.clear();
            self.sockets.send_replace(0);
            c
        };
        for conn in conns {
            self.backup.lock().extend(conn.backup_session());
            conn.close();
        }
        self.queue_sockets.lock().clear();
        tracing::info!("[pool] DC{}: disconnected", self.id);
    }

    pub async fn reconnect(self: &Arc<Self>) -> Result<(), InvocationError> {
        let ctx = *self.last_ctx.lock();
        self.disconnect();
        if ctx.is_some() {
            self.connect(None).await?;
        }
        Ok(())
    }

    /// Messages waiting for a socket.
    pub fn backup_len(&self) -> usize { self.backup.lock().len() }

    /// Renumber and resend every backed-up message that is still unanswered.
    pub async fn restore_backup(self: &Arc<Self>) {
        let msgs = std::mem::take(&mut *self.backup.lock());
        if msgs.is_empty() {
            return;
        }
        let mut seen = HashSet::new();
        let msgs: Vec<Msg> = msgs.into_iter()
            .filter(|m| !m.is_replied() && seen.insert(Arc::as_ptr(m) as usize))
            .collect();
        let mut restored = 0;
        for msg in msgs {
            msg.clear_ids();
            if let Err(e) = self.send(msg, false).await {
                tracing::warn!("[pool] DC{}: could not requeue: {e}", self.id);
            }
            restored += 1;
        }
        tracing::info!("[pool] DC{}: restored {restored} message(s)", self.id);
        self.flush_all().await;
    }

    pub async fn flush_all(&self) {
        for conn in self.connections() {
            if let Err(e) = conn.flush().await {
                tracing::debug!("[pool] DC{}: flush on socket {} failed: {e}", self.id, conn.id());
            }
        }
    }

    /// Queue `msg` on a socket, flushing it when asked.
    ///
    /// Tagged messages stick to one socket so their order holds. With no
    /// socket up the message waits in the backup queue.
    pub async fn send(&self, msg: Msg, flush: bool) -> Result<(), InvocationError> {
        let conn = match msg.queue_tag() {
            Some(tag) => self.queue_connection(tag),
            None => self.get_connection(),
        };
        let Some(conn) = conn else {
            if !self.is_ready() && self.last_ctx.lock().is_none() {
                return Err(InvocationError::Usage(format!("DC{} is not connected", self.id)));
            }
            self.backup.lock().push(msg);
            return Ok(());
        };
        conn.enqueue(msg);
        if flush {
            // A failed write hands the message to the backup queue.
            if let Err(e) = conn.flush().await {
                tracing::debug!("[pool] DC{}: flush on socket {} failed: {e}", self.id, conn.id());
            }
        }
        Ok(())
    }

    fn queue_connection(&self, tag: &str) -> Option<Arc<Connection>> {
        let pinned = self.queue_sockets.lock().get(tag).copied();
        if let Some(id) = pinned {
            if let Some(conn) = self.pool.lock().get(id).cloned() {
                return Some(conn);
            }
        }
        let conn = self.get_connection()?;
        self.queue_sockets.lock().insert(tag.to_string(), conn.id());
        Some(conn)
    }

    // ─── Leveling ─────────────────────────────────────────────────────────

    /// One rebalancing pass.
    pub async fn even(self: &Arc<Self>) -> Level {
        let level = self.pool.lock().level(self.max_sockets());
        match level {
            Level::Grow(n) => {
                tracing::debug!("[pool] DC{}: growing by {n} socket(s)", self.id);
                if let Err(e) = self.connect_more(n).await {
                    tracing::warn!("[pool] DC{}: could not grow: {e}", self.id);
                }
            }
            Level::Boosted(by) => tracing::trace!("[pool] DC{}: weights +{by}", self.id),
            Level::Idle => {}
        }
        level
    }

    fn start_robin(self: &Arc<Self>) {
        let mut robin = self.robin.lock();
        if robin.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.settings.robin_period;
        *robin = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(dc) = weak.upgrade() else { return };
                dc.even().await;
            }
        }));
    }

    fn stop_robin(&self) {
        if let Some(h) = self.robin.lock().take() {
            h.abort();
        }
    }

    // ─── Keys ─────────────────────────────────────────────────────────────

    pub fn temp_key(&self) -> Option<TempAuthKey> { self.keys.lock().temp.clone() }
    pub fn has_temp_key(&self) -> bool { self.keys.lock().temp.is_some() }

    /// Replace the temporary key. Sessions restart under a new key.
    pub fn set_temp_key(&self, key: Option<TempAuthKey>) {
        let fresh = key.is_some();
        self.keys.lock().temp = key;
        if fresh {
            for conn in self.connections() {
                conn.reset_session();
            }
        }
    }

    /// Mutate the temporary key in place.
    pub(crate) fn with_temp<R>(&self, f: impl FnOnce(&mut Option<TempAuthKey>) -> R) -> R {
        f(&mut self.keys.lock().temp)
    }

    pub(crate) fn perm_slot(&self) -> PermSlot { self.keys.lock().perm.clone() }

    /// The permanent key in effect, read through the link for media
    /// datacenters.
    pub fn perm_key(&self) -> Option<PermAuthKey> {
        match self.perm_slot() {
            PermSlot::Owned(key) => key,
            PermSlot::Linked(main) => self.engine()?.datacenter(main)?.owned_perm_key(),
        }
    }

    fn owned_perm_key(&self) -> Option<PermAuthKey> {
        match &self.keys.lock().perm {
            PermSlot::Owned(key) => key.clone(),
            PermSlot::Linked(_) => None,
        }
    }

    pub fn has_perm_key(&self) -> bool { self.perm_key().is_some() }

    /// Store a permanent key. Linked datacenters cannot own one.
    pub fn set_perm_key(&self, key: Option<PermAuthKey>) -> Result<(), InvocationError> {
        let mut keys = self.keys.lock();
        if let PermSlot::Linked(main) = keys.perm {
            return Err(InvocationError::Usage(format!(
                "DC{} reads its permanent key from DC{main}", self.id
            )));
        }
        keys.perm = PermSlot::Owned(key);
        Ok(())
    }

    /// Point this datacenter's permanent key at `main`'s.
    pub fn link(&self, main: i32) -> Result<(), InvocationError> {
        let engine = self.engine().ok_or(InvocationError::Dropped)?;
        let target = engine.datacenter(main)
            .ok_or_else(|| InvocationError::Usage(format!("unknown DC{main}")))?;
        if let PermSlot::Linked(_) = target.perm_slot() {
            return Err(InvocationError::Usage(format!("DC{main} is itself linked")));
        }
        self.keys.lock().perm = PermSlot::Linked(main);
        tracing::debug!("[auth] DC{}: linked to DC{main}", self.id);
        Ok(())
    }

    pub fn linked_dc(&self) -> Option<i32> {
        match self.perm_slot() {
            PermSlot::Linked(main) => Some(main),
            PermSlot::Owned(_) => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.keys.lock().temp.as_ref().is_some_and(TempAuthKey::is_bound)
    }

    /// Bound to a permanent key that carries a login.
    pub fn is_authorized(&self) -> bool {
        self.is_bound() && self.perm_key().is_some_and(|p| p.is_authorized())
    }

    /// Record the login state on the owned permanent key.
    pub fn authorized(&self, authorized: bool) {
        let mut keys = self.keys.lock();
        match &mut keys.perm {
            PermSlot::Owned(Some(perm)) => perm.authorized(authorized),
            PermSlot::Owned(None) => {}
            PermSlot::Linked(main) => {
                tracing::debug!("[auth] DC{}: login state follows DC{main}", self.id);
            }
        }
    }

    pub fn auth_state(&self) -> AuthState {
        let perm_authorized = self.perm_key().is_some_and(|p| p.is_authorized());
        self.keys.lock().state(self.is_cdn, perm_authorized)
    }

    /// Server salt changed.
    pub(crate) fn set_salt(&self, salt: i64) {
        if let Some(temp) = self.keys.lock().temp.as_mut() {
            temp.salt = salt;
        }
    }

    pub(crate) fn key_state(&self) -> KeyState { self.keys.lock().clone() }
    pub(crate) fn restore_keys(&self, keys: KeyState) { *self.keys.lock() = keys; }
}

impl Drop for DataCenter {
    fn drop(&mut self) {
        if let Some(h) = self.robin.get_mut().take() {
            h.abort();
        }
    }
}
