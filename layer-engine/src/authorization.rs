//! Key lifecycle of a datacenter: generation, binding, login sync.

use std::sync::Arc;

use layer_mtproto::bind;
use layer_tl_types::{Object, Serializable, Value};

use crate::auth_key::{PermAuthKey, TempAuthKey};
use crate::connection::Connection;
use crate::datacenter::DataCenter;
use crate::dispatcher::CallOptions;
use crate::errors::InvocationError;
use crate::message::OutgoingMessage;
use crate::{Engine, EngineShared};

const BIND_FAILED: &str = "An error occurred while binding temporary and permanent authorization keys.";

impl DataCenter {
    /// Bring this datacenter to a usable key state.
    ///
    /// Safe to call repeatedly and concurrently: one caller does the work
    /// while the rest wait on the per-datacenter lock.
    pub async fn init_authorization(self: &Arc<Self>) -> Result<(), InvocationError> {
        let _guard = self.init_lock.lock().await;
        tracing::info!("[auth] DC{}: initializing authorization", self.id());

        let any = self.wait_get_connection().await?;
        let conn = self.auth_connection().unwrap_or(any);
        let cdn = self.is_cdn();
        let media = self.is_media();
        let pfs = self.settings().pfs;

        if !(self.has_temp_key() && self.has_perm_key() && self.is_bound()) {
            if !self.has_perm_key() && !cdn && !media {
                tracing::info!("[auth] DC{}: generating permanent key", self.id());
                let key = conn.socket().create_auth_key(None).await?;
                self.set_perm_key(Some(PermAuthKey::new(key.auth_key, key.salt)))?;
            }
            if media {
                self.link(-self.id())?;
                if !self.has_perm_key() {
                    return Err(InvocationError::Usage(format!(
                        "DC{} has no permanent key to share with DC{}", -self.id(), self.id()
                    )));
                }
                if self.has_temp_key() {
                    return Ok(());
                }
            }
            if !cdn {
                if pfs {
                    self.set_temp_key(None);
                    let temp = self.create_temp_key(&conn).await?;
                    self.set_temp_key(Some(temp));
                    self.bind_temp_auth_key(&conn).await?;
                } else {
                    self.bind_without_pfs()?;
                }
                self.get_config(&conn).await?;
                self.sync_authorization(&conn).await;
            } else if !self.has_temp_key() {
                let temp = self.create_temp_key(&conn).await?;
                self.set_temp_key(Some(temp));
            }
            self.flush_all().await;
        } else if !cdn {
            self.sync_authorization(&conn).await;
        }
        Ok(())
    }

    async fn create_temp_key(&self, conn: &Arc<Connection>) -> Result<TempAuthKey, InvocationError> {
        tracing::info!("[auth] DC{}: generating temporary key", self.id());
        let expires_in = self.settings().temp_auth_key_expires_in;
        let key = conn.socket().create_auth_key(Some(expires_in)).await?;
        let expires_at = chrono::Utc::now().timestamp() + i64::from(expires_in);
        Ok(TempAuthKey::new(key.auth_key, key.salt, expires_at))
    }

    /// Without forward secrecy the permanent key doubles as the session key.
    fn bind_without_pfs(&self) -> Result<(), InvocationError> {
        let perm = self.perm_key()
            .ok_or_else(|| InvocationError::Usage(format!("DC{} has no permanent key", self.id())))?;
        self.set_temp_key(Some(TempAuthKey::from_perm(&perm)));
        Ok(())
    }

    /// Bind the temporary key to the permanent one with
    /// `auth.bindTempAuthKey`, retrying up to `max_auth_tries` times.
    pub async fn bind_temp_auth_key(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<(), InvocationError> {
        let tries = self.settings().max_auth_tries;
        for attempt in 1..=tries {
            tracing::debug!("[auth] DC{}: binding keys (try {attempt})", self.id());
            match self.try_bind(conn).await {
                Ok(Some(perm_id)) => {
                    self.with_temp(|t| if let Some(t) = t { t.bind(perm_id) });
                    tracing::info!("[auth] DC{}: bound temporary and permanent keys", self.id());
                    return Ok(());
                }
                Ok(None) => tracing::warn!(
                    "[auth] DC{}: server refused the binding (try {attempt}/{tries})", self.id()
                ),
                Err(e) => tracing::warn!(
                    "[auth] DC{}: binding failed: {e} (try {attempt}/{tries})", self.id()
                ),
            }
        }
        self.with_temp(|t| if let Some(t) = t { t.unbind() });
        tracing::error!("[auth] DC{}: giving up on key binding", self.id());
        Err(InvocationError::Security(BIND_FAILED.into()))
    }

    /// One binding attempt. `Some(perm_id)` on success.
    async fn try_bind(&self, conn: &Arc<Connection>) -> Result<Option<i64>, InvocationError> {
        let temp = self.temp_key()
            .ok_or_else(|| InvocationError::Usage(format!("DC{} has no temporary key", self.id())))?;
        let perm = self.perm_key()
            .ok_or_else(|| InvocationError::Usage(format!("DC{} has no permanent key", self.id())))?;

        let expires_in = i64::from(self.settings().temp_auth_key_expires_in);
        let expires_at = (chrono::Utc::now().timestamp() + expires_in) as i32;
        let msg_id = conn.next_msg_id();
        let req = bind::bind_temp_auth_key(perm.key(), temp.key(), conn.session_id(), msg_id, expires_at);

        let msg = OutgoingMessage::raw("auth.bindTempAuthKey", req.to_bytes(), "Bool")
            .auth_handshake(true)
            .with_msg_id(msg_id);
        let res = call_on(conn, msg).await?;
        Ok(res.is_true().then(|| perm.id()))
    }

    async fn get_config(&self, conn: &Arc<Connection>) -> Result<(), InvocationError> {
        let msg = self.method_message("help.getConfig", Object::new("help.getConfig").into())?;
        call_on(conn, msg).await?;
        Ok(())
    }

    /// Copy the login from an authorized datacenter into this one.
    async fn sync_authorization(&self, conn: &Arc<Connection>) {
        let Some(engine) = self.engine() else { return };
        if !engine.is_logged_in() || self.is_authorized() {
            return;
        }
        let home = engine.authorized_dc();
        for source in engine.datacenters() {
            if home.is_some_and(|h| h != source.id()) || source.id() == self.id() {
                continue;
            }
            let eligible = source.has_temp_key()
                && source.has_perm_key()
                && source.is_authorized()
                && !source.is_cdn();
            if !eligible || !engine.is_logged_in() || self.is_authorized() {
                continue;
            }
            tracing::info!("[auth] copying authorization from DC{} to DC{}", source.id(), self.id());
            match self.copy_authorization(&engine, source.id(), conn).await {
                Ok(()) => {
                    self.authorized(true);
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        "[auth] failed to sync authorization from DC{} to DC{}: {e}",
                        source.id(), self.id()
                    );
                    if e.is("DC_ID_INVALID") {
                        break;
                    }
                }
            }
        }
    }

    async fn copy_authorization(
        &self,
        engine: &Arc<EngineShared>,
        source: i32,
        conn:   &Arc<Connection>,
    ) -> Result<(), InvocationError> {
        let args = Object::new("auth.exportAuthorization").with("dc_id", self.id());
        let exported = Engine::from_shared(Arc::clone(engine))
            .call_and_await("auth.exportAuthorization", args.into(), CallOptions::on(source))
            .await?;

        let args = Object::new("auth.importAuthorization")
            .with("id", exported.get("id").cloned().unwrap_or_default())
            .with("bytes", exported.get("bytes").cloned().unwrap_or_default());
        let msg = self.method_message("auth.importAuthorization", args.into())?;
        call_on(conn, msg).await?;
        Ok(())
    }

    /// A tracked call whose result type comes from the schema.
    fn method_message(&self, method: &str, args: Value) -> Result<OutgoingMessage, InvocationError> {
        let engine = self.engine().ok_or(InvocationError::Dropped)?;
        let info = engine.schema.find_method(method)
            .ok_or_else(|| InvocationError::UnknownMethod(method.to_string()))?;
        Ok(OutgoingMessage::call(method, args, info.result_type))
    }
}

/// Send `msg` on one specific socket and wait for its reply.
async fn call_on(conn: &Arc<Connection>, msg: OutgoingMessage) -> Result<Value, InvocationError> {
    let (msg, pending) = msg.into_tracked();
    conn.enqueue(msg);
    conn.flush().await?;
    pending.wait().await
}
