//! Pluggable session storage.
//!
//! The [`SessionBackend`] trait abstracts over where the engine's key
//! material lives between runs.
//!
//! Built-in backends:
//! * [`BinaryFileBackend`]: the compact binary format of
//!   [`PersistedSession::to_bytes`].
//! * [`InMemoryBackend`]: nothing touches the disk (the default).
//! * [`SqliteBackend`]: SQLite (requires the `sqlite-session` Cargo feature).

use std::io;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::session::PersistedSession;

// ─── Trait ────────────────────────────────────────────────────────────────────

pub trait SessionBackend: Send + Sync {
    fn save(&self, session: &PersistedSession) -> io::Result<()>;

    /// `None` when nothing was saved yet.
    fn load(&self) -> io::Result<Option<PersistedSession>>;

    /// Forget the stored session (e.g. on sign-out).
    fn delete(&self) -> io::Result<()>;

    /// Name used in log lines.
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionBackend for BinaryFileBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        session.save(&self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        PersistedSession::load(&self.path).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// Keeps the session for the lifetime of the process only.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<PersistedSession>>,
}

impl InMemoryBackend {
    pub fn new() -> Self { Self::default() }
}

impl SessionBackend for InMemoryBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        *self.data.lock() = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        Ok(self.data.lock().clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.data.lock() = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteBackend ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use layer_crypto::AuthKey;
    use rusqlite::{Connection, OptionalExtension, params};

    use crate::auth_key::{PermAuthKey, TempAuthKey};
    use crate::session::{DcRecord, PersistedDc};

    fn sql(e: rusqlite::Error) -> io::Error {
        io::Error::other(e)
    }

    fn key_from_blob(blob: Option<Vec<u8>>) -> Option<AuthKey> {
        blob.as_deref().and_then(AuthKey::from_slice)
    }

    /// SQLite-backed session store with a `meta` and a `dc_keys` table.
    ///
    /// Enable with the `sqlite-session` Cargo feature.
    pub struct SqliteBackend {
        path: PathBuf,
    }

    impl SqliteBackend {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            let conn = Connection::open(&path).map_err(sql)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dc_keys (
                    dc_id           INTEGER PRIMARY KEY,
                    is_cdn          INTEGER NOT NULL DEFAULT 0,
                    linked_dc       INTEGER,
                    perm_key        BLOB,
                    perm_salt       INTEGER NOT NULL DEFAULT 0,
                    perm_authorized INTEGER NOT NULL DEFAULT 0,
                    temp_key        BLOB,
                    temp_salt       INTEGER NOT NULL DEFAULT 0,
                    temp_expires_at INTEGER NOT NULL DEFAULT 0,
                    temp_bound_to   INTEGER
                );",
            ).map_err(sql)?;
            Ok(Self { path })
        }
    }

    impl SessionBackend for SqliteBackend {
        fn save(&self, session: &PersistedSession) -> io::Result<()> {
            let mut conn = Connection::open(&self.path).map_err(sql)?;
            let tx = conn.transaction().map_err(sql)?;

            tx.execute("DELETE FROM meta", []).map_err(sql)?;
            tx.execute("DELETE FROM dc_keys", []).map_err(sql)?;
            if let Some(dc) = session.authorized_dc {
                tx.execute("INSERT INTO meta (key, value) VALUES ('authorized_dc', ?1)", params![dc])
                    .map_err(sql)?;
            }
            tx.execute("INSERT INTO meta (key, value) VALUES ('logged_in', ?1)", params![session.logged_in])
                .map_err(sql)?;

            for dc in &session.dcs {
                let (linked, perm) = match &dc.keys {
                    PersistedDc::Linked { linked_dc, .. } => (Some(*linked_dc), None),
                    PersistedDc::Owned { perm, .. }       => (None, perm.as_ref()),
                };
                let temp = dc.keys.temp();
                tx.execute(
                    "INSERT INTO dc_keys
                        (dc_id, is_cdn, linked_dc, perm_key, perm_salt, perm_authorized,
                         temp_key, temp_salt, temp_expires_at, temp_bound_to)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        dc.dc_id,
                        dc.is_cdn,
                        linked,
                        perm.map(|p| p.key().as_bytes().to_vec()),
                        perm.map_or(0, |p| p.salt),
                        perm.is_some_and(PermAuthKey::is_authorized),
                        temp.map(|t| t.key().as_bytes().to_vec()),
                        temp.map_or(0, |t| t.salt),
                        temp.map_or(0, TempAuthKey::expires_at),
                        temp.and_then(TempAuthKey::bound_to),
                    ],
                ).map_err(sql)?;
            }
            tx.commit().map_err(sql)
        }

        fn load(&self) -> io::Result<Option<PersistedSession>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let conn = Connection::open(&self.path).map_err(sql)?;

            let meta = |key: &str| -> io::Result<Option<i64>> {
                conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()
                    .map_err(sql)
            };
            let Some(logged_in) = meta("logged_in")? else {
                return Ok(None);
            };
            let authorized_dc = meta("authorized_dc")?.and_then(|v| i32::try_from(v).ok());

            let mut stmt = conn.prepare(
                "SELECT dc_id, is_cdn, linked_dc, perm_key, perm_salt, perm_authorized,
                        temp_key, temp_salt, temp_expires_at, temp_bound_to
                 FROM dc_keys ORDER BY dc_id",
            ).map_err(sql)?;
            let dcs = stmt.query_map([], |row| {
                let dc_id:     i32         = row.get(0)?;
                let is_cdn:    bool        = row.get(1)?;
                let linked_dc: Option<i32> = row.get(2)?;
                let perm = key_from_blob(row.get(3)?).map(|key| {
                    let mut perm = PermAuthKey::new(key, 0);
                    perm.salt = row.get(4).unwrap_or(0);
                    perm.authorized(row.get(5).unwrap_or(false));
                    perm
                });
                let temp = key_from_blob(row.get(6)?).map(|key| {
                    let salt = row.get(7).unwrap_or(0);
                    let expires_at = row.get(8).unwrap_or(0);
                    let mut temp = TempAuthKey::new(key, salt, expires_at);
                    if let Ok(Some(perm_id)) = row.get::<_, Option<i64>>(9) {
                        temp.bind(perm_id);
                    }
                    temp
                });
                let keys = match linked_dc {
                    Some(linked_dc) => PersistedDc::Linked { linked_dc, temp },
                    None            => PersistedDc::Owned { perm, temp },
                };
                Ok(DcRecord { dc_id, is_cdn, keys })
            })
            .map_err(sql)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql)?;

            Ok(Some(PersistedSession { authorized_dc, logged_in: logged_in != 0, dcs }))
        }

        fn delete(&self) -> io::Result<()> {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_lifecycle() {
        let b = InMemoryBackend::new();
        assert!(b.load().unwrap().is_none());
        let s = PersistedSession { authorized_dc: Some(4), logged_in: true, dcs: Vec::new() };
        b.save(&s).unwrap();
        assert_eq!(b.load().unwrap(), Some(s));
        b.delete().unwrap();
        assert!(b.load().unwrap().is_none());
        assert_eq!(b.name(), "in-memory");
    }

    #[test]
    fn binary_file_lifecycle() {
        let path = std::env::temp_dir().join(format!("layer-engine-session-{}.bin", std::process::id()));
        let b = BinaryFileBackend::new(&path);
        b.delete().unwrap();
        assert!(b.load().unwrap().is_none());
        let s = PersistedSession { authorized_dc: None, logged_in: false, dcs: Vec::new() };
        b.save(&s).unwrap();
        assert_eq!(b.load().unwrap(), Some(s));
        b.delete().unwrap();
        assert!(!path.exists());
    }
}
