//! Engine settings and the construction bundle.

use std::sync::Arc;
use std::time::Duration;

use crate::retry::{AutoSleep, RetryPolicy};
use crate::schema::{MethodSchema, NoReferences, ReferenceDatabase};
use crate::session_backend::{InMemoryBackend, SessionBackend};
use crate::socket::Connector;

// ─── Settings ─────────────────────────────────────────────────────────────────

/// Tunables consumed by the pool, the key manager, the dispatcher and the
/// file engine.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Settings {
    /// Use a bound temporary key on top of the permanent one.
    pub pfs:                      bool,
    /// Attempts at `auth.bindTempAuthKey` before giving up.
    pub max_auth_tries:           u32,
    /// Lifetime of generated temporary keys, in seconds.
    pub temp_auth_key_expires_in: i32,
    /// Socket ceiling for media and CDN datacenters.
    pub max_media_socket_count:   usize,
    /// How often media/CDN pools rebalance their weights.
    pub robin_period:             Duration,
    pub upload_parallel_chunks:   usize,
    pub download_parallel_chunks: usize,
    pub download_part_size:       usize,
    /// Default flood-wait ceiling in seconds for calls that set none.
    pub flood_wait_limit:         u64,
    /// Longest text a single message may carry before it is split.
    pub message_length_max:       usize,
    /// Reopen a lost socket at the same index and replay its backup.
    pub reconnect_on_loss:        bool,
    pub read_decrement:           i64,
    pub media_read_decrement:     i64,
    pub write_decrement:          i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pfs:                      true,
            max_auth_tries:           5,
            temp_auth_key_expires_in: 86_400,
            max_media_socket_count:   10,
            robin_period:             Duration::from_secs(10),
            upload_parallel_chunks:   20,
            download_parallel_chunks: 20,
            download_part_size:       1024 * 1024,
            flood_wait_limit:         30,
            message_length_max:       4096,
            reconnect_on_loss:        true,
            read_decrement:           1,
            media_read_decrement:     5,
            write_decrement:          10,
        }
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Everything [`crate::Engine::new`] needs.
#[derive(Clone)]
pub struct Config {
    pub settings:        Settings,
    pub schema:          Arc<dyn MethodSchema>,
    pub references:      Arc<dyn ReferenceDatabase>,
    pub connector:       Arc<dyn Connector>,
    pub session_backend: Arc<dyn SessionBackend>,
    pub retry_policy:    Arc<dyn RetryPolicy>,
}

impl Config {
    /// Default settings, an in-memory session store and no reference database.
    pub fn new(schema: Arc<dyn MethodSchema>, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings:        Settings::default(),
            schema,
            references:      Arc::new(NoReferences),
            connector,
            session_backend: Arc::new(InMemoryBackend::new()),
            retry_policy:    Arc::new(AutoSleep::default()),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}
