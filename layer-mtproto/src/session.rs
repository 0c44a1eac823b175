//! Per-connection MTProto session state.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::message::{Message, MessageId};

/// Message-id and sequence-number bookkeeping for one physical connection.
///
/// A `Session` is cheap to create and is reset whenever its socket is
/// reopened, which gives the new connection a fresh `session_id`.
///
/// # Example
///
/// ```rust
/// use layer_mtproto::Session;
///
/// let mut session = Session::new();
/// let a = session.next_msg_id();
/// let b = session.next_msg_id();
/// assert!(b.0 > a.0);
/// assert_eq!(session.next_seq_no(true) & 1, 1);
/// ```
#[derive(Clone, Debug)]
pub struct Session {
    session_id:      i64,
    /// Number of content-related messages sent so far.
    sequence:        i32,
    last_msg_id:     i64,
    /// Clock skew in seconds vs. server.
    pub time_offset: i32,
}

impl Session {
    /// Create a fresh session with a random id.
    pub fn new() -> Self {
        Self::with_id(random_i64())
    }

    pub fn with_id(session_id: i64) -> Self {
        Self { session_id, sequence: 0, last_msg_id: 0, time_offset: 0 }
    }

    pub fn session_id(&self) -> i64 { self.session_id }

    /// Drop all counters and pick a new session id.
    pub fn reset(&mut self) {
        let time_offset = self.time_offset;
        *self = Self::new();
        self.time_offset = time_offset;
    }

    /// Allocate a new message ID based on corrected server time.
    ///
    /// Strictly increasing within the session and divisible by four.
    pub fn next_msg_id(&mut self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = (now.as_secs() as i64).wrapping_add(self.time_offset as i64) as u64;
        let nanos = now.subsec_nanos() as u64;
        let mut id = ((secs << 32) | (nanos << 2)) as i64 & !3;
        if self.last_msg_id >= id { id = self.last_msg_id + 4; }
        self.last_msg_id = id;
        MessageId(id)
    }

    /// Next sequence number.
    ///
    /// Content-related messages (calls, their containers' members) get an odd
    /// number and advance the counter; others get the current even number.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Update the clock skew from a server-provided `msg_id`.
    pub fn sync_time(&mut self, server_msg_id: i64) {
        let server_secs = (server_msg_id >> 32) as i32;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i32;
        self.time_offset = server_secs.wrapping_sub(now);
        self.last_msg_id = 0;
    }

    /// Wrap `body` in a plaintext [`Message`] (used before key exchange).
    pub fn pack_plain(&mut self, body: Vec<u8>) -> Message {
        let id = self.next_msg_id();
        Message::plaintext(id, 0, body)
    }
}

impl Default for Session {
    fn default() -> Self { Self::new() }
}

pub(crate) fn random_i64() -> i64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    i64::from_le_bytes(b)
}
