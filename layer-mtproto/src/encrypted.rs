//! Encrypted MTProto 2.0 framing (post auth-key).
//!
//! [`EncryptedSession`] pairs an authorization key with the current server
//! salt. Message ids and sequence numbers come from the caller's
//! [`crate::Session`], so one key can serve several connections.

use layer_crypto::{AuthKey, decrypt_data_v2, encrypt_data_v2};

/// Errors that can occur when decrypting a server message.
#[derive(Debug)]
pub enum DecryptError {
    /// The underlying crypto layer rejected the message.
    Crypto(layer_crypto::DecryptError),
    /// The decrypted inner message was too short to contain a valid header.
    FrameTooShort,
    /// Session-ID mismatch (possible replay or wrong connection).
    SessionMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e)       => write!(f, "crypto: {e}"),
            Self::FrameTooShort   => write!(f, "inner plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// The inner payload extracted from a successfully decrypted server frame.
#[derive(Clone, Debug)]
pub struct DecryptedMessage {
    pub salt:       i64,
    pub session_id: i64,
    pub msg_id:     i64,
    pub seq_no:     i32,
    /// TL-serialized body of the inner message.
    pub body:       Vec<u8>,
}

/// Authorization key plus server salt.
#[derive(Clone, Debug)]
pub struct EncryptedSession {
    auth_key: AuthKey,
    /// Current server salt to include in outgoing messages.
    pub salt: i64,
}

impl EncryptedSession {
    pub fn new(auth_key: AuthKey, salt: i64) -> Self {
        Self { auth_key, salt }
    }

    pub fn auth_key(&self) -> &AuthKey { &self.auth_key }

    /// Encrypt one message.
    ///
    /// Layout of the plaintext before encryption:
    /// ```text
    /// salt:       i64
    /// session_id: i64
    /// msg_id:     i64
    /// seq_no:     i32
    /// body_len:   i32
    /// body:       [u8; body_len]
    /// ```
    pub fn encrypt(&self, session_id: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + body.len());
        buf.extend(self.salt.to_le_bytes());
        buf.extend(session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        encrypt_data_v2(&buf, &self.auth_key)
    }

    /// Decrypt an encrypted server frame addressed to `session_id`.
    pub fn decrypt(&self, frame: &mut [u8], session_id: i64) -> Result<DecryptedMessage, DecryptError> {
        let plaintext = decrypt_data_v2(frame, &self.auth_key)
            .map_err(DecryptError::Crypto)?;

        // salt(8) + session_id(8) + msg_id(8) + seq_no(4) + len(4) + body
        if plaintext.len() < 32 {
            return Err(DecryptError::FrameTooShort);
        }

        let read_i64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&plaintext[at..at + 8]);
            i64::from_le_bytes(b)
        };
        let read_u32 = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&plaintext[at..at + 4]);
            u32::from_le_bytes(b)
        };

        let salt     = read_i64(0);
        let sid      = read_i64(8);
        let msg_id   = read_i64(16);
        let seq_no   = read_u32(24) as i32;
        let body_len = read_u32(28) as usize;

        if sid != session_id {
            return Err(DecryptError::SessionMismatch);
        }

        let body = plaintext[32..32 + body_len.min(plaintext.len() - 32)].to_vec();
        Ok(DecryptedMessage { salt, session_id: sid, msg_id, seq_no, body })
    }
}
