//! Cryptographic primitives for MTProto.
//!
//! Provides:
//! - AES-256-IGE (one-shot and chained) and AES-256-CTR
//! - SHA-1 / SHA-256 / MD5 hash macros
//! - Pollard-rho PQ factorization
//! - RSA padding (MTProto RSA-PAD scheme)
//! - `AuthKey`, a 256-byte session key
//! - MTProto 2.0 message encryption / decryption
//! - MTProto 1.0 key derivation (used for temp key binding)
//! - DH nonce→key derivation
//! - CDN counter derivation and file-key fingerprints

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;

#[doc(hidden)]
pub mod __hash {
    pub use ::md5;
    pub use ::sha1;
    pub use ::sha2;
}

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer      => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch    => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// Which end of the connection produced a message. Selects the key offset `x`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side { Client, Server }

impl Side {
    fn x(self) -> usize { match self { Side::Client => 0, Side::Server => 8 } }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt `plaintext` using MTProto 2.0.
///
/// Returns `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey) -> Vec<u8> {
    encrypt_data_v2_as(plaintext, auth_key, Side::Client)
}

/// Like [`encrypt_data_v2`], as seen from `side`. `Side::Server` frames are
/// what [`decrypt_data_v2`] accepts.
pub fn encrypt_data_v2_as(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Vec<u8> {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    do_encrypt_data_v2(plaintext, auth_key, &rnd, side)
}

pub(crate) fn do_encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, rnd: &[u8; 32], side: Side) -> Vec<u8> {
    let pad = padding_len(plaintext.len());
    let mut body = Vec::with_capacity(plaintext.len() + pad);
    body.extend_from_slice(plaintext);
    body.extend(rnd.iter().take(pad).copied());

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], &body);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut body, &key, &iv);

    let mut out = Vec::with_capacity(24 + body.len());
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend(body);
    out
}

/// Decrypt an MTProto 2.0 ciphertext.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`.
/// On success returns a slice of `buffer` containing the plaintext.
pub fn decrypt_data_v2<'a>(buffer: &'a mut [u8], auth_key: &AuthKey) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, Side::Server);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = Side::Server.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

// ─── MTProto 1.0 ─────────────────────────────────────────────────────────────

/// MTProto 1.0 (SHA-1) key derivation.
pub fn calc_key_v1(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let ak = &auth_key.data;
    let a = sha1!(msg_key, &ak[x..x + 32]);
    let b = sha1!(&ak[32 + x..48 + x], msg_key, &ak[48 + x..64 + x]);
    let c = sha1!(&ak[64 + x..96 + x], msg_key);
    let d = sha1!(msg_key, &ak[96 + x..128 + x]);

    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&a[..8]);
    key[8..20].copy_from_slice(&b[8..20]);
    key[20..].copy_from_slice(&c[4..16]);

    let mut iv = [0u8; 32];
    iv[..12].copy_from_slice(&a[8..20]);
    iv[12..20].copy_from_slice(&b[..8]);
    iv[20..24].copy_from_slice(&c[16..20]);
    iv[24..].copy_from_slice(&d[..8]);

    (key, iv)
}

/// Encrypt an already framed MTProto 1.0 message with `auth_key`.
///
/// `msg_key` is the lower 128 bits of `SHA1(plaintext)` taken before padding.
/// `padding` supplies the random bytes (at least 15) appended to reach a
/// 16-byte boundary. Returns `key_id || msg_key || ciphertext`.
pub fn encrypt_data_v1(plaintext: &[u8], auth_key: &AuthKey, padding: &[u8]) -> Vec<u8> {
    let hash = sha1!(plaintext);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&hash[4..]);

    let pad = (16 - plaintext.len() % 16) % 16;
    let mut body = Vec::with_capacity(plaintext.len() + pad);
    body.extend_from_slice(plaintext);
    body.extend_from_slice(&padding[..pad]);

    let (key, iv) = calc_key_v1(auth_key, &msg_key, Side::Client);
    aes::ige_encrypt(&mut body, &key, &iv);

    let mut out = Vec::with_capacity(24 + body.len());
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&msg_key);
    out.extend(body);
    out
}

// ─── Handshake / file helpers ────────────────────────────────────────────────

/// Derive `(key, iv)` from nonces for decrypting `ServerDhParams.encrypted_answer`.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

/// Counter block for the CDN chunk starting at `offset`.
///
/// The first 12 bytes come from the CDN iv, the last 4 are `offset / 16`
/// in big-endian.
pub fn cdn_chunk_iv(cdn_iv: &[u8; 16], offset: u64) -> [u8; 16] {
    let mut iv = *cdn_iv;
    iv[12..].copy_from_slice(&((offset >> 4) as u32).to_be_bytes());
    iv
}

/// Fingerprint of an encrypted file key: `md5(key || iv)`, first four bytes
/// XOR the next four, read as little-endian `i32`.
pub fn key_fingerprint(key: &[u8; 32], iv: &[u8; 32]) -> i32 {
    let digest = md5!(key, iv);
    let mut out = [0u8; 4];
    for (i, b) in out.iter_mut().enumerate() {
        *b = digest[i] ^ digest[i + 4];
    }
    i32::from_le_bytes(out)
}
