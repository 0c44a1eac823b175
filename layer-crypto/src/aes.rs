//! AES-256 in IGE and CTR modes.
//!
//! IGE keeps two 16-byte chaining blocks. [`Ige`] carries them between calls
//! so a stream split into parts (file uploads, downloads) can be processed
//! part by part and still produce the same bytes as a single pass.

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Encrypt `buffer` in place with a fresh IGE chain.
///
/// `buffer.len()` must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    Ige::new(key, iv).encrypt(buffer);
}

/// Decrypt `buffer` in place with a fresh IGE chain.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    Ige::new(key, iv).decrypt(buffer);
}

// ─── Stateful IGE ────────────────────────────────────────────────────────────

/// An IGE cipher whose chaining state survives across calls.
#[derive(Clone)]
pub struct Ige {
    cipher: Aes256,
    /// Previous ciphertext block.
    iv1:    [u8; 16],
    /// Previous plaintext block.
    iv2:    [u8; 16],
}

impl Ige {
    pub fn new(key: &[u8; 32], iv: &[u8; 32]) -> Self {
        let mut iv1 = [0u8; 16];
        let mut iv2 = [0u8; 16];
        iv1.copy_from_slice(&iv[..16]);
        iv2.copy_from_slice(&iv[16..]);
        Self { cipher: Aes256::new(GenericArray::from_slice(key)), iv1, iv2 }
    }

    pub fn encrypt(&mut self, buffer: &mut [u8]) {
        assert_eq!(buffer.len() % 16, 0, "IGE input must be block-aligned");
        for block in buffer.chunks_exact_mut(16) {
            let mut plain = [0u8; 16];
            plain.copy_from_slice(block);

            xor_into(block, &self.iv1);
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
            xor_into(block, &self.iv2);

            self.iv1.copy_from_slice(block);
            self.iv2 = plain;
        }
    }

    pub fn decrypt(&mut self, buffer: &mut [u8]) {
        assert_eq!(buffer.len() % 16, 0, "IGE input must be block-aligned");
        for block in buffer.chunks_exact_mut(16) {
            let mut cipher = [0u8; 16];
            cipher.copy_from_slice(block);

            xor_into(block, &self.iv2);
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
            xor_into(block, &self.iv1);

            self.iv1 = cipher;
            self.iv2.copy_from_slice(block);
        }
    }
}

fn xor_into(block: &mut [u8], with: &[u8; 16]) {
    for (a, b) in block.iter_mut().zip(with) { *a ^= b; }
}

// ─── CTR ─────────────────────────────────────────────────────────────────────

/// Apply the AES-256-CTR keystream (big-endian 128-bit counter) in place.
/// Encryption and decryption are the same operation.
pub fn ctr_apply(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 16]) {
    let mut cipher = Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
    cipher.apply_keystream(buffer);
}
