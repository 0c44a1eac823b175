//! CDN chunk hashes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use layer_tl_types::Value;
use parking_lot::Mutex;

use crate::errors::InvocationError;

/// Expected SHA-256 of `limit` bytes starting at some offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CdnHash {
    pub limit: usize,
    pub hash:  [u8; 32],
}

/// Hash tables of every CDN file being downloaded, keyed by file token.
#[derive(Debug, Default)]
pub struct CdnHashes {
    files: Mutex<HashMap<Vec<u8>, BTreeMap<u64, CdnHash>>>,
}

impl CdnHashes {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, token: &[u8], offset: u64, limit: usize, hash: [u8; 32]) {
        self.files.lock()
            .entry(token.to_vec())
            .or_default()
            .insert(offset, CdnHash { limit, hash });
    }

    /// Add the `fileHash` objects in `hashes` (a vector or a single one).
    /// Returns how many were usable.
    pub fn add(&self, token: &[u8], hashes: &Value) -> usize {
        let list = match hashes {
            Value::Vector(v) => v.as_slice(),
            single => std::slice::from_ref(single),
        };
        let mut added = 0;
        for h in list {
            let offset = h.get("offset").and_then(Value::as_i64);
            let limit = h.get("limit").and_then(Value::as_i32);
            let hash = h.get("hash").and_then(Value::as_bytes).and_then(|b| <[u8; 32]>::try_from(b).ok());
            if let (Some(offset), Some(limit), Some(hash)) = (offset, limit, hash) {
                if offset >= 0 && limit > 0 {
                    self.insert(token, offset as u64, limit as usize, hash);
                    added += 1;
                    continue;
                }
            }
            tracing::warn!("[files] ignoring malformed CDN hash entry");
        }
        added
    }

    pub fn get(&self, token: &[u8], offset: u64) -> Option<CdnHash> {
        self.files.lock().get(token)?.get(&offset).copied()
    }

    pub fn contains(&self, token: &[u8]) -> bool {
        self.files.lock().contains_key(token)
    }

    /// Forget every hash of `token`. `true` if there was anything to forget.
    pub fn clear(&self, token: &[u8]) -> bool {
        self.files.lock().remove(token).is_some()
    }

    /// Check `data` downloaded at `offset` against the cached hashes.
    ///
    /// `Ok(None)` means every byte was covered and matched. `Ok(Some(at))`
    /// means there is no hash for offset `at` yet.
    pub fn verify(&self, token: &[u8], offset: u64, data: &[u8]) -> Result<Option<u64>, InvocationError> {
        let files = self.files.lock();
        let table = files.get(token);
        let mut at = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let Some(entry) = table.and_then(|t| t.get(&at)) else {
                return Ok(Some(at));
            };
            let take = entry.limit.min(rest.len());
            if layer_crypto::sha256!(&rest[..take]) != entry.hash {
                tracing::error!("[files] CDN hash mismatch at offset {at}");
                return Err(InvocationError::Security(format!("CDN hash mismatch for offset {at}")));
            }
            rest = &rest[take..];
            at += take as u64;
        }
        Ok(None)
    }
}

/// Clears the hashes of every token it saw when dropped.
pub(crate) struct CdnScope {
    hashes: Arc<CdnHashes>,
    tokens: Mutex<Vec<Vec<u8>>>,
}

impl CdnScope {
    pub(crate) fn new(hashes: Arc<CdnHashes>) -> Self {
        Self { hashes, tokens: Mutex::new(Vec::new()) }
    }

    pub(crate) fn track(&self, token: &[u8]) {
        let mut tokens = self.tokens.lock();
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_vec());
        }
    }
}

impl Drop for CdnScope {
    fn drop(&mut self) {
        for token in self.tokens.get_mut().drain(..) {
            self.hashes.clear(&token);
        }
    }
}
