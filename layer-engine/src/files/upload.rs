//! Parallel chunked upload.

use std::sync::Arc;

use layer_tl_types::{Object, Value};
use tokio::task::JoinSet;

use super::progress::{ProgressSender, Tracker};
use super::{BIG_FILE_THRESHOLD, ChunkSource, FileKey, MemorySource, UPLOAD_PART_SIZE, join_result, part_count, part_len};
use crate::Engine;
use crate::dispatcher::CallOptions;
use crate::errors::InvocationError;

// ─── UploadOptions ────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub name:      String,
    pub mime:      String,
    /// Encrypt for a secret chat. Forces sequential parts.
    pub encrypted: bool,
    /// Allow several parts in flight at once.
    pub seekable:  bool,
    pub progress:  Option<ProgressSender>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            name:      String::new(),
            mime:      "application/octet-stream".into(),
            encrypted: false,
            seekable:  true,
            progress:  None,
        }
    }
}

impl UploadOptions {
    pub fn new(name: impl Into<String>, mime: impl Into<String>) -> Self {
        Self { name: name.into(), mime: mime.into(), ..Self::default() }
    }

    pub fn encrypted(mut self, v: bool) -> Self { self.encrypted = v; self }
    pub fn seekable(mut self, v: bool) -> Self { self.seekable = v; self }
    pub fn progress(mut self, tx: ProgressSender) -> Self { self.progress = Some(tx); self }
}

// ─── UploadedFile ─────────────────────────────────────────────────────────────

/// A file whose parts are all on the server.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadedFile {
    pub id:           i64,
    pub parts:        usize,
    pub name:         String,
    pub mime:         String,
    pub size:         u64,
    /// Went through `upload.saveBigFilePart`.
    pub big:          bool,
    /// Set for secret-chat uploads.
    pub key:          Option<FileKey>,
    pub md5_checksum: String,
}

impl UploadedFile {
    /// Constructor name of the matching `InputFile` / `InputEncryptedFile`.
    pub fn predicate(&self) -> &'static str {
        match (self.key.is_some(), self.big) {
            (false, false) => "inputFile",
            (false, true)  => "inputFileBig",
            (true, false)  => "inputEncryptedFileUploaded",
            (true, true)   => "inputEncryptedFileBigUploaded",
        }
    }

    /// The object to pass to `messages.sendMedia` and friends.
    pub fn to_value(&self) -> Value {
        let mut obj = Object::new(self.predicate())
            .with("id", self.id)
            .with("parts", self.parts as i32);
        match &self.key {
            Some(key) => obj.set("key_fingerprint", key.fingerprint),
            None => obj.set("name", self.name.as_str()),
        }
        if !self.big {
            obj.set("md5_checksum", self.md5_checksum.as_str());
        }
        obj.into()
    }
}

// ─── Engine: upload ───────────────────────────────────────────────────────────

impl Engine {
    /// Upload `size` bytes read from `source`.
    ///
    /// Parts go to the media variant of the authorized datacenter when one
    /// exists. Up to `upload_parallel_chunks` parts are in flight for
    /// seekable plain uploads; everything else runs one part at a time.
    pub async fn upload(
        &self,
        source: Arc<dyn ChunkSource>,
        size:   u64,
        opts:   UploadOptions,
    ) -> Result<UploadedFile, InvocationError> {
        if size == 0 {
            return Err(InvocationError::Usage("cannot upload an empty file".into()));
        }
        let dc = self.authorized_dc()
            .ok_or_else(|| InvocationError::Usage("no authorized datacenter to upload to".into()))?;

        let part_size = UPLOAD_PART_SIZE;
        let parts = part_count(size, part_size);
        let big = size > BIG_FILE_THRESHOLD;
        let method = if big { "upload.saveBigFilePart" } else { "upload.saveFilePart" };
        let key = opts.encrypted.then(FileKey::generate);
        let mut cipher = key.as_ref().map(FileKey::cipher);
        let window = if opts.seekable && key.is_none() {
            self.inner.settings.upload_parallel_chunks.max(1)
        } else {
            1
        };
        let file_id = random_id();
        let tracker = Arc::new(Tracker::new("Upload", parts, opts.progress.clone()));
        let call_opts = CallOptions::on(dc).file(true);

        tracing::info!(
            "[files] uploading {size} bytes in {parts} parts via {method} (window {window}{})",
            if key.is_some() { ", encrypted" } else { "" }
        );

        let mut tasks = JoinSet::new();
        for part in 0..parts {
            while tasks.len() >= window {
                if let Some(res) = tasks.join_next().await {
                    join_result(res)?;
                }
            }

            let offset = part as u64 * part_size as u64;
            let want = part_len(size, part_size, part);
            let mut bytes = source.read(offset, want).await?;
            if bytes.len() != want {
                return Err(InvocationError::Usage(format!(
                    "source returned {} bytes for part {part}, expected {want}", bytes.len()
                )));
            }
            if let Some(cipher) = cipher.as_mut() {
                bytes.resize(part_size, 0);
                cipher.encrypt(&mut bytes);
            }

            let mut args = Object::new(method)
                .with("file_id", file_id)
                .with("file_part", part as i32)
                .with("bytes", bytes);
            if big {
                args.set("file_total_parts", parts as i32);
            }

            let engine = self.clone();
            let source = Arc::clone(&source);
            let tracker = Arc::clone(&tracker);
            let call_opts = call_opts.clone();
            tasks.spawn(async move {
                let ok = engine.call_and_await(method, args.into(), call_opts).await?;
                if !ok.is_true() {
                    return Err(InvocationError::Usage(format!("Upload of part {part} failed")));
                }
                tracker.advance(want);
                source.acked();
                Ok(())
            });
        }
        while let Some(res) = tasks.join_next().await {
            join_result(res)?;
        }
        tracker.finish();

        Ok(UploadedFile {
            id: file_id,
            parts,
            name: opts.name,
            mime: opts.mime,
            size,
            big,
            key,
            md5_checksum: String::new(),
        })
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(&self, data: Vec<u8>, opts: UploadOptions) -> Result<UploadedFile, InvocationError> {
        let size = data.len() as u64;
        self.upload(Arc::new(MemorySource(data)), size, opts).await
    }
}

fn random_id() -> i64 {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).expect("getrandom");
    i64::from_le_bytes(buf)
}
