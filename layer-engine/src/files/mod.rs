//! Chunked file transfers.
//!
//! ## Upload
//! [`Engine::upload`] reads parts from a [`ChunkSource`] and writes them with
//! `upload.saveFilePart` (or `upload.saveBigFilePart` above
//! [`BIG_FILE_THRESHOLD`]), keeping up to `upload_parallel_chunks` parts in
//! flight. [`Engine::upload_bytes`] covers the in-memory case.
//!
//! ## Download
//! [`Engine::download`] resolves a [`DownloadInfo`], splits the requested
//! range into [`ChunkRange`]s and hands every chunk to a [`ChunkSink`] at its
//! absolute offset. CDN redirects, CDN hash checks and secret-chat decryption
//! happen in between. [`Engine::download_to_vec`] collects into memory.
//!
//! ## Reupload
//! [`Engine::reupload`] pipes a download straight into an upload, one part
//! at a time.
//!
//! Encrypted transfers always run one part at a time: the IGE chain of part
//! `n + 1` depends on the last block of part `n`.
//!
//! [`Engine::upload`]: crate::Engine::upload
//! [`Engine::upload_bytes`]: crate::Engine::upload_bytes
//! [`Engine::download`]: crate::Engine::download
//! [`Engine::download_to_vec`]: crate::Engine::download_to_vec
//! [`Engine::reupload`]: crate::Engine::reupload

mod bridge;
mod cdn;
mod download;
mod info;
mod progress;
mod upload;

use parking_lot::Mutex;

use crate::errors::InvocationError;
use crate::socket::BoxFuture;

pub use cdn::CdnHashes;
pub use download::DownloadOptions;
pub use info::{DownloadInfo, FileKey};
pub use progress::{ProgressReceiver, ProgressSample, ProgressSender, channel as progress_channel};
pub use upload::{UploadOptions, UploadedFile};

// ─── Constants ────────────────────────────────────────────────────────────────

/// Upload part size (512 KiB).
pub const UPLOAD_PART_SIZE: usize = 512 * 1024;
/// Files larger than this go through `upload.saveBigFilePart`.
pub const BIG_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
/// Download part size when neither the caller nor the settings pick one.
pub const DOWNLOAD_PART_SIZE: usize = 1024 * 1024;
/// Assumed upper bound for downloads of unknown length.
pub const PROBABLE_END: u64 = 512 * 1024 * 8000;

// ─── Chunk math ───────────────────────────────────────────────────────────────

/// Number of `part_size` parts needed for `size` bytes.
pub fn part_count(size: u64, part_size: usize) -> usize {
    size.div_ceil(part_size as u64) as usize
}

/// Byte length of part `index` of a `size`-byte file.
pub fn part_len(size: u64, part_size: usize, index: usize) -> usize {
    let start = index as u64 * part_size as u64;
    size.saturating_sub(start).min(part_size as u64) as usize
}

/// One `upload.getFile` request and the slice of its reply that is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    /// Aligned request offset.
    pub offset:   u64,
    /// Request limit, always the part size.
    pub limit:    usize,
    /// First kept byte within the reply.
    pub start_at: usize,
    /// One past the last kept byte within the reply.
    pub end_at:   usize,
}

impl ChunkRange {
    /// Bytes this chunk contributes.
    pub fn wanted(&self) -> usize {
        self.end_at.saturating_sub(self.start_at)
    }

    /// Absolute offset of the first kept byte.
    pub fn sink_offset(&self) -> u64 {
        self.offset + self.start_at as u64
    }

    /// Cut a reply down to the kept slice.
    pub fn trim(&self, mut bytes: Vec<u8>) -> Vec<u8> {
        if self.start_at != 0 || self.end_at != self.limit {
            let end = self.end_at.min(bytes.len());
            let start = self.start_at.min(end);
            bytes.truncate(end);
            bytes.drain(..start);
        }
        bytes
    }
}

/// Split `[offset, end)` into part-aligned requests.
///
/// With no `end` the ranges run up to [`PROBABLE_END`]; the download stops
/// early on the first short reply.
pub fn download_ranges(offset: u64, end: Option<u64>, part_size: usize) -> Vec<ChunkRange> {
    if end.is_some_and(|end| end <= offset) {
        return Vec::new();
    }
    let part = part_size as u64;
    let mut start_at = (offset % part) as usize;
    let limit = end.unwrap_or(PROBABLE_END);
    let mut ranges = Vec::new();
    let mut x = offset - start_at as u64;
    while x < limit {
        let mut end_at = part_size;
        let mut last = false;
        if let Some(end) = end {
            if x + part > end {
                end_at = (end - x) as usize;
                last = true;
            }
        }
        ranges.push(ChunkRange { offset: x, limit: part_size, start_at, end_at });
        start_at = 0;
        if last {
            break;
        }
        x += part;
    }
    ranges
}

/// Flatten the result of a spawned transfer task.
pub(crate) fn join_result<T>(
    res: Result<Result<T, InvocationError>, tokio::task::JoinError>,
) -> Result<T, InvocationError> {
    match res {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Err(InvocationError::Dropped),
        Err(e) => Err(InvocationError::Io(std::io::Error::other(e))),
    }
}

// ─── Sources and sinks ────────────────────────────────────────────────────────

/// Where upload parts come from.
pub trait ChunkSource: Send + Sync {
    /// Read `len` bytes at `offset`. Called once per part, in order.
    fn read(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Vec<u8>, InvocationError>>;

    /// The server accepted one more part.
    fn acked(&self) {}
}

/// Where downloaded chunks go.
pub trait ChunkSink: Send + Sync {
    /// Store `bytes` at absolute `offset`. May be called out of order for
    /// seekable downloads.
    fn write(&self, offset: u64, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), InvocationError>>;
}

/// An in-memory upload source.
pub struct MemorySource(pub Vec<u8>);

impl ChunkSource for MemorySource {
    fn read(&self, offset: u64, len: usize) -> BoxFuture<'_, Result<Vec<u8>, InvocationError>> {
        let start = (offset as usize).min(self.0.len());
        let end = start.saturating_add(len).min(self.0.len());
        let out = self.0[start..end].to_vec();
        Box::pin(async move { Ok(out) })
    }
}

/// Collects a download into one buffer. Offsets are relative to `base`.
#[derive(Debug, Default)]
pub struct MemorySink {
    base: u64,
    buf:  Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new(base: u64) -> Self {
        Self { base, buf: Mutex::new(Vec::new()) }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_inner()
    }

    /// Copy of what has been written so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }
}

impl ChunkSink for MemorySink {
    fn write(&self, offset: u64, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), InvocationError>> {
        let res = match offset.checked_sub(self.base) {
            Some(at) => {
                let at = at as usize;
                let mut buf = self.buf.lock();
                if buf.len() < at + bytes.len() {
                    buf.resize(at + bytes.len(), 0);
                }
                buf[at..at + bytes.len()].copy_from_slice(&bytes);
                Ok(())
            }
            None => Err(InvocationError::Usage(format!(
                "chunk at {offset} lies before the sink start {}", self.base
            ))),
        };
        Box::pin(async move { res })
    }
}
