//! Parallel chunked download with CDN support.

use std::sync::Arc;
use std::time::Duration;

use layer_crypto::aes::{Ige, ctr_apply};
use layer_tl_types::{Object, Value};
use parking_lot::Mutex;
use tokio::task::JoinSet;

use super::cdn::CdnScope;
use super::info::{self, DownloadInfo};
use super::progress::{ProgressSender, Tracker};
use super::{ChunkRange, ChunkSink, DOWNLOAD_PART_SIZE, MemorySink, download_ranges, join_result};
use crate::Engine;
use crate::dispatcher::CallOptions;
use crate::errors::InvocationError;

// ─── DownloadOptions ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    /// First byte to fetch.
    pub offset:    u64,
    /// One past the last byte. Defaults to the file size when known.
    pub end:       Option<u64>,
    /// Defaults to `Settings::download_part_size`.
    pub part_size: Option<usize>,
    /// Allow chunks to complete out of order.
    pub seekable:  bool,
    pub progress:  Option<ProgressSender>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self { offset: 0, end: None, part_size: None, seekable: true, progress: None }
    }
}

impl DownloadOptions {
    pub fn range(mut self, offset: u64, end: u64) -> Self {
        self.offset = offset;
        self.end = Some(end);
        self
    }

    pub fn part_size(mut self, size: usize) -> Self { self.part_size = Some(size); self }
    pub fn seekable(mut self, v: bool) -> Self { self.seekable = v; self }
    pub fn progress(mut self, tx: ProgressSender) -> Self { self.progress = Some(tx); self }
}

// ─── Transfer state ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct CdnRedirect {
    token: Vec<u8>,
    key:   [u8; 32],
    iv:    [u8; 16],
}

/// Where chunks are fetched from right now. Shared by all chunk tasks.
struct Route {
    dc:     i32,
    /// The datacenter that issued the CDN redirect.
    origin: Option<i32>,
    cdn:    Option<CdnRedirect>,
}

struct Transfer {
    engine:   Engine,
    location: Object,
    route:    Mutex<Route>,
    cipher:   Option<Mutex<Ige>>,
    sink:     Arc<dyn ChunkSink>,
    tracker:  Tracker,
    scope:    CdnScope,
}

impl Transfer {
    fn call_opts(dc: i32) -> CallOptions {
        CallOptions::on(dc).file(true).flood_wait_limit(0)
    }

    /// Fetch one chunk and hand it to the sink. Returns the bytes written.
    async fn fetch(&self, range: ChunkRange) -> Result<usize, InvocationError> {
        loop {
            let (dc, cdn) = {
                let route = self.route.lock();
                (route.dc, route.cdn.clone())
            };
            let (method, mut args) = match &cdn {
                Some(c) => ("upload.getCdnFile", Object::new("upload.getCdnFile").with("file_token", c.token.clone())),
                None => ("upload.getFile", Object::new("upload.getFile").with("location", self.location.clone())),
            };
            args.set("offset", range.offset as i64);
            args.set("limit", range.limit as i32);

            let res = match self.engine.call_and_await(method, args.into(), Self::call_opts(dc)).await {
                Ok(res) => res,
                Err(e) if e.flood_wait_seconds().is_some() => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Err(e) if cdn.is_some() && e.is("FILE_TOKEN_INVALID") => {
                    self.leave_cdn();
                    continue;
                }
                Err(e) => return Err(e),
            };

            match res.predicate() {
                Some("upload.fileCdnRedirect") => {
                    self.enter_cdn(&res, dc).await?;
                    continue;
                }
                Some("upload.cdnFileReuploadNeeded") => {
                    self.reupload(&res).await?;
                    continue;
                }
                _ => {}
            }

            let mut bytes = bytes_of(&res);
            if cdn.is_none() && bytes.is_empty() && is_unknown_storage(&res) {
                bytes = self.scan(range).await?;
            }
            if bytes.is_empty() {
                return Ok(0);
            }

            if let Some(c) = &cdn {
                ctr_apply(&mut bytes, &c.key, &layer_crypto::cdn_chunk_iv(&c.iv, range.offset));
                self.check_hashes(&c.token, range.offset, &bytes).await?;
            }
            if let Some(cipher) = &self.cipher {
                if bytes.len() % 16 != 0 {
                    return Err(InvocationError::Security(format!(
                        "encrypted chunk at {} is not block aligned", range.offset
                    )));
                }
                cipher.lock().decrypt(&mut bytes);
            }

            let bytes = range.trim(bytes);
            let len = bytes.len();
            self.sink.write(range.sink_offset(), bytes).await?;
            self.tracker.advance(len);
            return Ok(len);
        }
    }

    async fn enter_cdn(&self, res: &Value, dc: i32) -> Result<(), InvocationError> {
        let bad = |f: &str| InvocationError::Deserialize(format!("upload.fileCdnRedirect without a usable {f}"));
        let cdn_dc = res.get("dc_id").and_then(Value::as_i32).ok_or_else(|| bad("dc_id"))?;
        let token = res.get("file_token").and_then(Value::as_bytes).ok_or_else(|| bad("file_token"))?.to_vec();
        let key = res.get("encryption_key").and_then(Value::as_bytes)
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or_else(|| bad("encryption_key"))?;
        let iv = res.get("encryption_iv").and_then(Value::as_bytes)
            .and_then(|b| <[u8; 16]>::try_from(b).ok())
            .ok_or_else(|| bad("encryption_iv"))?;

        if !self.engine.has_datacenter(cdn_dc) {
            tracing::info!("[files] adding CDN DC{cdn_dc}");
            self.engine.add_datacenter(cdn_dc, true);
            self.engine.connect(cdn_dc).await?;
        }

        self.scope.track(&token);
        if let Some(hashes) = res.get("file_hashes") {
            self.engine.inner.cdn_hashes.add(&token, hashes);
        }
        let mut route = self.route.lock();
        route.origin = Some(dc);
        route.dc = cdn_dc;
        route.cdn = Some(CdnRedirect { token, key, iv });
        tracing::info!("[files] File is stored on CDN DC{cdn_dc}!");
        Ok(())
    }

    fn leave_cdn(&self) {
        let mut route = self.route.lock();
        if let Some(origin) = route.origin.take() {
            route.dc = origin;
        }
        route.cdn = None;
        tracing::warn!("[files] CDN token rejected, falling back to DC{}", route.dc);
    }

    async fn reupload(&self, res: &Value) -> Result<(), InvocationError> {
        tracing::info!("[files] File is not stored on CDN, requesting reupload!");
        let request_token = res.get("request_token").and_then(Value::as_bytes)
            .ok_or_else(|| InvocationError::Deserialize("upload.cdnFileReuploadNeeded without request_token".into()))?
            .to_vec();
        let (origin, token) = {
            let route = self.route.lock();
            (route.origin, route.cdn.as_ref().map(|c| c.token.clone()))
        };
        let (Some(origin), Some(token)) = (origin, token) else {
            return Err(InvocationError::Usage("reupload requested outside a CDN download".into()));
        };

        let args = Object::new("upload.reuploadCdnFile")
            .with("file_token", token.clone())
            .with("request_token", request_token);
        match self.engine.call_and_await("upload.reuploadCdnFile", args.into(), CallOptions::on(origin)).await {
            Ok(hashes) => {
                self.engine.inner.cdn_hashes.add(&token, &hashes);
                Ok(())
            }
            Err(e) if e.is("FILE_TOKEN_INVALID") || e.is("REQUEST_TOKEN_INVALID") => {
                self.leave_cdn();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn check_hashes(&self, token: &[u8], offset: u64, data: &[u8]) -> Result<(), InvocationError> {
        let hashes = &self.engine.inner.cdn_hashes;
        while let Some(at) = hashes.verify(token, offset, data)? {
            let origin = self.route.lock().origin
                .ok_or_else(|| InvocationError::Usage("CDN chunk without an origin datacenter".into()))?;
            let args = Object::new("upload.getCdnFileHashes")
                .with("file_token", token.to_vec())
                .with("offset", at as i64);
            let res = self.engine.call_and_await("upload.getCdnFileHashes", args.into(), CallOptions::on(origin)).await?;
            hashes.add(token, &res);
            if hashes.get(token, at).is_none() {
                return Err(InvocationError::Security(format!("Could not fetch CDN hashes for offset {at}")));
            }
        }
        Ok(())
    }

    /// The file was not where the media said. Walk the main datacenters.
    async fn scan(&self, range: ChunkRange) -> Result<Vec<u8>, InvocationError> {
        let mut dc = 0;
        loop {
            dc += 1;
            if !self.engine.has_datacenter(dc) {
                return Ok(Vec::new());
            }
            tracing::debug!("[files] file unknown, trying DC{dc}");
            let args = Object::new("upload.getFile")
                .with("location", self.location.clone())
                .with("offset", range.offset as i64)
                .with("limit", range.limit as i32);
            let res = self.engine.call_and_await("upload.getFile", args.into(), Self::call_opts(dc)).await?;
            let bytes = bytes_of(&res);
            if !bytes.is_empty() || !is_unknown_storage(&res) {
                if !bytes.is_empty() {
                    self.route.lock().dc = dc;
                }
                return Ok(bytes);
            }
        }
    }
}

fn bytes_of(res: &Value) -> Vec<u8> {
    res.get("bytes").and_then(Value::as_bytes).map(<[u8]>::to_vec).unwrap_or_default()
}

fn is_unknown_storage(res: &Value) -> bool {
    res.get("type").and_then(Value::predicate) == Some("storage.fileUnknown")
}

// ─── Engine: download ─────────────────────────────────────────────────────────

impl Engine {
    /// Resolve a message, media object, document or photo into a
    /// [`DownloadInfo`].
    pub fn get_download_info(&self, media: &Value) -> Result<DownloadInfo, InvocationError> {
        info::resolve(media, self.inner.references.as_ref())
    }

    /// Download `info` into `sink`. Returns the number of bytes written.
    ///
    /// The first chunk is fetched on its own; a short first chunk ends the
    /// download. The rest run with up to `download_parallel_chunks` in
    /// flight, or one at a time for secret-chat files and non-seekable
    /// sinks.
    pub async fn download(
        &self,
        info: &DownloadInfo,
        sink: Arc<dyn ChunkSink>,
        opts: DownloadOptions,
    ) -> Result<u64, InvocationError> {
        let settings = &self.inner.settings;
        let end = opts.end.or(info.size);
        let part_size = opts.part_size
            .or(Some(settings.download_part_size))
            .filter(|&p| p > 0)
            .unwrap_or(DOWNLOAD_PART_SIZE);
        let dc = info.dc_id
            .or_else(|| self.authorized_dc())
            .ok_or_else(|| InvocationError::Usage("no datacenter to download from".into()))?;

        let mut seekable = opts.seekable;
        let cipher = match &info.key {
            Some(key) => {
                key.check()?;
                if opts.offset != 0 {
                    return Err(InvocationError::Usage("encrypted files can only be downloaded from the start".into()));
                }
                seekable = false;
                Some(Mutex::new(key.cipher()))
            }
            None => None,
        };

        let ranges = download_ranges(opts.offset, end, part_size);
        let tracker = Tracker::new("Download", ranges.len(), opts.progress.clone());
        let Some((&first, rest)) = ranges.split_first() else {
            tracker.finish();
            return Ok(0);
        };

        tracing::info!(
            "[files] downloading {} from DC{dc} in {} chunks of {part_size}",
            end.map_or_else(|| "unknown size".to_string(), |e| format!("{} bytes", e - opts.offset.min(e))),
            ranges.len()
        );
        let transfer = Arc::new(Transfer {
            engine:   self.clone(),
            location: info.location.clone(),
            route:    Mutex::new(Route { dc, origin: None, cdn: None }),
            cipher,
            sink,
            tracker,
            scope:    CdnScope::new(Arc::clone(&self.inner.cdn_hashes)),
        });

        let mut total = transfer.fetch(first).await? as u64;
        if total as usize != first.wanted() {
            tracing::debug!("[files] premature end after {total} bytes");
            transfer.tracker.finish();
            return Ok(total);
        }

        let window = if seekable { settings.download_parallel_chunks.max(1) } else { 1 };
        let mut tasks = JoinSet::new();
        let mut short = false;
        for &range in rest {
            while tasks.len() >= window {
                if let Some(res) = tasks.join_next().await {
                    let (wanted, got) = join_result(res)?;
                    total += got as u64;
                    short |= got < wanted;
                }
            }
            if short && end.is_none() {
                break;
            }
            let transfer = Arc::clone(&transfer);
            tasks.spawn(async move {
                let got = transfer.fetch(range).await?;
                Ok((range.wanted(), got))
            });
        }
        while let Some(res) = tasks.join_next().await {
            let (_, got) = join_result(res)?;
            total += got as u64;
        }
        transfer.tracker.finish();
        Ok(total)
    }

    /// Resolve `media` and download it into `sink`.
    pub async fn download_media(
        &self,
        media: &Value,
        sink:  Arc<dyn ChunkSink>,
        opts:  DownloadOptions,
    ) -> Result<u64, InvocationError> {
        let info = self.get_download_info(media)?;
        self.download(&info, sink, opts).await
    }

    /// Download into memory.
    pub async fn download_to_vec(&self, info: &DownloadInfo, opts: DownloadOptions) -> Result<Vec<u8>, InvocationError> {
        let sink = Arc::new(MemorySink::new(opts.offset));
        let written = self.download(info, Arc::clone(&sink) as Arc<dyn ChunkSink>, opts).await?;
        let mut out = Arc::try_unwrap(sink).map_or_else(|s| s.snapshot(), MemorySink::into_inner);
        out.truncate(written as usize);
        Ok(out)
    }
}
