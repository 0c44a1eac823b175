//! Piping a download straight into an upload.
//!
//! The [`Bridge`] has one pair of one-shot barriers per part. The download
//! side's `write` of part `n` releases the upload side's `read` of part `n`,
//! then waits until the server has accepted one more uploaded part. At most
//! one unacknowledged part sits in memory per download task.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use layer_tl_types::Value;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::download::DownloadOptions;
use super::progress::ProgressSender;
use super::upload::{UploadOptions, UploadedFile};
use super::{ChunkSink, ChunkSource, UPLOAD_PART_SIZE, part_count, part_len};
use crate::Engine;
use crate::errors::InvocationError;
use crate::socket::BoxFuture;

struct Slot {
    len:     usize,
    data_tx: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    data_rx: Mutex<Option<oneshot::Receiver<Vec<u8>>>>,
    ack_tx:  Mutex<Option<oneshot::Sender<usize>>>,
    ack_rx:  Mutex<Option<oneshot::Receiver<usize>>>,
}

pub(crate) struct Bridge {
    part_size: usize,
    slots:     Vec<Slot>,
    acks:      AtomicUsize,
}

impl Bridge {
    pub(crate) fn new(size: u64, part_size: usize) -> Self {
        let slots = (0..part_count(size, part_size))
            .map(|i| {
                let (data_tx, data_rx) = oneshot::channel();
                let (ack_tx, ack_rx) = oneshot::channel();
                Slot {
                    len:     part_len(size, part_size, i),
                    data_tx: Mutex::new(Some(data_tx)),
                    data_rx: Mutex::new(Some(data_rx)),
                    ack_tx:  Mutex::new(Some(ack_tx)),
                    ack_rx:  Mutex::new(Some(ack_rx)),
                }
            })
            .collect();
        Self { part_size, slots, acks: AtomicUsize::new(0) }
    }

    fn slot(&self, offset: u64) -> Result<&Slot, InvocationError> {
        let idx = (offset / self.part_size as u64) as usize;
        self.slots.get(idx)
            .ok_or_else(|| InvocationError::Usage(format!("offset {offset} is past the end of the bridged file")))
    }

    fn reused(offset: u64) -> InvocationError {
        InvocationError::Usage(format!("part at {offset} was already bridged"))
    }
}

impl ChunkSource for Bridge {
    fn read(&self, offset: u64, _len: usize) -> BoxFuture<'_, Result<Vec<u8>, InvocationError>> {
        Box::pin(async move {
            let rx = self.slot(offset)?.data_rx.lock().take().ok_or_else(|| Self::reused(offset))?;
            rx.await.map_err(|_| InvocationError::Dropped)
        })
    }

    fn acked(&self) {
        let idx = self.acks.fetch_add(1, Ordering::AcqRel);
        if let Some(slot) = self.slots.get(idx) {
            if let Some(tx) = slot.ack_tx.lock().take() {
                let _ = tx.send(slot.len);
            }
        }
    }
}

impl ChunkSink for Bridge {
    fn write(&self, offset: u64, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), InvocationError>> {
        Box::pin(async move {
            let slot = self.slot(offset)?;
            let tx = slot.data_tx.lock().take().ok_or_else(|| Self::reused(offset))?;
            tx.send(bytes).map_err(|_| InvocationError::Dropped)?;
            let ack = slot.ack_rx.lock().take().ok_or_else(|| Self::reused(offset))?;
            ack.await.map_err(|_| InvocationError::Dropped)?;
            Ok(())
        })
    }
}

impl Engine {
    /// Upload a file that is already on the server without buffering it.
    ///
    /// The download and the upload run side by side, 512 KiB at a time.
    /// `media` must resolve to something with a known size and mime type.
    pub async fn reupload(
        &self,
        media:     &Value,
        encrypted: bool,
        progress:  Option<ProgressSender>,
    ) -> Result<UploadedFile, InvocationError> {
        let info = self.get_download_info(media)?;
        let size = match info.size {
            Some(size) if !info.mime.is_empty() => size,
            _ => return Err(InvocationError::Usage("Wrong file provided!".into())),
        };
        tracing::info!("[files] reuploading {} ({size} bytes)", info.file_name());

        let bridge = Arc::new(Bridge::new(size, UPLOAD_PART_SIZE));
        let mut up_opts = UploadOptions::new(info.file_name(), info.mime.clone()).encrypted(encrypted);
        up_opts.progress = progress;
        let down_opts = DownloadOptions::default().part_size(UPLOAD_PART_SIZE);

        let upload = self.upload(Arc::clone(&bridge) as Arc<dyn ChunkSource>, size, up_opts);
        let download = self.download(&info, bridge as Arc<dyn ChunkSink>, down_opts);
        let (file, _) = tokio::try_join!(upload, download)?;
        Ok(file)
    }
}
