//! Transfer progress samples.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// One progress report.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProgressSample {
    /// 0 to 100.
    pub percent:    f64,
    /// Megabits per second since the transfer started.
    pub speed_mbps: f64,
    pub elapsed:    Duration,
}

pub type ProgressSender = watch::Sender<ProgressSample>;
pub type ProgressReceiver = watch::Receiver<ProgressSample>;

/// A fresh progress channel, starting at 0%.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    watch::channel(ProgressSample::default())
}

/// Counts finished parts of one transfer and publishes samples.
///
/// Without a subscriber the samples only go to the log.
pub(crate) struct Tracker {
    kind:    &'static str,
    total:   usize,
    done:    AtomicUsize,
    bytes:   AtomicU64,
    started: Instant,
    tx:      Option<ProgressSender>,
}

impl Tracker {
    pub(crate) fn new(kind: &'static str, total: usize, tx: Option<ProgressSender>) -> Self {
        Self {
            kind,
            total,
            done:    AtomicUsize::new(0),
            bytes:   AtomicU64::new(0),
            started: Instant::now(),
            tx,
        }
    }

    /// One more part of `len` bytes is done.
    pub(crate) fn advance(&self, len: usize) -> ProgressSample {
        let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
        let bytes = self.bytes.fetch_add(len as u64, Ordering::AcqRel) + len as u64;
        let percent = if self.total == 0 { 100.0 } else { (done * 100) as f64 / self.total as f64 };
        let sample = self.sample(percent.min(100.0), bytes);
        tracing::debug!("[files] {} status: {:.0}%", self.kind, sample.percent);
        self.publish(sample);
        sample
    }

    /// Report completion and log the totals.
    pub(crate) fn finish(&self) -> ProgressSample {
        let sample = self.sample(100.0, self.bytes());
        tracing::info!(
            "[files] {} finished: {} bytes in {:.2?} ({:.2} Mbps)",
            self.kind, self.bytes(), sample.elapsed, sample.speed_mbps
        );
        self.publish(sample);
        sample
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn sample(&self, percent: f64, bytes: u64) -> ProgressSample {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let speed_mbps = if secs > 0.0 { bytes as f64 * 8.0 / secs / 1_000_000.0 } else { 0.0 };
        ProgressSample { percent, speed_mbps, elapsed }
    }

    fn publish(&self, sample: ProgressSample) {
        if let Some(tx) = &self.tx {
            tx.send_replace(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn samples_reach_the_subscriber() {
        let (tx, rx) = channel();
        let t = Tracker::new("Upload", 4, Some(tx));
        t.advance(10);
        assert_eq!(rx.borrow().percent, 25.0);
        t.advance(10);
        t.advance(10);
        assert_eq!(t.advance(10).percent, 100.0);
        assert_eq!(t.bytes(), 40);
        assert_eq!(t.finish().percent, 100.0);
    }

    #[tokio::test]
    async fn empty_transfer_is_complete() {
        let t = Tracker::new("Download", 0, None);
        assert_eq!(t.advance(0).percent, 100.0);
    }
}
