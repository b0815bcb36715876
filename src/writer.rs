//! Dedicated writer task for outbound SysEx frames.
//!
//! Every request, from any task, goes through one mpsc channel to a single
//! writer task. Frames therefore reach the transport whole and in order,
//! never interleaved, and frames queued together are written in one batch.
//!
//! # Architecture
//!
//! ```text
//! call()  ─┐
//! send()  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► MIDI out
//! ping()  ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{K2Error, Result};

/// Queued frames at which senders start waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// How long a sender waits for the queue to drain.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames coalesced into one vectored write.
const MAX_BATCH_SIZE: usize = 32;

/// A complete encoded frame ready for the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// `F0 … F7` bytes.
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Total size of this frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Outbound queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Queued frames at which senders start waiting.
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    /// How long a sender waits for the queue to drain.
    #[serde(rename = "backpressure_timeout_ms", with = "crate::config::duration_ms")]
    pub backpressure_timeout: Duration,
    /// Pause after each frame. Zero batches queued frames into one write;
    /// anything else sends them one at a time for interfaces that drop
    /// back-to-back SysEx.
    #[serde(rename = "frame_gap_ms", with = "crate::config::duration_ms")]
    pub frame_gap: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            frame_gap: Duration::ZERO,
        }
    }
}

/// Cloneable sender side of the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet written.
    queued: Arc<AtomicUsize>,
    high_water: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        queued: Arc<AtomicUsize>,
        high_water: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            queued,
            high_water,
            timeout,
        }
    }

    /// Queue a frame, waiting up to the backpressure timeout while the
    /// queue is at its high-water mark.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.drain_wait().await?;
        }

        // Counted first: the writer may finish the frame before send returns.
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Release);
            K2Error::Disconnected
        })
    }

    async fn drain_wait(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        while self.is_backpressure_active() {
            if Instant::now() >= deadline {
                warn!(
                    "Outbound queue stuck at {} frames for {:?}",
                    self.pending_count(),
                    self.timeout
                );
                return Err(K2Error::Backpressure);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.high_water
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame, failing with `Backpressure` instead of waiting.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(K2Error::Backpressure);
        }

        self.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => K2Error::Backpressure,
                mpsc::error::TrySendError::Closed(_) => K2Error::Disconnected,
            }
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every handle is dropped, or with an error
/// when the transport fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let queued = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        queued.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );
    let task = tokio::spawn(writer_loop(rx, writer, queued, config.frame_gap));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    queued: Arc<AtomicUsize>,
    frame_gap: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let batch_limit = if frame_gap.is_zero() { MAX_BATCH_SIZE } else { 1 };
    let mut batch = Vec::with_capacity(batch_limit);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < batch_limit {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let written = write_batch(&mut writer, &batch).await;
        queued.fetch_sub(batch.len(), Ordering::Release);
        batch.clear();
        written?;

        if !frame_gap.is_zero() {
            tokio::time::sleep(frame_gap).await;
        }
    }

    debug!("Outbound channel closed, shutting down transport");
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write whole frames with one vectored write where the transport allows.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut done = 0;

    while done < total {
        let slices = build_remaining_slices(batch, done);
        match writer.write_vectored(&slices).await? {
            0 => {
                return Err(K2Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                )))
            }
            n => done += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering what is left of `batch` after `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut start = 0;

    for frame in batch {
        let end = start + frame.size();
        if skip_bytes < end {
            let from = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame.bytes[from..]));
        }
        start = end;
    }

    slices
}
