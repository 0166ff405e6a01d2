//! Outbound frame queue with high/low water mark backpressure.
//!
//! The connection handler pushes every echoed frame here and drains it into
//! the socket as write capacity becomes available. Once queued bytes reach
//! the high water mark the queue reports itself as paused, and the handler
//! stops reading from the peer. Reads resume only after the queue drains to
//! the low water mark, so a slow consumer holds at most roughly
//! `high + one frame` bytes of echo data in memory.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Default high water mark (1 MiB of queued frames).
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;

/// Default low water mark (256 KiB of queued frames).
pub const DEFAULT_LOW_WATER_MARK: usize = 256 * 1024;

/// Queue thresholds that trigger pausing and resuming reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterMarks {
    /// Pause reads once queued bytes reach this value.
    pub high: usize,
    /// Resume reads once queued bytes drain to this value.
    pub low: usize,
}

impl Default for WaterMarks {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_WATER_MARK,
            low: DEFAULT_LOW_WATER_MARK,
        }
    }
}

/// FIFO of encoded frames awaiting a write.
#[derive(Debug)]
pub struct WriteQueue {
    frames: VecDeque<Bytes>,
    queued: usize,
    marks: WaterMarks,
    paused: bool,
    peak: usize,
    pauses: u64,
}

impl WriteQueue {
    pub fn new(marks: WaterMarks) -> Self {
        Self {
            frames: VecDeque::new(),
            queued: 0,
            marks,
            paused: false,
            peak: 0,
            pauses: 0,
        }
    }

    /// Enqueue an encoded frame.
    ///
    /// Returns `true` if this push crossed the high water mark and reads
    /// should now pause.
    pub fn push(&mut self, frame: Bytes) -> bool {
        self.queued += frame.len();
        self.peak = self.peak.max(self.queued);
        self.frames.push_back(frame);

        if !self.paused && self.queued >= self.marks.high {
            self.paused = true;
            self.pauses += 1;
            trace!(queued = self.queued, high = self.marks.high, "Write queue above high water mark");
            return true;
        }
        false
    }

    /// Write as much of the front frame as the writer accepts.
    ///
    /// Cancel safe: bytes are only accounted for once the underlying write
    /// has completed. Returns `Ok(0)` when the queue is empty.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(front) = self.frames.front_mut() else {
            return Ok(0);
        };

        let n = writer.write_buf(front).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        if !front.has_remaining() {
            self.frames.pop_front();
        }
        self.consumed(n);
        Ok(n)
    }

    /// Write every queued frame.
    pub async fn flush_all<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while !self.is_empty() {
            self.write_to(writer).await?;
        }
        writer.flush().await
    }

    fn consumed(&mut self, n: usize) {
        self.queued -= n;
        if self.paused && self.queued <= self.marks.low {
            self.paused = false;
            trace!(queued = self.queued, low = self.marks.low, "Write queue drained to low water mark");
        }
    }

    /// Drop every pending frame without writing it.
    pub fn discard(&mut self) -> usize {
        let dropped = self.queued;
        self.frames.clear();
        self.queued = 0;
        self.paused = false;
        dropped
    }

    /// Whether reads should currently be paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames waiting (partially written frames included).
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Bytes not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    /// Largest number of bytes ever queued at once.
    pub fn peak_bytes(&self) -> usize {
        self.peak
    }

    /// How many times the high water mark was crossed.
    pub fn pause_count(&self) -> u64 {
        self.pauses
    }
}
