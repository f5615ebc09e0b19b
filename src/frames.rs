//! Frame ring buffer.
//!
//! The DMA region is divided into `count` frames of `frame_size` bytes (the
//! payload size `data_size` rounded up to the DMA alignment). The card writes
//! frames at `head`; readers consume them from `tail`. The ring is empty when
//! `head == tail` and full when advancing `head` would make it equal `tail`,
//! so it holds at most `count - 1` frames.
//!
//! There is a single producer, the dispatcher, and it never blocks. The
//! indices are atomics: the producer publishes `head` with `Release` ordering
//! after the frame contents are in memory and the consumer loads it with
//! `Acquire` before reading them; the consumer publishes `tail` in the same
//! way. The partially-read offset and the ring geometry are consumer-side
//! state kept behind a mutex that the producer never takes.

use crate::dmabuf::DmaRegion;
use crate::error::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Default DMA alignment of frames.
pub const DMA_ALIGN: usize = 1024;

/// First word of the synthetic frame written by
/// [`FrameBuffer::inject_stop_frame`].
pub const STOP_FRAME_WORD0: u32 = 1;
/// Second word of the synthetic stop frame.
pub const STOP_FRAME_WORD1: u32 = 0x3333_3333;

/// Returns `true` if a batch moving the head from `head` to `new_head` is
/// consistent with the tail `tail`.
///
/// A batch is consistent when walking forward from `tail` reaches `head` no
/// later than `new_head`. Exactly two of the three orderings below hold in
/// that case (all three cannot hold at once, and any two of them imply the
/// cyclic order).
pub fn batch_in_order(new_head: usize, head: usize, tail: usize) -> bool {
    let orderings =
        usize::from(new_head >= head) + usize::from(head >= tail) + usize::from(tail > new_head);
    orderings == 2
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Geometry {
    data_size: usize,
    frame_size: usize,
    count: usize,
}

impl Geometry {
    fn new(data_size: usize, align: usize, region_size: usize) -> Result<Geometry> {
        if data_size == 0 || align == 0 {
            return Err(Error::InvalidSize(data_size));
        }
        let frame_size = data_size
            .checked_next_multiple_of(align)
            .ok_or(Error::InvalidSize(data_size))?;
        let count = region_size / frame_size;
        if count < 2 {
            tracing::error!(
                "frame size {frame_size:#x} leaves fewer than 2 frames in {region_size:#x} bytes"
            );
            return Err(Error::InvalidSize(data_size));
        }
        Ok(Geometry {
            data_size,
            frame_size,
            count,
        })
    }
}

#[derive(Debug)]
struct Consumer {
    geometry: Geometry,
    partial: usize,
}

/// Snapshot of the state of a frame ring.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct FrameStatus {
    /// Number of frame slots.
    pub count: usize,
    /// Maximum number of frames held at once.
    pub capacity: usize,
    /// Payload bytes per frame.
    pub data_size: usize,
    /// Stride between frames in bytes.
    pub frame_size: usize,
    /// Head index.
    pub head: usize,
    /// Tail index.
    pub tail: usize,
    /// Bytes already read from the frame at `tail`.
    pub partial: usize,
    /// Frames dropped because the ring was full.
    pub dropped: u64,
    /// Inconsistent batches detected.
    pub overruns: u64,
    /// Bus address of the ring.
    pub bus_addr: u64,
}

/// Frame ring buffer in a DMA region.
#[derive(Debug)]
pub struct FrameBuffer {
    region: Box<dyn DmaRegion>,
    align: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    // mirrors of the consumer-side geometry, readable by the producer
    count: AtomicUsize,
    frame_size: AtomicUsize,
    dropped: AtomicU64,
    overruns: AtomicU64,
    // set by the producer when it moves the tail
    resync: AtomicBool,
    consumer: Mutex<Consumer>,
    readable: Notify,
    grant: Notify,
}

impl FrameBuffer {
    /// Creates an empty ring of frames carrying `data_size` bytes each, with
    /// frames aligned to `align` bytes.
    pub fn new(region: Box<dyn DmaRegion>, data_size: usize, align: usize) -> Result<FrameBuffer> {
        let geometry = Geometry::new(data_size, align, region.len())?;
        tracing::info!(
            "frame buffer: {} frames of {:#x} bytes ({:#x} bytes data) at {:#x}",
            geometry.count,
            geometry.frame_size,
            geometry.data_size,
            region.bus_addr()
        );
        Ok(FrameBuffer {
            region,
            align,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            count: AtomicUsize::new(geometry.count),
            frame_size: AtomicUsize::new(geometry.frame_size),
            dropped: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            resync: AtomicBool::new(false),
            consumer: Mutex::new(Consumer {
                geometry,
                partial: 0,
            }),
            readable: Notify::new(),
            grant: Notify::new(),
        })
    }

    /// Gives the number of frame slots.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Gives the maximum number of frames the ring holds at once.
    pub fn capacity(&self) -> usize {
        self.count() - 1
    }

    /// Gives the stride between frames in bytes.
    pub fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::Acquire)
    }

    /// Gives the payload size of a frame in bytes.
    pub fn data_size(&self) -> usize {
        self.consumer.lock().unwrap().geometry.data_size
    }

    /// Gives the head index.
    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Gives the tail index.
    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    /// Gives the number of frames dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Gives the number of inconsistent batches detected.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Gives the bus address of the ring.
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Gives the bus address of the frame at `head`.
    pub fn frame_address(&self) -> u64 {
        self.bus_addr() + (self.frame_size() * self.head()) as u64
    }

    /// Gives the number of unread payload bytes.
    pub fn buffered(&self) -> usize {
        let consumer = self.consumer.lock().unwrap();
        let count = consumer.geometry.count;
        let frames = (self.head() + count - self.tail()) % count;
        (frames * consumer.geometry.data_size).saturating_sub(consumer.partial)
    }

    /// Returns `true` if at least one frame is available.
    pub fn poll(&self) -> bool {
        self.tail() != self.head()
    }

    /// Records one frame written by the card at `head`.
    ///
    /// If the ring is full the frame is dropped and counted. Returns `true` if
    /// the frame was kept. The consumer is woken in both cases.
    pub fn produce_one(&self) -> bool {
        let count = self.count();
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % count;
        let kept = if next == self.tail.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            self.head.store(next, Ordering::Release);
            true
        };
        self.readable.notify_one();
        kept
    }

    /// Records the frames written by the card up to (excluding) `new_head`.
    ///
    /// If the new head is not consistent with the current indices, the card
    /// has overwritten unread frames: the ring is resynchronized so that it
    /// holds the most recent frames, and the overrun is counted and logged.
    /// Returns `true` if the batch was consistent.
    ///
    /// The consumer and the grant task are woken in all cases.
    pub fn produce_batch(&self, new_head: usize) -> bool {
        let count = self.count();
        let consistent = if new_head >= count {
            tracing::error!("head index {new_head} out of range for {count} frames");
            false
        } else {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if batch_in_order(new_head, head, tail) {
                self.head.store(new_head, Ordering::Release);
                true
            } else {
                let overruns = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(
                    "buffer trashed! head={head} tail={tail} new_head={new_head} (overrun {overruns})"
                );
                self.resync.store(true, Ordering::Release);
                self.tail.store((new_head + 1) % count, Ordering::Release);
                self.head.store(new_head, Ordering::Release);
                false
            }
        };
        self.grant.notify_one();
        self.readable.notify_one();
        consistent
    }

    /// Copies available payload bytes into `dest` without waiting.
    ///
    /// Copying resumes from where the previous read stopped within the frame
    /// at `tail`. Each completed frame advances `tail`. Stops when `dest` is
    /// full or no frames are left, and returns the number of bytes copied
    /// (0 if the ring is empty).
    pub fn consume(&self, dest: &mut [u8]) -> usize {
        let mut consumer = self.consumer.lock().unwrap();
        if self.resync.swap(false, Ordering::AcqRel) {
            consumer.partial = 0;
        }
        let Geometry {
            data_size,
            frame_size,
            count,
        } = consumer.geometry;
        let mut copied = 0;
        while copied < dest.len() {
            let tail = self.tail.load(Ordering::Acquire);
            if tail == self.head.load(Ordering::Acquire) {
                break;
            }
            let n = (data_size - consumer.partial).min(dest.len() - copied);
            // SAFETY: the geometry keeps tail * frame_size + data_size within
            // the region, and the frame at tail is not written by the card
            // while it is owned by the consumer.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.region
                        .as_ptr()
                        .add(tail * frame_size + consumer.partial),
                    dest[copied..].as_mut_ptr(),
                    n,
                );
            }
            copied += n;
            consumer.partial += n;
            if consumer.partial >= data_size {
                self.release(&mut consumer, tail, count);
            }
        }
        copied
    }

    // Moves the tail past the frame at `tail`, unless the producer has
    // resynchronized the ring since `tail` was loaded.
    fn release(&self, consumer: &mut Consumer, tail: usize, count: usize) {
        consumer.partial = 0;
        if self
            .tail
            .compare_exchange(tail, (tail + 1) % count, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the frame was overwritten and is already behind the new tail
            self.resync.store(false, Ordering::Release);
        }
    }

    /// Reads payload bytes into `dest`.
    ///
    /// Unless `nonblock` is set, this waits until at least one frame is
    /// available. Returns the number of bytes copied.
    pub async fn read(&self, dest: &mut [u8], nonblock: bool) -> usize {
        if !nonblock {
            self.wait_readable().await;
        }
        self.consume(dest)
    }

    /// Waits until at least one frame is available.
    pub async fn wait_readable(&self) {
        loop {
            let notified = self.readable.notified();
            if self.poll() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the producer has recorded a batch.
    pub async fn wait_grant(&self) {
        self.grant.notified().await;
    }

    /// Drops the frame at `tail`, including any part of it already read.
    pub fn advance_tail(&self) -> Result<()> {
        let mut consumer = self.consumer.lock().unwrap();
        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return Err(Error::Empty);
        }
        let count = consumer.geometry.count;
        self.release(&mut consumer, tail, count);
        Ok(())
    }

    /// Changes the payload size of the frames.
    ///
    /// The ring must be empty. On success the ring is re-divided and its
    /// indices are reset; on failure nothing changes.
    pub fn resize(&self, data_size: usize) -> Result<()> {
        let mut consumer = self.consumer.lock().unwrap();
        if data_size == consumer.geometry.data_size {
            return Ok(());
        }
        if self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire) {
            tracing::error!("cannot change frame size of a non-empty buffer");
            return Err(Error::Busy);
        }
        let geometry = Geometry::new(data_size, self.align, self.region.len())?;
        consumer.geometry = geometry;
        consumer.partial = 0;
        self.count.store(geometry.count, Ordering::Release);
        self.frame_size
            .store(geometry.frame_size, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        tracing::info!(
            "frame buffer resized: {} frames of {:#x} bytes ({:#x} bytes data)",
            geometry.count,
            geometry.frame_size,
            geometry.data_size
        );
        Ok(())
    }

    /// Empties the ring and clears its counters.
    pub fn reset(&self) {
        let mut consumer = self.consumer.lock().unwrap();
        consumer.partial = 0;
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.resync.store(false, Ordering::Release);
    }

    /// Writes frame contents at slot `index`, as the card does by DMA.
    ///
    /// At most `frame_size` bytes of `data` are written.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot.
    pub fn write_frame(&self, index: usize, data: &[u8]) {
        let count = self.count();
        assert!(index < count, "frame index {index} out of range ({count})");
        let frame_size = self.frame_size();
        let n = data.len().min(frame_size);
        // SAFETY: index < count keeps the write inside the region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.as_ptr().add(index * frame_size),
                n,
            );
        }
    }

    /// Appends a synthetic stop frame.
    ///
    /// This releases a reader waiting for data when an acquisition is aborted.
    /// Returns `true` if the frame was kept.
    pub fn inject_stop_frame(&self) -> bool {
        let mut words = [0u8; 8];
        words[..4].copy_from_slice(&STOP_FRAME_WORD0.to_le_bytes());
        words[4..].copy_from_slice(&STOP_FRAME_WORD1.to_le_bytes());
        let data_size = self.data_size();
        self.write_frame(self.head(), &words[..data_size.min(words.len())]);
        self.produce_one()
    }

    /// Gives a snapshot of the ring state.
    pub fn status(&self) -> FrameStatus {
        let consumer = self.consumer.lock().unwrap();
        FrameStatus {
            count: consumer.geometry.count,
            capacity: consumer.geometry.count - 1,
            data_size: consumer.geometry.data_size,
            frame_size: consumer.geometry.frame_size,
            head: self.head(),
            tail: self.tail(),
            partial: consumer.partial,
            dropped: self.dropped(),
            overruns: self.overruns(),
            bus_addr: self.bus_addr(),
        }
    }
}
