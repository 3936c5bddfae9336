//! The two streaming upload policies
//!
//! Both policies hand out `(ring, offset)` reservations the render loop
//! writes into, batch the device-side copies on the shared encoder, and
//! drain everything at the frame-end flush. They differ in buffer lifetime:
//!
//! ```text
//! Sync:   allocate -> new exact-size buffer -> flush -> submit -> destroy
//! Async:  allocate -> front of MappedQueue  -> flush -> submit -> async remap
//!                         ^                                          |
//!                         +---- completion (drained on poll) --------+
//! ```
//!
//! The synchronous policy enforces the pool byte cap and reports
//! exhaustion to the caller, who skips the write for this frame; the
//! asynchronous policy enforces a buffer count cap and blocks, polling
//! the device, until a completion recycles a buffer. Either way a byte
//! range has at most one writer or one reader at a time: async buffers
//! stay unusable until their completion fires, sync buffers are never
//! reused at all.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use crate::gpu::{BufferId, GpuDevice, GpuError, GpuResult};

use super::{
    BufferPool, RingBuffer, RingId, BUFFER_MAX_COUNT, BUFFER_PER_ALLOCATE_SIZE,
};

/// Interval between device polls while the async policy waits for a recycle
const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Upload discipline, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// One-shot, synchronously mapped buffers destroyed every frame
    Sync,
    /// Persistent fixed-size buffers recycled through async map completions
    Async,
}

/// A reservation inside a ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAlloc {
    /// Ring holding the reserved range
    pub ring: RingId,
    /// Byte offset of the reserved range within the ring
    pub offset: u64,
}

/// Counters kept by both policies, reported by the benchmark at exit
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    /// Device buffers created over the lifetime of the allocator
    pub buffers_created: u64,
    /// Buffers recycled through an async map completion
    pub buffers_recycled: u64,
    /// Mapped-queue fronts retired with free space left ("bubbles")
    pub retired_with_space: u64,
    /// Allocations refused because the byte cap would be exceeded
    pub exhausted_allocations: u64,
    /// Allocations that had to block on the backpressure path
    pub blocked_allocations: u64,
    /// Total bytes pushed through the allocator
    pub bytes_streamed: u64,
}

/// Per-frame streaming allocation interface shared by both policies
pub trait StreamingAllocator {
    /// Reserve `size` bytes of host-writable staging space
    ///
    /// Returns `Ok(None)` when the synchronous pool is exhausted; the
    /// caller skips this frame's write and stale data stays on screen.
    /// The asynchronous policy never returns `None`; it blocks until a
    /// buffer is recycled.
    fn allocate(&mut self, device: &mut dyn GpuDevice, size: u64) -> GpuResult<Option<StreamAlloc>>;

    /// Write `data` at `src_offset` inside a reserved ring and record the
    /// copy into `dst` at `dst_offset`
    fn push(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: RingId,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        data: &[u8],
    ) -> GpuResult<()>;

    /// End the frame: unmap touched buffers, submit the batched copies and
    /// retire or recycle the buffers per policy
    fn flush(&mut self, device: &mut dyn GpuDevice) -> GpuResult<()>;

    /// Lifetime counters
    fn stats(&self) -> &StreamStats;

    /// Release every buffer owned by the allocator
    fn destroy(&mut self, device: &mut dyn GpuDevice);
}

/// Construct the policy selected at startup
#[must_use]
pub fn new_streaming_allocator(mode: UploadMode, pool_capacity: u64) -> Box<dyn StreamingAllocator> {
    match mode {
        UploadMode::Sync => Box::new(SyncStreamingAllocator::new(pool_capacity)),
        UploadMode::Async => Box::new(AsyncStreamingAllocator::new(
            BUFFER_MAX_COUNT,
            BUFFER_PER_ALLOCATE_SIZE,
        )),
    }
}

fn push_through_pool(
    pool: &BufferPool,
    device: &mut dyn GpuDevice,
    ring: RingId,
    dst: BufferId,
    src_offset: u64,
    dst_offset: u64,
    data: &[u8],
) -> GpuResult<()> {
    let entry = pool.get(ring).ok_or(GpuError::ResourceNotFound)?;
    entry.push(device, dst, src_offset, dst_offset, data)
}

/// One-shot policy: every reservation gets its own exactly-sized buffer
///
/// No buffer survives past the frame that created it, so there is no
/// persistent-mapping bookkeeping at all; the cost is continuous device
/// buffer creation and destruction.
pub struct SyncStreamingAllocator {
    pool: BufferPool,
    stats: StreamStats,
}

impl SyncStreamingAllocator {
    /// Create the policy with the given pool byte cap
    #[must_use]
    pub fn new(pool_capacity: u64) -> Self {
        Self {
            pool: BufferPool::new(pool_capacity),
            stats: StreamStats::default(),
        }
    }

    /// Bytes currently accounted against the cap
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.pool.used_bytes()
    }
}

impl StreamingAllocator for SyncStreamingAllocator {
    fn allocate(&mut self, device: &mut dyn GpuDevice, size: u64) -> GpuResult<Option<StreamAlloc>> {
        if self.pool.would_exceed(size) {
            log::warn!(
                "streaming pool exhausted: {} + {} > {} bytes, write skipped this frame",
                self.pool.used_bytes(),
                size,
                self.pool.capacity_limit()
            );
            self.stats.exhausted_allocations += 1;
            return Ok(None);
        }

        let mut ring = RingBuffer::create(device, size)?;
        let offset = ring.allocate(size);
        let id = self.pool.insert(ring);
        self.pool.enqueue(id);
        self.stats.buffers_created += 1;
        Ok(Some(StreamAlloc { ring: id, offset }))
    }

    fn push(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: RingId,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        data: &[u8],
    ) -> GpuResult<()> {
        push_through_pool(&self.pool, device, ring, dst, src_offset, dst_offset, data)?;
        self.stats.bytes_streamed += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self, device: &mut dyn GpuDevice) -> GpuResult<()> {
        self.pool.flush(device);
        device.submit()?;
        for id in self.pool.take_enqueued() {
            self.pool.destroy_buffer(device, id);
        }
        debug_assert_eq!(self.pool.used_bytes(), 0);
        Ok(())
    }

    fn stats(&self) -> &StreamStats {
        &self.stats
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.pool.destroy_all(device);
    }
}

/// Recycling policy: a bounded set of persistent fixed-size buffers
///
/// Host-writable buffers wait in a FIFO. The front is used until it lacks
/// room for a request, then retired for the rest of the frame even when a
/// buffer further back still has space; with uniform per-instance request
/// sizes the wasted tail is negligible and the queue discipline stays
/// trivial, so the discard is kept as-is rather than searched around.
pub struct AsyncStreamingAllocator {
    pool: BufferPool,
    mapped_queue: VecDeque<RingId>,
    completion_tx: Sender<RingId>,
    completion_rx: Receiver<RingId>,
    max_buffers: usize,
    buffer_size: u64,
    stats: StreamStats,
}

impl AsyncStreamingAllocator {
    /// Create the policy with an explicit buffer count cap and buffer size
    #[must_use]
    pub fn new(max_buffers: usize, buffer_size: u64) -> Self {
        let (completion_tx, completion_rx) = channel();
        Self {
            // The byte cap is a sync-policy concept; unlimited here.
            pool: BufferPool::new(u64::MAX),
            mapped_queue: VecDeque::new(),
            completion_tx,
            completion_rx,
            max_buffers,
            buffer_size,
            stats: StreamStats::default(),
        }
    }

    /// Number of buffers currently host-writable
    #[must_use]
    pub fn mapped_buffer_count(&self) -> usize {
        self.mapped_queue.len()
    }

    /// Number of live buffers, mapped or in flight
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.pool.ring_count()
    }

    /// Borrow the backing pool (ring state inspection)
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn completion_sender(&self) -> Sender<RingId> {
        self.completion_tx.clone()
    }

    /// Move completed remaps back onto the mapped queue
    fn drain_completions(&mut self) {
        while let Ok(id) = self.completion_rx.try_recv() {
            if let Some(ring) = self.pool.get_mut(id) {
                ring.complete_map();
                self.mapped_queue.push_back(id);
                self.stats.buffers_recycled += 1;
            }
        }
    }

    /// Retire queue fronts that cannot hold `size` bytes
    fn retire_short_fronts(&mut self, size: u64) {
        while let Some(&front) = self.mapped_queue.front() {
            let remaining = self.pool.get(front).map_or(0, RingBuffer::remaining);
            if remaining >= size {
                break;
            }
            self.mapped_queue.pop_front();
            // Still holds this frame's writes; flushed and remapped with
            // the rest of the enqueued list.
            self.pool.enqueue(front);
            if remaining > 0 {
                self.stats.retired_with_space += 1;
            }
        }
    }
}

impl StreamingAllocator for AsyncStreamingAllocator {
    fn allocate(&mut self, device: &mut dyn GpuDevice, size: u64) -> GpuResult<Option<StreamAlloc>> {
        if size > self.buffer_size {
            return Err(GpuError::InvalidOperation {
                reason: format!(
                    "request of {} bytes exceeds the fixed buffer size of {}",
                    size, self.buffer_size
                ),
            });
        }

        let mut blocked = false;
        loop {
            self.drain_completions();
            self.retire_short_fronts(size);

            if let Some(&front) = self.mapped_queue.front() {
                let entry = self.pool.get_mut(front).ok_or_else(|| GpuError::InvalidOperation {
                    reason: "mapped queue references a destroyed ring".to_string(),
                })?;
                let offset = entry.allocate(size);
                self.pool.enqueue(front);
                return Ok(Some(StreamAlloc { ring: front, offset }));
            }

            if self.pool.ring_count() < self.max_buffers {
                let mut ring = RingBuffer::create(device, self.buffer_size)?;
                let offset = ring.allocate(size);
                let id = self.pool.insert(ring);
                self.mapped_queue.push_back(id);
                self.pool.enqueue(id);
                self.stats.buffers_created += 1;
                log::debug!(
                    "async streaming: created buffer {}/{} ({} bytes)",
                    self.pool.ring_count(),
                    self.max_buffers,
                    self.buffer_size
                );
                return Ok(Some(StreamAlloc { ring: id, offset }));
            }

            if !blocked {
                blocked = true;
                self.stats.blocked_allocations += 1;
                log::debug!(
                    "async streaming: all {} buffers in flight, waiting for a completion",
                    self.max_buffers
                );
            }
            device.poll()?;
            std::thread::sleep(BACKPRESSURE_POLL_INTERVAL);
        }
    }

    fn push(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: RingId,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        data: &[u8],
    ) -> GpuResult<()> {
        push_through_pool(&self.pool, device, ring, dst, src_offset, dst_offset, data)?;
        self.stats.bytes_streamed += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self, device: &mut dyn GpuDevice) -> GpuResult<()> {
        // The buffer being filled when the frame ends sits at the queue
        // front; pull it out so it goes in flight with the rest.
        if let (Some(&last), Some(&front)) =
            (self.pool.enqueued().last(), self.mapped_queue.front())
        {
            if last == front {
                self.mapped_queue.pop_front();
            }
        }

        self.pool.flush(device);
        device.submit()?;

        for id in self.pool.take_enqueued() {
            let buffer = self
                .pool
                .get(id)
                .ok_or_else(|| GpuError::InvalidOperation {
                    reason: "enqueued ring disappeared before remap".to_string(),
                })?
                .buffer();
            let tx = self.completion_tx.clone();
            device.map_for_write_async(
                buffer,
                Box::new(move || {
                    let _ = tx.send(id);
                }),
            )?;
        }
        Ok(())
    }

    fn stats(&self) -> &StreamStats {
        &self.stats
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.drain_completions();
        self.mapped_queue.clear();
        self.pool.destroy_all(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferUsage, HeadlessDevice};
    use crate::streaming::RingState;

    #[test]
    fn test_sync_byte_cap_scenario() {
        let mut device = HeadlessDevice::new();
        let mut allocator = SyncStreamingAllocator::new(1024);

        let first = allocator.allocate(&mut device, 600).unwrap();
        assert!(first.is_some());
        assert_eq!(allocator.used_bytes(), 600);

        let second = allocator.allocate(&mut device, 600).unwrap();
        assert!(second.is_none());
        assert_eq!(allocator.used_bytes(), 600);
        assert_eq!(allocator.stats().exhausted_allocations, 1);
    }

    #[test]
    fn test_sync_used_bytes_never_exceeds_cap() {
        let mut device = HeadlessDevice::new();
        let mut allocator = SyncStreamingAllocator::new(1024);

        for size in [100, 300, 500, 400, 200, 700] {
            let _ = allocator.allocate(&mut device, size).unwrap();
            assert!(allocator.used_bytes() <= 1024);
        }
    }

    #[test]
    fn test_sync_flush_destroys_every_frame_buffer() {
        let mut device = HeadlessDevice::new();
        let dst = device
            .create_buffer(2048, BufferUsage::TRANSFER_DST)
            .unwrap();
        let mut allocator = SyncStreamingAllocator::new(4096);

        let a = allocator.allocate(&mut device, 512).unwrap().unwrap();
        let b = allocator.allocate(&mut device, 512).unwrap().unwrap();
        allocator
            .push(&mut device, a.ring, dst, a.offset, 0, &[1; 512])
            .unwrap();
        allocator
            .push(&mut device, b.ring, dst, b.offset, 512, &[2; 512])
            .unwrap();

        allocator.flush(&mut device).unwrap();

        assert_eq!(allocator.used_bytes(), 0);
        // Only the destination buffer survives the frame.
        assert_eq!(device.buffer_count(), 1);
        assert_eq!(&device.buffer_contents(dst).unwrap()[..512], &[1u8; 512][..]);
        assert_eq!(&device.buffer_contents(dst).unwrap()[512..1024], &[2u8; 512][..]);
        assert_eq!(allocator.stats().bytes_streamed, 1024);
    }

    #[test]
    fn test_sync_flush_without_allocations_is_noop() {
        let mut device = HeadlessDevice::new();
        let mut allocator = SyncStreamingAllocator::new(1024);
        allocator.flush(&mut device).unwrap();
        assert_eq!(device.submit_count(), 1);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_async_backpressure_scenario() {
        let mut device = HeadlessDevice::new();
        let mut allocator = AsyncStreamingAllocator::new(2, 256);

        let first = allocator.allocate(&mut device, 100).unwrap().unwrap();
        assert_eq!(allocator.buffer_count(), 1);

        // 100 bytes plus offset alignment exhaust a 256-byte buffer, so the
        // second request retires the front and creates a second buffer.
        let second = allocator.allocate(&mut device, 100).unwrap().unwrap();
        assert_eq!(allocator.buffer_count(), 2);
        assert_ne!(first.ring, second.ring);

        // Both buffers are full and the count cap is reached; the third
        // request blocks until a completion recycles the first buffer.
        let sender = allocator.completion_sender();
        let recycled = first.ring;
        let unblocker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sender.send(recycled).unwrap();
        });

        let third = allocator.allocate(&mut device, 100).unwrap().unwrap();
        unblocker.join().unwrap();

        assert_eq!(third.ring, first.ring);
        assert_eq!(allocator.buffer_count(), 2);
        assert_eq!(allocator.stats().blocked_allocations, 1);
        assert_eq!(allocator.stats().buffers_recycled, 1);
    }

    #[test]
    fn test_async_flush_recycles_through_poll() {
        let mut device = HeadlessDevice::new();
        let dst = device
            .create_buffer(1024, BufferUsage::TRANSFER_DST)
            .unwrap();
        let mut allocator = AsyncStreamingAllocator::new(2, 1024);

        let alloc = allocator.allocate(&mut device, 128).unwrap().unwrap();
        allocator
            .push(&mut device, alloc.ring, dst, alloc.offset, 0, &[5; 128])
            .unwrap();
        allocator.flush(&mut device).unwrap();

        // In flight: unmapped, out of the queue, unusable for writes.
        assert_eq!(
            allocator.pool().get(alloc.ring).unwrap().state(),
            RingState::Unmapped
        );
        assert_eq!(allocator.mapped_buffer_count(), 0);
        assert!(device
            .write_mapped(allocator.pool().get(alloc.ring).unwrap().buffer(), 0, &[0])
            .is_err());

        // The frame-end poll fires the completion; the next allocate drains
        // it and recycles the same buffer instead of creating a new one.
        device.poll().unwrap();
        let next = allocator.allocate(&mut device, 128).unwrap().unwrap();
        assert_eq!(next.ring, alloc.ring);
        assert_eq!(allocator.buffer_count(), 1);
        assert_eq!(allocator.stats().buffers_recycled, 1);
        assert_eq!(&device.buffer_contents(dst).unwrap()[..128], &[5u8; 128][..]);
    }

    #[test]
    fn test_async_front_discard_skips_usable_capacity() {
        let mut device = HeadlessDevice::new();
        let mut allocator = AsyncStreamingAllocator::new(4, 1024);

        let first = allocator.allocate(&mut device, 100).unwrap().unwrap();
        let second = allocator.allocate(&mut device, 500).unwrap().unwrap();
        // The front still has room, so it keeps serving requests.
        assert_eq!(first.ring, second.ring);
        assert_eq!(second.offset, 256);

        // 256 bytes remain, but the 300-byte request retires the front for
        // the rest of the frame; the leftover tail is the accepted bubble.
        let third = allocator.allocate(&mut device, 300).unwrap().unwrap();
        assert_ne!(third.ring, first.ring);
        assert_eq!(allocator.buffer_count(), 2);
        assert_eq!(allocator.stats().retired_with_space, 1);
    }

    #[test]
    fn test_async_oversized_request_is_rejected() {
        let mut device = HeadlessDevice::new();
        let mut allocator = AsyncStreamingAllocator::new(2, 256);
        assert!(allocator.allocate(&mut device, 257).is_err());
    }

    #[test]
    fn test_factory_selects_policy() {
        let mut device = HeadlessDevice::new();

        let mut sync = new_streaming_allocator(UploadMode::Sync, 1024);
        assert!(sync.allocate(&mut device, 2048).unwrap().is_none());

        let mut async_alloc = new_streaming_allocator(UploadMode::Async, 1024);
        assert!(async_alloc.allocate(&mut device, 2048).unwrap().is_some());
    }
}
