//! Bounded pool of ring buffers with per-frame enqueue bookkeeping

use slotmap::SlotMap;

use crate::gpu::{GpuDevice, GpuError, GpuResult};

use super::{RingBuffer, RingId, DEFAULT_POOL_CAPACITY};

/// Owns a set of [`RingBuffer`]s, tracks which were touched in the current
/// frame, and enforces the global byte cap used by the synchronous policy
///
/// `used_bytes` is meaningful only under the synchronous policy; the async
/// policy caps the buffer count instead and constructs the pool with an
/// unlimited byte budget.
pub struct BufferPool {
    rings: SlotMap<RingId, RingBuffer>,
    enqueued: Vec<RingId>,
    used_bytes: u64,
    capacity_limit: u64,
}

impl BufferPool {
    /// Create a pool with an explicit byte cap
    #[must_use]
    pub fn new(capacity_limit: u64) -> Self {
        Self {
            rings: SlotMap::with_key(),
            enqueued: Vec::new(),
            used_bytes: 0,
            capacity_limit,
        }
    }

    /// Create a pool with the default 1 MiB byte cap
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }

    /// Whether accounting `size` more bytes would exceed the cap
    #[must_use]
    pub fn would_exceed(&self, size: u64) -> bool {
        self.used_bytes + size > self.capacity_limit
    }

    /// Take ownership of a ring, accounting its size against the budget
    pub fn insert(&mut self, ring: RingBuffer) -> RingId {
        self.used_bytes += ring.size();
        self.rings.insert(ring)
    }

    /// Mark a ring as touched this frame (idempotent)
    pub fn enqueue(&mut self, ring: RingId) {
        if !self.enqueued.contains(&ring) {
            self.enqueued.push(ring);
        }
    }

    /// Whether a ring was touched this frame
    #[must_use]
    pub fn is_enqueued(&self, ring: RingId) -> bool {
        self.enqueued.contains(&ring)
    }

    /// Rewind an enqueued ring for `size` bytes of new writes
    ///
    /// Returns `false` when the ring is not enqueued or the ring-level
    /// reset refuses the size; `used_bytes` is adjusted by the size delta
    /// only on success.
    pub fn reset_buffer(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: RingId,
        size: u64,
    ) -> GpuResult<bool> {
        if !self.is_enqueued(ring) {
            return Ok(false);
        }
        let entry = self.rings.get_mut(ring).ok_or(GpuError::ResourceNotFound)?;
        let old_size = entry.size();
        if !entry.reset(device, size)? {
            return Ok(false);
        }
        self.used_bytes = self.used_bytes - old_size + size;
        Ok(true)
    }

    /// Remove a ring from all bookkeeping and release its device buffer
    pub fn destroy_buffer(&mut self, device: &mut dyn GpuDevice, ring: RingId) {
        if let Some(mut entry) = self.rings.remove(ring) {
            self.used_bytes = self.used_bytes.saturating_sub(entry.size());
            self.enqueued.retain(|&id| id != ring);
            entry.destroy(device);
        }
    }

    /// Flush (rewind + unmap) every ring touched this frame
    pub fn flush(&mut self, device: &mut dyn GpuDevice) {
        for &id in &self.enqueued {
            if let Some(ring) = self.rings.get_mut(id) {
                ring.flush(device);
            }
        }
    }

    /// Clear and return the per-frame enqueue list
    pub fn take_enqueued(&mut self) -> Vec<RingId> {
        std::mem::take(&mut self.enqueued)
    }

    /// Rings touched in the current frame, in touch order
    #[must_use]
    pub fn enqueued(&self) -> &[RingId] {
        &self.enqueued
    }

    /// Borrow a ring
    #[must_use]
    pub fn get(&self, ring: RingId) -> Option<&RingBuffer> {
        self.rings.get(ring)
    }

    /// Mutably borrow a ring
    pub fn get_mut(&mut self, ring: RingId) -> Option<&mut RingBuffer> {
        self.rings.get_mut(ring)
    }

    /// Number of live rings
    #[must_use]
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// Bytes currently accounted against the cap
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// The pool byte cap
    #[must_use]
    pub fn capacity_limit(&self) -> u64 {
        self.capacity_limit
    }

    /// Destroy every ring and reset the accounting
    pub fn destroy_all(&mut self, device: &mut dyn GpuDevice) {
        let ids: Vec<RingId> = self.rings.keys().collect();
        for id in ids {
            self.destroy_buffer(device, id);
        }
        self.enqueued.clear();
        self.used_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn pool_with_ring(device: &mut HeadlessDevice, capacity: u64) -> (BufferPool, RingId) {
        let mut pool = BufferPool::with_default_capacity();
        let ring = RingBuffer::create(device, capacity).unwrap();
        let id = pool.insert(ring);
        (pool, id)
    }

    #[test]
    fn test_insert_accounts_used_bytes() {
        let mut device = HeadlessDevice::new();
        let (mut pool, id) = pool_with_ring(&mut device, 600);
        assert_eq!(pool.used_bytes(), 600);

        pool.destroy_buffer(&mut device, id);
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(pool.ring_count(), 0);
        assert_eq!(device.buffer_count(), 0);
    }

    #[test]
    fn test_reset_buffer_requires_enqueued() {
        let mut device = HeadlessDevice::new();
        let (mut pool, id) = pool_with_ring(&mut device, 256);

        assert!(!pool.reset_buffer(&mut device, id, 128).unwrap());

        pool.enqueue(id);
        assert!(pool.reset_buffer(&mut device, id, 128).unwrap());
        assert_eq!(pool.used_bytes(), 128);
    }

    #[test]
    fn test_reset_buffer_too_large_leaves_accounting() {
        let mut device = HeadlessDevice::new();
        let (mut pool, id) = pool_with_ring(&mut device, 256);
        pool.enqueue(id);

        assert!(!pool.reset_buffer(&mut device, id, 512).unwrap());
        assert_eq!(pool.used_bytes(), 256);
    }

    #[test]
    fn test_flush_with_nothing_enqueued_is_noop() {
        let mut device = HeadlessDevice::new();
        let (mut pool, id) = pool_with_ring(&mut device, 256);

        pool.flush(&mut device);
        assert!(device.is_mapped(pool.get(id).unwrap().buffer()));
        assert!(pool.take_enqueued().is_empty());
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut device = HeadlessDevice::new();
        let (mut pool, id) = pool_with_ring(&mut device, 256);

        pool.enqueue(id);
        pool.enqueue(id);
        assert_eq!(pool.enqueued().len(), 1);
    }
}
