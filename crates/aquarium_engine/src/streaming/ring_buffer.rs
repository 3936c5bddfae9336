//! Host-mappable staging region written at a monotonically increasing offset

use crate::gpu::{align_up, BufferId, BufferUsage, GpuDevice, GpuResult, UNIFORM_OFFSET_ALIGNMENT};

/// Host-access state of a ring buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    /// Host-writable; allocations and pushes are valid
    Mapped,
    /// Submitted and GPU-owned; unusable until a map completion fires
    Unmapped,
    /// Backing buffer released
    Destroyed,
}

/// One fixed-capacity staging region backed by one device buffer
///
/// Offsets handed out by [`allocate`](Self::allocate) are aligned to
/// [`UNIFORM_OFFSET_ALIGNMENT`] and only ever move forward; reuse requires
/// an explicit [`reset`](Self::reset) or a map completion after
/// [`flush`](Self::flush).
pub struct RingBuffer {
    buffer: BufferId,
    capacity: u64,
    size: u64,
    write_cursor: u64,
    state: RingState,
}

impl RingBuffer {
    /// Create a ring buffer of `capacity` bytes, mapped and ready to write
    pub fn create(device: &mut dyn GpuDevice, capacity: u64) -> GpuResult<Self> {
        let buffer = device.create_buffer(capacity, BufferUsage::TRANSFER_SRC)?;
        device.map_for_write(buffer)?;
        Ok(Self {
            buffer,
            capacity,
            size: capacity,
            write_cursor: 0,
            state: RingState::Mapped,
        })
    }

    /// Reserve `size` bytes and return their offset
    ///
    /// Running past `capacity` is a logic error in the caller (the pool
    /// checks remaining space before handing a ring out), so it panics
    /// rather than returning a recoverable error.
    pub fn allocate(&mut self, size: u64) -> u64 {
        assert_eq!(
            self.state,
            RingState::Mapped,
            "allocate on a ring buffer that is not mapped"
        );
        let offset = align_up(self.write_cursor, UNIFORM_OFFSET_ALIGNMENT);
        assert!(
            offset + size <= self.capacity,
            "ring buffer overflow: {} + {} > {}",
            offset,
            size,
            self.capacity
        );
        self.write_cursor = offset + size;
        offset
    }

    /// Write `data` into the mapped region at `src_offset` and record a
    /// device-side copy into `dst` at `dst_offset`
    ///
    /// No GPU work happens here; the copy lands on the device's shared
    /// encoder and executes at submit.
    pub fn push(
        &self,
        device: &mut dyn GpuDevice,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        data: &[u8],
    ) -> GpuResult<()> {
        device.write_mapped(self.buffer, src_offset, data)?;
        device.record_copy(self.buffer, src_offset, dst, dst_offset, data.len() as u64)
    }

    /// Rewind and re-map for a new generation of writes
    ///
    /// Returns `false` (buffer untouched) when `new_size` exceeds the
    /// capacity this ring was created with.
    pub fn reset(&mut self, device: &mut dyn GpuDevice, new_size: u64) -> GpuResult<bool> {
        if new_size > self.capacity {
            return Ok(false);
        }
        self.write_cursor = 0;
        self.size = new_size;
        device.map_for_write(self.buffer)?;
        self.state = RingState::Mapped;
        Ok(true)
    }

    /// Rewind cursors and end host access
    pub fn flush(&mut self, device: &mut dyn GpuDevice) {
        self.write_cursor = 0;
        device.unmap(self.buffer);
        self.state = RingState::Unmapped;
    }

    /// Mark an async map completion: host-writable again, cursor rewound
    pub fn complete_map(&mut self) {
        self.write_cursor = 0;
        self.state = RingState::Mapped;
    }

    /// Release the device buffer
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        device.destroy_buffer(self.buffer);
        self.state = RingState::Destroyed;
    }

    /// Backing device buffer
    #[must_use]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Total capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Size currently accounted against the pool byte budget
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current write cursor
    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// Bytes still allocatable, accounting for offset alignment
    #[must_use]
    pub fn remaining(&self) -> u64 {
        if self.state != RingState::Mapped {
            return 0;
        }
        self.capacity
            .saturating_sub(align_up(self.write_cursor, UNIFORM_OFFSET_ALIGNMENT))
    }

    /// Current host-access state
    #[must_use]
    pub fn state(&self) -> RingState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn test_allocate_advances_aligned_cursor() {
        let mut device = HeadlessDevice::new();
        let mut ring = RingBuffer::create(&mut device, 1024).unwrap();

        assert_eq!(ring.allocate(100), 0);
        assert_eq!(ring.write_cursor(), 100);
        // Next offset rounds up to the alignment boundary.
        assert_eq!(ring.allocate(100), 256);
        assert_eq!(ring.remaining(), 1024 - 512);
    }

    #[test]
    fn test_allocate_exact_fit_succeeds() {
        let mut device = HeadlessDevice::new();
        let mut ring = RingBuffer::create(&mut device, 512).unwrap();
        assert_eq!(ring.allocate(512), 0);
        assert_eq!(ring.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "ring buffer overflow")]
    fn test_allocate_one_past_capacity_panics() {
        let mut device = HeadlessDevice::new();
        let mut ring = RingBuffer::create(&mut device, 512).unwrap();
        ring.allocate(513);
    }

    #[test]
    fn test_reset_too_large_keeps_buffer_untouched() {
        let mut device = HeadlessDevice::new();
        let mut ring = RingBuffer::create(&mut device, 256).unwrap();
        ring.allocate(200);
        ring.flush(&mut device);

        assert!(!ring.reset(&mut device, 512).unwrap());
        assert_eq!(ring.state(), RingState::Unmapped);
        assert_eq!(ring.size(), 256);

        assert!(ring.reset(&mut device, 128).unwrap());
        assert_eq!(ring.state(), RingState::Mapped);
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.size(), 128);
    }

    #[test]
    fn test_push_records_copy_without_gpu_work() {
        let mut device = HeadlessDevice::new();
        let dst = device
            .create_buffer(64, BufferUsage::TRANSFER_DST)
            .unwrap();
        let mut ring = RingBuffer::create(&mut device, 256).unwrap();

        let offset = ring.allocate(4);
        ring.push(&mut device, dst, offset, 8, &[9, 8, 7, 6]).unwrap();

        // Nothing on the destination until submit.
        assert_eq!(&device.buffer_contents(dst).unwrap()[8..12], &[0, 0, 0, 0]);
        device.submit().unwrap();
        assert_eq!(&device.buffer_contents(dst).unwrap()[8..12], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_flush_ends_host_access() {
        let mut device = HeadlessDevice::new();
        let mut ring = RingBuffer::create(&mut device, 256).unwrap();
        ring.allocate(64);
        ring.flush(&mut device);

        assert_eq!(ring.state(), RingState::Unmapped);
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.remaining(), 0);
        assert!(!device.is_mapped(ring.buffer()));
    }
}
