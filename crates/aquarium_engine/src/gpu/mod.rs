//! GPU device abstraction consumed by the streaming subsystem
//!
//! The streaming allocator and the instance-resource growth path only need a
//! narrow slice of a graphics API: create a buffer, map it for host writes
//! (synchronously or with a completion callback), record buffer-to-buffer
//! copies on a shared encoder, submit, and poll for async completions. That
//! slice is expressed as the [`GpuDevice`] trait so the same streaming code
//! runs against the Vulkan backend and against the headless backend used by
//! tests and CPU-only benchmark runs.

use bitflags::bitflags;
use slotmap::new_key_type;

pub mod error;
pub mod headless;
pub mod vulkan;

pub use error::{GpuError, GpuResult};
pub use headless::HeadlessDevice;
pub use vulkan::VulkanDevice;

new_key_type! {
    /// Handle to a device buffer
    pub struct BufferId;

    /// Handle to a bind group (descriptor set)
    pub struct BindGroupId;
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Source of transfer commands (staging memory)
        const TRANSFER_SRC = 0b0001;
        /// Destination of transfer commands
        const TRANSFER_DST = 0b0010;
        /// Bound as a uniform buffer
        const UNIFORM = 0b0100;
        /// Bound as a vertex buffer
        const VERTEX = 0b1000;
    }
}

/// Minimum alignment for uniform-buffer offsets, both for dynamic offsets
/// and for sub-allocations handed out by the ring buffers.
pub const UNIFORM_OFFSET_ALIGNMENT: u64 = 256;

/// Round `value` up to the next multiple of `alignment` (a power of two).
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Callback fired when an async map-for-write request completes.
///
/// Completions are only ever delivered from inside [`GpuDevice::poll`] on the
/// calling thread; there is no cross-thread delivery.
pub type MapCallback = Box<dyn FnOnce() + Send>;

/// Description of a bind group referencing a sub-range of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindGroupDesc {
    /// Buffer the bind group points at
    pub buffer: BufferId,
    /// Byte offset of the bound range
    pub offset: u64,
    /// Byte length of the bound range
    pub range: u64,
    /// Whether the binding takes a per-draw dynamic offset
    pub dynamic_offset: bool,
}

/// The device operations the streaming subsystem consumes
///
/// Implementations are single-threaded: all methods, including the delivery
/// of map completions, happen on the render thread. `record_copy` batches
/// onto one shared encoder; nothing reaches the GPU until `submit`.
pub trait GpuDevice {
    /// Create a device buffer of `size` bytes
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId>;

    /// Destroy a buffer and release its memory
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Map a buffer for host writes, blocking until the mapping is ready
    fn map_for_write(&mut self, buffer: BufferId) -> GpuResult<()>;

    /// Request an async map for host writes; `on_mapped` fires from a later
    /// [`poll`](Self::poll) call once the device has finished reading the
    /// buffer
    fn map_for_write_async(&mut self, buffer: BufferId, on_mapped: MapCallback) -> GpuResult<()>;

    /// Copy `data` into a mapped buffer at `offset`
    ///
    /// Fails if the buffer is not currently mapped or the write would run
    /// past the end of the buffer.
    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// End host access to a mapped buffer
    fn unmap(&mut self, buffer: BufferId);

    /// Record a buffer-to-buffer copy on the shared encoder
    fn record_copy(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()>;

    /// Submit everything recorded since the last submit
    fn submit(&mut self) -> GpuResult<()>;

    /// Advance pending async completions, firing ready map callbacks
    fn poll(&mut self) -> GpuResult<()>;

    /// Create a bind group for a buffer sub-range
    fn create_bind_group(&mut self, desc: &BindGroupDesc) -> GpuResult<BindGroupId>;

    /// Destroy a bind group
    fn destroy_bind_group(&mut self, bind_group: BindGroupId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
