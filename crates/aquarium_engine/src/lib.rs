//! # Aquarium Engine
//!
//! Core library for the aquarium rendering benchmark: thousands of
//! independently moving fish whose per-frame transforms are streamed to
//! the GPU every frame. The hard part lives in [`streaming`]: a
//! ring-buffer pool with synchronous and pipelined-asynchronous upload
//! policies, plus the grow-only reallocation protocol for the
//! per-instance GPU resources.
//!
//! The GPU surface is the narrow [`gpu::GpuDevice`] trait, implemented by
//! a Vulkan backend ([`gpu::VulkanDevice`]) and a headless backend
//! ([`gpu::HeadlessDevice`]) used by tests and CPU-only benchmark runs.

/// Benchmark configuration loading
pub mod config;
/// Logging and shared utilities
pub mod foundation;
/// GPU device abstraction and backends
pub mod gpu;
/// Per-frame instance data streaming
pub mod streaming;

pub use config::{AquariumConfig, ConfigError};
pub use gpu::{
    align_up, BindGroupDesc, BindGroupId, BufferId, BufferUsage, GpuDevice, GpuError, GpuResult,
    HeadlessDevice, VulkanDevice, UNIFORM_OFFSET_ALIGNMENT,
};
pub use streaming::{
    new_streaming_allocator, AsyncStreamingAllocator, BindMode, BufferPool, InstanceResources,
    RingBuffer, RingId, RingState, StreamAlloc, StreamStats, StreamingAllocator,
    SyncStreamingAllocator, UploadMode, BUFFER_MAX_COUNT, BUFFER_PER_ALLOCATE_SIZE,
    DEFAULT_POOL_CAPACITY,
};
