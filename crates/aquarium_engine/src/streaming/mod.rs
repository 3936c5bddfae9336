//! Per-frame instance data streaming
//!
//! Every frame the render loop needs fresh per-instance transform data on
//! the GPU. This module supplies it through ring buffers handed out by a
//! [`StreamingAllocator`], under one of two upload disciplines fixed at
//! startup:
//!
//! - [`SyncStreamingAllocator`] creates an exactly-sized, synchronously
//!   mapped buffer per request and destroys every buffer at frame end.
//!   Simple, byte-capped, continuous allocation churn.
//! - [`AsyncStreamingAllocator`] keeps a bounded set of fixed-size buffers
//!   alive for the whole run, recycling each one as soon as the driver
//!   reports its previous contents consumed. Creation cost is amortized to
//!   at most [`BUFFER_MAX_COUNT`] buffers at the price of bounded stalls
//!   when all of them are in flight.
//!
//! [`InstanceResources`] covers the other half of the problem: growing the
//! destination buffer and its bind groups when the simulated population
//! increases at runtime.

use slotmap::new_key_type;

pub mod allocator;
pub mod instance_resources;
pub mod pool;
pub mod ring_buffer;

pub use allocator::{
    new_streaming_allocator, AsyncStreamingAllocator, StreamAlloc, StreamStats,
    StreamingAllocator, SyncStreamingAllocator, UploadMode,
};
pub use instance_resources::{BindMode, InstanceResources};
pub use pool::BufferPool;
pub use ring_buffer::{RingBuffer, RingState};

new_key_type! {
    /// Handle to a ring buffer inside a [`BufferPool`]
    pub struct RingId;
}

/// Default byte cap for the synchronous pool (1 MiB)
pub const DEFAULT_POOL_CAPACITY: u64 = 1024 * 1024;

/// Maximum number of persistent buffers the async policy keeps alive
pub const BUFFER_MAX_COUNT: usize = 10;

/// Fixed size of each persistent async buffer
pub const BUFFER_PER_ALLOCATE_SIZE: u64 = 256 * 1024;
