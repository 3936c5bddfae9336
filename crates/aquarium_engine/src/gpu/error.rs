//! Error types for the GPU device seam

use ash::vk;
use thiserror::Error;

/// Errors produced by GPU device operations
#[derive(Debug, Error)]
pub enum GpuError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Memory allocation failed
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Handle does not refer to a live resource
    #[error("Resource not found")]
    ResourceNotFound,

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// The device stopped making progress on submitted work
    #[error("Device lost")]
    DeviceLost,
}

/// Result type for GPU device operations
pub type GpuResult<T> = Result<T, GpuError>;
