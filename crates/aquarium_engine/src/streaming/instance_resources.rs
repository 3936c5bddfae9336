//! Grow-only GPU resources for a variable instance population
//!
//! The per-instance uniform buffer and its bind groups are rebuilt as one
//! unit whenever the population exceeds the current capacity; a shrinking
//! population simply leaves the tail unused. Capacity is therefore
//! monotonically non-decreasing for the lifetime of the resource set.

use crate::gpu::{
    align_up, BindGroupDesc, BindGroupId, BufferId, BufferUsage, GpuDevice, GpuResult,
    UNIFORM_OFFSET_ALIGNMENT,
};

/// How per-draw instance offsets are communicated to the GPU
///
/// Both modes bind identical buffer content; they trade descriptor memory
/// against per-draw state. The choice is a startup capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// One bind group; each draw passes `instance * stride` as a dynamic
    /// byte offset
    DynamicOffset,
    /// One bind group per instance index, no per-draw offset
    PerInstance,
}

/// Per-instance buffer plus bind groups, grown in lockstep
///
/// Growth failure is fatal by contract: the old buffer and bind groups are
/// destroyed before the new ones are built, so an error from
/// [`ensure_capacity`](Self::ensure_capacity) leaves no usable resources
/// behind and callers must terminate rather than keep rendering with a
/// half-grown set.
pub struct InstanceResources {
    mode: BindMode,
    stride: u64,
    capacity: u32,
    buffer: Option<BufferId>,
    bind_groups: Vec<BindGroupId>,
    reallocations: u64,
}

impl InstanceResources {
    /// Create an empty resource set for instances of `instance_size` bytes
    #[must_use]
    pub fn new(mode: BindMode, instance_size: u64) -> Self {
        Self {
            mode,
            stride: align_up(instance_size, UNIFORM_OFFSET_ALIGNMENT),
            capacity: 0,
            buffer: None,
            bind_groups: Vec::new(),
            reallocations: 0,
        }
    }

    /// Grow to hold `cur_instances`; no-op when capacity already suffices
    ///
    /// Returns whether a reallocation happened.
    pub fn ensure_capacity(
        &mut self,
        device: &mut dyn GpuDevice,
        cur_instances: u32,
    ) -> GpuResult<bool> {
        if cur_instances <= self.capacity {
            return Ok(false);
        }

        for bind_group in self.bind_groups.drain(..) {
            device.destroy_bind_group(bind_group);
        }
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }

        let size = self.stride * u64::from(cur_instances);
        let buffer = device.create_buffer(size, BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST)?;

        match self.mode {
            BindMode::DynamicOffset => {
                self.bind_groups.push(device.create_bind_group(&BindGroupDesc {
                    buffer,
                    offset: 0,
                    range: self.stride,
                    dynamic_offset: true,
                })?);
            }
            BindMode::PerInstance => {
                self.bind_groups.reserve(cur_instances as usize);
                for instance in 0..cur_instances {
                    self.bind_groups.push(device.create_bind_group(&BindGroupDesc {
                        buffer,
                        offset: u64::from(instance) * self.stride,
                        range: self.stride,
                        dynamic_offset: false,
                    })?);
                }
            }
        }

        log::info!(
            "instance resources grown: {} -> {} instances ({} bytes, {} bind groups)",
            self.capacity,
            cur_instances,
            size,
            self.bind_groups.len()
        );

        self.buffer = Some(buffer);
        self.capacity = cur_instances;
        self.reallocations += 1;
        Ok(true)
    }

    /// Bind group and dynamic offset for one instance
    ///
    /// Returns `None` while empty or when `instance` is out of capacity.
    #[must_use]
    pub fn binding(&self, instance: u32) -> Option<(BindGroupId, u64)> {
        if instance >= self.capacity {
            return None;
        }
        match self.mode {
            BindMode::DynamicOffset => self
                .bind_groups
                .first()
                .map(|&bg| (bg, u64::from(instance) * self.stride)),
            BindMode::PerInstance => self
                .bind_groups
                .get(instance as usize)
                .map(|&bg| (bg, 0)),
        }
    }

    /// Byte offset of one instance's slot in the buffer
    #[must_use]
    pub fn instance_offset(&self, instance: u32) -> u64 {
        u64::from(instance) * self.stride
    }

    /// The per-instance buffer, if allocated
    #[must_use]
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Current instance capacity
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Aligned bytes per instance slot
    #[must_use]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Number of live bind groups
    #[must_use]
    pub fn bind_group_count(&self) -> usize {
        self.bind_groups.len()
    }

    /// Number of reallocations performed so far
    #[must_use]
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// Release the buffer and bind groups at teardown
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for bind_group in self.bind_groups.drain(..) {
            device.destroy_bind_group(bind_group);
        }
        if let Some(buffer) = self.buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.capacity = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn test_growth_is_monotonic() {
        let mut device = HeadlessDevice::new();
        let mut resources = InstanceResources::new(BindMode::DynamicOffset, 64);

        assert!(resources.ensure_capacity(&mut device, 100).unwrap());
        assert_eq!(resources.capacity(), 100);
        assert_eq!(resources.reallocations(), 1);

        // Shrinking population: untouched, tail unused.
        assert!(!resources.ensure_capacity(&mut device, 50).unwrap());
        assert_eq!(resources.capacity(), 100);
        assert_eq!(resources.reallocations(), 1);

        assert!(resources.ensure_capacity(&mut device, 150).unwrap());
        assert_eq!(resources.capacity(), 150);
        assert_eq!(resources.reallocations(), 2);
        // The old buffer was destroyed with the growth.
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn test_dynamic_offset_mode_keeps_one_bind_group() {
        let mut device = HeadlessDevice::new();
        let mut resources = InstanceResources::new(BindMode::DynamicOffset, 64);

        for count in [10, 200, 5000] {
            resources.ensure_capacity(&mut device, count).unwrap();
            assert_eq!(resources.bind_group_count(), 1);
        }

        let (_, offset) = resources.binding(3).unwrap();
        assert_eq!(offset, 3 * resources.stride());
    }

    #[test]
    fn test_per_instance_mode_matches_capacity() {
        let mut device = HeadlessDevice::new();
        let mut resources = InstanceResources::new(BindMode::PerInstance, 64);

        for count in [10, 200, 1000] {
            resources.ensure_capacity(&mut device, count).unwrap();
            assert_eq!(resources.bind_group_count(), count as usize);
        }

        let (_, offset) = resources.binding(3).unwrap();
        assert_eq!(offset, 0);
        assert!(resources.binding(1000).is_none());
    }

    #[test]
    fn test_stride_is_aligned() {
        let resources = InstanceResources::new(BindMode::DynamicOffset, 80);
        assert_eq!(resources.stride(), 256);
    }

    #[test]
    fn test_empty_set_has_no_binding() {
        let resources = InstanceResources::new(BindMode::DynamicOffset, 64);
        assert!(resources.binding(0).is_none());
        assert!(resources.buffer().is_none());
    }
}
