//! Vulkan implementation of the device seam
//!
//! Wraps handles the integrator already owns (`ash::Device`, instance,
//! physical device, transfer-capable queue) and implements the narrow
//! contract the streaming subsystem needs. Buffers are allocated from
//! host-visible, host-coherent memory so mapping never requires a staging
//! hop of its own; recorded copies batch onto one transfer command buffer
//! per frame and async map completions are gated on the submission fence,
//! delivered from [`GpuDevice::poll`] on the calling thread.
//!
//! Device, instance and queue initialization are out of scope here; the
//! wrapped handles are borrowed and never destroyed by this type.

use ash::{vk, Device, Instance};
use slotmap::SlotMap;

use super::{
    BindGroupDesc, BindGroupId, BufferId, BufferUsage, GpuDevice, GpuError, GpuResult, MapCallback,
};

/// Upper bound on live descriptor sets in per-instance binding mode
const MAX_BIND_GROUPS: u32 = 16384;

struct VulkanBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    mapped: Option<*mut u8>,
}

struct Submission {
    fence: vk::Fence,
    command_buffer: vk::CommandBuffer,
    remaps: Vec<(BufferId, MapCallback)>,
}

/// Vulkan-backed device for instance streaming
pub struct VulkanDevice {
    device: Device,
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    uniform_layout: vk::DescriptorSetLayout,
    dynamic_layout: vk::DescriptorSetLayout,
    buffers: SlotMap<BufferId, VulkanBuffer>,
    bind_groups: SlotMap<BindGroupId, vk::DescriptorSet>,
    encoder: Option<vk::CommandBuffer>,
    in_flight: Vec<Submission>,
    ready_maps: Vec<(BufferId, MapCallback)>,
    free_fences: Vec<vk::Fence>,
}

impl VulkanDevice {
    /// Wrap existing Vulkan handles
    pub fn new(
        device: Device,
        instance: Instance,
        physical_device: vk::PhysicalDevice,
        queue: vk::Queue,
        queue_family_index: u32,
    ) -> GpuResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(GpuError::Api)?
        };

        let pool_sizes = [
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(MAX_BIND_GROUPS)
                .build(),
            vk::DescriptorPoolSize::builder()
                .ty(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(MAX_BIND_GROUPS)
                .build(),
        ];

        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_BIND_GROUPS)
            .pool_sizes(&pool_sizes);

        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(GpuError::Api)?
        };

        let uniform_layout =
            create_layout(&device, vk::DescriptorType::UNIFORM_BUFFER)?;
        let dynamic_layout =
            create_layout(&device, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)?;

        log::info!("Created Vulkan streaming device (queue family {})", queue_family_index);

        Ok(Self {
            device,
            instance,
            physical_device,
            queue,
            command_pool,
            descriptor_pool,
            uniform_layout,
            dynamic_layout,
            buffers: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            encoder: None,
            in_flight: Vec::new(),
            ready_maps: Vec::new(),
            free_fences: Vec::new(),
        })
    }

    fn buffer(&self, id: BufferId) -> GpuResult<&VulkanBuffer> {
        self.buffers.get(id).ok_or(GpuError::ResourceNotFound)
    }

    /// Lazily begin the shared transfer command buffer
    fn encoder(&mut self) -> GpuResult<vk::CommandBuffer> {
        if let Some(encoder) = self.encoder {
            return Ok(encoder);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(GpuError::Api)?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(GpuError::Api)?;
        }

        self.encoder = Some(command_buffer);
        Ok(command_buffer)
    }

    fn acquire_fence(&mut self) -> GpuResult<vk::Fence> {
        if let Some(fence) = self.free_fences.pop() {
            unsafe {
                self.device.reset_fences(&[fence]).map_err(GpuError::Api)?;
            }
            return Ok(fence);
        }

        let create_info = vk::FenceCreateInfo::builder();
        unsafe {
            self.device
                .create_fence(&create_info, None)
                .map_err(GpuError::Api)
        }
    }

    fn map_buffer(&mut self, id: BufferId) -> GpuResult<()> {
        let entry = self.buffers.get_mut(id).ok_or(GpuError::ResourceNotFound)?;
        if entry.mapped.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            self.device
                .map_memory(entry.memory, 0, entry.size, vk::MemoryMapFlags::empty())
                .map_err(GpuError::Api)?
        };
        entry.mapped = Some(ptr.cast());
        Ok(())
    }
}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::Api)?
        };

        let mem_requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let memory_type_index = find_memory_type(
            &self.instance,
            self.physical_device,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(|e| {
                if e == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    || e == vk::Result::ERROR_OUT_OF_HOST_MEMORY
                {
                    GpuError::OutOfMemory { requested: size }
                } else {
                    GpuError::Api(e)
                }
            })?
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(GpuError::Api)?;
        }

        Ok(self.buffers.insert(VulkanBuffer {
            buffer,
            memory,
            size,
            mapped: None,
        }))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.remove(buffer) {
            unsafe {
                if entry.mapped.is_some() {
                    self.device.unmap_memory(entry.memory);
                }
                self.device.destroy_buffer(entry.buffer, None);
                self.device.free_memory(entry.memory, None);
            }
        } else {
            log::warn!("vulkan: destroy of unknown buffer {:?}", buffer);
        }
    }

    fn map_for_write(&mut self, buffer: BufferId) -> GpuResult<()> {
        self.map_buffer(buffer)
    }

    fn map_for_write_async(&mut self, buffer: BufferId, on_mapped: MapCallback) -> GpuResult<()> {
        self.buffer(buffer)?;
        // Gate the remap on the most recent submission; with nothing in
        // flight the buffer is idle and the map can complete on next poll.
        if let Some(submission) = self.in_flight.last_mut() {
            submission.remaps.push((buffer, on_mapped));
        } else {
            self.ready_maps.push((buffer, on_mapped));
        }
        Ok(())
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let entry = self.buffer(buffer)?;
        let Some(ptr) = entry.mapped else {
            return Err(GpuError::InvalidOperation {
                reason: "write to a buffer that is not mapped".to_string(),
            });
        };
        if offset + data.len() as u64 > entry.size {
            return Err(GpuError::InvalidOperation {
                reason: format!(
                    "range {}..{} exceeds buffer of {} bytes",
                    offset,
                    offset + data.len() as u64,
                    entry.size
                ),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    fn unmap(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.get_mut(buffer) {
            if entry.mapped.take().is_some() {
                unsafe {
                    self.device.unmap_memory(entry.memory);
                }
            }
        }
    }

    fn record_copy(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        let src_handle = self.buffer(src)?.buffer;
        let dst_handle = self.buffer(dst)?.buffer;
        let encoder = self.encoder()?;

        let region = vk::BufferCopy::builder()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size)
            .build();

        unsafe {
            self.device
                .cmd_copy_buffer(encoder, src_handle, dst_handle, &[region]);
        }
        Ok(())
    }

    fn submit(&mut self) -> GpuResult<()> {
        let Some(command_buffer) = self.encoder.take() else {
            return Ok(());
        };

        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(GpuError::Api)?;
        }

        let fence = self.acquire_fence()?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(GpuError::Api)?;
        }

        self.in_flight.push(Submission {
            fence,
            command_buffer,
            remaps: Vec::new(),
        });
        Ok(())
    }

    fn poll(&mut self) -> GpuResult<()> {
        for (buffer, on_mapped) in std::mem::take(&mut self.ready_maps) {
            self.map_buffer(buffer)?;
            on_mapped();
        }

        let mut still_in_flight = Vec::new();
        for submission in std::mem::take(&mut self.in_flight) {
            let signaled = unsafe {
                self.device.get_fence_status(submission.fence).map_err(|e| {
                    if e == vk::Result::ERROR_DEVICE_LOST {
                        GpuError::DeviceLost
                    } else {
                        GpuError::Api(e)
                    }
                })?
            };

            if signaled {
                unsafe {
                    self.device
                        .free_command_buffers(self.command_pool, &[submission.command_buffer]);
                }
                self.free_fences.push(submission.fence);
                for (buffer, on_mapped) in submission.remaps {
                    self.map_buffer(buffer)?;
                    on_mapped();
                }
            } else {
                still_in_flight.push(submission);
            }
        }
        self.in_flight = still_in_flight;
        Ok(())
    }

    fn create_bind_group(&mut self, desc: &BindGroupDesc) -> GpuResult<BindGroupId> {
        let buffer_handle = self.buffer(desc.buffer)?.buffer;
        let layout = if desc.dynamic_offset {
            self.dynamic_layout
        } else {
            self.uniform_layout
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);

        let descriptor_set = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(GpuError::Api)?[0]
        };

        let buffer_info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer_handle)
            .offset(desc.offset)
            .range(desc.range)
            .build();

        let descriptor_type = if desc.dynamic_offset {
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        } else {
            vk::DescriptorType::UNIFORM_BUFFER
        };

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(descriptor_type)
            .buffer_info(std::slice::from_ref(&buffer_info))
            .build();

        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }

        Ok(self.bind_groups.insert(descriptor_set))
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupId) {
        if let Some(descriptor_set) = self.bind_groups.remove(bind_group) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[descriptor_set]);
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, entry) in self.buffers.drain() {
                if entry.mapped.is_some() {
                    self.device.unmap_memory(entry.memory);
                }
                self.device.destroy_buffer(entry.buffer, None);
                self.device.free_memory(entry.memory, None);
            }

            for submission in self.in_flight.drain(..) {
                self.device.destroy_fence(submission.fence, None);
            }
            for fence in self.free_fences.drain(..) {
                self.device.destroy_fence(fence, None);
            }

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_descriptor_set_layout(self.uniform_layout, None);
            self.device.destroy_descriptor_set_layout(self.dynamic_layout, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

fn create_layout(device: &Device, ty: vk::DescriptorType) -> GpuResult<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .build();

    let create_info =
        vk::DescriptorSetLayoutCreateInfo::builder().bindings(std::slice::from_ref(&binding));

    unsafe {
        device
            .create_descriptor_set_layout(&create_info, None)
            .map_err(GpuError::Api)
    }
}

fn vk_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    flags
}

/// Find memory type with required properties
fn find_memory_type(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    let mem_properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };

    for i in 0..mem_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && (mem_properties.memory_types[i as usize].property_flags & properties) == properties
        {
            return Ok(i);
        }
    }

    Err(GpuError::NoSuitableMemoryType)
}
