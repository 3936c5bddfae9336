//! Headless CPU-side implementation of the device seam
//!
//! Buffers live in host memory, recorded copies execute on `submit`, and
//! async map completions are queued and delivered on the next `poll`. This
//! backend drives benchmark runs on machines without a GPU and doubles as
//! the test double for the streaming state machines: the Mapped/Unmapped
//! rules are enforced exactly as a real driver would.

use slotmap::SlotMap;

use super::{BindGroupDesc, BindGroupId, BufferId, BufferUsage, GpuDevice, GpuError, GpuResult, MapCallback};

struct HeadlessBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
    mapped: bool,
}

struct CopyCommand {
    src: BufferId,
    src_offset: u64,
    dst: BufferId,
    dst_offset: u64,
    size: u64,
}

/// In-memory device with driver-accurate map/unmap bookkeeping
pub struct HeadlessDevice {
    buffers: SlotMap<BufferId, HeadlessBuffer>,
    bind_groups: SlotMap<BindGroupId, BindGroupDesc>,
    recorded: Vec<CopyCommand>,
    pending_maps: Vec<(BufferId, MapCallback)>,
    submit_count: u64,
}

impl HeadlessDevice {
    /// Create an empty headless device
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            recorded: Vec::new(),
            pending_maps: Vec::new(),
            submit_count: 0,
        }
    }

    /// Current contents of a buffer, if it exists
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    /// Whether a buffer is currently host-writable
    #[must_use]
    pub fn is_mapped(&self, buffer: BufferId) -> bool {
        self.buffers.get(buffer).is_some_and(|b| b.mapped)
    }

    /// Number of live buffers
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of async map requests not yet completed
    #[must_use]
    pub fn pending_map_count(&self) -> usize {
        self.pending_maps.len()
    }

    /// Number of submits since creation
    #[must_use]
    pub fn submit_count(&self) -> u64 {
        self.submit_count
    }

    fn buffer(&self, id: BufferId) -> GpuResult<&HeadlessBuffer> {
        self.buffers.get(id).ok_or(GpuError::ResourceNotFound)
    }

    fn check_range(&self, id: BufferId, offset: u64, size: u64) -> GpuResult<()> {
        let buffer = self.buffer(id)?;
        if offset + size > buffer.data.len() as u64 {
            return Err(GpuError::InvalidOperation {
                reason: format!(
                    "range {}..{} exceeds buffer of {} bytes",
                    offset,
                    offset + size,
                    buffer.data.len()
                ),
            });
        }
        Ok(())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> GpuResult<BufferId> {
        let id = self.buffers.insert(HeadlessBuffer {
            data: vec![0; usize::try_from(size).map_err(|_| GpuError::OutOfMemory { requested: size })?],
            usage,
            mapped: false,
        });
        log::debug!("headless: created buffer {:?} ({} bytes, {:?})", id, size, usage);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(buffer).is_none() {
            log::warn!("headless: destroy of unknown buffer {:?}", buffer);
        }
    }

    fn map_for_write(&mut self, buffer: BufferId) -> GpuResult<()> {
        self.buffer(buffer)?;
        self.buffers[buffer].mapped = true;
        Ok(())
    }

    fn map_for_write_async(&mut self, buffer: BufferId, on_mapped: MapCallback) -> GpuResult<()> {
        self.buffer(buffer)?;
        self.pending_maps.push((buffer, on_mapped));
        Ok(())
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        if !self.buffer(buffer)?.mapped {
            return Err(GpuError::InvalidOperation {
                reason: "write to a buffer that is not mapped".to_string(),
            });
        }
        self.check_range(buffer, offset, data.len() as u64)?;
        let start = offset as usize;
        self.buffers[buffer].data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn unmap(&mut self, buffer: BufferId) {
        if let Some(entry) = self.buffers.get_mut(buffer) {
            entry.mapped = false;
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
        self.check_range(src, src_offset, size)?;
        self.check_range(dst, dst_offset, size)?;
        self.recorded.push(CopyCommand {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn submit(&mut self) -> GpuResult<()> {
        let commands = std::mem::take(&mut self.recorded);
        for cmd in &commands {
            let start = cmd.src_offset as usize;
            let len = cmd.size as usize;
            let bytes = self.buffer(cmd.src)?.data[start..start + len].to_vec();
            let dst_start = cmd.dst_offset as usize;
            self.buffers[cmd.dst].data[dst_start..dst_start + len].copy_from_slice(&bytes);
        }
        self.submit_count += 1;
        log::debug!("headless: submit #{} executed {} copies", self.submit_count, commands.len());
        Ok(())
    }

    fn poll(&mut self) -> GpuResult<()> {
        for (buffer, on_mapped) in std::mem::take(&mut self.pending_maps) {
            if let Some(entry) = self.buffers.get_mut(buffer) {
                entry.mapped = true;
            }
            on_mapped();
        }
        Ok(())
    }

    fn create_bind_group(&mut self, desc: &BindGroupDesc) -> GpuResult<BindGroupId> {
        self.check_range(desc.buffer, desc.offset, desc.range)?;
        if !self.buffer(desc.buffer)?.usage.contains(BufferUsage::UNIFORM) {
            return Err(GpuError::InvalidOperation {
                reason: "bind group requires a uniform buffer".to_string(),
            });
        }
        Ok(self.bind_groups.insert(*desc))
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupId) {
        self.bind_groups.remove(bind_group);
    }
}
