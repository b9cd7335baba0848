// Buffers for vertex, index, and uniform data
//
// A GpuBuffer owns both the VkBuffer and its allocation. Dropping it
// releases the pair in one place: the handle first, then the memory.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use std::sync::Arc;

use super::{CommandPool, VulkanDevice};

/// Memory for CPU-written data the GPU reads (staging, uniforms).
pub const HOST_WRITE_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// Memory for GPU-written data the CPU reads back.
pub const HOST_READ_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
);

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer with backing memory chosen from `memory_flags`.
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer '{}' has zero size", name);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let allocation =
            match device
                .allocator
                .allocate_buffer(&device.device, buffer, name, memory_flags)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { device.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    /// Copy `data` to the start of a host-visible buffer.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes overflows a {} byte buffer",
                bytes.len(),
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Contents of a host-visible buffer.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .context("Buffer memory is not host visible")?;
        Ok(mapped[..self.size as usize].to_vec())
    }

    /// Upload `data` into a new device-local buffer through a staging copy.
    ///
    /// Blocks until the copy has finished; the staging buffer is gone by
    /// the time this returns.
    pub fn device_local_with_data<T: Pod>(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;

        // Step 1: staging buffer with the caller's data
        let mut staging = Self::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_WRITE_MEMORY,
            &format!("{} (staging)", name),
        )?;
        staging.write(data)?;

        // Step 2: destination
        let buffer = Self::new(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            name,
        )?;

        // Step 3: copy
        pool.submit_one_shot(|device, cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe { device.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]) };
            Ok(())
        })
        .with_context(|| format!("Failed to upload buffer '{}'", name))?;

        // Step 4: staging is released here
        drop(staging);

        log::debug!("Uploaded {} bytes into '{}'", size, name);
        Ok(buffer)
    }

    /// Copy this buffer back to the host. The buffer needs TRANSFER_SRC usage.
    pub fn download(&self, pool: &CommandPool) -> Result<Vec<u8>> {
        let readback = Self::new(
            &self.device,
            self.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            HOST_READ_MEMORY,
            "readback",
        )?;

        pool.submit_one_shot(|device, cmd| {
            let region = vk::BufferCopy::builder().size(self.size).build();
            unsafe { device.cmd_copy_buffer(cmd, self.buffer, readback.buffer, &[region]) };
            Ok(())
        })
        .context("Failed to download buffer")?;

        readback.read_bytes()
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.free(allocation) {
                log::error!("{:?}", e);
            }
        }
    }
}
