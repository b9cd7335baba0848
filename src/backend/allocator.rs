// Memory allocator adapter
//
// Wraps gpu-allocator behind a lock and maps Vulkan memory property flags
// onto the allocator's memory locations:
// - DEVICE_LOCAL (not host visible) -> GpuOnly
// - HOST_VISIBLE | HOST_CACHED       -> GpuToCpu (readback)
// - HOST_VISIBLE                     -> CpuToGpu (staging, uniforms)

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

/// Pick the allocator memory location for a set of required property flags.
pub fn memory_location(flags: vk::MemoryPropertyFlags) -> MemoryLocation {
    let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

    if !host_visible && flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        MemoryLocation::GpuOnly
    } else if host_visible && flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if host_visible {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::Unknown
    }
}

/// The one arbiter of raw GPU memory. Every allocation made here must be
/// handed back through [`MemoryAllocator::free`].
pub struct MemoryAllocator {
    inner: Mutex<Allocator>,
}

impl MemoryAllocator {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Self {
            inner: Mutex::new(allocator),
        })
    }

    /// Allocate memory for `buffer` and bind it.
    pub fn allocate_buffer(
        &self,
        device: &ash::Device,
        buffer: vk::Buffer,
        name: &str,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocate(name, requirements, flags, true)?;

        let bound = unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(allocation)?;
            return Err(e).context("vkBindBufferMemory failed");
        }

        Ok(allocation)
    }

    /// Allocate memory for an optimally tiled `image` and bind it.
    pub fn allocate_image(
        &self,
        device: &ash::Device,
        image: vk::Image,
        name: &str,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<Allocation> {
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = self.allocate(name, requirements, flags, false)?;

        let bound = unsafe {
            device.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free(allocation)?;
            return Err(e).context("vkBindImageMemory failed");
        }

        Ok(allocation)
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        self.inner
            .lock()
            .free(allocation)
            .context("Failed to free GPU allocation")
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        linear: bool,
    ) -> Result<Allocation> {
        let location = memory_location(flags);
        log::debug!(
            "Allocating '{}': {} bytes, {:?} -> {:?}",
            name,
            requirements.size,
            flags,
            location
        );

        self.inner
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_maps_to_gpu_only() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn staging_flags_map_to_cpu_to_gpu() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(memory_location(flags), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn cached_host_memory_is_for_readback() {
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        assert_eq!(memory_location(flags), MemoryLocation::GpuToCpu);
    }

    #[test]
    fn host_visible_wins_over_device_local() {
        // ReBAR style request: still needs a CPU mapping.
        let flags = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(memory_location(flags), MemoryLocation::CpuToGpu);
    }

    #[test]
    fn no_flags_is_unknown() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::empty()),
            MemoryLocation::Unknown
        );
    }
}
