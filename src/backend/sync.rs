// Synchronization primitives
//
// One set per frame slot. The fence gates CPU reuse of the slot; the two
// semaphores order acquire -> render -> present on the GPU.

use anyhow::{Context, Result};
use ash::vk;

use super::rollback::Rollback;

/// Maximum number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
#[derive(Clone)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut rollback = Rollback::new();
        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            rollback.push({
                let device = device.clone();
                move || device.destroy_semaphore(image_available, None)
            });

            let render_finished = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create render-finished semaphore")?;
            rollback.push({
                let device = device.clone();
                move || device.destroy_semaphore(render_finished, None)
            });

            let in_flight_fence = device
                .create_fence(&fence_info, None)
                .context("Failed to create in-flight fence")?;

            rollback.commit();
            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    /// Create one set per frame slot. A failure releases the sets already
    /// built.
    pub fn create_all(device: &ash::Device) -> Result<Vec<Self>> {
        let mut rollback = Rollback::new();
        let mut frames = Vec::with_capacity(FRAMES_IN_FLIGHT);

        for _ in 0..FRAMES_IN_FLIGHT {
            let sync = Self::new(device)?;
            rollback.push({
                let device = device.clone();
                let sync = sync.clone();
                move || sync.destroy(&device)
            });
            frames.push(sync);
        }

        rollback.commit();
        Ok(frames)
    }

    /// Replace the image-available semaphore.
    ///
    /// An acquire that reported a stale swapchain may still have left the
    /// old semaphore with a pending signal. Only call with the device idle.
    pub fn renew_image_available(&mut self, device: &ash::Device) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fresh = unsafe { device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create image-available semaphore")?;

        unsafe { device.destroy_semaphore(self.image_available, None) };
        self.image_available = fresh;
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
