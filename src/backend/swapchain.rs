// Swapchain - Window presentation
//
// Owns the presentable images, one view and one framebuffer per image, and
// the render pass the framebuffers are bound to. Always destroyed and
// recreated as a whole; there is no partial rebuild.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;

use super::image::create_image_view_2d;
use super::VulkanDevice;
use crate::error::HarnessError;
use crate::frame::{AcquireOutcome, SurfaceStatus};

/// Fewest presentable images we ask for.
pub const MIN_IMAGE_COUNT: u32 = 2;

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Prefer B8G8R8A8_UNORM / SRGB_NONLINEAR, otherwise take what the surface
/// lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    match formats {
        [] => Err(HarnessError::NoSurfaceFormats.into()),
        // A lone UNDEFINED entry means the surface takes any format
        [only] if only.format == vk::Format::UNDEFINED => Ok(PREFERRED_FORMAT),
        _ => Ok(formats
            .iter()
            .copied()
            .find(|f| {
                f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
            })
            .unwrap_or(formats[0])),
    }
}

/// At least two images, within what the surface allows (max 0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count.max(MIN_IMAGE_COUNT);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// The surface's current extent, or the window size clamped to the
/// surface limits when the surface leaves it to us.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// The requested mode if supported, FIFO (always available) otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        if requested != vk::PresentModeKHR::FIFO {
            log::warn!("Present mode {:?} unsupported, using FIFO", requested);
        }
        vk::PresentModeKHR::FIFO
    }
}

/// Map a vkAcquireNextImageKHR result. Out-of-date and suboptimal are both
/// stale; anything else that is not success is fatal.
pub fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<AcquireOutcome, vk::Result> {
    match result {
        Ok((index, false)) => Ok(AcquireOutcome::Image(index)),
        Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
        Err(e) => Err(e),
    }
}

/// Map a vkQueuePresentKHR result, same policy as acquire.
pub fn classify_present(result: VkResult<bool>) -> Result<SurfaceStatus, vk::Result> {
    match result {
        Ok(false) => Ok(SurfaceStatus::Optimal),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::Stale),
        Err(e) => Err(e),
    }
}

/// Single color attachment: cleared on load, stored, handed to present.
pub fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachment_refs)
        .build();

    // Wait for the acquire semaphore's stage before writing the attachment
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
        .context("Failed to create render pass")
}

/// One framebuffer per image view, in the same order.
pub fn create_framebuffers(
    device: &ash::Device,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| {
            let attachments = [image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")
        })
        .collect()
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Swapchain {
    /// Query the surface and choose the swapchain parameters for a
    /// `width` x `height` window. Returns None while the surface has no
    /// area (minimised window).
    pub fn surface_extent(
        device: &VulkanDevice,
        width: u32,
        height: u32,
    ) -> Result<Option<vk::Extent2D>> {
        let surface = device.surface()?;
        let caps = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(device.physical_device, surface.handle)
        }
        .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")?;

        let extent = choose_extent(&caps, width, height);
        Ok((extent.width > 0 && extent.height > 0).then_some(extent))
    }

    /// Absent -> Present: swapchain, views, render pass, framebuffers.
    pub fn new(
        device: &VulkanDevice,
        width: u32,
        height: u32,
        requested_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface = device.surface()?;

        let (caps, formats, present_modes) = unsafe {
            (
                surface
                    .loader
                    .get_physical_device_surface_capabilities(device.physical_device, surface.handle)
                    .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")?,
                surface
                    .loader
                    .get_physical_device_surface_formats(device.physical_device, surface.handle)
                    .context("vkGetPhysicalDeviceSurfaceFormatsKHR failed")?,
                surface
                    .loader
                    .get_physical_device_surface_present_modes(
                        device.physical_device,
                        surface.handle,
                    )
                    .context("vkGetPhysicalDeviceSurfacePresentModesKHR failed")?,
            )
        };

        let surface_format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&present_modes, requested_mode);
        let extent = choose_extent(&caps, width, height);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .context("vkCreateSwapchainKHR failed")?;

        // From here on every partially built piece lives in `swapchain`
        // so a failure can release it through destroy()
        let mut swapchain = Self {
            handle,
            loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
        };

        if let Err(e) = swapchain.create_attachments(&device.device) {
            swapchain.destroy(&device.device);
            return Err(e);
        }

        log::info!("Created swapchain with {} images", swapchain.images.len());
        Ok(swapchain)
    }

    fn create_attachments(&mut self, device: &ash::Device) -> Result<()> {
        self.images = unsafe { self.loader.get_swapchain_images(self.handle) }
            .context("vkGetSwapchainImagesKHR failed")?;

        for &image in &self.images {
            let view = create_image_view_2d(device, image, self.format)?;
            self.image_views.push(view);
        }

        self.render_pass = create_render_pass(device, self.format)?;
        self.framebuffers =
            create_framebuffers(device, &self.image_views, self.render_pass, self.extent)?;

        anyhow::ensure!(
            self.image_views.len() == self.images.len()
                && self.framebuffers.len() == self.images.len(),
            "Swapchain attachments out of step: {} images, {} views, {} framebuffers",
            self.images.len(),
            self.image_views.len(),
            self.framebuffers.len()
        );
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };
        classify_acquire(result).context("vkAcquireNextImageKHR failed")
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SurfaceStatus> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        classify_present(result).context("vkQueuePresentKHR failed")
    }

    pub fn destroy_framebuffers(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(framebuffer, None) };
        }
    }

    /// Render pass, views, then the swapchain itself. The images belong to
    /// the swapchain. Framebuffers must already be gone.
    pub fn destroy(&mut self, device: &ash::Device) {
        // Normally a no-op; covers the failure path in new()
        self.destroy_framebuffers(device);

        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            self.images.clear();
            self.loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    const UNDEFINED_EXTENT: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    #[test]
    fn prefers_bgra_unorm_srgb_nonlinear() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            PREFERRED_FORMAT,
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), PREFERRED_FORMAT);
    }

    #[test]
    fn falls_back_to_first_format() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        };
        let formats = [
            first,
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).unwrap(), first);
    }

    #[test]
    fn empty_format_list_is_fatal() {
        let err = choose_surface_format(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn requests_at_least_two_images() {
        assert_eq!(choose_image_count(&caps(1, 0, UNDEFINED_EXTENT)), 2);
        assert_eq!(choose_image_count(&caps(3, 8, UNDEFINED_EXTENT)), 3);
        // Surface capped at one image wins
        assert_eq!(choose_image_count(&caps(1, 1, UNDEFINED_EXTENT)), 1);
    }

    #[test]
    fn extent_follows_surface_when_defined() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(choose_extent(&caps(2, 0, current), 1024, 768), current);
    }

    #[test]
    fn extent_clamps_window_size_when_surface_is_undefined() {
        let extent = choose_extent(&caps(2, 0, UNDEFINED_EXTENT), 10_000, 0);
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn acquire_classification() {
        assert_eq!(classify_acquire(Ok((2, false))), Ok(AcquireOutcome::Image(2)));
        assert_eq!(classify_acquire(Ok((2, true))), Ok(AcquireOutcome::Stale));
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(AcquireOutcome::Stale)
        );
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn present_classification() {
        assert_eq!(classify_present(Ok(false)), Ok(SurfaceStatus::Optimal));
        assert_eq!(classify_present(Ok(true)), Ok(SurfaceStatus::Stale));
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(SurfaceStatus::Stale)
        );
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR)
        );
    }
}
