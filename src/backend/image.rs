// 2D images, views, samplers and layout transitions
//
// Textures are uploaded once through a staging buffer:
//   UNDEFINED -> TRANSFER_DST_OPTIMAL -> copy -> SHADER_READ_ONLY_OPTIMAL

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use std::sync::Arc;

use super::buffer::{GpuBuffer, HOST_READ_MEMORY, HOST_WRITE_MEMORY};
use super::{CommandPool, VulkanDevice};
use crate::error::HarnessError;

/// The one texture format the harness uploads.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const COLOR_SUBRESOURCE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Byte length of a tightly packed RGBA8 image.
pub fn rgba8_byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Access masks and pipeline stages for a supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for `old -> new`, or None if the pair is not supported.
pub fn layout_transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Option<TransitionMasks> {
    use vk::ImageLayout as L;

    let masks = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        // Readback of a sampled texture and back again
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::SHADER_READ,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        },
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionMasks {
            src_access: vk::AccessFlags::TRANSFER_READ,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        },
        _ => return None,
    };

    Some(masks)
}

/// Record a pipeline barrier moving `image` from `old` to `new`.
pub fn record_layout_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks =
        layout_transition_masks(old, new).ok_or(HarnessError::UnsupportedTransition { old, new })?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_SUBRESOURCE)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
    Ok(())
}

fn full_image_copy(width: u32, height: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .build()
}

/// Create a 2D color view with identity swizzle. Also used for swapchain
/// images.
pub fn create_image_view_2d(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(COLOR_SUBRESOURCE);

    unsafe { device.create_image_view(&create_info, None) }.context("Failed to create image view")
}

/// A single-mip, single-layer, optimally tiled 2D image and its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    pub fn new(
        device: &Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let allocation =
            match device
                .allocator
                .allocate_image(&device.device, image, name, memory_flags)
            {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { device.device.destroy_image(image, None) };
                    return Err(e);
                }
            };

        Ok(Self {
            image,
            format,
            width,
            height,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    /// Copy the image back to the host as tightly packed RGBA8.
    ///
    /// The image must be in SHADER_READ_ONLY_OPTIMAL and created with
    /// TRANSFER_SRC usage; it is left in SHADER_READ_ONLY_OPTIMAL.
    pub fn download(&self, pool: &CommandPool) -> Result<Vec<u8>> {
        let size = rgba8_byte_len(self.width, self.height) as vk::DeviceSize;
        let readback = GpuBuffer::new(
            &self.device,
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            HOST_READ_MEMORY,
            "image readback",
        )?;

        pool.submit_one_shot(|device, cmd| {
            record_layout_transition(
                device,
                cmd,
                self.image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    readback.buffer,
                    &[full_image_copy(self.width, self.height)],
                )
            };
            record_layout_transition(
                device,
                cmd,
                self.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        })
        .context("Failed to download image")?;

        readback.read_bytes()
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator.free(allocation) {
                log::error!("{:?}", e);
            }
        }
    }
}

/// A sampled texture: device-local image plus its view.
pub struct Texture {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Texture {
    /// Upload tightly packed RGBA8 `pixels` into a device-local image in
    /// SHADER_READ_ONLY_OPTIMAL layout.
    pub fn upload_rgba8(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        pixels: &[u8],
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let expected = rgba8_byte_len(width, height);
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(HarnessError::TextureSizeMismatch {
                width,
                height,
                expected,
                actual: pixels.len(),
            }
            .into());
        }

        // Step 1: staging buffer with the pixels
        let mut staging = GpuBuffer::new(
            device,
            expected as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_WRITE_MEMORY,
            &format!("{} (staging)", name),
        )?;
        staging.write(pixels)?;

        // Step 2: destination image
        let image = GpuImage::new(
            device,
            width,
            height,
            TEXTURE_FORMAT,
            usage | vk::ImageUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            name,
        )?;

        // Step 3: transition, copy, transition
        pool.submit_one_shot(|device, cmd| {
            record_layout_transition(
                device,
                cmd,
                image.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[full_image_copy(width, height)],
                )
            };
            record_layout_transition(
                device,
                cmd,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        })
        .with_context(|| format!("Failed to upload texture '{}'", name))?;

        // Step 4
        drop(staging);

        let view = create_image_view_2d(&device.device, image.image, TEXTURE_FORMAT)?;

        log::info!("Uploaded texture '{}' ({}x{})", name, width, height);
        Ok(Self { image, view })
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        // View goes before the image it points into
        unsafe { self.image.device.device.destroy_image_view(self.view, None) };
    }
}

pub struct TextureSampler {
    pub sampler: vk::Sampler,
    device: Arc<VulkanDevice>,
}

impl TextureSampler {
    /// Linear filtering, repeat addressing, anisotropic, single LOD.
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(device.max_sampler_anisotropy())
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        let sampler = unsafe { device.device.create_sampler(&create_info, None) }
            .context("Failed to create sampler")?;

        Ok(Self {
            sampler,
            device: device.clone(),
        })
    }
}

impl Drop for TextureSampler {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_sampler(self.sampler, None) };
    }
}
