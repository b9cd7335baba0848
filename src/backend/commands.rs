// Command pool, one-shot submission and the pre-recorded draw sequence
//
// Per-image command buffers are recorded once and resubmitted every frame.
// They are freed and re-recorded whenever the swapchain is rebuilt.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::HarnessError;

/// Command pool on the graphics queue family.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        // No RESET flag: buffers are freed wholesale, never reset one by one
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        unsafe {
            self.device
                .device
                .free_command_buffers(self.pool, command_buffers)
        };
    }

    /// Record and run a throwaway command buffer, blocking until the queue
    /// is idle.
    ///
    /// Only meant for startup uploads and debug readback: the queue-idle
    /// wait serializes everything behind it.
    pub fn submit_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.allocate(1)?[0];
        let result = self.run_one_shot(cmd, record);
        self.free(&[cmd]);
        result
    }

    fn run_one_shot<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("vkBeginCommandBuffer failed")?;

        record(device, cmd)?;

        unsafe { device.end_command_buffer(cmd) }.context("vkEndCommandBuffer failed")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .queue_submit(self.device.queue, &[submit_info.build()], vk::Fence::null())
                .context("vkQueueSubmit failed")?;
            device
                .queue_wait_idle(self.device.queue)
                .context("vkQueueWaitIdle failed")?;
        }

        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees any command buffers still allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// Everything the fixed draw sequence references.
pub struct DrawRecording<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub clear_color: [f32; 4],
}

/// Pair command buffer `i` with framebuffer `i`. The two sequences must
/// have the same length (one command buffer per swapchain image).
pub fn pair_with_framebuffers(
    command_buffers: &[vk::CommandBuffer],
    framebuffers: &[vk::Framebuffer],
) -> Result<Vec<(vk::CommandBuffer, vk::Framebuffer)>> {
    if command_buffers.len() != framebuffers.len() {
        anyhow::bail!(
            "{} command buffers for {} framebuffers",
            command_buffers.len(),
            framebuffers.len()
        );
    }

    Ok(command_buffers
        .iter()
        .copied()
        .zip(framebuffers.iter().copied())
        .collect())
}

/// Record the fixed draw sequence into every command buffer.
///
/// Per framebuffer: begin render pass (clear), bind descriptor set, bind
/// pipeline, bind vertex + index buffers, indexed draw, end render pass.
pub fn record_draw_commands(
    device: &ash::Device,
    command_buffers: &[vk::CommandBuffer],
    draw: &DrawRecording,
) -> Result<()> {
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: draw.clear_color,
        },
    }];
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: draw.extent,
    };

    for (cmd, framebuffer) in pair_with_framebuffers(command_buffers, draw.framebuffers)? {
        // Resubmitted every frame, possibly while a previous submission
        // of the same buffer is still pending
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(draw.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("vkBeginCommandBuffer failed")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                draw.pipeline_layout,
                0,
                &[draw.descriptor_set],
                &[],
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("vkEndCommandBuffer failed")?;
        }
    }

    log::debug!("Recorded {} draw command buffers", command_buffers.len());
    Ok(())
}

/// Look up the pre-recorded command buffer for an acquired image.
pub fn command_buffer_for_image(
    command_buffers: &[vk::CommandBuffer],
    image_index: u32,
) -> Result<vk::CommandBuffer> {
    command_buffers
        .get(image_index as usize)
        .copied()
        .ok_or_else(|| {
            HarnessError::ImageIndexOutOfRange {
                index: image_index,
                count: command_buffers.len(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn command_buffers(raw: &[u64]) -> Vec<vk::CommandBuffer> {
        raw.iter().map(|&r| vk::CommandBuffer::from_raw(r)).collect()
    }

    fn framebuffers(raw: &[u64]) -> Vec<vk::Framebuffer> {
        raw.iter().map(|&r| vk::Framebuffer::from_raw(r)).collect()
    }

    #[test]
    fn pairs_by_index() {
        let cmds = command_buffers(&[1, 2, 3]);
        let fbs = framebuffers(&[10, 20, 30]);

        let pairs = pair_with_framebuffers(&cmds, &fbs).unwrap();
        assert_eq!(pairs.len(), 3);
        for (i, (cmd, fb)) in pairs.iter().enumerate() {
            assert_eq!(*cmd, cmds[i]);
            assert_eq!(*fb, fbs[i]);
        }
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let cmds = command_buffers(&[1, 2]);
        let fbs = framebuffers(&[10, 20, 30]);
        assert!(pair_with_framebuffers(&cmds, &fbs).is_err());
    }

    #[test]
    fn image_index_selects_command_buffer() {
        let cmds = command_buffers(&[7, 8, 9]);
        assert_eq!(command_buffer_for_image(&cmds, 2).unwrap(), cmds[2]);
        assert!(command_buffer_for_image(&cmds, 3).is_err());
    }
}
