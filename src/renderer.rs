// Vulkan renderer - owns every GPU object behind the frame loop
//
// Long-lived scene resources (geometry, texture, uniforms, descriptors) are
// created once. The swapchain and everything baked against it (pipeline,
// recorded command buffers) form the chain. The order of its build and
// teardown lives in `chain`; this file supplies the Vulkan calls.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::assets::{UniformBufferObject, QUAD_INDICES, QUAD_VERTICES};
use crate::backend::buffer::HOST_WRITE_MEMORY;
use crate::backend::commands::{command_buffer_for_image, record_draw_commands, DrawRecording};
use crate::backend::descriptors::DescriptorBindings;
use crate::backend::image::TextureSampler;
use crate::backend::pipeline::{create_graphics_pipeline, GraphicsPipeline};
use crate::backend::shader::ShaderBlobs;
use crate::backend::sync::FrameSync;
use crate::backend::{CommandPool, GpuBuffer, Swapchain, Texture, VulkanDevice};
use crate::chain::{ChainBackend, ChainState, PresentChain};
use crate::frame::{AcquireOutcome, FrameTarget, SurfaceStatus};
use crate::HarnessOptions;

/// Counters for logging and consistency checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub rebuilds: u32,
    pub image_count: usize,
    pub extent: (u32, u32),
}

type VulkanChainState = ChainState<Swapchain, GraphicsPipeline, vk::CommandBuffer>;
type VulkanPresentChain = PresentChain<Swapchain, GraphicsPipeline, vk::CommandBuffer>;

/// Created once, destroyed once, never touched by a rebuild.
// Field order is drop order; the command pool goes last
struct SceneResources {
    descriptors: DescriptorBindings,
    sampler: TextureSampler,
    texture: Texture,
    uniform_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    command_pool: CommandPool,
}

impl SceneResources {
    fn new(device: &Arc<VulkanDevice>, options: &HarnessOptions) -> Result<Self> {
        let command_pool = CommandPool::new(device)?;

        let vertex_buffer = GpuBuffer::device_local_with_data(
            device,
            &command_pool,
            &QUAD_VERTICES,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "quad vertices",
        )?;
        let index_buffer = GpuBuffer::device_local_with_data(
            device,
            &command_pool,
            &QUAD_INDICES,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "quad indices",
        )?;

        // Written once; nothing animates
        let ubo = UniformBufferObject::fixed();
        let mut uniform_buffer = GpuBuffer::new(
            device,
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            HOST_WRITE_MEMORY,
            "uniforms",
        )?;
        uniform_buffer.write(std::slice::from_ref(&ubo))?;

        let texture = Texture::upload_rgba8(
            device,
            &command_pool,
            &options.texture.pixels,
            options.texture.width,
            options.texture.height,
            vk::ImageUsageFlags::SAMPLED,
            "quad texture",
        )?;
        let sampler = TextureSampler::new(device)?;

        let descriptors = DescriptorBindings::new(device)?;
        descriptors.write(
            uniform_buffer.buffer,
            uniform_buffer.size,
            texture.view,
            sampler.sampler,
        );

        Ok(Self {
            descriptors,
            sampler,
            texture,
            uniform_buffer,
            index_buffer,
            vertex_buffer,
            command_pool,
        })
    }
}

/// The Vulkan calls behind each step of the chain lifecycle.
struct VulkanChain<'a> {
    device: &'a VulkanDevice,
    scene: &'a SceneResources,
    frames: &'a mut [FrameSync],
    shaders: &'a ShaderBlobs,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
}

impl ChainBackend for VulkanChain<'_> {
    type Swapchain = Swapchain;
    type Pipeline = GraphicsPipeline;
    type CommandBuffer = vk::CommandBuffer;

    fn surface_extent(&mut self, width: u32, height: u32) -> Result<Option<vk::Extent2D>> {
        Swapchain::surface_extent(self.device, width, height)
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> Result<Swapchain> {
        Swapchain::new(self.device, width, height, self.present_mode)
    }

    fn create_pipeline(&mut self, swapchain: &Swapchain) -> Result<GraphicsPipeline> {
        create_graphics_pipeline(
            &self.device.device,
            swapchain.render_pass,
            swapchain.extent,
            self.scene.descriptors.set_layout,
            self.shaders,
        )
    }

    fn record_commands(
        &mut self,
        swapchain: &Swapchain,
        pipeline: &GraphicsPipeline,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let scene = self.scene;
        let command_buffers = scene
            .command_pool
            .allocate(swapchain.image_count() as u32)?;

        let recorded = record_draw_commands(
            &self.device.device,
            &command_buffers,
            &DrawRecording {
                render_pass: swapchain.render_pass,
                framebuffers: &swapchain.framebuffers,
                extent: swapchain.extent,
                pipeline: pipeline.pipeline,
                pipeline_layout: pipeline.layout,
                descriptor_set: scene.descriptors.set,
                vertex_buffer: scene.vertex_buffer.buffer,
                index_buffer: scene.index_buffer.buffer,
                index_count: QUAD_INDICES.len() as u32,
                clear_color: self.clear_color,
            },
        );

        match recorded {
            Ok(()) => Ok(command_buffers),
            Err(e) => {
                scene.command_pool.free(&command_buffers);
                Err(e)
            }
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn renew_acquire_semaphores(&mut self) -> Result<()> {
        // Device is idle: no acquire can still be pending on these
        for sync in self.frames.iter_mut() {
            sync.renew_image_available(&self.device.device)?;
        }
        Ok(())
    }

    fn destroy_framebuffers(&mut self, swapchain: &mut Swapchain) {
        swapchain.destroy_framebuffers(&self.device.device);
    }

    fn free_command_buffers(&mut self, command_buffers: Vec<vk::CommandBuffer>) {
        self.scene.command_pool.free(&command_buffers);
    }

    fn destroy_pipeline(&mut self, pipeline: GraphicsPipeline) {
        pipeline.destroy(&self.device.device);
    }

    fn destroy_swapchain(&mut self, mut swapchain: Swapchain) {
        swapchain.destroy(&self.device.device);
    }
}

pub struct Renderer {
    chain: VulkanChainState,
    frames: Vec<FrameSync>,
    scene: Option<SceneResources>,
    shaders: ShaderBlobs,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    desired_extent: (u32, u32),
    stats: RendererStats,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        options: HarnessOptions,
    ) -> Result<Self> {
        let scene = SceneResources::new(&device, &options)?;
        let frames = FrameSync::create_all(&device.device)?;

        let mut renderer = Self {
            chain: ChainState::Absent,
            frames,
            scene: Some(scene),
            shaders: options.shaders,
            present_mode: options.present_mode,
            clear_color: options.clear_color,
            desired_extent: (width, height),
            stats: RendererStats::default(),
            device,
        };

        // On failure the drop below waits idle and releases what exists
        renderer.build_chain()?;
        Ok(renderer)
    }

    pub fn stats(&self) -> RendererStats {
        self.stats
    }

    /// Record the window's new size. The rebuild itself waits for the
    /// surface to report staleness.
    pub fn resize(&mut self, width: u32, height: u32) {
        log::debug!("Window resized to {}x{}", width, height);
        self.desired_extent = (width, height);
    }

    /// Number of frame slots with their own sync objects.
    pub fn frame_slots(&self) -> usize {
        self.frames.len()
    }

    /// Run `f` against the chain with a backend borrowed from `self`.
    fn with_chain<R>(
        &mut self,
        f: impl FnOnce(&mut VulkanChainState, &mut VulkanChain<'_>) -> R,
    ) -> Result<R> {
        let scene = self.scene.as_ref().context("Renderer already released")?;
        let mut backend = VulkanChain {
            device: &self.device,
            scene,
            frames: &mut self.frames,
            shaders: &self.shaders,
            present_mode: self.present_mode,
            clear_color: self.clear_color,
        };
        Ok(f(&mut self.chain, &mut backend))
    }

    /// Absent -> Present. Stays Absent while the surface has no area.
    fn build_chain(&mut self) -> Result<()> {
        let (width, height) = self.desired_extent;
        self.with_chain(|chain, backend| chain.build(backend, width, height))??;
        self.update_chain_stats();
        Ok(())
    }

    fn update_chain_stats(&mut self) {
        if let Some(chain) = self.chain.present() {
            self.stats.image_count = chain.swapchain.image_count();
            self.stats.extent = (chain.swapchain.extent.width, chain.swapchain.extent.height);
        }
    }

    fn present_chain(&self) -> Result<&VulkanPresentChain> {
        self.chain.present().context("No swapchain to render to")
    }
}

impl FrameTarget for Renderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("vkWaitForFences failed")
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }.context("vkResetFences failed")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        match self.chain.present() {
            Some(chain) => chain
                .swapchain
                .acquire_next_image(self.frames[slot].image_available),
            // Deferred by a zero-sized surface; ask for another rebuild
            None => Ok(AcquireOutcome::Stale),
        }
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let chain = self.present_chain()?;
        let command_buffer = command_buffer_for_image(&chain.command_buffers, image_index)?;
        let sync = &self.frames[slot];

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.queue,
                &[submit_info.build()],
                sync.in_flight_fence,
            )
        }
        .context("vkQueueSubmit failed")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<SurfaceStatus> {
        let chain = self.present_chain()?;
        chain.swapchain.present(
            self.device.queue,
            image_index,
            &[self.frames[slot].render_finished],
        )
    }

    fn rebuild_swapchain(&mut self) -> Result<()> {
        let (width, height) = self.desired_extent;
        let present = self.with_chain(|chain, backend| chain.rebuild(backend, width, height))??;

        if !present {
            log::debug!("Swapchain rebuild deferred until the surface has area");
            return Ok(());
        }

        self.update_chain_stats();
        self.stats.rebuilds += 1;
        log::info!(
            "Swapchain rebuilt ({} so far): {}x{}, {} images",
            self.stats.rebuilds,
            self.stats.extent.0,
            self.stats.extent.1,
            self.stats.image_count
        );
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn release_resources(&mut self) {
        // The chain can only be Present while the scene exists
        if self.scene.is_some() {
            let _ = self.with_chain(|chain, backend| chain.release(backend));
        }

        let device = &self.device.device;
        for sync in self.frames.drain(..) {
            sync.destroy(device);
        }

        // Descriptors, sampler, texture, buffers, then the pool
        self.scene = None;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if self.scene.is_none() {
            return;
        }

        if let Err(e) = crate::frame::shutdown(self) {
            // Never destroy what the GPU may still be using
            log::error!("{:?}; leaking GPU resources", e);
            if let Some(scene) = self.scene.take() {
                std::mem::forget(scene);
            }
        }
    }
}
