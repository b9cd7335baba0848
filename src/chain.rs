// Present chain lifecycle
//
// The swapchain and everything baked against it (pipeline, per-image
// command buffers) is built and torn down as one unit. The chain is either
// Absent or Present; there is no partial state in between.
//
// BUILD (Absent -> Present):
// 1. Query the surface; stay Absent while it has no area
// 2. Swapchain with its views, render pass and framebuffers
// 3. Pipeline against the new render pass and extent
// 4. One command buffer per image, recorded against its framebuffer
//
// TEARDOWN (Present -> Absent):
// 1. Wait for the device to go idle
// 2. Framebuffers, command buffers, pipeline
// 3. Render pass and views, then the swapchain

use anyhow::Result;
use ash::vk;

/// Device operations the chain lifecycle is built from.
pub trait ChainBackend {
    type Swapchain;
    type Pipeline;
    type CommandBuffer;

    /// The extent a swapchain would get, or None while the surface has no
    /// area.
    fn surface_extent(&mut self, width: u32, height: u32) -> Result<Option<vk::Extent2D>>;

    /// Swapchain plus one view and one framebuffer per image. Cleans up
    /// after itself on failure.
    fn create_swapchain(&mut self, width: u32, height: u32) -> Result<Self::Swapchain>;

    fn create_pipeline(&mut self, swapchain: &Self::Swapchain) -> Result<Self::Pipeline>;

    /// One command buffer per swapchain image, in image order. Frees what it
    /// allocated on failure.
    fn record_commands(
        &mut self,
        swapchain: &Self::Swapchain,
        pipeline: &Self::Pipeline,
    ) -> Result<Vec<Self::CommandBuffer>>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Called between teardown and build of a rebuild, with the device idle.
    fn renew_acquire_semaphores(&mut self) -> Result<()>;

    fn destroy_framebuffers(&mut self, swapchain: &mut Self::Swapchain);
    fn free_command_buffers(&mut self, command_buffers: Vec<Self::CommandBuffer>);
    fn destroy_pipeline(&mut self, pipeline: Self::Pipeline);

    /// Render pass and views, then the swapchain itself.
    fn destroy_swapchain(&mut self, swapchain: Self::Swapchain);
}

pub struct PresentChain<S, P, C> {
    pub swapchain: S,
    pub pipeline: P,
    pub command_buffers: Vec<C>,
}

pub enum ChainState<S, P, C> {
    Absent,
    Present(PresentChain<S, P, C>),
}

impl<S, P, C> ChainState<S, P, C> {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn present(&self) -> Option<&PresentChain<S, P, C>> {
        match self {
            Self::Present(chain) => Some(chain),
            Self::Absent => None,
        }
    }

    /// Absent -> Present. Stays Absent while the surface has no area.
    pub fn build<B>(&mut self, backend: &mut B, width: u32, height: u32) -> Result<()>
    where
        B: ChainBackend<Swapchain = S, Pipeline = P, CommandBuffer = C>,
    {
        if self.is_present() {
            anyhow::bail!("Swapchain already built; tear it down first");
        }

        if backend.surface_extent(width, height)?.is_none() {
            log::info!("Surface has zero area, deferring swapchain creation");
            return Ok(());
        }

        let mut swapchain = backend.create_swapchain(width, height)?;

        let pipeline = match backend.create_pipeline(&swapchain) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                backend.destroy_framebuffers(&mut swapchain);
                backend.destroy_swapchain(swapchain);
                return Err(e);
            }
        };

        let command_buffers = match backend.record_commands(&swapchain, &pipeline) {
            Ok(command_buffers) => command_buffers,
            Err(e) => {
                destroy_chain(
                    backend,
                    PresentChain {
                        swapchain,
                        pipeline,
                        command_buffers: Vec::new(),
                    },
                );
                return Err(e);
            }
        };

        *self = Self::Present(PresentChain {
            swapchain,
            pipeline,
            command_buffers,
        });
        Ok(())
    }

    /// Present -> Absent, after the device has gone idle.
    pub fn teardown<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: ChainBackend<Swapchain = S, Pipeline = P, CommandBuffer = C>,
    {
        backend.wait_idle()?;
        self.release(backend);
        Ok(())
    }

    /// Present -> Absent without waiting. The device must already be idle.
    pub fn release<B>(&mut self, backend: &mut B)
    where
        B: ChainBackend<Swapchain = S, Pipeline = P, CommandBuffer = C>,
    {
        if let Self::Present(chain) = std::mem::replace(self, Self::Absent) {
            destroy_chain(backend, chain);
        }
    }

    /// Full teardown, then a fresh build. Returns whether a chain is
    /// present afterwards (false while the surface has no area).
    pub fn rebuild<B>(&mut self, backend: &mut B, width: u32, height: u32) -> Result<bool>
    where
        B: ChainBackend<Swapchain = S, Pipeline = P, CommandBuffer = C>,
    {
        self.teardown(backend)?;
        backend.renew_acquire_semaphores()?;
        self.build(backend, width, height)?;
        Ok(self.is_present())
    }
}

fn destroy_chain<B: ChainBackend>(
    backend: &mut B,
    mut chain: PresentChain<B::Swapchain, B::Pipeline, B::CommandBuffer>,
) {
    backend.destroy_framebuffers(&mut chain.swapchain);
    backend.free_command_buffers(chain.command_buffers);
    backend.destroy_pipeline(chain.pipeline);
    backend.destroy_swapchain(chain.swapchain);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::swapchain::{choose_extent, choose_image_count};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        SurfaceExtent,
        CreateSwapchain,
        CreatePipeline,
        RecordCommands,
        WaitIdle,
        RenewSemaphores,
        DestroyFramebuffers,
        FreeCommandBuffers,
        DestroyPipeline,
        DestroySwapchain,
    }

    struct FakeSwapchain {
        images: Vec<u64>,
        views: Vec<u64>,
        framebuffers: Vec<u64>,
        extent: vk::Extent2D,
    }

    /// A command buffer remembers the framebuffer it was recorded against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FakeCommandBuffer {
        framebuffer: u64,
    }

    struct RecordingBackend {
        calls: Vec<Call>,
        caps: vk::SurfaceCapabilitiesKHR,
        next_handle: u64,
        pipelines_alive: usize,
        command_buffers_alive: usize,
        swapchains_alive: usize,
        fail_pipeline: bool,
    }

    impl RecordingBackend {
        /// Surface that leaves the extent to us and allows 1..=8 images.
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                caps: vk::SurfaceCapabilitiesKHR {
                    min_image_count: 1,
                    max_image_count: 8,
                    current_extent: vk::Extent2D {
                        width: u32::MAX,
                        height: u32::MAX,
                    },
                    min_image_extent: vk::Extent2D {
                        width: 1,
                        height: 1,
                    },
                    max_image_extent: vk::Extent2D {
                        width: 4096,
                        height: 4096,
                    },
                    ..Default::default()
                },
                next_handle: 1,
                pipelines_alive: 0,
                command_buffers_alive: 0,
                swapchains_alive: 0,
                fail_pipeline: false,
            }
        }

        /// A minimised window: the surface reports a 0x0 extent.
        fn minimise(&mut self) {
            self.caps.current_extent = vk::Extent2D {
                width: 0,
                height: 0,
            };
        }

        fn handles(&mut self, count: usize) -> Vec<u64> {
            let start = self.next_handle;
            self.next_handle += count as u64;
            (start..self.next_handle).collect()
        }
    }

    impl ChainBackend for RecordingBackend {
        type Swapchain = FakeSwapchain;
        type Pipeline = u64;
        type CommandBuffer = FakeCommandBuffer;

        fn surface_extent(&mut self, width: u32, height: u32) -> Result<Option<vk::Extent2D>> {
            self.calls.push(Call::SurfaceExtent);
            let extent = choose_extent(&self.caps, width, height);
            Ok((extent.width > 0 && extent.height > 0).then_some(extent))
        }

        fn create_swapchain(&mut self, width: u32, height: u32) -> Result<FakeSwapchain> {
            self.calls.push(Call::CreateSwapchain);
            let count = choose_image_count(&self.caps) as usize;
            self.swapchains_alive += 1;
            Ok(FakeSwapchain {
                images: self.handles(count),
                views: self.handles(count),
                framebuffers: self.handles(count),
                extent: choose_extent(&self.caps, width, height),
            })
        }

        fn create_pipeline(&mut self, _swapchain: &FakeSwapchain) -> Result<u64> {
            self.calls.push(Call::CreatePipeline);
            if self.fail_pipeline {
                anyhow::bail!("pipeline creation failed");
            }
            self.pipelines_alive += 1;
            Ok(self.handles(1)[0])
        }

        fn record_commands(
            &mut self,
            swapchain: &FakeSwapchain,
            _pipeline: &u64,
        ) -> Result<Vec<FakeCommandBuffer>> {
            self.calls.push(Call::RecordCommands);
            self.command_buffers_alive += swapchain.framebuffers.len();
            Ok(swapchain
                .framebuffers
                .iter()
                .map(|&framebuffer| FakeCommandBuffer { framebuffer })
                .collect())
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.calls.push(Call::WaitIdle);
            Ok(())
        }

        fn renew_acquire_semaphores(&mut self) -> Result<()> {
            self.calls.push(Call::RenewSemaphores);
            Ok(())
        }

        fn destroy_framebuffers(&mut self, swapchain: &mut FakeSwapchain) {
            self.calls.push(Call::DestroyFramebuffers);
            swapchain.framebuffers.clear();
        }

        fn free_command_buffers(&mut self, command_buffers: Vec<FakeCommandBuffer>) {
            self.calls.push(Call::FreeCommandBuffers);
            self.command_buffers_alive -= command_buffers.len();
        }

        fn destroy_pipeline(&mut self, _pipeline: u64) {
            self.calls.push(Call::DestroyPipeline);
            self.pipelines_alive -= 1;
        }

        fn destroy_swapchain(&mut self, swapchain: FakeSwapchain) {
            self.calls.push(Call::DestroySwapchain);
            assert!(
                swapchain.framebuffers.is_empty(),
                "framebuffers must go before the swapchain"
            );
            self.swapchains_alive -= 1;
        }
    }

    type FakeChain = ChainState<FakeSwapchain, u64, FakeCommandBuffer>;

    fn assert_consistent(chain: &PresentChain<FakeSwapchain, u64, FakeCommandBuffer>) {
        let swapchain = &chain.swapchain;
        assert_eq!(swapchain.views.len(), swapchain.images.len());
        assert_eq!(swapchain.framebuffers.len(), swapchain.images.len());
        assert_eq!(chain.command_buffers.len(), swapchain.images.len());
        for (cmd, framebuffer) in chain.command_buffers.iter().zip(&swapchain.framebuffers) {
            assert_eq!(cmd.framebuffer, *framebuffer);
        }
    }

    #[test]
    fn initial_build_at_800x600() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;

        chain.build(&mut backend, 800, 600).unwrap();

        let present = chain.present().expect("chain should be present");
        assert!(present.swapchain.images.len() >= 2);
        assert_eq!(
            present.swapchain.extent,
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert_consistent(present);
        assert_eq!(backend.pipelines_alive, 1);
        assert_eq!(backend.command_buffers_alive, present.swapchain.images.len());
        assert_eq!(
            backend.calls,
            vec![
                Call::SurfaceExtent,
                Call::CreateSwapchain,
                Call::CreatePipeline,
                Call::RecordCommands,
            ]
        );
    }

    #[test]
    fn teardown_waits_idle_then_destroys_in_dependency_order() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;
        chain.build(&mut backend, 800, 600).unwrap();
        backend.calls.clear();

        chain.teardown(&mut backend).unwrap();

        assert!(!chain.is_present());
        assert_eq!(
            backend.calls,
            vec![
                Call::WaitIdle,
                Call::DestroyFramebuffers,
                Call::FreeCommandBuffers,
                Call::DestroyPipeline,
                Call::DestroySwapchain,
            ]
        );
        assert_eq!(backend.pipelines_alive, 0);
        assert_eq!(backend.command_buffers_alive, 0);
        assert_eq!(backend.swapchains_alive, 0);
    }

    #[test]
    fn rebuild_rerecords_against_the_new_framebuffers() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;
        chain.build(&mut backend, 800, 600).unwrap();
        let old_framebuffers = chain.present().unwrap().swapchain.framebuffers.clone();

        // The surface now wants more images than before
        backend.caps.min_image_count = 3;
        let present = chain.rebuild(&mut backend, 1024, 768).unwrap();

        assert!(present);
        let rebuilt = chain.present().unwrap();
        assert_eq!(rebuilt.swapchain.images.len(), 3);
        assert_consistent(rebuilt);
        assert!(rebuilt
            .command_buffers
            .iter()
            .all(|cmd| !old_framebuffers.contains(&cmd.framebuffer)));

        // Exactly one of everything survives
        assert_eq!(backend.swapchains_alive, 1);
        assert_eq!(backend.pipelines_alive, 1);
        assert_eq!(backend.command_buffers_alive, 3);
    }

    #[test]
    fn rebuild_renews_semaphores_between_teardown_and_build() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;
        chain.build(&mut backend, 800, 600).unwrap();
        backend.calls.clear();

        chain.rebuild(&mut backend, 800, 600).unwrap();

        let renew = backend
            .calls
            .iter()
            .position(|&c| c == Call::RenewSemaphores)
            .unwrap();
        let destroyed = backend
            .calls
            .iter()
            .position(|&c| c == Call::DestroySwapchain)
            .unwrap();
        let created = backend
            .calls
            .iter()
            .position(|&c| c == Call::CreateSwapchain)
            .unwrap();
        assert!(destroyed < renew && renew < created);
    }

    #[test]
    fn zero_area_surface_leaves_chain_absent() {
        let mut backend = RecordingBackend::new();
        backend.minimise();
        let mut chain = FakeChain::Absent;

        chain.build(&mut backend, 0, 0).unwrap();

        assert!(!chain.is_present());
        assert!(!backend.calls.contains(&Call::CreateSwapchain));
    }

    #[test]
    fn rebuild_onto_zero_area_surface_reports_absent() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;
        chain.build(&mut backend, 800, 600).unwrap();

        backend.minimise();
        let present = chain.rebuild(&mut backend, 0, 0).unwrap();

        assert!(!present);
        assert!(!chain.is_present());
        assert_eq!(backend.swapchains_alive, 0);
        assert_eq!(backend.pipelines_alive, 0);
    }

    #[test]
    fn failed_pipeline_releases_the_new_swapchain() {
        let mut backend = RecordingBackend::new();
        backend.fail_pipeline = true;
        let mut chain = FakeChain::Absent;

        assert!(chain.build(&mut backend, 800, 600).is_err());

        assert!(!chain.is_present());
        assert_eq!(backend.swapchains_alive, 0);
        assert_eq!(backend.command_buffers_alive, 0);
    }

    #[test]
    fn building_twice_is_an_error() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;
        chain.build(&mut backend, 800, 600).unwrap();

        assert!(chain.build(&mut backend, 800, 600).is_err());
        assert_eq!(backend.swapchains_alive, 1);
    }

    #[test]
    fn teardown_of_absent_chain_only_waits() {
        let mut backend = RecordingBackend::new();
        let mut chain = FakeChain::Absent;

        chain.teardown(&mut backend).unwrap();

        assert_eq!(backend.calls, vec![Call::WaitIdle]);
    }
}
