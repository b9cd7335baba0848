//! Vulkan harness that draws one textured quad.
//!
//! The host window system hands over a native surface handle and a size;
//! [`Harness::create`] builds the device, uploads the scene and the first
//! swapchain. The caller then drives [`Harness::render_frame`] and finally
//! calls [`Harness::destroy`], which drains the GPU before releasing
//! anything.

pub mod assets;
pub mod backend;
pub mod chain;
pub mod config;
pub mod error;
pub mod frame;
pub mod renderer;

use anyhow::Result;
use ash::vk;
use std::process::ExitCode;

pub use assets::TextureData;
pub use backend::shader::ShaderBlobs;
pub use backend::SurfaceHandle;
pub use error::HarnessError;
pub use frame::{FrameOutcome, FrameScheduler};
pub use renderer::{Renderer, RendererStats};

use backend::VulkanDevice;

/// Everything the harness needs from upstream besides the surface.
pub struct HarnessOptions {
    pub app_name: String,
    pub validation: bool,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub texture: TextureData,
    pub shaders: ShaderBlobs,
}

/// Caller-owned harness context.
pub struct Harness {
    scheduler: FrameScheduler,
    renderer: Renderer,
}

impl Harness {
    /// Bring up the device and everything needed to render the first frame.
    ///
    /// # Safety
    /// The native handles in `surface` must stay valid until the harness is
    /// destroyed.
    pub unsafe fn create(
        surface: SurfaceHandle,
        width: u32,
        height: u32,
        options: HarnessOptions,
    ) -> Result<Self> {
        let device = VulkanDevice::new(&options.app_name, options.validation, &surface)?;
        let renderer = Renderer::new(device, width, height, options)?;

        log::info!("Harness ready ({}x{})", width, height);
        Ok(Self {
            scheduler: FrameScheduler::new(),
            renderer,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(width, height);
    }

    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        self.scheduler.draw_frame(&mut self.renderer)
    }

    pub fn frame_count(&self) -> u64 {
        self.scheduler.frame_count()
    }

    pub fn stats(&self) -> RendererStats {
        self.renderer.stats()
    }

    /// Wait for the device to go idle, then release every GPU resource.
    pub fn destroy(mut self) -> Result<()> {
        frame::shutdown(&mut self.renderer)?;
        log::info!("Harness destroyed after {} frames", self.frame_count());
        Ok(())
    }
}

/// Process status: whether initialisation and the frame loop ended without
/// a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Failure,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::SUCCESS,
            ExitStatus::Failure => ExitCode::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_follows_result() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(anyhow::anyhow!("no GPU"));
        assert_eq!(ExitStatus::from_result(&ok), ExitStatus::Success);
        assert_eq!(ExitStatus::from_result(&err), ExitStatus::Failure);
    }
}
