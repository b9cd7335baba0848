// Fatal precondition errors
//
// Anything in here ends initialisation (or the frame loop) for good.
// Surface staleness is NOT an error: see `frame::AcquireOutcome` and
// `frame::SurfaceStatus`.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to load the Vulkan library")]
    Loader(#[from] ash::LoadingError),

    #[error("No suitable GPU found: {0}")]
    NoSuitableGpu(&'static str),

    #[error("Surface reports no supported formats")]
    NoSurfaceFormats,

    #[error("Required Vulkan extension missing: {0}")]
    MissingExtension(String),

    #[error("Unsupported window system: {0}")]
    UnsupportedPlatform(&'static str),

    #[error("Device was created without a presentation surface")]
    NoSurface,

    #[error("Texture data is {actual} bytes, expected {expected} for {width}x{height} RGBA8")]
    TextureSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid SPIR-V blob '{name}': {reason}")]
    InvalidSpirv { name: String, reason: &'static str },

    #[error("Unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Image index {index} out of range for {count} swapchain images")]
    ImageIndexOutOfRange { index: u32, count: usize },
}
