// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Every GPU object that owns memory is an
// owning wrapper that releases handle and allocation together.

pub mod allocator;
pub mod buffer;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod rollback;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use allocator::MemoryAllocator;
pub use buffer::GpuBuffer;
pub use commands::CommandPool;
pub use device::VulkanDevice;
pub use image::{GpuImage, Texture};
pub use surface::SurfaceHandle;
pub use swapchain::Swapchain;
