//! Upload/readback tests against a real (headless) Vulkan device.
//!
//! Each test skips with a message when no Vulkan implementation is
//! installed, so they are safe to run on CI machines without a GPU.
//!
//! ```bash
//! cargo test --test gpu_upload -- --nocapture
//! ```

use ash::vk;
use quad_harness::assets::{TextureData, QUAD_INDICES, QUAD_VERTICES};
use quad_harness::backend::buffer::HOST_WRITE_MEMORY;
use quad_harness::backend::{CommandPool, GpuBuffer, Texture, VulkanDevice};
use quad_harness::HarnessError;
use std::sync::Arc;

struct TestContext {
    // Pool before device: the pool is destroyed first
    pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl TestContext {
    fn new() -> Option<Self> {
        let device = match VulkanDevice::headless("quad-harness tests") {
            Ok(device) => device,
            Err(e) => {
                eprintln!("No Vulkan device available, skipping: {:#}", e);
                return None;
            }
        };
        let pool = CommandPool::new(&device).expect("command pool");
        Some(Self { pool, device })
    }
}

#[test]
fn vertex_upload_preserves_contents() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let buffer = GpuBuffer::device_local_with_data(
        &ctx.device,
        &ctx.pool,
        &QUAD_VERTICES,
        vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        "test vertices",
    )
    .expect("upload");

    let bytes = buffer.download(&ctx.pool).expect("download");
    assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<_, u8>(&QUAD_VERTICES));
}

#[test]
fn index_upload_preserves_contents() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let buffer = GpuBuffer::device_local_with_data(
        &ctx.device,
        &ctx.pool,
        &QUAD_INDICES,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        "test indices",
    )
    .expect("upload");

    let bytes = buffer.download(&ctx.pool).expect("download");
    assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<_, u8>(&QUAD_INDICES));
}

#[test]
fn host_visible_buffer_round_trips_writes() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let mut buffer = GpuBuffer::new(
        &ctx.device,
        16,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        HOST_WRITE_MEMORY,
        "test uniforms",
    )
    .expect("buffer");

    buffer.write(&[1.0f32, 2.0, 3.0, 4.0]).expect("write");
    let bytes = buffer.read_bytes().expect("read");
    let expected = [1.0f32, 2.0, 3.0, 4.0];
    assert_eq!(bytes.as_slice(), bytemuck::cast_slice::<_, u8>(&expected));

    // Five floats do not fit
    assert!(buffer.write(&[0.0f32; 5]).is_err());
}

#[test]
fn texture_upload_preserves_pixels() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let data = TextureData::checkerboard(16, 4);
    let texture = Texture::upload_rgba8(
        &ctx.device,
        &ctx.pool,
        &data.pixels,
        data.width,
        data.height,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
        "test texture",
    )
    .expect("upload");

    let pixels = texture.image.download(&ctx.pool).expect("download");
    assert_eq!(pixels, data.pixels);

    // Image is back in shader-read layout; a second readback still works
    let again = texture.image.download(&ctx.pool).expect("second download");
    assert_eq!(again, data.pixels);
}

#[test]
fn texture_with_wrong_length_is_rejected() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let err = Texture::upload_rgba8(
        &ctx.device,
        &ctx.pool,
        &[0u8; 10],
        2,
        2,
        vk::ImageUsageFlags::SAMPLED,
        "bad texture",
    )
    .err()
    .expect("length mismatch must fail");

    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::TextureSizeMismatch { expected: 16, actual: 10, .. })
    ));
}

#[test]
fn headless_device_has_no_surface() {
    let Some(ctx) = TestContext::new() else {
        return;
    };

    let err = ctx.device.surface().err().expect("headless has no surface");
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::NoSurface)
    ));
    assert!(ctx.device.max_sampler_anisotropy() <= 16.0);
}
