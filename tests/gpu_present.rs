//! Swapchain lifecycle against a real device presenting to a
//! VK_EXT_headless_surface.
//!
//! Skips with a message when there is no Vulkan implementation, no headless
//! WSI (Mesa drivers such as lavapipe have one) or no compiled shaders.
//!
//! ```bash
//! cargo test --test gpu_present -- --nocapture
//! ```

use ash::vk;
use quad_harness::backend::sync::FRAMES_IN_FLIGHT;
use quad_harness::backend::VulkanDevice;
use quad_harness::frame::{self, FrameTarget};
use quad_harness::{
    FrameOutcome, FrameScheduler, HarnessOptions, Renderer, ShaderBlobs, TextureData,
};
use std::path::Path;

fn renderer(width: u32, height: u32) -> Option<Renderer> {
    let shader_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
    let shaders = match ShaderBlobs::load(&shader_dir) {
        Ok(shaders) => shaders,
        Err(e) => {
            eprintln!("Shaders not compiled, skipping: {:#}", e);
            return None;
        }
    };

    let device = match VulkanDevice::with_headless_surface("quad-harness present tests") {
        Ok(device) => device,
        Err(e) => {
            eprintln!("No headless presentation available, skipping: {:#}", e);
            return None;
        }
    };

    let options = HarnessOptions {
        app_name: "quad-harness present tests".to_string(),
        validation: false,
        present_mode: vk::PresentModeKHR::FIFO,
        clear_color: [0.0, 0.0, 0.0, 1.0],
        texture: TextureData::checkerboard(64, 8),
        shaders,
    };

    Some(Renderer::new(device, width, height, options).expect("renderer"))
}

#[test]
fn initial_chain_at_800x600() {
    let Some(mut renderer) = renderer(800, 600) else {
        return;
    };

    let stats = renderer.stats();
    assert!(stats.image_count >= 2, "{} images", stats.image_count);
    assert_eq!(stats.extent, (800, 600));
    assert_eq!(stats.rebuilds, 0);
    assert_eq!(renderer.frame_slots(), FRAMES_IN_FLIGHT);

    frame::shutdown(&mut renderer).expect("shutdown");
}

#[test]
fn frames_present_to_the_headless_surface() {
    let Some(mut renderer) = renderer(800, 600) else {
        return;
    };
    let mut scheduler = FrameScheduler::new();

    for _ in 0..6 {
        let outcome = scheduler.draw_frame(&mut renderer).expect("frame");
        if let FrameOutcome::Presented { slot, .. } | FrameOutcome::PresentedStale { slot, .. } =
            outcome
        {
            assert!(slot < FRAMES_IN_FLIGHT);
        }
    }

    assert!(scheduler.frame_count() > 0);
    frame::shutdown(&mut renderer).expect("shutdown");
}

#[test]
fn rebuild_keeps_image_count_and_follows_new_size() {
    let Some(mut renderer) = renderer(800, 600) else {
        return;
    };
    let before = renderer.stats();

    renderer.resize(640, 480);
    renderer.rebuild_swapchain().expect("rebuild");

    let after = renderer.stats();
    assert_eq!(after.rebuilds, 1);
    assert_eq!(after.image_count, before.image_count);
    assert_eq!(after.extent, (640, 480));

    // The re-recorded command buffers are usable right away
    let mut scheduler = FrameScheduler::new();
    scheduler.draw_frame(&mut renderer).expect("frame after rebuild");

    frame::shutdown(&mut renderer).expect("shutdown");
}
