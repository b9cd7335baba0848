// =============================================================================
// QUAD HARNESS - window host
// =============================================================================
//
// Stands in for the platform window/view layer: owns the winit window,
// hands its native handles to the harness and drives the frame loop.
//
// FRAME FLOW (inside Harness::render_frame):
// 1. Wait for this slot's previous frame
// 2. Acquire swapchain image
// 3. Submit the command buffer pre-recorded for that image
// 4. Present, rebuild the swapchain if the surface went stale
//
// =============================================================================

use anyhow::{Context, Result};
use quad_harness::config::Config;
use quad_harness::{
    ExitStatus, FrameOutcome, Harness, HarnessOptions, ShaderBlobs, SurfaceHandle, TextureData,
};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    let (config, source) = Config::load();
    init_logging(&config);
    source.log(&config);

    let result = run(config);
    if let Err(e) = &result {
        log::error!("{:?}", e);
    }
    ExitStatus::from_result(&result).into()
}

fn run(config: Config) -> Result<()> {
    log::info!("Starting quad harness");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    app.finish()
}

fn init_logging(config: &Config) {
    // RUST_LOG still overrides the configured level
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

/// Shader blobs are required; the texture falls back to a checkerboard.
fn load_assets(config: &Config) -> Result<(ShaderBlobs, TextureData)> {
    let shaders = ShaderBlobs::load(&config.assets.shader_dir).with_context(|| {
        format!(
            "Failed to load shaders from {:?} (is glslc installed?)",
            config.assets.shader_dir
        )
    })?;

    let texture = match TextureData::load_png(&config.assets.texture) {
        Ok(texture) => texture,
        Err(e) => {
            log::warn!("{:?}; using a checkerboard texture", e);
            TextureData::checkerboard(256, 32)
        }
    };

    Ok((shaders, texture))
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the harness must go before the window
/// whose native handles it holds.
struct App {
    config: Config,
    harness: Option<Harness>,
    window: Option<Arc<Window>>,

    /// Window has zero area - skip rendering
    is_minimized: bool,
    /// First fatal error; ends the event loop
    failure: Option<anyhow::Error>,

    // FPS tracking
    frames_since_update: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            harness: None,
            window: None,
            is_minimized: false,
            failure: None,
            frames_since_update: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_harness(&mut self, window: &Window) -> Result<Harness> {
        let (shaders, texture) = load_assets(&self.config)?;

        let surface = SurfaceHandle {
            display: window.raw_display_handle(),
            window: window.raw_window_handle(),
        };

        let size = window.inner_size();
        let options = HarnessOptions {
            app_name: self.config.window.title.clone(),
            validation: self.config.debug.validation_layers,
            present_mode: self.config.present_mode(),
            clear_color: self.config.graphics.clear_color,
            texture,
            shaders,
        };

        // Safety: the window outlives the harness (see App field order and
        // shutdown())
        unsafe { Harness::create(surface, size.width, size.height, options) }
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        if self.is_minimized {
            return Ok(());
        }
        let Some(harness) = self.harness.as_mut() else {
            return Ok(());
        };

        match harness.render_frame()? {
            FrameOutcome::Presented { .. } | FrameOutcome::PresentedStale { .. } => {
                self.update_fps();
            }
            FrameOutcome::Skipped => {}
        }
        Ok(())
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frames_since_update += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frames_since_update as f32 / elapsed;
            if let Some(window) = &self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frames_since_update = 0;
            self.last_fps_update = now;
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        self.shutdown(event_loop);
    }

    /// Destroy the harness (device idle first) and stop the event loop.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(harness) = self.harness.take() {
            let stats = harness.stats();
            log::info!(
                "Rendered {} frames, {} swapchain rebuilds",
                harness.frame_count(),
                stats.rebuilds
            );
            if let Err(e) = harness.destroy() {
                log::error!("{:?}", e);
                self.failure.get_or_insert(e);
            }
        }
        event_loop.exit();
    }

    fn finish(self) -> Result<()> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_harness(&window) {
            Ok(harness) => self.harness = Some(harness),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(harness) = self.harness.as_mut() {
                    harness.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    self.fail(event_loop, e.context("Frame failed"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.harness.is_some() {
            if let Some(window) = &self.window {
                window.request_redraw();
            }
        }
    }
}
