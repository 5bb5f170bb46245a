//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::UVec2;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vellum_gpu::{Device, DeviceWaiter};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::VellumApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub title: String,
    /// Initial inner size in physical pixels.
    pub width: u32,
    pub height: u32,
    /// Frame rate cap enforced by sleeping; `None` runs unthrottled.
    pub target_fps: Option<u32>,
    /// Present in FIFO order.
    pub vsync: bool,
    /// Request the Khronos validation layer. On by default in debug builds.
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Bound on each frame's fence wait; exceeding it is fatal.
    pub fence_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        let frame_sync = vellum_gpu::FrameSyncConfig::default();
        Self {
            title: "Vellum".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: frame_sync.frames_in_flight,
            fence_timeout: frame_sync.fence_timeout,
        }
    }
}

impl AppConfig {
    /// Default configuration with the given window title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the initial window size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Cap the frame rate.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable the validation layer.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    /// Set the bound on each frame's fence wait.
    pub fn with_fence_timeout(mut self, fence_timeout: Duration) -> Self {
        self.fence_timeout = fence_timeout;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a [`VellumApp`] with the given configuration.
///
/// Initializes logging (`RUST_LOG`, default `info`), creates the window and
/// GPU context, and runs the event loop until the window closes or a frame
/// fails. A failed frame is returned as the error.
///
/// With the `profiling-tracy` feature, spans are also streamed to a Tracy
/// client and the vellum crates log at `trace` by default.
pub fn run_app<A: VellumApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,vellum_gpu=trace,vellum_app=trace,vellum_viewer=trace")
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    info!("Starting {}", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        error: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Drives a [`VellumApp`] from winit callbacks.
struct AppRunner<A: VellumApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    error: Option<anyhow::Error>,
}

/// Everything that exists once the window is up.
struct AppState<A: VellumApp> {
    // Waits for the GPU before the app's resources are released.
    _waiter: DeviceWaiter,
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    last_frame_time: Instant,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: VellumApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => self.state = Some(state),
            Err(e) => self.fail(event_loop, e.context("Failed to initialize application")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // The app sees events first.
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => self.fail(event_loop, e.context("Frame failed")),
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size) {
                    self.fail(event_loop, e.context("Resize failed"));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: VellumApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut ctx = AppContext::new(window, &self.config)?;
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            _waiter: DeviceWaiter::new(ctx.shared_device()),
            app,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            last_frame_time: Instant::now(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    /// Record a fatal error and leave the event loop. State is dropped here
    /// so the device goes idle before the loop returns.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.state = None;
        self.error.get_or_insert(e);
        event_loop.exit();
    }
}

impl<A: VellumApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let dt = frame_start
            .duration_since(self.last_frame_time)
            .as_secs_f32();
        self.last_frame_time = frame_start;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        let framebuffer_size: UVec2 = self.ctx.framebuffer_size();
        let Some(target) = self
            .ctx
            .frames
            .acquire(&mut self.ctx.swapchain, framebuffer_size)?
        else {
            return Ok(());
        };

        let command_buffer = self.ctx.frames.begin_recording(&self.ctx.swapchain)?;
        let mut frame = FrameContext {
            command_buffer,
            target,
            device: self.ctx.device.raw(),
            dt,
            frame_number: self.ctx.frames.frame_count(),
            frame_index: self.ctx.frames.frame_index(),
        };
        self.app.render(&self.ctx, &mut frame)?;

        self.ctx
            .frames
            .submit_and_present(&mut self.ctx.swapchain)?;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }

        self.app.on_resize(&mut self.ctx, size.width, size.height)?;

        info!("Resized to {}x{}", size.width, size.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        let frame_count = self.ctx.frames.frame_count();
        if frame_count > 0 {
            info!(
                "{frame_count} frames, fps min {:.1} / max {:.1} / avg {:.1}",
                self.min_fps,
                self.max_fps,
                self.fps_sum / frame_count as f64
            );
        }

        if let Err(e) = self.ctx.device.wait_idle() {
            error!("Failed to wait idle before cleanup: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        debug!("Application cleaned up");
    }
}
