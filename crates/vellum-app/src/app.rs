//! `VellumApp` trait definition.

use winit::event::WindowEvent;

use crate::context::AppContext;
use crate::frame::FrameContext;

/// Trait for Vellum applications.
///
/// The framework creates the window and GPU context, acquires and presents
/// swapchain images, and recreates the swapchain when the surface changes.
pub trait VellumApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window, device and swapchain exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state. `dt` is the time since the last frame in
    /// seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Record rendering commands for one frame.
    ///
    /// The acquired image is already in `ATTACHMENT_OPTIMAL` layout and is
    /// transitioned for presentation after this returns. Skipped frames
    /// (minimized window, stale surface) do not call this.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// Called when the window is resized to a non-zero size.
    ///
    /// The swapchain is recreated by the frame loop; use this for other
    /// size-dependent resources.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a window event. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Release resources before shutdown. The device is idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
