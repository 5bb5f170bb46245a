//! Viewer application: animated clear of the swapchain image.

use ash::vk;
use glam::Vec3;
use tracing::info;

use vellum_app::{AppContext, FrameContext, VellumApp};

/// Seconds for one trip around the color wheel.
const CYCLE_SECONDS: f32 = 6.0;

pub struct Viewer {
    time: f32,
}

impl VellumApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        info!(
            "Viewer ready: {}x{} swapchain, {} frames in flight",
            ctx.swapchain.extent().width,
            ctx.swapchain.extent().height,
            ctx.frames.frames_in_flight()
        );
        Ok(Self { time: 0.0 })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        self.time = (self.time + dt) % CYCLE_SECONDS;
    }

    fn render(&mut self, _ctx: &AppContext, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
        let color = clear_color(self.time / CYCLE_SECONDS);

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(frame.target.image_view)
            .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [color.x, color.y, color.z, 1.0],
                },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: frame.target.extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));

        // SAFETY: the command buffer is recording and the target view belongs
        // to the image acquired for this frame.
        unsafe {
            frame
                .device
                .cmd_begin_rendering(frame.command_buffer, &rendering_info);
            frame.device.cmd_end_rendering(frame.command_buffer);
        }

        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!("Viewport {width}x{height}");
        Ok(())
    }
}

/// Fully saturated hue at `phase` in `[0, 1)`, dimmed to stay easy on the eyes.
fn clear_color(phase: f32) -> Vec3 {
    let hue = phase.fract() * 6.0;
    let rgb = Vec3::new(
        (hue - 3.0).abs() - 1.0,
        2.0 - (hue - 2.0).abs(),
        2.0 - (hue - 4.0).abs(),
    );
    rgb.clamp(Vec3::ZERO, Vec3::ONE) * 0.6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_color_cycles_through_primaries() {
        assert!(clear_color(0.0).abs_diff_eq(Vec3::new(0.6, 0.0, 0.0), 1e-5));
        assert!(clear_color(1.0 / 3.0).abs_diff_eq(Vec3::new(0.0, 0.6, 0.0), 1e-5));
        assert!(clear_color(2.0 / 3.0).abs_diff_eq(Vec3::new(0.0, 0.0, 0.6), 1e-5));
    }

    #[test]
    fn clear_color_stays_in_range() {
        for step in 0..100 {
            let color = clear_color(step as f32 / 100.0);
            assert!(color.min_element() >= 0.0 && color.max_element() <= 0.6);
        }
    }
}
