//! Per-frame context for rendering.

use ash::vk;
use vellum_gpu::RenderTarget;

/// The frame being recorded.
pub struct FrameContext<'a> {
    /// Command buffer in the recording state.
    pub command_buffer: vk::CommandBuffer,
    /// The acquired swapchain image.
    pub target: RenderTarget,
    /// Device for recording commands.
    pub device: &'a ash::Device,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames submitted before this one.
    pub frame_number: u64,
    /// Virtual frame slot, for indexing per-frame resources.
    pub frame_index: usize,
}
