//! Logical device seam.
//!
//! Everything the core needs from the graphics device goes through the
//! [`Device`] trait, so the frame loop and the allocator can run against the
//! Vulkan backend or a simulated one.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::error::Result;

/// Shared handle to a device backend.
pub type SharedDevice = Arc<dyn Device>;

/// A semaphore wait or signal attached to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreSubmit {
    pub fn new(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self { semaphore, stage }
    }
}

/// One command buffer submission to the device's queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmit {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<SemaphoreSubmit>,
    pub signal: Option<SemaphoreSubmit>,
    /// Signaled when the GPU has finished the submission. May be null.
    pub fence: vk::Fence,
}

/// Logical device with a single graphics + transfer queue.
///
/// Implementations are expected to be used from one control thread; the
/// `Send + Sync` bound only lets the handle be shared through an `Arc`.
pub trait Device: Send + Sync {
    /// The queue used for both submission and presentation.
    fn queue(&self) -> vk::Queue;

    /// Family index of [`Device::queue`].
    fn queue_family(&self) -> u32;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Block until `fence` is signaled.
    ///
    /// Returns [`GpuError::Timeout`](crate::GpuError::Timeout) if `timeout`
    /// elapses first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()>;

    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    fn free_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]);

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()>;

    fn submit(&self, submit: &QueueSubmit) -> Result<()>;

    /// Create a 2D color view covering `mip_levels` levels of `image`.
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        mip_levels: u32,
    ) -> Result<vk::ImageView>;

    fn destroy_image_view(&self, view: vk::ImageView);

    /// Block until all submitted work has completed.
    fn wait_idle(&self) -> Result<()>;

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[vk::ImageMemoryBarrier2<'_>],
    );

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    );

    /// Copy tightly packed texels from `src` into mip 0 of `dst`, which must be
    /// in `TRANSFER_DST_OPTIMAL` layout.
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent2D,
    );
}

/// Single-mip, single-layer color subresource.
pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};
