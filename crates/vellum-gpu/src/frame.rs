//! Virtual-frame ring and the acquire/submit/present protocol.

use std::time::Duration;

use ash::vk;
use glam::UVec2;
use tracing::{debug, error};

use crate::command::CommandPool;
use crate::device::{QueueSubmit, SemaphoreSubmit, SharedDevice};
use crate::error::{GpuError, Result};
use crate::swapchain::{RenderTarget, Swapchain};
use crate::sync::{Fence, Semaphore};

/// Default number of frames the CPU may run ahead of the GPU.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Default bound on the per-frame fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Frame synchronizer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSyncConfig {
    /// Number of virtual frames. Must be at least 1.
    pub frames_in_flight: usize,
    /// Exceeding this while waiting on a frame's fence is fatal.
    pub fence_timeout: Duration,
}

impl Default for FrameSyncConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

impl FrameSyncConfig {
    /// Set the number of virtual frames.
    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    /// Set the bound on each frame's fence wait.
    pub fn with_fence_timeout(mut self, fence_timeout: Duration) -> Self {
        self.fence_timeout = fence_timeout;
        self
    }

    /// Check the configuration can drive a frame ring.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "At least one frame in flight is required".to_string(),
            ));
        }
        if self.fence_timeout.is_zero() {
            return Err(GpuError::InvalidState(
                "Fence timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct VirtualFrameSync {
    command_buffer: vk::CommandBuffer,
    // acquire -> render
    draw: Semaphore,
    // render done, slot reusable
    drawn: Fence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Acquired(RenderTarget),
    Recording(RenderTarget),
}

/// Drives a ring of virtual frames, keeping at most `frames_in_flight`
/// frames of GPU work outstanding.
///
/// One tick is [`acquire`](Self::acquire), then
/// [`begin_recording`](Self::begin_recording), then
/// [`submit_and_present`](Self::submit_and_present). `acquire` returning
/// `None` means "skip this tick"; the same slot is retried next time.
/// Swapchain recreation only ever happens inside `acquire` or after present,
/// never while a command buffer is recording.
pub struct FrameSynchronizer {
    device: SharedDevice,
    fence_timeout: Duration,
    // Declared before the pool so the command buffers' users go first.
    frames: Vec<VirtualFrameSync>,
    _pool: CommandPool,
    frame_index: usize,
    frame_count: u64,
    state: FrameState,
    framebuffer_size: UVec2,
    needs_recreate: bool,
}

impl FrameSynchronizer {
    /// Create the ring. Every slot starts with a signaled fence.
    pub fn new(device: SharedDevice, config: FrameSyncConfig) -> Result<Self> {
        config.validate()?;

        let pool = CommandPool::new(&device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let command_buffers = pool.allocate(config.frames_in_flight as u32)?;

        let frames = command_buffers
            .into_iter()
            .map(|command_buffer| {
                Ok(VirtualFrameSync {
                    command_buffer,
                    draw: Semaphore::new(&device)?,
                    // Signaled so the first wait on every slot passes.
                    drawn: Fence::new(&device, true)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Frame synchronizer with {} frames in flight", frames.len());

        Ok(Self {
            device,
            fence_timeout: config.fence_timeout,
            frames,
            _pool: pool,
            frame_index: 0,
            frame_count: 0,
            state: FrameState::Idle,
            framebuffer_size: UVec2::ZERO,
            needs_recreate: false,
        })
    }

    /// Slot used by the current (or next) tick.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Number of virtual frames.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The render target of the tick in progress.
    pub fn render_target(&self) -> Option<RenderTarget> {
        match self.state {
            FrameState::Idle => None,
            FrameState::Acquired(target) | FrameState::Recording(target) => Some(target),
        }
    }

    /// Wait for the current slot's previous use to retire, then acquire a
    /// swapchain image.
    ///
    /// Returns `None` when the tick should be skipped: the framebuffer is
    /// degenerate, the swapchain could not be recreated yet, or acquisition
    /// reported the surface stale (recreation has then already been issued).
    /// A swapchain without an image chain is created here first.
    /// On skip the frame index does not advance and the slot's fence is left
    /// signaled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire(
        &mut self,
        swapchain: &mut Swapchain,
        framebuffer_size: UVec2,
    ) -> Result<Option<RenderTarget>> {
        if self.state != FrameState::Idle {
            return Err(GpuError::InvalidState(
                "acquire called while a frame is in progress".to_string(),
            ));
        }

        self.framebuffer_size = framebuffer_size;
        if framebuffer_size.x == 0 || framebuffer_size.y == 0 {
            debug!("Framebuffer is {framebuffer_size}, skipping frame");
            return Ok(None);
        }

        if self.needs_recreate || !swapchain.is_created() {
            self.recreate(swapchain)?;
            if self.needs_recreate {
                return Ok(None);
            }
        }

        let index = self.frame_index;
        self.frames[index].drawn.wait(self.fence_timeout)?;

        let draw = self.frames[index].draw.handle();
        let Some(target) = swapchain.acquire_next_image(draw)? else {
            // The fence stays signaled, so the retry's wait is a no-op.
            self.recreate(swapchain)?;
            return Ok(None);
        };

        self.frames[index].drawn.reset()?;
        self.state = FrameState::Acquired(target);
        Ok(Some(target))
    }

    /// Begin recording the current slot's command buffer and transition the
    /// acquired image to attachment layout.
    ///
    /// The returned command buffer is valid until
    /// [`submit_and_present`](Self::submit_and_present).
    pub fn begin_recording(&mut self, swapchain: &Swapchain) -> Result<vk::CommandBuffer> {
        let FrameState::Acquired(target) = self.state else {
            return Err(GpuError::InvalidState(
                "begin_recording requires an acquired image".to_string(),
            ));
        };
        let barrier = swapchain
            .base_barrier()
            .ok_or_else(|| GpuError::InvalidState("Swapchain has no acquired image".to_string()))?
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL);

        let command_buffer = self.frames[self.frame_index].command_buffer;
        self.device
            .begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        self.device.cmd_pipeline_barrier(command_buffer, &[barrier]);

        self.state = FrameState::Recording(target);
        Ok(command_buffer)
    }

    /// Finish recording, submit, and present the acquired image.
    ///
    /// Advances the frame index. Recreates the swapchain if present reported
    /// it stale or the framebuffer no longer matches its size.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_and_present(&mut self, swapchain: &mut Swapchain) -> Result<()> {
        if !matches!(self.state, FrameState::Recording(_)) {
            return Err(GpuError::InvalidState(
                "submit_and_present requires a recording frame".to_string(),
            ));
        }
        let no_image = || GpuError::InvalidState("Swapchain has no acquired image".to_string());
        let barrier = swapchain
            .base_barrier()
            .ok_or_else(no_image)?
            .old_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .dst_access_mask(vk::AccessFlags2::NONE);
        // render -> present goes through the image's own semaphore, so a slot
        // never holds a signal for an image it no longer targets.
        let present = swapchain.present_semaphore().ok_or_else(no_image)?;

        let frame = &self.frames[self.frame_index];
        self.device.cmd_pipeline_barrier(frame.command_buffer, &[barrier]);
        self.device.end_command_buffer(frame.command_buffer)?;
        self.state = FrameState::Idle;

        let stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        self.device.submit(&QueueSubmit {
            command_buffer: frame.command_buffer,
            wait: Some(SemaphoreSubmit::new(frame.draw.handle(), stage)),
            signal: Some(SemaphoreSubmit::new(present, stage)),
            fence: frame.drawn.handle(),
        })?;

        let presented = swapchain.present(self.device.queue(), present)?;

        self.frame_index = (self.frame_index + 1) % self.frames.len();
        self.frame_count += 1;

        // A resize does not always make the surface stale. One recreation
        // covers both causes.
        if !presented || swapchain.size() != self.framebuffer_size {
            self.recreate(swapchain)?;
        }

        Ok(())
    }

    /// Wait until every slot's last submission has retired.
    pub fn wait_all(&self) -> Result<()> {
        for frame in &self.frames {
            frame.drawn.wait(self.fence_timeout)?;
        }
        Ok(())
    }

    fn recreate(&mut self, swapchain: &mut Swapchain) -> Result<()> {
        self.needs_recreate = !swapchain.recreate(self.framebuffer_size)?;
        Ok(())
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait idle before destroying frame resources: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = FrameSyncConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = FrameSyncConfig::default()
            .with_frames_in_flight(3)
            .with_fence_timeout(Duration::from_millis(500));
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.fence_timeout, Duration::from_millis(500));
    }

    #[test]
    fn rejects_empty_ring() {
        let config = FrameSyncConfig::default().with_frames_in_flight(0);
        assert!(matches!(config.validate(), Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = FrameSyncConfig::default().with_fence_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
