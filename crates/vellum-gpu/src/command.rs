//! Command buffer management.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::device::{QueueSubmit, SharedDevice};
use crate::error::{GpuError, Result};
use crate::sync::Fence;

/// Default bound on blocking GPU waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Command pool for allocating command buffers.
pub struct CommandPool {
    device: SharedDevice,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool on the device's queue family.
    pub fn new(device: &SharedDevice, flags: vk::CommandPoolCreateFlags) -> Result<Self> {
        let pool = device.create_command_pool(flags)?;
        Ok(Self {
            device: device.clone(),
            pool,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the device this pool belongs to.
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Allocate primary command buffers.
    ///
    /// They are freed together with the pool.
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        self.device.allocate_command_buffers(self.pool, count)
    }

    /// Start a single-use [`CommandBlock`] on this pool.
    pub fn begin_block(self: &Arc<Self>) -> Result<CommandBlock> {
        CommandBlock::new(self.clone())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
    }
}

/// A single-use command buffer that is recording from construction until it
/// is consumed by [`CommandBlock::submit_and_wait`].
///
/// Operations that hand GPU work a resource they are about to free take the
/// block by value, so a recorded sequence has exactly one submission point
/// and it always completes before the caller continues.
pub struct CommandBlock {
    pool: Arc<CommandPool>,
    command_buffer: vk::CommandBuffer,
    in_flight: bool,
}

impl CommandBlock {
    /// Allocate a command buffer from `pool` and begin one-time-submit
    /// recording.
    pub fn new(pool: Arc<CommandPool>) -> Result<Self> {
        let device = pool.device();
        let command_buffer = pool
            .allocate(1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))?;

        if let Err(e) =
            device.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        {
            device.free_command_buffers(pool.handle(), &[command_buffer]);
            return Err(e);
        }

        Ok(Self {
            pool,
            command_buffer,
            in_flight: false,
        })
    }

    /// The command buffer being recorded.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// The device the block records for.
    pub fn device(&self) -> &SharedDevice {
        self.pool.device()
    }

    /// End recording, submit, and block until the GPU has executed it.
    pub fn submit_and_wait(self) -> Result<()> {
        self.submit_and_wait_timeout(DEFAULT_WAIT_TIMEOUT)
    }

    /// [`CommandBlock::submit_and_wait`] with an explicit bound on the wait.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_and_wait_timeout(mut self, timeout: Duration) -> Result<()> {
        let device = self.pool.device().clone();
        device.end_command_buffer(self.command_buffer)?;

        let fence = Fence::new(&device, false)?;
        device.submit(&QueueSubmit {
            command_buffer: self.command_buffer,
            wait: None,
            signal: None,
            fence: fence.handle(),
        })?;

        // A timed-out submission may still be executing; leak its command
        // buffer and fence rather than free them under the GPU.
        self.in_flight = true;
        if let Err(e) = fence.wait(timeout) {
            std::mem::forget(fence);
            return Err(e);
        }
        self.in_flight = false;

        Ok(())
    }
}

impl Drop for CommandBlock {
    fn drop(&mut self) {
        if !self.in_flight {
            self.pool
                .device()
                .free_command_buffers(self.pool.handle(), &[self.command_buffer]);
        }
    }
}
