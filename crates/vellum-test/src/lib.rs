//! Test support for vellum.
//!
//! [`SimGpu`] stands in for the device, the memory allocator and the
//! presentation engine. [`SimHarness`] wires it to a swapchain and a frame
//! synchronizer the way an application does.

pub mod sim;

use std::sync::Arc;

use ash::vk;
use glam::UVec2;

use vellum_gpu::{
    CommandBlock, CommandPool, FrameSyncConfig, FrameSynchronizer, GpuAllocator, RenderTarget,
    Result, Swapchain, SwapchainConfig,
};

pub use sim::{Event, SimCounters, SimGpu, SurfaceResponse};

/// A frame loop running on a [`SimGpu`].
pub struct SimHarness {
    pub frames: FrameSynchronizer,
    pub swapchain: Swapchain,
    pub allocator: GpuAllocator,
    pub upload_pool: Arc<CommandPool>,
    pub sim: Arc<SimGpu>,
}

impl SimHarness {
    pub fn new(size: UVec2, frames_in_flight: usize) -> Result<Self> {
        let sim = SimGpu::new();
        let swapchain = Swapchain::new(
            sim.device(),
            sim.presenter(),
            size,
            SwapchainConfig::default(),
        )?;
        Self::with_swapchain(sim, swapchain, frames_in_flight)
    }

    /// A harness whose swapchain has no image chain yet, as for a window
    /// that starts minimized.
    pub fn deferred(frames_in_flight: usize) -> Result<Self> {
        let sim = SimGpu::new();
        let swapchain =
            Swapchain::deferred(sim.device(), sim.presenter(), SwapchainConfig::default())?;
        Self::with_swapchain(sim, swapchain, frames_in_flight)
    }

    fn with_swapchain(
        sim: Arc<SimGpu>,
        swapchain: Swapchain,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let device = sim.device();
        let frames = FrameSynchronizer::new(
            device.clone(),
            FrameSyncConfig::default().with_frames_in_flight(frames_in_flight),
        )?;
        let upload_pool = Arc::new(CommandPool::new(
            &device,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?);

        Ok(Self {
            frames,
            swapchain,
            allocator: GpuAllocator::new(sim.memory()),
            upload_pool,
            sim,
        })
    }

    /// Run one full frame at `framebuffer_size`. Returns the target rendered
    /// to, or `None` if the frame was skipped.
    pub fn tick(&mut self, framebuffer_size: UVec2) -> Result<Option<RenderTarget>> {
        let Some(target) = self.frames.acquire(&mut self.swapchain, framebuffer_size)? else {
            return Ok(None);
        };
        self.frames.begin_recording(&self.swapchain)?;
        self.frames.submit_and_present(&mut self.swapchain)?;
        Ok(Some(target))
    }

    /// Start a command block on the upload pool.
    pub fn upload_block(&self) -> Result<CommandBlock> {
        self.upload_pool.begin_block()
    }
}
