//! Frame synchronization and GPU resource lifetime for Vulkan.
//!
//! This crate provides:
//! - Swapchain rotation and recreation
//! - A ring of virtual frames bounding GPU work in flight
//! - Host and device memory with staged uploads
//! - Single-use command blocks for out-of-band transfers
//!
//! The core talks to the GPU through the [`Device`], [`MemoryBackend`] and
//! [`PresentationEngine`] traits. [`vulkan`] implements them with ash and
//! gpu-allocator.

pub mod buffered;
pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod memory;
pub mod presenter;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use buffered::PerFrameBuffer;
pub use command::{CommandBlock, CommandPool, DEFAULT_WAIT_TIMEOUT};
pub use device::{Device, QueueSubmit, SemaphoreSubmit, SharedDevice, COLOR_SUBRESOURCE_RANGE};
pub use error::{GpuError, Result};
pub use frame::{FrameSyncConfig, FrameSynchronizer};
pub use memory::{
    AllocationHandle, Bitmap, Buffer, BufferAllocation, BufferRequest, GpuAllocator, Image,
    ImageAllocation, ImageRequest, MemoryBackend, MemoryType, SharedMemory, SAMPLED_IMAGE_FORMAT,
};
pub use presenter::{PresentationEngine, SharedPresenter, SwapchainDesc};
pub use swapchain::{RenderTarget, Swapchain, SwapchainConfig};
pub use sync::{DeviceWaiter, Fence, Semaphore};
