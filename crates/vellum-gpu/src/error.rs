//! GPU error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Surface staleness is never reported through this type: the swapchain and
/// frame synchronizer absorb it by recreating. Everything that does reach a
/// caller as `Err` means the current GPU state cannot be continued safely.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A required API version or device feature is missing.
    #[error("Required feature not supported: {0}")]
    FeatureUnsupported(String),

    /// The memory allocator itself could not be created.
    #[error("Allocator creation failed: {0}")]
    AllocatorCreation(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A bounded GPU wait expired; the device is presumed hung or lost.
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
