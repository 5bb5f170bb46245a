//! Synchronization primitives.

use std::time::Duration;

use ash::vk;

use crate::device::SharedDevice;
use crate::error::Result;

/// Owned binary semaphore, destroyed on drop.
pub struct Semaphore {
    device: SharedDevice,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: &SharedDevice) -> Result<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    /// Get the raw semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

/// Owned fence, destroyed on drop.
pub struct Fence {
    device: SharedDevice,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &SharedDevice, signaled: bool) -> Result<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Wait for the fence to be signaled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.device.wait_for_fence(self.handle, timeout)
    }

    /// Reset the fence to unsignaled state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        self.device.reset_fence(self.handle)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.handle);
    }
}

/// Waits for the device to go idle when dropped.
///
/// Fields drop in declaration order, so declare it before the GPU objects
/// that in-flight work may still reference.
#[derive(Default)]
pub struct DeviceWaiter {
    device: Option<SharedDevice>,
}

impl DeviceWaiter {
    /// Wait on `device` when dropped.
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device: Some(device),
        }
    }

    /// Stop waiting on drop.
    pub fn disarm(&mut self) {
        self.device = None;
    }
}

impl Drop for DeviceWaiter {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            if let Err(e) = device.wait_idle() {
                tracing::error!("Failed to wait for device idle: {e}");
            }
        }
    }
}
