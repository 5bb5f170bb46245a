//! Vulkan implementations of the device, memory and presentation seams.
//!
//! The context is built in stages, each holding an `Arc` of the previous one
//! so teardown runs in reverse: [`VulkanLoader::init`], then
//! [`VulkanLoader::bind_instance`], then [`VulkanInstance::select_gpu`] and
//! [`VulkanInstance::bind_device`]. There is no process-wide dispatch state.

mod device;
mod features;
mod instance;
mod memory;
mod presenter;

pub use device::VulkanDevice;
pub use features::{DeviceConfig, DeviceFeatures, OptionalFeatures};
pub use instance::{GpuInfo, InstanceConfig, VulkanInstance, VulkanLoader};
pub use memory::VulkanMemory;
pub use presenter::{VulkanPresenter, VulkanSurface};
