//! Window surface and swapchain entry points.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::device::VulkanDevice;
use super::instance::VulkanInstance;
use crate::error::{GpuError, Result};
use crate::presenter::{PresentationEngine, SwapchainDesc};

/// A window surface, destroyed on drop.
pub struct VulkanSurface {
    surface: vk::SurfaceKHR,
    instance: Arc<VulkanInstance>,
}

impl VulkanSurface {
    /// Create a surface for `window`.
    ///
    /// The instance must have been created with the extensions from
    /// [`InstanceConfig::with_display`](super::InstanceConfig::with_display),
    /// and the window must outlive the surface.
    pub fn new<W>(instance: &Arc<VulkanInstance>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.raw(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self {
            surface,
            instance: instance.clone(),
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        unsafe {
            self.instance
                .surface_fn()
                .destroy_surface(self.surface, None);
        }
    }
}

/// [`PresentationEngine`] over `VK_KHR_surface` and `VK_KHR_swapchain`.
pub struct VulkanPresenter {
    swapchain_fn: ash::khr::swapchain::Device,
    surface: VulkanSurface,
    device: Arc<VulkanDevice>,
}

impl VulkanPresenter {
    /// Create a presenter for `surface`.
    pub fn new(device: Arc<VulkanDevice>, surface: VulkanSurface) -> Self {
        let swapchain_fn = ash::khr::swapchain::Device::new(device.instance().raw(), device.raw());
        Self {
            swapchain_fn,
            surface,
            device,
        }
    }

    pub fn surface(&self) -> &VulkanSurface {
        &self.surface
    }

    fn surface_fn(&self) -> &ash::khr::surface::Instance {
        self.device.instance().surface_fn()
    }
}

impl PresentationEngine for VulkanPresenter {
    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(unsafe {
            self.surface_fn().get_physical_device_surface_formats(
                self.device.physical_device(),
                self.surface.handle(),
            )?
        })
    }

    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(unsafe {
            self.surface_fn().get_physical_device_surface_present_modes(
                self.device.physical_device(),
                self.surface.handle(),
            )?
        })
    }

    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.surface_fn().get_physical_device_surface_capabilities(
                self.device.physical_device(),
                self.surface.handle(),
            )?
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let capabilities = self.surface_capabilities()?;
        let queue_families = [desc.queue_family];

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        Ok(unsafe { self.swapchain_fn.create_swapchain(&info, None)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_fn.destroy_swapchain(swapchain, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_fn.get_swapchain_images(swapchain)? })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal_semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_fn.acquire_next_image(
                swapchain,
                timeout_ns,
                signal_semaphore,
                vk::Fence::null(),
            )
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> std::result::Result<bool, vk::Result> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_fn.queue_present(queue, &info) }
    }
}
