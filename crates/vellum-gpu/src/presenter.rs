//! Presentation engine seam.

use std::sync::Arc;

use ash::vk;

use crate::error::Result;

/// Shared handle to a presentation engine.
pub type SharedPresenter = Arc<dyn PresentationEngine>;

/// Everything needed to (re)build a swapchain for the engine's surface.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub queue_family: u32,
    /// Swapchain being replaced, or null.
    pub old_swapchain: vk::SwapchainKHR,
}

/// Surface plus swapchain entry points.
///
/// `acquire_next_image` and `queue_present` return the raw failure code so
/// the swapchain can tell staleness apart from fatal errors.
pub trait PresentationEngine: Send + Sync {
    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>>;

    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>>;

    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR>;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal_semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result>;

    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> std::result::Result<bool, vk::Result>;
}
