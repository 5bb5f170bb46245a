//! Swapchain management.

use ash::vk;
use glam::UVec2;
use tracing::{debug, error, info};

use crate::device::{SharedDevice, COLOR_SUBRESOURCE_RANGE};
use crate::error::{GpuError, Result};
use crate::presenter::{SharedPresenter, SwapchainDesc};
use crate::sync::Semaphore;

/// Fewest images the swapchain asks for.
pub const MIN_IMAGES: u32 = 3;

const SRGB_FORMATS: [vk::Format; 2] = [vk::Format::R8G8B8A8_SRGB, vk::Format::B8G8R8A8_SRGB];

/// Sentinel extent meaning "the surface size follows the swapchain".
const LIMITLESS_EXTENT: u32 = u32::MAX;

/// Swapchain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Present in FIFO order, synced to the display.
    pub vsync: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self { vsync: true }
    }
}

/// The image acquired for the frame in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub image_index: u32,
}

struct SwapchainImage {
    image: vk::Image,
    view: vk::ImageView,
    extent: vk::Extent2D,
}

/// Presentable image chain with per-image views and present-readiness
/// semaphores.
///
/// Staleness (`ERROR_OUT_OF_DATE_KHR`) from acquire or present is reported as
/// `None`/`false`, never as an error; the owner recreates between frames.
pub struct Swapchain {
    device: SharedDevice,
    presenter: SharedPresenter,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    swapchain: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    // signaled when the image is ready to be presented.
    present_semaphores: Vec<Semaphore>,
    image_index: Option<u32>,
}

impl Swapchain {
    /// Create a swapchain at `size`.
    ///
    /// Unlike [`Swapchain::recreate`], a size that cannot be presented is an
    /// error here, since there is no previous chain to keep using.
    pub fn new(
        device: SharedDevice,
        presenter: SharedPresenter,
        size: UVec2,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let mut ret = Self::deferred(device, presenter, config)?;
        if !ret.recreate(size)? {
            return Err(GpuError::SwapchainCreation(format!(
                "Surface size {}x{} is not presentable",
                size.x, size.y
            )));
        }

        Ok(ret)
    }

    /// Pick the surface format and present mode without building an image
    /// chain yet.
    ///
    /// The first successful [`Swapchain::recreate`] creates the chain. A
    /// [`FrameSynchronizer`](crate::FrameSynchronizer) does that on its own
    /// before the first acquire, so a window that starts minimized can begin
    /// rendering once it is restored.
    pub fn deferred(
        device: SharedDevice,
        presenter: SharedPresenter,
        config: SwapchainConfig,
    ) -> Result<Self> {
        let format = select_surface_format(&presenter.surface_formats()?).ok_or_else(|| {
            GpuError::SwapchainCreation("Surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&presenter.surface_present_modes()?, config.vsync);

        Ok(Self {
            device,
            presenter,
            format,
            present_mode,
            extent: vk::Extent2D::default(),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            present_semaphores: Vec::new(),
            image_index: None,
        })
    }

    /// Rebuild the image chain, views and present-readiness semaphores.
    ///
    /// Returns `Ok(false)` without touching the current chain when `size` (or
    /// the surface's own extent) has a zero dimension, e.g. while minimized.
    /// Must not be called while a frame is being recorded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn recreate(&mut self, size: UVec2) -> Result<bool> {
        if size.x == 0 || size.y == 0 {
            debug!("Deferring swapchain creation for {}x{}", size.x, size.y);
            return Ok(false);
        }

        let capabilities = self.presenter.surface_capabilities()?;
        let extent = image_extent(&capabilities, size);
        if extent.width == 0 || extent.height == 0 {
            debug!("Surface extent is degenerate, deferring swapchain creation");
            return Ok(false);
        }
        let min_image_count = image_count(&capabilities);

        self.device.wait_idle()?;

        let swapchain = self
            .presenter
            .create_swapchain(&SwapchainDesc {
                format: self.format,
                present_mode: self.present_mode,
                extent,
                min_image_count,
                queue_family: self.device.queue_family(),
                old_swapchain: self.swapchain,
            })
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        self.destroy_chain();
        self.swapchain = swapchain;
        self.extent = extent;
        self.image_index = None;

        self.populate_images()?;
        self.create_present_semaphores()?;

        info!(
            "Swapchain [{}x{}] ({} images)",
            extent.width,
            extent.height,
            self.images.len()
        );
        Ok(true)
    }

    /// Current image size.
    pub fn size(&self) -> UVec2 {
        UVec2::new(self.extent.width, self.extent.height)
    }

    /// Current image extent. Zero until the chain is created.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Format of the swapchain images.
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    /// Number of images in the chain.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Raw swapchain handle.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Whether an image chain exists.
    pub fn is_created(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null()
    }

    /// Index of the image acquired and not yet presented.
    pub fn acquired_index(&self) -> Option<u32> {
        self.image_index
    }

    /// Request the next image, arranging for `signal_semaphore` to be
    /// signaled once the presentation engine is done with it.
    ///
    /// Returns `None` if the surface is out of date; nothing is acquired and
    /// nothing is signaled in that case.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire_next_image(
        &mut self,
        signal_semaphore: vk::Semaphore,
    ) -> Result<Option<RenderTarget>> {
        if self.image_index.is_some() {
            return Err(GpuError::InvalidState(
                "Swapchain image acquired twice without presenting".to_string(),
            ));
        }

        let result =
            self.presenter
                .acquire_next_image(self.swapchain, u64::MAX, signal_semaphore);

        match result {
            Ok((index, _suboptimal)) => {
                let image = self.images.get(index as usize).ok_or_else(|| {
                    GpuError::InvalidState(format!("Acquired image index {index} out of range"))
                })?;
                self.image_index = Some(index);
                Ok(Some(RenderTarget {
                    image: image.image,
                    image_view: image.view,
                    extent: image.extent,
                    image_index: index,
                }))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on acquire");
                Ok(None)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present-readiness semaphore of the acquired image.
    pub fn present_semaphore(&self) -> Option<vk::Semaphore> {
        let index = self.image_index?;
        self.present_semaphores
            .get(index as usize)
            .map(Semaphore::handle)
    }

    /// Barrier template for the acquired image: color subresource, queue
    /// family, and color-attachment stage/access masks on both sides.
    /// Callers fill in the layouts.
    pub fn base_barrier(&self) -> Option<vk::ImageMemoryBarrier2<'static>> {
        let index = self.image_index?;
        let image = self.images.get(index as usize)?;
        let queue_family = self.device.queue_family();
        let access =
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
        let stage = vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;

        Some(
            vk::ImageMemoryBarrier2::default()
                .image(image.image)
                .subresource_range(COLOR_SUBRESOURCE_RANGE)
                .src_queue_family_index(queue_family)
                .dst_queue_family_index(queue_family)
                .src_access_mask(access)
                .src_stage_mask(stage)
                .dst_access_mask(access)
                .dst_stage_mask(stage),
        )
    }

    /// Present the acquired image once `wait_semaphore` is signaled.
    ///
    /// Returns `false` if the surface is out of date. The image is released
    /// either way.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self, queue: vk::Queue, wait_semaphore: vk::Semaphore) -> Result<bool> {
        let image_index = self
            .image_index
            .take()
            .ok_or_else(|| GpuError::InvalidState("No swapchain image acquired".to_string()))?;

        let result =
            self.presenter
                .queue_present(queue, self.swapchain, image_index, wait_semaphore);

        match result {
            Ok(_suboptimal) => Ok(true),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!("Swapchain out of date on present");
                Ok(false)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    fn populate_images(&mut self) -> Result<()> {
        let images = self.presenter.swapchain_images(self.swapchain)?;
        self.images.reserve(images.len());
        for image in images {
            let view = self.device.create_image_view(image, self.format.format, 1)?;
            self.images.push(SwapchainImage {
                image,
                view,
                extent: self.extent,
            });
        }
        Ok(())
    }

    fn create_present_semaphores(&mut self) -> Result<()> {
        self.present_semaphores = self
            .images
            .iter()
            .map(|_| Semaphore::new(&self.device))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn destroy_chain(&mut self) {
        self.present_semaphores.clear();
        for image in self.images.drain(..) {
            self.device.destroy_image_view(image.view);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            self.presenter.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait idle before destroying swapchain: {e}");
        }
        self.destroy_chain();
    }
}

/// Select the surface format, preferring sRGB.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    SRGB_FORMATS
        .iter()
        .find_map(|&desired| {
            available.iter().copied().find(|format| {
                format.format == desired
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| available.first().copied())
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate the swapchain extent for a framebuffer of `size` pixels.
pub fn image_extent(capabilities: &vk::SurfaceCapabilitiesKHR, size: UVec2) -> vk::Extent2D {
    let current = capabilities.current_extent;
    if current.width < LIMITLESS_EXTENT && current.height < LIMITLESS_EXTENT {
        return current;
    }
    vk::Extent2D {
        width: size.x.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: size.y.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Calculate how many images to request.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    // max < min means there is no upper bound (max is 0).
    if capabilities.max_image_count < capabilities.min_image_count {
        return MIN_IMAGES.max(capabilities.min_image_count);
    }
    MIN_IMAGES.clamp(capabilities.min_image_count, capabilities.max_image_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn capabilities(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    const LIMITLESS: vk::Extent2D = vk::Extent2D {
        width: u32::MAX,
        height: u32::MAX,
    };

    #[test]
    fn prefers_srgb_formats_in_order() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_SRGB)
        );
    }

    #[test]
    fn falls_back_to_first_format() {
        let mut linear = surface_format(vk::Format::B8G8R8A8_SRGB);
        linear.color_space = vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT;
        let available = [surface_format(vk::Format::A2B10G10R10_UNORM_PACK32), linear];
        assert_eq!(
            select_surface_format(&available).map(|f| f.format),
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_selection() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_current_extent_when_fixed() {
        let current = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let caps = capabilities(2, 8, current);
        assert_eq!(image_extent(&caps, UVec2::new(1280, 720)), current);
    }

    #[test]
    fn extent_clamps_requested_size_when_limitless() {
        let caps = capabilities(2, 8, LIMITLESS);
        let extent = image_extent(&caps, UVec2::new(10_000, 720));
        assert_eq!((extent.width, extent.height), (4096, 720));
    }

    #[test]
    fn image_count_is_clamped() {
        assert_eq!(image_count(&capabilities(2, 8, LIMITLESS)), 3);
        assert_eq!(image_count(&capabilities(4, 8, LIMITLESS)), 4);
        assert_eq!(image_count(&capabilities(1, 2, LIMITLESS)), 2);
        // unbounded
        assert_eq!(image_count(&capabilities(2, 0, LIMITLESS)), 3);
        assert_eq!(image_count(&capabilities(5, 0, LIMITLESS)), 5);
    }
}
