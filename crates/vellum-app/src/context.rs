//! Application context.

use std::sync::Arc;

use ash::vk;
use glam::UVec2;
use raw_window_handle::HasDisplayHandle;
use tracing::info;
use vellum_gpu::vulkan::{
    DeviceConfig, InstanceConfig, VulkanDevice, VulkanInstance, VulkanLoader, VulkanMemory,
    VulkanPresenter, VulkanSurface,
};
use vellum_gpu::{
    CommandBlock, CommandPool, FrameSyncConfig, FrameSynchronizer, GpuAllocator, SharedDevice,
    Swapchain, SwapchainConfig,
};
use winit::window::Window;

use crate::runner::AppConfig;

/// Everything an application needs to render, shared across app methods.
///
/// Fields drop top to bottom: the frame synchronizer and swapchain wait for
/// the device before releasing anything, and the window goes last since the
/// surface refers to it.
pub struct AppContext {
    pub frames: FrameSynchronizer,
    pub swapchain: Swapchain,
    pub allocator: GpuAllocator,
    upload_pool: Arc<CommandPool>,
    presenter: Arc<VulkanPresenter>,
    pub device: Arc<VulkanDevice>,
    pub instance: Arc<VulkanInstance>,
    pub window: Arc<Window>,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, config: &AppConfig) -> anyhow::Result<Self> {
        let display = window.display_handle()?.as_raw();
        let instance = VulkanLoader::init()?.bind_instance(
            &InstanceConfig::default()
                .app_name(config.title.as_str())
                .validation(config.validation)
                .with_display(display)?,
        )?;

        let surface = VulkanSurface::new(&instance, window.as_ref())?;
        let gpu = instance.select_gpu(&surface)?;
        info!("GPU: {} ({:?})", gpu.name, gpu.device_type);

        let device = instance.bind_device(&gpu, &DeviceConfig::default())?;
        let presenter = Arc::new(VulkanPresenter::new(device.clone(), surface));
        let allocator = GpuAllocator::new(Arc::new(VulkanMemory::new(device.clone())?));

        let shared: SharedDevice = device.clone();
        let size = window.inner_size();
        let mut swapchain = Swapchain::deferred(
            shared.clone(),
            presenter.clone(),
            SwapchainConfig {
                vsync: config.vsync,
            },
        )?;
        // A window that starts minimized gets its chain on the first acquire
        // after it is restored.
        if !swapchain.recreate(UVec2::new(size.width, size.height))? {
            info!("Window is not presentable yet, deferring swapchain creation");
        }
        let frames = FrameSynchronizer::new(
            shared.clone(),
            FrameSyncConfig::default()
                .with_frames_in_flight(config.frames_in_flight)
                .with_fence_timeout(config.fence_timeout),
        )?;
        let upload_pool = Arc::new(CommandPool::new(
            &shared,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?);

        Ok(Self {
            frames,
            swapchain,
            allocator,
            upload_pool,
            presenter,
            device,
            instance,
            window,
        })
    }

    /// The device behind the core's [`vellum_gpu::Device`] seam.
    pub fn shared_device(&self) -> SharedDevice {
        self.device.clone()
    }

    /// Start a single-use command block for uploads.
    pub fn upload_block(&self) -> anyhow::Result<CommandBlock> {
        Ok(self.upload_pool.begin_block()?)
    }

    /// The presentation engine the swapchain was built on.
    pub fn presenter(&self) -> &Arc<VulkanPresenter> {
        &self.presenter
    }

    /// Current framebuffer size in pixels.
    pub fn framebuffer_size(&self) -> UVec2 {
        let size = self.window.inner_size();
        UVec2::new(size.width, size.height)
    }
}
