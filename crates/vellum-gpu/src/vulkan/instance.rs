//! Vulkan loader and instance.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::RawDisplayHandle;
use tracing::{info, warn};

use super::device::VulkanDevice;
use super::features::DeviceConfig;
use super::presenter::VulkanSurface;
use crate::error::{GpuError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"Vellum";

/// Instance creation options.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer if it is installed.
    pub validation: bool,
    extensions: Vec<*const c_char>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "Vellum".to_string(),
            validation: cfg!(debug_assertions),
            extensions: Vec::new(),
        }
    }
}

impl InstanceConfig {
    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable the validation layer.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    /// Enable the surface extensions needed to present to `display`.
    pub fn with_display(mut self, display: RawDisplayHandle) -> Result<Self> {
        let required = ash_window::enumerate_required_extensions(display)?;
        self.extensions.extend_from_slice(required);
        Ok(self)
    }
}

/// Loaded Vulkan entry points, the first stage of the context lifecycle.
pub struct VulkanLoader {
    entry: ash::Entry,
}

impl VulkanLoader {
    /// Load the Vulkan library.
    pub fn init() -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;
        Ok(Self { entry })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Create the instance, consuming the loader.
    pub fn bind_instance(self, config: &InstanceConfig) -> Result<Arc<VulkanInstance>> {
        let entry = self.entry;

        let version = unsafe { entry.try_enumerate_instance_version()? }
            .unwrap_or(vk::API_VERSION_1_0);
        if !supports_1_3(version) {
            return Err(GpuError::FeatureUnsupported(format!(
                "Vulkan 1.3 loader (found {}.{})",
                vk::api_version_major(version),
                vk::api_version_minor(version)
            )));
        }

        let app_name = CString::new(config.app_name.as_str())
            .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = config.extensions.clone();
        #[cfg(target_os = "macos")]
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());

        let mut layers = Vec::new();
        if config.validation {
            let available = unsafe { entry.enumerate_instance_layer_properties()? };
            let found = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
            if found {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("Validation layer {VALIDATION_LAYER:?} not available");
            }
        }

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers)
            .flags(create_flags);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);

        Ok(Arc::new(VulkanInstance {
            entry,
            instance,
            surface_fn,
        }))
    }
}

/// A physical device able to render and present.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    /// Family supporting graphics, transfer and present.
    pub queue_family: u32,
}

/// Vulkan instance. Devices and surfaces keep it alive through an `Arc`.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: ash::khr::surface::Instance,
}

impl VulkanInstance {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub(crate) fn surface_fn(&self) -> &ash::khr::surface::Instance {
        &self.surface_fn
    }

    /// Pick a GPU that can present to `surface`, preferring a discrete one.
    pub fn select_gpu(&self, surface: &VulkanSurface) -> Result<GpuInfo> {
        let devices = unsafe { self.instance.enumerate_physical_devices()? };

        let mut candidates = Vec::new();
        for physical_device in devices {
            if let Some(gpu) = self.inspect(physical_device, surface)? {
                candidates.push(gpu);
            }
        }

        let gpu = pick_gpu(candidates).ok_or(GpuError::NoSuitableDevice)?;
        info!("Selected GPU: {} ({:?})", gpu.name, gpu.device_type);
        Ok(gpu)
    }

    fn inspect(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: &VulkanSurface,
    ) -> Result<Option<GpuInfo>> {
        let properties = unsafe { self.instance.get_physical_device_properties(physical_device) };
        if !supports_1_3(properties.api_version) {
            return Ok(None);
        }

        let extensions =
            unsafe { self.instance.enumerate_device_extension_properties(physical_device)? };
        let has_swapchain = extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == ash::khr::swapchain::NAME));
        if !has_swapchain {
            return Ok(None);
        }

        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        };
        let mut queue_family = None;
        for (index, family) in families.iter().enumerate() {
            let index = index as u32;
            if !family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)
            {
                continue;
            }
            let can_present = unsafe {
                self.surface_fn.get_physical_device_surface_support(
                    physical_device,
                    index,
                    surface.handle(),
                )?
            };
            if can_present {
                queue_family = Some(index);
                break;
            }
        }
        let Some(queue_family) = queue_family else {
            return Ok(None);
        };

        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Some(GpuInfo {
            physical_device,
            name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            queue_family,
        }))
    }

    /// Create the logical device and its single queue.
    pub fn bind_device(
        self: &Arc<Self>,
        gpu: &GpuInfo,
        config: &DeviceConfig,
    ) -> Result<Arc<VulkanDevice>> {
        let mut supported_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut supported = vk::PhysicalDeviceFeatures2::default().push_next(&mut supported_13);
        unsafe {
            self.instance
                .get_physical_device_features2(gpu.physical_device, &mut supported)
        };
        let supported_core = supported.features;

        config.validate(&supported_13)?;

        let mut features_13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(config.required.synchronization2)
            .dynamic_rendering(config.required.dynamic_rendering);
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .features(config.optional.enabled(&supported_core))
            .push_next(&mut features_13);

        let priorities = [1.0_f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(gpu.queue_family)
            .queue_priorities(&priorities)];
        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        let device = unsafe {
            self.instance
                .create_device(gpu.physical_device, &create_info, None)?
        };
        let queue = unsafe { device.get_device_queue(gpu.queue_family, 0) };

        Ok(Arc::new(VulkanDevice::new(
            self.clone(),
            gpu.clone(),
            device,
            queue,
        )))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}

fn supports_1_3(version: u32) -> bool {
    (vk::api_version_major(version), vk::api_version_minor(version)) >= (1, 3)
}

/// First discrete GPU, otherwise the last candidate.
fn pick_gpu(candidates: Vec<GpuInfo>) -> Option<GpuInfo> {
    let discrete = candidates
        .iter()
        .position(|gpu| gpu.device_type == vk::PhysicalDeviceType::DISCRETE_GPU);
    match discrete {
        Some(index) => candidates.into_iter().nth(index),
        None => candidates.into_iter().last(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(name: &str, device_type: vk::PhysicalDeviceType) -> GpuInfo {
        GpuInfo {
            physical_device: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type,
            api_version: vk::API_VERSION_1_3,
            queue_family: 0,
        }
    }

    #[test]
    fn prefers_discrete_gpu() {
        let picked = pick_gpu(vec![
            gpu("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            gpu("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
            gpu("cpu", vk::PhysicalDeviceType::CPU),
        ]);
        assert_eq!(picked.map(|g| g.name), Some("dgpu".to_string()));
    }

    #[test]
    fn falls_back_to_last_candidate() {
        let picked = pick_gpu(vec![
            gpu("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            gpu("cpu", vk::PhysicalDeviceType::CPU),
        ]);
        assert_eq!(picked.map(|g| g.name), Some("cpu".to_string()));
        assert!(pick_gpu(Vec::new()).is_none());
    }

    #[test]
    fn api_version_gate() {
        assert!(supports_1_3(vk::API_VERSION_1_3));
        assert!(supports_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(!supports_1_3(vk::API_VERSION_1_2));
    }
}
