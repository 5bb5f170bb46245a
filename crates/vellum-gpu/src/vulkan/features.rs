//! Device feature configuration.

use ash::vk;

use crate::error::{GpuError, Result};

/// Features the device must support. Creation fails without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub synchronization2: bool,
    pub dynamic_rendering: bool,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            synchronization2: true,
            dynamic_rendering: true,
        }
    }
}

/// Core features enabled only when the device has them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalFeatures {
    pub fill_mode_non_solid: bool,
    pub wide_lines: bool,
    pub sampler_anisotropy: bool,
    pub sample_rate_shading: bool,
}

impl Default for OptionalFeatures {
    fn default() -> Self {
        Self {
            fill_mode_non_solid: true,
            wide_lines: true,
            sampler_anisotropy: true,
            sample_rate_shading: true,
        }
    }
}

impl OptionalFeatures {
    /// The subset of these features that `supported` reports.
    pub fn enabled(&self, supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
        let on = |wanted: bool, available: vk::Bool32| wanted && available == vk::TRUE;
        vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(on(self.fill_mode_non_solid, supported.fill_mode_non_solid))
            .wide_lines(on(self.wide_lines, supported.wide_lines))
            .sampler_anisotropy(on(self.sampler_anisotropy, supported.sampler_anisotropy))
            .sample_rate_shading(on(self.sample_rate_shading, supported.sample_rate_shading))
    }
}

/// Logical device configuration, validated once in
/// [`VulkanInstance::bind_device`](super::VulkanInstance::bind_device).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub required: DeviceFeatures,
    pub optional: OptionalFeatures,
}

impl DeviceConfig {
    pub fn with_optional(mut self, optional: OptionalFeatures) -> Self {
        self.optional = optional;
        self
    }

    /// Fail with the name of the first required feature `supported` lacks.
    pub fn validate(&self, supported: &vk::PhysicalDeviceVulkan13Features<'_>) -> Result<()> {
        let checks = [
            (
                self.required.synchronization2,
                supported.synchronization2,
                "synchronization2",
            ),
            (
                self.required.dynamic_rendering,
                supported.dynamic_rendering,
                "dynamicRendering",
            ),
        ];
        for (wanted, available, name) in checks {
            if wanted && available != vk::TRUE {
                return Err(GpuError::FeatureUnsupported(name.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_feature_is_named() {
        let supported = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let err = DeviceConfig::default().validate(&supported).unwrap_err();
        assert!(matches!(err, GpuError::FeatureUnsupported(name) if name == "dynamicRendering"));
    }

    #[test]
    fn required_features_present() {
        let supported = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        assert!(DeviceConfig::default().validate(&supported).is_ok());
    }

    #[test]
    fn unsupported_optional_features_are_dropped() {
        let supported = vk::PhysicalDeviceFeatures::default()
            .fill_mode_non_solid(true)
            .sampler_anisotropy(true);
        let optional = OptionalFeatures {
            sampler_anisotropy: false,
            ..Default::default()
        };
        let enabled = optional.enabled(&supported);
        assert_eq!(enabled.fill_mode_non_solid, vk::TRUE);
        assert_eq!(enabled.wide_lines, vk::FALSE);
        assert_eq!(enabled.sampler_anisotropy, vk::FALSE);
        assert_eq!(enabled.sample_rate_shading, vk::FALSE);
    }
}
