//! gpu-allocator backed memory.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocatorDebugSettings, MemoryLocation};
use parking_lot::Mutex;
use tracing::{error, warn};

use super::device::VulkanDevice;
use crate::error::{GpuError, Result};
use crate::memory::{
    AllocationHandle, BufferAllocation, BufferRequest, ImageAllocation, ImageRequest,
    MemoryBackend, MemoryType,
};

struct AllocatorState {
    allocator: Allocator,
    allocations: HashMap<AllocationHandle, Allocation>,
    next_handle: u64,
}

impl AllocatorState {
    fn insert(&mut self, allocation: Allocation) -> AllocationHandle {
        self.next_handle += 1;
        let handle = AllocationHandle(self.next_handle);
        self.allocations.insert(handle, allocation);
        handle
    }

    fn free(&mut self, handle: AllocationHandle) {
        let Some(allocation) = self.allocations.remove(&handle) else {
            error!("Freeing unknown allocation {handle:?}");
            return;
        };
        if let Err(e) = self.allocator.free(allocation) {
            error!("Failed to free allocation {handle:?}: {e}");
        }
    }
}

/// [`MemoryBackend`] over gpu-allocator.
///
/// Host memory is `CpuToGpu` (mapped for the allocation's lifetime), device
/// memory is `GpuOnly`.
pub struct VulkanMemory {
    // The allocator frees its memory blocks on drop, so it goes before the
    // device.
    state: Mutex<Option<AllocatorState>>,
    device: Arc<VulkanDevice>,
}

impl VulkanMemory {
    /// Create a gpu-allocator instance for `device`.
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().raw().clone(),
            device: device.raw().clone(),
            physical_device: device.physical_device(),
            debug_settings: AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocatorCreation(e.to_string()))?;

        Ok(Self {
            state: Mutex::new(Some(AllocatorState {
                allocator,
                allocations: HashMap::new(),
                next_handle: 0,
            })),
            device,
        })
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |state| state.allocations.len())
    }

    /// Allocate memory for `requirements` and bind it with `bind`.
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        bind: impl FnOnce(vk::DeviceMemory, vk::DeviceSize) -> VkResult<()>,
    ) -> Result<(AllocationHandle, Option<NonNull<u8>>)> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator has been shut down".to_string()))?;

        let allocation = state
            .allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        if let Err(e) = bind(unsafe { allocation.memory() }, allocation.offset()) {
            if let Err(free_err) = state.allocator.free(allocation) {
                error!("Failed to free unbound allocation: {free_err}");
            }
            return Err(e.into());
        }

        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        Ok((state.insert(allocation), mapped))
    }

    fn free(&self, allocation: AllocationHandle) {
        if let Some(state) = self.state.lock().as_mut() {
            state.free(allocation);
        }
    }
}

impl MemoryBackend for VulkanMemory {
    fn create_buffer(&self, request: &BufferRequest) -> Result<BufferAllocation> {
        let location = match request.memory_type {
            MemoryType::Host => MemoryLocation::CpuToGpu,
            MemoryType::Device => MemoryLocation::GpuOnly,
        };

        let info = vk::BufferCreateInfo::default()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = self.device.raw();
        let buffer = unsafe { device.create_buffer(&info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let bound = self.allocate("buffer", requirements, location, true, |memory, offset| unsafe {
            device.bind_buffer_memory(buffer, memory, offset)
        });

        match bound {
            Ok((allocation, mapped)) => Ok(BufferAllocation {
                buffer,
                allocation,
                mapped,
            }),
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) {
        unsafe { self.device.raw().destroy_buffer(buffer, None) };
        self.free(allocation);
    }

    fn create_image(&self, request: &ImageRequest) -> Result<ImageAllocation> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(request.format)
            .extent(vk::Extent3D {
                width: request.extent.width,
                height: request.extent.height,
                depth: 1,
            })
            .mip_levels(request.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = self.device.raw();
        let image = unsafe { device.create_image(&info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let bound = self.allocate(
            "image",
            requirements,
            MemoryLocation::GpuOnly,
            false,
            |memory, offset| unsafe { device.bind_image_memory(image, memory, offset) },
        );

        match bound {
            Ok((allocation, _)) => Ok(ImageAllocation { image, allocation }),
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle) {
        unsafe { self.device.raw().destroy_image(image, None) };
        self.free(allocation);
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.lock().take() {
            let leaked: Vec<_> = state.allocations.keys().copied().collect();
            if !leaked.is_empty() {
                warn!("{} allocations still live at shutdown", leaked.len());
            }
            for handle in leaked {
                state.free(handle);
            }
        }
    }
}
