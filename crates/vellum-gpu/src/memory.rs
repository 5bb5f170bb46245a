//! GPU memory management.
//!
//! [`GpuAllocator`] is the facade over a [`MemoryBackend`]. It hands out
//! [`Buffer`] and [`Image`] ownership wrappers and implements the staged
//! upload protocol for device-local resources.
//!
//! Allocation failures are not errors at this level: the facade logs a
//! diagnostic and returns an invalid (empty) wrapper, and the caller decides
//! whether that is fatal. `Err` is reserved for failed submissions and waits.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use glam::UVec2;
use tracing::error;

use crate::command::CommandBlock;
use crate::device::COLOR_SUBRESOURCE_RANGE;
use crate::error::{GpuError, Result};

/// Where an allocation lives and how the host may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Host-visible, persistently mapped, optimized for sequential writes.
    Host,
    /// Device-local. Only populated through transfer commands.
    Device,
}

/// Opaque key for an allocation owned by a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(pub u64);

/// Parameters for a native buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest {
    pub usage: vk::BufferUsageFlags,
    pub size: vk::DeviceSize,
    pub memory_type: MemoryType,
}

/// A buffer bound to its memory.
#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub allocation: AllocationHandle,
    /// Persistent host mapping, present for [`MemoryType::Host`].
    pub mapped: Option<NonNull<u8>>,
}

/// Parameters for an optimally tiled 2D image allocation.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequest {
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
}

/// An image bound to its memory.
#[derive(Debug)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub allocation: AllocationHandle,
}

/// Native allocator behind [`GpuAllocator`].
///
/// Callers are assumed to be a single thread; concurrent creation and
/// destruction needs external serialization.
pub trait MemoryBackend: Send + Sync {
    fn create_buffer(&self, request: &BufferRequest) -> Result<BufferAllocation>;

    /// Destroy the buffer and release its allocation.
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle);

    fn create_image(&self, request: &ImageRequest) -> Result<ImageAllocation>;

    /// Destroy the image and release its allocation.
    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle);
}

/// Shared handle to a memory backend.
pub type SharedMemory = Arc<dyn MemoryBackend>;

/// Native buffer plus its allocation. Dropping it releases both.
pub struct RawBuffer {
    memory: SharedMemory,
    allocation: AllocationHandle,
    buffer: vk::Buffer,
    usage: vk::BufferUsageFlags,
    memory_type: MemoryType,
    capacity: vk::DeviceSize,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        self.memory.destroy_buffer(self.buffer, self.allocation);
    }
}

fn allocate_buffer(
    memory: &SharedMemory,
    usage: vk::BufferUsageFlags,
    size: vk::DeviceSize,
    memory_type: MemoryType,
) -> Option<RawBuffer> {
    if size == 0 {
        error!("Buffer cannot be 0-sized");
        return None;
    }

    let usage = match memory_type {
        MemoryType::Host => usage,
        MemoryType::Device => usage | vk::BufferUsageFlags::TRANSFER_DST,
    };

    let allocation = match memory.create_buffer(&BufferRequest {
        usage,
        size,
        memory_type,
    }) {
        Ok(allocation) => allocation,
        Err(e) => {
            error!("Failed to create buffer ({size} bytes, {memory_type:?}): {e}");
            return None;
        }
    };

    if memory_type == MemoryType::Host && allocation.mapped.is_none() {
        error!("Host buffer was not mapped");
        memory.destroy_buffer(allocation.buffer, allocation.allocation);
        return None;
    }

    Some(RawBuffer {
        memory: memory.clone(),
        allocation: allocation.allocation,
        buffer: allocation.buffer,
        usage,
        memory_type,
        capacity: size,
        size,
        mapped: allocation.mapped,
    })
}

/// A possibly-empty GPU buffer.
///
/// `Buffer::default()` is the invalid handle returned when creation fails.
#[derive(Default)]
pub struct Buffer {
    raw: Option<RawBuffer>,
}

impl Buffer {
    /// Whether this wrapper owns a live buffer.
    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    /// Native handle, or null for an invalid buffer.
    pub fn handle(&self) -> vk::Buffer {
        self.raw.as_ref().map_or(vk::Buffer::null(), |raw| raw.buffer)
    }

    /// Logical size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.raw.as_ref().map_or(0, |raw| raw.size)
    }

    /// Allocated size in bytes.
    pub fn capacity(&self) -> vk::DeviceSize {
        self.raw.as_ref().map_or(0, |raw| raw.capacity)
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.raw
            .as_ref()
            .map_or(vk::BufferUsageFlags::empty(), |raw| raw.usage)
    }

    /// Where the buffer lives, or `None` if invalid.
    pub fn memory_type(&self) -> Option<MemoryType> {
        self.raw.as_ref().map(|raw| raw.memory_type)
    }

    /// Allocation key inside the backend.
    pub fn allocation(&self) -> Option<AllocationHandle> {
        self.raw.as_ref().map(|raw| raw.allocation)
    }

    /// Persistent host pointer for host buffers.
    ///
    /// Invalidated when [`Buffer::resize`] reallocates.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.raw.as_ref().and_then(|raw| raw.mapped)
    }

    /// The mapped logical range of a host buffer.
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        let raw = self.raw.as_ref()?;
        let ptr = raw.mapped?;
        let len = usize::try_from(raw.size).ok()?;
        // SAFETY: the mapping spans `capacity >= size` bytes and lives as long
        // as the allocation, which `self` owns.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) })
    }

    /// The mapped logical range of a host buffer, writable.
    pub fn mapped_bytes_mut(&mut self) -> Option<&mut [u8]> {
        let raw = self.raw.as_mut()?;
        let ptr = raw.mapped?;
        let len = usize::try_from(raw.size).ok()?;
        // SAFETY: as in `mapped_bytes`; `&mut self` makes the view exclusive
        // on the host side.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Write raw bytes at `offset` (host buffers only).
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let dst = self
            .mapped_bytes_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > dst.len() {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        dst[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Change the logical size.
    ///
    /// Within capacity only the size changes: the native buffer, its contents
    /// and the mapped pointer stay valid. Beyond capacity the buffer is
    /// reallocated with the same usage and memory type, contents are not
    /// preserved, and the previous mapped pointer becomes dangling. Returns
    /// whether the buffer now has `new_size` bytes; on a failed reallocation
    /// the old buffer is kept.
    pub fn resize(&mut self, new_size: vk::DeviceSize) -> bool {
        let Some(raw) = self.raw.as_mut() else {
            error!("Cannot resize an invalid buffer");
            return false;
        };

        if new_size <= raw.capacity {
            raw.size = new_size;
            return true;
        }

        match allocate_buffer(&raw.memory, raw.usage, new_size, raw.memory_type) {
            Some(new_raw) => {
                self.raw = Some(new_raw);
                true
            }
            None => false,
        }
    }
}

/// Native image plus its allocation. Dropping it releases both.
pub struct RawImage {
    memory: SharedMemory,
    allocation: AllocationHandle,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
}

impl Drop for RawImage {
    fn drop(&mut self) {
        self.memory.destroy_image(self.image, self.allocation);
    }
}

/// A possibly-empty GPU image.
#[derive(Default)]
pub struct Image {
    raw: Option<RawImage>,
}

impl Image {
    /// Whether the image holds an allocation.
    pub fn is_valid(&self) -> bool {
        self.raw.is_some()
    }

    /// Native image handle, null if invalid.
    pub fn handle(&self) -> vk::Image {
        self.raw.as_ref().map_or(vk::Image::null(), |raw| raw.image)
    }

    /// Image format.
    pub fn format(&self) -> vk::Format {
        self.raw
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |raw| raw.format)
    }

    /// Image extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.raw.as_ref().map_or(vk::Extent2D::default(), |raw| raw.extent)
    }

    /// Number of mip levels.
    pub fn mip_levels(&self) -> u32 {
        self.raw.as_ref().map_or(0, |raw| raw.mip_levels)
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, Copy)]
pub struct Bitmap<'a> {
    pub bytes: &'a [u8],
    pub size: UVec2,
}

impl Bitmap<'_> {
    pub const CHANNELS: u64 = 4;

    /// Byte length implied by `size`.
    pub fn expected_len(&self) -> u64 {
        u64::from(self.size.x) * u64::from(self.size.y) * Self::CHANNELS
    }
}

/// Format used for sampled bitmap uploads.
pub const SAMPLED_IMAGE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Total byte length of a list of spans.
pub fn total_span_size(byte_spans: &[&[u8]]) -> vk::DeviceSize {
    byte_spans.iter().map(|bytes| bytes.len() as vk::DeviceSize).sum()
}

/// Submit `command_block` and wait for it, handing `in_use` back once the
/// GPU is done with it.
///
/// If the wait times out the recorded commands may still be executing, so
/// `in_use` is leaked along with the block instead of being freed under the
/// GPU.
fn submit_holding<T>(command_block: CommandBlock, in_use: T) -> Result<T> {
    match command_block.submit_and_wait() {
        Ok(()) => Ok(in_use),
        Err(e @ GpuError::Timeout(..)) => {
            error!("Upload timed out, leaking its resources: {e}");
            std::mem::forget(in_use);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn transfer_barrier(image: vk::Image) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .subresource_range(COLOR_SUBRESOURCE_RANGE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
}

/// GPU memory allocator facade.
#[derive(Clone)]
pub struct GpuAllocator {
    memory: SharedMemory,
}

impl GpuAllocator {
    /// Create an allocator over `memory`.
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    /// The backend this facade allocates from.
    pub fn backend(&self) -> &SharedMemory {
        &self.memory
    }

    /// Create a buffer.
    ///
    /// Host buffers come back persistently mapped. Device buffers always get
    /// `TRANSFER_DST` added to `usage`, since a copy is the only way to fill
    /// them. Zero-sized requests never reach the backend.
    pub fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
        memory_type: MemoryType,
    ) -> Buffer {
        Buffer {
            raw: allocate_buffer(&self.memory, usage, size, memory_type),
        }
    }

    /// Create an optimally tiled 2D image with automatic memory placement.
    pub fn create_image(
        &self,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Image {
        if extent.width == 0 || extent.height == 0 {
            error!(
                "Image cannot be 0-sized ({}x{})",
                extent.width, extent.height
            );
            return Image::default();
        }

        let mip_levels = mip_levels.max(1);
        match self.memory.create_image(&ImageRequest {
            usage,
            format,
            extent,
            mip_levels,
        }) {
            Ok(allocation) => Image {
                raw: Some(RawImage {
                    memory: self.memory.clone(),
                    allocation: allocation.allocation,
                    image: allocation.image,
                    format,
                    extent,
                    mip_levels,
                }),
            },
            Err(e) => {
                error!(
                    "Failed to create image ({}x{} {format:?}): {e}",
                    extent.width, extent.height
                );
                Image::default()
            }
        }
    }

    /// Create a device-local buffer holding the concatenation of
    /// `byte_spans`, in order.
    ///
    /// The data goes through a host-visible staging buffer that only lives
    /// for this call, so the copy is submitted on `command_block` and waited
    /// for before returning. Returns an invalid buffer if either allocation
    /// fails.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn create_device_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        command_block: CommandBlock,
        byte_spans: &[&[u8]],
    ) -> Result<Buffer> {
        let total_size = total_span_size(byte_spans);

        let mut staging = self.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            total_size,
            MemoryType::Host,
        );
        let ret = self.create_buffer(
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            total_size,
            MemoryType::Device,
        );

        // can't do anything if either buffer creation failed.
        if !staging.is_valid() || !ret.is_valid() {
            return Ok(Buffer::default());
        }

        let mut offset = 0;
        for bytes in byte_spans {
            staging.write(offset, bytes)?;
            offset += bytes.len() as vk::DeviceSize;
        }

        command_block.device().cmd_copy_buffer(
            command_block.command_buffer(),
            staging.handle(),
            ret.handle(),
            total_size,
        );

        // The staging buffer drops at the end of this scope; the GPU must be
        // done reading it by then.
        let (_staging, ret) = submit_holding(command_block, (staging, ret))?;

        Ok(ret)
    }

    /// Upload `bitmap` into a sampled `R8G8B8A8_SRGB` image, left in
    /// `SHADER_READ_ONLY_OPTIMAL` layout.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn create_sampled_image(
        &self,
        command_block: CommandBlock,
        bitmap: &Bitmap<'_>,
    ) -> Result<Image> {
        if bitmap.bytes.len() as u64 != bitmap.expected_len() {
            error!(
                "Bitmap has {} bytes, expected {} for {}x{} RGBA",
                bitmap.bytes.len(),
                bitmap.expected_len(),
                bitmap.size.x,
                bitmap.size.y
            );
            return Ok(Image::default());
        }

        let extent = vk::Extent2D {
            width: bitmap.size.x,
            height: bitmap.size.y,
        };
        let mut staging = self.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            bitmap.expected_len(),
            MemoryType::Host,
        );
        let image = self.create_image(
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            1,
            SAMPLED_IMAGE_FORMAT,
            extent,
        );
        if !staging.is_valid() || !image.is_valid() {
            return Ok(Image::default());
        }

        staging.write(0, bitmap.bytes)?;

        let device = command_block.device();
        let command_buffer = command_block.command_buffer();
        let barrier = transfer_barrier(image.handle());

        // Undefined => TransferDst
        let to_transfer = barrier
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_stage_mask(vk::PipelineStageFlags2::NONE)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::COPY)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE);
        device.cmd_pipeline_barrier(command_buffer, &[to_transfer]);

        device.cmd_copy_buffer_to_image(command_buffer, staging.handle(), image.handle(), extent);

        // TransferDst => ShaderReadOnly
        let to_sampled = barrier
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_stage_mask(vk::PipelineStageFlags2::COPY)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_SAMPLED_READ);
        device.cmd_pipeline_barrier(command_buffer, &[to_sampled]);

        let (_staging, image) = submit_holding(command_block, (staging, image))?;

        Ok(image)
    }

    /// Copy the logical contents of `buffer` back to the host.
    ///
    /// Debugging aid: allocates a host buffer, waits for the GPU copy, and
    /// returns `None` if `buffer` is invalid or the readback buffer could not
    /// be allocated. `buffer` needs `TRANSFER_SRC` usage. On a timed-out wait
    /// the copy may still be reading `buffer`, so the caller must not free
    /// it before the device is idle.
    pub fn read_back(
        &self,
        command_block: CommandBlock,
        buffer: &Buffer,
    ) -> Result<Option<Vec<u8>>> {
        if !buffer.is_valid() {
            return Ok(None);
        }

        let readback = self.create_buffer(
            vk::BufferUsageFlags::TRANSFER_DST,
            buffer.size(),
            MemoryType::Host,
        );
        if !readback.is_valid() {
            return Ok(None);
        }

        command_block.device().cmd_copy_buffer(
            command_block.command_buffer(),
            buffer.handle(),
            readback.handle(),
            buffer.size(),
        );
        let readback = submit_holding(command_block, readback)?;

        Ok(readback.mapped_bytes().map(<[u8]>::to_vec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that must never be reached.
    struct Unreachable;

    impl MemoryBackend for Unreachable {
        fn create_buffer(&self, _: &BufferRequest) -> Result<BufferAllocation> {
            panic!("zero-sized buffer reached the backend")
        }

        fn destroy_buffer(&self, _: vk::Buffer, _: AllocationHandle) {}

        fn create_image(&self, _: &ImageRequest) -> Result<ImageAllocation> {
            panic!("zero-sized image reached the backend")
        }

        fn destroy_image(&self, _: vk::Image, _: AllocationHandle) {}
    }

    fn allocator() -> GpuAllocator {
        GpuAllocator::new(Arc::new(Unreachable))
    }

    #[test]
    fn zero_sized_buffer_is_invalid() {
        let buffer = allocator().create_buffer(
            vk::BufferUsageFlags::VERTEX_BUFFER,
            0,
            MemoryType::Host,
        );
        assert!(!buffer.is_valid());
        assert_eq!(buffer.handle(), vk::Buffer::null());
        assert_eq!(buffer.size(), 0);
        assert!(buffer.mapped_bytes().is_none());
    }

    #[test]
    fn zero_sized_image_is_invalid() {
        let allocator = allocator();
        for extent in [
            vk::Extent2D { width: 0, height: 16 },
            vk::Extent2D { width: 16, height: 0 },
        ] {
            let image = allocator.create_image(
                vk::ImageUsageFlags::SAMPLED,
                1,
                vk::Format::R8G8B8A8_UNORM,
                extent,
            );
            assert!(!image.is_valid());
        }
    }

    #[test]
    fn invalid_buffer_does_not_resize() {
        let mut buffer = Buffer::default();
        assert!(!buffer.resize(64));
        assert!(buffer.write(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn bitmap_length() {
        let bitmap = Bitmap {
            bytes: &[],
            size: UVec2::new(3, 2),
        };
        assert_eq!(bitmap.expected_len(), 24);
    }

    #[test]
    fn span_sizes_add_up() {
        let spans: [&[u8]; 3] = [&[1, 2], &[], &[3, 4, 5]];
        assert_eq!(total_span_size(&spans), 5);
        assert_eq!(total_span_size(&[]), 0);
    }
}
