//! Buffer, image and staged upload behaviour against the simulated GPU.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{UVec2, Vec4};

use vellum_gpu::{
    Bitmap, CommandPool, Device, GpuAllocator, GpuError, MemoryType, PerFrameBuffer,
    SAMPLED_IMAGE_FORMAT,
};
use vellum_test::SimGpu;

struct Uploads {
    allocator: GpuAllocator,
    pool: Arc<CommandPool>,
    sim: Arc<SimGpu>,
}

impl Uploads {
    fn new() -> Self {
        let sim = SimGpu::new();
        let pool = Arc::new(
            CommandPool::new(&sim.device(), vk::CommandPoolCreateFlags::TRANSIENT).unwrap(),
        );
        Self {
            allocator: GpuAllocator::new(sim.memory()),
            pool,
            sim,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    tint: Vec4,
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

#[test]
fn host_buffer_is_mapped_and_writable() {
    let uploads = Uploads::new();
    let mut buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, 16, MemoryType::Host);

    assert!(buffer.is_valid());
    assert_eq!(buffer.memory_type(), Some(MemoryType::Host));
    buffer.write(4, &[1, 2, 3, 4]).unwrap();
    assert_eq!(
        buffer.mapped_bytes().unwrap(),
        &[0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
        uploads.sim.buffer_bytes(buffer.handle()).unwrap(),
        buffer.mapped_bytes().unwrap()
    );

    assert!(buffer.write(14, &[0; 4]).is_err());
}

#[test]
fn device_buffer_gets_transfer_dst() {
    let uploads = Uploads::new();
    let mut buffer = uploads.allocator.create_buffer(
        vk::BufferUsageFlags::STORAGE_BUFFER,
        64,
        MemoryType::Device,
    );

    assert!(buffer.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
    assert!(buffer.mapped_bytes().is_none());
    assert!(buffer.write(0, &[1]).is_err());
}

#[test]
fn resize_within_capacity_keeps_buffer() {
    let uploads = Uploads::new();
    let mut buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, 64, MemoryType::Host);
    buffer.write(0, &[7; 8]).unwrap();
    let handle = buffer.handle();
    let ptr = buffer.mapped_ptr();

    assert!(buffer.resize(32));
    assert_eq!(buffer.handle(), handle);
    assert_eq!(buffer.mapped_ptr(), ptr);
    assert_eq!(buffer.size(), 32);
    assert_eq!(buffer.capacity(), 64);
    assert_eq!(&buffer.mapped_bytes().unwrap()[..8], &[7; 8]);

    assert!(buffer.resize(64));
    assert_eq!(buffer.handle(), handle);
    assert_eq!(uploads.sim.counters().buffers_created, 1);
}

#[test]
fn resize_beyond_capacity_reallocates() {
    let uploads = Uploads::new();
    let mut buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, 64, MemoryType::Host);
    let handle = buffer.handle();

    assert!(buffer.resize(128));
    assert_ne!(buffer.handle(), handle);
    assert_eq!(buffer.size(), 128);
    assert_eq!(buffer.capacity(), 128);
    assert_eq!(buffer.usage(), vk::BufferUsageFlags::UNIFORM_BUFFER);
    assert_eq!(uploads.sim.live_buffers(), 1);
    uploads.sim.assert_clean();
}

#[test]
fn failed_regrow_keeps_old_buffer() {
    let uploads = Uploads::new();
    let mut buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, 64, MemoryType::Host);
    let handle = buffer.handle();

    uploads.sim.fail_allocations(1);
    assert!(!buffer.resize(256));
    assert!(buffer.is_valid());
    assert_eq!(buffer.handle(), handle);
    assert_eq!(buffer.size(), 64);
}

#[test]
fn staged_upload_concatenates_spans() {
    let uploads = Uploads::new();
    let a = [1_u8, 2, 3];
    let b = [4_u8; 5];
    let c = [9_u8, 8];

    let buffer = uploads
        .allocator
        .create_device_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            uploads.pool.begin_block().unwrap(),
            &[&a, &b, &c],
        )
        .unwrap();

    let expected: [u8; 10] = [1, 2, 3, 4, 4, 4, 4, 4, 9, 8];
    assert!(buffer.is_valid());
    assert_eq!(buffer.size(), 10);
    assert_eq!(buffer.memory_type(), Some(MemoryType::Device));
    assert_eq!(uploads.sim.buffer_bytes(buffer.handle()).unwrap(), expected);

    // Staging is gone once the upload returns.
    assert_eq!(uploads.sim.live_buffers(), 1);
    assert_eq!(uploads.sim.pending_submissions(), 0);

    let read = uploads
        .allocator
        .read_back(uploads.pool.begin_block().unwrap(), &buffer)
        .unwrap();
    assert_eq!(read.as_deref(), Some(&expected[..]));
    uploads.sim.assert_clean();
}

#[test]
fn zero_sized_requests_never_reach_the_backend() {
    let uploads = Uploads::new();

    let buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, 0, MemoryType::Device);
    assert!(!buffer.is_valid());

    let image = uploads.allocator.create_image(
        vk::ImageUsageFlags::SAMPLED,
        1,
        SAMPLED_IMAGE_FORMAT,
        vk::Extent2D {
            width: 0,
            height: 4,
        },
    );
    assert!(!image.is_valid());

    let empty = uploads
        .allocator
        .create_device_buffer(
            vk::BufferUsageFlags::INDEX_BUFFER,
            uploads.pool.begin_block().unwrap(),
            &[&[], &[]],
        )
        .unwrap();
    assert!(!empty.is_valid());

    let counters = uploads.sim.counters();
    assert_eq!(counters.buffers_created, 0);
    assert_eq!(counters.images_created, 0);
    assert_eq!(counters.submissions, 0);
    uploads.sim.assert_clean();
}

#[test]
fn failed_allocation_gives_invalid_buffer() {
    let uploads = Uploads::new();
    uploads.sim.fail_allocations(1);

    let buffer =
        uploads
            .allocator
            .create_buffer(vk::BufferUsageFlags::VERTEX_BUFFER, 32, MemoryType::Host);
    assert!(!buffer.is_valid());
    assert_eq!(buffer.handle(), vk::Buffer::null());
    assert_eq!(uploads.sim.live_buffers(), 0);
}

#[test]
fn failed_staging_aborts_upload() {
    let uploads = Uploads::new();
    uploads.sim.fail_allocations(1);

    let buffer = uploads
        .allocator
        .create_device_buffer(
            vk::BufferUsageFlags::VERTEX_BUFFER,
            uploads.pool.begin_block().unwrap(),
            &[&[1, 2, 3, 4]],
        )
        .unwrap();

    assert!(!buffer.is_valid());
    assert_eq!(uploads.sim.live_buffers(), 0);
    assert_eq!(uploads.sim.counters().submissions, 0);
    uploads.sim.assert_clean();
}

#[test]
fn sampled_image_upload() {
    let uploads = Uploads::new();
    let pixels: Vec<u8> = (0..16).collect();
    let bitmap = Bitmap {
        bytes: &pixels,
        size: UVec2::new(2, 2),
    };

    let image = uploads
        .allocator
        .create_sampled_image(uploads.pool.begin_block().unwrap(), &bitmap)
        .unwrap();

    assert!(image.is_valid());
    assert_eq!(image.format(), SAMPLED_IMAGE_FORMAT);
    assert_eq!(image.mip_levels(), 1);
    assert_eq!(uploads.sim.image_bytes(image.handle()).unwrap(), pixels);
    assert_eq!(
        uploads.sim.image_layout(image.handle()),
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    );
    assert_eq!(uploads.sim.live_buffers(), 0);
    uploads.sim.assert_clean();
}

#[test]
fn timed_out_upload_leaves_buffers_to_the_gpu() {
    let uploads = Uploads::new();
    uploads.sim.stall_fence_waits(1);

    let result = uploads.allocator.create_device_buffer(
        vk::BufferUsageFlags::VERTEX_BUFFER,
        uploads.pool.begin_block().unwrap(),
        &[&[1, 2, 3, 4]],
    );

    assert!(matches!(result, Err(GpuError::Timeout(..))));
    assert_eq!(uploads.sim.pending_submissions(), 1);
    assert_eq!(uploads.sim.live_buffers(), 2);

    // The late copy still finds its source and destination.
    uploads.sim.wait_idle().unwrap();
    assert_eq!(uploads.sim.pending_submissions(), 0);
    uploads.sim.assert_clean();
}

#[test]
fn timed_out_image_upload_leaves_resources_to_the_gpu() {
    let uploads = Uploads::new();
    let pixels = [7_u8; 16];
    let bitmap = Bitmap {
        bytes: &pixels,
        size: UVec2::new(2, 2),
    };
    uploads.sim.stall_fence_waits(1);

    let result = uploads
        .allocator
        .create_sampled_image(uploads.pool.begin_block().unwrap(), &bitmap);

    assert!(matches!(result, Err(GpuError::Timeout(..))));
    assert_eq!(uploads.sim.live_buffers(), 1);

    uploads.sim.wait_idle().unwrap();
    uploads.sim.assert_clean();
}

#[test]
fn timed_out_read_back_keeps_its_buffer() {
    let uploads = Uploads::new();
    let source = uploads
        .allocator
        .create_device_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            uploads.pool.begin_block().unwrap(),
            &[&[5; 8]],
        )
        .unwrap();
    uploads.sim.stall_fence_waits(1);

    let result = uploads
        .allocator
        .read_back(uploads.pool.begin_block().unwrap(), &source);

    assert!(matches!(result, Err(GpuError::Timeout(..))));
    assert_eq!(uploads.sim.live_buffers(), 2);

    uploads.sim.wait_idle().unwrap();
    drop(source);
    uploads.sim.assert_clean();
}

#[test]
fn mismatched_bitmap_is_rejected() {
    let uploads = Uploads::new();
    let pixels = [0_u8; 15];
    let bitmap = Bitmap {
        bytes: &pixels,
        size: UVec2::new(2, 2),
    };

    let image = uploads
        .allocator
        .create_sampled_image(uploads.pool.begin_block().unwrap(), &bitmap)
        .unwrap();

    assert!(!image.is_valid());
    assert_eq!(uploads.sim.counters().images_created, 0);
    assert_eq!(uploads.sim.counters().buffers_created, 0);
}

#[test]
fn per_frame_buffers_hold_uniforms() {
    let uploads = Uploads::new();
    let mut uniforms = PerFrameBuffer::new(
        uploads.allocator.clone(),
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        2,
    );
    assert_eq!(uniforms.len(), 2);
    assert_eq!(uniforms.buffer_at(1).size(), 1);

    let value = FrameUniforms {
        tint: Vec4::new(0.2, 0.4, 0.6, 1.0),
        time: 1.5,
        frame: 7,
        _pad: [0; 2],
    };
    assert!(uniforms.write_pod_at(0, &value));

    assert_eq!(
        uniforms.buffer_at(0).mapped_bytes().unwrap(),
        bytemuck::bytes_of(&value)
    );
    let info = uniforms.descriptor_info_at(0);
    assert_eq!(info.buffer, uniforms.buffer_at(0).handle());
    assert_eq!(info.range, std::mem::size_of::<FrameUniforms>() as vk::DeviceSize);

    // The other slot is untouched.
    assert_eq!(uniforms.buffer_at(1).mapped_bytes().unwrap(), &[0]);
}

#[test]
fn unsubmitted_block_is_released() {
    let uploads = Uploads::new();
    let baseline = uploads.sim.live_objects();

    let block = uploads.pool.begin_block().unwrap();
    assert_eq!(uploads.sim.live_objects(), baseline + 1);
    drop(block);

    assert_eq!(uploads.sim.live_objects(), baseline);
    assert_eq!(uploads.sim.counters().submissions, 0);
}

#[test]
fn submitted_block_completes() {
    let uploads = Uploads::new();
    uploads.pool.begin_block().unwrap().submit_and_wait().unwrap();

    assert_eq!(uploads.sim.counters().submissions, 1);
    assert_eq!(uploads.sim.pending_submissions(), 0);
    assert_eq!(uploads.sim.live_objects(), 1);
    uploads.sim.assert_clean();
}

#[test]
fn everything_is_released_on_drop() {
    let uploads = Uploads::new();
    let sim = uploads.sim.clone();
    {
        let _host =
            uploads
                .allocator
                .create_buffer(vk::BufferUsageFlags::UNIFORM_BUFFER, 256, MemoryType::Host);
        let _device = uploads
            .allocator
            .create_device_buffer(
                vk::BufferUsageFlags::VERTEX_BUFFER,
                uploads.pool.begin_block().unwrap(),
                &[&[1; 64]],
            )
            .unwrap();
        let _image = uploads.allocator.create_image(
            vk::ImageUsageFlags::SAMPLED,
            4,
            SAMPLED_IMAGE_FORMAT,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
        );
        assert_eq!(sim.live_buffers(), 2);
    }
    drop(uploads);

    assert_eq!(sim.live_objects(), 0);
    sim.assert_clean();
}
