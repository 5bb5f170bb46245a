//! Host buffers replicated per virtual frame.

use ash::vk;
use bytemuck::Pod;

use crate::memory::{Buffer, GpuAllocator, MemoryType};

/// One host-visible buffer per virtual frame.
///
/// Slot `i` must only be written after the frame synchronizer has waited on
/// virtual frame `i`'s fence, so the GPU is no longer reading it.
pub struct PerFrameBuffer {
    allocator: GpuAllocator,
    usage: vk::BufferUsageFlags,
    buffers: Vec<Buffer>,
}

impl PerFrameBuffer {
    /// Create `frames_in_flight` buffers, each holding one zero byte so they
    /// can be bound right away.
    pub fn new(allocator: GpuAllocator, usage: vk::BufferUsageFlags, frames_in_flight: usize) -> Self {
        let mut ret = Self {
            allocator,
            usage,
            buffers: Vec::with_capacity(frames_in_flight),
        };
        ret.buffers.resize_with(frames_in_flight, Buffer::default);
        for frame_index in 0..frames_in_flight {
            ret.write_at(frame_index, &[]);
        }
        ret
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer for a virtual frame.
    pub fn buffer_at(&self, frame_index: usize) -> &Buffer {
        &self.buffers[frame_index]
    }

    /// Replace the contents of slot `frame_index` with `bytes`, growing the
    /// buffer if needed. Returns false if the slot could not be allocated.
    pub fn write_at(&mut self, frame_index: usize, bytes: &[u8]) -> bool {
        const BLANK: [u8; 1] = [0];
        let bytes = if bytes.is_empty() { &BLANK[..] } else { bytes };
        let size = bytes.len() as vk::DeviceSize;

        let buffer = &mut self.buffers[frame_index];
        if buffer.is_valid() {
            if !buffer.resize(size) {
                return false;
            }
        } else {
            *buffer = self.allocator.create_buffer(self.usage, size, MemoryType::Host);
            if !buffer.is_valid() {
                return false;
            }
        }

        match buffer.write(0, bytes) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to write per-frame buffer {frame_index}: {e}");
                false
            }
        }
    }

    /// Write a plain-old-data value into slot `frame_index`.
    pub fn write_pod_at<T: Pod>(&mut self, frame_index: usize, value: &T) -> bool {
        self.write_at(frame_index, bytemuck::bytes_of(value))
    }

    /// Descriptor range covering the logical contents of slot `frame_index`.
    pub fn descriptor_info_at(&self, frame_index: usize) -> vk::DescriptorBufferInfo {
        let buffer = &self.buffers[frame_index];
        vk::DescriptorBufferInfo::default()
            .buffer(buffer.handle())
            .offset(0)
            .range(buffer.size())
    }
}
