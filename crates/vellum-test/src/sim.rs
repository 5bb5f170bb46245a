//! Simulated GPU.
//!
//! [`SimGpu`] implements every backend seam in memory. Submitted work does not
//! run until something observes it: a fence wait completes the queue up to
//! that fence, and an idle wait completes everything. Commands that would
//! be undefined behaviour on a real device are recorded as violations instead
//! of crashing, so tests can assert on them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::warn;

use vellum_gpu::{
    AllocationHandle, BufferAllocation, BufferRequest, Device, GpuError, ImageAllocation,
    ImageRequest, MemoryBackend, MemoryType, PresentationEngine, QueueSubmit, Result,
    SharedDevice, SharedMemory, SharedPresenter, SwapchainDesc,
};

const QUEUE: u64 = 0x5100;

/// Scripted outcome of an acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceResponse {
    Ok,
    Suboptimal,
    OutOfDate,
    DeviceLost,
}

/// Something the simulated device was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    WaitFence { fence: vk::Fence, signaled: bool },
    ResetFence { fence: vk::Fence },
    Acquire { image_index: u32 },
    AcquireStale,
    Begin { command_buffer: vk::CommandBuffer },
    Submit { command_buffer: vk::CommandBuffer, fence: vk::Fence },
    Present { image_index: u32 },
    PresentStale,
    CreateSwapchain { extent: vk::Extent2D },
    DestroySwapchain,
    WaitIdle,
}

impl Event {
    /// Short name, for sequence assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::WaitFence { .. } => "wait_fence",
            Event::ResetFence { .. } => "reset_fence",
            Event::Acquire { .. } => "acquire",
            Event::AcquireStale => "acquire_stale",
            Event::Begin { .. } => "begin",
            Event::Submit { .. } => "submit",
            Event::Present { .. } => "present",
            Event::PresentStale => "present_stale",
            Event::CreateSwapchain { .. } => "create_swapchain",
            Event::DestroySwapchain => "destroy_swapchain",
            Event::WaitIdle => "wait_idle",
        }
    }
}

/// Native creation calls made so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimCounters {
    pub buffers_created: usize,
    pub images_created: usize,
    pub swapchains_created: usize,
    pub submissions: usize,
    pub fence_waits: usize,
    pub presents: usize,
}

/// Heap bytes with a stable address, standing in for device memory.
struct SimBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// The pointer is uniquely owned; access is serialized by the state mutex.
unsafe impl Send for SimBytes {}

impl SimBytes {
    fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SimBytes {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        unsafe { drop(Box::from_raw(slice)) };
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    CopyBuffer {
        src: u64,
        dst: u64,
        size: vk::DeviceSize,
    },
    CopyBufferToImage {
        src: u64,
        dst: u64,
        extent: vk::Extent2D,
    },
    Barrier {
        image: u64,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
}

impl Command {
    fn touches_buffer(&self, buffer: u64) -> bool {
        match *self {
            Command::CopyBuffer { src, dst, .. } => src == buffer || dst == buffer,
            Command::CopyBufferToImage { src, .. } => src == buffer,
            Command::Barrier { .. } => false,
        }
    }

    fn touches_image(&self, image: u64) -> bool {
        match *self {
            Command::CopyBuffer { .. } => false,
            Command::CopyBufferToImage { dst, .. } => dst == image,
            Command::Barrier { image: target, .. } => target == image,
        }
    }
}

struct CommandBufferState {
    pool: u64,
    recording: bool,
    in_flight: bool,
    commands: Vec<Command>,
    // Fence of the last submission; must be observed before re-recording.
    last_fence: Option<u64>,
}

struct FenceState {
    signaled: bool,
    // A wait has seen it signaled since its last submission.
    observed: bool,
}

struct SimBuffer {
    bytes: SimBytes,
    allocation: AllocationHandle,
}

struct SimImage {
    bytes: SimBytes,
    layout: vk::ImageLayout,
    // Swapchain images have no allocation and are destroyed with the chain.
    allocation: Option<AllocationHandle>,
}

struct SimSwapchain {
    images: Vec<u64>,
    next_image: usize,
    retired: bool,
}

struct PendingSubmit {
    command_buffer: u64,
    fence: u64,
    commands: Vec<Command>,
}

struct SimState {
    next_handle: u64,
    semaphores: HashMap<u64, bool>,
    fences: HashMap<u64, FenceState>,
    pools: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    image_views: HashMap<u64, u64>,
    buffers: HashMap<u64, SimBuffer>,
    images: HashMap<u64, SimImage>,
    swapchains: HashMap<u64, SimSwapchain>,
    pending: VecDeque<PendingSubmit>,
    acquire_script: VecDeque<SurfaceResponse>,
    present_script: VecDeque<SurfaceResponse>,
    failed_allocations: usize,
    stalled_waits: usize,
    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    counters: SimCounters,
    events: Vec<Event>,
    violations: Vec<String>,
}

impl SimState {
    fn new() -> Self {
        Self {
            next_handle: 0x1000,
            semaphores: HashMap::new(),
            fences: HashMap::new(),
            pools: HashSet::new(),
            command_buffers: HashMap::new(),
            image_views: HashMap::new(),
            buffers: HashMap::new(),
            images: HashMap::new(),
            swapchains: HashMap::new(),
            pending: VecDeque::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            failed_allocations: 0,
            stalled_waits: 0,
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 8,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 16384,
                    height: 16384,
                },
                max_image_array_layers: 1,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            counters: SimCounters::default(),
            events: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        warn!("GPU misuse: {message}");
        self.violations.push(message);
    }

    fn signal_semaphore(&mut self, semaphore: u64, by: &str) {
        match self.semaphores.get(&semaphore).copied() {
            Some(true) => self.violation(format!("{by} signals semaphore {semaphore:#x} twice")),
            Some(false) => {
                self.semaphores.insert(semaphore, true);
            }
            None => self.violation(format!("{by} signals unknown semaphore {semaphore:#x}")),
        }
    }

    fn wait_semaphore(&mut self, semaphore: u64, by: &str) {
        match self.semaphores.get(&semaphore).copied() {
            Some(true) => {
                self.semaphores.insert(semaphore, false);
            }
            Some(false) => {
                self.violation(format!("{by} waits on unsignaled semaphore {semaphore:#x}"));
            }
            None => self.violation(format!("{by} waits on unknown semaphore {semaphore:#x}")),
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: Command) {
        let raw = command_buffer.as_raw();
        let recording = self
            .command_buffers
            .get(&raw)
            .is_some_and(|state| state.recording);
        if !recording {
            self.violation(format!("Command recorded into {raw:#x}, which is not recording"));
            return;
        }
        if let Some(state) = self.command_buffers.get_mut(&raw) {
            state.commands.push(command);
        }
    }

    /// Run pending submissions in order, up to and including `count` of them.
    fn complete(&mut self, count: usize) {
        for submit in self.pending.drain(..count).collect::<Vec<_>>() {
            for command in &submit.commands {
                self.execute(command);
            }
            if let Some(state) = self.command_buffers.get_mut(&submit.command_buffer) {
                state.in_flight = false;
            }
            if let Some(fence) = self.fences.get_mut(&submit.fence) {
                fence.signaled = true;
            }
        }
    }

    fn complete_all(&mut self) {
        self.complete(self.pending.len());
    }

    fn execute(&mut self, command: &Command) {
        match *command {
            Command::CopyBuffer { src, dst, size } => {
                let (Some(src_buffer), Some(dst_buffer)) =
                    (self.buffers.get(&src), self.buffers.get(&dst))
                else {
                    self.violation(format!("Copy {src:#x} -> {dst:#x} on a destroyed buffer"));
                    return;
                };
                let len = usize::try_from(size).unwrap_or(usize::MAX);
                if len > src_buffer.bytes.len || len > dst_buffer.bytes.len {
                    self.violation(format!("Copy of {size} bytes overruns a buffer"));
                    return;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src_buffer.bytes.ptr.as_ptr(),
                        dst_buffer.bytes.ptr.as_ptr(),
                        len,
                    );
                }
            }
            Command::CopyBufferToImage { src, dst, extent } => {
                let (Some(src_buffer), Some(dst_image)) =
                    (self.buffers.get(&src), self.images.get(&dst))
                else {
                    self.violation(format!("Copy {src:#x} -> image {dst:#x} on a destroyed object"));
                    return;
                };
                if dst_image.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    let layout = dst_image.layout;
                    self.violation(format!("Copy into image {dst:#x} in layout {layout:?}"));
                    return;
                }
                let len = extent.width as usize * extent.height as usize * 4;
                if len > src_buffer.bytes.len || len > dst_image.bytes.len {
                    self.violation(format!("Image copy of {len} bytes overruns its source"));
                    return;
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src_buffer.bytes.ptr.as_ptr(),
                        dst_image.bytes.ptr.as_ptr(),
                        len,
                    );
                }
            }
            Command::Barrier {
                image,
                old_layout,
                new_layout,
            } => {
                let Some(target) = self.images.get_mut(&image) else {
                    self.violation(format!("Barrier on destroyed image {image:#x}"));
                    return;
                };
                let current = target.layout;
                target.layout = new_layout;
                if old_layout != vk::ImageLayout::UNDEFINED && old_layout != current {
                    self.violation(format!(
                        "Barrier on image {image:#x} expects {old_layout:?}, image is {current:?}"
                    ));
                }
            }
        }
    }

    fn live_objects(&self) -> usize {
        let owned_images = self
            .images
            .values()
            .filter(|image| image.allocation.is_some())
            .count();
        self.semaphores.len()
            + self.fences.len()
            + self.pools.len()
            + self.command_buffers.len()
            + self.image_views.len()
            + self.buffers.len()
            + owned_images
            + self.swapchains.len()
    }
}

/// In-memory GPU implementing [`Device`], [`MemoryBackend`] and
/// [`PresentationEngine`].
pub struct SimGpu {
    state: Mutex<SimState>,
}

impl SimGpu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new()),
        })
    }

    pub fn device(self: &Arc<Self>) -> SharedDevice {
        self.clone()
    }

    pub fn memory(self: &Arc<Self>) -> SharedMemory {
        self.clone()
    }

    pub fn presenter(self: &Arc<Self>) -> SharedPresenter {
        self.clone()
    }

    /// Queue outcomes for upcoming acquires. Unscripted acquires succeed.
    pub fn script_acquire(&self, responses: impl IntoIterator<Item = SurfaceResponse>) {
        self.state.lock().acquire_script.extend(responses);
    }

    /// Queue outcomes for upcoming presents. Unscripted presents succeed.
    pub fn script_present(&self, responses: impl IntoIterator<Item = SurfaceResponse>) {
        self.state.lock().present_script.extend(responses);
    }

    /// Pin the surface's current extent, or `None` to let it follow the
    /// swapchain.
    pub fn set_surface_extent(&self, extent: Option<vk::Extent2D>) {
        self.state.lock().capabilities.current_extent = extent.unwrap_or(vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        });
    }

    pub fn set_image_count_limits(&self, min: u32, max: u32) {
        let mut state = self.state.lock();
        state.capabilities.min_image_count = min;
        state.capabilities.max_image_count = max;
    }

    /// Make the next `count` buffer or image allocations fail.
    pub fn fail_allocations(&self, count: usize) {
        self.state.lock().failed_allocations = count;
    }

    /// Make the next `count` waits on unsignaled fences time out, leaving
    /// their work pending.
    pub fn stall_fence_waits(&self, count: usize) {
        self.state.lock().stalled_waits = count;
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Panic if any misuse has been recorded.
    #[track_caller]
    pub fn assert_clean(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "GPU misuse:\n{}", violations.join("\n"));
    }

    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Drain the event log.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.state.lock().events)
    }

    pub fn event_kinds(&self) -> Vec<&'static str> {
        self.state.lock().events.iter().map(Event::kind).collect()
    }

    /// Objects created and not yet destroyed. Swapchain images are counted
    /// through their swapchain.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .map(|fence| fence.signaled)
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> Option<bool> {
        self.state
            .lock()
            .semaphores
            .get(&semaphore.as_raw())
            .copied()
    }

    /// Contents of any live buffer, device-local ones included.
    pub fn buffer_bytes(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .map(|buffer| buffer.bytes.as_slice().to_vec())
    }

    pub fn image_bytes(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .map(|image| image.bytes.as_slice().to_vec())
    }

    pub fn image_layout(&self, image: vk::Image) -> Option<vk::ImageLayout> {
        self.state
            .lock()
            .images
            .get(&image.as_raw())
            .map(|image| image.layout)
    }
}

impl Device for SimGpu {
    fn queue(&self) -> vk::Queue {
        vk::Queue::from_raw(QUEUE)
    }

    fn queue_family(&self) -> u32 {
        0
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore.as_raw()).is_none() {
            state.violation(format!("Destroying unknown semaphore {semaphore:?}"));
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                observed: signaled,
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.pending.iter().any(|submit| submit.fence == raw) {
            state.violation(format!("Destroying fence {raw:#x} of pending work"));
        }
        if state.fences.remove(&raw).is_none() {
            state.violation(format!("Destroying unknown fence {raw:#x}"));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        state.counters.fence_waits += 1;

        let Some(signaled) = state.fences.get(&raw).map(|fence| fence.signaled) else {
            state.violation(format!("Waiting on unknown fence {raw:#x}"));
            return Err(GpuError::InvalidState(format!("Unknown fence {raw:#x}")));
        };
        state.events.push(Event::WaitFence { fence, signaled });

        if !signaled {
            if state.stalled_waits > 0 {
                state.stalled_waits -= 1;
                return Err(GpuError::Timeout(timeout, "fence"));
            }
            let Some(position) = state.pending.iter().position(|submit| submit.fence == raw) else {
                return Err(GpuError::Timeout(timeout, "fence"));
            };
            state.complete(position + 1);
        }

        if let Some(fence) = state.fences.get_mut(&raw) {
            fence.observed = true;
        }
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.pending.iter().any(|submit| submit.fence == raw) {
            state.violation(format!("Resetting fence {raw:#x} of pending work"));
        }
        state.events.push(Event::ResetFence { fence });
        match state.fences.get_mut(&raw) {
            Some(fence) => {
                fence.signaled = false;
                Ok(())
            }
            None => Err(GpuError::InvalidState(format!("Unknown fence {raw:#x}"))),
        }
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let raw = pool.as_raw();
        let owned: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == raw)
            .map(|(&handle, _)| handle)
            .collect();
        for handle in owned {
            if let Some(cb) = state.command_buffers.remove(&handle) {
                if cb.in_flight {
                    state.violation(format!(
                        "Pool {raw:#x} destroyed with command buffer {handle:#x} in flight"
                    ));
                }
            }
        }
        if !state.pools.remove(&raw) {
            state.violation(format!("Destroying unknown pool {raw:#x}"));
        }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.pools.contains(&pool.as_raw()) {
            return Err(GpuError::InvalidState(format!("Unknown pool {pool:?}")));
        }
        let mut ret = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = state.handle();
            state.command_buffers.insert(
                raw,
                CommandBufferState {
                    pool: pool.as_raw(),
                    recording: false,
                    in_flight: false,
                    commands: Vec::new(),
                    last_fence: None,
                },
            );
            ret.push(vk::CommandBuffer::from_raw(raw));
        }
        Ok(ret)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for command_buffer in command_buffers {
            let raw = command_buffer.as_raw();
            match state.command_buffers.remove(&raw) {
                Some(cb) if cb.in_flight => {
                    state.violation(format!("Freeing command buffer {raw:#x} in flight"));
                }
                Some(_) => {}
                None => state.violation(format!("Freeing unknown command buffer {raw:#x}")),
            }
        }
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let raw = command_buffer.as_raw();
        state.events.push(Event::Begin { command_buffer });

        let Some(cb) = state.command_buffers.get(&raw) else {
            return Err(GpuError::InvalidState(format!("Unknown command buffer {raw:#x}")));
        };
        let in_flight = cb.in_flight;
        let unobserved = cb
            .last_fence
            .filter(|fence| state.fences.get(fence).is_some_and(|f| !f.observed));

        if in_flight {
            state.violation(format!("Re-recording command buffer {raw:#x} while in flight"));
        }
        if let Some(fence) = unobserved {
            state.violation(format!(
                "Re-recording command buffer {raw:#x} before fence {fence:#x} was waited on"
            ));
        }

        if let Some(cb) = state.command_buffers.get_mut(&raw) {
            cb.recording = true;
            cb.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let raw = command_buffer.as_raw();
        match state.command_buffers.get_mut(&raw) {
            Some(cb) if cb.recording => {
                cb.recording = false;
                Ok(())
            }
            Some(_) => Err(GpuError::InvalidState(format!(
                "Command buffer {raw:#x} is not recording"
            ))),
            None => Err(GpuError::InvalidState(format!(
                "Unknown command buffer {raw:#x}"
            ))),
        }
    }

    fn submit(&self, submit: &QueueSubmit) -> Result<()> {
        let mut state = self.state.lock();
        let raw = submit.command_buffer.as_raw();
        let fence = submit.fence.as_raw();
        state.counters.submissions += 1;
        state.events.push(Event::Submit {
            command_buffer: submit.command_buffer,
            fence: submit.fence,
        });

        let commands = match state.command_buffers.get_mut(&raw) {
            Some(cb) if !cb.recording && !cb.in_flight => {
                cb.in_flight = true;
                cb.last_fence = (fence != 0).then_some(fence);
                cb.commands.clone()
            }
            Some(_) => {
                state.violation(format!(
                    "Submitting command buffer {raw:#x} that is recording or in flight"
                ));
                Vec::new()
            }
            None => {
                return Err(GpuError::InvalidState(format!(
                    "Unknown command buffer {raw:#x}"
                )))
            }
        };

        if let Some(wait) = submit.wait {
            state.wait_semaphore(wait.semaphore.as_raw(), "Submission");
        }
        if let Some(signal) = submit.signal {
            state.signal_semaphore(signal.semaphore.as_raw(), "Submission");
        }
        if fence != 0 {
            match state.fences.get_mut(&fence) {
                Some(f) if f.signaled => {
                    state.violation(format!("Submitting with signaled fence {fence:#x}"));
                }
                Some(f) => f.observed = false,
                None => state.violation(format!("Submitting with unknown fence {fence:#x}")),
            }
        }

        state.pending.push_back(PendingSubmit {
            command_buffer: raw,
            fence,
            commands,
        });
        Ok(())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _mip_levels: u32,
    ) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image.as_raw()) {
            state.violation(format!("View of unknown image {image:?}"));
        }
        let raw = state.handle();
        state.image_views.insert(raw, image.as_raw());
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.image_views.remove(&view.as_raw()).is_none() {
            state.violation(format!("Destroying unknown image view {view:?}"));
        }
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(Event::WaitIdle);
        state.complete_all();
        for fence in state.fences.values_mut() {
            if fence.signaled {
                fence.observed = true;
            }
        }
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        barriers: &[vk::ImageMemoryBarrier2<'_>],
    ) {
        let mut state = self.state.lock();
        for barrier in barriers {
            state.record(
                command_buffer,
                Command::Barrier {
                    image: barrier.image.as_raw(),
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                },
            );
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        self.state.lock().record(
            command_buffer,
            Command::CopyBuffer {
                src: src.as_raw(),
                dst: dst.as_raw(),
                size,
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent2D,
    ) {
        self.state.lock().record(
            command_buffer,
            Command::CopyBufferToImage {
                src: src.as_raw(),
                dst: dst.as_raw(),
                extent,
            },
        );
    }
}

impl MemoryBackend for SimGpu {
    fn create_buffer(&self, request: &BufferRequest) -> Result<BufferAllocation> {
        let mut state = self.state.lock();
        state.counters.buffers_created += 1;
        if request.size == 0 {
            state.violation("Zero-sized buffer reached the backend".to_string());
        }
        if state.failed_allocations > 0 {
            state.failed_allocations -= 1;
            return Err(GpuError::AllocationFailed("Simulated out of memory".to_string()));
        }

        let len = usize::try_from(request.size)
            .map_err(|_| GpuError::AllocationFailed("Buffer too large".to_string()))?;
        let bytes = SimBytes::zeroed(len);
        let mapped = (request.memory_type == MemoryType::Host).then_some(bytes.ptr);

        let raw = state.handle();
        let allocation = AllocationHandle(state.handle());
        state.buffers.insert(raw, SimBuffer { bytes, allocation });

        Ok(BufferAllocation {
            buffer: vk::Buffer::from_raw(raw),
            allocation,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationHandle) {
        let mut state = self.state.lock();
        let raw = buffer.as_raw();
        if state
            .pending
            .iter()
            .any(|submit| submit.commands.iter().any(|c| c.touches_buffer(raw)))
        {
            state.violation(format!("Destroying buffer {raw:#x} used by pending work"));
        }
        match state.buffers.remove(&raw) {
            Some(sim) if sim.allocation == allocation => {}
            Some(_) => state.violation(format!("Buffer {raw:#x} freed with wrong allocation")),
            None => state.violation(format!("Destroying unknown buffer {raw:#x}")),
        }
    }

    fn create_image(&self, request: &ImageRequest) -> Result<ImageAllocation> {
        let mut state = self.state.lock();
        state.counters.images_created += 1;
        if request.extent.width == 0 || request.extent.height == 0 {
            state.violation("Zero-sized image reached the backend".to_string());
        }
        if state.failed_allocations > 0 {
            state.failed_allocations -= 1;
            return Err(GpuError::AllocationFailed("Simulated out of memory".to_string()));
        }

        let len = request.extent.width as usize * request.extent.height as usize * 4;
        let raw = state.handle();
        let allocation = AllocationHandle(state.handle());
        state.images.insert(
            raw,
            SimImage {
                bytes: SimBytes::zeroed(len),
                layout: vk::ImageLayout::UNDEFINED,
                allocation: Some(allocation),
            },
        );

        Ok(ImageAllocation {
            image: vk::Image::from_raw(raw),
            allocation,
        })
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationHandle) {
        let mut state = self.state.lock();
        let raw = image.as_raw();
        if state
            .pending
            .iter()
            .any(|submit| submit.commands.iter().any(|c| c.touches_image(raw)))
        {
            state.violation(format!("Destroying image {raw:#x} used by pending work"));
        }
        match state.images.remove(&raw) {
            Some(sim) if sim.allocation == Some(allocation) => {}
            Some(_) => state.violation(format!("Image {raw:#x} freed with wrong allocation")),
            None => state.violation(format!("Destroying unknown image {raw:#x}")),
        }
    }
}

fn surface_result(response: SurfaceResponse) -> std::result::Result<bool, vk::Result> {
    match response {
        SurfaceResponse::Ok => Ok(false),
        SurfaceResponse::Suboptimal => Ok(true),
        SurfaceResponse::OutOfDate => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
        SurfaceResponse::DeviceLost => Err(vk::Result::ERROR_DEVICE_LOST),
    }
}

impl PresentationEngine for SimGpu {
    fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn surface_present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        state.counters.swapchains_created += 1;
        state.events.push(Event::CreateSwapchain {
            extent: desc.extent,
        });

        let old = desc.old_swapchain.as_raw();
        if old != 0 {
            match state.swapchains.get_mut(&old) {
                Some(chain) => chain.retired = true,
                None => state.violation(format!("Old swapchain {old:#x} is not live")),
            }
        }

        let len = desc.extent.width as usize * desc.extent.height as usize * 4;
        let mut images = Vec::with_capacity(desc.min_image_count as usize);
        for _ in 0..desc.min_image_count {
            let raw = state.handle();
            state.images.insert(
                raw,
                SimImage {
                    bytes: SimBytes::zeroed(len),
                    layout: vk::ImageLayout::UNDEFINED,
                    allocation: None,
                },
            );
            images.push(raw);
        }

        let raw = state.handle();
        state.swapchains.insert(
            raw,
            SimSwapchain {
                images,
                next_image: 0,
                retired: false,
            },
        );
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.events.push(Event::DestroySwapchain);
        let Some(chain) = state.swapchains.remove(&swapchain.as_raw()) else {
            state.violation(format!("Destroying unknown swapchain {swapchain:?}"));
            return;
        };
        for image in chain.images {
            if state.image_views.values().any(|&target| target == image) {
                state.violation(format!("Swapchain image {image:#x} still has a view"));
            }
            state.images.remove(&image);
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let state = self.state.lock();
        let chain = state
            .swapchains
            .get(&swapchain.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown swapchain {swapchain:?}")))?;
        Ok(chain.images.iter().map(|&raw| vk::Image::from_raw(raw)).collect())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal_semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        let mut state = self.state.lock();
        let response = state
            .acquire_script
            .pop_front()
            .unwrap_or(SurfaceResponse::Ok);

        let suboptimal = match surface_result(response) {
            Ok(suboptimal) => suboptimal,
            Err(e) => {
                if e == vk::Result::ERROR_OUT_OF_DATE_KHR {
                    state.events.push(Event::AcquireStale);
                }
                return Err(e);
            }
        };

        let raw = swapchain.as_raw();
        let image_index = match state.swapchains.get_mut(&raw) {
            Some(chain) if !chain.retired && !chain.images.is_empty() => {
                let index = chain.next_image;
                chain.next_image = (index + 1) % chain.images.len();
                index as u32
            }
            _ => {
                state.violation(format!("Acquiring from retired or unknown swapchain {raw:#x}"));
                return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
            }
        };

        state.signal_semaphore(signal_semaphore.as_raw(), "Acquire");
        state.events.push(Event::Acquire { image_index });
        Ok((image_index, suboptimal))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> std::result::Result<bool, vk::Result> {
        let mut state = self.state.lock();
        state.counters.presents += 1;
        if !state.swapchains.contains_key(&swapchain.as_raw()) {
            state.violation(format!("Presenting to unknown swapchain {swapchain:?}"));
        }

        // The wait executes even when the present is rejected.
        state.wait_semaphore(wait_semaphore.as_raw(), "Present");

        let response = state
            .present_script
            .pop_front()
            .unwrap_or(SurfaceResponse::Ok);
        let result = surface_result(response);
        match result {
            Ok(_) => state.events.push(Event::Present { image_index }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => state.events.push(Event::PresentStale),
            Err(_) => {}
        }
        result
    }
}
