//! Frame loop behaviour against the simulated GPU.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use ash::vk;
use glam::UVec2;

use vellum_gpu::{Fence, GpuError, Swapchain, SwapchainConfig};
use vellum_test::{Event, SimGpu, SimHarness, SurfaceResponse};

const SIZE: UVec2 = UVec2::new(800, 600);
const RESIZED: UVec2 = UVec2::new(1024, 768);

/// Every command buffer re-recording must be preceded by a wait that saw
/// the fence of its previous submission.
fn assert_fence_before_rerecord(events: &[Event]) {
    let mut outstanding: HashMap<vk::CommandBuffer, vk::Fence> = HashMap::new();
    let mut observed: HashSet<vk::Fence> = HashSet::new();

    for (position, event) in events.iter().enumerate() {
        match *event {
            Event::Submit {
                command_buffer,
                fence,
            } => {
                observed.remove(&fence);
                outstanding.insert(command_buffer, fence);
            }
            Event::WaitFence { fence, .. } => {
                observed.insert(fence);
            }
            Event::WaitIdle => observed.extend(outstanding.values().copied()),
            Event::Begin { command_buffer } => {
                if let Some(fence) = outstanding.get(&command_buffer) {
                    assert!(
                        observed.contains(fence),
                        "{command_buffer:?} re-recorded at event {position} before {fence:?} was waited on"
                    );
                }
            }
            _ => {}
        }
    }
}

fn count(events: &[Event], kind: &str) -> usize {
    events.iter().filter(|event| event.kind() == kind).count()
}

#[test]
fn slots_are_not_rerecorded_before_their_fence() {
    for frames_in_flight in 1..=3 {
        let mut harness = SimHarness::new(SIZE, frames_in_flight).unwrap();
        for _ in 0..10 {
            assert!(harness.tick(SIZE).unwrap().is_some());
        }

        let events = harness.sim.events();
        assert_fence_before_rerecord(&events);
        assert_eq!(count(&events, "submit"), 10);
        harness.sim.assert_clean();
    }
}

#[test]
fn gpu_work_is_bounded_by_frames_in_flight() {
    for frames_in_flight in 1..=3 {
        let mut harness = SimHarness::new(SIZE, frames_in_flight).unwrap();
        for _ in 0..8 {
            harness.tick(SIZE).unwrap();
            assert!(harness.sim.pending_submissions() <= frames_in_flight);
        }
    }
}

#[test]
fn frame_index_wraps() {
    let mut harness = SimHarness::new(SIZE, 3).unwrap();
    for tick in 1..=7_u64 {
        harness.tick(SIZE).unwrap();
        assert_eq!(harness.frames.frame_count(), tick);
        assert_eq!(harness.frames.frame_index(), (tick % 3) as usize);
    }
}

#[test]
fn stale_acquire_retries_same_slot() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.tick(SIZE).unwrap();
    assert_eq!(harness.frames.frame_index(), 1);
    harness.sim.take_events();

    harness.sim.script_acquire([SurfaceResponse::OutOfDate]);
    assert!(harness.tick(SIZE).unwrap().is_none());

    assert_eq!(harness.frames.frame_index(), 1);
    assert_eq!(harness.frames.frame_count(), 1);

    let events = harness.sim.take_events();
    let Some(Event::WaitFence { fence, .. }) = events.first().cloned() else {
        panic!("tick did not start with a fence wait: {events:?}");
    };
    assert_eq!(harness.sim.fence_signaled(fence), Some(true));
    assert_eq!(count(&events, "reset_fence"), 0);
    assert_eq!(count(&events, "create_swapchain"), 1);
    assert_eq!(harness.sim.counters().swapchains_created, 2);

    // The retry waits on the same, still signaled, fence.
    assert!(harness.tick(SIZE).unwrap().is_some());
    let retry = harness.sim.events();
    assert_eq!(
        retry.first(),
        Some(&Event::WaitFence {
            fence,
            signaled: true
        })
    );
    harness.sim.assert_clean();
}

#[test]
fn stale_acquires_never_double_signal() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.sim.script_acquire([
        SurfaceResponse::OutOfDate,
        SurfaceResponse::OutOfDate,
        SurfaceResponse::Ok,
        SurfaceResponse::OutOfDate,
        SurfaceResponse::Suboptimal,
        SurfaceResponse::OutOfDate,
    ]);

    let rendered = (0..10)
        .filter(|_| harness.tick(SIZE).unwrap().is_some())
        .count();

    assert_eq!(rendered, 6);
    assert_eq!(harness.sim.counters().swapchains_created, 5);
    harness.sim.assert_clean();
}

#[test]
fn resize_without_staleness_recreates_once() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.tick(SIZE).unwrap();
    harness.sim.take_events();

    // The presentation engine keeps accepting the old chain.
    assert!(harness.tick(RESIZED).unwrap().is_some());
    assert!(harness.tick(RESIZED).unwrap().is_some());

    let events = harness.sim.events();
    assert_eq!(count(&events, "create_swapchain"), 1);
    assert_eq!(harness.swapchain.size(), RESIZED);

    let created = events
        .iter()
        .position(|event| event.kind() == "create_swapchain")
        .unwrap();
    let acquires: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.kind() == "acquire")
        .map(|(position, _)| position)
        .collect();
    assert!(acquires[0] < created && created < acquires[1]);
    assert_eq!(
        events[created],
        Event::CreateSwapchain {
            extent: vk::Extent2D {
                width: 1024,
                height: 768
            }
        }
    );
    harness.sim.assert_clean();
}

#[test]
fn stale_present_during_resize_recreates_once() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.tick(SIZE).unwrap();

    harness.sim.script_present([SurfaceResponse::OutOfDate]);
    assert!(harness.tick(RESIZED).unwrap().is_some());

    assert_eq!(harness.sim.counters().swapchains_created, 2);
    assert_eq!(harness.swapchain.size(), RESIZED);
    harness.sim.assert_clean();
}

#[test]
fn stale_present_recreates_at_same_size() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.sim.script_present([SurfaceResponse::OutOfDate]);

    assert!(harness.tick(SIZE).unwrap().is_some());
    assert!(harness.tick(SIZE).unwrap().is_some());

    assert_eq!(harness.sim.counters().swapchains_created, 2);
    assert_eq!(harness.frames.frame_count(), 2);
    harness.sim.assert_clean();
}

#[test]
fn suboptimal_is_not_stale() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.sim.script_acquire([SurfaceResponse::Suboptimal]);
    harness.sim.script_present([SurfaceResponse::Suboptimal]);

    assert!(harness.tick(SIZE).unwrap().is_some());
    assert_eq!(harness.sim.counters().swapchains_created, 1);
}

#[test]
fn minimized_window_skips_without_waiting() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.tick(SIZE).unwrap();
    harness.sim.take_events();

    assert!(harness.tick(UVec2::ZERO).unwrap().is_none());
    assert!(harness.tick(UVec2::new(800, 0)).unwrap().is_none());
    assert!(harness.sim.events().is_empty());

    assert!(harness.tick(SIZE).unwrap().is_some());
    harness.sim.assert_clean();
}

#[test]
fn degenerate_surface_defers_recreation() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.tick(SIZE).unwrap();

    harness.sim.set_surface_extent(Some(vk::Extent2D {
        width: 0,
        height: 0,
    }));
    harness.sim.script_acquire([SurfaceResponse::OutOfDate]);
    assert!(harness.tick(SIZE).unwrap().is_none());
    assert!(harness.tick(SIZE).unwrap().is_none());
    assert_eq!(harness.sim.counters().swapchains_created, 1);

    harness.sim.set_surface_extent(None);
    harness.sim.take_events();
    assert!(harness.tick(SIZE).unwrap().is_some());

    // Recreated before touching the slot.
    let kinds = harness.sim.event_kinds();
    assert_eq!(&kinds[..3], ["wait_idle", "create_swapchain", "destroy_swapchain"]);
    assert_eq!(harness.sim.counters().swapchains_created, 2);
    harness.sim.assert_clean();
}

#[test]
fn starting_minimized_defers_the_first_swapchain() {
    let mut harness = SimHarness::deferred(2).unwrap();
    assert!(!harness.swapchain.is_created());

    assert!(harness.tick(UVec2::ZERO).unwrap().is_none());
    harness.sim.set_surface_extent(Some(vk::Extent2D {
        width: 0,
        height: 0,
    }));
    assert!(harness.tick(SIZE).unwrap().is_none());
    assert_eq!(harness.sim.counters().swapchains_created, 0);
    assert_eq!(harness.sim.counters().fence_waits, 0);

    // Restored: the chain is built before the first fence wait.
    harness.sim.set_surface_extent(None);
    harness.sim.take_events();
    let target = harness.tick(SIZE).unwrap().unwrap();
    let kinds = harness.sim.event_kinds();
    assert_eq!(&kinds[..2], ["wait_idle", "create_swapchain"]);
    assert_eq!(target.extent.width, SIZE.x);
    assert_eq!(harness.sim.counters().swapchains_created, 1);

    assert!(harness.tick(SIZE).unwrap().is_some());
    assert_eq!(harness.sim.counters().swapchains_created, 1);
    harness.sim.assert_clean();
}

#[test]
fn device_loss_is_fatal() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.sim.script_acquire([SurfaceResponse::DeviceLost]);

    let err = harness.tick(SIZE).unwrap_err();
    assert!(matches!(
        err,
        GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
    ));
}

#[test]
fn out_of_order_calls_are_rejected() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();

    assert!(matches!(
        harness.frames.begin_recording(&harness.swapchain),
        Err(GpuError::InvalidState(_))
    ));
    assert!(matches!(
        harness.frames.submit_and_present(&mut harness.swapchain),
        Err(GpuError::InvalidState(_))
    ));

    let target = harness
        .frames
        .acquire(&mut harness.swapchain, SIZE)
        .unwrap()
        .unwrap();
    assert_eq!(harness.frames.render_target(), Some(target));
    assert!(matches!(
        harness.frames.acquire(&mut harness.swapchain, SIZE),
        Err(GpuError::InvalidState(_))
    ));
    assert!(matches!(
        harness.frames.submit_and_present(&mut harness.swapchain),
        Err(GpuError::InvalidState(_))
    ));

    harness.frames.begin_recording(&harness.swapchain).unwrap();
    harness
        .frames
        .submit_and_present(&mut harness.swapchain)
        .unwrap();
    assert_eq!(harness.frames.render_target(), None);
    harness.sim.assert_clean();
}

#[test]
fn render_target_matches_swapchain() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    let target = harness.tick(SIZE).unwrap().unwrap();

    assert_eq!(
        target.extent,
        vk::Extent2D {
            width: 800,
            height: 600
        }
    );
    assert_eq!(target.image_index, 0);
    assert_eq!(harness.swapchain.image_count(), 3);
    assert_eq!(harness.swapchain.format(), vk::Format::B8G8R8A8_SRGB);

    // Recorded work only runs once something waits on it.
    assert_eq!(
        harness.sim.image_layout(target.image),
        Some(vk::ImageLayout::UNDEFINED)
    );
    harness.frames.wait_all().unwrap();
    assert_eq!(
        harness.sim.image_layout(target.image),
        Some(vk::ImageLayout::PRESENT_SRC_KHR)
    );
}

#[test]
fn base_barrier_needs_an_acquired_image() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    assert!(harness.swapchain.base_barrier().is_none());
    assert!(harness.swapchain.present_semaphore().is_none());

    let target = harness
        .frames
        .acquire(&mut harness.swapchain, SIZE)
        .unwrap()
        .unwrap();
    let barrier = harness.swapchain.base_barrier().unwrap();
    assert_eq!(barrier.image, target.image);
    assert_eq!(
        barrier.src_stage_mask,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
    );
    assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
    assert!(harness.swapchain.present_semaphore().is_some());
}

#[test]
fn zero_sized_swapchain_is_an_error() {
    let sim = SimGpu::new();
    let result = Swapchain::new(
        sim.device(),
        sim.presenter(),
        UVec2::new(0, 600),
        SwapchainConfig::default(),
    );
    assert!(matches!(result, Err(GpuError::SwapchainCreation(_))));
    assert_eq!(sim.counters().swapchains_created, 0);
}

#[test]
fn hung_fence_times_out() {
    let sim = SimGpu::new();
    let fence = Fence::new(&sim.device(), false).unwrap();
    let err = fence.wait(Duration::from_millis(10)).unwrap_err();
    assert!(matches!(err, GpuError::Timeout(..)));
}

#[test]
fn teardown_releases_everything() {
    let mut harness = SimHarness::new(SIZE, 3).unwrap();
    for _ in 0..4 {
        harness.tick(SIZE).unwrap();
    }
    harness.tick(RESIZED).unwrap();

    let sim = harness.sim.clone();
    drop(harness);

    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.pending_submissions(), 0);
    sim.assert_clean();
}

#[test]
fn stale_tick_event_sequence() {
    let mut harness = SimHarness::new(SIZE, 2).unwrap();
    harness.sim.take_events();
    harness.sim.script_acquire([SurfaceResponse::OutOfDate]);

    harness.tick(SIZE).unwrap();
    harness.tick(SIZE).unwrap();

    insta::assert_debug_snapshot!(harness.sim.event_kinds(), @r###"
    [
        "wait_fence",
        "acquire_stale",
        "wait_idle",
        "create_swapchain",
        "destroy_swapchain",
        "wait_fence",
        "acquire",
        "reset_fence",
        "begin",
        "submit",
        "present",
    ]
    "###);
}
