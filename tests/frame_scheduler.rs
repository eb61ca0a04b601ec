use std::sync::Arc;
use std::time::Duration;

use legacy_shim::backend::host::{CompletionMode, HostDevice};
use legacy_shim::backend::{BufferUsage, GpuDevice, TextureState};
use legacy_shim::{FrameConfig, FrameError, FrameScheduler, LockMode, RingError, StreamingBuffer, StreamingBufferDesc};
use pretty_assertions::assert_eq;

fn scheduler(mode: CompletionMode, ring_buffer_size: u32) -> (Arc<HostDevice>, FrameScheduler) {
    let host = Arc::new(HostDevice::with_completion(mode));
    let device: Arc<dyn GpuDevice> = host.clone();
    let frames = FrameScheduler::new(
        device,
        &FrameConfig {
            back_buffer_count: 2,
            ring_buffer_size,
            fence_timeout: Duration::from_millis(50),
            width: 320,
            height: 240,
            ..Default::default()
        },
    )
    .unwrap();
    (host, frames)
}

#[test]
fn cpu_never_runs_more_than_two_frames_ahead() {
    let (host, mut frames) = scheduler(CompletionMode::Deferred, 64 * 1024);
    assert_eq!(frames.current_frame(), 1);

    for _ in 0..6 {
        frames.submit(true).unwrap();
        assert!(frames.current_frame() - frames.completed_frame() <= 2);
    }
    assert_eq!(frames.current_frame(), 7);
    assert_eq!(frames.stats().frames_submitted, 6);
    // The first submit finds a free slot; every later one waits.
    assert_eq!(frames.stats().blocking_waits, 5);
    assert_eq!(host.stats().presents, 6);
}

#[test]
fn only_the_second_submit_blocks_with_two_back_buffers() {
    let (_host, mut frames) = scheduler(CompletionMode::Deferred, 64 * 1024);

    frames.submit(true).unwrap();
    assert_eq!(frames.stats().blocking_waits, 0);
    assert_eq!(frames.completed_frame(), 0);

    frames.submit(true).unwrap();
    assert_eq!(frames.stats().blocking_waits, 1);
    assert_eq!(frames.completed_frame(), 1);
    assert_eq!(frames.fence_value(0), 1);
    assert_eq!(frames.fence_value(1), 2);
}

#[test]
fn used_resources_live_until_their_frame_completes() {
    let (_host, mut frames) = scheduler(CompletionMode::Deferred, 64 * 1024);
    let resource = Arc::new(42u32);

    frames.mark_resource_as_used(Box::new(resource.clone()));
    assert_eq!(frames.kept_alive_count(), 1);
    assert_eq!(Arc::strong_count(&resource), 2);

    frames.submit(true).unwrap();
    assert_eq!(Arc::strong_count(&resource), 2);

    frames.submit(true).unwrap();
    assert_eq!(Arc::strong_count(&resource), 1);
    assert_eq!(frames.kept_alive_count(), 0);
}

#[test]
fn stalled_gpu_surfaces_a_timeout() {
    let (host, mut frames) = scheduler(CompletionMode::Deferred, 64 * 1024);

    frames.submit(true).unwrap();
    host.set_stalled(true);
    match frames.submit(true) {
        Err(FrameError::GpuTimeout { value, completed, timeout }) => {
            assert_eq!(value, 1);
            assert_eq!(completed, 0);
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected GpuTimeout, got {:?}", other),
    }

    // The failed frame left no command list open.
    assert!(matches!(frames.submit(true), Err(FrameError::CommandListClosed)));
    host.set_stalled(false);
}

#[test]
fn epoch_tracks_submits_and_resets() {
    let (_host, mut frames) = scheduler(CompletionMode::Immediate, 64 * 1024);
    assert_eq!(frames.epoch(), 0);

    frames.submit(true).unwrap();
    assert_eq!(frames.epoch(), 1);
    assert_eq!(frames.current_back_buffer(), 1);

    // Reset flushes the open frame (one more submit) and then bumps again.
    frames.reset(640, 480).unwrap();
    assert_eq!(frames.epoch(), 3);
    assert_eq!(frames.extent(), (640, 480));
    assert_eq!(frames.current_back_buffer(), 0);
    assert_eq!(frames.back_buffer().extent(), (640, 480));
    assert_eq!(frames.completed_frame(), frames.current_frame() - 1);
}

#[test]
fn waiting_for_the_open_frame_submits_it_first() {
    let (_host, mut frames) = scheduler(CompletionMode::Deferred, 64 * 1024);
    let frame = frames.current_frame();

    frames.wait_for_frame(frame).unwrap();
    assert_eq!(frames.stats().frames_submitted, 1);
    assert!(frames.completed_frame() >= frame);
    assert_eq!(frames.current_frame(), frame + 1);
}

#[test]
fn presented_back_buffer_ends_in_present_state() {
    let (host, mut frames) = scheduler(CompletionMode::Immediate, 64 * 1024);
    let back_buffer = frames.back_buffer();

    frames.submit(true).unwrap();
    assert_eq!(host.texture_state(back_buffer.id()), Some(TextureState::Present));
    assert_eq!(frames.current_back_buffer(), 1);

    // The next slot's transition runs with the next frame.
    let next = frames.back_buffer();
    frames.submit(false).unwrap();
    assert_eq!(host.texture_state(next.id()), Some(TextureState::RenderTarget));
}

#[test]
fn ring_space_is_reclaimed_frame_by_frame() {
    let (_host, mut frames) = scheduler(CompletionMode::Deferred, 1024);

    // Frame 1
    let (alloc, _) = frames.stage_upload(&[1u8; 512], 256).unwrap();
    assert_eq!(alloc.offset, 0);
    frames.submit(true).unwrap();

    // Frame 2: frame 1 is still in flight.
    let (alloc, _) = frames.stage_upload(&[2u8; 512], 256).unwrap();
    assert_eq!(alloc.offset, 512);
    match frames.stage_upload(&[3u8; 256], 256) {
        Err(FrameError::Ring(error)) => assert_eq!(
            error,
            RingError::OutOfSpace {
                requested: 256,
                head: 0,
                tail: 1024,
                capacity: 1024
            }
        ),
        other => panic!("expected OutOfSpace, got {:?}", other.map(|(a, _)| a)),
    }
    frames.submit(true).unwrap();

    // Frame 3: frame 1 retired, so the start of the ring is free again.
    let (alloc, _) = frames.stage_upload(&[4u8; 256], 256).unwrap();
    assert_eq!(alloc.offset, 0);
    // Tail may never catch up with head.
    assert!(matches!(
        frames.stage_upload(&[5u8; 256], 256),
        Err(FrameError::Ring(RingError::OutOfSpace { head: 512, tail: 256, .. }))
    ));
}

#[test]
fn persistence_is_queued_once_per_buffer() {
    let (host, mut frames) = scheduler(CompletionMode::Immediate, 64 * 1024);
    let desc = StreamingBufferDesc::new("constants", 256, BufferUsage::CONSTANT).dynamic(true);
    let buffer = StreamingBuffer::new(host.as_ref(), &desc).unwrap();

    drop(buffer.lock(&mut frames, 0, 64, LockMode::Discard).unwrap());
    drop(buffer.lock(&mut frames, 64, 64, LockMode::NoOverwrite).unwrap());
    frames.mark_buffer_for_persist(&buffer.clone());
    assert_eq!(frames.pending_persist_count(), 1);

    frames.submit(false).unwrap();
    assert_eq!(frames.stats().persisted_buffers, 1);
    assert_eq!(frames.stats().persisted_bytes, 128);
}
