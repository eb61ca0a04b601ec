use std::sync::Arc;

use legacy_shim::backend::host::{CompletionMode, HostBuffer, HostDevice};
use legacy_shim::backend::{BufferUsage, GpuDevice};
use legacy_shim::streaming::Residency;
use legacy_shim::{FrameConfig, FrameScheduler, LockError, LockMode, RingError, StreamingBuffer, StreamingBufferDesc};
use pretty_assertions::assert_eq;

fn setup(mode: CompletionMode) -> (Arc<HostDevice>, FrameScheduler) {
    setup_with_ring(mode, 64 * 1024)
}

fn setup_with_ring(mode: CompletionMode, ring_buffer_size: u32) -> (Arc<HostDevice>, FrameScheduler) {
    let host = Arc::new(HostDevice::with_completion(mode));
    let device: Arc<dyn GpuDevice> = host.clone();
    let frames = FrameScheduler::new(
        device,
        &FrameConfig {
            ring_buffer_size,
            width: 64,
            height: 64,
            ..Default::default()
        },
    )
    .unwrap();
    (host, frames)
}

fn dynamic_buffer(host: &HostDevice, size: u32) -> StreamingBuffer {
    let desc = StreamingBufferDesc::new("test vb", size, BufferUsage::VERTEX).dynamic(true);
    StreamingBuffer::new(host, &desc).unwrap()
}

#[test]
fn discard_stays_speculative_until_address_is_needed() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    {
        let mut lock = buffer.lock(&mut frames, 0, 256, LockMode::Discard).unwrap();
        assert!(!lock.is_direct());
        lock.write(0, &[7u8; 256]).unwrap();
    }

    assert_eq!(buffer.residency(), Residency::SpeculativeDiscard);
    assert_eq!(frames.pending_persist_count(), 1);
    assert_eq!(frames.ring().used_bytes(), 0);

    let address = buffer.gpu_address(&mut frames).unwrap();
    assert_eq!(address.buffer_id(), frames.ring().buffer().id());
    assert_eq!(buffer.residency(), Residency::RingBacked);
    assert_eq!(frames.ring().used_bytes(), 256);
    assert_eq!(HostBuffer::read_address(&address, 256).unwrap(), vec![7u8; 256]);
}

#[test]
fn no_overwrite_appends_into_the_discarded_allocation() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 512);

    buffer
        .lock(&mut frames, 0, 256, LockMode::Discard)
        .unwrap()
        .write(0, &[1u8; 256])
        .unwrap();
    buffer
        .lock(&mut frames, 256, 256, LockMode::NoOverwrite)
        .unwrap()
        .write(0, &[2u8; 256])
        .unwrap();

    assert_eq!(buffer.residency(), Residency::RingBacked);
    assert_eq!(buffer.written_ranges(), vec![(0, 512)]);

    let address = buffer.gpu_address(&mut frames).unwrap();
    let contents = HostBuffer::read_address(&address, 512).unwrap();
    assert_eq!(&contents[..256], &[1u8; 256][..]);
    assert_eq!(&contents[256..], &[2u8; 256][..]);
}

#[test]
fn submit_persists_writes_into_the_backing_buffer() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    buffer
        .lock(&mut frames, 0, 256, LockMode::Discard)
        .unwrap()
        .write(0, &[9u8; 256])
        .unwrap();
    frames.submit(false).unwrap();

    assert_eq!(host.stats().copied_bytes, 256);
    assert_eq!(frames.stats().persisted_bytes, 256);
    assert_eq!(frames.stats().persisted_buffers, 1);
    assert_eq!(frames.pending_persist_count(), 0);
    assert_eq!(buffer.residency(), Residency::Clean);

    // Later frames read the persistent copy.
    let address = buffer.gpu_address(&mut frames).unwrap();
    assert_eq!(address.buffer_id(), buffer.id());
    assert_eq!(address.offset, 0);
    assert_eq!(HostBuffer::read_address(&address, 256).unwrap(), vec![9u8; 256]);
}

#[test]
fn static_buffers_only_accept_normal_locks() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = StreamingBuffer::new(host.as_ref(), &StreamingBufferDesc::new("static", 512, BufferUsage::INDEX)).unwrap();

    for mode in [LockMode::Discard, LockMode::NoOverwrite] {
        match buffer.lock(&mut frames, 0, 64, mode) {
            Err(LockError::InvalidModeForStatic(rejected)) => assert_eq!(rejected, mode),
            other => panic!("expected InvalidModeForStatic, got {:?}", other.map(|l| l.len())),
        }
    }

    let backing = buffer.backing();
    let host_buffer = backing.as_any().downcast_ref::<HostBuffer>().unwrap();
    {
        let mut lock = buffer.lock(&mut frames, 64, 4, LockMode::Normal).unwrap();
        assert!(lock.is_direct());
        assert_eq!(host_buffer.map_count(), 1);
        lock.write(0, &[1, 2, 3, 4]).unwrap();
    }
    assert_eq!(host_buffer.map_count(), 0);
    assert_eq!(host_buffer.read(64, 4), vec![1, 2, 3, 4]);
    assert_eq!(frames.pending_persist_count(), 0);
}

#[test]
fn normal_lock_after_a_write_this_frame_is_rejected() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    drop(buffer.lock(&mut frames, 0, 0, LockMode::Discard).unwrap());
    match buffer.lock(&mut frames, 0, 16, LockMode::Normal) {
        Err(LockError::BlockingLockAfterWrite { frame }) => assert_eq!(frame, 1),
        other => panic!("expected BlockingLockAfterWrite, got {:?}", other.map(|l| l.len())),
    }

    frames.submit(false).unwrap();
    let lock = buffer.lock(&mut frames, 0, 16, LockMode::Normal).unwrap();
    assert!(lock.is_direct());
}

#[test]
fn lock_ranges_are_validated() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    assert!(matches!(
        buffer.lock(&mut frames, 16, 16, LockMode::Discard),
        Err(LockError::DiscardOffset(16))
    ));
    assert!(matches!(
        buffer.lock(&mut frames, 200, 100, LockMode::Normal),
        Err(LockError::OutOfBounds {
            offset: 200,
            size: 100,
            buffer_size: 256
        })
    ));

    // Zero size runs to the end of the buffer.
    let lock = buffer.lock(&mut frames, 64, 0, LockMode::Normal).unwrap();
    assert_eq!(lock.len(), 192);
}

#[test]
fn eager_discard_allocates_from_the_ring() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let desc = StreamingBufferDesc::new("eager", 256, BufferUsage::VERTEX)
        .dynamic(true)
        .defer_discard(false);
    let buffer = StreamingBuffer::new(host.as_ref(), &desc).unwrap();

    drop(buffer.lock(&mut frames, 0, 256, LockMode::Discard).unwrap());
    assert_eq!(buffer.residency(), Residency::RingBacked);
    assert_eq!(frames.ring().used_bytes(), 256);
    assert_eq!(frames.pending_persist_count(), 1);
}

#[test]
fn first_no_overwrite_of_a_frame_writes_in_place() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    {
        let mut lock = buffer.lock(&mut frames, 32, 8, LockMode::NoOverwrite).unwrap();
        assert!(lock.is_direct());
        lock.write(0, &[5u8; 8]).unwrap();
    }
    assert_eq!(frames.pending_persist_count(), 0);
    assert_eq!(buffer.residency(), Residency::Clean);

    let backing = buffer.backing();
    let host_buffer = backing.as_any().downcast_ref::<HostBuffer>().unwrap();
    assert_eq!(host_buffer.read(32, 8), vec![5u8; 8]);
}

#[test]
fn no_overwrite_past_a_resolved_discard_grows_the_allocation() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);

    buffer
        .lock(&mut frames, 0, 128, LockMode::Discard)
        .unwrap()
        .write(0, &[1u8; 128])
        .unwrap();
    buffer.gpu_address(&mut frames).unwrap();

    buffer
        .lock(&mut frames, 128, 128, LockMode::NoOverwrite)
        .unwrap()
        .write(0, &[2u8; 128])
        .unwrap();

    let address = buffer.gpu_address(&mut frames).unwrap();
    let contents = HostBuffer::read_address(&address, 256).unwrap();
    assert_eq!(&contents[..128], &[1u8; 128][..]);
    assert_eq!(&contents[128..], &[2u8; 128][..]);
}

#[test]
fn writes_persist_across_frames_in_deferred_mode() {
    let (host, mut frames) = setup(CompletionMode::Deferred);
    let buffer = dynamic_buffer(&host, 256);

    buffer
        .lock(&mut frames, 0, 256, LockMode::Discard)
        .unwrap()
        .write(0, &[3u8; 256])
        .unwrap();
    frames.submit(true).unwrap();

    // Nothing has executed yet; the copy is still queued.
    assert_eq!(host.stats().copied_bytes, 0);
    host.retire_all();
    assert_eq!(host.stats().copied_bytes, 256);

    let backing = buffer.backing();
    let host_buffer = backing.as_any().downcast_ref::<HostBuffer>().unwrap();
    assert_eq!(host_buffer.read(0, 256), vec![3u8; 256]);
}

#[test]
fn persist_copies_every_written_range() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 512);
    buffer
        .lock(&mut frames, 0, 0, LockMode::Normal)
        .unwrap()
        .write(0, &[1u8; 512])
        .unwrap();

    buffer
        .lock(&mut frames, 0, 128, LockMode::Discard)
        .unwrap()
        .write(0, &[2u8; 128])
        .unwrap();
    buffer
        .lock(&mut frames, 384, 128, LockMode::NoOverwrite)
        .unwrap()
        .write(0, &[3u8; 128])
        .unwrap();
    assert_eq!(buffer.written_ranges(), vec![(0, 128), (384, 128)]);

    frames.submit(false).unwrap();
    assert_eq!(frames.stats().persisted_bytes, 256);

    // The gap between the ranges keeps its older contents.
    let backing = buffer.backing();
    let host_buffer = backing.as_any().downcast_ref::<HostBuffer>().unwrap();
    assert_eq!(host_buffer.read(0, 128), vec![2u8; 128]);
    assert_eq!(host_buffer.read(128, 256), vec![1u8; 256]);
    assert_eq!(host_buffer.read(384, 128), vec![3u8; 128]);
}

#[test]
fn discarded_writes_survive_a_full_ring() {
    let (host, mut frames) = setup_with_ring(CompletionMode::Deferred, 1024);
    let buffer = dynamic_buffer(&host, 512);
    frames.stage_upload(&[0u8; 768], 256).unwrap();

    buffer
        .lock(&mut frames, 0, 0, LockMode::Discard)
        .unwrap()
        .write(0, &[7u8; 512])
        .unwrap();

    // Retrying keeps failing the same way without losing the data.
    for _ in 0..2 {
        assert!(matches!(
            buffer.gpu_address(&mut frames),
            Err(LockError::Ring(RingError::OutOfSpace { requested: 512, .. }))
        ));
        assert_eq!(buffer.residency(), Residency::SpeculativeDiscard);
    }
    assert!(matches!(
        buffer.lock(&mut frames, 0, 0, LockMode::NoOverwrite),
        Err(LockError::Ring(RingError::OutOfSpace { .. }))
    ));
    assert_eq!(buffer.residency(), Residency::SpeculativeDiscard);

    frames.submit(true).unwrap();
    assert_eq!(buffer.residency(), Residency::Clean);
    assert_eq!(frames.pending_persist_count(), 0);
    assert_eq!(frames.stats().persisted_bytes, 512);

    let backing = buffer.backing();
    let host_buffer = backing.as_any().downcast_ref::<HostBuffer>().unwrap();
    assert_eq!(host_buffer.read(0, 512), vec![7u8; 512]);

    let address = buffer.gpu_address(&mut frames).unwrap();
    assert_eq!(address.buffer_id(), buffer.id());
}

#[test]
fn failed_eager_discard_leaves_the_buffer_untouched() {
    let (host, mut frames) = setup_with_ring(CompletionMode::Immediate, 1024);
    let desc = StreamingBufferDesc::new("eager", 512, BufferUsage::VERTEX)
        .dynamic(true)
        .defer_discard(false);
    let buffer = StreamingBuffer::new(host.as_ref(), &desc).unwrap();
    frames.stage_upload(&[0u8; 768], 256).unwrap();

    assert!(matches!(
        buffer.lock(&mut frames, 0, 0, LockMode::Discard),
        Err(LockError::Ring(RingError::OutOfSpace { .. }))
    ));
    assert_eq!(buffer.residency(), Residency::Clean);
    assert!(buffer.written_ranges().is_empty());
    assert_eq!(frames.pending_persist_count(), 0);

    // Nothing was written this frame, so a blocking lock is still fine.
    assert!(buffer.lock(&mut frames, 0, 0, LockMode::Normal).is_ok());
}

#[test]
fn writes_outside_the_lock_are_rejected() {
    let (host, mut frames) = setup(CompletionMode::Immediate);
    let buffer = dynamic_buffer(&host, 256);
    let mut lock = buffer.lock(&mut frames, 0, 64, LockMode::Discard).unwrap();

    assert!(matches!(
        lock.write(60, &[0u8; 8]),
        Err(LockError::OutOfBounds {
            offset: 60,
            size: 8,
            buffer_size: 64
        })
    ));
    assert!(matches!(lock.write(usize::MAX, &[0u8; 1]), Err(LockError::OutOfBounds { .. })));
    lock.write(56, &[9u8; 8]).unwrap();
    assert_eq!(&lock[56..], &[9u8; 8][..]);
}
