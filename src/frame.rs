// Frame scheduler
//
// Owns the record/submit cycle and is the only authority on "what frame is
// it". Frame numbers and fence values are the same sequence: the frame being
// recorded is `next_fence`, and submitting it signals exactly that value.
//
// Responsibilities:
// - persist dirty dynamic buffers into their backing resources at submit
// - rotate back buffers and bound CPU lead by the number of slots
// - keep resources alive until the GPU has finished the frame that used them
// - tell the frame ring which frames it may reclaim

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    CommandList, GpuAddress, GpuDevice, GpuQueue, GpuTexture, PresentDesc, Presenter, TextureFormat,
    TextureState,
};
use crate::error::FrameError;
use crate::ring::{RingAllocation, RingAllocator, DEFAULT_MIN_ALIGNMENT};
use crate::streaming::{Persisted, StreamingBuffer};

#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub back_buffer_count: usize,
    pub ring_buffer_size: u32,
    pub min_alignment: u32,
    pub fence_timeout: Duration,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            back_buffer_count: 2,
            ring_buffer_size: 40 * 1024 * 1024,
            min_alignment: DEFAULT_MIN_ALIGNMENT,
            fence_timeout: Duration::from_secs(60),
            width: 1280,
            height: 720,
            format: TextureFormat::Bgra8Unorm,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub blocking_waits: u64,
    pub persisted_buffers: u64,
    pub persisted_bytes: u64,
    /// Ring occupancy sampled at the last submit.
    pub ring_used_bytes: u32,
}

/// A resource kept alive until `frame` completes on the GPU.
struct Retained {
    frame: u64,
    _resource: Box<dyn Any + Send>,
}

pub struct FrameScheduler {
    device: Arc<dyn GpuDevice>,
    queue: Box<dyn GpuQueue>,
    commands: Box<dyn CommandList>,
    presenter: Box<dyn Presenter>,
    ring: RingAllocator,

    next_fence: u64,
    fence_values: Vec<u64>,
    current_back_buffer: usize,
    keep_alive: Vec<Vec<Retained>>,
    pending_persist: Vec<StreamingBuffer>,

    fence_timeout: Duration,
    epoch: u64,
    stats: FrameStats,
}

impl FrameScheduler {
    pub fn new(device: Arc<dyn GpuDevice>, config: &FrameConfig) -> Result<Self, FrameError> {
        let slots = config.back_buffer_count.max(1);

        // ─── GPU objects ───
        let queue = device.create_queue()?;
        let mut commands = device.create_command_list(slots)?;
        let presenter = device.create_presenter(&PresentDesc {
            width: config.width,
            height: config.height,
            back_buffer_count: slots,
            format: config.format,
        })?;
        let mut ring = RingAllocator::new(device.as_ref(), config.ring_buffer_size, config.min_alignment)?;

        // ─── First frame ───
        let current_back_buffer = presenter.current_index();
        commands.reset(current_back_buffer)?;
        commands.transition(&presenter.back_buffer(current_back_buffer), TextureState::RenderTarget);
        ring.set_current_frame(1);

        log::info!(
            "Frame scheduler ready on {}: {} back buffers, {}x{}",
            device.name(),
            slots,
            config.width,
            config.height
        );

        Ok(Self {
            device,
            queue,
            commands,
            presenter,
            ring,
            next_fence: 1,
            fence_values: vec![0; slots],
            current_back_buffer,
            keep_alive: (0..slots).map(|_| Vec::new()).collect(),
            pending_persist: Vec::new(),
            fence_timeout: config.fence_timeout,
            epoch: 0,
            stats: FrameStats::default(),
        })
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    /// Close and execute the frame being recorded, optionally presenting it,
    /// then block until the next back-buffer slot is free and reopen.
    pub fn submit(&mut self, should_present: bool) -> Result<(), FrameError> {
        if !self.commands.is_open() {
            return Err(FrameError::CommandListClosed);
        }

        // ─── Persist dynamic buffers ───
        let pending = std::mem::take(&mut self.pending_persist);
        let mut write_back = Vec::new();
        for (index, buffer) in pending.iter().enumerate() {
            match buffer.persist_dynamic_changes(self) {
                Ok(Persisted::Copied(bytes)) => {
                    self.stats.persisted_buffers += 1;
                    self.stats.persisted_bytes += bytes;
                }
                Ok(Persisted::HostWriteBack) => write_back.push(buffer.clone()),
                Err(error) => {
                    // The frame stays open; whatever was not persisted is retried.
                    self.pending_persist.extend(write_back);
                    self.pending_persist.extend(pending[index..].iter().cloned());
                    return Err(error.into());
                }
            }
        }

        if should_present {
            let back_buffer = self.back_buffer();
            self.commands.transition(&back_buffer, TextureState::Present);
        }

        // ─── Execute ───
        self.commands.close()?;
        self.queue.execute(self.commands.as_mut())?;
        if should_present {
            self.presenter.present(self.queue.as_mut())?;
        }

        // ─── Fence ───
        let value = self.next_fence;
        self.next_fence += 1;
        self.fence_values[self.current_back_buffer] = value;
        self.queue.signal(value)?;
        if !write_back.is_empty() {
            self.write_back_after(value, &write_back)?;
        }

        self.epoch += 1;
        self.stats.frames_submitted += 1;
        self.stats.ring_used_bytes = self.ring.used_bytes();
        log::trace!(
            "Submitted frame {} (slot {}, {} buffers persisted)",
            value,
            self.current_back_buffer,
            pending.len()
        );

        // ─── Next slot ───
        self.current_back_buffer = self.presenter.current_index();
        self.wait_for_frame(self.fence_values[self.current_back_buffer])?;

        self.commands.reset(self.current_back_buffer)?;
        if should_present {
            let back_buffer = self.back_buffer();
            self.commands.transition(&back_buffer, TextureState::RenderTarget);
        }
        Ok(())
    }

    /// Finish persisting buffers the ring had no room for: wait until frame
    /// `value` is done, then write their contents through a host mapping.
    fn write_back_after(&mut self, value: u64, buffers: &[StreamingBuffer]) -> Result<(), FrameError> {
        if self.queue.completed_value() < value {
            self.stats.blocking_waits += 1;
            if !self.queue.wait(value, self.fence_timeout)? {
                let completed = self.queue.completed_value();
                log::error!("GPU hang while writing back frame {} (completed {})", value, completed);
                return Err(FrameError::GpuTimeout {
                    value,
                    completed,
                    timeout: self.fence_timeout,
                });
            }
        }
        for buffer in buffers {
            let bytes = buffer.write_back_speculative()?;
            self.stats.persisted_buffers += 1;
            self.stats.persisted_bytes += bytes;
        }
        log::debug!("Wrote back {} buffers after frame {}", buffers.len(), value);
        Ok(())
    }

    /// Block until the GPU has finished `frame_number`, then release what it
    /// kept alive and hand its ring space back.
    pub fn wait_for_frame(&mut self, frame_number: u64) -> Result<(), FrameError> {
        if self.queue.completed_value() < frame_number {
            if frame_number == self.next_fence && self.commands.is_open() {
                self.submit(false)?;
            }

            let completed = self.queue.completed_value();
            if completed < frame_number {
                self.stats.blocking_waits += 1;
                log::debug!("Waiting for frame {} (GPU at {})", frame_number, completed);
                if !self.queue.wait(frame_number, self.fence_timeout)? {
                    let completed = self.queue.completed_value();
                    log::error!(
                        "GPU hang: frame {} not done after {:?} (completed {})",
                        frame_number,
                        self.fence_timeout,
                        completed
                    );
                    return Err(FrameError::GpuTimeout {
                        value: frame_number,
                        completed,
                        timeout: self.fence_timeout,
                    });
                }
            }
        }

        let mut released = 0;
        for list in &mut self.keep_alive {
            let before = list.len();
            list.retain(|r| r.frame > frame_number);
            released += before - list.len();
        }
        if released > 0 {
            log::trace!("Released {} resources kept for frames <= {}", released, frame_number);
        }

        self.ring.has_completed_frame(frame_number);
        self.ring.set_current_frame(self.current_frame());
        Ok(())
    }

    /// Drain the GPU, resize the back buffers and start a fresh command list.
    pub fn reset(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        log::info!("Resetting frame scheduler to {}x{}", width, height);

        if self.commands.is_open() {
            self.submit(false)?;
        }
        self.wait_for_frame(self.next_fence - 1)?;
        self.commands.close()?;

        self.presenter.resize(width, height)?;
        self.current_back_buffer = self.presenter.current_index();

        self.commands.reset(self.current_back_buffer)?;
        let back_buffer = self.back_buffer();
        self.commands.transition(&back_buffer, TextureState::RenderTarget);
        self.epoch += 1;
        Ok(())
    }

    // =========================================================================
    // RESOURCE TRACKING
    // =========================================================================

    /// Frame currently being recorded.
    pub fn current_frame(&self) -> u64 {
        self.next_fence
    }

    /// Last frame the GPU reported complete.
    pub fn completed_frame(&self) -> u64 {
        self.queue.completed_value()
    }

    /// Queue `buffer` for persistence at the next submit. Idempotent per frame.
    pub fn mark_buffer_for_persist(&mut self, buffer: &StreamingBuffer) {
        if !self.pending_persist.iter().any(|b| b.ptr_eq(buffer)) {
            self.pending_persist.push(buffer.clone());
        }
    }

    pub fn pending_persist_count(&self) -> usize {
        self.pending_persist.len()
    }

    /// Keep `resource` alive until the frame being recorded completes.
    pub fn mark_resource_as_used(&mut self, resource: Box<dyn Any + Send>) {
        let frame = self.current_frame();
        self.keep_alive[self.current_back_buffer].push(Retained {
            frame,
            _resource: resource,
        });
    }

    pub fn kept_alive_count(&self) -> usize {
        self.keep_alive.iter().map(Vec::len).sum()
    }

    /// Copy `data` into a fresh ring allocation for this frame.
    pub fn stage_upload(&mut self, data: &[u8], alignment: u32) -> Result<(RingAllocation, GpuAddress), FrameError> {
        let size = u32::try_from(data.len()).map_err(|_| crate::error::RingError::OutOfSpace {
            requested: u32::MAX,
            head: self.ring.head(),
            tail: self.ring.tail(),
            capacity: self.ring.capacity(),
        })?;
        let alloc = self.ring.allocate_aligned(size, alignment)?;
        self.ring.cpu_slice_mut(&alloc)?.copy_from_slice(data);
        let address = self.ring.gpu_address(&alloc)?;
        Ok((alloc, address))
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Increments on every submit and reset; a change means a new command list.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> FrameStats {
        self.stats.clone()
    }

    pub fn command_list(&mut self) -> &mut dyn CommandList {
        self.commands.as_mut()
    }

    pub fn ring(&self) -> &RingAllocator {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut RingAllocator {
        &mut self.ring
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn current_back_buffer(&self) -> usize {
        self.current_back_buffer
    }

    pub fn back_buffer_count(&self) -> usize {
        self.fence_values.len()
    }

    pub fn back_buffer(&self) -> Arc<dyn GpuTexture> {
        self.presenter.back_buffer(self.current_back_buffer)
    }

    pub fn extent(&self) -> (u32, u32) {
        self.presenter.extent()
    }

    pub fn fence_value(&self, slot: usize) -> u64 {
        self.fence_values.get(slot).copied().unwrap_or(0)
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        let last = self.next_fence - 1;
        if self.queue.completed_value() < last {
            match self.queue.wait(last, self.fence_timeout) {
                Ok(true) => {}
                Ok(false) => log::error!("GPU did not finish frame {} before shutdown", last),
                Err(e) => log::error!("Failed to drain frame {}: {}", last, e),
            }
        }
        self.keep_alive.clear();
        self.pending_persist.clear();
        log::info!("Frame scheduler drained after {} frames", self.stats.frames_submitted);
    }
}
