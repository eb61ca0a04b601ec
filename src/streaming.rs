// Streaming buffers
//
// A StreamingBuffer is a linear GPU buffer with legacy lock semantics.
//
// Static buffers are one persistent resource, locked by mapping it.
//
// Dynamic buffers additionally stage per-frame writes in the frame ring:
// - Discard hands out a host-only scratch copy (the speculative cache) and
//   defers the ring allocation until the data is actually needed
// - NoOverwrite appends into the frame's ring allocation
// - at submission the scheduler copies every written range from the ring into
//   the persistent backing resource, so later frames can read it cold
//
// The handle is cheap to clone; the scheduler holds clones in its
// pending-persistence set and keep-alive lists.

use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::backend::{BufferDesc, BufferUsage, GpuAddress, GpuBuffer, GpuDevice, ResourceId};
use crate::error::{DeviceError, LockError, RingError};
use crate::frame::FrameScheduler;
use crate::range_set::RangeSet;
use crate::ring::RingAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Blocking read/write of the persistent contents.
    Normal,
    /// The previous contents are thrown away; writes start from scratch.
    Discard,
    /// The caller promises not to touch bytes the GPU may still read.
    NoOverwrite,
}

#[derive(Debug, Clone)]
pub struct StreamingBufferDesc {
    pub label: String,
    pub size: u32,
    pub usage: BufferUsage,
    pub dynamic: bool,
    /// Stage Discard locks in host memory until the GPU address is needed.
    pub defer_discard: bool,
}

impl StreamingBufferDesc {
    pub fn new(label: impl Into<String>, size: u32, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            dynamic: false,
            defer_discard: true,
        }
    }

    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn defer_discard(mut self, defer: bool) -> Self {
        self.defer_discard = defer;
        self
    }
}

/// Where a dynamic buffer's current contents live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Nothing written this frame; the backing resource is authoritative.
    Clean,
    /// A Discard lock wrote into the host-only cache.
    SpeculativeDiscard,
    /// This frame's contents are in a ring allocation.
    RingBacked,
}

#[derive(Debug)]
struct SpeculativeWrite {
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct DynamicState {
    defer_discard: bool,
    speculative: Option<SpeculativeWrite>,
    ring_allocation: Option<RingAllocation>,
    last_lock_frame: u64,
    written: RangeSet,
}

#[derive(Debug)]
enum Variant {
    Static,
    Dynamic(DynamicState),
}

#[derive(Debug)]
struct BufferState {
    backing: Arc<dyn GpuBuffer>,
    size: u32,
    variant: Variant,
}

#[derive(Debug, Clone)]
pub struct StreamingBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl StreamingBuffer {
    pub fn new(device: &dyn GpuDevice, desc: &StreamingBufferDesc) -> Result<Self, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidParameters(format!(
                "streaming buffer '{}' has zero size",
                desc.label
            )));
        }

        let backing = device.create_buffer(&BufferDesc {
            label: desc.label.clone(),
            size: desc.size as u64,
            usage: desc.usage | BufferUsage::COPY_DST,
        })?;

        let variant = if desc.dynamic {
            Variant::Dynamic(DynamicState {
                defer_discard: desc.defer_discard,
                ..Default::default()
            })
        } else {
            Variant::Static
        };

        log::debug!(
            "Created {} buffer '{}' ({} bytes)",
            if desc.dynamic { "dynamic" } else { "static" },
            desc.label,
            desc.size
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(BufferState {
                backing,
                size: desc.size,
                variant,
            })),
        })
    }

    pub fn size(&self) -> u32 {
        self.inner.lock().size
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.inner.lock().variant, Variant::Dynamic(_))
    }

    pub fn id(&self) -> ResourceId {
        self.inner.lock().backing.id()
    }

    /// The persistent backing resource.
    pub fn backing(&self) -> Arc<dyn GpuBuffer> {
        self.inner.lock().backing.clone()
    }

    pub fn ptr_eq(&self, other: &StreamingBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn residency(&self) -> Residency {
        match &self.inner.lock().variant {
            Variant::Static => Residency::Clean,
            Variant::Dynamic(d) if d.speculative.is_some() => Residency::SpeculativeDiscard,
            Variant::Dynamic(d) if d.ring_allocation.is_some() => Residency::RingBacked,
            Variant::Dynamic(_) => Residency::Clean,
        }
    }

    /// Ranges written since the last persist, as `(offset, size)`.
    pub fn written_ranges(&self) -> Vec<(u32, u32)> {
        match &self.inner.lock().variant {
            Variant::Static => Vec::new(),
            Variant::Dynamic(d) => d.written.iter().map(|r| (r.offset, r.size)).collect(),
        }
    }

    // =========================================================================
    // LOCK
    // =========================================================================

    /// Lock `[offset, offset + size)` for writing. A size of 0 means "to the
    /// end of the buffer". Dropping the returned guard unlocks.
    pub fn lock<'a>(
        &'a self,
        frames: &'a mut FrameScheduler,
        offset: u32,
        size: u32,
        mode: LockMode,
    ) -> Result<BufferLock<'a>, LockError> {
        let mut state = self.inner.lock();
        let size = checked_range(state.size, offset, size)?;
        let current = frames.current_frame();
        let buffer_size = state.size;
        let backing = state.backing.clone();

        let Variant::Dynamic(dynamic) = &mut state.variant else {
            if mode != LockMode::Normal {
                return Err(LockError::InvalidModeForStatic(mode));
            }
            return map_backing(backing, offset, size);
        };

        match mode {
            LockMode::Normal => {
                if dynamic.last_lock_frame >= current {
                    return Err(LockError::BlockingLockAfterWrite {
                        frame: dynamic.last_lock_frame,
                    });
                }
                drop(state);
                map_backing(backing, offset, size)
            }

            LockMode::Discard => {
                if offset != 0 {
                    return Err(LockError::DiscardOffset(offset));
                }
                // A failed allocation leaves the buffer as it was.
                let alloc = if dynamic.defer_discard {
                    None
                } else {
                    Some(frames.ring_mut().allocate(size)?)
                };
                dynamic.speculative = None;
                dynamic.ring_allocation = alloc;
                dynamic.written.reset_to(0, size);
                dynamic.last_lock_frame = current;

                let Some(alloc) = alloc else {
                    dynamic.speculative = Some(SpeculativeWrite {
                        data: vec![0u8; size as usize],
                    });
                    frames.mark_buffer_for_persist(self);
                    return Ok(BufferLock {
                        view: LockView::Speculative(state),
                    });
                };

                drop(state);
                frames.mark_buffer_for_persist(self);
                let bytes = frames.ring_mut().cpu_slice_mut(&alloc)?;
                Ok(BufferLock {
                    view: LockView::Ring(bytes),
                })
            }

            LockMode::NoOverwrite => {
                if dynamic.last_lock_frame < current {
                    drop(state);
                    return map_backing(backing, offset, size);
                }

                if let Some(cache) = &dynamic.speculative {
                    let alloc = frames.ring_mut().allocate(buffer_size)?;
                    let ring = frames.ring_mut().cpu_slice_mut(&alloc)?;
                    ring[..cache.data.len()].copy_from_slice(&cache.data);
                    dynamic.speculative = None;
                    dynamic.ring_allocation = Some(alloc);
                    log::trace!("Promoted speculative discard into ring at {}", alloc.offset);
                }

                let mut alloc = dynamic
                    .ring_allocation
                    .ok_or(LockError::MissingRingAllocation { frame: current })?;
                if offset + size > alloc.size {
                    // An earlier GPU-address resolve sized the allocation to
                    // the discarded range only.
                    let previous = frames.ring_mut().cpu_slice_mut(&alloc)?.to_vec();
                    alloc = frames.ring_mut().allocate(buffer_size)?;
                    frames.ring_mut().cpu_slice_mut(&alloc)?[..previous.len()].copy_from_slice(&previous);
                    dynamic.ring_allocation = Some(alloc);
                }

                dynamic.written.insert(offset, size);
                dynamic.last_lock_frame = current;
                drop(state);
                frames.mark_buffer_for_persist(self);

                let ring = frames.ring_mut().cpu_slice_mut(&alloc)?;
                Ok(BufferLock {
                    view: LockView::Ring(&mut ring[offset as usize..(offset + size) as usize]),
                })
            }
        }
    }

    // =========================================================================
    // GPU ADDRESS & PERSISTENCE
    // =========================================================================

    /// Address the GPU should read this frame's contents from.
    pub fn gpu_address(&self, frames: &mut FrameScheduler) -> Result<GpuAddress, LockError> {
        let mut state = self.inner.lock();
        let backing = state.backing.clone();
        let current = frames.current_frame();
        match &mut state.variant {
            Variant::Static => Ok(GpuAddress::new(backing, 0)),
            Variant::Dynamic(d) => Self::resolve_dynamic(d, backing, frames, current),
        }
    }

    fn resolve_dynamic(
        dynamic: &mut DynamicState,
        backing: Arc<dyn GpuBuffer>,
        frames: &mut FrameScheduler,
        current: u64,
    ) -> Result<GpuAddress, LockError> {
        if let Some(cache) = &dynamic.speculative {
            // The cache stays authoritative until the ring copy exists.
            let alloc = frames.ring_mut().allocate(cache.data.len() as u32)?;
            frames.ring_mut().cpu_slice_mut(&alloc)?.copy_from_slice(&cache.data);
            dynamic.speculative = None;
            dynamic.ring_allocation = Some(alloc);
            return Ok(frames.ring().gpu_address(&alloc)?);
        }

        if dynamic.last_lock_frame < current {
            return Ok(GpuAddress::new(backing, 0));
        }

        let alloc = dynamic
            .ring_allocation
            .ok_or(LockError::MissingRingAllocation { frame: current })?;
        Ok(frames.ring().gpu_address(&alloc)?)
    }

    /// Record copies of this frame's ring-staged writes into the backing
    /// resource.
    ///
    /// A speculative discard that cannot get ring space is left in place and
    /// reported as [`Persisted::HostWriteBack`]; the scheduler finishes it
    /// with [`write_back_speculative`](Self::write_back_speculative) once the
    /// frame's fence has passed.
    pub(crate) fn persist_dynamic_changes(&self, frames: &mut FrameScheduler) -> Result<Persisted, LockError> {
        let mut state = self.inner.lock();
        let backing = state.backing.clone();
        let current = frames.current_frame();
        let Variant::Dynamic(dynamic) = &mut state.variant else {
            return Ok(Persisted::Copied(0));
        };
        if dynamic.last_lock_frame < current {
            dynamic.written.clear();
            dynamic.ring_allocation = None;
            return Ok(Persisted::Copied(0));
        }

        let source = match Self::resolve_dynamic(dynamic, backing.clone(), frames, current) {
            Ok(source) => source,
            Err(LockError::Ring(RingError::OutOfSpace { requested, .. })) if dynamic.speculative.is_some() => {
                log::warn!(
                    "No ring space to persist {} discarded bytes of {:?}; writing back after the frame",
                    requested,
                    backing.label()
                );
                return Ok(Persisted::HostWriteBack);
            }
            Err(error) => return Err(error),
        };
        let alloc_size = dynamic.ring_allocation.map(|a| a.size).unwrap_or(0) as u64;

        let mut copied = 0;
        for range in dynamic.written.iter() {
            let size = (range.end().min(alloc_size)).saturating_sub(range.offset as u64);
            if size == 0 {
                continue;
            }
            let src = GpuAddress::new(source.buffer.clone(), source.offset + range.offset as u64);
            let dst = GpuAddress::new(backing.clone(), range.offset as u64);
            frames.command_list().copy_buffer(&src, &dst, size);
            copied += size;
        }

        dynamic.written.clear();
        dynamic.ring_allocation = None;
        dynamic.speculative = None;
        drop(state);

        frames.mark_resource_as_used(Box::new(backing));
        Ok(Persisted::Copied(copied))
    }

    /// Write a still-speculative discard straight into the mapped backing
    /// resource. The GPU must be done with every frame that read it.
    pub(crate) fn write_back_speculative(&self) -> Result<u64, LockError> {
        let mut state = self.inner.lock();
        let backing = state.backing.clone();
        let Variant::Dynamic(dynamic) = &mut state.variant else {
            return Ok(0);
        };
        if dynamic.speculative.is_none() {
            return Ok(0);
        }
        let memory = backing.map()?;
        let Some(cache) = dynamic.speculative.take() else {
            backing.unmap();
            return Ok(0);
        };

        let mut written = 0;
        for range in dynamic.written.iter() {
            let start = range.offset as usize;
            let end = (range.end() as usize).min(cache.data.len());
            if end <= start {
                continue;
            }
            // SAFETY: the range lies inside the buffer and no GPU work that
            // touches the backing is pending.
            if let Some(bytes) = unsafe { memory.slice_mut(start, end - start) } {
                bytes.copy_from_slice(&cache.data[start..end]);
                written += (end - start) as u64;
            }
        }
        backing.unmap();

        dynamic.written.clear();
        dynamic.ring_allocation = None;
        Ok(written)
    }
}

/// Result of persisting one buffer at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persisted {
    /// Copies of this many bytes were recorded into the command list.
    Copied(u64),
    /// The ring was full; the speculative contents still need a host write.
    HostWriteBack,
}

fn checked_range(buffer_size: u32, offset: u32, size: u32) -> Result<u32, LockError> {
    let size = if size == 0 { buffer_size.saturating_sub(offset) } else { size };
    if offset as u64 + size as u64 > buffer_size as u64 || size == 0 {
        return Err(LockError::OutOfBounds {
            offset,
            size,
            buffer_size,
        });
    }
    Ok(size)
}

fn map_backing<'a>(backing: Arc<dyn GpuBuffer>, offset: u32, size: u32) -> Result<BufferLock<'a>, LockError> {
    let memory = backing.map()?;
    // SAFETY: the guard keeps the buffer mapped (and alive) until it drops,
    // and the range was checked against the buffer size.
    let bytes = unsafe { memory.slice_mut(offset as usize, size as usize) };
    let Some(bytes) = bytes else {
        backing.unmap();
        return Err(LockError::OutOfBounds {
            offset,
            size,
            buffer_size: memory.len() as u32,
        });
    };
    Ok(BufferLock {
        view: LockView::Mapped { buffer: backing, bytes },
    })
}

// =============================================================================
// LOCK GUARD
// =============================================================================

enum LockView<'a> {
    Mapped {
        buffer: Arc<dyn GpuBuffer>,
        bytes: &'a mut [u8],
    },
    Ring(&'a mut [u8]),
    Speculative(MutexGuard<'a, BufferState>),
}

/// Writable view of a locked buffer range. Dropping it unlocks.
pub struct BufferLock<'a> {
    view: LockView<'a>,
}

impl BufferLock<'_> {
    /// Copy `data` into the locked range starting at `offset`, which is
    /// relative to the start of the lock.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), LockError> {
        let bytes = self.deref_mut();
        let locked = bytes.len();
        let Some(target) = offset
            .checked_add(data.len())
            .and_then(|end| bytes.get_mut(offset..end))
        else {
            return Err(LockError::OutOfBounds {
                offset: u32::try_from(offset).unwrap_or(u32::MAX),
                size: u32::try_from(data.len()).unwrap_or(u32::MAX),
                buffer_size: locked as u32,
            });
        };
        target.copy_from_slice(data);
        Ok(())
    }

    /// Whether the lock maps the persistent resource directly.
    pub fn is_direct(&self) -> bool {
        matches!(self.view, LockView::Mapped { .. })
    }
}

impl Deref for BufferLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.view {
            LockView::Mapped { bytes, .. } => &**bytes,
            LockView::Ring(bytes) => &**bytes,
            LockView::Speculative(state) => match &state.variant {
                Variant::Dynamic(DynamicState {
                    speculative: Some(cache),
                    ..
                }) => cache.data.as_slice(),
                _ => &[],
            },
        }
    }
}

impl DerefMut for BufferLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.view {
            LockView::Mapped { bytes, .. } => &mut **bytes,
            LockView::Ring(bytes) => &mut **bytes,
            LockView::Speculative(state) => match &mut state.variant {
                Variant::Dynamic(DynamicState {
                    speculative: Some(cache),
                    ..
                }) => cache.data.as_mut_slice(),
                _ => &mut [],
            },
        }
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        if let LockView::Mapped { buffer, .. } = &self.view {
            buffer.unmap();
        }
    }
}
