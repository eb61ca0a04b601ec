// Frame-tagged ring allocator
//
// One persistently mapped upload buffer carved into per-frame bump
// allocations. Space is handed back only when the frame scheduler reports
// that the GPU finished a frame; the allocator itself never guesses.
//
//   wrapped:    [==tail)........[head=========)
//   unwrapped:  ......[head=============tail)...
//
// The live region is always [head, tail) modulo wraparound. In the wrapped
// regime an allocation must leave at least one byte before `head`, so
// `head == tail` unambiguously means "nothing live".

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::{BufferDesc, BufferUsage, GpuAddress, GpuBuffer, GpuDevice, MappedMemory};
use crate::error::{DeviceError, RingError};

/// Default floor for allocation alignment (constant-buffer placement).
pub const DEFAULT_MIN_ALIGNMENT: u32 = 256;

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u32, alignment: u32) -> u64 {
    let mask = alignment as u64 - 1;
    (value as u64 + mask) & !mask
}

/// A slice of ring memory valid only during `frame_tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    pub frame_tag: u64,
    pub offset: u32,
    pub size: u32,
}

pub struct RingAllocator {
    buffer: Arc<dyn GpuBuffer>,
    memory: MappedMemory,
    max_size: u32,
    min_alignment: u32,
    head: u32,
    tail: u32,
    /// (frame, tail when the frame started), oldest first
    frame_marks: VecDeque<(u64, u32)>,
    current_frame: u64,
}

impl RingAllocator {
    /// Create the backing upload buffer and map it for the allocator's lifetime.
    pub fn new(device: &dyn GpuDevice, size: u32, min_alignment: u32) -> Result<Self, DeviceError> {
        if !min_alignment.is_power_of_two() {
            return Err(DeviceError::InvalidParameters(format!(
                "ring alignment {} is not a power of two",
                min_alignment
            )));
        }
        let max_size = align_up(size, min_alignment);
        if max_size == 0 || max_size > u32::MAX as u64 {
            return Err(DeviceError::InvalidParameters(format!(
                "ring size {} is out of range",
                size
            )));
        }

        let buffer = device.create_buffer(&BufferDesc {
            label: "frame ring".to_string(),
            size: max_size,
            usage: BufferUsage::VERTEX
                | BufferUsage::INDEX
                | BufferUsage::CONSTANT
                | BufferUsage::COPY_SRC,
        })?;
        let memory = buffer.map()?;

        log::info!("Created frame ring: {} KiB, {}-byte alignment", max_size / 1024, min_alignment);

        Ok(Self {
            buffer,
            memory,
            max_size: max_size as u32,
            min_alignment,
            head: 0,
            tail: 0,
            frame_marks: VecDeque::new(),
            current_frame: 0,
        })
    }

    /// Allocate with the default alignment.
    pub fn allocate(&mut self, num_bytes: u32) -> Result<RingAllocation, RingError> {
        self.allocate_aligned(num_bytes, self.min_alignment)
    }

    pub fn allocate_aligned(&mut self, num_bytes: u32, alignment: u32) -> Result<RingAllocation, RingError> {
        if !alignment.is_power_of_two() {
            return Err(RingError::InvalidAlignment(alignment));
        }
        let alignment = alignment.max(self.min_alignment);
        let size = num_bytes as u64;

        let offset = if self.tail >= self.head {
            let aligned_tail = align_up(self.tail, alignment);
            if aligned_tail + size <= self.max_size as u64 {
                aligned_tail
            } else if (self.head as u64) > size {
                // Wrap to the start; the gap before `head` is free.
                0
            } else {
                return Err(self.out_of_space(num_bytes));
            }
        } else {
            let aligned_tail = align_up(self.tail, alignment);
            if aligned_tail + size < self.head as u64 {
                aligned_tail
            } else {
                return Err(self.out_of_space(num_bytes));
            }
        };

        self.tail = (offset + size) as u32;
        Ok(RingAllocation {
            frame_tag: self.current_frame,
            offset: offset as u32,
            size: num_bytes,
        })
    }

    fn out_of_space(&self, requested: u32) -> RingError {
        log::warn!(
            "Frame ring exhausted: {} bytes requested, head {} tail {} of {}",
            requested,
            self.head,
            self.tail,
            self.max_size
        );
        RingError::OutOfSpace {
            requested,
            head: self.head,
            tail: self.tail,
            capacity: self.max_size,
        }
    }

    fn check_frame(&self, alloc: &RingAllocation) -> Result<(), RingError> {
        if alloc.frame_tag != self.current_frame {
            return Err(RingError::StaleAllocation {
                allocation_frame: alloc.frame_tag,
                current_frame: self.current_frame,
            });
        }
        Ok(())
    }

    /// Host-writable bytes of `alloc`.
    pub fn cpu_slice_mut(&mut self, alloc: &RingAllocation) -> Result<&mut [u8], RingError> {
        self.check_frame(alloc)?;
        // SAFETY: live allocations never overlap and `&mut self` keeps this the
        // only CPU view handed out until it is dropped.
        unsafe { self.memory.slice_mut(alloc.offset as usize, alloc.size as usize) }.ok_or(
            RingError::OutOfSpace {
                requested: alloc.size,
                head: self.head,
                tail: self.tail,
                capacity: self.max_size,
            },
        )
    }

    /// Device address of `alloc`.
    pub fn gpu_address(&self, alloc: &RingAllocation) -> Result<GpuAddress, RingError> {
        self.check_frame(alloc)?;
        Ok(GpuAddress::new(self.buffer.clone(), alloc.offset as u64))
    }

    /// Start tagging allocations with `frame`. Ignored unless it moves forward.
    pub fn set_current_frame(&mut self, frame: u64) {
        if frame > self.current_frame {
            self.current_frame = frame;
            self.frame_marks.push_back((frame, self.tail));
        }
    }

    /// Reclaim everything allocated by frames up to and including `frame`.
    /// Only call once the fence proves the GPU is done with them.
    pub fn has_completed_frame(&mut self, frame: u64) {
        while let Some(&(marked, _)) = self.frame_marks.front() {
            if marked > frame {
                break;
            }
            self.frame_marks.pop_front();
        }

        match self.frame_marks.front() {
            Some(&(_, tail_at_start)) => self.head = tail_at_start,
            None => {
                self.head = 0;
                self.tail = 0;
            }
        }
    }

    pub fn buffer(&self) -> &Arc<dyn GpuBuffer> {
        &self.buffer
    }

    pub fn capacity(&self) -> u32 {
        self.max_size
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Bytes between head and tail, including alignment padding.
    pub fn used_bytes(&self) -> u32 {
        if self.tail >= self.head {
            self.tail - self.head
        } else {
            self.max_size - self.head + self.tail
        }
    }
}

impl Drop for RingAllocator {
    fn drop(&mut self) {
        self.buffer.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostDevice;

    fn ring(size: u32) -> RingAllocator {
        let device = HostDevice::new();
        RingAllocator::new(&device, size, DEFAULT_MIN_ALIGNMENT).unwrap()
    }

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(600, 256), 768);
    }

    #[test]
    fn allocations_are_aligned_and_tagged() {
        let mut ring = ring(4096);
        ring.set_current_frame(1);
        let a = ring.allocate(10).unwrap();
        let b = ring.allocate(10).unwrap();
        assert_eq!(a, RingAllocation { frame_tag: 1, offset: 0, size: 10 });
        assert_eq!(b.offset, 256);
        assert_eq!(ring.used_bytes(), 266);
    }

    #[test]
    fn alignment_is_raised_to_floor() {
        let mut ring = ring(4096);
        ring.set_current_frame(1);
        ring.allocate(1).unwrap();
        let b = ring.allocate_aligned(1, 4).unwrap();
        assert_eq!(b.offset, 256);
        assert_eq!(ring.allocate_aligned(1, 3), Err(RingError::InvalidAlignment(3)));
    }

    #[test]
    fn stale_allocation_is_rejected() {
        let mut ring = ring(4096);
        ring.set_current_frame(1);
        let a = ring.allocate(16).unwrap();
        ring.set_current_frame(2);
        assert!(matches!(
            ring.cpu_slice_mut(&a),
            Err(RingError::StaleAllocation { allocation_frame: 1, current_frame: 2 })
        ));
        assert!(ring.gpu_address(&a).is_err());
    }

    #[test]
    fn set_current_frame_ignores_non_advancing_frames() {
        let mut ring = ring(4096);
        ring.set_current_frame(3);
        ring.set_current_frame(3);
        ring.set_current_frame(2);
        assert_eq!(ring.current_frame(), 3);
        ring.has_completed_frame(2);
        assert_eq!(ring.head(), 0);
    }

    #[test]
    fn wrap_after_first_frame_retires() {
        // 1024-byte ring: frame 1 takes 600 bytes, completes, frame 2 takes 500.
        let mut ring = ring(1024);
        ring.set_current_frame(1);
        let first = ring.allocate(600).unwrap();
        assert_eq!(first.offset, 0);

        ring.set_current_frame(2);
        ring.has_completed_frame(1);
        let second = ring.allocate(500).unwrap();
        assert_eq!(second.offset, 0);
        assert_eq!(second.frame_tag, 2);
    }

    #[test]
    fn wrap_when_queue_drains_first() {
        let mut ring = ring(1024);
        ring.set_current_frame(1);
        ring.allocate(600).unwrap();
        ring.has_completed_frame(1);
        assert_eq!((ring.head(), ring.tail()), (0, 0));

        ring.set_current_frame(2);
        let second = ring.allocate(500).unwrap();
        assert_eq!(second.offset, 0);
    }

    #[test]
    fn outstanding_frame_blocks_wrap() {
        let mut ring = ring(1024);
        ring.set_current_frame(1);
        ring.allocate(600).unwrap();
        ring.set_current_frame(2);
        // Frame 1 still in flight, so head is 0 and nothing fits.
        assert!(matches!(ring.allocate(500), Err(RingError::OutOfSpace { .. })));
    }

    #[test]
    fn wrapped_regime_cannot_reach_head() {
        let mut ring = ring(1024);
        ring.set_current_frame(1);
        ring.allocate(512).unwrap();
        ring.set_current_frame(2);
        ring.allocate(400).unwrap(); // [512, 912)
        ring.set_current_frame(3);
        ring.has_completed_frame(1); // head -> 512
        let wrapped = ring.allocate(256).unwrap();
        assert_eq!(wrapped.offset, 0);
        // Filling the gap up to head exactly would make head == tail.
        assert!(ring.allocate(256).is_err());
    }

    #[test]
    fn wrap_needs_room_strictly_below_head() {
        let mut ring = ring(1024);
        ring.set_current_frame(1);
        ring.allocate(512).unwrap();
        ring.set_current_frame(2);
        ring.allocate(256).unwrap(); // [512, 768)
        ring.has_completed_frame(1); // head -> 512
        ring.set_current_frame(3);

        // Exactly head bytes would leave tail == head after the wrap.
        assert_eq!(
            ring.allocate(512),
            Err(RingError::OutOfSpace {
                requested: 512,
                head: 512,
                tail: 768,
                capacity: 1024
            })
        );
        let wrapped = ring.allocate(511).unwrap();
        assert_eq!(wrapped.offset, 0);
        assert_eq!(ring.tail(), 511);
    }

    #[test]
    fn head_never_passes_newer_frames() {
        let mut ring = ring(8192);
        for frame in 1..=4u64 {
            ring.set_current_frame(frame);
            ring.allocate(1000).unwrap();
        }
        ring.has_completed_frame(2);
        // Frame 3 started at the tail left by frame 2's allocation.
        assert_eq!(ring.head(), 2024);
        ring.has_completed_frame(3);
        assert_eq!(ring.head(), 3048);
    }

    #[test]
    fn no_overlap_under_churn() {
        let mut ring = ring(16 * 1024);
        let mut live: Vec<(u64, u32, u32)> = Vec::new();
        let mut seed = 0x2545_f491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for frame in 1..200u64 {
            ring.set_current_frame(frame);
            // Keep two frames in flight.
            if frame > 2 {
                ring.has_completed_frame(frame - 2);
                live.retain(|&(f, _, _)| f > frame - 2);
            }
            for _ in 0..(next() % 6) {
                let size = 1 + next() % 2000;
                if let Ok(a) = ring.allocate(size) {
                    let (start, end) = (a.offset, a.offset + a.size);
                    assert!(end <= ring.capacity());
                    for &(_, s, e) in &live {
                        assert!(end <= s || start >= e, "overlap [{start},{end}) vs [{s},{e})");
                    }
                    live.push((frame, start, end));
                }
            }
        }
    }
}
