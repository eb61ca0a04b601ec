// Error taxonomy
//
// Every layer returns a typed error instead of aborting:
// - DeviceError: resource creation / backend failures (ordinary, caller may retry)
// - RingError:   transient allocator exhaustion and stale-handle misuse
// - LockError:   buffer lock protocol misuse
// - FrameError:  submission and fence failures (GpuTimeout is a device hang)
// - DrawError:   draw-time validation, wraps everything below it

use std::time::Duration;
use thiserror::Error;

use crate::streaming::LockMode;

/// Failures reported by a GPU backend.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error(
        "ring buffer exhausted: {requested} bytes requested (head {head}, tail {tail}, capacity {capacity})"
    )]
    OutOfSpace {
        requested: u32,
        head: u32,
        tail: u32,
        capacity: u32,
    },

    #[error("allocation tagged for frame {allocation_frame} used during frame {current_frame}")]
    StaleAllocation {
        allocation_frame: u64,
        current_frame: u64,
    },

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u32),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0:?} locks are not allowed on static buffers")]
    InvalidModeForStatic(LockMode),

    #[error("discard locks must start at offset 0 (got {0})")]
    DiscardOffset(u32),

    #[error("lock range {offset}+{size} exceeds buffer size {buffer_size}")]
    OutOfBounds {
        offset: u32,
        size: u32,
        buffer_size: u32,
    },

    #[error("blocking lock requested after the buffer was already written in frame {frame}")]
    BlockingLockAfterWrite { frame: u64 },

    #[error("dynamic buffer has writes for frame {frame} but no ring allocation")]
    MissingRingAllocation { frame: u64 },

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("GPU did not reach fence value {value} within {timeout:?} (completed {completed})")]
    GpuTimeout {
        value: u64,
        completed: u64,
        timeout: Duration,
    },

    #[error("command list is closed; nothing is being recorded")]
    CommandListClosed,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("primitive type {0:?} is not supported by this draw path")]
    UnsupportedPrimitive(crate::state::PrimitiveType),

    #[error("no vertex shader bound")]
    MissingVertexShader,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}
