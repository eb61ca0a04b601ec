// =============================================================================
// LEGACY SHIM - resource streaming and frame synchronization
// =============================================================================
//
// Re-implements an immediate-mode graphics API's locking and draw semantics on
// top of an explicit GPU API.
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  LegacyDevice (buffers, streams, draws, clear, present, reset)  │
// │    ├── DrawStateResolver (dirty bits, constant uploads, caches) │
// │    ├── StreamingBuffer (Static / Dynamic lock semantics)        │
// │    └── FrameScheduler (submit, fences, keep-alive, rotation)    │
// │          └── RingAllocator (frame-tagged transient memory)      │
// │                └── backend traits (host or Vulkan)              │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod range_set;
pub mod resolver;
pub mod ring;
pub mod shaders;
pub mod state;
pub mod streaming;

pub use device::{DeviceSettings, IndexBuffer, LegacyDevice};
pub use error::{DeviceError, DrawError, FrameError, LockError, RingError};
pub use frame::{FrameConfig, FrameScheduler, FrameStats};
pub use resolver::{DirtyFlags, DrawStateResolver, ResolverConfig};
pub use ring::{RingAllocation, RingAllocator};
pub use streaming::{BufferLock, LockMode, StreamingBuffer, StreamingBufferDesc};
