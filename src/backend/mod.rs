// Backend module - GPU abstraction layer
//
// Design: the streaming engine only talks to these traits. A backend provides
// buffers it can map, a command list, a queue with a monotonically increasing
// fence, and a presenter that rotates back buffers.
//
// Implementations:
// - host:   CPU-simulated GPU timeline (tests, headless runs)
// - vulkan: ash + gpu-allocator (feature "vulkan")

pub mod host;

#[cfg(feature = "vulkan")]
pub mod buffer;
#[cfg(feature = "vulkan")]
pub mod commands;
#[cfg(feature = "vulkan")]
pub mod device;
#[cfg(feature = "vulkan")]
pub mod pipeline;
#[cfg(feature = "vulkan")]
pub mod shader;
#[cfg(feature = "vulkan")]
pub mod swapchain;
#[cfg(feature = "vulkan")]
pub mod sync;

#[cfg(feature = "vulkan")]
pub use device::VulkanDevice;
pub use host::HostDevice;

use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DeviceError;
use crate::shaders::{ShaderBlob, VertexLayout};
use crate::state::{ClearFlags, PipelineKey, Viewport};

// =============================================================================
// IDENTITY & MEMORY
// =============================================================================

/// Process-unique identity of a GPU object. Used as cache-key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A host-visible view of a mapped GPU buffer.
///
/// The mapping stays valid until the owning buffer is unmapped or dropped.
/// Slicing is unsafe because the caller must guarantee exclusive access to
/// the bytes it touches for as long as the slice lives.
#[derive(Debug, Clone, Copy)]
pub struct MappedMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// Mapped pointers are plain addresses into memory owned by the buffer.
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the mapping is used.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// No other live slice may overlap `[offset, offset + len)` and the
    /// mapping must outlive `'a`.
    pub unsafe fn slice_mut<'a>(&self, offset: usize, len: usize) -> Option<&'a mut [u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len))
    }

    /// # Safety
    /// No live mutable slice may overlap `[offset, offset + len)` and the
    /// mapping must outlive `'a`.
    pub unsafe fn slice<'a>(&self, offset: usize, len: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len))
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

/// A linear, host-visible GPU buffer.
pub trait GpuBuffer: fmt::Debug + Send + Sync {
    fn id(&self) -> ResourceId;
    fn size(&self) -> u64;
    fn label(&self) -> &str;

    /// Map the whole buffer. Maps nest; every `map` needs a matching `unmap`.
    fn map(&self) -> Result<MappedMemory, DeviceError>;
    fn unmap(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Device-visible location: a buffer plus a byte offset into it.
#[derive(Debug, Clone)]
pub struct GpuAddress {
    pub buffer: Arc<dyn GpuBuffer>,
    pub offset: u64,
}

impl GpuAddress {
    pub fn new(buffer: Arc<dyn GpuBuffer>, offset: u64) -> Self {
        Self { buffer, offset }
    }

    pub fn buffer_id(&self) -> ResourceId {
        self.buffer.id()
    }
}

/// Opaque shader-visible descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Bgra8Unorm,
    Rgba8Unorm,
    D24UnormS8,
    D32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureState {
    RenderTarget,
    ShaderResource,
    Present,
}

/// A texture owned by the surface/texture object model.
pub trait GpuTexture: fmt::Debug + Send + Sync {
    fn id(&self) -> ResourceId;
    fn descriptor(&self) -> DescriptorHandle;
    fn extent(&self) -> (u32, u32);
    fn format(&self) -> TextureFormat;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    None,
    Point,
    Linear,
    Anisotropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    /// `f32::to_bits` of the LOD bias, so the descriptor stays hashable.
    pub mip_lod_bias_bits: u32,
    pub max_anisotropy: u32,
    pub border_color: u32,
}

impl SamplerDesc {
    pub fn mip_lod_bias(&self) -> f32 {
        f32::from_bits(self.mip_lod_bias_bits)
    }
}

// =============================================================================
// PIPELINES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn size(&self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Everything a backend needs to build a pipeline-state object.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub key: PipelineKey,
    pub topology: PrimitiveTopology,
    pub vertex_shader: Arc<ShaderBlob>,
    pub pixel_shader: Arc<ShaderBlob>,
    pub vertex_layout: Arc<VertexLayout>,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
}

pub trait PipelineState: fmt::Debug + Send + Sync {
    fn id(&self) -> ResourceId;
    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// COMMANDS, QUEUE, PRESENTATION
// =============================================================================

/// Root constant-buffer slots shared by every generated shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstantSlot {
    Transforms = 0,
    VertexConstants = 1,
    Lights = 2,
    Pixel = 3,
}

impl ConstantSlot {
    pub const ALL: [ConstantSlot; 4] = [
        ConstantSlot::Transforms,
        ConstantSlot::VertexConstants,
        ConstantSlot::Lights,
        ConstantSlot::Pixel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
pub struct RenderTargets {
    pub color: Arc<dyn GpuTexture>,
    pub depth: Option<Arc<dyn GpuTexture>>,
    pub viewport: Viewport,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearRequest {
    pub flags: ClearFlags,
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

/// A recordable command list with one command allocator per back-buffer slot.
pub trait CommandList: Any {
    /// Reset the allocator for `slot` and reopen the list for recording.
    fn reset(&mut self, slot: usize) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
    fn is_open(&self) -> bool;

    fn copy_buffer(&mut self, src: &GpuAddress, dst: &GpuAddress, size: u64);
    fn transition(&mut self, texture: &Arc<dyn GpuTexture>, state: TextureState);
    fn set_render_targets(&mut self, targets: &RenderTargets);
    fn clear(&mut self, request: &ClearRequest);

    fn set_pipeline(&mut self, pipeline: &Arc<dyn PipelineState>);
    fn set_constant_buffer(&mut self, slot: ConstantSlot, address: &GpuAddress, size: u32);
    fn set_vertex_buffer(&mut self, stream: u32, address: &GpuAddress, size: u32, stride: u32);
    fn set_index_buffer(&mut self, address: &GpuAddress, size: u32, format: IndexFormat);
    fn set_texture(&mut self, stage: u32, descriptor: Option<DescriptorHandle>);
    fn set_sampler(&mut self, stage: u32, sampler: SamplerHandle);

    fn draw(&mut self, vertex_count: u32, first_vertex: u32);
    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Submission queue plus its monotonically increasing fence.
pub trait GpuQueue {
    /// Execute a closed command list.
    fn execute(&mut self, commands: &mut dyn CommandList) -> Result<(), DeviceError>;
    /// Signal the fence with `value` once all previously executed work is done.
    fn signal(&mut self, value: u64) -> Result<(), DeviceError>;
    fn completed_value(&self) -> u64;
    /// Block until the fence reaches `value`. Returns `Ok(false)` on timeout.
    fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DeviceError>;
}

pub trait Presenter {
    fn back_buffer_count(&self) -> usize;
    /// Slot the next frame will render into.
    fn current_index(&self) -> usize;
    fn back_buffer(&self, slot: usize) -> Arc<dyn GpuTexture>;
    fn extent(&self) -> (u32, u32);
    fn present(&mut self, queue: &mut dyn GpuQueue) -> Result<(), DeviceError>;
    fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentDesc {
    pub width: u32,
    pub height: u32,
    pub back_buffer_count: usize,
    pub format: TextureFormat,
}

// =============================================================================
// DEVICE
// =============================================================================

/// Resource-creation entry point of a backend.
pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn GpuBuffer>, DeviceError>;
    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<Arc<dyn PipelineState>, DeviceError>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle, DeviceError>;

    fn create_command_list(&self, slots: usize) -> Result<Box<dyn CommandList>, DeviceError>;
    fn create_queue(&self) -> Result<Box<dyn GpuQueue>, DeviceError>;
    fn create_presenter(&self, desc: &PresentDesc) -> Result<Box<dyn Presenter>, DeviceError>;

    fn wait_idle(&self) -> Result<(), DeviceError>;
}
