// Host backend - a GPU simulated on the CPU
//
// Buffers live in ordinary heap memory, command lists record into a Vec, and
// the queue replays them on a simulated timeline. The timeline either retires
// work as soon as the fence is signalled (Immediate) or only when somebody
// waits on it (Deferred), which makes CPU/GPU overlap observable in tests.
//
// Every draw is logged together with the bytes its constant buffers and
// vertex streams held at "GPU time", so tests can check that the streaming
// engine never let the CPU overwrite memory the GPU still had to read.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    BufferDesc, ClearRequest, CommandList, ConstantSlot, DescriptorHandle, GpuAddress, GpuBuffer,
    GpuDevice, GpuQueue, GpuTexture, IndexFormat, MappedMemory, PipelineDesc, PipelineState,
    PresentDesc, Presenter, RenderTargets, ResourceId, SamplerDesc, SamplerHandle, TextureFormat,
    TextureState,
};
use crate::error::DeviceError;
use crate::state::PipelineKey;

/// When the simulated GPU retires submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Work completes as soon as its fence value is signalled.
    Immediate,
    /// Work completes only when the CPU waits for it (or `retire_all` runs).
    Deferred,
}

// =============================================================================
// DEVICE
// =============================================================================

pub struct HostDevice {
    name: String,
    gpu: Arc<Mutex<HostGpu>>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_completion(CompletionMode::Immediate)
    }

    pub fn with_completion(mode: CompletionMode) -> Self {
        log::info!("Creating host device ({:?} completion)", mode);
        Self {
            name: format!("host ({:?})", mode),
            gpu: Arc::new(Mutex::new(HostGpu::new(mode))),
        }
    }

    pub fn completed_value(&self) -> u64 {
        self.gpu.lock().completed
    }

    pub fn stats(&self) -> HostStats {
        self.gpu.lock().stats.clone()
    }

    /// Draws executed so far, oldest first.
    pub fn draws(&self) -> Vec<DrawRecord> {
        self.gpu.lock().draws.clone()
    }

    pub fn clears(&self) -> Vec<ClearRequest> {
        self.gpu.lock().clears.clone()
    }

    /// Last state a texture was transitioned to on the GPU timeline.
    pub fn texture_state(&self, id: ResourceId) -> Option<TextureState> {
        self.gpu.lock().texture_states.get(&id).copied()
    }

    /// Simulate a hung GPU: waits time out and nothing retires.
    pub fn set_stalled(&self, stalled: bool) {
        self.gpu.lock().stalled = stalled;
    }

    /// Let the GPU catch up with everything submitted so far.
    pub fn retire_all(&self) {
        self.gpu.lock().run_until(u64::MAX);
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn GpuBuffer>, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidParameters(format!(
                "buffer '{}' has zero size",
                desc.label
            )));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| DeviceError::OutOfMemory(format!("{} bytes", desc.size)))?;
        self.gpu.lock().stats.buffers_created += 1;
        Ok(Arc::new(HostBuffer::new(&desc.label, len)))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<Arc<dyn PipelineState>, DeviceError> {
        self.gpu.lock().stats.pipelines_created += 1;
        log::debug!(
            "Host pipeline: vs '{}' ps '{}' {:?}",
            desc.vertex_shader.label,
            desc.pixel_shader.label,
            desc.topology
        );
        Ok(Arc::new(HostPipeline {
            id: ResourceId::next(),
            key: desc.key,
        }))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle, DeviceError> {
        let mut gpu = self.gpu.lock();
        gpu.stats.samplers_created += 1;
        log::trace!("Host sampler #{}: {:?}", gpu.stats.samplers_created, desc);
        Ok(SamplerHandle(gpu.stats.samplers_created as u32))
    }

    fn create_command_list(&self, slots: usize) -> Result<Box<dyn CommandList>, DeviceError> {
        if slots == 0 {
            return Err(DeviceError::InvalidParameters("command list needs at least one slot".into()));
        }
        Ok(Box::new(HostCommandList {
            slots,
            slot: 0,
            open: false,
            recorded: Vec::new(),
        }))
    }

    fn create_queue(&self) -> Result<Box<dyn GpuQueue>, DeviceError> {
        Ok(Box::new(HostQueue {
            gpu: self.gpu.clone(),
        }))
    }

    fn create_presenter(&self, desc: &PresentDesc) -> Result<Box<dyn Presenter>, DeviceError> {
        if desc.back_buffer_count == 0 {
            return Err(DeviceError::InvalidParameters("need at least one back buffer".into()));
        }
        Ok(Box::new(HostSwapchain::new(self.gpu.clone(), *desc)))
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        let mut gpu = self.gpu.lock();
        if gpu.stalled && !gpu.pending.is_empty() {
            return Err(DeviceError::DeviceLost("host GPU is stalled".into()));
        }
        gpu.run_until(u64::MAX);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    pub buffers_created: u64,
    pub pipelines_created: u64,
    pub samplers_created: u64,
    pub submissions: u64,
    pub copies: u64,
    pub copied_bytes: u64,
    pub presents: u64,
    /// Waits that found the fence behind and had to block.
    pub blocking_waits: u64,
}

// =============================================================================
// RESOURCES
// =============================================================================

pub struct HostBuffer {
    id: ResourceId,
    label: String,
    ptr: NonNull<u8>,
    len: usize,
    map_count: AtomicU32,
}

// The allocation is owned by the buffer and only reached through raw pointers.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    fn new(label: &str, len: usize) -> Self {
        let storage = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(storage)).cast::<u8>();
        Self {
            id: ResourceId::next(),
            label: label.to_string(),
            ptr,
            len,
            map_count: AtomicU32::new(0),
        }
    }

    /// Copy bytes out of the buffer, as a readback would.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let end = (offset + len).min(self.len);
        let start = offset.min(end);
        let mut out = vec![0u8; end - start];
        // SAFETY: range checked against the allocation above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Outstanding `map` calls.
    pub fn map_count(&self) -> u32 {
        self.map_count.load(Ordering::Acquire)
    }

    /// Read `len` bytes at `address` if it points into a host buffer.
    pub fn read_address(address: &GpuAddress, len: usize) -> Option<Vec<u8>> {
        let buffer = address.buffer.as_any().downcast_ref::<HostBuffer>()?;
        Some(buffer.read(address.offset as usize, len))
    }

    fn copy_within(src: &GpuAddress, dst: &GpuAddress, size: u64) -> Result<(), DeviceError> {
        let (Some(s), Some(d)) = (
            src.buffer.as_any().downcast_ref::<HostBuffer>(),
            dst.buffer.as_any().downcast_ref::<HostBuffer>(),
        ) else {
            return Err(DeviceError::InvalidParameters("copy between foreign buffers".into()));
        };
        let size = size as usize;
        if src.offset as usize + size > s.len || dst.offset as usize + size > d.len {
            return Err(DeviceError::InvalidParameters(format!(
                "copy of {} bytes out of range ({} -> {})",
                size, s.label, d.label
            )));
        }
        // SAFETY: both ranges were bounds-checked; `copy` tolerates overlap.
        unsafe {
            std::ptr::copy(
                s.ptr.as_ptr().add(src.offset as usize),
                d.ptr.as_ptr().add(dst.offset as usize),
                size,
            );
        }
        Ok(())
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // SAFETY: reconstructs exactly the boxed slice leaked in `new`.
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
            drop(Box::from_raw(slice));
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("len", &self.len)
            .finish()
    }
}

impl GpuBuffer for HostBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn size(&self) -> u64 {
        self.len as u64
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn map(&self) -> Result<MappedMemory, DeviceError> {
        self.map_count.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the allocation lives as long as the buffer.
        Ok(unsafe { MappedMemory::new(self.ptr, self.len) })
    }

    fn unmap(&self) {
        let _ = self
            .map_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct HostTexture {
    id: ResourceId,
    descriptor: DescriptorHandle,
    extent: (u32, u32),
    format: TextureFormat,
}

impl HostTexture {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        static NEXT_DESCRIPTOR: AtomicU32 = AtomicU32::new(0);
        Self {
            id: ResourceId::next(),
            descriptor: DescriptorHandle(NEXT_DESCRIPTOR.fetch_add(1, Ordering::Relaxed)),
            extent: (width, height),
            format,
        }
    }
}

impl GpuTexture for HostTexture {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn descriptor(&self) -> DescriptorHandle {
        self.descriptor
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn format(&self) -> TextureFormat {
        self.format
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct HostPipeline {
    id: ResourceId,
    pub key: PipelineKey,
}

impl PipelineState for HostPipeline {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

#[derive(Debug, Clone)]
enum HostCommand {
    Copy { src: GpuAddress, dst: GpuAddress, size: u64 },
    Transition { texture: ResourceId, state: TextureState },
    SetRenderTargets { color: ResourceId },
    Clear(ClearRequest),
    SetPipeline(ResourceId),
    SetConstantBuffer { slot: ConstantSlot, address: GpuAddress, size: u32 },
    SetVertexBuffer { stream: u32, address: GpuAddress, size: u32, stride: u32 },
    SetIndexBuffer { address: GpuAddress, size: u32, format: IndexFormat },
    SetTexture { stage: u32, descriptor: Option<DescriptorHandle> },
    SetSampler { stage: u32, sampler: SamplerHandle },
    Draw { vertex_count: u32, first_vertex: u32 },
    DrawIndexed { index_count: u32, first_index: u32, base_vertex: i32 },
}

pub struct HostCommandList {
    slots: usize,
    slot: usize,
    open: bool,
    recorded: Vec<HostCommand>,
}

impl HostCommandList {
    fn record(&mut self, command: HostCommand) {
        if !self.open {
            log::warn!("Recording into a closed host command list");
        }
        self.recorded.push(command);
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl CommandList for HostCommandList {
    fn reset(&mut self, slot: usize) -> Result<(), DeviceError> {
        if slot >= self.slots {
            return Err(DeviceError::InvalidParameters(format!(
                "slot {} out of {} command allocators",
                slot, self.slots
            )));
        }
        self.slot = slot;
        self.recorded.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn copy_buffer(&mut self, src: &GpuAddress, dst: &GpuAddress, size: u64) {
        self.record(HostCommand::Copy {
            src: src.clone(),
            dst: dst.clone(),
            size,
        });
    }

    fn transition(&mut self, texture: &Arc<dyn GpuTexture>, state: TextureState) {
        self.record(HostCommand::Transition {
            texture: texture.id(),
            state,
        });
    }

    fn set_render_targets(&mut self, targets: &RenderTargets) {
        self.record(HostCommand::SetRenderTargets {
            color: targets.color.id(),
        });
    }

    fn clear(&mut self, request: &ClearRequest) {
        self.record(HostCommand::Clear(*request));
    }

    fn set_pipeline(&mut self, pipeline: &Arc<dyn PipelineState>) {
        self.record(HostCommand::SetPipeline(pipeline.id()));
    }

    fn set_constant_buffer(&mut self, slot: ConstantSlot, address: &GpuAddress, size: u32) {
        self.record(HostCommand::SetConstantBuffer {
            slot,
            address: address.clone(),
            size,
        });
    }

    fn set_vertex_buffer(&mut self, stream: u32, address: &GpuAddress, size: u32, stride: u32) {
        self.record(HostCommand::SetVertexBuffer {
            stream,
            address: address.clone(),
            size,
            stride,
        });
    }

    fn set_index_buffer(&mut self, address: &GpuAddress, size: u32, format: IndexFormat) {
        self.record(HostCommand::SetIndexBuffer {
            address: address.clone(),
            size,
            format,
        });
    }

    fn set_texture(&mut self, stage: u32, descriptor: Option<DescriptorHandle>) {
        self.record(HostCommand::SetTexture { stage, descriptor });
    }

    fn set_sampler(&mut self, stage: u32, sampler: SamplerHandle) {
        self.record(HostCommand::SetSampler { stage, sampler });
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.record(HostCommand::Draw {
            vertex_count,
            first_vertex,
        });
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32) {
        self.record(HostCommand::DrawIndexed {
            index_count,
            first_index,
            base_vertex,
        });
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =============================================================================
// SIMULATED GPU TIMELINE
// =============================================================================

/// A draw as the simulated GPU executed it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawRecord {
    pub pipeline: Option<ResourceId>,
    pub render_target: Option<ResourceId>,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub indexed: bool,
    pub base_vertex: i32,
    /// Constant-buffer contents at execution time, by slot.
    pub constants: BTreeMap<ConstantSlot, Vec<u8>>,
    /// Vertex-stream contents at execution time, by stream.
    pub vertices: BTreeMap<u32, Vec<u8>>,
    pub strides: BTreeMap<u32, u32>,
    pub indices: Option<Vec<u8>>,
    pub textures: BTreeMap<u32, DescriptorHandle>,
    pub samplers: BTreeMap<u32, SamplerHandle>,
}

enum Work {
    Commands(Vec<HostCommand>),
    Signal(u64),
}

#[derive(Default)]
struct Bindings {
    pipeline: Option<ResourceId>,
    render_target: Option<ResourceId>,
    constants: BTreeMap<ConstantSlot, (GpuAddress, u32)>,
    vertices: BTreeMap<u32, (GpuAddress, u32, u32)>,
    indices: Option<(GpuAddress, u32)>,
    textures: BTreeMap<u32, DescriptorHandle>,
    samplers: BTreeMap<u32, SamplerHandle>,
}

struct HostGpu {
    mode: CompletionMode,
    stalled: bool,
    completed: u64,
    pending: VecDeque<Work>,
    draws: Vec<DrawRecord>,
    clears: Vec<ClearRequest>,
    texture_states: HashMap<ResourceId, TextureState>,
    stats: HostStats,
}

impl HostGpu {
    fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            stalled: false,
            completed: 0,
            pending: VecDeque::new(),
            draws: Vec::new(),
            clears: Vec::new(),
            texture_states: HashMap::new(),
            stats: HostStats::default(),
        }
    }

    fn submit(&mut self, work: Work) {
        self.pending.push_back(work);
        if self.mode == CompletionMode::Immediate && !self.stalled {
            self.run_until(u64::MAX);
        }
    }

    /// Retire queued work in order until the fence reaches `target`.
    fn run_until(&mut self, target: u64) {
        while self.completed < target {
            let Some(work) = self.pending.pop_front() else {
                break;
            };
            match work {
                Work::Commands(commands) => self.execute(commands),
                Work::Signal(value) => self.completed = self.completed.max(value),
            }
        }
    }

    fn execute(&mut self, commands: Vec<HostCommand>) {
        // Bindings do not survive across command lists.
        let mut bound = Bindings::default();
        for command in commands {
            match command {
                HostCommand::Copy { src, dst, size } => {
                    if let Err(e) = HostBuffer::copy_within(&src, &dst, size) {
                        log::error!("Host GPU copy failed: {}", e);
                    }
                    self.stats.copies += 1;
                    self.stats.copied_bytes += size;
                }
                HostCommand::Transition { texture, state } => {
                    self.texture_states.insert(texture, state);
                }
                HostCommand::SetRenderTargets { color } => bound.render_target = Some(color),
                HostCommand::Clear(request) => self.clears.push(request),
                HostCommand::SetPipeline(id) => bound.pipeline = Some(id),
                HostCommand::SetConstantBuffer { slot, address, size } => {
                    bound.constants.insert(slot, (address, size));
                }
                HostCommand::SetVertexBuffer { stream, address, size, stride } => {
                    bound.vertices.insert(stream, (address, size, stride));
                }
                HostCommand::SetIndexBuffer { address, size, .. } => {
                    bound.indices = Some((address, size));
                }
                HostCommand::SetTexture { stage, descriptor } => match descriptor {
                    Some(d) => {
                        bound.textures.insert(stage, d);
                    }
                    None => {
                        bound.textures.remove(&stage);
                    }
                },
                HostCommand::SetSampler { stage, sampler } => {
                    bound.samplers.insert(stage, sampler);
                }
                HostCommand::Draw { vertex_count, first_vertex } => {
                    let mut record = Self::snapshot(&bound);
                    record.vertex_count = vertex_count;
                    record.first_vertex = first_vertex;
                    self.draws.push(record);
                }
                HostCommand::DrawIndexed { index_count, first_index, base_vertex } => {
                    let mut record = Self::snapshot(&bound);
                    record.indexed = true;
                    record.vertex_count = index_count;
                    record.first_vertex = first_index;
                    record.base_vertex = base_vertex;
                    self.draws.push(record);
                }
            }
        }
    }

    fn snapshot(bound: &Bindings) -> DrawRecord {
        let read = |address: &GpuAddress, size: u32| {
            HostBuffer::read_address(address, size as usize).unwrap_or_default()
        };
        DrawRecord {
            pipeline: bound.pipeline,
            render_target: bound.render_target,
            constants: bound
                .constants
                .iter()
                .map(|(slot, (address, size))| (*slot, read(address, *size)))
                .collect(),
            vertices: bound
                .vertices
                .iter()
                .map(|(stream, (address, size, _))| (*stream, read(address, *size)))
                .collect(),
            strides: bound
                .vertices
                .iter()
                .map(|(stream, (_, _, stride))| (*stream, *stride))
                .collect(),
            indices: bound.indices.as_ref().map(|(address, size)| read(address, *size)),
            textures: bound.textures.clone(),
            samplers: bound.samplers.clone(),
            ..Default::default()
        }
    }
}

pub struct HostQueue {
    gpu: Arc<Mutex<HostGpu>>,
}

impl GpuQueue for HostQueue {
    fn execute(&mut self, commands: &mut dyn CommandList) -> Result<(), DeviceError> {
        let list = commands
            .as_any_mut()
            .downcast_mut::<HostCommandList>()
            .ok_or_else(|| DeviceError::InvalidParameters("not a host command list".into()))?;
        if list.open {
            return Err(DeviceError::InvalidParameters("command list must be closed before execution".into()));
        }
        let recorded = std::mem::take(&mut list.recorded);
        let mut gpu = self.gpu.lock();
        gpu.stats.submissions += 1;
        gpu.submit(Work::Commands(recorded));
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<(), DeviceError> {
        self.gpu.lock().submit(Work::Signal(value));
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.gpu.lock().completed
    }

    fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DeviceError> {
        let mut gpu = self.gpu.lock();
        if gpu.completed >= value {
            return Ok(true);
        }
        gpu.stats.blocking_waits += 1;
        if gpu.stalled {
            log::warn!("Host GPU stalled; wait for {} gives up after {:?}", value, timeout);
            return Ok(false);
        }
        gpu.run_until(value);
        Ok(gpu.completed >= value)
    }
}

// =============================================================================
// PRESENTATION
// =============================================================================

pub struct HostSwapchain {
    gpu: Arc<Mutex<HostGpu>>,
    desc: PresentDesc,
    buffers: Vec<Arc<HostTexture>>,
    current: usize,
}

impl HostSwapchain {
    fn new(gpu: Arc<Mutex<HostGpu>>, desc: PresentDesc) -> Self {
        let buffers = Self::create_buffers(&desc);
        Self {
            gpu,
            desc,
            buffers,
            current: 0,
        }
    }

    fn create_buffers(desc: &PresentDesc) -> Vec<Arc<HostTexture>> {
        (0..desc.back_buffer_count)
            .map(|_| Arc::new(HostTexture::new(desc.width, desc.height, desc.format)))
            .collect()
    }
}

impl Presenter for HostSwapchain {
    fn back_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn current_index(&self) -> usize {
        self.current
    }

    fn back_buffer(&self, slot: usize) -> Arc<dyn GpuTexture> {
        self.buffers[slot % self.buffers.len()].clone()
    }

    fn extent(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    fn present(&mut self, _queue: &mut dyn GpuQueue) -> Result<(), DeviceError> {
        self.gpu.lock().stats.presents += 1;
        self.current = (self.current + 1) % self.buffers.len();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::InvalidParameters(format!("{}x{} back buffer", width, height)));
        }
        self.desc.width = width;
        self.desc.height = height;
        self.buffers = Self::create_buffers(&self.desc);
        self.current = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferUsage;

    fn buffer(device: &HostDevice, size: u64) -> Arc<dyn GpuBuffer> {
        device
            .create_buffer(&BufferDesc {
                label: "test".into(),
                size,
                usage: BufferUsage::VERTEX,
            })
            .unwrap()
    }

    #[test]
    fn deferred_queue_retires_only_on_wait() {
        let device = HostDevice::with_completion(CompletionMode::Deferred);
        let mut queue = device.create_queue().unwrap();
        queue.signal(1).unwrap();
        assert_eq!(queue.completed_value(), 0);
        assert!(queue.wait(1, Duration::from_secs(1)).unwrap());
        assert_eq!(queue.completed_value(), 1);
        assert_eq!(device.stats().blocking_waits, 1);
    }

    #[test]
    fn stalled_queue_times_out() {
        let device = HostDevice::with_completion(CompletionMode::Deferred);
        let mut queue = device.create_queue().unwrap();
        queue.signal(1).unwrap();
        device.set_stalled(true);
        assert!(!queue.wait(1, Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn copies_run_on_the_timeline() {
        let device = HostDevice::with_completion(CompletionMode::Deferred);
        let src = buffer(&device, 64);
        let dst = buffer(&device, 64);
        let mapped = src.map().unwrap();
        unsafe { mapped.slice_mut(0, 4).unwrap() }.copy_from_slice(&[1, 2, 3, 4]);
        src.unmap();

        let mut list = device.create_command_list(1).unwrap();
        let mut queue = device.create_queue().unwrap();
        list.reset(0).unwrap();
        list.copy_buffer(&GpuAddress::new(src, 0), &GpuAddress::new(dst.clone(), 8), 4);
        list.close().unwrap();
        queue.execute(list.as_mut()).unwrap();
        queue.signal(1).unwrap();

        let window = GpuAddress::new(dst, 8);
        assert_eq!(HostBuffer::read_address(&window, 4).unwrap(), vec![0, 0, 0, 0]);
        device.retire_all();
        assert_eq!(HostBuffer::read_address(&window, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn open_list_cannot_execute() {
        let device = HostDevice::new();
        let mut list = device.create_command_list(2).unwrap();
        let mut queue = device.create_queue().unwrap();
        list.reset(1).unwrap();
        assert!(queue.execute(list.as_mut()).is_err());
        assert!(list.reset(2).is_err());
    }

    #[test]
    fn map_count_balances() {
        let device = HostDevice::new();
        let buf = buffer(&device, 16);
        let host = buf.as_any().downcast_ref::<HostBuffer>().unwrap();
        buf.map().unwrap();
        buf.map().unwrap();
        assert_eq!(host.map_count(), 2);
        buf.unmap();
        buf.unmap();
        buf.unmap();
        assert_eq!(host.map_count(), 0);
    }
}
