// Legacy device facade
//
// Ties the frame scheduler, the streaming buffers and the draw-state resolver
// together behind the legacy device's call surface: buffer creation, stream
// and index binding, draws, clear, present and reset.

use std::sync::Arc;

use crate::backend::{BufferUsage, ClearRequest, GpuDevice, GpuTexture, IndexFormat, PrimitiveTopology};
use crate::error::DrawError;
use crate::frame::{FrameConfig, FrameScheduler};
use crate::resolver::{DrawStateResolver, ResolverConfig};
use crate::ring::{align_up, DEFAULT_MIN_ALIGNMENT};
use crate::shaders::ShaderGenerator;
use crate::state::{
    color_to_rgba, ClearFlags, Light, Material, PrimitiveType, RenderStateType, TextureStageStateType,
    TransformKind, Viewport, MAX_VERTEX_STREAMS,
};
use crate::streaming::{BufferLock, LockMode, StreamingBuffer, StreamingBufferDesc};

#[derive(Debug, Clone, Default)]
pub struct DeviceSettings {
    pub frame: FrameConfig,
    pub resolver: ResolverConfig,
}

/// An index buffer and the width of its indices.
#[derive(Debug, Clone)]
pub struct IndexBuffer {
    pub buffer: StreamingBuffer,
    pub format: IndexFormat,
}

impl std::ops::Deref for IndexBuffer {
    type Target = StreamingBuffer;

    fn deref(&self) -> &StreamingBuffer {
        &self.buffer
    }
}

#[derive(Debug, Clone)]
struct StreamBinding {
    buffer: StreamingBuffer,
    stride: u32,
}

pub struct LegacyDevice {
    // Dropped first so the GPU is drained before anything else goes away.
    frames: FrameScheduler,
    resolver: DrawStateResolver,
    device: Arc<dyn GpuDevice>,
    streams: [Option<StreamBinding>; MAX_VERTEX_STREAMS],
    indices: Option<IndexBuffer>,
    base_vertex: i32,
    defer_discard: bool,
}

impl LegacyDevice {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        shaders: Box<dyn ShaderGenerator>,
        settings: &DeviceSettings,
    ) -> Result<Self, DrawError> {
        log::info!("Creating legacy device on {}", device.name());
        let frames = FrameScheduler::new(device.clone(), &settings.frame)?;
        let resolver = DrawStateResolver::new(device.clone(), shaders, settings.resolver.clone())?;
        Ok(Self {
            frames,
            resolver,
            device,
            streams: Default::default(),
            indices: None,
            base_vertex: 0,
            defer_discard: settings.resolver.defer_discard,
        })
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    pub fn create_vertex_buffer(&self, length: u32, dynamic: bool) -> Result<StreamingBuffer, DrawError> {
        self.create_buffer("vertex buffer", length, BufferUsage::VERTEX, dynamic)
    }

    pub fn create_index_buffer(&self, length: u32, format: IndexFormat, dynamic: bool) -> Result<IndexBuffer, DrawError> {
        Ok(IndexBuffer {
            buffer: self.create_buffer("index buffer", length, BufferUsage::INDEX, dynamic)?,
            format,
        })
    }

    fn create_buffer(&self, label: &str, length: u32, usage: BufferUsage, dynamic: bool) -> Result<StreamingBuffer, DrawError> {
        if length == 0 {
            return Err(DrawError::InvalidCall(format!("{} of zero length", label)));
        }
        let size = align_up(length, DEFAULT_MIN_ALIGNMENT);
        let size = u32::try_from(size).map_err(|_| DrawError::InvalidCall(format!("{} of {} bytes", label, length)))?;
        let desc = StreamingBufferDesc::new(label, size, usage)
            .dynamic(dynamic)
            .defer_discard(self.defer_discard);
        Ok(StreamingBuffer::new(self.device.as_ref(), &desc)?)
    }

    /// Lock a buffer against this device's frame timeline.
    pub fn lock<'a>(
        &'a mut self,
        buffer: &'a StreamingBuffer,
        offset: u32,
        size: u32,
        mode: LockMode,
    ) -> Result<BufferLock<'a>, DrawError> {
        Ok(buffer.lock(&mut self.frames, offset, size, mode)?)
    }

    // =========================================================================
    // STATE
    // =========================================================================

    pub fn set_stream_source(&mut self, stream: usize, buffer: Option<StreamingBuffer>, stride: u32) -> Result<(), DrawError> {
        let slot = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| DrawError::InvalidCall(format!("vertex stream {}", stream)))?;
        *slot = buffer.map(|buffer| StreamBinding { buffer, stride });
        Ok(())
    }

    pub fn set_indices(&mut self, buffer: Option<IndexBuffer>, base_vertex: i32) {
        self.indices = buffer;
        self.base_vertex = base_vertex;
    }

    pub fn set_fvf(&mut self, fvf: u32) {
        self.resolver.set_fvf(fvf);
    }

    pub fn set_transform(&mut self, kind: TransformKind, matrix: glam::Mat4) -> Result<(), DrawError> {
        self.resolver.set_transform(kind, matrix)
    }

    pub fn set_render_state(&mut self, rs: RenderStateType, value: u32) {
        self.resolver.set_render_state(rs, value);
    }

    pub fn set_texture_stage_state(&mut self, stage: usize, ty: TextureStageStateType, value: u32) -> Result<(), DrawError> {
        self.resolver.set_texture_stage_state(stage, ty, value)
    }

    pub fn set_texture(&mut self, stage: usize, texture: Option<Arc<dyn GpuTexture>>) -> Result<(), DrawError> {
        self.resolver.set_texture(stage, texture)
    }

    pub fn set_material(&mut self, material: Material) {
        self.resolver.set_material(material);
    }

    pub fn set_light(&mut self, index: u32, light: Light) {
        self.resolver.set_light(index, light);
    }

    pub fn light_enable(&mut self, index: u32, enable: bool) -> Result<(), DrawError> {
        self.resolver.light_enable(index, enable)
    }

    pub fn set_vertex_shader_constant(&mut self, register: usize, data: &[[f32; 4]]) -> Result<(), DrawError> {
        self.resolver.set_vertex_shader_constant(register, data)
    }

    pub fn set_render_target(&mut self, color: Option<Arc<dyn GpuTexture>>, depth: Option<Arc<dyn GpuTexture>>) {
        self.resolver.set_render_target(color, depth);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.resolver.set_viewport(viewport);
    }

    // =========================================================================
    // DRAWING
    // =========================================================================

    pub fn draw_primitive(&mut self, primitive: PrimitiveType, start_vertex: u32, count: u32) -> Result<(), DrawError> {
        let topology = primitive
            .topology()
            .ok_or(DrawError::UnsupportedPrimitive(primitive))?;
        if count == 0 {
            return Ok(());
        }
        let vertex_count = vertex_count(primitive, count)?;
        let reach = start_vertex
            .checked_add(vertex_count)
            .ok_or_else(|| DrawError::InvalidCall(format!("vertex range {}+{} overflows", start_vertex, vertex_count)))?;

        self.resolver.prepare_draw(&mut self.frames, topology)?;
        self.bind_streams(reach)?;
        self.frames.command_list().draw(vertex_count, start_vertex);
        Ok(())
    }

    pub fn draw_indexed_primitive(
        &mut self,
        primitive: PrimitiveType,
        min_index: u32,
        num_vertices: u32,
        start_index: u32,
        count: u32,
    ) -> Result<(), DrawError> {
        let topology = primitive
            .topology()
            .ok_or(DrawError::UnsupportedPrimitive(primitive))?;
        let indices = self
            .indices
            .clone()
            .ok_or_else(|| DrawError::InvalidCall("indexed draw without an index buffer".into()))?;
        if count == 0 {
            return Ok(());
        }
        let index_count = vertex_count(primitive, count)?;
        let vertex_range = min_index
            .checked_add(num_vertices)
            .ok_or_else(|| DrawError::InvalidCall(format!("vertex range {}+{} overflows", min_index, num_vertices)))?;

        self.resolver.prepare_draw(&mut self.frames, topology)?;
        let reach = (self.base_vertex.max(0) as u32).saturating_add(vertex_range);
        self.bind_streams(reach)?;

        let address = indices.gpu_address(&mut self.frames)?;
        self.frames
            .command_list()
            .set_index_buffer(&address, indices.size(), indices.format);
        self.frames.mark_resource_as_used(Box::new(indices.buffer.clone()));

        self.frames
            .command_list()
            .draw_indexed(index_count, start_index, self.base_vertex);
        Ok(())
    }

    /// Draw from caller memory. The vertices are copied into the frame ring;
    /// fans are unrolled into triangle lists. Stream 0 is unbound afterwards.
    pub fn draw_primitive_up(&mut self, primitive: PrimitiveType, count: u32, data: &[u8], stride: u32) -> Result<(), DrawError> {
        if stride == 0 {
            return Err(DrawError::InvalidCall("zero vertex stride".into()));
        }
        if count == 0 {
            return Ok(());
        }
        let vertex_count = vertex_count(primitive, count)?;
        let needed = (vertex_count as usize)
            .checked_mul(stride as usize)
            .ok_or_else(|| DrawError::InvalidCall(format!("{} vertices of {} bytes overflow", vertex_count, stride)))?;
        if data.len() < needed {
            return Err(DrawError::InvalidCall(format!(
                "{} bytes supplied, {} vertices of {} bytes needed",
                data.len(),
                vertex_count,
                stride
            )));
        }

        let (topology, vertices, vertex_count) = match primitive.topology() {
            Some(topology) => (topology, data[..needed].to_vec(), vertex_count),
            None => {
                let triangles = count
                    .checked_mul(3)
                    .ok_or_else(|| DrawError::InvalidCall(format!("fan of {} triangles overflows", count)))?;
                let unrolled = unroll_fan(&data[..needed], stride as usize, count as usize);
                (PrimitiveTopology::TriangleList, unrolled, triangles)
            }
        };

        self.resolver.prepare_draw(&mut self.frames, topology)?;
        let (_, address) = self.frames.stage_upload(&vertices, DEFAULT_MIN_ALIGNMENT)?;
        self.frames
            .command_list()
            .set_vertex_buffer(0, &address, vertices.len() as u32, stride);
        self.frames.command_list().draw(vertex_count, 0);
        self.streams[0] = None;
        Ok(())
    }

    fn bind_streams(&mut self, vertex_reach: u32) -> Result<(), DrawError> {
        for (stream, binding) in self.streams.iter().enumerate() {
            let Some(binding) = binding else {
                continue;
            };
            let address = binding.buffer.gpu_address(&mut self.frames)?;
            let size = binding
                .stride
                .saturating_mul(vertex_reach)
                .min(binding.buffer.size());
            self.frames
                .command_list()
                .set_vertex_buffer(stream as u32, &address, size, binding.stride);
            self.frames.mark_resource_as_used(Box::new(binding.buffer.clone()));
        }
        Ok(())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    pub fn clear(&mut self, flags: ClearFlags, color: u32, z: f32, stencil: u32) {
        self.resolver.bind_targets(&mut self.frames);
        self.frames.command_list().clear(&ClearRequest {
            flags,
            color: color_to_rgba(color),
            depth: z,
            stencil,
        });
    }

    pub fn present(&mut self) -> Result<(), DrawError> {
        self.frames.submit(true)?;
        Ok(())
    }

    pub fn reset(&mut self, width: u32, height: u32) -> Result<(), DrawError> {
        self.frames.reset(width, height)?;
        self.resolver.set_render_target(None, None);
        self.streams = Default::default();
        self.indices = None;
        Ok(())
    }

    pub fn frames(&self) -> &FrameScheduler {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameScheduler {
        &mut self.frames
    }

    pub fn resolver(&self) -> &DrawStateResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut DrawStateResolver {
        &mut self.resolver
    }
}

fn vertex_count(primitive: PrimitiveType, count: u32) -> Result<u32, DrawError> {
    primitive
        .vertex_count(count)
        .ok_or_else(|| DrawError::InvalidCall(format!("{} {:?} primitives overflow the vertex count", count, primitive)))
}

/// Rewrite `count` fan triangles as a list: triangle i is (0, i+1, i+2).
fn unroll_fan(vertices: &[u8], stride: usize, count: usize) -> Vec<u8> {
    let vertex = |i: usize| &vertices[i * stride..(i + 1) * stride];
    let mut out = Vec::with_capacity(count * 3 * stride);
    for i in 0..count {
        out.extend_from_slice(vertex(0));
        out.extend_from_slice(vertex(i + 1));
        out.extend_from_slice(vertex(i + 2));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_unrolls_around_first_vertex() {
        let vertices: Vec<u8> = (0u8..5).collect();
        let list = unroll_fan(&vertices, 1, 3);
        assert_eq!(list, vec![0, 1, 2, 0, 2, 3, 0, 3, 4]);
    }
}
