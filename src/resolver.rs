// Draw-state resolver
//
// Legacy setters only touch CPU state and flip dirty bits. Right before a
// draw, every stale category is recomputed and written through a Discard lock
// of its own dynamic constant buffer, so each draw reads exactly the state
// that was current when it was recorded. Pipeline objects, generated shaders
// and samplers are memoized behind canonical Pod keys.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::backend::{
    BufferUsage, ConstantSlot, GpuDevice, GpuTexture, PipelineDesc, PipelineState, PrimitiveTopology,
    RenderTargets, ResourceId, SamplerDesc, SamplerHandle, TextureFormat,
};
use crate::error::{DeviceError, DrawError};
use crate::frame::FrameScheduler;
use crate::ring::align_up;
use crate::shaders::{ShaderBlob, ShaderGenerator, VertexShader};
use crate::state::{
    color_to_rgba, Light, Material, PipelineKey, PixelShaderKey, RenderState,
    RenderStateType, TextureStageState, TextureStageStateType, TransformKind, Transforms, Viewport,
    MAX_ACTIVE_LIGHTS, MAX_TEXTURE_STAGES, MAX_VS_CONSTANTS,
};
use crate::streaming::{LockMode, StreamingBuffer, StreamingBufferDesc};

bitflags! {
    /// State categories whose GPU copy is stale.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const TARGETS = 1 << 0;
        const TRANSFORMS = 1 << 1;
        const VS_CONSTANTS = 1 << 2;
        const PS_CONSTANTS = 1 << 3;
        const LIGHTS = 1 << 4;
        const TEXTURES = 1 << 5;
        const SAMPLERS = 1 << 6;
    }
}

// =============================================================================
// CONSTANT BUFFER LAYOUTS
// =============================================================================

/// Matrices use glam's column-vector convention (`clip = proj * view * world * v`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VertexTransforms {
    pub world_view_proj: [[f32; 4]; 4],
    pub world_view: [[f32; 4]; 4],
    pub camera_position: [f32; 3],
    pub _pad: f32,
}

impl VertexTransforms {
    pub fn from_transforms(t: &Transforms) -> Self {
        let world_view = t.view * t.world;
        let camera = t.view.inverse().w_axis;
        Self {
            world_view_proj: (t.projection * world_view).to_cols_array_2d(),
            world_view: world_view.to_cols_array_2d(),
            camera_position: [camera.x, camera.y, camera.z],
            _pad: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VertexShaderConstants {
    pub registers: [[f32; 4]; MAX_VS_CONSTANTS],
}

/// One light, already transformed into view space.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShaderLight {
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub ambient: [f32; 4],
    pub position: [f32; 3],
    pub light_type: u32,
    pub direction: [f32; 3],
    pub range: f32,
    pub falloff: f32,
    pub attenuation: [f32; 3],
    pub theta: f32,
    pub phi: f32,
    pub _pad: [f32; 2],
}

impl ShaderLight {
    pub fn from_light(light: &Light, view: &Mat4) -> Self {
        let position = view.transform_point3(light.position);
        let direction = view.transform_vector3(light.direction);
        Self {
            diffuse: light.diffuse,
            specular: light.specular,
            ambient: light.ambient,
            position: position.to_array(),
            light_type: light.light_type as u32,
            direction: direction.to_array(),
            range: light.range,
            falloff: light.falloff,
            attenuation: light.attenuation,
            theta: light.theta,
            phi: light.phi,
            _pad: [0.0; 2],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightConstants {
    pub lights: [ShaderLight; MAX_ACTIVE_LIGHTS],
    pub num_lights: u32,
    pub diffuse_source: u32,
    pub ambient_source: u32,
    pub specular_source: u32,
    pub specular_enable: u32,
    pub _pad: [u32; 3],
    pub global_ambient: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PixelConstants {
    pub diffuse: [f32; 4],
    pub ambient: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub power: f32,
    pub alpha_ref: f32,
    pub _pad: [f32; 2],
    pub texture_factor: [f32; 4],
}

// =============================================================================
// CACHES
// =============================================================================

/// Map key comparing and hashing a Pod value by its bytes (xxh3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PodKey<K>(K);

impl<K: Pod> Hash for PodKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(xxhash_rust::xxh3::xxh3_64(bytemuck::bytes_of(&self.0)));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub pipelines: CacheCounters,
    pub pixel_shaders: CacheCounters,
    pub vertex_shaders: CacheCounters,
    pub samplers: CacheCounters,
    /// Constant-buffer uploads performed.
    pub uploads: u64,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub pipeline_cache: bool,
    pub pixel_shader_cache: bool,
    pub sampler_cache: bool,
    pub defer_discard: bool,
    pub depth_format: Option<TextureFormat>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            pipeline_cache: true,
            pixel_shader_cache: true,
            sampler_cache: true,
            defer_discard: true,
            depth_format: None,
        }
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

pub struct DrawStateResolver {
    device: Arc<dyn GpuDevice>,
    shaders: Box<dyn ShaderGenerator>,
    config: ResolverConfig,

    dirty: DirtyFlags,
    epoch: Option<u64>,

    render_state: RenderState,
    stages: [TextureStageState; MAX_TEXTURE_STAGES],
    textures: [Option<Arc<dyn GpuTexture>>; MAX_TEXTURE_STAGES],
    transforms: Transforms,
    material: Material,
    lights: BTreeMap<u32, Light>,
    enabled_lights: Vec<u32>,
    vs_constants: Box<VertexShaderConstants>,
    render_target: Option<Arc<dyn GpuTexture>>,
    depth_stencil: Option<Arc<dyn GpuTexture>>,
    viewport: Option<Viewport>,
    fvf: u32,
    vertex_shader: Option<VertexShader>,

    constant_buffers: [StreamingBuffer; 4],
    constant_sizes: [u32; 4],

    pipelines: HashMap<PodKey<PipelineKey>, Arc<dyn PipelineState>>,
    pixel_shaders: HashMap<PodKey<PixelShaderKey>, Arc<ShaderBlob>>,
    vertex_shaders: HashMap<u32, VertexShader>,
    samplers: HashMap<SamplerDesc, SamplerHandle>,
    bound_pipeline: Option<ResourceId>,
    stats: ResolverStats,
}

impl DrawStateResolver {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        shaders: Box<dyn ShaderGenerator>,
        config: ResolverConfig,
    ) -> Result<Self, DeviceError> {
        let constant_sizes = [
            std::mem::size_of::<VertexTransforms>() as u32,
            std::mem::size_of::<VertexShaderConstants>() as u32,
            std::mem::size_of::<LightConstants>() as u32,
            std::mem::size_of::<PixelConstants>() as u32,
        ];
        let labels = ["transforms cb", "vs constants cb", "lights cb", "pixel cb"];

        let mut buffers = Vec::with_capacity(4);
        for (label, size) in labels.iter().zip(constant_sizes) {
            let desc = StreamingBufferDesc::new(*label, align_up(size, 256) as u32, BufferUsage::CONSTANT)
                .dynamic(true)
                .defer_discard(config.defer_discard);
            buffers.push(StreamingBuffer::new(device.as_ref(), &desc)?);
        }
        let constant_buffers: [StreamingBuffer; 4] = buffers
            .try_into()
            .map_err(|_| DeviceError::InvalidParameters("constant buffer setup".into()))?;

        Ok(Self {
            device,
            shaders,
            config,
            dirty: DirtyFlags::all(),
            epoch: None,
            render_state: RenderState::default(),
            stages: std::array::from_fn(TextureStageState::for_stage),
            textures: Default::default(),
            transforms: Transforms::default(),
            material: Material::default(),
            lights: BTreeMap::new(),
            enabled_lights: Vec::new(),
            vs_constants: Box::new(VertexShaderConstants::zeroed()),
            render_target: None,
            depth_stencil: None,
            viewport: None,
            fvf: 0,
            vertex_shader: None,
            constant_buffers,
            constant_sizes,
            pipelines: HashMap::new(),
            pixel_shaders: HashMap::new(),
            vertex_shaders: HashMap::new(),
            samplers: HashMap::new(),
            bound_pipeline: None,
            stats: ResolverStats::default(),
        })
    }

    // =========================================================================
    // SETTERS
    // =========================================================================

    pub fn set_transform(&mut self, kind: TransformKind, matrix: Mat4) -> Result<(), DrawError> {
        match kind {
            TransformKind::World => self.transforms.world = matrix,
            TransformKind::View => {
                self.transforms.view = matrix;
                // Lights are uploaded in view space.
                self.dirty |= DirtyFlags::LIGHTS;
            }
            TransformKind::Projection => self.transforms.projection = matrix,
            TransformKind::Texture(stage) => {
                let slot = self
                    .transforms
                    .texture
                    .get_mut(stage as usize)
                    .ok_or_else(|| DrawError::InvalidCall(format!("texture transform {}", stage)))?;
                *slot = matrix;
            }
        }
        self.dirty |= DirtyFlags::TRANSFORMS;
        Ok(())
    }

    pub fn set_material(&mut self, material: Material) {
        self.material = material;
        self.dirty |= DirtyFlags::PS_CONSTANTS;
    }

    pub fn set_light(&mut self, index: u32, light: Light) {
        self.lights.insert(index, light);
        if self.enabled_lights.contains(&index) {
            self.dirty |= DirtyFlags::LIGHTS;
        }
    }

    pub fn light_enable(&mut self, index: u32, enable: bool) -> Result<(), DrawError> {
        self.lights.entry(index).or_default();
        let position = self.enabled_lights.iter().position(|&i| i == index);
        match (enable, position) {
            (true, None) => {
                if self.enabled_lights.len() >= MAX_ACTIVE_LIGHTS {
                    return Err(DrawError::InvalidCall(format!(
                        "cannot enable light {}: {} lights already active",
                        index, MAX_ACTIVE_LIGHTS
                    )));
                }
                self.enabled_lights.push(index);
            }
            (false, Some(at)) => {
                self.enabled_lights.remove(at);
            }
            _ => {}
        }
        self.dirty |= DirtyFlags::LIGHTS;
        Ok(())
    }

    pub fn set_render_state(&mut self, rs: RenderStateType, value: u32) {
        self.render_state.set(rs, value);
        use RenderStateType::*;
        match rs {
            TextureFactor | AlphaRef => self.dirty |= DirtyFlags::PS_CONSTANTS,
            ColorVertex | DiffuseMaterialSource | AmbientMaterialSource | SpecularMaterialSource
            | EmissiveMaterialSource | Ambient | SpecularEnable | NormalizeNormals | Lighting => {
                self.dirty |= DirtyFlags::LIGHTS
            }
            // Everything else only feeds the pipeline key, rebuilt per draw.
            _ => {}
        }
    }

    pub fn set_texture_stage_state(
        &mut self,
        stage: usize,
        ty: TextureStageStateType,
        value: u32,
    ) -> Result<(), DrawError> {
        let state = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| DrawError::InvalidCall(format!("texture stage {}", stage)))?;
        state.set(ty, value);
        if ty.affects_sampler() {
            self.dirty |= DirtyFlags::SAMPLERS;
        }
        Ok(())
    }

    pub fn set_texture(&mut self, stage: usize, texture: Option<Arc<dyn GpuTexture>>) -> Result<(), DrawError> {
        let slot = self
            .textures
            .get_mut(stage)
            .ok_or_else(|| DrawError::InvalidCall(format!("texture stage {}", stage)))?;
        *slot = texture;
        self.dirty |= DirtyFlags::TEXTURES;
        Ok(())
    }

    pub fn set_vertex_shader_constant(&mut self, start_register: usize, data: &[[f32; 4]]) -> Result<(), DrawError> {
        let end = start_register + data.len();
        if end > MAX_VS_CONSTANTS {
            return Err(DrawError::InvalidCall(format!(
                "vertex shader constants {}..{} exceed {} registers",
                start_register, end, MAX_VS_CONSTANTS
            )));
        }
        self.vs_constants.registers[start_register..end].copy_from_slice(data);
        self.dirty |= DirtyFlags::VS_CONSTANTS;
        Ok(())
    }

    /// Render into `color` instead of the back buffer (`None` restores it).
    pub fn set_render_target(&mut self, color: Option<Arc<dyn GpuTexture>>, depth: Option<Arc<dyn GpuTexture>>) {
        self.render_target = color;
        self.depth_stencil = depth;
        self.viewport = None;
        self.dirty |= DirtyFlags::TARGETS;
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        self.dirty |= DirtyFlags::TARGETS;
    }

    /// Select the fixed-function vertex pipeline for `fvf`.
    pub fn set_fvf(&mut self, fvf: u32) {
        self.fvf = fvf;
        self.vertex_shader = None;
    }

    /// Bind a programmable vertex shader; it takes precedence over the FVF.
    pub fn set_vertex_shader(&mut self, shader: Option<VertexShader>) {
        self.vertex_shader = shader;
    }

    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats.clone()
    }

    pub fn render_state(&self) -> &RenderState {
        &self.render_state
    }

    pub fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    pub fn enabled_lights(&self) -> &[u32] {
        &self.enabled_lights
    }

    pub fn fvf(&self) -> u32 {
        self.fvf
    }

    /// Viewport the next draw will use.
    pub fn viewport(&self, frames: &FrameScheduler) -> Viewport {
        self.viewport.unwrap_or_else(|| {
            let (width, height) = match &self.render_target {
                Some(target) => target.extent(),
                None => frames.extent(),
            };
            Viewport::full(width, height)
        })
    }

    pub fn constant_buffer(&self, slot: ConstantSlot) -> &StreamingBuffer {
        &self.constant_buffers[slot.index()]
    }

    /// Vertex shader the next draw will use.
    pub fn current_vertex_shader(&mut self) -> Result<VertexShader, DrawError> {
        if let Some(shader) = &self.vertex_shader {
            return Ok(shader.clone());
        }
        if self.fvf == 0 {
            return Err(DrawError::MissingVertexShader);
        }
        if let Some(shader) = self.vertex_shaders.get(&self.fvf) {
            self.stats.vertex_shaders.hits += 1;
            return Ok(shader.clone());
        }
        self.stats.vertex_shaders.misses += 1;
        let shader = self.shaders.fixed_function_vertex_shader(self.fvf)?;
        self.vertex_shaders.insert(self.fvf, shader.clone());
        Ok(shader)
    }

    // =========================================================================
    // PREPARE DRAW
    // =========================================================================

    /// Flush every stale category and bind pipeline and constants for a draw
    /// with `topology`.
    pub fn prepare_draw(&mut self, frames: &mut FrameScheduler, topology: PrimitiveTopology) -> Result<(), DrawError> {
        self.bind_targets(frames);
        let vertex_shader = self.current_vertex_shader()?;
        let dirty = self.dirty;

        // ─── Constants ───
        if dirty.contains(DirtyFlags::TRANSFORMS) {
            let data = VertexTransforms::from_transforms(&self.transforms);
            self.upload(frames, ConstantSlot::Transforms, &data)?;
        }
        if dirty.contains(DirtyFlags::VS_CONSTANTS) {
            let data = *self.vs_constants;
            self.upload(frames, ConstantSlot::VertexConstants, &data)?;
        }
        if dirty.contains(DirtyFlags::LIGHTS) {
            let data = self.light_constants();
            self.upload(frames, ConstantSlot::Lights, &data)?;
        }
        if dirty.contains(DirtyFlags::PS_CONSTANTS) {
            let data = self.pixel_constants();
            self.upload(frames, ConstantSlot::Pixel, &data)?;
        }

        // ─── Textures & samplers ───
        if dirty.contains(DirtyFlags::TEXTURES) {
            for (stage, texture) in self.textures.iter().enumerate() {
                let descriptor = texture.as_ref().map(|t| t.descriptor());
                frames.command_list().set_texture(stage as u32, descriptor);
                if let Some(texture) = texture {
                    frames.mark_resource_as_used(Box::new(texture.clone()));
                }
            }
        }
        if dirty.contains(DirtyFlags::SAMPLERS) {
            for stage in 0..MAX_TEXTURE_STAGES {
                let sampler = self.sampler(&self.stages[stage].sampler_desc())?;
                frames.command_list().set_sampler(stage as u32, sampler);
            }
        }
        self.dirty = DirtyFlags::empty();

        // ─── Pipeline ───
        let pipeline = self.pipeline(frames, &vertex_shader, topology)?;
        if self.bound_pipeline != Some(pipeline.id()) {
            frames.command_list().set_pipeline(&pipeline);
            self.bound_pipeline = Some(pipeline.id());
        }

        for slot in ConstantSlot::ALL {
            let address = self.constant_buffers[slot.index()].gpu_address(frames)?;
            frames
                .command_list()
                .set_constant_buffer(slot, &address, self.constant_sizes[slot.index()]);
        }
        Ok(())
    }

    /// Notice a fresh command list and rebind the render targets if stale.
    pub fn bind_targets(&mut self, frames: &mut FrameScheduler) {
        if self.epoch != Some(frames.epoch()) {
            // Nothing recorded into the previous list is bound any more.
            self.epoch = Some(frames.epoch());
            self.dirty = DirtyFlags::all();
            self.bound_pipeline = None;
        }

        if self.dirty.contains(DirtyFlags::TARGETS) {
            let targets = RenderTargets {
                color: self.color_target(frames),
                depth: self.depth_stencil.clone(),
                viewport: self.viewport(frames),
            };
            frames.command_list().set_render_targets(&targets);
            self.dirty.remove(DirtyFlags::TARGETS);
        }
    }

    fn color_target(&self, frames: &FrameScheduler) -> Arc<dyn GpuTexture> {
        self.render_target.clone().unwrap_or_else(|| frames.back_buffer())
    }

    fn upload<T: Pod>(&mut self, frames: &mut FrameScheduler, slot: ConstantSlot, data: &T) -> Result<(), DrawError> {
        let bytes = bytemuck::bytes_of(data);
        let buffer = &self.constant_buffers[slot.index()];
        let mut lock = buffer.lock(frames, 0, bytes.len() as u32, LockMode::Discard)?;
        lock.copy_from_slice(bytes);
        self.stats.uploads += 1;
        Ok(())
    }

    fn light_constants(&self) -> LightConstants {
        let rs = &self.render_state;
        let mut constants = LightConstants::zeroed();
        if rs.lighting != 0 {
            for (slot, index) in self.enabled_lights.iter().enumerate() {
                if let Some(light) = self.lights.get(index) {
                    constants.lights[slot] = ShaderLight::from_light(light, &self.transforms.view);
                    constants.num_lights += 1;
                }
            }
        }
        let [diffuse, ambient, specular] = rs.effective_material_sources();
        constants.diffuse_source = diffuse;
        constants.ambient_source = ambient;
        constants.specular_source = specular;
        constants.specular_enable = rs.specular_enable;
        constants.global_ambient = color_to_rgba(rs.ambient);
        constants
    }

    fn pixel_constants(&self) -> PixelConstants {
        let m = &self.material;
        PixelConstants {
            diffuse: m.diffuse,
            ambient: m.ambient,
            specular: m.specular,
            emissive: m.emissive,
            power: m.power,
            alpha_ref: (self.render_state.alpha_ref & 0xFF) as f32 / 255.0,
            _pad: [0.0; 2],
            texture_factor: color_to_rgba(self.render_state.texture_factor),
        }
    }

    fn sampler(&mut self, desc: &SamplerDesc) -> Result<SamplerHandle, DrawError> {
        if self.config.sampler_cache {
            if let Some(handle) = self.samplers.get(desc) {
                self.stats.samplers.hits += 1;
                return Ok(*handle);
            }
        }
        self.stats.samplers.misses += 1;
        let handle = self.device.create_sampler(desc)?;
        if self.config.sampler_cache {
            self.samplers.insert(*desc, handle);
        }
        Ok(handle)
    }

    fn pixel_shader(&mut self) -> Result<Arc<ShaderBlob>, DrawError> {
        let has_texture: [bool; MAX_TEXTURE_STAGES] = std::array::from_fn(|i| self.textures[i].is_some());
        let key = PixelShaderKey::new(&self.render_state, &self.stages, &has_texture);

        if self.config.pixel_shader_cache {
            if let Some(shader) = self.pixel_shaders.get(&PodKey(key)) {
                self.stats.pixel_shaders.hits += 1;
                return Ok(shader.clone());
            }
        }
        self.stats.pixel_shaders.misses += 1;
        let shader = self.shaders.fixed_function_pixel_shader(&key)?;
        if self.config.pixel_shader_cache {
            self.pixel_shaders.insert(PodKey(key), shader.clone());
        }
        Ok(shader)
    }

    fn pipeline(
        &mut self,
        frames: &FrameScheduler,
        vertex_shader: &VertexShader,
        topology: PrimitiveTopology,
    ) -> Result<Arc<dyn PipelineState>, DrawError> {
        let pixel_shader = self.pixel_shader()?;
        let color_format = self.color_target(frames).format();
        let depth_format = self
            .depth_stencil
            .as_ref()
            .map(|d| d.format())
            .or(self.config.depth_format);

        let rs = &self.render_state;
        let key = PipelineKey {
            vertex_shader: vertex_shader.blob.id.0,
            pixel_shader: pixel_shader.id.0,
            vertex_layout: vertex_shader.layout.hash,
            topology: topology as u32,
            depth_format: depth_format.map_or(0, |f| f as u32 + 1),
            z_enable: rs.z_enable,
            z_write_enable: rs.z_write_enable,
            z_func: rs.z_func,
            fill_mode: rs.fill_mode,
            cull_mode: rs.cull_mode,
            alpha_blend_enable: rs.alpha_blend_enable,
            src_blend: rs.src_blend,
            dest_blend: rs.dest_blend,
            blend_op: rs.blend_op,
            color_write_enable: rs.color_write_enable,
            stencil_enable: rs.stencil_enable,
            color_format: color_format as u32,
        };

        if self.config.pipeline_cache {
            if let Some(pipeline) = self.pipelines.get(&PodKey(key)) {
                self.stats.pipelines.hits += 1;
                return Ok(pipeline.clone());
            }
        }

        self.stats.pipelines.misses += 1;
        log::debug!("Building pipeline for {:?} (vs {}, ps {})", topology, key.vertex_shader, key.pixel_shader);
        let pipeline = self.device.create_pipeline(&PipelineDesc {
            key,
            topology,
            vertex_shader: vertex_shader.blob.clone(),
            pixel_shader,
            vertex_layout: vertex_shader.layout.clone(),
            color_format,
            depth_format,
        })?;
        if self.config.pipeline_cache {
            self.pipelines.insert(PodKey(key), pipeline.clone());
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LightType;
    use glam::Vec3;

    #[test]
    fn constant_layouts_match_shader_expectations() {
        assert_eq!(std::mem::size_of::<VertexTransforms>(), 144);
        assert_eq!(std::mem::size_of::<ShaderLight>(), 112);
        assert_eq!(std::mem::size_of::<LightConstants>(), 112 * 8 + 48);
        assert_eq!(std::mem::size_of::<PixelConstants>(), 96);
        assert_eq!(std::mem::size_of::<VertexShaderConstants>(), 96 * 16);
    }

    #[test]
    fn lights_are_uploaded_in_view_space() {
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let light = Light {
            light_type: LightType::Point,
            position: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        let shader = ShaderLight::from_light(&light, &view);
        assert_eq!(shader.position, [1.0, 2.0, -2.0]);
        assert_eq!(shader.light_type, 1);
        // Directions ignore translation.
        assert_eq!(shader.direction, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn camera_position_comes_from_inverse_view() {
        let transforms = Transforms {
            view: Mat4::from_translation(Vec3::new(-1.0, -2.0, -3.0)),
            ..Default::default()
        };
        let data = VertexTransforms::from_transforms(&transforms);
        assert_eq!(data.camera_position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn pod_keys_hash_by_bytes() {
        use std::collections::hash_map::DefaultHasher;
        let hash = |k: &PodKey<PipelineKey>| {
            let mut h = DefaultHasher::new();
            k.hash(&mut h);
            h.finish()
        };
        let a = PodKey(PipelineKey::zeroed());
        let mut b = a;
        assert_eq!(hash(&a), hash(&b));
        b.0.cull_mode = 1;
        assert_ne!(hash(&a), hash(&b));
    }
}
