// Legacy device state
//
// CPU-side mirror of the legacy fixed-function state: render states, texture
// stage states, transforms, material and lights. Raw values use the legacy
// API's numeric encodings so call sites can forward them untouched.
//
// Also defines the Pod snapshots used as pipeline / pixel-shader cache keys.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::{AddressMode, Filter, PrimitiveTopology, SamplerDesc};

/// Number of texture stages.
pub const MAX_TEXTURE_STAGES: usize = 8;
/// Number of simultaneously enabled lights.
pub const MAX_ACTIVE_LIGHTS: usize = 8;
/// Number of vertex-shader constant registers.
pub const MAX_VS_CONSTANTS: usize = 96;
/// Number of vertex streams.
pub const MAX_VERTEX_STREAMS: usize = 16;

// =============================================================================
// PRIMITIVES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    TriangleList = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
}

impl PrimitiveType {
    /// Vertices consumed by `count` primitives of this type, or `None` when
    /// that does not fit in a `u32`.
    pub fn vertex_count(self, count: u32) -> Option<u32> {
        match self {
            PrimitiveType::PointList => Some(count),
            PrimitiveType::LineList => count.checked_mul(2),
            PrimitiveType::LineStrip => count.checked_add(1),
            PrimitiveType::TriangleList => count.checked_mul(3),
            PrimitiveType::TriangleStrip | PrimitiveType::TriangleFan => count.checked_add(2),
        }
    }

    /// GPU topology, or `None` for fans (no modern equivalent).
    pub fn topology(self) -> Option<PrimitiveTopology> {
        match self {
            PrimitiveType::PointList => Some(PrimitiveTopology::PointList),
            PrimitiveType::LineList => Some(PrimitiveTopology::LineList),
            PrimitiveType::LineStrip => Some(PrimitiveTopology::LineStrip),
            PrimitiveType::TriangleList => Some(PrimitiveTopology::TriangleList),
            PrimitiveType::TriangleStrip => Some(PrimitiveTopology::TriangleStrip),
            PrimitiveType::TriangleFan => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const TARGET = 1 << 0;
        const ZBUFFER = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            min_z: 0.0,
            max_z: 1.0,
        }
    }
}

/// Convert a packed `0xAARRGGBB` colour to normalized RGBA.
pub fn color_to_rgba(argb: u32) -> [f32; 4] {
    let channel = |shift: u32| ((argb >> shift) & 0xFF) as f32 / 255.0;
    [channel(16), channel(8), channel(0), channel(24)]
}

// =============================================================================
// TRANSFORMS, MATERIAL, LIGHTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    World,
    View,
    Projection,
    Texture(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct Transforms {
    pub world: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub texture: [Mat4; MAX_TEXTURE_STAGES],
}

impl Default for Transforms {
    fn default() -> Self {
        Self {
            world: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            texture: [Mat4::IDENTITY; MAX_TEXTURE_STAGES],
        }
    }
}

impl Transforms {
    pub fn get(&self, kind: TransformKind) -> Option<Mat4> {
        match kind {
            TransformKind::World => Some(self.world),
            TransformKind::View => Some(self.view),
            TransformKind::Projection => Some(self.projection),
            TransformKind::Texture(stage) => self.texture.get(stage as usize).copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Material {
    pub diffuse: [f32; 4],
    pub ambient: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub power: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightType {
    Point = 1,
    Spot = 2,
    Directional = 3,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub light_type: LightType,
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    pub ambient: [f32; 4],
    pub position: Vec3,
    pub direction: Vec3,
    pub range: f32,
    pub falloff: f32,
    pub attenuation: [f32; 3],
    pub theta: f32,
    pub phi: f32,
}

impl Default for Light {
    /// The light a legacy device creates when an unknown index is enabled.
    fn default() -> Self {
        Self {
            light_type: LightType::Directional,
            diffuse: [1.0, 1.0, 1.0, 0.0],
            specular: [0.0; 4],
            ambient: [0.0; 4],
            position: Vec3::ZERO,
            direction: Vec3::Z,
            range: 0.0,
            falloff: 0.0,
            attenuation: [0.0; 3],
            theta: 0.0,
            phi: 0.0,
        }
    }
}

// =============================================================================
// RENDER STATES
// =============================================================================

/// Render states understood by the shim, with their legacy numeric ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderStateType {
    ZEnable = 7,
    FillMode = 8,
    ShadeMode = 9,
    ZWriteEnable = 14,
    AlphaTestEnable = 15,
    SrcBlend = 19,
    DestBlend = 20,
    CullMode = 22,
    ZFunc = 23,
    AlphaRef = 24,
    AlphaFunc = 25,
    AlphaBlendEnable = 27,
    SpecularEnable = 29,
    StencilEnable = 52,
    TextureFactor = 60,
    Lighting = 137,
    Ambient = 139,
    ColorVertex = 141,
    NormalizeNormals = 143,
    DiffuseMaterialSource = 145,
    SpecularMaterialSource = 146,
    AmbientMaterialSource = 147,
    EmissiveMaterialSource = 148,
    ColorWriteEnable = 168,
    BlendOp = 171,
}

impl TryFrom<u32> for RenderStateType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use RenderStateType::*;
        Ok(match value {
            7 => ZEnable,
            8 => FillMode,
            9 => ShadeMode,
            14 => ZWriteEnable,
            15 => AlphaTestEnable,
            19 => SrcBlend,
            20 => DestBlend,
            22 => CullMode,
            23 => ZFunc,
            24 => AlphaRef,
            25 => AlphaFunc,
            27 => AlphaBlendEnable,
            29 => SpecularEnable,
            52 => StencilEnable,
            60 => TextureFactor,
            137 => Lighting,
            139 => Ambient,
            141 => ColorVertex,
            143 => NormalizeNormals,
            145 => DiffuseMaterialSource,
            146 => SpecularMaterialSource,
            147 => AmbientMaterialSource,
            148 => EmissiveMaterialSource,
            168 => ColorWriteEnable,
            171 => BlendOp,
            other => return Err(other),
        })
    }
}

pub const CMP_ALWAYS: u32 = 8;
pub const MCS_MATERIAL: u32 = 0;
pub const MCS_COLOR1: u32 = 1;
pub const MCS_COLOR2: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderState {
    pub z_enable: u32,
    pub fill_mode: u32,
    pub shade_mode: u32,
    pub z_write_enable: u32,
    pub alpha_test_enable: u32,
    pub src_blend: u32,
    pub dest_blend: u32,
    pub cull_mode: u32,
    pub z_func: u32,
    pub alpha_ref: u32,
    pub alpha_func: u32,
    pub alpha_blend_enable: u32,
    pub specular_enable: u32,
    pub stencil_enable: u32,
    pub texture_factor: u32,
    pub lighting: u32,
    pub ambient: u32,
    pub color_vertex: u32,
    pub normalize_normals: u32,
    pub diffuse_material_source: u32,
    pub specular_material_source: u32,
    pub ambient_material_source: u32,
    pub emissive_material_source: u32,
    pub color_write_enable: u32,
    pub blend_op: u32,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            z_enable: 0,
            fill_mode: 3,          // solid
            shade_mode: 2,         // gouraud
            z_write_enable: 1,
            alpha_test_enable: 0,
            src_blend: 2,          // one
            dest_blend: 1,         // zero
            cull_mode: 3,          // ccw
            z_func: 4,             // less-equal
            alpha_ref: 0,
            alpha_func: CMP_ALWAYS,
            alpha_blend_enable: 0,
            specular_enable: 0,
            stencil_enable: 0,
            texture_factor: 0xFFFF_FFFF,
            lighting: 1,
            ambient: 0,
            color_vertex: 1,
            normalize_normals: 0,
            diffuse_material_source: MCS_COLOR1,
            specular_material_source: MCS_COLOR2,
            ambient_material_source: MCS_MATERIAL,
            emissive_material_source: MCS_MATERIAL,
            color_write_enable: 0xF,
            blend_op: 1,           // add
        }
    }
}

impl RenderState {
    pub fn get(&self, rs: RenderStateType) -> u32 {
        *self.slot(rs)
    }

    pub fn set(&mut self, rs: RenderStateType, value: u32) {
        *self.slot_mut(rs) = value;
    }

    fn slot(&self, rs: RenderStateType) -> &u32 {
        use RenderStateType::*;
        match rs {
            ZEnable => &self.z_enable,
            FillMode => &self.fill_mode,
            ShadeMode => &self.shade_mode,
            ZWriteEnable => &self.z_write_enable,
            AlphaTestEnable => &self.alpha_test_enable,
            SrcBlend => &self.src_blend,
            DestBlend => &self.dest_blend,
            CullMode => &self.cull_mode,
            ZFunc => &self.z_func,
            AlphaRef => &self.alpha_ref,
            AlphaFunc => &self.alpha_func,
            AlphaBlendEnable => &self.alpha_blend_enable,
            SpecularEnable => &self.specular_enable,
            StencilEnable => &self.stencil_enable,
            TextureFactor => &self.texture_factor,
            Lighting => &self.lighting,
            Ambient => &self.ambient,
            ColorVertex => &self.color_vertex,
            NormalizeNormals => &self.normalize_normals,
            DiffuseMaterialSource => &self.diffuse_material_source,
            SpecularMaterialSource => &self.specular_material_source,
            AmbientMaterialSource => &self.ambient_material_source,
            EmissiveMaterialSource => &self.emissive_material_source,
            ColorWriteEnable => &self.color_write_enable,
            BlendOp => &self.blend_op,
        }
    }

    fn slot_mut(&mut self, rs: RenderStateType) -> &mut u32 {
        use RenderStateType::*;
        match rs {
            ZEnable => &mut self.z_enable,
            FillMode => &mut self.fill_mode,
            ShadeMode => &mut self.shade_mode,
            ZWriteEnable => &mut self.z_write_enable,
            AlphaTestEnable => &mut self.alpha_test_enable,
            SrcBlend => &mut self.src_blend,
            DestBlend => &mut self.dest_blend,
            CullMode => &mut self.cull_mode,
            ZFunc => &mut self.z_func,
            AlphaRef => &mut self.alpha_ref,
            AlphaFunc => &mut self.alpha_func,
            AlphaBlendEnable => &mut self.alpha_blend_enable,
            SpecularEnable => &mut self.specular_enable,
            StencilEnable => &mut self.stencil_enable,
            TextureFactor => &mut self.texture_factor,
            Lighting => &mut self.lighting,
            Ambient => &mut self.ambient,
            ColorVertex => &mut self.color_vertex,
            NormalizeNormals => &mut self.normalize_normals,
            DiffuseMaterialSource => &mut self.diffuse_material_source,
            SpecularMaterialSource => &mut self.specular_material_source,
            AmbientMaterialSource => &mut self.ambient_material_source,
            EmissiveMaterialSource => &mut self.emissive_material_source,
            ColorWriteEnable => &mut self.color_write_enable,
            BlendOp => &mut self.blend_op,
        }
    }

    /// Material sources as the lighting shader sees them: vertex colours are
    /// ignored unless COLORVERTEX is on.
    pub fn effective_material_sources(&self) -> [u32; 3] {
        if self.color_vertex != 0 {
            [
                self.diffuse_material_source,
                self.ambient_material_source,
                self.specular_material_source,
            ]
        } else {
            [MCS_MATERIAL; 3]
        }
    }
}

// =============================================================================
// TEXTURE STAGE STATES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureStageStateType {
    ColorOp = 1,
    ColorArg1 = 2,
    ColorArg2 = 3,
    AlphaOp = 4,
    AlphaArg1 = 5,
    AlphaArg2 = 6,
    TexCoordIndex = 11,
    AddressU = 13,
    AddressV = 14,
    BorderColor = 15,
    MagFilter = 16,
    MinFilter = 17,
    MipFilter = 18,
    MipMapLodBias = 19,
    MaxAnisotropy = 21,
    TextureTransformFlags = 24,
    AddressW = 25,
}

impl TextureStageStateType {
    /// Whether a change feeds the sampler object rather than the shader.
    pub fn affects_sampler(self) -> bool {
        use TextureStageStateType::*;
        matches!(
            self,
            AddressU
                | AddressV
                | AddressW
                | BorderColor
                | MagFilter
                | MinFilter
                | MipFilter
                | MipMapLodBias
                | MaxAnisotropy
        )
    }
}

pub const TOP_DISABLE: u32 = 1;
pub const TOP_SELECTARG1: u32 = 2;
pub const TOP_MODULATE: u32 = 4;
pub const TA_DIFFUSE: u32 = 0;
pub const TA_CURRENT: u32 = 1;
pub const TA_TEXTURE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureStageState {
    pub color_op: u32,
    pub color_arg1: u32,
    pub color_arg2: u32,
    pub alpha_op: u32,
    pub alpha_arg1: u32,
    pub alpha_arg2: u32,
    pub texcoord_index: u32,
    pub address_u: u32,
    pub address_v: u32,
    pub address_w: u32,
    pub border_color: u32,
    pub mag_filter: u32,
    pub min_filter: u32,
    pub mip_filter: u32,
    /// Raw bits of the f32 LOD bias.
    pub mip_lod_bias: u32,
    pub max_anisotropy: u32,
    pub transform_flags: u32,
}

impl TextureStageState {
    /// Default state for `stage`: stage 0 modulates, the rest are disabled.
    pub fn for_stage(stage: usize) -> Self {
        let (color_op, alpha_op) = if stage == 0 {
            (TOP_MODULATE, TOP_SELECTARG1)
        } else {
            (TOP_DISABLE, TOP_DISABLE)
        };
        Self {
            color_op,
            color_arg1: TA_TEXTURE,
            color_arg2: TA_CURRENT,
            alpha_op,
            alpha_arg1: TA_TEXTURE,
            alpha_arg2: TA_CURRENT,
            texcoord_index: stage as u32,
            address_u: 1,
            address_v: 1,
            address_w: 1,
            border_color: 0,
            mag_filter: 1,
            min_filter: 1,
            mip_filter: 0,
            mip_lod_bias: 0,
            max_anisotropy: 1,
            transform_flags: 0,
        }
    }

    pub fn set(&mut self, ty: TextureStageStateType, value: u32) {
        use TextureStageStateType::*;
        let slot = match ty {
            ColorOp => &mut self.color_op,
            ColorArg1 => &mut self.color_arg1,
            ColorArg2 => &mut self.color_arg2,
            AlphaOp => &mut self.alpha_op,
            AlphaArg1 => &mut self.alpha_arg1,
            AlphaArg2 => &mut self.alpha_arg2,
            TexCoordIndex => &mut self.texcoord_index,
            AddressU => &mut self.address_u,
            AddressV => &mut self.address_v,
            AddressW => &mut self.address_w,
            BorderColor => &mut self.border_color,
            MagFilter => &mut self.mag_filter,
            MinFilter => &mut self.min_filter,
            MipFilter => &mut self.mip_filter,
            MipMapLodBias => &mut self.mip_lod_bias,
            MaxAnisotropy => &mut self.max_anisotropy,
            TextureTransformFlags => &mut self.transform_flags,
        };
        *slot = value;
    }

    pub fn sampler_desc(&self) -> SamplerDesc {
        SamplerDesc {
            address_u: address_mode(self.address_u),
            address_v: address_mode(self.address_v),
            address_w: address_mode(self.address_w),
            mag_filter: filter(self.mag_filter),
            min_filter: filter(self.min_filter),
            mip_filter: filter(self.mip_filter),
            mip_lod_bias_bits: self.mip_lod_bias,
            max_anisotropy: self.max_anisotropy.clamp(1, 16),
            border_color: self.border_color,
        }
    }
}

fn address_mode(raw: u32) -> AddressMode {
    match raw {
        2 => AddressMode::Mirror,
        3 => AddressMode::Clamp,
        4 => AddressMode::Border,
        _ => AddressMode::Wrap,
    }
}

fn filter(raw: u32) -> Filter {
    match raw {
        0 => Filter::None,
        2 => Filter::Linear,
        3 => Filter::Anisotropic,
        _ => Filter::Point,
    }
}

// =============================================================================
// CACHE KEYS
// =============================================================================

/// Canonical snapshot of everything that selects a pipeline-state object.
///
/// Fields that only feed constant buffers (texture factor, ambient colour,
/// material sources) are left out so they never split the cache.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PipelineKey {
    pub vertex_shader: u64,
    pub pixel_shader: u64,
    pub vertex_layout: u64,
    pub topology: u32,
    pub depth_format: u32,
    pub z_enable: u32,
    pub z_write_enable: u32,
    pub z_func: u32,
    pub fill_mode: u32,
    pub cull_mode: u32,
    pub alpha_blend_enable: u32,
    pub src_blend: u32,
    pub dest_blend: u32,
    pub blend_op: u32,
    pub color_write_enable: u32,
    pub stencil_enable: u32,
    pub color_format: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StageKey {
    pub color_op: u32,
    pub color_arg1: u32,
    pub color_arg2: u32,
    pub alpha_op: u32,
    pub alpha_arg1: u32,
    pub alpha_arg2: u32,
    pub texcoord_index: u32,
    pub transform_flags: u32,
}

/// Everything the fixed-function pixel-shader generator reads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PixelShaderKey {
    pub stages: [StageKey; MAX_TEXTURE_STAGES],
    pub color_vertex: u32,
    pub diffuse_material_source: u32,
    pub stage_has_texture: u32,
    /// Effective alpha test; `CMP_ALWAYS` when alpha testing is off.
    pub alpha_func: u32,
}

impl PixelShaderKey {
    /// Build a canonical key. Stages past the first inactive one are left zeroed
    /// apart from their disabled colour op.
    pub fn new(
        rs: &RenderState,
        stages: &[TextureStageState; MAX_TEXTURE_STAGES],
        stage_has_texture: &[bool; MAX_TEXTURE_STAGES],
    ) -> Self {
        let mut key = Self::zeroed();
        key.color_vertex = rs.color_vertex;
        key.diffuse_material_source = rs.diffuse_material_source;
        key.alpha_func = if rs.alpha_test_enable != 0 {
            rs.alpha_func
        } else {
            CMP_ALWAYS
        };

        for (i, stage) in stages.iter().enumerate() {
            let has_texture = stage_has_texture[i];
            if stage.color_op == TOP_DISABLE || (stage.color_arg1 == TA_TEXTURE && !has_texture) {
                key.stages[i].color_op = TOP_DISABLE;
                break;
            }
            if has_texture {
                key.stage_has_texture |= 1 << i;
            }
            key.stages[i] = StageKey {
                color_op: stage.color_op,
                color_arg1: stage.color_arg1,
                color_arg2: stage.color_arg2,
                alpha_op: stage.alpha_op,
                alpha_arg1: if stage.alpha_arg1 == TA_TEXTURE && !has_texture {
                    TA_DIFFUSE
                } else {
                    stage.alpha_arg1
                },
                alpha_arg2: stage.alpha_arg2,
                texcoord_index: stage.texcoord_index,
                transform_flags: stage.transform_flags,
            };
        }
        key
    }

    /// Number of stages the generated shader evaluates.
    pub fn active_stages(&self) -> usize {
        self.stages
            .iter()
            .take_while(|s| s.color_op != TOP_DISABLE && s.color_op != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_counts_follow_primitive_rules() {
        assert_eq!(PrimitiveType::LineList.vertex_count(4), Some(8));
        assert_eq!(PrimitiveType::TriangleList.vertex_count(2), Some(6));
        assert_eq!(PrimitiveType::TriangleStrip.vertex_count(2), Some(4));
        assert_eq!(PrimitiveType::LineStrip.vertex_count(3), Some(4));
        assert_eq!(PrimitiveType::TriangleList.vertex_count(u32::MAX / 2), None);
        assert_eq!(PrimitiveType::TriangleFan.vertex_count(u32::MAX - 1), None);
        assert_eq!(PrimitiveType::TriangleFan.topology(), None);
    }

    #[test]
    fn argb_colour_unpacks_to_rgba() {
        assert_eq!(color_to_rgba(0xFF00_00FF), [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(color_to_rgba(0x00FF_0000), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn render_state_round_trips_through_raw_ids() {
        let mut rs = RenderState::default();
        let ty = RenderStateType::try_from(60).unwrap();
        rs.set(ty, 0x8040_2010);
        assert_eq!(rs.texture_factor, 0x8040_2010);
        assert_eq!(RenderStateType::try_from(9999), Err(9999));
    }

    #[test]
    fn pixel_key_ignores_stages_after_first_disabled() {
        let rs = RenderState::default();
        let mut stages: [TextureStageState; MAX_TEXTURE_STAGES] =
            std::array::from_fn(TextureStageState::for_stage);
        let textures = [true; MAX_TEXTURE_STAGES];

        let baseline = PixelShaderKey::new(&rs, &stages, &textures);
        // Stage 2 sits behind disabled stage 1, so changing it must not matter.
        stages[2].color_op = TOP_MODULATE;
        stages[2].color_arg2 = 7;
        let changed = PixelShaderKey::new(&rs, &stages, &textures);

        assert_eq!(baseline, changed);
        assert_eq!(baseline.active_stages(), 1);
    }

    #[test]
    fn pixel_key_disables_texture_stage_without_texture() {
        let rs = RenderState::default();
        let stages: [TextureStageState; MAX_TEXTURE_STAGES] =
            std::array::from_fn(TextureStageState::for_stage);
        let key = PixelShaderKey::new(&rs, &stages, &[false; MAX_TEXTURE_STAGES]);
        assert_eq!(key.stages[0].color_op, TOP_DISABLE);
        assert_eq!(key.stage_has_texture, 0);
    }

    #[test]
    fn sampler_desc_decodes_legacy_values() {
        let mut stage = TextureStageState::for_stage(0);
        stage.set(TextureStageStateType::AddressU, 3);
        stage.set(TextureStageStateType::MinFilter, 2);
        stage.set(TextureStageStateType::MaxAnisotropy, 64);
        let desc = stage.sampler_desc();
        assert_eq!(desc.address_u, AddressMode::Clamp);
        assert_eq!(desc.min_filter, Filter::Linear);
        assert_eq!(desc.max_anisotropy, 16);
    }
}
