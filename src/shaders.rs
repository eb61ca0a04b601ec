// Shader plumbing
//
// Shader translation and fixed-function shader generation live outside this
// crate; this module defines the seam (ShaderGenerator), the blob and layout
// types that flow through it, and the FVF decoder that turns a legacy
// flexible-vertex-format code into an input layout.

use std::sync::Arc;

use crate::backend::ResourceId;
use crate::error::DeviceError;
use crate::state::PixelShaderKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// Compiled shader code (SPIR-V for the Vulkan backend, opaque otherwise).
#[derive(Debug)]
pub struct ShaderBlob {
    pub id: ResourceId,
    pub stage: ShaderStage,
    pub label: String,
    pub code: Vec<u8>,
}

impl ShaderBlob {
    pub fn new(stage: ShaderStage, label: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            id: ResourceId::next(),
            stage,
            label: label.into(),
            code,
        }
    }
}

// =============================================================================
// VERTEX LAYOUT
// =============================================================================

pub const FVF_XYZ: u32 = 0x002;
pub const FVF_XYZRHW: u32 = 0x004;
pub const FVF_POSITION_MASK: u32 = 0x00E;
pub const FVF_NORMAL: u32 = 0x010;
pub const FVF_DIFFUSE: u32 = 0x040;
pub const FVF_SPECULAR: u32 = 0x080;
pub const FVF_TEXCOUNT_MASK: u32 = 0xF00;
pub const FVF_TEXCOUNT_SHIFT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Diffuse,
    Specular,
    TexCoord(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float2,
    Float3,
    Float4,
    /// Packed 0xAARRGGBB colour.
    Color,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
            VertexFormat::Color => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub stream: u32,
    pub offset: u32,
    pub format: VertexFormat,
    pub semantic: VertexSemantic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub elements: Vec<VertexElement>,
    /// Per-stream vertex stride implied by the declaration.
    pub strides: [u32; crate::state::MAX_VERTEX_STREAMS],
    /// xxh3 of the element list, used as cache-key material.
    pub hash: u64,
}

impl VertexLayout {
    pub fn new(elements: Vec<VertexElement>) -> Self {
        let mut strides = [0u32; crate::state::MAX_VERTEX_STREAMS];
        let mut encoded = Vec::with_capacity(elements.len() * 16);
        for e in &elements {
            let end = e.offset + e.format.size();
            let stride = &mut strides[e.stream as usize % crate::state::MAX_VERTEX_STREAMS];
            *stride = (*stride).max(end);

            encoded.extend_from_slice(&e.stream.to_le_bytes());
            encoded.extend_from_slice(&e.offset.to_le_bytes());
            encoded.push(e.format as u8);
            encoded.extend_from_slice(&semantic_code(e.semantic).to_le_bytes());
        }
        let hash = xxhash_rust::xxh3::xxh3_64(&encoded);
        Self {
            elements,
            strides,
            hash,
        }
    }

    /// Decode a flexible-vertex-format code. Attributes follow the fixed
    /// legacy order: position, normal, diffuse, specular, texcoords.
    pub fn from_fvf(fvf: u32) -> Result<Self, DeviceError> {
        let position = match fvf & FVF_POSITION_MASK {
            FVF_XYZ => VertexFormat::Float3,
            FVF_XYZRHW => VertexFormat::Float4,
            other => {
                return Err(DeviceError::InvalidParameters(format!(
                    "unsupported FVF position type {:#x}",
                    other
                )))
            }
        };

        let mut elements = Vec::new();
        let mut offset = 0;
        let mut push = |semantic, format: VertexFormat| {
            elements.push(VertexElement {
                stream: 0,
                offset,
                format,
                semantic,
            });
            offset += format.size();
        };

        push(VertexSemantic::Position, position);
        if fvf & FVF_NORMAL != 0 {
            push(VertexSemantic::Normal, VertexFormat::Float3);
        }
        if fvf & FVF_DIFFUSE != 0 {
            push(VertexSemantic::Diffuse, VertexFormat::Color);
        }
        if fvf & FVF_SPECULAR != 0 {
            push(VertexSemantic::Specular, VertexFormat::Color);
        }
        let tex_count = (fvf & FVF_TEXCOUNT_MASK) >> FVF_TEXCOUNT_SHIFT;
        for i in 0..tex_count {
            push(VertexSemantic::TexCoord(i as u8), VertexFormat::Float2);
        }

        Ok(Self::new(elements))
    }
}

fn semantic_code(semantic: VertexSemantic) -> u16 {
    match semantic {
        VertexSemantic::Position => 0,
        VertexSemantic::Normal => 1,
        VertexSemantic::Diffuse => 2,
        VertexSemantic::Specular => 3,
        VertexSemantic::TexCoord(i) => 16 + i as u16,
    }
}

/// A vertex shader together with the input layout it consumes.
#[derive(Debug, Clone)]
pub struct VertexShader {
    pub blob: Arc<ShaderBlob>,
    pub layout: Arc<VertexLayout>,
}

// =============================================================================
// GENERATOR SEAM
// =============================================================================

/// Produces fixed-function replacement shaders.
pub trait ShaderGenerator {
    fn fixed_function_vertex_shader(&self, fvf: u32) -> Result<VertexShader, DeviceError>;
    fn fixed_function_pixel_shader(&self, key: &PixelShaderKey) -> Result<Arc<ShaderBlob>, DeviceError>;
}

/// Serves one precompiled vertex/pixel pair for every request.
///
/// The SPIR-V comes from `build.rs`; when no shader compiler was available at
/// build time the blobs are empty and only the host backend can use them.
pub struct PrecompiledShaders {
    vertex: Arc<ShaderBlob>,
    pixel: Arc<ShaderBlob>,
}

impl PrecompiledShaders {
    pub fn new(vertex_code: &[u8], pixel_code: &[u8]) -> Self {
        Self {
            vertex: Arc::new(ShaderBlob::new(ShaderStage::Vertex, "ff.vert", vertex_code.to_vec())),
            pixel: Arc::new(ShaderBlob::new(ShaderStage::Pixel, "ff.frag", pixel_code.to_vec())),
        }
    }

    /// Shaders compiled from `shaders/` at build time.
    pub fn builtin() -> Self {
        Self::new(
            include_bytes!(concat!(env!("OUT_DIR"), "/ff.vert.spv")),
            include_bytes!(concat!(env!("OUT_DIR"), "/ff.frag.spv")),
        )
    }

    pub fn has_code(&self) -> bool {
        !self.vertex.code.is_empty() && !self.pixel.code.is_empty()
    }
}

impl ShaderGenerator for PrecompiledShaders {
    fn fixed_function_vertex_shader(&self, fvf: u32) -> Result<VertexShader, DeviceError> {
        Ok(VertexShader {
            blob: self.vertex.clone(),
            layout: Arc::new(VertexLayout::from_fvf(fvf)?),
        })
    }

    fn fixed_function_pixel_shader(&self, key: &PixelShaderKey) -> Result<Arc<ShaderBlob>, DeviceError> {
        log::trace!("Serving builtin pixel shader for {} active stages", key.active_stages());
        Ok(self.pixel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fvf_decodes_in_legacy_order() {
        let layout = VertexLayout::from_fvf(FVF_XYZ | FVF_NORMAL | FVF_DIFFUSE | (2 << FVF_TEXCOUNT_SHIFT))
            .unwrap();
        let summary: Vec<_> = layout.elements.iter().map(|e| (e.semantic, e.offset)).collect();
        assert_eq!(
            summary,
            vec![
                (VertexSemantic::Position, 0),
                (VertexSemantic::Normal, 12),
                (VertexSemantic::Diffuse, 24),
                (VertexSemantic::TexCoord(0), 28),
                (VertexSemantic::TexCoord(1), 36),
            ]
        );
        assert_eq!(layout.strides[0], 44);
    }

    #[test]
    fn pretransformed_position_is_float4() {
        let layout = VertexLayout::from_fvf(FVF_XYZRHW | FVF_DIFFUSE).unwrap();
        assert_eq!(layout.elements[0].format, VertexFormat::Float4);
        assert_eq!(layout.strides[0], 20);
    }

    #[test]
    fn missing_position_is_rejected() {
        assert!(VertexLayout::from_fvf(FVF_NORMAL).is_err());
    }

    #[test]
    fn layout_hash_tracks_contents() {
        let a = VertexLayout::from_fvf(FVF_XYZ | FVF_DIFFUSE).unwrap();
        let b = VertexLayout::from_fvf(FVF_XYZ | FVF_DIFFUSE).unwrap();
        let c = VertexLayout::from_fvf(FVF_XYZ | FVF_SPECULAR).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }
}
