// Graphics pipeline creation
//
// Translates a PipelineDesc (the canonical fixed-function key plus shaders and
// input layout) into a dynamic-rendering pipeline. Viewport, scissor and
// vertex strides stay dynamic so the key does not have to carry them.

use ash::vk;
use std::any::Any;
use std::sync::Arc;

use super::buffer::vk_format;
use super::device::vk_error;
use super::shader::ShaderModule;
use super::{PipelineDesc, PipelineState, PrimitiveTopology, ResourceId, TextureFormat, VulkanDevice};
use crate::error::DeviceError;
use crate::shaders::{VertexFormat, VertexLayout, VertexSemantic};
use crate::state::PipelineKey;

pub struct VulkanPipeline {
    id: ResourceId,
    pub pipeline: vk::Pipeline,
    pub key: PipelineKey,
    device: Arc<VulkanDevice>,
}

impl VulkanPipeline {
    pub fn new(device: Arc<VulkanDevice>, desc: &PipelineDesc) -> Result<Self, DeviceError> {
        let key = &desc.key;
        let vert_shader = ShaderModule::new(&device, &desc.vertex_shader)?;
        let frag_shader = ShaderModule::new(&device, &desc.pixel_shader)?;

        // Shader stages
        let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader.module)
            .name(c"main")
            .build();

        let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader.module)
            .name(c"main")
            .build();

        let shader_stages = [vert_stage, frag_stage];

        // Vertex input
        let (bindings, attributes) = vertex_input(&desc.vertex_layout);
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(topology(desc.topology))
            .primitive_restart_enable(false);

        // Viewport and scissor are set per render-target bind
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        // Rasterization
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode(key.fill_mode))
            .line_width(1.0)
            .cull_mode(cull_mode(key.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let has_depth = desc.depth_format.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(has_depth && key.z_enable != 0)
            .depth_write_enable(has_depth && key.z_enable != 0 && key.z_write_enable != 0)
            .depth_compare_op(compare_op(key.z_func))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::from_raw(key.color_write_enable & 0xF))
            .blend_enable(key.alpha_blend_enable != 0)
            .src_color_blend_factor(blend_factor(key.src_blend))
            .dst_color_blend_factor(blend_factor(key.dest_blend))
            .color_blend_op(blend_op(key.blend_op))
            .src_alpha_blend_factor(blend_factor(key.src_blend))
            .dst_alpha_blend_factor(blend_factor(key.dest_blend))
            .alpha_blend_op(blend_op(key.blend_op))
            .build();

        let color_blend_attachments = [color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        // Dynamic rendering: formats instead of a render pass
        let color_formats = [vk_format(desc.color_format)];
        let depth_format = desc.depth_format.map_or(vk::Format::UNDEFINED, vk_format);
        let stencil_format = match desc.depth_format {
            Some(TextureFormat::D24UnormS8) => depth_format,
            _ => vk::Format::UNDEFINED,
        };
        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(device.pipeline_layout)
            .push_next(&mut rendering_info)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| vk_error("create graphics pipeline", e))?;

        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::Backend("driver returned no pipeline".into()))?;

        log::debug!(
            "Created pipeline {:?} (vs {:#x}, ps {:#x}, layout {:#x})",
            desc.topology,
            key.vertex_shader,
            key.pixel_shader,
            key.vertex_layout
        );

        drop(vert_shader);
        drop(frag_shader);
        Ok(Self {
            id: ResourceId::next(),
            pipeline,
            key: *key,
            device,
        })
    }
}

impl std::fmt::Debug for VulkanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanPipeline").field("id", &self.id).finish()
    }
}

impl PipelineState for VulkanPipeline {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_pipeline(self.pipeline, None) };
    }
}

/// Shader input location for each legacy vertex semantic.
pub fn attribute_location(semantic: VertexSemantic) -> u32 {
    match semantic {
        VertexSemantic::Position => 0,
        VertexSemantic::Normal => 1,
        VertexSemantic::Diffuse => 2,
        VertexSemantic::Specular => 3,
        VertexSemantic::TexCoord(n) => 4 + n as u32,
    }
}

fn vertex_input(
    layout: &VertexLayout,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let mut bindings: Vec<vk::VertexInputBindingDescription> = Vec::new();
    let mut attributes = Vec::with_capacity(layout.elements.len());

    for element in &layout.elements {
        if !bindings.iter().any(|b| b.binding == element.stream) {
            bindings.push(
                vk::VertexInputBindingDescription::builder()
                    .binding(element.stream)
                    .stride(layout.strides[element.stream as usize])
                    .input_rate(vk::VertexInputRate::VERTEX)
                    .build(),
            );
        }
        attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .binding(element.stream)
                .location(attribute_location(element.semantic))
                .format(match element.format {
                    VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
                    VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
                    VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
                    // 0xAARRGGBB in memory is B, G, R, A
                    VertexFormat::Color => vk::Format::B8G8R8A8_UNORM,
                })
                .offset(element.offset)
                .build(),
        );
    }

    (bindings, attributes)
}

fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

fn polygon_mode(fill_mode: u32) -> vk::PolygonMode {
    match fill_mode {
        1 => vk::PolygonMode::POINT,
        2 => vk::PolygonMode::LINE,
        _ => vk::PolygonMode::FILL,
    }
}

// Front faces are counter-clockwise, so legacy CW culling culls back faces.
fn cull_mode(cull_mode: u32) -> vk::CullModeFlags {
    match cull_mode {
        2 => vk::CullModeFlags::BACK,
        3 => vk::CullModeFlags::FRONT,
        _ => vk::CullModeFlags::NONE,
    }
}

fn compare_op(func: u32) -> vk::CompareOp {
    match func {
        1 => vk::CompareOp::NEVER,
        2 => vk::CompareOp::LESS,
        3 => vk::CompareOp::EQUAL,
        4 => vk::CompareOp::LESS_OR_EQUAL,
        5 => vk::CompareOp::GREATER,
        6 => vk::CompareOp::NOT_EQUAL,
        7 => vk::CompareOp::GREATER_OR_EQUAL,
        _ => vk::CompareOp::ALWAYS,
    }
}

fn blend_factor(blend: u32) -> vk::BlendFactor {
    match blend {
        1 => vk::BlendFactor::ZERO,
        3 => vk::BlendFactor::SRC_COLOR,
        4 => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        5 => vk::BlendFactor::SRC_ALPHA,
        6 => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        7 => vk::BlendFactor::DST_ALPHA,
        8 => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        9 => vk::BlendFactor::DST_COLOR,
        10 => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        11 => vk::BlendFactor::SRC_ALPHA_SATURATE,
        _ => vk::BlendFactor::ONE,
    }
}

fn blend_op(op: u32) -> vk::BlendOp {
    match op {
        2 => vk::BlendOp::SUBTRACT,
        3 => vk::BlendOp::REVERSE_SUBTRACT,
        4 => vk::BlendOp::MIN,
        5 => vk::BlendOp::MAX,
        _ => vk::BlendOp::ADD,
    }
}
