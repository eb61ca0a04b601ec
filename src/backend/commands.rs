// Command recording for the Vulkan backend
//
// One command pool per back-buffer slot; resetting a slot resets its pool,
// which is only legal once the frame that last used the slot has completed.
// Rendering begins lazily at the first clear or draw after a target change and
// ends before any transfer or layout transition.
//
// Constant buffers are not descriptors: their device addresses travel in push
// constants, together with the stage-0 texture and sampler indices.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::any::Any;
use std::sync::Arc;

use super::buffer::{VulkanBuffer, VulkanImage};
use super::device::vk_error;
use super::pipeline::VulkanPipeline;
use super::{
    ClearRequest, CommandList, ConstantSlot, DescriptorHandle, GpuAddress, GpuTexture, IndexFormat,
    PipelineState, RenderTargets, SamplerHandle, TextureState, VulkanDevice,
};
use crate::error::DeviceError;
use crate::state::{ClearFlags, Viewport};

/// Push-constant block shared by both fixed-function stages.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PushConstants {
    pub constant_buffers: [u64; 4],
    pub texture_index: u32,
    pub sampler_index: u32,
}

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

const NO_TEXTURE: u32 = u32::MAX;

struct BoundTargets {
    color: Arc<dyn GpuTexture>,
    depth: Option<Arc<dyn GpuTexture>>,
    viewport: Viewport,
}

pub struct VulkanCommandList {
    pools: Vec<vk::CommandPool>,
    buffers: Vec<vk::CommandBuffer>,
    slot: usize,
    open: bool,
    rendering: bool,
    targets: Option<BoundTargets>,
    push: PushConstants,
    device: Arc<VulkanDevice>,
}

impl VulkanCommandList {
    pub fn new(device: Arc<VulkanDevice>, slots: usize) -> Result<Self, DeviceError> {
        let mut list = Self {
            pools: Vec::with_capacity(slots),
            buffers: Vec::with_capacity(slots),
            slot: 0,
            open: false,
            rendering: false,
            targets: None,
            push: PushConstants {
                texture_index: NO_TEXTURE,
                ..Zeroable::zeroed()
            },
            device,
        };

        // Partially built lists clean up through Drop
        for _ in 0..slots {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(list.device.graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = unsafe { list.device.device.create_command_pool(&pool_info, None) }
                .map_err(|e| vk_error("create command pool", e))?;
            list.pools.push(pool);

            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffers = unsafe { list.device.device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| vk_error("allocate command buffer", e))?;
            list.buffers.extend(buffers);
        }

        log::debug!("Created command list with {} slots", slots);
        Ok(list)
    }

    /// Command buffer of the slot most recently reset.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffers[self.slot]
    }

    pub fn push_constants(&self) -> &PushConstants {
        &self.push
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.device.cmd_end_rendering(self.command_buffer()) };
            self.rendering = false;
        }
    }

    /// Open a rendering scope on the bound targets. Returns false when none are bound.
    fn begin_rendering(&mut self) -> bool {
        if self.rendering {
            return true;
        }
        let Some(targets) = &self.targets else {
            log::warn!("Draw or clear recorded without a render target");
            return false;
        };
        let color = targets.color.clone();
        let depth = targets.depth.clone();
        let viewport = targets.viewport;

        let Some(color_image) = color.as_any().downcast_ref::<VulkanImage>() else {
            log::error!("Render target {:?} is not a Vulkan image", color.id());
            return false;
        };
        if color_image.layout() != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
            self.transition_image(color_image, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        }
        let depth_image = depth.as_ref().and_then(|d| d.as_any().downcast_ref::<VulkanImage>());
        if let Some(depth_image) = depth_image {
            if depth_image.layout() != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
                self.transition_image(depth_image, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
            }
        }

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(color_image.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();
        let depth_attachment = depth_image.map(|image| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(image.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .build()
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: color_image.extent,
        };
        let color_attachments = [color_attachment];
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        let cb = self.command_buffer();
        unsafe {
            self.device.device.cmd_begin_rendering(cb, &rendering_info);
            self.device.device.cmd_set_viewport(
                cb,
                0,
                &[vk::Viewport {
                    x: viewport.x as f32,
                    y: viewport.y as f32,
                    width: viewport.width as f32,
                    height: viewport.height as f32,
                    min_depth: viewport.min_z,
                    max_depth: viewport.max_z,
                }],
            );
            self.device.device.cmd_set_scissor(cb, 0, &[viewport_rect(&viewport)]);
        }
        self.rendering = true;
        true
    }

    fn transition_image(&self, image: &VulkanImage, layout: vk::ImageLayout) {
        let old_layout = image.swap_layout(layout);
        if old_layout == layout {
            return;
        }
        let barrier = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
            .old_layout(old_layout)
            .new_layout(layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: image.aspect(),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();
        let dependency = vk::DependencyInfo::builder().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.device.cmd_pipeline_barrier2(self.command_buffer(), &dependency) };
    }

    fn memory_barrier(
        &self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::MemoryBarrier2::builder()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .build();
        let dependency = vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.device.device.cmd_pipeline_barrier2(self.command_buffer(), &dependency) };
    }

    fn flush_push_constants(&self) {
        unsafe {
            self.device.device.cmd_push_constants(
                self.command_buffer(),
                self.device.pipeline_layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&self.push),
            );
        }
    }
}

fn viewport_rect(viewport: &Viewport) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: viewport.x as i32,
            y: viewport.y as i32,
        },
        extent: vk::Extent2D {
            width: viewport.width,
            height: viewport.height,
        },
    }
}

fn vulkan_buffer(address: &GpuAddress) -> Option<&VulkanBuffer> {
    let buffer = address.buffer.as_any().downcast_ref::<VulkanBuffer>();
    if buffer.is_none() {
        log::error!("Buffer '{}' does not belong to the Vulkan backend", address.buffer.label());
    }
    buffer
}

fn layout_for(state: TextureState) -> vk::ImageLayout {
    match state {
        TextureState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        TextureState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        // Headless presentation ends in a readback-ready layout
        TextureState::Present => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    }
}

impl CommandList for VulkanCommandList {
    fn reset(&mut self, slot: usize) -> Result<(), DeviceError> {
        if slot >= self.pools.len() {
            return Err(DeviceError::InvalidParameters(format!(
                "command allocator slot {} of {}",
                slot,
                self.pools.len()
            )));
        }
        if self.open {
            self.close()?;
        }

        self.slot = slot;
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pools[slot], vk::CommandPoolResetFlags::empty())
                .map_err(|e| vk_error("reset command pool", e))?;
            self.device
                .device
                .begin_command_buffer(self.buffers[slot], &begin_info)
                .map_err(|e| vk_error("begin command buffer", e))?;
        }

        self.open = true;
        self.rendering = false;
        self.targets = None;
        self.push = PushConstants {
            texture_index: NO_TEXTURE,
            ..Zeroable::zeroed()
        };
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Ok(());
        }
        self.end_rendering();
        self.open = false;
        unsafe { self.device.device.end_command_buffer(self.command_buffer()) }
            .map_err(|e| vk_error("end command buffer", e))
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn copy_buffer(&mut self, src: &GpuAddress, dst: &GpuAddress, size: u64) {
        let (Some(src_buffer), Some(dst_buffer)) = (vulkan_buffer(src), vulkan_buffer(dst)) else {
            return;
        };
        self.end_rendering();

        // Earlier draws in this list may still read the destination
        self.memory_barrier(
            vk::PipelineStageFlags2::ALL_GRAPHICS,
            vk::AccessFlags2::MEMORY_READ,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        let region = vk::BufferCopy {
            src_offset: src.offset,
            dst_offset: dst.offset,
            size,
        };
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(self.command_buffer(), src_buffer.buffer, dst_buffer.buffer, &[region]);
        }
        self.memory_barrier(
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::PipelineStageFlags2::ALL_GRAPHICS,
            vk::AccessFlags2::MEMORY_READ,
        );
    }

    fn transition(&mut self, texture: &Arc<dyn GpuTexture>, state: TextureState) {
        let Some(image) = texture.as_any().downcast_ref::<VulkanImage>() else {
            log::error!("Texture {:?} is not a Vulkan image", texture.id());
            return;
        };
        self.end_rendering();
        self.transition_image(image, layout_for(state));
    }

    fn set_render_targets(&mut self, targets: &RenderTargets) {
        self.end_rendering();
        self.targets = Some(BoundTargets {
            color: targets.color.clone(),
            depth: targets.depth.clone(),
            viewport: targets.viewport,
        });
    }

    fn clear(&mut self, request: &ClearRequest) {
        if !self.begin_rendering() {
            return;
        }
        let Some(targets) = &self.targets else {
            return;
        };

        let mut attachments = Vec::with_capacity(2);
        if request.flags.contains(ClearFlags::TARGET) {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue { float32: request.color },
                },
            });
        }
        let mut depth_aspect = vk::ImageAspectFlags::empty();
        if let Some(depth) = &targets.depth {
            if request.flags.contains(ClearFlags::ZBUFFER) {
                depth_aspect |= vk::ImageAspectFlags::DEPTH;
            }
            if request.flags.contains(ClearFlags::STENCIL) && depth.format() == super::TextureFormat::D24UnormS8 {
                depth_aspect |= vk::ImageAspectFlags::STENCIL;
            }
        }
        if !depth_aspect.is_empty() {
            attachments.push(vk::ClearAttachment {
                aspect_mask: depth_aspect,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: request.depth,
                        stencil: request.stencil,
                    },
                },
            });
        }
        if attachments.is_empty() {
            return;
        }

        let rect = vk::ClearRect {
            rect: viewport_rect(&targets.viewport),
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .device
                .cmd_clear_attachments(self.command_buffer(), &attachments, &[rect]);
        }
    }

    fn set_pipeline(&mut self, pipeline: &Arc<dyn PipelineState>) {
        let Some(pipeline) = pipeline.as_any().downcast_ref::<VulkanPipeline>() else {
            log::error!("Pipeline {:?} does not belong to the Vulkan backend", pipeline.id());
            return;
        };
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(self.command_buffer(), vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
        }
    }

    fn set_constant_buffer(&mut self, slot: ConstantSlot, address: &GpuAddress, _size: u32) {
        if let Some(buffer) = vulkan_buffer(address) {
            self.push.constant_buffers[slot.index()] = buffer.address + address.offset;
        }
    }

    fn set_vertex_buffer(&mut self, stream: u32, address: &GpuAddress, size: u32, stride: u32) {
        let Some(buffer) = vulkan_buffer(address) else {
            return;
        };
        unsafe {
            self.device.device.cmd_bind_vertex_buffers2(
                self.command_buffer(),
                stream,
                &[buffer.buffer],
                &[address.offset],
                Some(&[size as vk::DeviceSize][..]),
                Some(&[stride as vk::DeviceSize][..]),
            );
        }
    }

    fn set_index_buffer(&mut self, address: &GpuAddress, _size: u32, format: IndexFormat) {
        let Some(buffer) = vulkan_buffer(address) else {
            return;
        };
        let index_type = match format {
            IndexFormat::U16 => vk::IndexType::UINT16,
            IndexFormat::U32 => vk::IndexType::UINT32,
        };
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(self.command_buffer(), buffer.buffer, address.offset, index_type);
        }
    }

    fn set_texture(&mut self, stage: u32, descriptor: Option<DescriptorHandle>) {
        if stage == 0 {
            self.push.texture_index = descriptor.map_or(NO_TEXTURE, |d| d.0);
        }
    }

    fn set_sampler(&mut self, stage: u32, sampler: SamplerHandle) {
        if stage == 0 {
            self.push.sampler_index = sampler.0;
        }
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        if !self.begin_rendering() {
            return;
        }
        self.flush_push_constants();
        unsafe {
            self.device
                .device
                .cmd_draw(self.command_buffer(), vertex_count, 1, first_vertex, 0);
        }
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32) {
        if !self.begin_rendering() {
            return;
        }
        self.flush_push_constants();
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(self.command_buffer(), index_count, 1, first_index, base_vertex, 0);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device.device_wait_idle() {
                log::error!("device_wait_idle failed while destroying command pools: {}", e);
            }
            // Destroying a pool frees its command buffers
            for &pool in &self.pools {
                self.device.device.destroy_command_pool(pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_match_shader_block() {
        assert_eq!(PUSH_CONSTANT_SIZE, 40);
        assert_eq!(std::mem::offset_of!(PushConstants, texture_index), 32);
    }

    #[test]
    fn presentation_layout_is_transfer_source() {
        assert_eq!(layout_for(TextureState::Present), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(layout_for(TextureState::RenderTarget), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}
