// Shader module loading
//
// Vulkan consumes SPIR-V; shader blobs produced by the generator are turned
// into short-lived modules while a pipeline is being built.

use ash::vk;
use std::io::Cursor;

use super::device::vk_error;
use super::VulkanDevice;
use crate::error::DeviceError;
use crate::shaders::ShaderBlob;

/// Owns a shader module until the pipeline using it has been created.
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a VulkanDevice,
}

impl<'a> ShaderModule<'a> {
    pub fn new(device: &'a VulkanDevice, blob: &ShaderBlob) -> Result<Self, DeviceError> {
        if blob.code.is_empty() {
            return Err(DeviceError::InvalidParameters(format!("shader '{}' has no code", blob.label)));
        }

        // read_spv copies into properly aligned words
        let code = ash::util::read_spv(&mut Cursor::new(&blob.code))
            .map_err(|e| DeviceError::InvalidParameters(format!("shader '{}': {}", blob.label, e)))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(|e| vk_error("create shader module", e))?;

        Ok(Self { module, device })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}
