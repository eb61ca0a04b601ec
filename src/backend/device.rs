// Headless Vulkan device
//
// Owns everything the backend objects borrow: the instance and logical device,
// the graphics queue, the gpu-allocator instance, one push-constant pipeline
// layout shared by every fixed-function pipeline and the sampler table that
// SamplerHandle indexes. No surface is created; presentation is simulated by
// the headless swapchain.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Weak};

use super::buffer::VulkanBuffer;
use super::commands::{VulkanCommandList, PUSH_CONSTANT_SIZE};
use super::pipeline::VulkanPipeline;
use super::swapchain::HeadlessSwapchain;
use super::sync::VulkanQueue;
use super::{
    AddressMode, BufferDesc, CommandList, Filter, GpuBuffer, GpuDevice, GpuQueue, PipelineDesc,
    PipelineState, PresentDesc, Presenter, SamplerDesc, SamplerHandle,
};
use crate::error::DeviceError;

/// Fill modes and anisotropic filtering back legacy render and sampler states.
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    fill_mode_non_solid: vk::TRUE,
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

pub struct VulkanDevice {
    // Released in Drop, allocator first
    pub allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub properties: vk::PhysicalDeviceProperties,

    /// Push constants only: four constant-buffer addresses plus texture/sampler indices.
    pub pipeline_layout: vk::PipelineLayout,
    samplers: Mutex<Vec<vk::Sampler>>,
    name: String,
    this: Weak<VulkanDevice>,
}

impl VulkanDevice {
    /// Bring up a headless Vulkan 1.3 device. `validation` turns on the
    /// Khronos validation layer and routes its messages into `log`.
    pub fn new(app_name: &str, validation: bool) -> Result<Arc<Self>> {
        log::info!("Initializing headless Vulkan for {}", app_name);

        // ─── Instance ───
        let entry = unsafe { Entry::load() }.context("Vulkan loader not available")?;
        let instance = Self::create_instance(&entry, app_name, validation)?;
        let debug_utils = validation
            .then(|| Self::setup_debug_messenger(&entry, &instance))
            .transpose()?;

        // ─── Device ───
        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!(
            "Using {} (Vulkan {}.{}), queue family {}",
            name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            graphics_queue_family
        );

        // ─── Shared objects ───
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;
        let pipeline_layout = Self::create_pipeline_layout(&device)?;

        Ok(Arc::new_cyclic(|this| Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            pipeline_layout,
            samplers: Mutex::new(Vec::new()),
            name,
            this: this.clone(),
        }))
    }

    fn create_instance(entry: &Entry, app_name: &str, validation: bool) -> Result<ash::Instance> {
        let application = CString::new(app_name)?;
        let engine = CString::new("legacy-shim")?;
        let version = vk::make_api_version(0, 0, 1, 0);

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&application)
            .application_version(version)
            .engine_name(&engine)
            .engine_version(version)
            .api_version(vk::API_VERSION_1_3);

        // No surface extensions; debug utils only with validation.
        let (extensions, layers) = if validation {
            (
                vec![ash::extensions::ext::DebugUtils::name().as_ptr()],
                vec![c"VK_LAYER_KHRONOS_validation".as_ptr()],
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }.context("vkCreateInstance failed")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Pick the highest-ranked GPU that has Vulkan 1.3, the required
    /// features and a graphics queue; discrete beats integrated.
    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let candidates = unsafe { instance.enumerate_physical_devices() }?;
        log::debug!("{} physical device(s) visible", candidates.len());

        candidates
            .into_iter()
            .filter_map(|device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                if props.api_version < vk::API_VERSION_1_3 || !Self::check_device_features(instance, device) {
                    return None;
                }
                let family = unsafe { instance.get_physical_device_queue_family_properties(device) }
                    .iter()
                    .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))?;
                let rank = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    _ => 0,
                };
                Some((rank, device, family as u32))
            })
            .max_by_key(|(rank, _, _)| *rank)
            .map(|(_, device, family)| (device, family))
            .ok_or_else(|| anyhow::anyhow!("no GPU offers Vulkan 1.3 with the required features"))
    }

    fn check_device_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let core = {
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(device, &mut features2) };
            features2.features
        };

        core.fill_mode_non_solid == vk::TRUE
            && core.sampler_anisotropy == vk::TRUE
            && features12.buffer_device_address == vk::TRUE
            && features12.timeline_semaphore == vk::TRUE
            && features12.scalar_block_layout == vk::TRUE
            && features13.dynamic_rendering == vk::TRUE
            && features13.synchronization2 == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        // Everything else is Vulkan 1.3 core
        let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .scalar_block_layout(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
            .dynamic_rendering(true)
            .synchronization2(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&REQUIRED_DEVICE_FEATURES)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("vkCreateDevice failed")?;
        let queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        Ok((device, queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        // Every buffer is addressed through its device address.
        Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("gpu-allocator setup failed")
    }

    fn create_pipeline_layout(device: &ash::Device) -> Result<vk::PipelineLayout> {
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)
            .build();

        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(std::slice::from_ref(&push_constant_range));

        unsafe { device.create_pipeline_layout(&layout_info, None) }.context("Failed to create pipeline layout")
    }

    /// Strong handle to this device for objects that must outlive the call creating them.
    pub(crate) fn handle(&self) -> Result<Arc<VulkanDevice>, DeviceError> {
        self.this
            .upgrade()
            .ok_or_else(|| DeviceError::DeviceLost("device is being destroyed".into()))
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn GpuBuffer>, DeviceError> {
        Ok(Arc::new(VulkanBuffer::new(self.handle()?, desc)?))
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<Arc<dyn PipelineState>, DeviceError> {
        Ok(Arc::new(VulkanPipeline::new(self.handle()?, desc)?))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerHandle, DeviceError> {
        let anisotropic = desc.min_filter == Filter::Anisotropic || desc.mag_filter == Filter::Anisotropic;
        let max_anisotropy = (desc.max_anisotropy.max(1) as f32).min(self.properties.limits.max_sampler_anisotropy);

        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter(desc.mag_filter))
            .min_filter(filter(desc.min_filter))
            .mipmap_mode(match desc.mip_filter {
                Filter::Linear | Filter::Anisotropic => vk::SamplerMipmapMode::LINEAR,
                Filter::None | Filter::Point => vk::SamplerMipmapMode::NEAREST,
            })
            .address_mode_u(address_mode(desc.address_u))
            .address_mode_v(address_mode(desc.address_v))
            .address_mode_w(address_mode(desc.address_w))
            .mip_lod_bias(desc.mip_lod_bias())
            .anisotropy_enable(anisotropic && max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy)
            .min_lod(0.0)
            // Mip filter NONE samples the top level only
            .max_lod(if desc.mip_filter == Filter::None { 0.25 } else { vk::LOD_CLAMP_NONE })
            .border_color(border_color(desc.border_color));

        let sampler = unsafe { self.device.create_sampler(&info, None) }
            .map_err(|e| vk_error("create sampler", e))?;

        let mut samplers = self.samplers.lock();
        samplers.push(sampler);
        log::debug!("Created sampler #{} {:?}", samplers.len() - 1, desc);
        Ok(SamplerHandle(samplers.len() as u32 - 1))
    }

    fn create_command_list(&self, slots: usize) -> Result<Box<dyn CommandList>, DeviceError> {
        Ok(Box::new(VulkanCommandList::new(self.handle()?, slots)?))
    }

    fn create_queue(&self) -> Result<Box<dyn GpuQueue>, DeviceError> {
        Ok(Box::new(VulkanQueue::new(self.handle()?)?))
    }

    fn create_presenter(&self, desc: &PresentDesc) -> Result<Box<dyn Presenter>, DeviceError> {
        Ok(Box::new(HeadlessSwapchain::new(self.handle()?, desc)?))
    }

    fn wait_idle(&self) -> Result<(), DeviceError> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_error("wait idle", e))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Shutting down Vulkan device {}", self.name);
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("device_wait_idle failed during shutdown: {}", e);
        }

        unsafe {
            for sampler in self.samplers.get_mut().drain(..) {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);

            // The allocator frees its memory blocks through the device
            drop(self.allocator.get_mut().take());

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Map a Vulkan result code onto the backend error taxonomy.
pub(crate) fn vk_error(what: &str, result: vk::Result) -> DeviceError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DeviceError::OutOfMemory(format!("{}: {}", what, result))
        }
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost(what.to_string()),
        other => DeviceError::Backend(format!("{}: {}", what, other)),
    }
}

fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::None | Filter::Point => vk::Filter::NEAREST,
        Filter::Linear | Filter::Anisotropic => vk::Filter::LINEAR,
    }
}

fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

/// Closest fixed border colour to a packed ARGB value.
fn border_color(argb: u32) -> vk::BorderColor {
    match argb {
        0 => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        c if c & 0x00FF_FFFF == 0 => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        _ => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

/// Forwards validation messages to `log` at the matching level.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    let level = match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        _ => log::Level::Debug,
    };
    log::log!(target: "vulkan", level, "{}", message);
    vk::FALSE
}
