// Buffer and image memory for the Vulkan backend
//
// Buffers are linear CpuToGpu allocations, persistently mapped and reachable
// through their buffer device address. Images back the headless swapchain and
// depth targets.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use super::device::vk_error;
use super::{
    BufferDesc, BufferUsage, DescriptorHandle, GpuBuffer, GpuTexture, MappedMemory, ResourceId, TextureFormat,
};
use super::VulkanDevice;
use crate::error::DeviceError;

fn allocation_error(what: &str, error: gpu_allocator::AllocationError) -> DeviceError {
    match error {
        gpu_allocator::AllocationError::OutOfMemory => DeviceError::OutOfMemory(what.to_string()),
        other => DeviceError::Backend(format!("{}: {}", what, other)),
    }
}

/// Allocate memory for `requirements` and hand it back with its bind point.
fn allocate(
    device: &VulkanDevice,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, DeviceError> {
    let mut allocator = device.allocator.lock();
    let allocator = allocator
        .as_mut()
        .ok_or_else(|| DeviceError::DeviceLost("allocator already destroyed".into()))?;
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| allocation_error(name, e))
}

fn free(device: &VulkanDevice, allocation: Allocation) {
    if let Some(allocator) = device.allocator.lock().as_mut() {
        if let Err(e) = allocator.free(allocation) {
            log::error!("Failed to free GPU allocation: {}", e);
        }
    }
}

fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::CONSTANT) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    flags
}

// =============================================================================
// BUFFERS
// =============================================================================

/// Host-visible buffer, mapped for its whole lifetime.
pub struct VulkanBuffer {
    id: ResourceId,
    label: String,
    size: u64,
    pub buffer: vk::Buffer,
    /// Base device address; offsets are added on top.
    pub address: vk::DeviceAddress,
    mapped: MappedMemory,
    map_count: AtomicU32,
    allocation: Mutex<Option<Allocation>>,
    device: Arc<VulkanDevice>,
}

impl VulkanBuffer {
    pub fn new(device: Arc<VulkanDevice>, desc: &BufferDesc) -> Result<Self, DeviceError> {
        if desc.size == 0 {
            return Err(DeviceError::InvalidParameters(format!("{} has zero size", desc.label)));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(|e| vk_error("create buffer", e))?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocate(&device, &desc.label, requirements, MemoryLocation::CpuToGpu, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        let (mapped, address) = match (bound, mapped) {
            (Ok(()), Some(ptr)) => {
                let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
                let address = unsafe { device.device.get_buffer_device_address(&info) };
                // SAFETY: the allocation stays mapped until it is freed in Drop.
                (unsafe { MappedMemory::new(ptr, desc.size as usize) }, address)
            }
            (result, _) => {
                free(&device, allocation);
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(match result {
                    Err(e) => vk_error("bind buffer memory", e),
                    Ok(()) => DeviceError::Backend(format!("{} is not host visible", desc.label)),
                });
            }
        };

        log::trace!("Created buffer '{}' ({} bytes) at {:#x}", desc.label, desc.size, address);

        Ok(Self {
            id: ResourceId::next(),
            label: desc.label.clone(),
            size: desc.size,
            buffer,
            address,
            mapped,
            map_count: AtomicU32::new(0),
            allocation: Mutex::new(Some(allocation)),
            device,
        })
    }
}

impl std::fmt::Debug for VulkanBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBuffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("address", &format_args!("{:#x}", self.address))
            .finish()
    }
}

impl GpuBuffer for VulkanBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn map(&self) -> Result<MappedMemory, DeviceError> {
        self.map_count.fetch_add(1, Ordering::AcqRel);
        Ok(self.mapped)
    }

    fn unmap(&self) {
        let previous = self.map_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced unmap of '{}'", self.label);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take() {
            free(&self.device, allocation);
        }
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}

// =============================================================================
// IMAGES
// =============================================================================

pub fn vk_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::D24UnormS8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn is_depth(format: TextureFormat) -> bool {
    matches!(format, TextureFormat::D24UnormS8 | TextureFormat::D32Float)
}

/// Device-local 2D image with one mip and a record-time layout tracker.
pub struct VulkanImage {
    id: ResourceId,
    descriptor: DescriptorHandle,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: TextureFormat,
    pub extent: vk::Extent2D,
    /// Layout the image will be in once recorded work executes.
    layout: AtomicI64,
    allocation: Mutex<Option<Allocation>>,
    device: Arc<VulkanDevice>,
}

impl VulkanImage {
    pub fn new(device: Arc<VulkanDevice>, width: u32, height: u32, format: TextureFormat) -> Result<Self, DeviceError> {
        static NEXT_DESCRIPTOR: AtomicU32 = AtomicU32::new(0);

        let (usage, aspect) = if is_depth(format) {
            (vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT, vk::ImageAspectFlags::DEPTH)
        } else {
            (
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageAspectFlags::COLOR,
            )
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk_format(format))
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(|e| vk_error("create image", e))?;
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match allocate(&device, "image", requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(vk_format(format))
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    device.device.create_image_view(&view_info, None)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                free(&device, allocation);
                unsafe { device.device.destroy_image(image, None) };
                return Err(vk_error("create image view", e));
            }
        };

        Ok(Self {
            id: ResourceId::next(),
            descriptor: DescriptorHandle(NEXT_DESCRIPTOR.fetch_add(1, Ordering::Relaxed)),
            image,
            view,
            format,
            extent: vk::Extent2D { width, height },
            layout: AtomicI64::new(vk::ImageLayout::UNDEFINED.as_raw() as i64),
            allocation: Mutex::new(Some(allocation)),
            device,
        })
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        if is_depth(self.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    pub fn layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.layout.load(Ordering::Acquire) as i32)
    }

    /// Record the layout the image moves to; returns the previous one.
    pub fn swap_layout(&self, layout: vk::ImageLayout) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.layout.swap(layout.as_raw() as i64, Ordering::AcqRel) as i32)
    }
}

impl std::fmt::Debug for VulkanImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanImage")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("extent", &(self.extent.width, self.extent.height))
            .finish()
    }
}

impl GpuTexture for VulkanImage {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn descriptor(&self) -> DescriptorHandle {
        self.descriptor
    }

    fn extent(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    fn format(&self) -> TextureFormat {
        self.format
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.get_mut().take() {
            free(&self.device, allocation);
        }
    }
}
