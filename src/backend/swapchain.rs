// Headless swapchain
//
// A ring of device-local colour images standing in for a window swapchain.
// Presenting hands the current image off and advances to the next one; the
// frame scheduler's fence keeps a slot from being reused while in flight.

use std::sync::Arc;

use super::buffer::VulkanImage;
use super::device::vk_error;
use super::{GpuQueue, GpuTexture, PresentDesc, Presenter, TextureFormat, VulkanDevice};
use crate::error::DeviceError;

pub struct HeadlessSwapchain {
    pub images: Vec<Arc<VulkanImage>>,
    pub format: TextureFormat,
    width: u32,
    height: u32,
    current: usize,
    presented: u64,
    device: Arc<VulkanDevice>,
}

impl HeadlessSwapchain {
    pub fn new(device: Arc<VulkanDevice>, desc: &PresentDesc) -> Result<Self, DeviceError> {
        if desc.back_buffer_count == 0 {
            return Err(DeviceError::InvalidParameters("swapchain needs at least one image".into()));
        }
        log::info!(
            "Creating headless swapchain: {}x{}, {} images",
            desc.width,
            desc.height,
            desc.back_buffer_count
        );

        let images = Self::create_images(&device, desc.width, desc.height, desc.format, desc.back_buffer_count)?;

        Ok(Self {
            images,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            current: 0,
            presented: 0,
            device,
        })
    }

    fn create_images(
        device: &Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: TextureFormat,
        count: usize,
    ) -> Result<Vec<Arc<VulkanImage>>, DeviceError> {
        (0..count)
            .map(|_| VulkanImage::new(device.clone(), width, height, format).map(Arc::new))
            .collect()
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }
}

impl Presenter for HeadlessSwapchain {
    fn back_buffer_count(&self) -> usize {
        self.images.len()
    }

    fn current_index(&self) -> usize {
        self.current
    }

    fn back_buffer(&self, slot: usize) -> Arc<dyn GpuTexture> {
        self.images[slot % self.images.len()].clone()
    }

    fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn present(&mut self, _queue: &mut dyn GpuQueue) -> Result<(), DeviceError> {
        self.presented += 1;
        self.current = (self.current + 1) % self.images.len();
        log::trace!("Presented frame {}, next image {}", self.presented, self.current);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), DeviceError> {
        log::info!("Resizing headless swapchain: {}x{}", width, height);
        unsafe { self.device.device.device_wait_idle() }.map_err(|e| vk_error("wait idle before resize", e))?;

        self.images = Self::create_images(&self.device, width, height, self.format, self.images.len())?;
        self.width = width;
        self.height = height;
        self.current = 0;
        Ok(())
    }
}
