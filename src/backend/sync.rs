// Synchronization primitives
//
// One timeline semaphore stands in for the frame fence: the scheduler signals
// it with the frame number, and CPU waits block on that value. Command lists
// are submitted without a fence of their own.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::commands::VulkanCommandList;
use super::device::vk_error;
use super::{CommandList, GpuQueue, VulkanDevice};
use crate::error::DeviceError;

/// The graphics queue plus its timeline fence
pub struct VulkanQueue {
    pub timeline: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl VulkanQueue {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self, DeviceError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let timeline = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| vk_error("create timeline semaphore", e))?;

        Ok(Self { timeline, device })
    }

    fn submit(&self, submit: vk::SubmitInfo2Builder<'_>) -> Result<(), DeviceError> {
        unsafe {
            self.device
                .device
                .queue_submit2(self.device.graphics_queue, &[submit.build()], vk::Fence::null())
        }
        .map_err(|e| vk_error("queue submit", e))
    }
}

impl GpuQueue for VulkanQueue {
    fn execute(&mut self, commands: &mut dyn CommandList) -> Result<(), DeviceError> {
        if commands.is_open() {
            return Err(DeviceError::InvalidParameters("command list is still recording".into()));
        }
        let list = commands
            .as_any_mut()
            .downcast_mut::<VulkanCommandList>()
            .ok_or_else(|| DeviceError::InvalidParameters("foreign command list".into()))?;

        let command_buffer_info = vk::CommandBufferSubmitInfo::builder()
            .command_buffer(list.command_buffer())
            .build();
        self.submit(vk::SubmitInfo2::builder().command_buffer_infos(std::slice::from_ref(&command_buffer_info)))
    }

    fn signal(&mut self, value: u64) -> Result<(), DeviceError> {
        // Signals order after every earlier submission on the queue
        let signal_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(self.timeline)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build();
        self.submit(vk::SubmitInfo2::builder().signal_semaphore_infos(std::slice::from_ref(&signal_info)))
    }

    fn completed_value(&self) -> u64 {
        match unsafe { self.device.device.get_semaphore_counter_value(self.timeline) } {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to read timeline value: {}", e);
                0
            }
        }
    }

    fn wait(&self, value: u64, timeout: Duration) -> Result<bool, DeviceError> {
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.device.wait_semaphores(&wait_info, nanos) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(vk_error("wait for timeline", e)),
        }
    }
}

impl Drop for VulkanQueue {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device.queue_wait_idle(self.device.graphics_queue) {
                log::error!("queue_wait_idle failed: {}", e);
            }
            self.device.device.destroy_semaphore(self.timeline, None);
        }
    }
}
