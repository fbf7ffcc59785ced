// SPDX-License-Identifier: CEPL-1.0
//! Owning wrappers for device-created handles.
//!
//! An [`Owned`] borrows the device it came from, so the borrow checker
//! refuses to let the device go before every child is destroyed. Structs
//! holding several of them list the dependents first: fields drop in
//! declaration order.
use ash::vk;

pub trait DeviceChild: Copy {
    /// # Safety
    /// `self` was created from `device` and the device no longer uses it.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_child {
    ($ty:ty, $destroy:ident) => {
        impl DeviceChild for $ty {
            unsafe fn destroy(self, device: &ash::Device) {
                unsafe { device.$destroy(self, None) }
            }
        }
    };
}

device_child!(vk::Fence, destroy_fence);
device_child!(vk::Semaphore, destroy_semaphore);
device_child!(vk::Buffer, destroy_buffer);
device_child!(vk::DeviceMemory, free_memory);
device_child!(vk::Image, destroy_image);
device_child!(vk::ImageView, destroy_image_view);
device_child!(vk::Framebuffer, destroy_framebuffer);
device_child!(vk::RenderPass, destroy_render_pass);
device_child!(vk::CommandPool, destroy_command_pool);
device_child!(vk::DescriptorPool, destroy_descriptor_pool);
device_child!(vk::DescriptorSetLayout, destroy_descriptor_set_layout);
device_child!(vk::ShaderModule, destroy_shader_module);
device_child!(vk::PipelineLayout, destroy_pipeline_layout);
device_child!(vk::Pipeline, destroy_pipeline);

pub struct Owned<'d, H: DeviceChild> {
    device: &'d ash::Device,
    raw: H,
}

impl<'d, H: DeviceChild> Owned<'d, H> {
    /// # Safety
    /// `raw` was created from `device` and nothing else destroys it.
    pub unsafe fn new(device: &'d ash::Device, raw: H) -> Self {
        Self { device, raw }
    }

    #[inline]
    pub fn raw(&self) -> H {
        self.raw
    }
}

impl<H: DeviceChild> Drop for Owned<'_, H> {
    fn drop(&mut self) {
        unsafe { self.raw.destroy(self.device) }
    }
}
