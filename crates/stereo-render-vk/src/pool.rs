// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context as _, Result};
use ash::vk;
use tracing::{debug, warn};

use crate::context::Context;
use crate::handle::Owned;
use crate::slot::FrameSlot;

fn set_layout_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 2] {
    [
        vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
            ..Default::default()
        },
        vk::DescriptorSetLayoutBinding {
            binding: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            ..Default::default()
        },
    ]
}

/// Round-robin set of frame slots, independent of the swapchain image
/// index. Owns the pools the slots allocate from.
pub struct FramePool<'d> {
    device: &'d ash::Device,
    slots: Vec<FrameSlot<'d>>,
    current: usize,

    descriptor_pool: Owned<'d, vk::DescriptorPool>,
    command_pool: Owned<'d, vk::CommandPool>,
    set_layout: Owned<'d, vk::DescriptorSetLayout>,
}

impl<'d> FramePool<'d> {
    pub fn new(ctx: &'d Context, frames_in_flight: usize, eye_count: usize) -> Result<Self> {
        let device = ctx.device();
        let count = frames_in_flight.max(1);

        let bindings = set_layout_bindings();
        let lci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: bindings.len() as u32,
            p_bindings: bindings.as_ptr(),
            ..Default::default()
        };
        let set_layout = unsafe { device.create_descriptor_set_layout(&lci, None) }
            .context("create_descriptor_set_layout")?;
        let set_layout = unsafe { Owned::new(device, set_layout) };

        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.queue_family(),
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        let command_pool = unsafe { device.create_command_pool(&pool_ci, None) }
            .context("create_command_pool")?;
        let command_pool = unsafe { Owned::new(device, command_pool) };

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: (2 * count) as u32,
        }];
        let dpool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count as u32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let descriptor_pool = unsafe { device.create_descriptor_pool(&dpool_ci, None) }
            .context("create_descriptor_pool")?;
        let descriptor_pool = unsafe { Owned::new(device, descriptor_pool) };

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: command_pool.raw(),
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: count as u32,
            ..Default::default()
        };
        let cmds = unsafe { device.allocate_command_buffers(&alloc_info) }
            .context("allocate_command_buffers")?;

        let layouts = vec![set_layout.raw(); count];
        let set_alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: descriptor_pool.raw(),
            descriptor_set_count: count as u32,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = unsafe { device.allocate_descriptor_sets(&set_alloc) }
            .context("allocate_descriptor_sets")?;

        let slots = cmds
            .into_iter()
            .zip(sets)
            .map(|(cmd, set)| {
                FrameSlot::new(
                    device,
                    ctx.memory_properties(),
                    ctx.min_uniform_alignment(),
                    eye_count,
                    cmd,
                    set,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("frame pool: {} slots, {} eyes", slots.len(), eye_count);

        Ok(Self {
            device,
            slots,
            current: 0,
            descriptor_pool,
            command_pool,
            set_layout,
        })
    }

    /// Advances to the next slot and waits until the GPU is done with it.
    pub fn next_slot(&mut self) -> Result<&mut FrameSlot<'d>> {
        self.current = (self.current + 1) % self.slots.len();
        let slot = &mut self.slots[self.current];
        slot.wait(u64::MAX)?;
        unsafe {
            self.device
                .reset_command_buffer(slot.command_buffer(), vk::CommandBufferResetFlags::empty())
        }
        .context("reset_command_buffer")?;
        Ok(slot)
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout.raw()
    }

    pub fn wait_idle(&self) -> Result<()> {
        for slot in &self.slots {
            slot.wait(u64::MAX)?;
        }
        Ok(())
    }
}

impl Drop for FramePool<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            warn!("frame pool: teardown wait failed: {e:#}");
        }
    }
}
