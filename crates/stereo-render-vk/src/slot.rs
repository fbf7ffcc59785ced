// SPDX-License-Identifier: CEPL-1.0
//! Per-frame resources. A slot is reused once its busy fence says the GPU
//! is done with the previous submission that used it.
use anyhow::{Context as _, Result};
use ash::vk;
use stereo_render::{
    frame_uniform_layout, write_frame_uniforms, AnimationUniforms, SceneUniforms, UniformLayout,
    ANIMATION_BLOCK, SCENE_BLOCK,
};
use tracing::warn;

use crate::handle::Owned;
use crate::memory::HostBuffer;

pub(crate) fn busy_fence_info() -> vk::FenceCreateInfo<'static> {
    // Signalled, so the first wait on a fresh slot returns at once.
    vk::FenceCreateInfo {
        s_type: vk::StructureType::FENCE_CREATE_INFO,
        flags: vk::FenceCreateFlags::SIGNALED,
        ..Default::default()
    }
}

/// Fence-only submission of `cmds`.
pub(crate) fn submit_info(cmds: &[vk::CommandBuffer]) -> vk::SubmitInfo<'_> {
    vk::SubmitInfo {
        s_type: vk::StructureType::SUBMIT_INFO,
        command_buffer_count: cmds.len() as u32,
        p_command_buffers: cmds.as_ptr(),
        ..Default::default()
    }
}

/// Buffer infos for binding 0 (scene) and binding 1 (animation).
pub(crate) fn descriptor_buffer_infos(
    buffer: vk::Buffer,
    layout: &UniformLayout,
) -> [vk::DescriptorBufferInfo; 2] {
    [SCENE_BLOCK, ANIMATION_BLOCK].map(|block| vk::DescriptorBufferInfo {
        buffer,
        offset: layout.offset(block),
        range: layout.size(block),
    })
}

pub struct FrameSlot<'d> {
    device: &'d ash::Device,
    command_buffer: vk::CommandBuffer,
    drawable: Owned<'d, vk::Semaphore>,
    presentable: Owned<'d, vk::Semaphore>,
    busy: Owned<'d, vk::Fence>,
    uniforms: HostBuffer<'d>,
    layout: UniformLayout,
    descriptor_set: vk::DescriptorSet,

    pub scene: SceneUniforms,
    pub animation: AnimationUniforms,
}

impl<'d> FrameSlot<'d> {
    /// `command_buffer` and `descriptor_set` come from pools owned by the
    /// caller and are freed with them.
    pub(crate) fn new(
        device: &'d ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        min_uniform_alignment: u64,
        eye_count: usize,
        command_buffer: vk::CommandBuffer,
        descriptor_set: vk::DescriptorSet,
    ) -> Result<Self> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let drawable = unsafe { device.create_semaphore(&sem_ci, None) }
            .context("create_semaphore (drawable)")?;
        let drawable = unsafe { Owned::new(device, drawable) };
        let presentable = unsafe { device.create_semaphore(&sem_ci, None) }
            .context("create_semaphore (presentable)")?;
        let presentable = unsafe { Owned::new(device, presentable) };

        let busy = unsafe { device.create_fence(&busy_fence_info(), None) }
            .context("create_fence (busy)")?;
        let busy = unsafe { Owned::new(device, busy) };

        let layout = frame_uniform_layout(min_uniform_alignment, eye_count)
            .context("uniform layout")?;
        let uniforms = HostBuffer::new(
            device,
            memory_properties,
            layout.total_size(),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?;

        let infos = descriptor_buffer_infos(uniforms.buffer(), &layout);
        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| vk::WriteDescriptorSet {
                s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                dst_set: descriptor_set,
                dst_binding: binding as u32,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        Ok(Self {
            device,
            command_buffer,
            drawable,
            presentable,
            busy,
            uniforms,
            layout,
            descriptor_set,
            scene: SceneUniforms::new(eye_count),
            animation: AnimationUniforms::default(),
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn drawable_semaphore(&self) -> vk::Semaphore {
        self.drawable.raw()
    }

    pub fn presentable_semaphore(&self) -> vk::Semaphore {
        self.presentable.raw()
    }

    pub fn busy_fence(&self) -> vk::Fence {
        self.busy.raw()
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn uniform_layout(&self) -> &UniformLayout {
        &self.layout
    }

    /// Copies `scene` and `animation` into the uniform buffer. Returns
    /// false when the buffer could not be written; the slot stays usable
    /// and the caller should skip drawing with it this frame.
    #[must_use]
    pub fn update_uniform_buffer_data(&mut self) -> bool {
        let mut mapped = match self.uniforms.map() {
            Ok(m) => m,
            Err(e) => {
                warn!("uniforms: map failed, frame not updated: {e:#}");
                return false;
            }
        };
        match write_frame_uniforms(&mut mapped, &self.layout, &self.scene, &self.animation) {
            Ok(()) => true,
            Err(e) => {
                warn!("uniforms: write failed, frame not updated: {e}");
                false
            }
        }
    }

    /// Waits for the last submission using this slot.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.busy.raw()], true, timeout_ns) }
            .context("wait_for_fences (busy)")
    }

    /// Ends the command buffer and submits it, signalling the busy fence.
    /// The compositor waits on the swapchain image itself, so the
    /// submission carries no semaphores.
    pub fn submit(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.command_buffer) }
            .context("end_command_buffer")?;

        let cmds = [self.command_buffer];
        let submit = submit_info(&cmds);

        // Reset only once a submission is certain to follow.
        unsafe { self.device.reset_fences(&[self.busy.raw()]) }.context("reset_fences")?;
        unsafe { self.device.queue_submit(queue, &[submit], self.busy.raw()) }
            .context("queue_submit")
    }
}
