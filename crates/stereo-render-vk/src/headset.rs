// SPDX-License-Identifier: CEPL-1.0
use std::ffi::c_void;

use anyhow::{Context as _, Result};
use ash::vk;
use stereo_core::{report, ErrorKind};
use stereo_math::Mat4;
use stereo_render::{FrameLoop, FrameLoopConfig, FrameOutcome, RenderSize, SessionState};
use tracing::{info, warn};

use crate::context::Context;
use crate::handle::Owned;
use crate::memory;
use crate::target::RenderTarget;
use crate::xr::{OpenXrRuntime, ReferenceSpace};

/// Multiview mask with one bit per eye.
pub fn view_mask(eye_count: u32) -> u32 {
    match eye_count {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => (1 << n) - 1,
    }
}

const DEPTH_CANDIDATES: [vk::Format; 4] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate `supports` accepts.
pub fn pick_depth_format(supports: impl Fn(vk::Format) -> bool) -> Result<vk::Format> {
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&f| supports(f))
        .ok_or_else(|| {
            report(
                ErrorKind::NoSuitableFormat,
                Some("no depth attachment format among D32, D24S8, D32S8, D16"),
            )
        })
}

/// View aspect for a depth format; combined formats carry stencil too.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

fn create_render_pass<'d>(
    device: &'d ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
    eye_count: u32,
) -> Result<Owned<'d, vk::RenderPass>> {
    let attachments = [
        vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            // The compositor reads swapchain images in this layout.
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        },
    ];
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_depth_stencil_attachment: &depth_ref,
        ..Default::default()
    };
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let mask = [view_mask(eye_count)];
    let multiview = vk::RenderPassMultiviewCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_MULTIVIEW_CREATE_INFO,
        subpass_count: 1,
        p_view_masks: mask.as_ptr(),
        correlation_mask_count: 1,
        p_correlation_masks: mask.as_ptr(),
        ..Default::default()
    };
    let ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        p_next: &multiview as *const _ as *const c_void,
        attachment_count: attachments.len() as u32,
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    let rp = unsafe { device.create_render_pass(&ci, None) }.context("create_render_pass")?;
    Ok(unsafe { Owned::new(device, rp) })
}

struct Depth<'d> {
    view: Owned<'d, vk::ImageView>,
    _image: Owned<'d, vk::Image>,
    _memory: Owned<'d, vk::DeviceMemory>,
}

fn create_depth<'d>(
    ctx: &'d Context,
    format: vk::Format,
    extent: vk::Extent2D,
    layers: u32,
) -> Result<Depth<'d>> {
    let device = ctx.device();
    let img_ci = vk::ImageCreateInfo {
        s_type: vk::StructureType::IMAGE_CREATE_INFO,
        image_type: vk::ImageType::TYPE_2D,
        format,
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        mip_levels: 1,
        array_layers: layers,
        samples: vk::SampleCountFlags::TYPE_1,
        tiling: vk::ImageTiling::OPTIMAL,
        usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let image = unsafe { device.create_image(&img_ci, None) }.context("create_image (depth)")?;
    let image = unsafe { Owned::new(device, image) };

    let req = unsafe { device.get_image_memory_requirements(image.raw()) };
    let memory = memory::allocate(
        device,
        ctx.memory_properties(),
        req,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    unsafe { device.bind_image_memory(image.raw(), memory.raw(), 0) }
        .context("bind_image_memory (depth)")?;

    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image: image.raw(),
        view_type: if layers == 1 {
            vk::ImageViewType::TYPE_2D
        } else {
            vk::ImageViewType::TYPE_2D_ARRAY
        },
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: depth_aspect(format),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        },
        ..Default::default()
    };
    let view = unsafe { device.create_image_view(&view_ci, None) }
        .context("create_image_view (depth)")?;
    let view = unsafe { Owned::new(device, view) };

    Ok(Depth {
        view,
        _image: image,
        _memory: memory,
    })
}

/// The headset as the renderer sees it: the frame loop over a live OpenXR
/// session plus one render target per swapchain image, all sharing one
/// render pass and one depth buffer.
pub struct Headset<'d> {
    ctx: &'d Context,
    // Targets reference the depth view, the render pass and the swapchain
    // images owned by the session, so they go first.
    render_targets: Vec<RenderTarget<'d>>,
    depth: Depth<'d>,
    render_pass: Owned<'d, vk::RenderPass>,
    frames: FrameLoop<OpenXrRuntime>,
}

impl<'d> Headset<'d> {
    pub fn new(ctx: &'d Context, space: ReferenceSpace, config: FrameLoopConfig) -> Result<Self> {
        let runtime = OpenXrRuntime::new(ctx, space)?;
        let frames = FrameLoop::new(runtime, config);
        let eye_count = frames.eye_count() as u32;
        let runtime = frames.runtime();
        let extent = runtime.swapchain_extent();

        let depth_format = pick_depth_format(|f| {
            let props = unsafe {
                ctx.vk_instance()
                    .get_physical_device_format_properties(ctx.physical_device(), f)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })?;
        let render_pass =
            create_render_pass(ctx.device(), runtime.color_format(), depth_format, eye_count)?;
        let depth = create_depth(ctx, depth_format, extent, eye_count)?;

        let render_targets = runtime
            .images()
            .iter()
            .map(|&image| {
                RenderTarget::new(
                    ctx.device(),
                    image,
                    extent,
                    runtime.color_format(),
                    eye_count,
                    render_pass.raw(),
                    depth.view.raw(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "headset: {} eyes, {} targets {}x{}, depth {:?}",
            eye_count,
            render_targets.len(),
            extent.width,
            extent.height,
            depth_format
        );

        Ok(Self {
            ctx,
            render_targets,
            depth,
            render_pass,
            frames,
        })
    }

    pub fn begin_frame(&mut self) -> Result<FrameOutcome> {
        self.frames.begin_frame()
    }

    pub fn end_frame(&mut self) -> Result<()> {
        self.frames.end_frame()
    }

    pub fn request_exit(&self) -> Result<()> {
        self.frames.runtime().request_exit()
    }

    pub fn is_exit_requested(&self) -> bool {
        self.frames.is_exit_requested()
    }

    pub fn session_state(&self) -> SessionState {
        self.frames.session_state()
    }

    pub fn is_session_running(&self) -> bool {
        self.frames.is_session_running()
    }

    pub fn eye_count(&self) -> usize {
        self.frames.eye_count()
    }

    pub fn eye_resolution(&self, eye: usize) -> RenderSize {
        self.frames.eye_resolution(eye)
    }

    pub fn eye_view_matrix(&self, eye: usize) -> Mat4 {
        self.frames.eye_view_matrix(eye)
    }

    pub fn eye_projection_matrix(&self, eye: usize) -> Mat4 {
        self.frames.eye_projection_matrix(eye)
    }

    pub fn render_target(&self, image_index: u32) -> Option<&RenderTarget<'d>> {
        self.render_targets.get(image_index as usize)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.raw()
    }
}

impl Drop for Headset<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.sync() {
            warn!("headset: teardown wait failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_core::kind_of;

    #[test]
    fn view_mask_has_a_bit_per_eye() {
        assert_eq!(view_mask(1), 0b1);
        assert_eq!(view_mask(2), 0b11);
        assert_eq!(view_mask(4), 0b1111);
        assert_eq!(view_mask(0), 0);
        assert_eq!(view_mask(32), u32::MAX);
    }

    #[test]
    fn depth_format_follows_preference() {
        let only_d24 =
            |f: vk::Format| f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D16_UNORM;
        assert_eq!(pick_depth_format(only_d24).unwrap(), vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(pick_depth_format(|_| true).unwrap(), vk::Format::D32_SFLOAT);
    }

    #[test]
    fn unsupported_depth_is_no_suitable_format() {
        let err = pick_depth_format(|_| false).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::NoSuitableFormat));
    }

    #[test]
    fn stencil_formats_get_stencil_aspect() {
        let both = vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL;
        assert_eq!(depth_aspect(vk::Format::D24_UNORM_S8_UINT), both);
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT_S8_UINT), both);
        assert_eq!(depth_aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(depth_aspect(vk::Format::D16_UNORM), vk::ImageAspectFlags::DEPTH);
    }
}
