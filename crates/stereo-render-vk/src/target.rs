// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context as _, Result};
use ash::vk;

use crate::handle::Owned;

/// One swapchain image wrapped for rendering: a colour view over all of
/// its layers and a framebuffer pairing it with the shared depth view.
/// The image itself belongs to the runtime's swapchain.
pub struct RenderTarget<'d> {
    framebuffer: Owned<'d, vk::Framebuffer>,
    view: Owned<'d, vk::ImageView>,
    image: vk::Image,
    extent: vk::Extent2D,
}

fn color_view_info(
    image: vk::Image,
    format: vk::Format,
    layer_count: u32,
) -> vk::ImageViewCreateInfo<'static> {
    let view_type = if layer_count == 1 {
        vk::ImageViewType::TYPE_2D
    } else {
        vk::ImageViewType::TYPE_2D_ARRAY
    };
    vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count,
        },
        ..Default::default()
    }
}

impl<'d> RenderTarget<'d> {
    /// Fails if either the view or the framebuffer cannot be created; a
    /// half-built target never escapes.
    pub fn new(
        device: &'d ash::Device,
        image: vk::Image,
        extent: vk::Extent2D,
        format: vk::Format,
        layer_count: u32,
        render_pass: vk::RenderPass,
        depth_view: vk::ImageView,
    ) -> Result<Self> {
        let ci = color_view_info(image, format, layer_count);
        let view = unsafe { device.create_image_view(&ci, None) }
            .context("create_image_view (render target)")?;
        let view = unsafe { Owned::new(device, view) };

        // Multiview: the framebuffer has one layer, the view mask fans out.
        let attachments = [view.raw(), depth_view];
        let fci = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: attachments.len() as u32,
            p_attachments: attachments.as_ptr(),
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = unsafe { device.create_framebuffer(&fci, None) }
            .context("create_framebuffer (render target)")?;
        let framebuffer = unsafe { Owned::new(device, framebuffer) };

        Ok(Self {
            framebuffer,
            view,
            image,
            extent,
        })
    }

    /// Destroys the framebuffer and the view. The swapchain image is left
    /// alone.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view.raw()
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer.raw()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
