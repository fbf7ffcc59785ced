// SPDX-License-Identifier: CEPL-1.0
//! The scene: one cube drawn to every eye in a single multiview draw. The
//! vertex stage reads the scene block (binding 0), the fragment stage the
//! animation block (binding 1).
use std::ffi::{c_void, CStr};
use std::io::Cursor;

use anyhow::{anyhow, Context as _, Result};
use ash::util::read_spv;
use ash::vk;
use tracing::debug;

use crate::handle::Owned;

static SCENE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.vert.spv"));
static SCENE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/scene.frag.spv"));

const ENTRY: &CStr = c"main";

/// Vertices in the cube's built-in index table.
pub const CUBE_VERTEX_COUNT: u32 = 36;

/// Specialization constant 0 sizes the per-eye matrix array.
const EYE_COUNT_CONSTANT: u32 = 0;

fn create_shader_module<'d>(
    device: &'d ash::Device,
    spv: &[u8],
    name: &str,
) -> Result<Owned<'d, vk::ShaderModule>> {
    let code = read_spv(&mut Cursor::new(spv)).with_context(|| format!("read_spv ({name})"))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    let module = unsafe { device.create_shader_module(&ci, None) }
        .with_context(|| format!("create_shader_module ({name})"))?;
    Ok(unsafe { Owned::new(device, module) })
}

/// Viewport and scissor covering the whole target. Each eye's layer has
/// the same extent.
pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

pub struct ScenePipeline<'d> {
    device: &'d ash::Device,
    pipeline: Owned<'d, vk::Pipeline>,
    layout: Owned<'d, vk::PipelineLayout>,
}

impl<'d> ScenePipeline<'d> {
    /// Builds against subpass 0 of `render_pass`, reading uniforms through
    /// `set_layout` at set 0.
    pub fn new(
        device: &'d ash::Device,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
        eye_count: u32,
    ) -> Result<Self> {
        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        let layout = unsafe { device.create_pipeline_layout(&layout_ci, None) }
            .context("create_pipeline_layout")?;
        let layout = unsafe { Owned::new(device, layout) };

        // Modules are only needed until the pipeline exists.
        let vs = create_shader_module(device, SCENE_VERT, "scene.vert")?;
        let fs = create_shader_module(device, SCENE_FRAG, "scene.frag")?;

        let eyes = (eye_count.max(1) as i32).to_ne_bytes();
        let spec_entry = vk::SpecializationMapEntry {
            constant_id: EYE_COUNT_CONSTANT,
            offset: 0,
            size: eyes.len(),
        };
        let spec = vk::SpecializationInfo {
            map_entry_count: 1,
            p_map_entries: &spec_entry,
            data_size: eyes.len(),
            p_data: eyes.as_ptr() as *const c_void,
            ..Default::default()
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs.raw(),
                p_name: ENTRY.as_ptr(),
                p_specialization_info: &spec,
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs.raw(),
                p_name: ENTRY.as_ptr(),
                ..Default::default()
            },
        ];

        // Positions come from the shader's own table.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            p_viewports: std::ptr::null(),
            scissor_count: 1,
            p_scissors: std::ptr::null(),
            ..Default::default()
        };
        // Depth testing sorts the faces; no culling.
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
            depth_test_enable: vk::TRUE,
            depth_write_enable: vk::TRUE,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            ..Default::default()
        };
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
            blend_enable: vk::FALSE,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout: layout.raw(),
            render_pass,
            subpass: 0,
            ..Default::default()
        };
        let pipelines = match unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        } {
            Ok(p) => p,
            Err((_, err)) => return Err(anyhow!("create_graphics_pipelines: {err:?}")),
        };
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("create_graphics_pipelines returned nothing"))?;
        let pipeline = unsafe { Owned::new(device, pipeline) };
        debug!("scene pipeline: {} eyes", eye_count);

        Ok(Self {
            device,
            pipeline,
            layout,
        })
    }

    /// Records the cube draw. `cmd` must be inside a render pass
    /// compatible with the one this pipeline was built for, and
    /// `descriptor_set` must hold written uniforms.
    pub fn record(
        &self,
        cmd: vk::CommandBuffer,
        descriptor_set: vk::DescriptorSet,
        extent: vk::Extent2D,
    ) {
        let (viewport, scissor) = full_viewport(extent);
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.raw());
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout.raw(),
                0,
                &[descriptor_set],
                &[],
            );
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
            self.device.cmd_draw(cmd, CUBE_VERTEX_COUNT, 1, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shaders_are_valid_spirv_words() {
        for spv in [SCENE_VERT, SCENE_FRAG] {
            let words = read_spv(&mut Cursor::new(spv)).unwrap();
            assert!(!words.is_empty());
            assert_eq!(words[0], 0x0723_0203);
        }
    }

    #[test]
    fn viewport_spans_the_target() {
        let extent = vk::Extent2D {
            width: 1832,
            height: 1920,
        };
        let (viewport, scissor) = full_viewport(extent);
        assert_eq!((viewport.width, viewport.height), (1832.0, 1920.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
        assert_eq!(scissor.extent, extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
    }
}
