// SPDX-License-Identifier: CEPL-1.0
//! Per-frame uniform data. The byte order here is what the shaders read:
//! block 0 is the scene block, block 1 the animation block.
use bytemuck::{Pod, Zeroable};
use stereo_math::Mat4;

use crate::layout::{LayoutError, UniformLayout, UniformLayoutBuilder};

pub const SCENE_BLOCK: usize = 0;
pub const ANIMATION_BLOCK: usize = 1;

/// World matrix followed by one view-projection matrix per eye.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneUniforms {
    pub world: Mat4,
    pub view_projection: Vec<Mat4>,
}

impl SceneUniforms {
    pub fn new(eye_count: usize) -> Self {
        Self {
            world: Mat4::IDENTITY,
            view_projection: vec![Mat4::IDENTITY; eye_count],
        }
    }

    pub fn byte_len(eye_count: usize) -> usize {
        std::mem::size_of::<Mat4>() * (1 + eye_count)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::byte_len(self.view_projection.len()));
        bytes.extend_from_slice(bytemuck::bytes_of(&self.world));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.view_projection));
        bytes
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AnimationUniforms {
    pub time: f32,
}

/// Layout holding the scene block and the animation block, in that order.
pub fn frame_uniform_layout(
    min_alignment: u64,
    eye_count: usize,
) -> Result<UniformLayout, LayoutError> {
    let mut builder = UniformLayoutBuilder::new(min_alignment)?;
    builder.add(SceneUniforms::byte_len(eye_count));
    builder.add(std::mem::size_of::<AnimationUniforms>());
    Ok(builder.finish())
}

/// Writes both blocks into `dst`, which must span `layout.total_size()`.
pub fn write_frame_uniforms(
    dst: &mut [u8],
    layout: &UniformLayout,
    scene: &SceneUniforms,
    animation: &AnimationUniforms,
) -> Result<(), LayoutError> {
    layout.copy(dst, &scene.to_bytes(), SCENE_BLOCK)?;
    layout.copy(dst, bytemuck::bytes_of(animation), ANIMATION_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_math::Vec3;

    fn read_mat(bytes: &[u8]) -> Mat4 {
        bytemuck::pod_read_unaligned(bytes)
    }

    #[test]
    fn stereo_layout_matches_block_sizes() {
        let layout = frame_uniform_layout(256, 2).unwrap();
        assert_eq!(layout.block_count(), 2);
        assert_eq!(layout.size(SCENE_BLOCK), 192);
        assert_eq!(layout.size(ANIMATION_BLOCK), 4);
        assert_eq!(layout.offset(ANIMATION_BLOCK), 256);
    }

    #[test]
    fn eye_count_drives_scene_block_size() {
        let layout = frame_uniform_layout(0, 4).unwrap();
        assert_eq!(layout.size(SCENE_BLOCK), 64 * 5);
        assert_eq!(layout.offset(ANIMATION_BLOCK), 64 * 5);
    }

    #[test]
    fn scene_block_reads_back_after_animation_write() {
        let layout = frame_uniform_layout(64, 2).unwrap();
        let mut mapped = vec![0u8; layout.total_size() as usize];

        let mut scene = SceneUniforms::new(2);
        scene.world = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        scene.view_projection[1] = Mat4::from_scale(Vec3::splat(2.0));
        write_frame_uniforms(&mut mapped, &layout, &scene, &AnimationUniforms { time: 4.5 })
            .unwrap();

        // A second frame only changes the time.
        layout
            .copy(
                &mut mapped,
                bytemuck::bytes_of(&AnimationUniforms { time: 9.0 }),
                ANIMATION_BLOCK,
            )
            .unwrap();

        let start = layout.offset(SCENE_BLOCK) as usize;
        let scene_bytes = &mapped[start..start + layout.size(SCENE_BLOCK) as usize];
        assert_eq!(scene_bytes, scene.to_bytes().as_slice());
        assert_eq!(read_mat(&scene_bytes[..64]), scene.world);
        assert_eq!(read_mat(&scene_bytes[128..192]), scene.view_projection[1]);

        let t = layout.offset(ANIMATION_BLOCK) as usize;
        assert_eq!(bytemuck::pod_read_unaligned::<f32>(&mapped[t..t + 4]), 9.0);
    }

    #[test]
    fn scene_with_wrong_eye_count_is_rejected() {
        let layout = frame_uniform_layout(0, 2).unwrap();
        let mut mapped = vec![0u8; layout.total_size() as usize];
        let err = write_frame_uniforms(
            &mut mapped,
            &layout,
            &SceneUniforms::new(3),
            &AnimationUniforms::default(),
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::SourceSize { index: 0, .. }));
    }
}
