// SPDX-License-Identifier: CEPL-1.0
//! Eye math: runtime field-of-view and pose data turned into the view and
//! projection matrices the renderer consumes.
pub use glam::{Mat4, Quat, Vec3, Vec4};

use bitflags::bitflags;

/// Half-angles of an eye frustum in radians. Left and down are negative for
/// a symmetric headset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn symmetric(half_horizontal: f32, half_vertical: f32) -> Self {
        Self {
            angle_left: -half_horizontal,
            angle_right: half_horizontal,
            angle_up: half_vertical,
            angle_down: -half_vertical,
        }
    }
}

bitflags! {
    /// Which parts of a located pose the runtime vouches for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PoseValidity: u8 {
        const ORIENTATION = 0b01;
        const POSITION    = 0b10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Self = Self {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position)
    }

    /// World-to-eye transform for an eye placed at this pose.
    pub fn view_matrix(&self) -> Mat4 {
        self.to_matrix().inverse()
    }

    /// Keeps the components `validity` vouches for and takes the rest from
    /// `fallback`.
    pub fn or_fallback(self, validity: PoseValidity, fallback: Pose) -> Pose {
        let orientation = if validity.contains(PoseValidity::ORIENTATION) {
            self.orientation.normalize()
        } else {
            fallback.orientation
        };
        let position = if validity.contains(PoseValidity::POSITION) {
            self.position
        } else {
            fallback.position
        };
        Pose {
            orientation,
            position,
        }
    }
}

/// Asymmetric-frustum projection in Vulkan clip space: y points down and
/// depth maps `near..far` onto `0..1`.
pub fn projection_from_fov(fov: Fov, near: f32, far: f32) -> Mat4 {
    let tan_left = fov.angle_left.tan();
    let tan_right = fov.angle_right.tan();
    let tan_down = fov.angle_down.tan();
    let tan_up = fov.angle_up.tan();

    let tan_width = tan_right - tan_left;
    let tan_height = tan_down - tan_up;

    Mat4::from_cols(
        Vec4::new(2.0 / tan_width, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 / tan_height, 0.0, 0.0),
        Vec4::new(
            (tan_right + tan_left) / tan_width,
            (tan_up + tan_down) / tan_height,
            -far / (far - near),
            -1.0,
        ),
        Vec4::new(0.0, 0.0, -(far * near) / (far - near), 0.0),
    )
}
