// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic half of the headset renderer: uniform buffer layout,
//! the per-frame uniform blocks and the session/frame state machine that
//! drives an [`XrRuntime`].
mod layout;
mod runtime;
mod session;
mod uniforms;

pub use layout::{LayoutError, UniformLayout, UniformLayoutBuilder};
pub use runtime::{
    EyeRenderInfo, FrameTiming, LocatedView, RuntimeEvent, SessionState, XrRuntime,
};
pub use session::{Eye, FrameLoop, FrameLoopConfig, FrameOutcome};
pub use uniforms::{
    frame_uniform_layout, write_frame_uniforms, AnimationUniforms, SceneUniforms,
    ANIMATION_BLOCK, SCENE_BLOCK,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}
