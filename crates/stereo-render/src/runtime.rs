// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use anyhow::Result;
use stereo_math::{Fov, Pose, PoseValidity};

use crate::RenderSize;

/// Session lifecycle as reported by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Visible => "visible",
            Self::Focused => "focused",
            Self::Stopping => "stopping",
            Self::LossPending => "loss-pending",
            Self::Exiting => "exiting",
        }
    }

    /// States in which the runtime composites what the application submits.
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Synchronized | Self::Visible | Self::Focused)
    }

    /// States in which a running session has to keep its frame loop going.
    pub fn can_frame_sync(&self) -> bool {
        matches!(self, Self::Ready) || self.is_renderable()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeEvent {
    SessionStateChanged(SessionState),
    InstanceLossPending,
    /// Anything the frame loop does not act on.
    Other,
}

/// Result of frame-syncing with the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTiming {
    /// Runtime clock, nanoseconds.
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
    pub should_render: bool,
}

/// One eye as located for a display time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocatedView {
    pub pose: Pose,
    pub fov: Fov,
    pub validity: PoseValidity,
}

/// What the compositor gets back for one eye at end of frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeRenderInfo {
    pub pose: Pose,
    pub fov: Fov,
    pub extent: RenderSize,
    /// Swapchain array layer the eye was rendered into.
    pub array_index: u32,
}

/// Calls the frame loop makes into the XR runtime. The OpenXR backend
/// implements this over a real session; tests script it.
pub trait XrRuntime {
    /// Recommended per-eye resolution. The length is the eye count and does
    /// not change for the lifetime of the runtime object.
    fn eye_resolutions(&self) -> Vec<RenderSize>;

    fn poll_event(&mut self) -> Result<Option<RuntimeEvent>>;

    fn begin_session(&mut self) -> Result<()>;
    fn end_session(&mut self) -> Result<()>;

    /// Blocks until the runtime wants the next frame.
    fn wait_frame(&mut self) -> Result<FrameTiming>;
    fn begin_frame(&mut self) -> Result<()>;

    fn locate_views(&mut self, display_time: i64) -> Result<Vec<LocatedView>>;

    /// Acquires the next swapchain image and waits up to `timeout` until it
    /// can be rendered into.
    fn acquire_image(&mut self, timeout: Duration) -> Result<u32>;
    fn release_image(&mut self) -> Result<()>;

    /// Submits the frame. An empty `views` slice submits no layers.
    fn end_frame(&mut self, display_time: i64, views: &[EyeRenderInfo]) -> Result<()>;
}
