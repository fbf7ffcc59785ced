// SPDX-License-Identifier: CEPL-1.0
//! [`XrRuntime`] over a real OpenXR session rendering through Vulkan.
//!
//! One swapchain serves every eye: eye `i` renders into array layer `i`.
use std::time::Duration;

use anyhow::{anyhow, Result};
use ash::vk::{self, Handle};
use openxr as xr;
use stereo_core::{report, ErrorKind};
use stereo_math::{Fov, Pose, PoseValidity, Quat, Vec3};
use stereo_render::{
    EyeRenderInfo, FrameTiming, LocatedView, RenderSize, RuntimeEvent, SessionState, XrRuntime,
};
use tracing::{info, warn};

use crate::context::{Context, VIEW_TYPE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReferenceSpace {
    /// Seated origin at the head position when the session started.
    #[default]
    Local,
    /// Floor-level origin of the user's play area.
    Stage,
    /// Head-locked.
    View,
}

impl ReferenceSpace {
    fn xr_type(self) -> xr::ReferenceSpaceType {
        match self {
            Self::Local => xr::ReferenceSpaceType::LOCAL,
            Self::Stage => xr::ReferenceSpaceType::STAGE,
            Self::View => xr::ReferenceSpaceType::VIEW,
        }
    }
}

/// sRGB first: the render pass writes linear values and the swapchain
/// encodes them.
const PREFERRED_COLOR_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];

pub fn choose_color_format(available: &[u32]) -> Option<vk::Format> {
    let available: Vec<vk::Format> = available
        .iter()
        .map(|&raw| vk::Format::from_raw(raw as i32))
        .collect();
    PREFERRED_COLOR_FORMATS
        .iter()
        .copied()
        .find(|f| available.contains(f))
}

fn map_session_state(state: xr::SessionState) -> SessionState {
    match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Unknown,
    }
}

fn pose_from_xr(p: xr::Posef) -> Pose {
    Pose {
        orientation: Quat::from_xyzw(
            p.orientation.x,
            p.orientation.y,
            p.orientation.z,
            p.orientation.w,
        ),
        position: Vec3::new(p.position.x, p.position.y, p.position.z),
    }
}

fn pose_to_xr(p: &Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: p.orientation.x,
            y: p.orientation.y,
            z: p.orientation.z,
            w: p.orientation.w,
        },
        position: xr::Vector3f {
            x: p.position.x,
            y: p.position.y,
            z: p.position.z,
        },
    }
}

fn validity_from_xr(flags: xr::ViewStateFlags) -> PoseValidity {
    let mut v = PoseValidity::empty();
    if flags.contains(xr::ViewStateFlags::ORIENTATION_VALID) {
        v |= PoseValidity::ORIENTATION;
    }
    if flags.contains(xr::ViewStateFlags::POSITION_VALID) {
        v |= PoseValidity::POSITION;
    }
    v
}

pub struct OpenXrRuntime {
    swapchain: xr::Swapchain<xr::Vulkan>,
    space: xr::Space,
    frame_stream: xr::FrameStream<xr::Vulkan>,
    frame_waiter: xr::FrameWaiter,
    session: xr::Session<xr::Vulkan>,
    instance: xr::Instance,
    event_buffer: xr::EventDataBuffer,

    images: Vec<vk::Image>,
    color_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    eye_resolutions: Vec<RenderSize>,
}

impl OpenXrRuntime {
    /// The session uses the device in `ctx`; the caller keeps `ctx` alive
    /// for as long as this runtime exists.
    pub(crate) fn new(ctx: &Context, space: ReferenceSpace) -> Result<Self> {
        let instance = ctx.xr_instance().clone();
        let system = ctx.system();

        let view_cfgs = instance
            .enumerate_view_configuration_views(system, VIEW_TYPE)
            .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("view configuration: {e}"))))?;
        let eye_resolutions: Vec<RenderSize> = view_cfgs
            .iter()
            .map(|v| RenderSize {
                width: v.recommended_image_rect_width,
                height: v.recommended_image_rect_height,
            })
            .collect();
        if eye_resolutions.is_empty() {
            return Err(report(ErrorKind::XrRuntime, Some("runtime reported no views")));
        }
        for (i, r) in eye_resolutions.iter().enumerate() {
            info!("xr: eye {} recommended {}x{}", i, r.width, r.height);
        }

        let create_info = xr::vulkan::SessionCreateInfo {
            instance: ctx.vk_instance().handle().as_raw() as *const _,
            physical_device: ctx.physical_device().as_raw() as *const _,
            device: ctx.device().handle().as_raw() as *const _,
            queue_family_index: ctx.queue_family(),
            queue_index: 0,
        };
        let (session, frame_waiter, frame_stream) =
            unsafe { instance.create_session::<xr::Vulkan>(system, &create_info) }
                .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("xrCreateSession: {e}"))))?;

        let space = session
            .create_reference_space(space.xr_type(), xr::Posef::IDENTITY)
            .map_err(|e| anyhow!("xrCreateReferenceSpace({space:?}): {e}"))?;

        let formats = session
            .enumerate_swapchain_formats()
            .map_err(|e| anyhow!("xrEnumerateSwapchainFormats: {e}"))?;
        let color_format = choose_color_format(&formats).ok_or_else(|| {
            report(
                ErrorKind::NoSuitableFormat,
                Some(&format!("runtime offers {formats:?}")),
            )
        })?;
        info!("xr: swapchain format {:?}", color_format);

        // Eyes share one array swapchain sized for the largest eye.
        let swapchain_extent = vk::Extent2D {
            width: eye_resolutions.iter().map(|r| r.width).max().unwrap_or(0),
            height: eye_resolutions.iter().map(|r| r.height).max().unwrap_or(0),
        };
        let swapchain = session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
                format: color_format.as_raw() as u32,
                sample_count: 1,
                width: swapchain_extent.width,
                height: swapchain_extent.height,
                face_count: 1,
                array_size: eye_resolutions.len() as u32,
                mip_count: 1,
            })
            .map_err(|e| report(ErrorKind::XrRuntime, Some(&format!("xrCreateSwapchain: {e}"))))?;
        let images: Vec<vk::Image> = swapchain
            .enumerate_images()
            .map_err(|e| anyhow!("xrEnumerateSwapchainImages: {e}"))?
            .into_iter()
            .map(vk::Image::from_raw)
            .collect();
        info!("xr: swapchain has {} images", images.len());

        Ok(Self {
            swapchain,
            space,
            frame_stream,
            frame_waiter,
            session,
            instance,
            event_buffer: xr::EventDataBuffer::new(),
            images,
            color_format,
            swapchain_extent,
            eye_resolutions,
        })
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    /// Asks the runtime to wind the session down; the frame loop sees the
    /// resulting `Stopping` and `Exiting` states.
    pub fn request_exit(&self) -> Result<()> {
        self.session
            .request_exit()
            .map_err(|e| anyhow!("xrRequestExitSession: {e}"))
    }
}

impl XrRuntime for OpenXrRuntime {
    fn eye_resolutions(&self) -> Vec<RenderSize> {
        self.eye_resolutions.clone()
    }

    fn poll_event(&mut self) -> Result<Option<RuntimeEvent>> {
        let event = self
            .instance
            .poll_event(&mut self.event_buffer)
            .map_err(|e| anyhow!("xrPollEvent: {e}"))?;
        Ok(event.map(|ev| match ev {
            xr::Event::SessionStateChanged(e) => {
                RuntimeEvent::SessionStateChanged(map_session_state(e.state()))
            }
            xr::Event::InstanceLossPending(_) => RuntimeEvent::InstanceLossPending,
            xr::Event::EventsLost(e) => {
                warn!("xr: lost {} events", e.lost_event_count());
                RuntimeEvent::Other
            }
            _ => RuntimeEvent::Other,
        }))
    }

    fn begin_session(&mut self) -> Result<()> {
        self.session
            .begin(VIEW_TYPE)
            .map(|_| ())
            .map_err(|e| anyhow!("xrBeginSession: {e}"))
    }

    fn end_session(&mut self) -> Result<()> {
        self.session
            .end()
            .map(|_| ())
            .map_err(|e| anyhow!("xrEndSession: {e}"))
    }

    fn wait_frame(&mut self) -> Result<FrameTiming> {
        let state = self
            .frame_waiter
            .wait()
            .map_err(|e| anyhow!("xrWaitFrame: {e}"))?;
        Ok(FrameTiming {
            predicted_display_time: state.predicted_display_time.as_nanos(),
            predicted_display_period: state.predicted_display_period.as_nanos(),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> Result<()> {
        self.frame_stream
            .begin()
            .map(|_| ())
            .map_err(|e| anyhow!("xrBeginFrame: {e}"))
    }

    fn locate_views(&mut self, display_time: i64) -> Result<Vec<LocatedView>> {
        let (flags, views) = self
            .session
            .locate_views(VIEW_TYPE, xr::Time::from_nanos(display_time), &self.space)
            .map_err(|e| anyhow!("xrLocateViews: {e}"))?;
        let validity = validity_from_xr(flags);
        Ok(views
            .iter()
            .map(|v| LocatedView {
                pose: pose_from_xr(v.pose),
                fov: Fov {
                    angle_left: v.fov.angle_left,
                    angle_right: v.fov.angle_right,
                    angle_up: v.fov.angle_up,
                    angle_down: v.fov.angle_down,
                },
                validity,
            })
            .collect())
    }

    fn acquire_image(&mut self, timeout: Duration) -> Result<u32> {
        let index = self
            .swapchain
            .acquire_image()
            .map_err(|e| anyhow!("xrAcquireSwapchainImage: {e}"))?;
        let timeout = xr::Duration::from_nanos(timeout.as_nanos().min(i64::MAX as u128) as i64);
        self.swapchain
            .wait_image(timeout)
            .map_err(|e| anyhow!("xrWaitSwapchainImage: {e}"))?;
        Ok(index)
    }

    fn release_image(&mut self) -> Result<()> {
        self.swapchain
            .release_image()
            .map_err(|e| anyhow!("xrReleaseSwapchainImage: {e}"))
    }

    fn end_frame(&mut self, display_time: i64, views: &[EyeRenderInfo]) -> Result<()> {
        let time = xr::Time::from_nanos(display_time);
        if views.is_empty() {
            return self
                .frame_stream
                .end(time, xr::EnvironmentBlendMode::OPAQUE, &[])
                .map_err(|e| anyhow!("xrEndFrame: {e}"));
        }

        let projection_views: Vec<xr::CompositionLayerProjectionView<xr::Vulkan>> = views
            .iter()
            .map(|v| {
                xr::CompositionLayerProjectionView::new()
                    .pose(pose_to_xr(&v.pose))
                    .fov(xr::Fovf {
                        angle_left: v.fov.angle_left,
                        angle_right: v.fov.angle_right,
                        angle_up: v.fov.angle_up,
                        angle_down: v.fov.angle_down,
                    })
                    .sub_image(
                        xr::SwapchainSubImage::new()
                            .swapchain(&self.swapchain)
                            .image_array_index(v.array_index)
                            .image_rect(xr::Rect2Di {
                                offset: xr::Offset2Di { x: 0, y: 0 },
                                extent: xr::Extent2Di {
                                    width: v.extent.width as i32,
                                    height: v.extent.height as i32,
                                },
                            }),
                    )
            })
            .collect();
        let layer = xr::CompositionLayerProjection::new()
            .space(&self.space)
            .views(&projection_views);
        let layers: [&xr::CompositionLayerBase<xr::Vulkan>; 1] = [&layer];
        self.frame_stream
            .end(time, xr::EnvironmentBlendMode::OPAQUE, &layers)
            .map_err(|e| anyhow!("xrEndFrame: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_bgra_srgb() {
        let offered = [
            vk::Format::R8G8B8A8_UNORM.as_raw() as u32,
            vk::Format::R8G8B8A8_SRGB.as_raw() as u32,
            vk::Format::B8G8R8A8_SRGB.as_raw() as u32,
        ];
        assert_eq!(choose_color_format(&offered), Some(vk::Format::B8G8R8A8_SRGB));
    }

    #[test]
    fn falls_back_to_rgba_srgb() {
        let offered = [
            vk::Format::B8G8R8A8_UNORM.as_raw() as u32,
            vk::Format::R8G8B8A8_SRGB.as_raw() as u32,
        ];
        assert_eq!(choose_color_format(&offered), Some(vk::Format::R8G8B8A8_SRGB));
    }

    #[test]
    fn no_srgb_format_offered() {
        let offered = [vk::Format::R16G16B16A16_SFLOAT.as_raw() as u32];
        assert_eq!(choose_color_format(&offered), None);
    }

    #[test]
    fn session_states_map_one_to_one() {
        assert_eq!(map_session_state(xr::SessionState::READY), SessionState::Ready);
        assert_eq!(map_session_state(xr::SessionState::FOCUSED), SessionState::Focused);
        assert_eq!(
            map_session_state(xr::SessionState::LOSS_PENDING),
            SessionState::LossPending
        );
        assert_eq!(map_session_state(xr::SessionState::UNKNOWN), SessionState::Unknown);
    }

    #[test]
    fn view_flags_become_pose_validity() {
        let both = xr::ViewStateFlags::ORIENTATION_VALID | xr::ViewStateFlags::POSITION_VALID;
        assert_eq!(validity_from_xr(both), PoseValidity::all());
        assert_eq!(
            validity_from_xr(xr::ViewStateFlags::ORIENTATION_VALID),
            PoseValidity::ORIENTATION
        );
        assert!(validity_from_xr(xr::ViewStateFlags::EMPTY).is_empty());
    }

    #[test]
    fn pose_survives_xr_conversion() {
        let pose = Pose {
            orientation: Quat::from_rotation_y(0.5),
            position: Vec3::new(0.1, 1.6, -0.2),
        };
        assert_eq!(pose_from_xr(pose_to_xr(&pose)), pose);
    }
}
